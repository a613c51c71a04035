use super::drag::{run_with_deadline, DragPlan};
use super::gate::{Activity, RelocationGate};
use super::targets::{ResolvedBoundaries, TargetPolicy};
use crate::config::RelocationConfig;
use crate::debug_if_enabled;
use crate::error::{Result, TrayError};
use crate::events::{BoundarySnapshot, ElementRef, ItemFrame, MenuBarItem, Point, Zone};
use crate::services::classifier::{classify, MarginPolicy};
use crate::services::clock::Clock;
use crate::services::platform::{AccessibilityBackend, InputSynthesizer};
use crate::services::scan_cache::ScanCache;
use crate::tray_error;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct RelocationEngine {
    accessibility: Arc<dyn AccessibilityBackend>,
    input: Arc<dyn InputSynthesizer>,
    clock: Arc<dyn Clock>,
    gate: Arc<RelocationGate>,
    cache: Arc<ScanCache>,
    margins: MarginPolicy,
    targets: TargetPolicy,
    config: RelocationConfig,
}

impl RelocationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        accessibility: Arc<dyn AccessibilityBackend>,
        input: Arc<dyn InputSynthesizer>,
        clock: Arc<dyn Clock>,
        gate: Arc<RelocationGate>,
        cache: Arc<ScanCache>,
        margins: MarginPolicy,
        config: &RelocationConfig,
    ) -> Self {
        info!(
            "Инициализация RelocationEngine (шагов: {}, длительность: {}мс, дедлайн: {}мс)",
            config.drag_steps, config.drag_duration_ms, config.drag_deadline_ms
        );
        Self {
            accessibility,
            input,
            clock,
            gate,
            cache,
            margins,
            targets: TargetPolicy::from_config(config),
            config: config.clone(),
        }
    }

    /// Переместить иконку в зону. `Ok(true)` только при подтверждённом результате.
    ///
    /// `PermissionDenied`, `Busy` и `ItemNotFound` возвращаются как ошибки,
    /// чтобы вызывающий мог отличить их от обычной неудачи.
    pub async fn move_item(
        &self,
        item: &MenuBarItem,
        target: Zone,
        hint: &BoundarySnapshot,
    ) -> Result<bool> {
        match self.try_move(item, target, hint).await {
            Ok(()) => Ok(true),
            Err(e @ (TrayError::PermissionDenied(_) | TrayError::Busy(_) | TrayError::ItemNotFound(_))) => Err(e),
            Err(e) => {
                warn!("Перемещение {} в {} не удалось: {}", item.canonical_id, target, e);
                Ok(false)
            }
        }
    }

    /// То же, что `move_item`, но с полной ошибкой для решения о повторе
    pub async fn try_move(&self, item: &MenuBarItem, target: Zone, hint: &BoundarySnapshot) -> Result<()> {
        if !self.accessibility.is_trusted() {
            return Err(tray_error!(permission, "перемещение невозможно без разрешения Accessibility"));
        }
        let _permit = self.gate.try_begin(Activity::Relocation)?;

        info!("Перемещение {} в зону {}", item.canonical_id, target);
        let result = self.relocate(item, target, hint).await;

        // Геометрия могла измениться при любом исходе
        self.cache.invalidate();
        result
    }

    async fn relocate(&self, item: &MenuBarItem, target: Zone, hint: &BoundarySnapshot) -> Result<()> {
        let frame = self.wait_for_onscreen(item.element).await?;
        let boundaries = self.wait_for_boundaries(hint).await?;

        let current = self.zone_of(&frame, &boundaries);
        if current == target {
            info!("{} уже в зоне {}, перемещение не требуется", item.canonical_id, target);
            return Ok(());
        }

        let target_x = self.targets.target_x(frame.width, target, &boundaries)?;
        let (grab_x, grab_y) = frame.center();
        let plan = DragPlan::new(Point::new(grab_x, grab_y), Point::new(target_x, grab_y), &self.config);
        debug_if_enabled!(
            "{}: {} -> {}, граница {:.1}, цель x={:.1}",
            item.canonical_id,
            current,
            target,
            boundaries.hidden_x,
            target_x
        );

        run_with_deadline(
            Arc::clone(&self.input),
            Arc::clone(&self.clock),
            plan,
            self.config.drag_deadline(),
        )
        .await?;

        self.verify(item, target).await
    }

    fn zone_of(&self, frame: &ItemFrame, boundaries: &ResolvedBoundaries) -> Zone {
        classify(
            frame.x,
            frame.width,
            boundaries.hidden_x,
            boundaries.always_hidden_x,
            self.margins,
        )
    }

    /// Опрос с фиксированным интервалом до результата или потолка по времени
    async fn poll_until<T>(
        &self,
        interval: Duration,
        ceiling: Duration,
        mut probe: impl FnMut() -> Result<Option<T>>,
    ) -> Result<Option<T>> {
        let started = self.clock.now();
        loop {
            if let Some(value) = probe()? {
                return Ok(Some(value));
            }
            if self.clock.now().duration_since(started) >= ceiling {
                return Ok(None);
            }
            self.clock.sleep(interval).await;
        }
    }

    /// После показа/скрытия зоны иконка ещё какое-то время сообщает off-screen x
    async fn wait_for_onscreen(&self, element: ElementRef) -> Result<ItemFrame> {
        let accessibility = Arc::clone(&self.accessibility);
        let frame = self
            .poll_until(
                self.config.onscreen_poll_interval(),
                self.config.onscreen_timeout(),
                || Ok(accessibility.item_frame(element)?.filter(|frame| frame.x >= 0.0)),
            )
            .await?;
        frame.ok_or_else(|| {
            tray_error!(
                geometry,
                "элемент {:?} не появился на экране за {}мс",
                element,
                self.config.onscreen_timeout_ms
            )
        })
    }

    async fn wait_for_boundaries(&self, hint: &BoundarySnapshot) -> Result<ResolvedBoundaries> {
        if let Some(boundaries) = ResolvedBoundaries::from_snapshot(hint) {
            return Ok(boundaries);
        }
        let accessibility = Arc::clone(&self.accessibility);
        let boundaries = self
            .poll_until(
                self.config.onscreen_poll_interval(),
                self.config.onscreen_timeout(),
                || Ok(ResolvedBoundaries::from_snapshot(&accessibility.marker_snapshot()?)),
            )
            .await?;
        boundaries.ok_or_else(|| tray_error!(geometry, "маркер скрытой зоны не на экране"))
    }

    /// Ждём двух одинаковых чтений подряд (или потолка шагов) и сверяем зону
    async fn verify(&self, item: &MenuBarItem, target: Zone) -> Result<()> {
        let mut previous: Option<ItemFrame> = None;
        let mut settled: Option<ItemFrame> = None;

        for _ in 0..self.config.verify_max_steps {
            self.clock.sleep(self.config.verify_poll_interval()).await;
            let Some(frame) = self.accessibility.item_frame(item.element)? else {
                continue;
            };
            if previous.map(|p| p.x == frame.x && p.width == frame.width).unwrap_or(false) {
                settled = Some(frame);
                break;
            }
            previous = Some(frame);
        }

        let frame = settled
            .or(previous)
            .ok_or_else(|| tray_error!(geometry, "геометрия {} недоступна после drop", item.canonical_id))?;
        if settled.is_none() {
            debug_if_enabled!("{}: позиция не стабилизировалась, берём последнее чтение", item.canonical_id);
        }

        let snapshot = self.accessibility.marker_snapshot()?;
        let boundaries = ResolvedBoundaries::from_snapshot(&snapshot)
            .ok_or_else(|| tray_error!(verification, "маркер скрытой зоны не на экране после drop"))?;

        let landed = self.zone_of(&frame, &boundaries);
        if landed == target {
            info!("{} перемещён в зону {} (x={:.1})", item.canonical_id, target, frame.x);
            Ok(())
        } else {
            Err(tray_error!(
                verification,
                "{} оказался в зоне {} вместо {} (x={:.1})",
                item.canonical_id,
                landed,
                target,
                frame.x
            ))
        }
    }
}
