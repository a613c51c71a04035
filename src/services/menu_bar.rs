use crate::config::Config;
use crate::debug_if_enabled;
use crate::error::{Result, TrayError};
use crate::events::{BoundarySnapshot, MenuBarItem, SubIdentifier, Zone};
use crate::services::classifier::{ClassifiedItems, ZoneClassifier};
use crate::services::clock::Clock;
use crate::services::platform::{AccessibilityBackend, Platform};
use crate::services::position_store::{BoundaryPositionStore, MigrationOutcome, StateStore};
use crate::services::relocation::{Activity, GatePermit, RelocationEngine, RelocationGate};
use crate::services::rehide::RehideScheduler;
use crate::services::scan_cache::ScanCache;
use crate::services::scanner::{ItemScanner, Scanner};
use crate::tray_error;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Стратегии сопоставления запрошенной иконки с живым элементом
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocateStrategy {
    ExactIdentity,
    OwnerAndSubIdentifier,
    OwnerNearestPosition,
}

const FALLBACK_STRATEGIES: [LocateStrategy; 2] = [
    LocateStrategy::OwnerAndSubIdentifier,
    LocateStrategy::OwnerNearestPosition,
];

/// Что известно о запрошенной иконке
#[derive(Debug, Clone, PartialEq)]
pub struct ItemReference {
    pub canonical_id: String,
    pub owner_bundle_id: String,
    pub sub_identifier: Option<SubIdentifier>,
    pub last_x: Option<f64>,
}

impl ItemReference {
    pub fn from_canonical_id(canonical_id: &str) -> Self {
        let (owner, sub_identifier) = match canonical_id.split_once("::") {
            Some((owner, rest)) => {
                let sub = match rest.strip_prefix("subitem:").and_then(|i| i.parse().ok()) {
                    Some(index) => SubIdentifier::Index(index),
                    None => SubIdentifier::Platform(rest.to_string()),
                };
                (owner.to_string(), Some(sub))
            }
            None => (canonical_id.to_string(), None),
        };
        Self {
            canonical_id: canonical_id.to_string(),
            owner_bundle_id: owner,
            sub_identifier,
            last_x: None,
        }
    }

    pub fn from_item(item: &MenuBarItem) -> Self {
        Self {
            canonical_id: item.canonical_id.clone(),
            owner_bundle_id: item.owner_bundle_id.clone(),
            sub_identifier: item.sub_identifier.clone(),
            last_x: item.x_position,
        }
    }

    pub fn locate<'a>(&self, items: &'a [MenuBarItem], strategy: LocateStrategy) -> Option<&'a MenuBarItem> {
        match strategy {
            LocateStrategy::ExactIdentity => items.iter().find(|item| item.canonical_id == self.canonical_id),
            LocateStrategy::OwnerAndSubIdentifier => {
                let wanted = self.sub_identifier.as_ref()?;
                items.iter().find(|item| {
                    item.owner_bundle_id == self.owner_bundle_id
                        && item.sub_identifier.as_ref().map(|sub| sub_matches(sub, wanted)).unwrap_or(false)
                })
            }
            LocateStrategy::OwnerNearestPosition => {
                let mut candidates = items
                    .iter()
                    .filter(|item| item.owner_bundle_id == self.owner_bundle_id);
                match self.last_x {
                    Some(last_x) => candidates
                        .filter(|item| item.x_position.is_some())
                        .min_by(|a, b| {
                            let da = (a.x_position.unwrap_or(f64::MAX) - last_x).abs();
                            let db = (b.x_position.unwrap_or(f64::MAX) - last_x).abs();
                            da.total_cmp(&db)
                        }),
                    None => {
                        let first = candidates.next();
                        // Без позиции выбираем только однозначный вариант
                        match candidates.next() {
                            None => first,
                            Some(_) => None,
                        }
                    }
                }
            }
        }
    }
}

fn sub_matches(found: &SubIdentifier, wanted: &SubIdentifier) -> bool {
    match (found, wanted) {
        (SubIdentifier::Platform(a), SubIdentifier::Platform(b)) => a.eq_ignore_ascii_case(b),
        (a, b) => a == b,
    }
}

/// Переход "показать/скрыть" целиком. Пока он жив, перемещения отклоняются.
pub struct ZoneTransition {
    _permit: GatePermit,
    cache: Arc<ScanCache>,
}

impl Drop for ZoneTransition {
    fn drop(&mut self) {
        // Раскладка после анимации другая
        self.cache.invalidate();
    }
}

/// Связывает сканер, кэш, классификатор, перемещение и хранилище границ
pub struct MenuBarEngine {
    config: Arc<Config>,
    accessibility: Arc<dyn AccessibilityBackend>,
    cache: Arc<ScanCache>,
    classifier: RwLock<ZoneClassifier>,
    relocation: RelocationEngine,
    gate: Arc<RelocationGate>,
    store: Arc<BoundaryPositionStore>,
    rehide: RehideScheduler,
    // Смена дисплея берёт запись, классификация и перемещение берут чтение
    layout: tokio::sync::RwLock<()>,
}

impl MenuBarEngine {
    pub fn new(
        config: Arc<Config>,
        platform: Platform,
        clock: Arc<dyn Clock>,
        state_store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        info!("Инициализация MenuBarEngine");

        let scanner: Arc<dyn ItemScanner> =
            Arc::new(Scanner::new(Arc::clone(&platform.accessibility), &config.scan));
        let cache = Arc::new(ScanCache::new(scanner, Arc::clone(&clock), config.scan.cache_ttl()));
        let classifier = ZoneClassifier::new(&config.classify);
        let gate = Arc::new(RelocationGate::new());
        let relocation = RelocationEngine::new(
            Arc::clone(&platform.accessibility),
            Arc::clone(&platform.input),
            Arc::clone(&clock),
            Arc::clone(&gate),
            Arc::clone(&cache),
            classifier.policy(),
            &config.relocation,
        );
        let store = Arc::new(BoundaryPositionStore::new(state_store, config.store.screen_change_ratio)?);

        Ok(Self {
            accessibility: platform.accessibility,
            cache,
            classifier: RwLock::new(classifier),
            relocation,
            gate,
            store,
            rehide: RehideScheduler::new(clock),
            layout: tokio::sync::RwLock::new(()),
            config,
        })
    }

    /// Проверка сохранённых позиций при запуске и расстановка маркеров по ним
    pub fn startup(&self, screen_width: f64) -> Result<MigrationOutcome> {
        let outcome = self.store.migrate_if_needed(screen_width)?;
        info!("Позиции маркеров при запуске: {:?} (экран {:.0})", outcome, screen_width);

        let positions = self.store.load();
        self.accessibility.place_markers(&positions)?;
        self.cache.invalidate();
        debug_if_enabled!("Маркеры выставлены: {:?}", positions);
        Ok(outcome)
    }

    pub fn screen_width(&self) -> f64 {
        self.accessibility.screen_width()
    }

    pub fn store(&self) -> &BoundaryPositionStore {
        &self.store
    }

    pub fn cache(&self) -> &ScanCache {
        &self.cache
    }

    pub fn set_pinned(&self, pinned: HashSet<String>) {
        self.classifier.write().set_pinned(pinned);
    }

    fn boundaries(&self) -> Result<BoundarySnapshot> {
        let snapshot = self.accessibility.marker_snapshot()?;
        for marker in [snapshot.hidden, snapshot.always_hidden].into_iter().flatten() {
            if let Err(e) = self.store.record_position(marker) {
                warn!("Не удалось сохранить позицию {}: {}", marker.kind, e);
            }
        }
        Ok(snapshot)
    }

    /// Списки иконок по зонам
    pub async fn classified_items(&self) -> Result<ClassifiedItems> {
        let _layout = self.layout.read().await;
        let items = self.cache.get_or_scan().await?;
        let boundaries = self.boundaries()?;
        let classified = self.classifier.read().classify_all(&items, &boundaries);
        debug_if_enabled!(
            "Классификация: видимых {}, скрытых {}, всегда скрытых {}",
            classified.visible.len(),
            classified.hidden.len(),
            classified.always_hidden.len()
        );
        Ok(classified)
    }

    /// Переместить иконку по каноническому id. Неудача по идентичности или
    /// проверке повторяется один раз с более широкими стратегиями поиска.
    pub async fn move_item(&self, canonical_id: &str, target: Zone) -> Result<bool> {
        // Занятый шлюз отвечает сразу, без сканирования и без отмены повторного скрытия
        if let Some(activity) = self.gate.current() {
            return Err(tray_error!(busy, "перемещение {} отклонено: уже выполняется {}", canonical_id, activity));
        }
        self.rehide.cancel();
        let _layout = self.layout.read().await;

        let items = self.cache.get_or_scan().await?;
        let mut reference = ItemReference::from_canonical_id(canonical_id);

        let first = match reference.locate(&items, LocateStrategy::ExactIdentity) {
            Some(item) => {
                reference = ItemReference::from_item(item);
                let boundaries = self.boundaries()?;
                self.relocation.try_move(item, target, &boundaries).await
            }
            None => TrayError::item_not_found(format!("{} отсутствует в результатах сканирования", canonical_id)),
        };

        match first {
            Ok(()) => return Ok(true),
            Err(e) if e.is_retryable_with_fallback() => {
                info!("Повтор перемещения {} с запасными стратегиями: {}", canonical_id, e);
            }
            Err(e) => return Self::outcome(e),
        }

        self.cache.invalidate();
        let items = self.cache.get_or_scan().await?;
        let Some((strategy, item)) = FALLBACK_STRATEGIES
            .iter()
            .find_map(|strategy| reference.locate(&items, *strategy).map(|item| (*strategy, item)))
        else {
            return Err(tray_error!(item_not_found, "{} не найден ни одной стратегией", canonical_id));
        };

        debug_if_enabled!("{} сопоставлен с {} ({:?})", canonical_id, item.canonical_id, strategy);
        let boundaries = self.boundaries()?;
        match self.relocation.try_move(item, target, &boundaries).await {
            Ok(()) => Ok(true),
            Err(e) => Self::outcome(e),
        }
    }

    fn outcome(error: TrayError) -> Result<bool> {
        match error {
            e @ (TrayError::PermissionDenied(_) | TrayError::Busy(_) | TrayError::ItemNotFound(_)) => Err(e),
            e => {
                warn!("Перемещение не удалось: {}", e);
                Ok(false)
            }
        }
    }

    /// Вход для внешней машины состояний показа/скрытия
    pub fn begin_zone_transition(&self) -> Result<ZoneTransition> {
        self.rehide.cancel();
        let permit = self.gate.try_begin(Activity::ZoneTransition)?;
        self.cache.invalidate();
        Ok(ZoneTransition {
            _permit: permit,
            cache: Arc::clone(&self.cache),
        })
    }

    pub fn current_activity(&self) -> Option<Activity> {
        self.gate.current()
    }

    /// Запланировать повторное скрытие, если оно включено в конфигурации
    pub fn schedule_rehide<F, Fut>(&self, action: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !self.config.rehide.enabled {
            return false;
        }
        self.rehide
            .schedule(Duration::from_millis(self.config.rehide.delay_ms), action);
        true
    }

    pub fn cancel_rehide(&self) -> bool {
        self.rehide.cancel()
    }

    pub fn rehide_pending(&self) -> bool {
        self.rehide.is_pending()
    }

    /// Смена конфигурации дисплея: кэш и калибровка сбрасываются до того,
    /// как следующая классификация сможет их прочитать
    pub async fn on_display_changed(&self, screen_width: f64) -> Result<MigrationOutcome> {
        let _layout = self.layout.write().await;
        info!("Конфигурация дисплея изменилась (ширина {:.0})", screen_width);
        self.cache.invalidate();
        self.store.recalibrate(screen_width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ProcessInfo;
    use crate::services::clock::ManualClock;
    use crate::events::{BoundaryPositions, MarkerKind};
    use crate::services::platform::SimulatedMenuBar;
    use crate::services::position_store::{MemoryStore, PersistedState};

    fn engine_with(sim: &Arc<SimulatedMenuBar>, config: Config) -> (MenuBarEngine, Arc<MemoryStore>) {
        engine_with_state(sim, config, PersistedState::default())
    }

    fn engine_with_state(
        sim: &Arc<SimulatedMenuBar>,
        config: Config,
        state: PersistedState,
    ) -> (MenuBarEngine, Arc<MemoryStore>) {
        let memory = Arc::new(MemoryStore::new(state));
        let engine = MenuBarEngine::new(
            Arc::new(config),
            Platform::from_simulated(sim.clone()),
            Arc::new(ManualClock::new()),
            memory.clone(),
        )
        .unwrap();
        (engine, memory)
    }

    fn sim() -> Arc<SimulatedMenuBar> {
        let sim = Arc::new(SimulatedMenuBar::new(1512.0, 1));
        sim.add_process(ProcessInfo::new(100, "com.apple.controlcenter"), true);
        sim.add_process(ProcessInfo::new(200, "com.example.weather"), false);
        sim.add_process(ProcessInfo::new(300, "com.example.vpn"), false);
        sim
    }

    #[test]
    fn reference_parses_canonical_ids() {
        let r = ItemReference::from_canonical_id("com.example.weather::subitem:1");
        assert_eq!(r.owner_bundle_id, "com.example.weather");
        assert_eq!(r.sub_identifier, Some(SubIdentifier::Index(1)));

        let r = ItemReference::from_canonical_id("com.apple.controlcenter::com.apple.menuextra.wifi");
        assert_eq!(
            r.sub_identifier,
            Some(SubIdentifier::Platform("com.apple.menuextra.wifi".to_string()))
        );

        let r = ItemReference::from_canonical_id("com.example.vpn");
        assert_eq!(r.owner_bundle_id, "com.example.vpn");
        assert_eq!(r.sub_identifier, None);
    }

    #[tokio::test]
    async fn classifies_and_records_marker_positions() {
        let sim = sim();
        sim.add_item(100, Some("com.apple.menuextra.wifi"), None, 22.0, Zone::Visible);
        sim.add_item(200, None, Some("Weather"), 48.0, Zone::Hidden);
        sim.add_item(300, None, None, 18.0, Zone::AlwaysHidden);
        let (engine, memory) = engine_with(&sim, Config::default());
        engine.startup(1512.0).unwrap();

        let classified = engine.classified_items().await.unwrap();
        assert_eq!(
            classified.zone_of("com.apple.controlcenter::com.apple.menuextra.wifi"),
            Some(Zone::Visible)
        );
        assert_eq!(classified.zone_of("com.example.weather"), Some(Zone::Hidden));
        assert_eq!(classified.zone_of("com.example.vpn"), Some(Zone::AlwaysHidden));

        let hidden_x = sim.marker_snapshot().unwrap().hidden_x().unwrap();
        assert_eq!(engine.store().load().hidden_x, hidden_x);
        assert!(memory.snapshot().positions.contains_key("hidden_boundary_x"));
    }

    #[tokio::test]
    async fn collapsed_layout_falls_back_to_pins() {
        let sim = sim();
        sim.add_item(200, None, Some("Weather"), 48.0, Zone::Hidden);
        sim.add_item(300, None, None, 18.0, Zone::Hidden);
        let mut config = Config::default();
        config.classify.pinned_always_hidden = vec!["com.example.vpn".to_string()];
        let (engine, _) = engine_with(&sim, config);
        sim.set_collapsed(true);

        let classified = engine.classified_items().await.unwrap();
        assert_eq!(classified.zone_of("com.example.vpn"), Some(Zone::AlwaysHidden));
        assert_eq!(classified.zone_of("com.example.weather"), Some(Zone::Hidden));
    }

    #[tokio::test]
    async fn pins_set_at_runtime_apply_while_collapsed() {
        let sim = sim();
        sim.add_item(200, None, Some("Weather"), 48.0, Zone::Hidden);
        sim.add_item(300, None, None, 18.0, Zone::Hidden);
        let (engine, _) = engine_with(&sim, Config::default());
        sim.set_collapsed(true);

        let classified = engine.classified_items().await.unwrap();
        assert_eq!(classified.zone_of("com.example.vpn"), Some(Zone::Hidden));

        engine.set_pinned(HashSet::from(["com.example.vpn".to_string()]));
        let classified = engine.classified_items().await.unwrap();
        assert_eq!(classified.zone_of("com.example.vpn"), Some(Zone::AlwaysHidden));
        assert_eq!(classified.zone_of("com.example.weather"), Some(Zone::Hidden));
    }

    #[tokio::test]
    async fn startup_places_seeds_on_first_launch() {
        let sim = sim();
        let (engine, _) = engine_with(&sim, Config::default());
        assert_eq!(engine.startup(1512.0).unwrap(), MigrationOutcome::Seeded);
        assert_eq!(sim.placed_markers(), Some(BoundaryPositions::seeds()));
    }

    #[tokio::test]
    async fn startup_places_seeds_after_recovery() {
        let sim = sim();
        let mut state = PersistedState::default();
        state
            .positions
            .insert(MarkerKind::Hidden.storage_key().to_string(), 10_000.0);
        state.calibrated_screen_width = Some(1512.0);
        let (engine, _) = engine_with_state(&sim, Config::default(), state);

        assert!(matches!(engine.startup(1512.0).unwrap(), MigrationOutcome::Recovered(_)));
        assert_eq!(sim.placed_markers(), Some(BoundaryPositions::seeds()));
    }

    #[tokio::test]
    async fn startup_restores_persisted_marker_position() {
        let sim = sim();
        sim.add_item(200, None, Some("Weather"), 48.0, Zone::Hidden);
        let vpn = sim.add_item(300, None, None, 18.0, Zone::Hidden);
        let saved_x = sim.frame_of(vpn).unwrap().x;

        let mut state = PersistedState::default();
        state
            .positions
            .insert(MarkerKind::Hidden.storage_key().to_string(), saved_x);
        state.calibrated_screen_width = Some(1512.0);
        let (engine, _) = engine_with_state(&sim, Config::default(), state);

        assert_eq!(engine.startup(1512.0).unwrap(), MigrationOutcome::Healthy);
        assert_eq!(
            sim.placed_markers(),
            Some(BoundaryPositions {
                hidden_x: saved_x,
                always_hidden_x: None,
            })
        );

        let classified = engine.classified_items().await.unwrap();
        assert_eq!(classified.zone_of("com.example.vpn"), Some(Zone::Visible));
        assert_eq!(classified.zone_of("com.example.weather"), Some(Zone::Hidden));
    }

    #[tokio::test]
    async fn move_by_canonical_id() {
        let sim = sim();
        sim.add_item(300, None, None, 18.0, Zone::Hidden);
        sim.add_item(200, None, Some("Weather"), 48.0, Zone::Visible);
        let (engine, _) = engine_with(&sim, Config::default());

        assert!(engine.move_item("com.example.weather", Zone::Hidden).await.unwrap());
        let classified = engine.classified_items().await.unwrap();
        assert_eq!(classified.zone_of("com.example.weather"), Some(Zone::Hidden));
    }

    #[tokio::test]
    async fn stale_identity_falls_back_to_owner_match() {
        let sim = sim();
        sim.add_item(300, None, None, 18.0, Zone::Hidden);
        sim.add_item(200, None, Some("Weather"), 48.0, Zone::Visible);
        let (engine, _) = engine_with(&sim, Config::default());

        // Идентичность из прошлой сессии, когда у владельца было две иконки
        assert!(engine
            .move_item("com.example.weather::subitem:0", Zone::Hidden)
            .await
            .unwrap());
        let classified = engine.classified_items().await.unwrap();
        assert_eq!(classified.zone_of("com.example.weather"), Some(Zone::Hidden));
    }

    #[tokio::test]
    async fn unknown_item_is_not_found() {
        let sim = sim();
        let (engine, _) = engine_with(&sim, Config::default());
        let result = engine.move_item("com.example.ghost", Zone::Hidden).await;
        assert!(matches!(result, Err(TrayError::ItemNotFound(_))));
    }

    #[tokio::test]
    async fn move_during_zone_transition_is_busy() {
        let sim = sim();
        sim.add_item(200, None, Some("Weather"), 48.0, Zone::Visible);
        let (engine, _) = engine_with(&sim, Config::default());

        let transition = engine.begin_zone_transition().unwrap();
        assert_eq!(engine.current_activity(), Some(Activity::ZoneTransition));
        let result = engine.move_item("com.example.weather", Zone::Hidden).await;
        assert!(matches!(result, Err(TrayError::Busy(_))));
        assert!(engine.begin_zone_transition().is_err());
        drop(transition);

        assert_eq!(engine.current_activity(), None);
        assert!(engine.cache().peek().is_none());
    }

    #[tokio::test]
    async fn concurrent_move_is_rejected_before_scanning() {
        let sim = sim();
        sim.add_item(300, None, None, 18.0, Zone::Hidden);
        sim.add_item(200, None, Some("Weather"), 48.0, Zone::Visible);
        let (engine, _) = engine_with(&sim, Config::default());
        let engine = Arc::new(engine);

        let first = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.move_item("com.example.weather", Zone::Hidden).await }
        });

        let mut spins = 0;
        while engine.current_activity() != Some(Activity::Relocation) {
            assert!(spins < 100_000, "первое перемещение так и не заняло шлюз");
            spins += 1;
            tokio::task::yield_now().await;
        }

        let scans_before = sim.scan_requests();
        let second = engine.move_item("com.example.vpn", Zone::Visible).await;
        assert!(matches!(second, Err(TrayError::Busy(_))));
        assert_eq!(sim.scan_requests(), scans_before);

        assert!(first.await.unwrap().unwrap());
        assert_eq!(engine.current_activity(), None);
    }

    #[tokio::test]
    async fn display_change_invalidates_cache_and_recalibrates() {
        let sim = sim();
        sim.add_item(200, None, Some("Weather"), 48.0, Zone::Visible);
        let (engine, _) = engine_with(&sim, Config::default());
        engine.startup(1512.0).unwrap();
        engine.classified_items().await.unwrap();
        assert!(engine.cache().peek().is_some());

        sim.set_screen_width(2560.0);
        engine.on_display_changed(2560.0).await.unwrap();
        assert!(engine.cache().peek().is_none());
        assert_eq!(engine.store().calibrated_screen_width(), Some(2560.0));
    }

    #[tokio::test]
    async fn permission_denied_is_distinct() {
        let sim = sim();
        sim.set_trusted(false);
        let (engine, _) = engine_with(&sim, Config::default());
        assert!(matches!(
            engine.classified_items().await,
            Err(TrayError::PermissionDenied(_))
        ));
        assert!(matches!(
            engine.move_item("com.example.weather", Zone::Hidden).await,
            Err(TrayError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn rehide_respects_config_and_is_cancelled_by_moves() {
        let sim = sim();
        sim.add_item(200, None, Some("Weather"), 48.0, Zone::Visible);
        let (disabled, _) = engine_with(&sim, Config::default());
        assert!(!disabled.schedule_rehide(|| async {}));

        let mut config = Config::default();
        config.rehide.enabled = true;
        config.rehide.delay_ms = 60_000;
        let (engine, _) = engine_with(&sim, config);
        assert!(engine.schedule_rehide(|| async {}));
        assert!(engine.rehide_pending());

        engine.move_item("com.example.weather", Zone::Visible).await.unwrap();
        assert!(!engine.rehide_pending());
    }
}
