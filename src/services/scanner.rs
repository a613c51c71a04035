use crate::config::ScanConfig;
use crate::debug_if_enabled;
use crate::error::{Result, TrayError};
use crate::events::{MenuBarItem, ProcessInfo, RawElement, SubIdentifier};
use crate::services::identity::IdentityResolver;
use crate::services::platform::AccessibilityBackend;
use crate::tray_error;
use dashmap::DashMap;
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Источник результатов сканирования (сам `Scanner` или подделка в тестах)
#[async_trait::async_trait]
pub trait ItemScanner: Send + Sync {
    async fn scan(&self) -> Result<Vec<MenuBarItem>>;
}

struct ScanContext {
    backend: Arc<dyn AccessibilityBackend>,
    resolver: IdentityResolver,
    config: ScanConfig,
}

/// Обходит дерево Accessibility всех процессов-кандидатов параллельно
pub struct Scanner {
    context: Arc<ScanContext>,
    semaphore: Arc<Semaphore>,
}

impl Scanner {
    pub fn new(backend: Arc<dyn AccessibilityBackend>, config: &ScanConfig) -> Self {
        info!("Инициализация Scanner (max_concurrency: {})", config.max_concurrency);
        Self {
            context: Arc::new(ScanContext {
                backend,
                resolver: IdentityResolver::new(config),
                config: config.clone(),
            }),
            semaphore: Arc::new(Semaphore::new(config.max_concurrency)),
        }
    }

    /// Сканировать указанные процессы. Ошибка одного процесса не прерывает остальные.
    pub async fn scan_processes(&self, candidates: Vec<ProcessInfo>) -> Result<Vec<MenuBarItem>> {
        if !self.context.backend.is_trusted() {
            return Err(tray_error!(permission, "сканирование невозможно без разрешения Accessibility"));
        }

        let results: Arc<DashMap<String, MenuBarItem>> = Arc::new(DashMap::new());
        let mut handles = Vec::with_capacity(candidates.len());

        for process in candidates {
            if process.bundle_id == self.context.config.own_bundle_id {
                continue;
            }
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| tray_error!(internal, "семафор сканера закрыт: {}", e))?;
            let context = Arc::clone(&self.context);
            let results = Arc::clone(&results);

            handles.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                for item in scan_process(&context, &process) {
                    merge_item(&results, item);
                }
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Задача сканирования процесса завершилась аварийно: {}", e);
            }
        }

        let mut items: Vec<MenuBarItem> = results.iter().map(|entry| entry.value().clone()).collect();
        items.sort_by(compare_position);
        debug_if_enabled!("Сканирование завершено: {} элементов", items.len());
        Ok(items)
    }
}

#[async_trait::async_trait]
impl ItemScanner for Scanner {
    async fn scan(&self) -> Result<Vec<MenuBarItem>> {
        if !self.context.backend.is_trusted() {
            return Err(tray_error!(permission, "сканирование невозможно без разрешения Accessibility"));
        }
        let backend = Arc::clone(&self.context.backend);
        let processes = tokio::task::spawn_blocking(move || backend.running_processes())
            .await
            .map_err(|e| tray_error!(internal, "не удалось получить список процессов: {}", e))??;
        self.scan_processes(processes).await
    }
}

fn scan_process(context: &ScanContext, process: &ProcessInfo) -> SmallVec<[MenuBarItem; 4]> {
    let backend = &context.backend;
    let config = &context.config;

    let children = match backend.extras_children(process) {
        Ok(Some(children)) => children,
        Ok(None) if config.is_system_owner(&process.bundle_id) => {
            match backend.system_menu_bar_children(process) {
                Ok(children) => children,
                Err(e) => {
                    warn!("Системная строка меню недоступна для {}: {}", process.bundle_id, e);
                    return SmallVec::new();
                }
            }
        }
        Ok(None) => return SmallVec::new(),
        Err(e) => {
            absorb_process_error(process, &e);
            return SmallVec::new();
        }
    };

    if config.is_multiplexing_owner(&process.bundle_id) {
        debug_if_enabled!(
            "Владелец {} публикует {} иконок, разворачиваем поэлементно",
            process.bundle_id,
            children.len()
        );
    }

    build_items(context, process, children)
}

fn absorb_process_error(process: &ProcessInfo, error: &TrayError) {
    match error {
        TrayError::PermissionDenied(_) => {
            debug_if_enabled!("Дерево процесса {} закрыто: {}", process.bundle_id, error)
        }
        _ => warn!("Не удалось просканировать {}: {}", process.bundle_id, error),
    }
}

fn build_items(
    context: &ScanContext,
    process: &ProcessInfo,
    mut children: Vec<RawElement>,
) -> SmallVec<[MenuBarItem; 4]> {
    let config = &context.config;
    let owner = process.bundle_id.as_str();
    let strict = config.is_multiplexing_owner(owner) || config.is_system_owner(owner);
    let several = children.len() > 1;

    // Позиционный индекс должен следовать порядку слева направо
    children.sort_by(|a, b| {
        let ax = a.frame.map(|f| f.x).unwrap_or(f64::MAX);
        let bx = b.frame.map(|f| f.x).unwrap_or(f64::MAX);
        ax.partial_cmp(&bx).unwrap_or(Ordering::Equal)
    });

    let mut items = SmallVec::new();
    for (index, raw) in children.into_iter().enumerate() {
        let width = raw
            .frame
            .map(|frame| frame.width)
            .unwrap_or(config.default_item_width);
        let resolved = context.resolver.resolve(
            raw.identifier.as_deref(),
            raw.label.as_deref(),
            width,
            owner,
        );

        let sub_identifier = match resolved {
            Some(id) => Some(SubIdentifier::Platform(id)),
            None if strict => continue,
            None if several => Some(SubIdentifier::Index(index)),
            None => None,
        };

        if raw.frame.is_none() {
            debug_if_enabled!("Геометрия элемента {:?} процесса {} недоступна", raw.element, owner);
        }

        let mut item = MenuBarItem::new(owner, process.pid, raw.element)
            .with_label(raw.label)
            .with_frame(raw.frame, config.default_item_width);
        if let Some(sub_identifier) = sub_identifier {
            item = item.with_sub_identifier(sub_identifier);
        }
        items.push(item);
    }
    items
}

/// Дубликаты по каноническому id: побеждает более левая известная геометрия
fn merge_item(results: &DashMap<String, MenuBarItem>, item: MenuBarItem) {
    results
        .entry(item.canonical_id.clone())
        .and_modify(|existing| {
            let replace = match (existing.x_position, item.x_position) {
                (_, None) => existing.x_position.is_none(),
                (None, Some(_)) => true,
                (Some(old), Some(new)) => new <= old,
            };
            if replace {
                *existing = item.clone();
            }
        })
        .or_insert(item);
}

fn compare_position(a: &MenuBarItem, b: &MenuBarItem) -> Ordering {
    match (a.x_position, b.x_position) {
        (Some(ax), Some(bx)) => ax.partial_cmp(&bx).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.canonical_id.cmp(&b.canonical_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ElementRef, ItemFrame, Zone};
    use crate::services::platform::SimulatedMenuBar;

    const CC: &str = "com.apple.controlcenter";

    fn scanner_for(sim: &Arc<SimulatedMenuBar>) -> Scanner {
        Scanner::new(sim.clone(), &ScanConfig::default())
    }

    #[tokio::test]
    async fn scan_returns_permission_denied_when_untrusted() {
        let sim = Arc::new(SimulatedMenuBar::new(1512.0, 1));
        sim.set_trusted(false);
        let result = scanner_for(&sim).scan().await;
        assert!(matches!(result, Err(TrayError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn failing_process_does_not_abort_scan() {
        let sim = Arc::new(SimulatedMenuBar::new(1512.0, 1));
        sim.add_process(ProcessInfo::new(10, "com.example.broken"), false);
        sim.add_process(ProcessInfo::new(20, "com.example.ok"), false);
        sim.add_item(10, Some("broken"), None, 22.0, Zone::Visible);
        sim.add_item(20, Some("ok"), None, 22.0, Zone::Visible);
        sim.set_process_failing(10, true);

        let items = scanner_for(&sim).scan().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].canonical_id, "com.example.ok::ok");
    }

    #[tokio::test]
    async fn multiplexing_owner_is_expanded_and_ghosts_dropped() {
        let sim = Arc::new(SimulatedMenuBar::new(1512.0, 1));
        sim.add_process(ProcessInfo::new(100, CC), true);
        sim.add_item(100, Some("com.apple.menuextra.wifi"), None, 22.0, Zone::Visible);
        sim.add_item(100, None, Some("Battery"), 30.0, Zone::Visible);
        sim.add_item(100, None, Some("Battery"), 0.0, Zone::Visible);
        sim.add_item(100, None, None, 22.0, Zone::Visible);

        let items = scanner_for(&sim).scan().await.unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.canonical_id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "com.apple.controlcenter::com.apple.menuextra.wifi",
                "com.apple.controlcenter::com.apple.menuextra.battery",
            ]
        );
    }

    #[tokio::test]
    async fn third_party_items_without_identifier_get_positional_index() {
        let sim = Arc::new(SimulatedMenuBar::new(1512.0, 1));
        sim.add_process(ProcessInfo::new(40, "com.example.weather"), false);
        sim.add_process(ProcessInfo::new(50, "com.example.single"), false);
        sim.add_item(40, None, Some("Weather"), 48.0, Zone::Visible);
        sim.add_item(40, None, Some("Forecast"), 22.0, Zone::Visible);
        sim.add_item(50, None, None, 22.0, Zone::Visible);

        let items = scanner_for(&sim).scan().await.unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.canonical_id.as_str()).collect();
        assert!(ids.contains(&"com.example.weather::subitem:0"));
        assert!(ids.contains(&"com.example.weather::subitem:1"));
        assert!(ids.contains(&"com.example.single"));
    }

    #[tokio::test]
    async fn own_markers_are_excluded() {
        let sim = Arc::new(SimulatedMenuBar::new(1512.0, 1));
        let items = scanner_for(&sim).scan().await.unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn missing_geometry_uses_default_width() {
        let sim = Arc::new(SimulatedMenuBar::new(1512.0, 1));
        sim.add_process(ProcessInfo::new(20, "com.example.ok"), false);
        let element = sim.add_item(20, Some("ok"), None, 30.0, Zone::Visible);
        sim.set_geometry_available(element, false);

        let items = scanner_for(&sim).scan().await.unwrap();
        assert_eq!(items.len(), 1);
        assert!(!items[0].has_geometry());
        assert_eq!(items[0].width, 22.0);
    }

    #[test]
    fn duplicate_identity_keeps_leftmost_geometry() {
        let results = DashMap::new();
        let at = |x: f64| {
            MenuBarItem::new("com.example.app", 1, ElementRef(x as u64))
                .with_frame(Some(ItemFrame::new(x, 0.0, 22.0, 24.0)), 22.0)
        };
        merge_item(&results, at(300.0));
        merge_item(&results, at(200.0));
        merge_item(&results, at(250.0));
        merge_item(&results, MenuBarItem::new("com.example.app", 1, ElementRef(9)).with_frame(None, 22.0));

        let kept = results.get("com.example.app").unwrap();
        assert_eq!(kept.x_position, Some(200.0));
    }
}
