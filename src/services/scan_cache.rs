use crate::debug_if_enabled;
use crate::error::{Result, TrayError};
use crate::events::MenuBarItem;
use crate::services::clock::Clock;
use crate::services::scanner::ItemScanner;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ScanCacheEntry {
    pub items: Arc<Vec<MenuBarItem>>,
    pub captured_at: Instant,
}

/// Кэш последнего полного сканирования с ограниченным временем жизни
pub struct ScanCache {
    scanner: Arc<dyn ItemScanner>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    entry: RwLock<Option<ScanCacheEntry>>,
    // Увеличивается при каждой инвалидации, чтобы результат сканирования,
    // начатого до неё, не попал в кэш
    generation: AtomicU64,
}

impl ScanCache {
    pub fn new(scanner: Arc<dyn ItemScanner>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        info!("Инициализация ScanCache (ttl: {}мс)", ttl.as_millis());
        Self {
            scanner,
            clock,
            ttl,
            entry: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    fn fresh_entry(&self) -> Option<Arc<Vec<MenuBarItem>>> {
        let entry = self.entry.read();
        entry
            .as_ref()
            .filter(|entry| self.clock.now().duration_since(entry.captured_at) < self.ttl)
            .map(|entry| Arc::clone(&entry.items))
    }

    fn populated_entry(&self) -> Option<Arc<Vec<MenuBarItem>>> {
        self.entry
            .read()
            .as_ref()
            .filter(|entry| !entry.items.is_empty())
            .map(|entry| Arc::clone(&entry.items))
    }

    pub async fn get_or_scan(&self) -> Result<Arc<Vec<MenuBarItem>>> {
        if let Some(items) = self.fresh_entry() {
            debug_if_enabled!("ScanCache: попадание ({} элементов)", items.len());
            return Ok(items);
        }

        let generation = self.generation.load(Ordering::Acquire);
        let scanned = match self.scanner.scan().await {
            Ok(items) => items,
            Err(e @ TrayError::PermissionDenied(_)) => return Err(e),
            Err(e) => {
                // Кратковременный сбой Accessibility не должен выглядеть как "нет иконок"
                return match self.populated_entry() {
                    Some(stale) => {
                        warn!("Сканирование не удалось ({}), отдаём устаревший кэш", e);
                        Ok(stale)
                    }
                    None => Err(e),
                };
            }
        };

        if scanned.is_empty() {
            if let Some(stale) = self.populated_entry() {
                warn!("Сканирование вернуло пустой список, кэш сохранён");
                return Ok(stale);
            }
        }

        let items = Arc::new(scanned);
        if self.generation.load(Ordering::Acquire) == generation {
            *self.entry.write() = Some(ScanCacheEntry {
                items: Arc::clone(&items),
                captured_at: self.clock.now(),
            });
        } else {
            debug_if_enabled!("ScanCache: инвалидация во время сканирования, результат не сохранён");
        }
        Ok(items)
    }

    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        *self.entry.write() = None;
        debug_if_enabled!("ScanCache инвалидирован");
    }

    pub fn peek(&self) -> Option<ScanCacheEntry> {
        self.entry.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ElementRef;
    use crate::services::clock::ManualClock;
    use crate::tray_error;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    struct ScriptedScanner {
        calls: AtomicUsize,
        results: Mutex<VecDeque<Result<Vec<MenuBarItem>>>>,
    }

    impl ScriptedScanner {
        fn new(results: Vec<Result<Vec<MenuBarItem>>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                results: Mutex::new(results.into()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl ItemScanner for ScriptedScanner {
        async fn scan(&self) -> Result<Vec<MenuBarItem>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn items(ids: &[&str]) -> Vec<MenuBarItem> {
        ids.iter()
            .map(|id| MenuBarItem::new(*id, 1, ElementRef(1)))
            .collect()
    }

    fn cache(scanner: Arc<ScriptedScanner>, clock: Arc<ManualClock>) -> ScanCache {
        ScanCache::new(scanner, clock, Duration::from_secs(3))
    }

    #[tokio::test]
    async fn reads_within_ttl_return_same_list_without_rescanning() {
        let scanner = ScriptedScanner::new(vec![Ok(items(&["a"])), Ok(items(&["b"]))]);
        let clock = Arc::new(ManualClock::new());
        let cache = cache(scanner.clone(), clock.clone());

        let first = cache.get_or_scan().await.unwrap();
        clock.advance(Duration::from_secs(2));
        let second = cache.get_or_scan().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(scanner.calls(), 1);
    }

    #[tokio::test]
    async fn expiry_triggers_rescan() {
        let scanner = ScriptedScanner::new(vec![Ok(items(&["a"])), Ok(items(&["b"]))]);
        let clock = Arc::new(ManualClock::new());
        let cache = cache(scanner.clone(), clock.clone());

        cache.get_or_scan().await.unwrap();
        clock.advance(Duration::from_secs(3));
        let refreshed = cache.get_or_scan().await.unwrap();

        assert_eq!(scanner.calls(), 2);
        assert_eq!(refreshed[0].canonical_id, "b");
    }

    #[tokio::test]
    async fn failed_or_empty_scan_keeps_populated_cache() {
        let scanner = ScriptedScanner::new(vec![
            Ok(items(&["a"])),
            Err(tray_error!(internal, "AX hiccup")),
            Ok(Vec::new()),
        ]);
        let clock = Arc::new(ManualClock::new());
        let cache = cache(scanner.clone(), clock.clone());

        let original = cache.get_or_scan().await.unwrap();
        clock.advance(Duration::from_secs(5));
        let after_error = cache.get_or_scan().await.unwrap();
        let after_empty = cache.get_or_scan().await.unwrap();

        assert!(Arc::ptr_eq(&original, &after_error));
        assert!(Arc::ptr_eq(&original, &after_empty));
        assert_eq!(scanner.calls(), 3);
    }

    #[tokio::test]
    async fn permission_denied_is_not_masked_by_cache() {
        let scanner = ScriptedScanner::new(vec![
            Ok(items(&["a"])),
            Err(tray_error!(permission, "revoked")),
        ]);
        let clock = Arc::new(ManualClock::new());
        let cache = cache(scanner, clock.clone());

        cache.get_or_scan().await.unwrap();
        clock.advance(Duration::from_secs(5));
        assert!(matches!(cache.get_or_scan().await, Err(TrayError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn invalidate_forces_rescan() {
        let scanner = ScriptedScanner::new(vec![Ok(items(&["a"])), Ok(items(&["b"]))]);
        let clock = Arc::new(ManualClock::new());
        let cache = cache(scanner.clone(), clock);

        cache.get_or_scan().await.unwrap();
        cache.invalidate();
        assert!(cache.peek().is_none());
        let refreshed = cache.get_or_scan().await.unwrap();

        assert_eq!(scanner.calls(), 2);
        assert_eq!(refreshed[0].canonical_id, "b");
    }
}
