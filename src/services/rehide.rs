use crate::debug_if_enabled;
use crate::services::clock::Clock;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Таймер автоматического повторного скрытия. Новое действие пользователя
/// (показ, скрытие, перемещение) отменяет отложенный таймер.
pub struct RehideScheduler {
    clock: Arc<dyn Clock>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl RehideScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            pending: Mutex::new(None),
        }
    }

    /// Запланировать действие через `delay`, отменив предыдущее
    pub fn schedule<F, Fut>(&self, delay: Duration, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let clock = Arc::clone(&self.clock);
        let handle = tokio::spawn(async move {
            clock.sleep(delay).await;
            action().await;
        });

        if let Some(previous) = self.pending.lock().replace(handle) {
            previous.abort();
            debug_if_enabled!("Предыдущий таймер повторного скрытия заменён");
        }
        debug_if_enabled!("Повторное скрытие через {}мс", delay.as_millis());
    }

    /// Отменить отложенный таймер. Возвращает true, если он был активен.
    pub fn cancel(&self) -> bool {
        match self.pending.lock().take() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                debug_if_enabled!("Таймер повторного скрытия отменён");
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for RehideScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::TokioClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let scheduler = RehideScheduler::new(Arc::new(TokioClock));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        scheduler.schedule(Duration::from_secs(5), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_and_reschedule_supersede_pending_timer() {
        let scheduler = RehideScheduler::new(Arc::new(TokioClock));
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        scheduler.schedule(Duration::from_secs(5), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(scheduler.cancel());
        assert!(!scheduler.cancel());

        let first = fired.clone();
        scheduler.schedule(Duration::from_secs(5), move || async move {
            first.fetch_add(10, Ordering::SeqCst);
        });
        let second = fired.clone();
        scheduler.schedule(Duration::from_secs(5), move || async move {
            second.fetch_add(100, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 100);
    }
}
