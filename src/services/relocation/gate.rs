use crate::error::Result;
use crate::tray_error;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::debug;

const IDLE: u8 = 0;
const RELOCATING: u8 = 1;
const TRANSITIONING: u8 = 2;

/// Что сейчас удерживает строку меню
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Relocation,
    /// Свернуть/развернуть скрытую область целиком
    ZoneTransition,
}

impl Activity {
    fn code(self) -> u8 {
        match self {
            Activity::Relocation => RELOCATING,
            Activity::ZoneTransition => TRANSITIONING,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            RELOCATING => Some(Activity::Relocation),
            TRANSITIONING => Some(Activity::ZoneTransition),
            _ => None,
        }
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activity::Relocation => write!(f, "перемещение"),
            Activity::ZoneTransition => write!(f, "анимация показа/скрытия"),
        }
    }
}

/// Взаимное исключение перемещений и переходов зон. Никогда не ждёт:
/// занятый шлюз сразу отвечает `Busy`.
#[derive(Debug, Default)]
pub struct RelocationGate {
    state: AtomicU8,
}

impl RelocationGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_begin(self: &Arc<Self>, activity: Activity) -> Result<GatePermit> {
        match self
            .state
            .compare_exchange(IDLE, activity.code(), Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                debug!("Шлюз занят: {}", activity);
                Ok(GatePermit {
                    gate: Arc::clone(self),
                    activity,
                })
            }
            Err(current) => {
                let current = Activity::from_code(current)
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "неизвестно".to_string());
                Err(tray_error!(busy, "{} отклонено: уже выполняется {}", activity, current))
            }
        }
    }

    pub fn current(&self) -> Option<Activity> {
        Activity::from_code(self.state.load(Ordering::Acquire))
    }
}

/// Освобождает шлюз при drop
#[derive(Debug)]
pub struct GatePermit {
    gate: Arc<RelocationGate>,
    activity: Activity,
}

impl GatePermit {
    pub fn activity(&self) -> Activity {
        self.activity
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.state.store(IDLE, Ordering::Release);
        debug!("Шлюз освобождён: {}", self.activity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrayError;

    #[test]
    fn second_relocation_is_rejected_immediately() {
        let gate = Arc::new(RelocationGate::new());
        let permit = gate.try_begin(Activity::Relocation).unwrap();
        assert_eq!(permit.activity(), Activity::Relocation);
        assert!(matches!(gate.try_begin(Activity::Relocation), Err(TrayError::Busy(_))));
        assert!(matches!(gate.try_begin(Activity::ZoneTransition), Err(TrayError::Busy(_))));
        assert_eq!(gate.current(), Some(Activity::Relocation));

        drop(permit);
        assert_eq!(gate.current(), None);
        assert!(gate.try_begin(Activity::ZoneTransition).is_ok());
    }

    #[test]
    fn transition_blocks_relocation() {
        let gate = Arc::new(RelocationGate::new());
        let _transition = gate.try_begin(Activity::ZoneTransition).unwrap();
        assert!(matches!(gate.try_begin(Activity::Relocation), Err(TrayError::Busy(_))));
    }
}
