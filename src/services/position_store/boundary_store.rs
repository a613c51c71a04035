use super::persistence::{PersistedState, StateStore};
use crate::error::Result;
use crate::events::boundary::{is_ordinal, BLOCKING_SENTINEL, SEED_ALWAYS_HIDDEN, SEED_HIDDEN};
use crate::events::{BoundaryMarker, BoundaryPositions, MarkerKind};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

const ABSURD_NEGATIVE: f64 = -1000.0;

const RECOVERY_FLAG: &str = "boundary_recovery_v1";

/// Сигнатура повреждения сохранённых координат
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Corruption {
    NonFinite(MarkerKind),
    AbsurdNegative(MarkerKind, f64),
    LegacySentinel(MarkerKind, f64),
    /// Маркер всегда скрытой зоны правее маркера скрытой
    InvertedOrder { hidden_x: f64, always_hidden_x: f64 },
    BeyondScreen(MarkerKind, f64),
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Corruption::NonFinite(kind) => write!(f, "{}: нечисловое значение", kind),
            Corruption::AbsurdNegative(kind, x) => write!(f, "{}: абсурдно отрицательное {}", kind, x),
            Corruption::LegacySentinel(kind, x) => write!(f, "{}: устаревший sentinel {}", kind, x),
            Corruption::InvertedOrder {
                hidden_x,
                always_hidden_x,
            } => write!(
                f,
                "always_hidden ({}) не левее hidden ({})",
                always_hidden_x, hidden_x
            ),
            Corruption::BeyondScreen(kind, x) => write!(f, "{}: {} за пределами экрана", kind, x),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MigrationOutcome {
    /// Первый запуск: записаны порядковые seed-значения
    Seeded,
    /// Значения в порядке и сохранены как есть
    Healthy,
    /// Однократное восстановление до seed-значений
    Recovered(Corruption),
    /// Ширина экрана изменилась, позиции сброшены, потому что не помещаются
    ScreenChangeReset { previous_width: f64, width: f64 },
}

/// Хранилище координат двух маркеров с самовосстановлением
pub struct BoundaryPositionStore {
    backend: Arc<dyn StateStore>,
    state: Mutex<PersistedState>,
    screen_change_ratio: f64,
}

fn check_value(kind: MarkerKind, x: f64, screen_width: f64) -> Option<Corruption> {
    if !x.is_finite() {
        return Some(Corruption::NonFinite(kind));
    }
    if x < ABSURD_NEGATIVE {
        return Some(Corruption::AbsurdNegative(kind, x));
    }
    if x >= BLOCKING_SENTINEL {
        return Some(Corruption::LegacySentinel(kind, x));
    }
    if !is_ordinal(x) && x > screen_width {
        return Some(Corruption::BeyondScreen(kind, x));
    }
    None
}

fn detect_corruption(state: &PersistedState, screen_width: f64) -> Option<Corruption> {
    let hidden = state.positions.get(MarkerKind::Hidden.storage_key()).copied();
    let always_hidden = state.positions.get(MarkerKind::AlwaysHidden.storage_key()).copied();

    if let Some(corruption) = hidden.and_then(|x| check_value(MarkerKind::Hidden, x, screen_width)) {
        return Some(corruption);
    }
    if let Some(corruption) =
        always_hidden.and_then(|x| check_value(MarkerKind::AlwaysHidden, x, screen_width))
    {
        return Some(corruption);
    }

    match (hidden, always_hidden) {
        (Some(hidden_x), Some(always_hidden_x))
            if !is_ordinal(hidden_x) && !is_ordinal(always_hidden_x) && always_hidden_x >= hidden_x =>
        {
            Some(Corruption::InvertedOrder {
                hidden_x,
                always_hidden_x,
            })
        }
        _ => None,
    }
}

fn write_seeds(state: &mut PersistedState) {
    state
        .positions
        .insert(MarkerKind::Hidden.storage_key().to_string(), SEED_HIDDEN);
    state
        .positions
        .insert(MarkerKind::AlwaysHidden.storage_key().to_string(), SEED_ALWAYS_HIDDEN);
}

impl BoundaryPositionStore {
    pub fn new(backend: Arc<dyn StateStore>, screen_change_ratio: f64) -> Result<Self> {
        let state = backend.load()?;
        info!(
            "Инициализация BoundaryPositionStore ({} позиций, флаги: {:?})",
            state.positions.len(),
            state.flags
        );
        Ok(Self {
            backend,
            state: Mutex::new(state),
            screen_change_ratio,
        })
    }

    /// Текущие координаты; нечисловые значения заменяются seed-значениями
    pub fn load(&self) -> BoundaryPositions {
        let state = self.state.lock();
        let read = |kind: MarkerKind| {
            state
                .positions
                .get(kind.storage_key())
                .copied()
                .filter(|x| x.is_finite())
        };
        BoundaryPositions {
            hidden_x: read(MarkerKind::Hidden).unwrap_or(SEED_HIDDEN),
            always_hidden_x: read(MarkerKind::AlwaysHidden),
        }
    }

    pub fn recovery_completed(&self) -> bool {
        self.state.lock().flags.contains(RECOVERY_FLAG)
    }

    pub fn calibrated_screen_width(&self) -> Option<f64> {
        self.state.lock().calibrated_screen_width
    }

    fn width_changed(&self, previous: Option<f64>, width: f64) -> Option<f64> {
        previous.filter(|prev| *prev > 0.0 && ((width - prev).abs() / prev) > self.screen_change_ratio)
    }

    /// Проверка при запуске. Идемпотентна для здоровых значений и не
    /// запускает восстановление повторно после того, как оно однажды отработало.
    pub fn migrate_if_needed(&self, screen_width: f64) -> Result<MigrationOutcome> {
        let mut state = self.backend.load()?;
        let outcome = self.migrate_state(&mut state, screen_width);

        let mut current = self.state.lock();
        if *current != state {
            self.backend.save(&state)?;
        }
        *current = state;
        Ok(outcome)
    }

    /// Смена конфигурации дисплея во время работы
    pub fn recalibrate(&self, screen_width: f64) -> Result<MigrationOutcome> {
        self.migrate_if_needed(screen_width)
    }

    fn migrate_state(&self, state: &mut PersistedState, screen_width: f64) -> MigrationOutcome {
        let previous_width = state.calibrated_screen_width;
        state.calibrated_screen_width = Some(screen_width);

        if state.positions.is_empty() {
            info!("Первый запуск: записываем порядковые seed-значения маркеров");
            write_seeds(state);
            return MigrationOutcome::Seeded;
        }

        let corruption = detect_corruption(state, screen_width);

        if let Some(previous) = self.width_changed(previous_width, screen_width) {
            info!(
                "Ширина экрана изменилась {} -> {}, калибровка сброшена",
                previous, screen_width
            );
            if let Some(Corruption::BeyondScreen(..)) = corruption {
                warn!("Позиции маркеров не помещаются на новый экран, сбрасываем до seed-значений");
                write_seeds(state);
                return MigrationOutcome::ScreenChangeReset {
                    previous_width: previous,
                    width: screen_width,
                };
            }
        }

        match corruption {
            Some(corruption) if !state.flags.contains(RECOVERY_FLAG) => {
                warn!("Обнаружено повреждение позиций ({}), однократное восстановление", corruption);
                write_seeds(state);
                state.flags.insert(RECOVERY_FLAG.to_string());
                MigrationOutcome::Recovered(corruption)
            }
            Some(corruption) => {
                debug!(
                    "Восстановление уже выполнялось, позиции сохранены как есть ({})",
                    corruption
                );
                MigrationOutcome::Healthy
            }
            None => MigrationOutcome::Healthy,
        }
    }

    /// Запомнить позицию, о которой сообщила система. Sentinel и off-screen
    /// значения игнорируются. Возвращает true, если значение изменилось.
    pub fn record_position(&self, marker: BoundaryMarker) -> Result<bool> {
        let Some(x) = marker.on_screen_x() else {
            return Ok(false);
        };
        let mut state = self.state.lock();
        let key = marker.kind.storage_key();
        if state.positions.get(key).copied() == Some(x) {
            return Ok(false);
        }
        let mut updated = state.clone();
        updated.positions.insert(key.to_string(), x);
        self.backend.save(&updated)?;
        *state = updated;
        debug!("{} = {:.1} сохранено", marker.kind, x);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::position_store::MemoryStore;

    fn state_with(hidden: Option<f64>, always_hidden: Option<f64>, width: Option<f64>) -> PersistedState {
        let mut state = PersistedState::default();
        if let Some(x) = hidden {
            state.positions.insert(MarkerKind::Hidden.storage_key().to_string(), x);
        }
        if let Some(x) = always_hidden {
            state.positions.insert(MarkerKind::AlwaysHidden.storage_key().to_string(), x);
        }
        state.calibrated_screen_width = width;
        state
    }

    fn store(state: PersistedState) -> (Arc<MemoryStore>, BoundaryPositionStore) {
        let memory = Arc::new(MemoryStore::new(state));
        let store = BoundaryPositionStore::new(memory.clone(), 0.10).unwrap();
        (memory, store)
    }

    #[test]
    fn first_launch_writes_seeds() {
        let (memory, store) = store(PersistedState::default());
        assert_eq!(store.migrate_if_needed(1512.0).unwrap(), MigrationOutcome::Seeded);
        assert_eq!(store.load(), BoundaryPositions::seeds());
        assert_eq!(memory.snapshot().calibrated_screen_width, Some(1512.0));
    }

    #[test]
    fn healthy_layout_is_preserved_across_launches() {
        let (memory, store) = store(state_with(Some(900.0), Some(400.0), Some(1512.0)));
        for _ in 0..5 {
            assert_eq!(store.migrate_if_needed(1512.0).unwrap(), MigrationOutcome::Healthy);
        }
        assert_eq!(
            store.load(),
            BoundaryPositions {
                hidden_x: 900.0,
                always_hidden_x: Some(400.0)
            }
        );
        assert_eq!(memory.save_count(), 0);
        assert!(!store.recovery_completed());
    }

    #[test]
    fn recovery_runs_once_and_never_retriggers() {
        let (memory, store) = store(state_with(Some(900.0), Some(BLOCKING_SENTINEL), Some(1512.0)));

        let outcome = store.migrate_if_needed(1512.0).unwrap();
        assert!(matches!(
            outcome,
            MigrationOutcome::Recovered(Corruption::LegacySentinel(MarkerKind::AlwaysHidden, _))
        ));
        assert_eq!(store.load(), BoundaryPositions::seeds());
        assert!(store.recovery_completed());

        // Пользователь расставил маркеры, в том числе в "подозрительном" порядке
        store
            .record_position(BoundaryMarker::new(MarkerKind::Hidden, 700.0))
            .unwrap();
        store
            .record_position(BoundaryMarker::new(MarkerKind::AlwaysHidden, 720.0))
            .unwrap();
        let saves = memory.save_count();

        for _ in 0..3 {
            assert_eq!(store.migrate_if_needed(1512.0).unwrap(), MigrationOutcome::Healthy);
            assert_eq!(
                store.load(),
                BoundaryPositions {
                    hidden_x: 700.0,
                    always_hidden_x: Some(720.0)
                }
            );
        }
        assert_eq!(memory.save_count(), saves);
    }

    #[test]
    fn inverted_order_is_corruption() {
        let (_, store) = store(state_with(Some(500.0), Some(800.0), Some(1512.0)));
        assert!(matches!(
            store.migrate_if_needed(1512.0).unwrap(),
            MigrationOutcome::Recovered(Corruption::InvertedOrder { .. })
        ));
    }

    #[test]
    fn ordinal_values_are_healthy() {
        let (_, store) = store(state_with(Some(SEED_HIDDEN), Some(SEED_ALWAYS_HIDDEN), Some(1512.0)));
        assert_eq!(store.migrate_if_needed(1512.0).unwrap(), MigrationOutcome::Healthy);
    }

    #[test]
    fn significant_width_change_resets_positions_that_no_longer_fit() {
        let mut state = state_with(Some(2400.0), Some(1800.0), Some(2560.0));
        state.flags.insert(RECOVERY_FLAG.to_string());
        let (memory, store) = store(state);

        let outcome = store.migrate_if_needed(1512.0).unwrap();
        assert_eq!(
            outcome,
            MigrationOutcome::ScreenChangeReset {
                previous_width: 2560.0,
                width: 1512.0
            }
        );
        assert_eq!(store.load(), BoundaryPositions::seeds());
        assert_eq!(memory.snapshot().calibrated_screen_width, Some(1512.0));
    }

    #[test]
    fn width_change_keeps_positions_that_still_fit() {
        let (_, store) = store(state_with(Some(900.0), Some(400.0), Some(1512.0)));
        assert_eq!(store.migrate_if_needed(1920.0).unwrap(), MigrationOutcome::Healthy);
        assert_eq!(store.calibrated_screen_width(), Some(1920.0));
        assert_eq!(store.load().hidden_x, 900.0);
    }

    #[test]
    fn record_position_ignores_sentinels() {
        let (memory, store) = store(state_with(Some(900.0), None, Some(1512.0)));
        assert!(!store
            .record_position(BoundaryMarker::new(MarkerKind::Hidden, BLOCKING_SENTINEL))
            .unwrap());
        assert!(!store
            .record_position(BoundaryMarker::new(MarkerKind::Hidden, -9000.0))
            .unwrap());
        assert!(!store
            .record_position(BoundaryMarker::new(MarkerKind::Hidden, 900.0))
            .unwrap());
        assert!(store
            .record_position(BoundaryMarker::new(MarkerKind::Hidden, 880.0))
            .unwrap());
        assert_eq!(memory.save_count(), 1);
        assert_eq!(store.load().hidden_x, 880.0);
    }

    #[test]
    fn non_finite_values_load_as_seeds() {
        let (_, store) = store(state_with(Some(f64::NAN), None, Some(1512.0)));
        assert_eq!(store.load().hidden_x, SEED_HIDDEN);
        assert!(matches!(
            store.migrate_if_needed(1512.0).unwrap(),
            MigrationOutcome::Recovered(Corruption::NonFinite(MarkerKind::Hidden))
        ));
    }
}
