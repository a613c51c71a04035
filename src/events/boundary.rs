use serde::{Deserialize, Serialize};
use std::fmt;

/// Координата, которую получает маркер в режиме блокировки (скрытая область свёрнута)
pub const BLOCKING_SENTINEL: f64 = 10_000.0;

/// Порядковые значения, а не пиксели: система сама разложит маркеры
pub const SEED_HIDDEN: f64 = 1.0;
pub const SEED_ALWAYS_HIDDEN: f64 = 2.0;
/// Значения не больше этого считаются порядковыми
pub const ORDINAL_CEILING: f64 = 16.0;

pub fn is_ordinal(x: f64) -> bool {
    (0.0..=ORDINAL_CEILING).contains(&x)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarkerKind {
    /// Отделяет видимую зону от скрытой
    Hidden,
    /// Отделяет скрытую зону от всегда скрытой
    AlwaysHidden,
}

impl MarkerKind {
    /// Стабильное логическое имя для хранилища
    pub fn storage_key(&self) -> &'static str {
        match self {
            MarkerKind::Hidden => "hidden_boundary_x",
            MarkerKind::AlwaysHidden => "always_hidden_boundary_x",
        }
    }
}

impl fmt::Display for MarkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkerKind::Hidden => write!(f, "hidden_boundary"),
            MarkerKind::AlwaysHidden => write!(f, "always_hidden_boundary"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundaryMarker {
    pub kind: MarkerKind,
    pub x_position: f64,
}

impl BoundaryMarker {
    pub fn new(kind: MarkerKind, x_position: f64) -> Self {
        Self { kind, x_position }
    }

    /// Реальная экранная координата или None для sentinel/off-screen значений
    pub fn on_screen_x(&self) -> Option<f64> {
        let x = self.x_position;
        (x.is_finite() && x >= 0.0 && x < BLOCKING_SENTINEL).then_some(x)
    }
}

/// Текущее положение наших маркеров и правого якоря
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundarySnapshot {
    pub hidden: Option<BoundaryMarker>,
    pub always_hidden: Option<BoundaryMarker>,
    /// Собственная фиксированная иконка, правее которой иконки не двигаются
    pub anchor_x: Option<f64>,
}

impl BoundarySnapshot {
    pub fn hidden_x(&self) -> Option<f64> {
        self.hidden.and_then(|marker| marker.on_screen_x())
    }

    pub fn always_hidden_x(&self) -> Option<f64> {
        self.always_hidden.and_then(|marker| marker.on_screen_x())
    }
}

/// Сохранённые координаты маркеров, которые выставляются при запуске
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundaryPositions {
    pub hidden_x: f64,
    pub always_hidden_x: Option<f64>,
}

impl BoundaryPositions {
    pub fn seeds() -> Self {
        Self {
            hidden_x: SEED_HIDDEN,
            always_hidden_x: Some(SEED_ALWAYS_HIDDEN),
        }
    }
}
