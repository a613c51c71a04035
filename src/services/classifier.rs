use crate::config::ClassifyConfig;
use crate::events::{BoundarySnapshot, MenuBarItem, Zone};
use serde::Serialize;
use std::collections::HashSet;

/// Параметры допуска вокруг границы
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarginPolicy {
    pub min_margin: f64,
    pub margin_ratio: f64,
}

impl Default for MarginPolicy {
    fn default() -> Self {
        Self {
            min_margin: 4.0,
            margin_ratio: 0.3,
        }
    }
}

impl MarginPolicy {
    pub fn from_config(config: &ClassifyConfig) -> Self {
        Self {
            min_margin: config.min_margin,
            margin_ratio: config.margin_ratio,
        }
    }

    pub fn margin(&self, item_width: f64) -> f64 {
        self.min_margin.max(item_width.max(1.0) * self.margin_ratio)
    }
}

/// Чистая функция классификации по середине иконки и допуску
pub fn classify(
    item_x: f64,
    item_width: f64,
    hidden_boundary_x: f64,
    always_hidden_boundary_x: Option<f64>,
    policy: MarginPolicy,
) -> Zone {
    let width = item_width.max(1.0);
    let mid = item_x + width / 2.0;
    let margin = policy.margin(width);

    match always_hidden_boundary_x {
        Some(always_hidden) if mid < always_hidden - margin => Zone::AlwaysHidden,
        _ if mid < hidden_boundary_x - margin => Zone::Hidden,
        _ => Zone::Visible,
    }
}

/// Классификатор с fallback на закреплённый набор, когда маркеры не на экране
#[derive(Debug, Clone)]
pub struct ZoneClassifier {
    policy: MarginPolicy,
    pinned_always_hidden: HashSet<String>,
}

impl ZoneClassifier {
    pub fn new(config: &ClassifyConfig) -> Self {
        Self {
            policy: MarginPolicy::from_config(config),
            pinned_always_hidden: config.pinned_set(),
        }
    }

    pub fn policy(&self) -> MarginPolicy {
        self.policy
    }

    pub fn set_pinned(&mut self, pinned: HashSet<String>) {
        self.pinned_always_hidden = pinned;
    }

    pub fn is_pinned(&self, item: &MenuBarItem) -> bool {
        item.matches_pin(&self.pinned_always_hidden)
    }

    pub fn classify_item(&self, item: &MenuBarItem, boundaries: &BoundarySnapshot) -> Zone {
        match (item.x_position, boundaries.hidden_x()) {
            (Some(x), Some(hidden_x)) => {
                classify(x, item.width, hidden_x, boundaries.always_hidden_x(), self.policy)
            }
            (x, _) => self.classify_without_boundary(item, x),
        }
    }

    /// Маркер ещё не разложен компоновщиком: закреплённые иконки считаем
    /// всегда скрытыми, остальные по off-screen эвристике
    fn classify_without_boundary(&self, item: &MenuBarItem, x: Option<f64>) -> Zone {
        if self.is_pinned(item) {
            return Zone::AlwaysHidden;
        }
        match x {
            Some(x) if x < 0.0 => Zone::Hidden,
            _ => Zone::Visible,
        }
    }

    pub fn classify_all(&self, items: &[MenuBarItem], boundaries: &BoundarySnapshot) -> ClassifiedItems {
        let mut classified = ClassifiedItems::default();
        for item in items {
            classified.push(self.classify_item(item, boundaries), item.clone());
        }
        classified
    }
}

/// Списки иконок по зонам для внешнего UI
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClassifiedItems {
    pub visible: Vec<MenuBarItem>,
    pub hidden: Vec<MenuBarItem>,
    pub always_hidden: Vec<MenuBarItem>,
}

impl ClassifiedItems {
    pub fn push(&mut self, zone: Zone, item: MenuBarItem) {
        self.zone_mut(zone).push(item);
    }

    pub fn zone(&self, zone: Zone) -> &[MenuBarItem] {
        match zone {
            Zone::Visible => &self.visible,
            Zone::Hidden => &self.hidden,
            Zone::AlwaysHidden => &self.always_hidden,
        }
    }

    fn zone_mut(&mut self, zone: Zone) -> &mut Vec<MenuBarItem> {
        match zone {
            Zone::Visible => &mut self.visible,
            Zone::Hidden => &mut self.hidden,
            Zone::AlwaysHidden => &mut self.always_hidden,
        }
    }

    pub fn zone_of(&self, canonical_id: &str) -> Option<Zone> {
        Zone::ALL
            .into_iter()
            .find(|zone| self.zone(*zone).iter().any(|item| item.canonical_id == canonical_id))
    }

    pub fn len(&self) -> usize {
        self.visible.len() + self.hidden.len() + self.always_hidden.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
