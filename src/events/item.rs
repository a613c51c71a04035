use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Непрозрачная ссылка на элемент дерева Accessibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementRef(pub u64);

/// Процесс-кандидат для сканирования
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: i32,
    pub bundle_id: String,
}

impl ProcessInfo {
    pub fn new(pid: i32, bundle_id: impl Into<String>) -> Self {
        Self {
            pid,
            bundle_id: bundle_id.into(),
        }
    }
}

/// Экранная геометрия элемента
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ItemFrame {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ItemFrame {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Сырые атрибуты дочернего элемента контейнера extras
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawElement {
    pub element: ElementRef,
    pub identifier: Option<String>,
    pub label: Option<String>,
    pub frame: Option<ItemFrame>,
}

/// Различает иконки, когда один владелец публикует несколько элементов
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubIdentifier {
    Platform(String),
    Index(usize),
}

impl fmt::Display for SubIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubIdentifier::Platform(id) => write!(f, "{}", id),
            SubIdentifier::Index(index) => write!(f, "subitem:{}", index),
        }
    }
}

/// Одна иконка статуса в строке меню
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuBarItem {
    pub owner_bundle_id: String,
    pub sub_identifier: Option<SubIdentifier>,
    pub display_label: Option<String>,
    /// None, если атрибуты позиции недоступны
    pub x_position: Option<f64>,
    pub y_position: f64,
    pub width: f64,
    pub height: f64,
    pub canonical_id: String,
    pub pid: i32,
    pub element: ElementRef,
}

pub const DEFAULT_ITEM_HEIGHT: f64 = 24.0;

impl MenuBarItem {
    pub fn new(owner_bundle_id: impl Into<String>, pid: i32, element: ElementRef) -> Self {
        let owner_bundle_id = owner_bundle_id.into();
        Self {
            canonical_id: owner_bundle_id.clone(),
            owner_bundle_id,
            sub_identifier: None,
            display_label: None,
            x_position: None,
            y_position: 0.0,
            width: 0.0,
            height: DEFAULT_ITEM_HEIGHT,
            pid,
            element,
        }
    }

    pub fn with_sub_identifier(mut self, sub_identifier: SubIdentifier) -> Self {
        self.sub_identifier = Some(sub_identifier);
        self.canonical_id = canonical_id_for(&self.owner_bundle_id, self.sub_identifier.as_ref());
        self
    }

    pub fn with_label(mut self, label: Option<String>) -> Self {
        self.display_label = label.filter(|l| !l.trim().is_empty());
        self
    }

    /// Применить геометрию; неизвестная ширина берётся по умолчанию, нулевая зажимается до 1
    pub fn with_frame(mut self, frame: Option<ItemFrame>, default_width: f64) -> Self {
        match frame {
            Some(frame) => {
                self.x_position = Some(frame.x);
                self.y_position = frame.y;
                self.width = frame.width.max(1.0);
                if frame.height > 0.0 {
                    self.height = frame.height;
                }
            }
            None => {
                self.x_position = None;
                self.width = default_width;
            }
        }
        self
    }

    pub fn has_geometry(&self) -> bool {
        self.x_position.is_some()
    }

    pub fn frame(&self) -> Option<ItemFrame> {
        self.x_position
            .map(|x| ItemFrame::new(x, self.y_position, self.width, self.height))
    }

    /// Точка захвата для drag: геометрический центр, а не левый край
    pub fn grab_point(&self) -> Option<(f64, f64)> {
        self.frame().map(|frame| frame.center())
    }

    pub fn matches_pin(&self, pinned: &std::collections::HashSet<String>) -> bool {
        pinned.contains(&self.canonical_id) || pinned.contains(&self.owner_bundle_id)
    }
}

/// Детерминированный канонический идентификатор иконки
pub fn canonical_id_for(owner: &str, sub_identifier: Option<&SubIdentifier>) -> String {
    match sub_identifier {
        // Идентификатор уже содержит bundle id владельца
        Some(SubIdentifier::Platform(id)) if id.starts_with(owner) => id.clone(),
        Some(SubIdentifier::Platform(id)) => format!("{}::{}", owner, id),
        Some(SubIdentifier::Index(index)) => format!("{}::subitem:{}", owner, index),
        None => owner.to_string(),
    }
}

impl fmt::Display for MenuBarItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x = self
            .x_position
            .map(|x| format!("{:.1}", x))
            .unwrap_or_else(|| "?".to_string());
        match &self.display_label {
            Some(label) => write!(f, "{} \"{}\" @ x={} w={:.1}", self.canonical_id, label, x, self.width),
            None => write!(f, "{} @ x={} w={:.1}", self.canonical_id, x, self.width),
        }
    }
}

/// Зона видимости иконки
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Zone {
    Visible,
    Hidden,
    AlwaysHidden,
}

impl Zone {
    pub const ALL: [Zone; 3] = [Zone::Visible, Zone::Hidden, Zone::AlwaysHidden];
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Zone::Visible => "visible",
            Zone::Hidden => "hidden",
            Zone::AlwaysHidden => "always-hidden",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Zone {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "visible" => Ok(Zone::Visible),
            "hidden" => Ok(Zone::Hidden),
            "always-hidden" | "alwayshidden" => Ok(Zone::AlwaysHidden),
            other => Err(format!("Неизвестная зона: {}", other)),
        }
    }
}
