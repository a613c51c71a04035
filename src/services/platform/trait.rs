use crate::config::Config;
use crate::error::Result;
use crate::events::{BoundaryPositions, BoundarySnapshot, ElementRef, ItemFrame, Point, ProcessInfo, RawElement, SyntheticEvent};
use std::sync::Arc;

/// Доступ к дереву Accessibility. Вызовы блокирующие.
pub trait AccessibilityBackend: Send + Sync {
    /// Выдано ли разрешение Accessibility
    fn is_trusted(&self) -> bool;

    fn running_processes(&self) -> Result<Vec<ProcessInfo>>;

    /// Дочерние элементы контейнера extras процесса; `None`, если контейнера нет
    fn extras_children(&self, process: &ProcessInfo) -> Result<Option<Vec<RawElement>>>;

    /// Элементы системной строки меню, принадлежащие процессу
    fn system_menu_bar_children(&self, process: &ProcessInfo) -> Result<Vec<RawElement>>;

    /// Текущая геометрия элемента; `Ok(None)`, если атрибуты позиции недоступны
    fn item_frame(&self, element: ElementRef) -> Result<Option<ItemFrame>>;

    /// Положение наших маркеров и якоря
    fn marker_snapshot(&self) -> Result<BoundarySnapshot>;

    /// Выставить маркеры в сохранённые позиции. Порядковые значения
    /// оставляют раскладку системе, `None` не трогает маркер.
    fn place_markers(&self, positions: &BoundaryPositions) -> Result<()>;

    fn screen_width(&self) -> f64;
}

/// Синтез событий ввода
pub trait InputSynthesizer: Send + Sync {
    fn post(&self, event: SyntheticEvent) -> Result<()>;
    fn cursor_position(&self) -> Result<Point>;
    fn set_cursor_visible(&self, visible: bool) -> Result<()>;
}

#[derive(Clone)]
pub struct Platform {
    pub accessibility: Arc<dyn AccessibilityBackend>,
    pub input: Arc<dyn InputSynthesizer>,
}

impl Platform {
    pub fn from_simulated(simulated: Arc<super::SimulatedMenuBar>) -> Self {
        Self {
            accessibility: simulated.clone(),
            input: simulated,
        }
    }
}

/// Factory function to create the platform bindings based on the dry_run flag
pub fn create_platform(config: &Config, dry_run: bool) -> Result<Platform> {
    if dry_run {
        let simulated = Arc::new(super::SimulatedMenuBar::demo(config));
        return Ok(Platform::from_simulated(simulated));
    }
    native_platform(config)
}

#[cfg(target_os = "macos")]
fn native_platform(config: &Config) -> Result<Platform> {
    let native = Arc::new(super::macos::MacMenuBar::new(config)?);
    Ok(Platform {
        accessibility: native.clone(),
        input: native,
    })
}

#[cfg(not(target_os = "macos"))]
fn native_platform(_config: &Config) -> Result<Platform> {
    Err(crate::tray_error!(
        service_unavailable,
        "строка меню с иконками статуса есть только в macOS ({}), используйте --dry-run",
        std::env::consts::OS
    ))
}
