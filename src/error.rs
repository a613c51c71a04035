use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrayError {
    #[error("Ошибка конфигурации: {0}")]
    Config(#[from] anyhow::Error),

    #[error("Ошибка ввода-вывода: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ошибка сериализации: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Нет разрешения Accessibility: {0}")]
    PermissionDenied(String),

    #[error("Элемент не найден: {0}")]
    ItemNotFound(String),

    #[error("Геометрия недоступна: {0}")]
    GeometryUnavailable(String),

    #[error("Перемещение не подтверждено: {0}")]
    RelocationVerificationFailed(String),

    #[error("Таймаут: {0}")]
    Timeout(String),

    #[error("Операция уже выполняется: {0}")]
    Busy(String),

    #[error("Сервис недоступен: {0}")]
    ServiceUnavailable(String),

    #[error("Внутренняя ошибка: {0}")]
    Internal(String),
}

impl TrayError {
    pub fn item_not_found<T>(msg: impl Into<String>) -> Result<T> {
        Err(TrayError::ItemNotFound(msg.into()))
    }

    /// Ошибки, после которых вызывающий может один раз повторить перемещение
    /// с более широкой стратегией поиска элемента.
    pub fn is_retryable_with_fallback(&self) -> bool {
        matches!(
            self,
            TrayError::ItemNotFound(_)
                | TrayError::RelocationVerificationFailed(_)
                | TrayError::GeometryUnavailable(_)
                | TrayError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TrayError>;

// Удобные макросы для создания ошибок
#[macro_export]
macro_rules! tray_error {
    (permission, $($arg:tt)*) => {
        $crate::error::TrayError::PermissionDenied(format!($($arg)*))
    };
    (item_not_found, $($arg:tt)*) => {
        $crate::error::TrayError::ItemNotFound(format!($($arg)*))
    };
    (geometry, $($arg:tt)*) => {
        $crate::error::TrayError::GeometryUnavailable(format!($($arg)*))
    };
    (verification, $($arg:tt)*) => {
        $crate::error::TrayError::RelocationVerificationFailed(format!($($arg)*))
    };
    (timeout, $($arg:tt)*) => {
        $crate::error::TrayError::Timeout(format!($($arg)*))
    };
    (busy, $($arg:tt)*) => {
        $crate::error::TrayError::Busy(format!($($arg)*))
    };
    (service_unavailable, $($arg:tt)*) => {
        $crate::error::TrayError::ServiceUnavailable(format!($($arg)*))
    };
    (internal, $($arg:tt)*) => {
        $crate::error::TrayError::Internal(format!($($arg)*))
    };
}
