use crate::error::{Result, TrayError};
use crate::services::platform::AccessibilityBackend;
use tracing::{info, warn};

/// Проверить разрешение Accessibility. Без него сканирование возвращает
/// `PermissionDenied`, а перемещение невозможно.
pub fn check_permissions(accessibility: &dyn AccessibilityBackend) -> Result<()> {
    info!("Проверка разрешения Accessibility...");

    if accessibility.is_trusted() {
        info!("Разрешение Accessibility подтверждено");
        return Ok(());
    }

    warn!("⚠️  Приложению не выдано разрешение Accessibility!");
    for line in setup_instructions() {
        warn!("   {}", line);
    }
    Err(TrayError::PermissionDenied(
        "процесс не входит в список доверенных Accessibility".to_string(),
    ))
}

/// Шаги выдачи разрешения
pub fn setup_instructions() -> Vec<String> {
    vec![
        "Откройте Системные настройки -> Конфиденциальность и безопасность -> Универсальный доступ".to_string(),
        "Добавьте trayzone в список и включите переключатель".to_string(),
        "Перезапустите trayzone после выдачи разрешения".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::platform::SimulatedMenuBar;

    #[test]
    fn test_setup_instructions() {
        let lines = setup_instructions();
        assert!(!lines.is_empty());
        assert!(lines.iter().any(|line| line.contains("Универсальный доступ")));
    }

    #[test]
    fn test_untrusted_process_is_denied() {
        let sim = SimulatedMenuBar::new(1512.0, 1);
        assert!(check_permissions(&sim).is_ok());

        sim.set_trusted(false);
        assert!(matches!(check_permissions(&sim), Err(TrayError::PermissionDenied(_))));
    }
}
