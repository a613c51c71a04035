use crate::config::ScanConfig;
use crate::debug_if_enabled;
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Алиасы системных extras по нормализованным токенам подписи
static SYSTEM_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("wifi", "com.apple.menuextra.wifi"),
        ("bluetooth", "com.apple.menuextra.bluetooth"),
        ("battery", "com.apple.menuextra.battery"),
        ("sound", "com.apple.menuextra.sound"),
        ("volume", "com.apple.menuextra.sound"),
        ("clock", "com.apple.menuextra.clock"),
        ("focus", "com.apple.menuextra.focusmode"),
        ("focusmode", "com.apple.menuextra.focusmode"),
        ("display", "com.apple.menuextra.display"),
        ("nowplaying", "com.apple.menuextra.nowplaying"),
        ("airdrop", "com.apple.menuextra.airdrop"),
        ("screenmirroring", "com.apple.menuextra.screenmirroring"),
        ("controlcenter", "com.apple.menuextra.controlcenter"),
        ("siri", "com.apple.menuextra.siri"),
        ("spotlight", "com.apple.menuextra.spotlight"),
        ("textinput", "com.apple.menuextra.textinput"),
        ("useraccounts", "com.apple.menuextra.user"),
    ])
});

/// Убрать пунктуацию, пробелы и регистр: "Wi‑Fi" и "wi-fi" дают "wifi"
pub fn normalize_token(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Превращает сырые атрибуты элемента в канонический идентификатор
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    system_owners: Vec<String>,
    system_prefix: String,
}

impl IdentityResolver {
    pub fn new(config: &ScanConfig) -> Self {
        Self {
            system_owners: config.system_owners.clone(),
            system_prefix: config.system_extras_prefix.to_lowercase(),
        }
    }

    fn is_system_owner(&self, owner: &str) -> bool {
        self.system_owners.iter().any(|o| o == owner)
    }

    fn alias(token: &str) -> Option<String> {
        let normalized = normalize_token(token);
        if normalized.is_empty() {
            return None;
        }
        SYSTEM_ALIASES.get(normalized.as_str()).map(|id| id.to_string())
    }

    /// `None` означает, что элемент нужно отбросить из результатов
    pub fn resolve(
        &self,
        raw_identifier: Option<&str>,
        raw_label: Option<&str>,
        width: f64,
        owner_bundle_id: &str,
    ) -> Option<String> {
        let identifier = raw_identifier.map(str::trim).filter(|id| !id.is_empty());

        if let Some(id) = identifier {
            let lowered = id.to_lowercase();
            if lowered.starts_with(&self.system_prefix) {
                return Some(lowered);
            }
            if let Some(mapped) = Self::alias(id) {
                return Some(mapped);
            }
        }

        if !self.is_system_owner(owner_bundle_id) {
            // Сторонние элементы надёжно сообщают идентификатор, ширину не проверяем
            return identifier.map(str::to_string);
        }

        // Нулевая ширина: элемент фактически не отрисован, подписи не доверяем
        if width <= 0.0 {
            debug_if_enabled!(
                "Системный элемент {} без ширины отброшен (label={:?})",
                owner_bundle_id,
                raw_label
            );
            return None;
        }

        raw_label.and_then(Self::alias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> IdentityResolver {
        IdentityResolver::new(&ScanConfig::default())
    }

    const CC: &str = "com.apple.controlcenter";

    #[test]
    fn test_system_prefix_is_lowercased() {
        assert_eq!(
            resolver().resolve(Some("com.apple.menuExtra.Bluetooth"), None, 0.0, CC),
            Some("com.apple.menuextra.bluetooth".to_string())
        );
    }

    #[test]
    fn test_alias_table_matches_identifier_tokens() {
        assert_eq!(
            resolver().resolve(Some("Wi-Fi"), None, 0.0, CC),
            Some("com.apple.menuextra.wifi".to_string())
        );
        assert_eq!(
            resolver().resolve(Some("Now Playing"), None, 22.0, CC),
            Some("com.apple.menuextra.nowplaying".to_string())
        );
    }

    #[test]
    fn test_system_label_fallback_requires_width() {
        let r = resolver();
        assert_eq!(r.resolve(None, Some("Battery"), 0.0, CC), None);
        assert_eq!(
            r.resolve(None, Some("Battery"), 30.0, CC),
            Some("com.apple.menuextra.battery".to_string())
        );
        assert_eq!(r.resolve(None, Some("Unknown Widget"), 30.0, CC), None);
        assert_eq!(r.resolve(None, None, 22.0, CC), None);
    }

    #[test]
    fn test_third_party_identifier_is_trusted_verbatim() {
        let r = resolver();
        assert_eq!(
            r.resolve(Some("Dropbox.StatusItem"), None, 0.0, "com.example.dropbox"),
            Some("Dropbox.StatusItem".to_string())
        );
        assert_eq!(r.resolve(Some("   "), Some("Dropbox"), 22.0, "com.example.dropbox"), None);
    }

    #[test]
    fn test_normalize_token() {
        assert_eq!(normalize_token("Wi‑Fi!"), "wifi");
        assert_eq!(normalize_token("Focus Mode"), "focusmode");
    }
}
