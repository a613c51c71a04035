use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub scan: ScanConfig,
    pub classify: ClassifyConfig,
    pub relocation: RelocationConfig,
    pub store: StoreConfig,
    pub rehide: RehideConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScanConfig {
    pub cache_ttl_ms: u64,
    pub max_concurrency: usize,
    /// Bundle id нашего собственного процесса (маркеры и якорь не попадают в результаты)
    pub own_bundle_id: String,
    /// Системные процессы, для которых разрешён fallback на системную строку меню
    pub system_owners: Vec<String>,
    /// Процессы, публикующие несколько независимых иконок под одним bundle id
    pub multiplexing_owners: Vec<String>,
    pub system_extras_prefix: String,
    pub default_item_width: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClassifyConfig {
    pub min_margin: f64,
    pub margin_ratio: f64,
    pub pinned_always_hidden: Vec<String>,
}

/// Все значения подобраны эмпирически под поведение компоновщика,
/// это настраиваемые значения по умолчанию, а не физические константы.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelocationConfig {
    pub onscreen_poll_interval_ms: u64,
    pub onscreen_timeout_ms: u64,
    pub hidden_offset_floor: f64,
    pub hidden_offset_padding: f64,
    pub anchor_gap: f64,
    pub drag_steps: u32,
    pub drag_duration_ms: u64,
    pub press_hold_ms: u64,
    pub drop_settle_ms: u64,
    pub drag_deadline_ms: u64,
    /// Часть дедлайна, оставляемая на отпускание кнопки и модификатора
    pub release_grace_ms: u64,
    pub verify_poll_interval_ms: u64,
    pub verify_max_steps: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub screen_change_ratio: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RehideConfig {
    pub enabled: bool,
    pub delay_ms: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        let system = vec![
            "com.apple.controlcenter".to_string(),
            "com.apple.systemuiserver".to_string(),
        ];
        Self {
            cache_ttl_ms: 3000,
            max_concurrency: 8,
            own_bundle_id: "dev.trayzone.agent".to_string(),
            system_owners: system.clone(),
            multiplexing_owners: system,
            system_extras_prefix: "com.apple.menuextra.".to_string(),
            default_item_width: 22.0,
        }
    }
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            min_margin: 4.0,
            margin_ratio: 0.3,
            pinned_always_hidden: Vec::new(),
        }
    }
}

impl Default for RelocationConfig {
    fn default() -> Self {
        Self {
            onscreen_poll_interval_ms: 50,
            onscreen_timeout_ms: 3000,
            hidden_offset_floor: 30.0,
            hidden_offset_padding: 20.0,
            anchor_gap: 2.0,
            drag_steps: 16,
            drag_duration_ms: 240,
            press_hold_ms: 60,
            drop_settle_ms: 150,
            drag_deadline_ms: 2000,
            release_grace_ms: 200,
            verify_poll_interval_ms: 60,
            verify_max_steps: 12,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        let path = directories::ProjectDirs::from("dev", "trayzone", "trayzone")
            .map(|dirs| dirs.data_dir().join("boundaries.json"))
            .unwrap_or_else(|| PathBuf::from("boundaries.json"));
        Self {
            path,
            screen_change_ratio: 0.10,
        }
    }
}

impl Default for RehideConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            delay_ms: 15_000,
        }
    }
}

impl RelocationConfig {
    pub fn onscreen_poll_interval(&self) -> Duration {
        Duration::from_millis(self.onscreen_poll_interval_ms)
    }

    pub fn onscreen_timeout(&self) -> Duration {
        Duration::from_millis(self.onscreen_timeout_ms)
    }

    pub fn drag_duration(&self) -> Duration {
        Duration::from_millis(self.drag_duration_ms)
    }

    pub fn press_hold(&self) -> Duration {
        Duration::from_millis(self.press_hold_ms)
    }

    pub fn drop_settle(&self) -> Duration {
        Duration::from_millis(self.drop_settle_ms)
    }

    pub fn drag_deadline(&self) -> Duration {
        Duration::from_millis(self.drag_deadline_ms)
    }

    pub fn release_grace(&self) -> Duration {
        Duration::from_millis(self.release_grace_ms)
    }

    pub fn verify_poll_interval(&self) -> Duration {
        Duration::from_millis(self.verify_poll_interval_ms)
    }

    /// Минимальная длительность жеста без учёта ожидания после отпускания
    fn minimum_gesture_ms(&self) -> u64 {
        self.press_hold_ms + self.drag_duration_ms + self.drop_settle_ms
    }
}

impl ScanConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn is_system_owner(&self, bundle_id: &str) -> bool {
        self.system_owners.iter().any(|owner| owner == bundle_id)
    }

    pub fn is_multiplexing_owner(&self, bundle_id: &str) -> bool {
        self.multiplexing_owners.iter().any(|owner| owner == bundle_id)
    }
}

impl ClassifyConfig {
    /// Множество закреплённых идентификаторов для fallback-классификации
    pub fn pinned_set(&self) -> HashSet<String> {
        self.pinned_always_hidden.iter().cloned().collect()
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref();

        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("TRAYZONE_").split("__"));

        let config: Config = figment
            .extract()
            .with_context(|| format!("Не удалось загрузить конфигурацию из {:?}", config_path))?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        // Валидация настроек логирования
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!("Неверный уровень логирования: {}", self.logging.level),
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            _ => anyhow::bail!("Неверный формат логирования: {}", self.logging.format),
        }

        // Валидация сканирования
        if self.scan.cache_ttl_ms == 0 {
            anyhow::bail!("cache_ttl_ms должно быть больше 0");
        }
        if self.scan.max_concurrency == 0 {
            anyhow::bail!("max_concurrency должно быть больше 0");
        }
        if self.scan.default_item_width <= 0.0 {
            anyhow::bail!("default_item_width должно быть положительным");
        }

        // Валидация классификации
        if self.classify.min_margin <= 0.0 || self.classify.margin_ratio <= 0.0 {
            anyhow::bail!("min_margin и margin_ratio должны быть положительными");
        }

        // Валидация жеста: слишком быстрый drag компоновщик не распознаёт
        let relocation = &self.relocation;
        if relocation.drag_steps < 16 {
            anyhow::bail!("drag_steps должно быть минимум 16");
        }
        if relocation.drag_duration_ms < 200 {
            anyhow::bail!("drag_duration_ms должно быть минимум 200");
        }
        if relocation.release_grace_ms == 0 {
            anyhow::bail!("release_grace_ms должно быть больше 0");
        }
        if relocation.drag_deadline_ms <= relocation.minimum_gesture_ms() + relocation.release_grace_ms {
            anyhow::bail!(
                "drag_deadline_ms ({}) должно превышать длительность жеста ({}) вместе с release_grace_ms ({})",
                relocation.drag_deadline_ms,
                relocation.minimum_gesture_ms(),
                relocation.release_grace_ms
            );
        }
        if relocation.onscreen_poll_interval_ms == 0 || relocation.verify_poll_interval_ms == 0 {
            anyhow::bail!("Интервалы опроса должны быть больше 0");
        }
        if relocation.verify_max_steps < 2 {
            anyhow::bail!("verify_max_steps должно быть минимум 2");
        }
        if relocation.hidden_offset_floor <= 0.0 {
            anyhow::bail!("hidden_offset_floor должно быть положительным");
        }

        // Валидация хранилища
        if !(self.store.screen_change_ratio > 0.0 && self.store.screen_change_ratio < 1.0) {
            anyhow::bail!(
                "screen_change_ratio должно быть в диапазоне (0, 1): {}",
                self.store.screen_change_ratio
            );
        }

        if self.rehide.enabled && self.rehide.delay_ms == 0 {
            anyhow::bail!("rehide.delay_ms должно быть больше 0");
        }

        Ok(())
    }
}
