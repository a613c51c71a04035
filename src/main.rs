use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
mod config;
mod error;
mod events;
mod services;
mod utils;

use config::Config;
use events::Zone;
use services::classifier::ClassifiedItems;
use services::{create_platform, JsonFileStore, MemoryStore, MenuBarEngine, StateStore, TokioClock};

#[derive(Parser, Debug)]
#[command(name = "trayzone")]
#[command(about = "Обнаружение, классификация и перемещение иконок строки меню по зонам")]
struct Args {
    /// Путь к файлу конфигурации
    #[arg(short, long, default_value = "trayzone.toml")]
    config: String,

    /// Режим сухого запуска (строка меню эмулируется в памяти)
    #[arg(long)]
    dry_run: bool,

    /// Уровень логирования (перекрывает конфигурацию)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Показать иконки по зонам
    Scan {
        /// Вывод в JSON
        #[arg(long)]
        json: bool,
    },
    /// Переместить иконку в зону (visible, hidden, always-hidden)
    Move { id: String, zone: Zone },
    /// Периодически пересканировать до Ctrl+C
    Watch {
        #[arg(long, default_value_t = 2000)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Загрузка конфигурации
    let config = Arc::new(Config::load(&args.config)?);

    // Инициализация системы логирования
    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    init_tracing(level, &config.logging.format)?;

    info!("Запуск trayzone v{}", env!("CARGO_PKG_VERSION"));
    info!("Конфигурация загружена из: {}", args.config);

    if args.dry_run {
        warn!("Режим сухого запуска - строка меню и хранилище эмулируются");
    }

    let platform = create_platform(&config, args.dry_run)?;

    // Проверка прав доступа
    utils::permissions::check_permissions(platform.accessibility.as_ref())?;

    let state_store: Arc<dyn StateStore> = if args.dry_run {
        Arc::new(MemoryStore::default())
    } else {
        let store = JsonFileStore::new(config.store.path.clone());
        info!("Состояние маркеров: {:?}", store.path());
        Arc::new(store)
    };

    let engine = MenuBarEngine::new(config.clone(), platform, Arc::new(TokioClock), state_store)?;
    engine.startup(engine.screen_width())?;

    info!("Все компоненты инициализированы");

    match args.command.unwrap_or(Command::Scan { json: false }) {
        Command::Scan { json } => {
            let classified = engine.classified_items().await?;
            print_classified(&classified, json)?;
        }
        Command::Move { id, zone } => {
            if engine.move_item(&id, zone).await? {
                println!("{} -> {}", id, zone);
            } else {
                anyhow::bail!("Не удалось переместить {} в зону {}", id, zone);
            }
        }
        Command::Watch { interval_ms } => watch(&engine, Duration::from_millis(interval_ms)).await,
    }

    info!("trayzone завершил работу");
    Ok(())
}

async fn watch(engine: &MenuBarEngine, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    let mut screen_width = engine.screen_width();
    let mut last_counts = None;

    if engine.schedule_rehide(|| async {
        info!("Таймер повторного скрытия сработал");
    }) {
        info!("Повторное скрытие запланировано");
    }

    info!("Наблюдение запущено (интервал {}мс)", interval.as_millis());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let width = engine.screen_width();
                if width != screen_width {
                    screen_width = width;
                    if let Err(e) = engine.on_display_changed(width).await {
                        error!("Ошибка при смене дисплея: {}", e);
                    }
                }

                match engine.classified_items().await {
                    Ok(classified) => {
                        let counts = (
                            classified.visible.len(),
                            classified.hidden.len(),
                            classified.always_hidden.len(),
                        );
                        if last_counts != Some(counts) {
                            info!(
                                "Видимых: {}, скрытых: {}, всегда скрытых: {}",
                                counts.0, counts.1, counts.2
                            );
                            last_counts = Some(counts);
                        }
                    }
                    Err(e) => error!("Ошибка сканирования: {}", e),
                }
            }
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Получен сигнал завершения (Ctrl+C)"),
                    Err(err) => error!("Ошибка при ожидании сигнала завершения: {}", err),
                }
                break;
            }
        }
    }

    engine.cancel_rehide();
}

fn print_classified(classified: &ClassifiedItems, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(classified)?);
        return Ok(());
    }

    for zone in Zone::ALL {
        println!("[{}]", zone);
        for item in classified.zone(zone) {
            println!("  {}", item);
        }
    }
    Ok(())
}

fn init_tracing(level: &str, format: &str) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))?;

    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}
