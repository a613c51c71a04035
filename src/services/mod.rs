pub mod classifier;
pub mod clock;
pub mod identity;
pub mod menu_bar;
pub mod platform;
pub mod position_store;
pub mod rehide;
pub mod relocation;
pub mod scan_cache;
pub mod scanner;

pub use clock::TokioClock;
pub use menu_bar::MenuBarEngine;
pub use platform::create_platform;
pub use position_store::{JsonFileStore, MemoryStore, StateStore};
