//! Platform seams: the accessibility tree and synthetic input.
//!
//! Everything the engine knows about the live menu bar goes through these two
//! traits. On macOS the native backend talks to the Accessibility API and
//! posts Quartz events; everywhere else only the simulated menu bar used by
//! `--dry-run` and by the tests is available.

#[cfg(target_os = "macos")]
mod macos;
mod simulated;
mod r#trait;

pub use self::r#trait::{create_platform, AccessibilityBackend, InputSynthesizer, Platform};
pub use self::simulated::SimulatedMenuBar;
