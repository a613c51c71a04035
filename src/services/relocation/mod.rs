//! Relocation: physically moving an icon across a zone boundary.
//!
//! The engine computes a drop point, performs a timed Command-drag through the
//! `InputSynthesizer` on a dedicated task with a hard deadline, and then
//! re-reads geometry until it is stable to verify the icon landed where asked.

mod drag;
mod engine;
mod gate;
mod targets;

pub use engine::RelocationEngine;
pub use gate::{Activity, GatePermit, RelocationGate};
