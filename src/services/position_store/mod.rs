mod boundary_store;
mod persistence;

pub use boundary_store::{BoundaryPositionStore, Corruption, MigrationOutcome};
pub use persistence::{JsonFileStore, MemoryStore, PersistedState, StateStore};
