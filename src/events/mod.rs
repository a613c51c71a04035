pub mod boundary;
pub mod input;
pub mod item;

pub use boundary::{BoundaryMarker, BoundaryPositions, BoundarySnapshot, MarkerKind};
pub use input::{Modifier, Point, SyntheticEvent};
pub use item::{ElementRef, ItemFrame, MenuBarItem, ProcessInfo, RawElement, SubIdentifier, Zone};
