//! Source pinning: the manifest of every external input a build consumes.

pub mod lock;
pub mod update;

pub use lock::{PinError, PinFile, PinKind, PinRecord};
pub use update::{PinContext, PinSource, PinUpdateError, PinUpdateResult, add_pin, resolve_pin, update_pins};
