//! authbroker core - shared functionality for the authbroker service and tools
//!
//! Standard directory layout and the OS-level confinement lookups that do
//! not depend on the message bus.

pub mod paths;
pub mod process;

pub use paths::Paths;
pub use process::{parse_label, ConfinementError, UNCONFINED};
