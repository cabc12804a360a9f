pub mod object_model;
pub mod options;
pub mod sync;
pub mod threading;

/// Startup and shutdown phases of the VM hosting the monitor subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Monitor pool is populated, handlers pick their monitor flavor.
    Bootstrapping,
    /// Sticky monitors created so far get written into their objects.
    Primordial,
    Starting,
    Running,
    Terminating,
}

pub mod prelude {
    pub use crate::{
        object_model::{Object, ObjectRef},
        options::{Options, OPTIONS},
        sync::{ModalMonitorScheme, MonitorError, MonitorResult, SchemeKind, WordLayout},
        threading::Thread,
        Phase,
    };
}
