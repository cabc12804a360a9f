//! Object monitors built on modal lock words.
//!
//! Every object starts out with a lightweight lock word. A lock word is
//! inflated by binding a heavyweight [`JavaMonitor`] from the manager's pool
//! to the object, and deflated again when the manager unbinds idle monitors
//! at a GC safepoint. [`ModalMonitorScheme`] picks which lightweight mode
//! sits in front of the inflated one.
pub mod error;
pub mod lockword;
pub mod manager;
pub mod modehandlers;
pub mod monitor;
pub mod scheme;

pub use error::{MonitorError, MonitorResult};
pub use lockword::{MonitorHandle, WordLayout};
pub use manager::{BindingGuard, JavaMonitorManager, MutatorScope, UnboundMiscWordWriter};
pub use monitor::{BindingProtection, JavaMonitor};
pub use scheme::{ModalMonitorScheme, SchemeKind};
