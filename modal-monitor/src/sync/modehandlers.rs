//! Mode handlers implement monitor operations for one lock word mode.
//!
//! A handler either serves as the fast path of a scheme
//! ([`MonitorSchemeEntry`]) or as the delegate of a lighter mode
//! ([`ModeDelegate`]), taking over once the lighter mode gives up.

pub mod inflated;
pub mod thin;

use crate::{
    object_model::ObjectRef,
    sync::{error::MonitorResult, lockword::ModalLockword},
    threading::Thread,
    Phase,
};

pub use inflated::{BiasedLockDelegate, FastPath, InflatedMonitorModeHandler, ThinLockDelegate};
pub use thin::ThinLockModeHandler;

/// Entry points of a monitor scheme.
pub trait MonitorSchemeEntry: Send + Sync {
    fn initialize(&self, phase: Phase);

    /// Initial misc word of an object allocated under this scheme.
    fn create_misc(&self) -> ModalLockword;

    fn monitor_enter(&self, object: &ObjectRef);

    fn monitor_exit(&self, object: &ObjectRef) -> MonitorResult;

    fn monitor_notify(&self, object: &ObjectRef, all: bool) -> MonitorResult;

    /// `timeout_ms == 0` waits forever.
    fn monitor_wait(&self, object: &ObjectRef, timeout_ms: u64) -> MonitorResult;

    fn make_hash_code(&self, object: &ObjectRef) -> u32;

    fn thread_holds_monitor(&self, object: &ObjectRef, thread: &Thread) -> bool;

    fn before_garbage_collection(&self);

    fn after_garbage_collection(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegatedThreadHoldsMonitorResult {
    True,
    False,
    /// The lock word is not in the delegate's mode; re-read and retry.
    NotThisMode,
}

/// Contract between a lightweight mode and the heavier mode it inflates into.
///
/// The `prepare` family must be called from inside the manager's mutator
/// scope; the `delegate_*` operations open their own scope and must be called
/// outside of it, as they may block.
pub trait ModeDelegate: Send + Sync {
    fn initialize(&self, phase: Phase);

    /// Bind a monitor for `object` that mirrors the lightweight `lockword`
    /// and return the word referencing it. The binding is only one-way until
    /// the caller installs the returned word.
    fn prepare_modal_lockword(&self, object: &ObjectRef, lockword: ModalLockword) -> ModalLockword;

    /// Re-stage a prepared monitor after `lockword` changed under the caller.
    /// `hashword` is only used on the 32-bit layout.
    fn reprepare_modal_lockword(
        &self,
        prepared: ModalLockword,
        lockword: ModalLockword,
        hashword: ModalLockword,
    ) -> ModalLockword;

    fn cancel_prepared_modal_lockword(&self, prepared: ModalLockword);

    /// `None` when the object is not in this mode.
    fn delegate_make_hashcode(&self, object: &ObjectRef, lockword: ModalLockword) -> Option<u32>;

    /// `false` when the object is not in this mode.
    fn delegate_monitor_enter(&self, object: &ObjectRef, lockword: ModalLockword, thread_id: u32) -> bool;

    fn delegate_monitor_exit(&self, object: &ObjectRef, lockword: ModalLockword) -> MonitorResult;

    fn delegate_monitor_notify(&self, object: &ObjectRef, all: bool, lockword: ModalLockword) -> MonitorResult;

    fn delegate_monitor_wait(&self, object: &ObjectRef, timeout_ms: u64, lockword: ModalLockword) -> MonitorResult;

    fn delegate_thread_holds_monitor(
        &self,
        object: &ObjectRef,
        lockword: ModalLockword,
        thread: &Thread,
    ) -> DelegatedThreadHoldsMonitorResult;

    fn delegate_before_garbage_collection(&self);

    fn delegate_after_garbage_collection(&self);
}
