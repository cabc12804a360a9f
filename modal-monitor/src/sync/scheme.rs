//! A monitor scheme wires a manager to the handler serving as its fast path.

use std::sync::Arc;

use super::{
    error::MonitorResult,
    lockword::WordLayout,
    manager::JavaMonitorManager,
    modehandlers::{InflatedMonitorModeHandler, MonitorSchemeEntry, ThinLockModeHandler},
};
use crate::{
    object_model::{self, Object, ObjectRef},
    options::Options,
    threading::Thread,
    Phase,
};

pub use crate::options::SchemeKind;

pub struct ModalMonitorScheme {
    kind: SchemeKind,
    entry: Box<dyn MonitorSchemeEntry>,
    manager: Arc<JavaMonitorManager>,
}

impl ModalMonitorScheme {
    pub fn new(kind: SchemeKind, options: &Options) -> Self {
        let manager = Arc::new(JavaMonitorManager::new(options));
        let entry: Box<dyn MonitorSchemeEntry> = match kind {
            SchemeKind::Inflated => Box::new(InflatedMonitorModeHandler::as_fast_path(manager.clone())),
            SchemeKind::ThinInflated => {
                let delegate = InflatedMonitorModeHandler::as_thin_lock_delegate(manager.clone());
                Box::new(ThinLockModeHandler::new(delegate, manager.clone(), options))
            }
        };
        log::debug!("created {kind:?} monitor scheme, {:?} lock words", manager.layout());
        Self {
            kind,
            entry,
            manager,
        }
    }

    /// Scheme selected by `options.scheme`, initialized up to [`Phase::Running`].
    pub fn from_options(options: &Options) -> Self {
        let scheme = Self::new(options.scheme, options);
        for phase in [
            Phase::Bootstrapping,
            Phase::Primordial,
            Phase::Starting,
            Phase::Running,
        ] {
            scheme.initialize(phase);
        }
        scheme
    }

    pub fn kind(&self) -> SchemeKind {
        self.kind
    }

    pub fn manager(&self) -> &Arc<JavaMonitorManager> {
        &self.manager
    }

    pub fn layout(&self) -> WordLayout {
        self.manager.layout()
    }

    /// The handler decides on proxy acquisition before the manager creates
    /// its first monitors.
    pub fn initialize(&self, phase: Phase) {
        self.entry.initialize(phase);
        self.manager.initialize(phase);
    }

    pub fn monitor_enter(&self, object: &ObjectRef) {
        self.entry.monitor_enter(object);
    }

    pub fn monitor_exit(&self, object: &ObjectRef) -> MonitorResult {
        self.entry.monitor_exit(object)
    }

    pub fn monitor_notify(&self, object: &ObjectRef) -> MonitorResult {
        self.entry.monitor_notify(object, false)
    }

    pub fn monitor_notify_all(&self, object: &ObjectRef) -> MonitorResult {
        self.entry.monitor_notify(object, true)
    }

    pub fn monitor_wait(&self, object: &ObjectRef, timeout_ms: u64) -> MonitorResult {
        self.entry.monitor_wait(object, timeout_ms)
    }

    pub fn make_hash_code(&self, object: &ObjectRef) -> u32 {
        self.entry.make_hash_code(object)
    }

    pub fn thread_holds_monitor(&self, object: &ObjectRef, thread: &Thread) -> bool {
        self.entry.thread_holds_monitor(object, thread)
    }

    /// Allocate an object whose misc word starts in this scheme's unlocked form.
    pub fn new_object(&self) -> ObjectRef {
        let object = Object::new();
        object.header().write_misc(self.entry.create_misc().raw());
        object
    }

    pub fn new_named_object(&self, name: &str) -> ObjectRef {
        let object = Object::named(name);
        object.header().write_misc(self.entry.create_misc().raw());
        object
    }

    /// Fresh identity hashcode fitting this scheme's layout.
    pub fn create_hash_code(&self) -> u32 {
        object_model::create_hash_code(self.layout())
    }

    /// Run `f` while holding the monitor of `object`.
    pub fn synchronized<R>(&self, object: &ObjectRef, f: impl FnOnce() -> R) -> MonitorResult<R> {
        self.monitor_enter(object);
        let result = f();
        self.monitor_exit(object)?;
        Ok(result)
    }

    pub fn before_garbage_collection(&self) {
        self.entry.before_garbage_collection();
    }

    pub fn after_garbage_collection(&self) {
        self.entry.after_garbage_collection();
    }

    /// One simulated GC pause: every unowned, unpinned monitor is unbound.
    pub fn collect_garbage(&self) {
        let free = self.manager.unbound_count();
        self.before_garbage_collection();
        self.after_garbage_collection();
        log::debug!(
            "{:?} scheme collected, {} -> {} free monitors",
            self.kind,
            free,
            self.manager.unbound_count()
        );
    }
}
