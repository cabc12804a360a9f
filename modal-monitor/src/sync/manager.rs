//! Pool of heavyweight monitors and their bindings to objects.

use std::{
    collections::HashSet,
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::{
    lock_api::{RawRwLock as _, RawRwLockRecursive as _},
    Mutex, RawRwLock, RwLock,
};

use super::{
    lockword::{MonitorHandle, WordLayout},
    monitor::{BindingProtection, JavaMonitor},
};
use crate::{
    object_model::{Object, ObjectRef},
    options::Options,
    threading::{Thread, THREAD_MANAGER},
    Phase,
};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Restores the lightweight form of an object's lock words when its monitor
/// is unbound during GC. Registered by the active mode handler.
pub trait UnboundMiscWordWriter: Send + Sync {
    /// `pre_binding_misc` is the displaced misc word of the monitor.
    fn write_unbound_misc_word(&self, object: &Object, pre_binding_misc: u64);

    /// Only called on the 32-bit layout.
    fn write_unbound_hash_word(&self, object: &Object, pre_binding_hash: u64) {
        object.header().write_hash(pre_binding_hash);
    }
}

struct UnboundList {
    free: Vec<MonitorHandle>,
    /// Number of bindable monitors ever created.
    high_water_mark: usize,
}

pub struct JavaMonitorManager {
    id: u64,
    layout: WordLayout,
    image_size: usize,
    grow: usize,
    min: usize,
    trace: bool,
    monitors: RwLock<Vec<Arc<JavaMonitor>>>,
    unbound: Mutex<UnboundList>,
    sticky: Mutex<Vec<Arc<JavaMonitor>>>,
    stickies_installed: AtomicBool,
    safepoint: RawRwLock,
    in_global_safepoint: AtomicBool,
    unbinder: RwLock<Option<Arc<dyn UnboundMiscWordWriter>>>,
    require_proxy_acquirable: AtomicBool,
}

impl JavaMonitorManager {
    pub fn new(options: &Options) -> Self {
        Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            layout: options.layout(),
            image_size: options.unbound_pool_image_size,
            grow: options.unbound_pool_grow.max(1),
            min: options.unbound_pool_min,
            trace: options.trace_monitors,
            monitors: RwLock::new(Vec::new()),
            unbound: Mutex::new(UnboundList {
                free: Vec::new(),
                high_water_mark: 0,
            }),
            sticky: Mutex::new(Vec::new()),
            stickies_installed: AtomicBool::new(false),
            safepoint: RawRwLock::INIT,
            in_global_safepoint: AtomicBool::new(false),
            unbinder: RwLock::new(None),
            require_proxy_acquirable: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn layout(&self) -> WordLayout {
        self.layout
    }

    pub fn initialize(&self, phase: Phase) {
        match phase {
            Phase::Bootstrapping => {
                let mut unbound = self.unbound.lock();
                if unbound.high_water_mark < self.image_size {
                    let missing = self.image_size - unbound.high_water_mark;
                    self.expand_unbound_list(&mut unbound, missing);
                }
            }
            Phase::Primordial => {
                let stickies = self.sticky.lock().clone();
                for monitor in &stickies {
                    if let Some(object) = monitor.bound_object() {
                        self.install_sticky(monitor, &object);
                    }
                }
                self.stickies_installed.store(true, Ordering::Release);
            }
            Phase::Starting => {
                let stickies = self.sticky.lock();
                if self.trace && !stickies.is_empty() {
                    log::debug!("Sticky monitors:");
                    for (i, monitor) in stickies.iter().enumerate() {
                        log::debug!("  {i}: {monitor:?} bound to {:?}", monitor.bound_object());
                    }
                }
            }
            Phase::Running | Phase::Terminating => {}
        }
    }

    pub fn set_require_proxy_acquirable_monitors(&self, value: bool) {
        self.require_proxy_acquirable.store(value, Ordering::Relaxed);
    }

    pub fn register_monitor_unbinder(&self, unbinder: Arc<dyn UnboundMiscWordWriter>) {
        *self.unbinder.write() = Some(unbinder);
    }

    pub fn monitor(&self, handle: MonitorHandle) -> Arc<JavaMonitor> {
        let monitors = self.monitors.read();
        match monitors.get(handle.index()) {
            Some(monitor) => monitor.clone(),
            None => panic!("{handle:?} does not belong to manager #{}", self.id),
        }
    }

    /// Number of monitors in the free pool.
    pub fn unbound_count(&self) -> usize {
        self.unbound.lock().free.len()
    }

    /// Number of bindable monitors created so far.
    pub fn bindable_count(&self) -> usize {
        self.unbound.lock().high_water_mark
    }

    fn new_monitor(&self, sticky: bool) -> Arc<JavaMonitor> {
        let mut monitors = self.monitors.write();
        let index = monitors.len();
        if !self.layout.is_64bit() {
            assert!(
                index <= MonitorHandle::MAX_SPLIT32_INDEX,
                "monitor table exhausted for the 32-bit layout"
            );
        }
        let proxy = self.require_proxy_acquirable.load(Ordering::Relaxed);
        let monitor = Arc::new(JavaMonitor::new(
            MonitorHandle::from_index(index),
            proxy,
            sticky,
        ));
        monitors.push(monitor.clone());
        monitor
    }

    fn expand_unbound_list(&self, unbound: &mut UnboundList, quantity: usize) {
        for _ in 0..quantity {
            let monitor = self.new_monitor(false);
            unbound.free.push(monitor.handle());
        }
        unbound.high_water_mark += quantity;
        log::trace!(
            "monitor pool grown by {quantity} to {} monitors",
            unbound.high_water_mark
        );
    }

    /// Take a monitor from the pool and bind it one-way to `object`.
    pub fn bind_monitor(&self, object: &ObjectRef) -> Arc<JavaMonitor> {
        let handle = {
            let mut unbound = self.unbound.lock();
            if !self.in_global_safepoint.load(Ordering::Relaxed) {
                // Expand unless at least midway between the minimum and the high-water mark.
                if unbound.free.len() < (unbound.high_water_mark + self.min) >> 1 {
                    let grow = self.grow;
                    self.expand_unbound_list(&mut unbound, grow);
                }
            }
            if unbound.free.is_empty() {
                let grow = self.grow;
                self.expand_unbound_list(&mut unbound, grow);
            }
            match unbound.free.pop() {
                Some(handle) => handle,
                None => unreachable!("monitor pool is empty after growing"),
            }
        };
        let monitor = self.monitor(handle);
        monitor.set_bound_object(object);
        if self.trace {
            log::debug!("Bound monitor: {monitor:?} to {object:?}");
        }
        monitor
    }

    /// Reset `monitor` and put it back into the pool.
    pub fn unbind_monitor(&self, monitor: &JavaMonitor) {
        assert!(!monitor.is_sticky(), "sticky monitors are never unbound");
        if self.trace {
            log::debug!("Unbound monitor: {monitor:?}");
        }
        monitor.reset();
        self.unbound.lock().free.push(monitor.handle());
    }

    /// Permanently bind a monitor to a VM-internal lock object.
    pub fn bind_sticky_monitor(&self, object: &ObjectRef) -> Arc<JavaMonitor> {
        let monitor = self.new_monitor(true);
        monitor.set_bound_object(object);
        self.sticky.lock().push(monitor.clone());
        if self.stickies_installed.load(Ordering::Acquire) {
            self.install_sticky(&monitor, object);
        }
        monitor
    }

    pub fn new_vm_lock(&self, name: &str) -> ObjectRef {
        let lock = Object::named(name);
        self.bind_sticky_monitor(&lock);
        lock
    }

    fn install_sticky(&self, monitor: &JavaMonitor, object: &Object) {
        let header = object.header();
        let snapshot = self.layout.snapshot(header);
        if !snapshot.lockword.is_bound() {
            monitor.set_displaced_misc(snapshot.lockword.raw());
            monitor.set_displaced_hash(snapshot.hashword.raw());
        }
        self.refresh_bound_object(monitor, object);
    }

    fn refresh_bound_object(&self, monitor: &JavaMonitor, object: &Object) {
        let (misc, hash) = self.layout.bound_words(monitor.handle());
        let header = object.header();
        if !self.layout.is_64bit() {
            header.write_hash(hash.raw());
        }
        header.write_misc(misc.raw());
    }

    /// Pin the monitor behind `handle` against GC-time unbinding until the
    /// guard is dropped.
    pub fn protect_binding(&self, handle: MonitorHandle) -> BindingGuard {
        let monitor = self.monitor(handle);
        let thread = Thread::current();
        thread.pin(self.id, handle);
        BindingGuard {
            monitor,
            thread,
            manager: self.id,
            marker: PhantomData,
        }
    }

    /// Enter the region in which lock words are read and bindings are
    /// manipulated. No GC happens while any thread is inside it, so the
    /// scope must be left before blocking.
    pub fn mutator_scope(&self) -> MutatorScope<'_> {
        self.safepoint.lock_shared_recursive();
        MutatorScope {
            manager: self,
            marker: PhantomData,
        }
    }

    pub fn in_global_safepoint(&self) -> bool {
        self.in_global_safepoint.load(Ordering::Relaxed)
    }

    /// Stop all mutators and unbind every monitor that is neither owned nor
    /// pinned. Mutators stay stopped until [`Self::after_garbage_collection`].
    ///
    /// Must not be called from inside a [`MutatorScope`].
    pub fn before_garbage_collection(&self) {
        self.safepoint.lock_exclusive();
        self.in_global_safepoint.store(true, Ordering::Relaxed);
        self.unbind_unowned_monitors();
    }

    pub fn after_garbage_collection(&self) {
        assert!(
            self.in_global_safepoint(),
            "after_garbage_collection without before_garbage_collection"
        );
        self.refresh_all_bindings();
        self.in_global_safepoint.store(false, Ordering::Relaxed);
        unsafe { self.safepoint.unlock_exclusive() };
    }

    /// Does the object bound to `monitor` reference it from its lock words?
    fn is_hard_bound(&self, monitor: &JavaMonitor, object: &Object) -> bool {
        let header = object.header();
        let snapshot = self.layout.snapshot(header);
        self.layout.bound_monitor(header, &snapshot) == Some(monitor.handle())
    }

    fn unbind_unowned_monitors(&self) {
        let pinned: HashSet<MonitorHandle> = THREAD_MANAGER
            .threads()
            .flat_map(|thread| thread.pinned_by(self.id))
            .collect();
        let unbinder = self.unbinder.read().clone();
        let monitors = self.monitors.read().clone();
        let mut unbound = 0usize;

        for monitor in monitors.iter().filter(|m| !m.is_sticky()) {
            if !monitor.is_bound() {
                continue;
            }
            let Some(object) = monitor.bound_object() else {
                if monitor.is_quiescent() {
                    log::trace!("reclaiming {monitor:?} of a dead object");
                    monitor.reset();
                    self.unbound.lock().free.push(monitor.handle());
                    unbound += 1;
                }
                continue;
            };

            let hard_bound = self.is_hard_bound(monitor, &object);
            if hard_bound && monitor.binding_protection() == BindingProtection::PreAcquire {
                monitor.set_binding_protection(BindingProtection::Unprotected);
            }
            if pinned.contains(&monitor.handle())
                && monitor.binding_protection() == BindingProtection::Unprotected
            {
                monitor.set_binding_protection(BindingProtection::Protected);
            }

            let deflatable = hard_bound
                && monitor.binding_protection() == BindingProtection::Unprotected
                && monitor.is_quiescent();
            match &unbinder {
                Some(unbinder) if deflatable => {
                    if self.trace {
                        log::debug!("Unbinding monitor: {monitor:?} from {object:?}");
                    }
                    unbinder.write_unbound_misc_word(&object, monitor.displaced_misc());
                    if !self.layout.is_64bit() {
                        unbinder.write_unbound_hash_word(&object, monitor.displaced_hash());
                    }
                    monitor.reset();
                    self.unbound.lock().free.push(monitor.handle());
                    unbound += 1;
                }
                _ => monitor.set_requires_post_gc_refresh(hard_bound),
            }
        }
        log::debug!(
            "manager #{}: {unbound} monitors returned to the pool, {} free",
            self.id,
            self.unbound_count()
        );
    }

    fn refresh_all_bindings(&self) {
        let monitors = self.monitors.read().clone();
        for monitor in monitors.iter().filter(|m| !m.is_sticky()) {
            if !monitor.requires_post_gc_refresh() {
                continue;
            }
            monitor.set_requires_post_gc_refresh(false);
            if let Some(object) = monitor.bound_object() {
                debug_assert!(self.is_hard_bound(monitor, &object));
            }
            if monitor.binding_protection() == BindingProtection::Protected && monitor.owner_id() == 0 {
                monitor.set_binding_protection(BindingProtection::Unprotected);
            }
        }
        let stickies = self.sticky.lock().clone();
        if self.stickies_installed.load(Ordering::Acquire) {
            for monitor in &stickies {
                if let Some(object) = monitor.bound_object() {
                    self.refresh_bound_object(monitor, &object);
                }
            }
        }
    }
}

/// Shared hold on a manager's safepoint lock.
pub struct MutatorScope<'a> {
    manager: &'a JavaMonitorManager,
    marker: PhantomData<*const ()>,
}

impl Drop for MutatorScope<'_> {
    fn drop(&mut self) {
        unsafe { self.manager.safepoint.unlock_shared() };
    }
}

/// Pin on a bound monitor held by the current thread.
pub struct BindingGuard {
    monitor: Arc<JavaMonitor>,
    thread: Arc<Thread>,
    manager: u64,
    marker: PhantomData<*const ()>,
}

impl BindingGuard {
    pub fn monitor(&self) -> &Arc<JavaMonitor> {
        &self.monitor
    }
}

impl Drop for BindingGuard {
    fn drop(&mut self) {
        self.thread.unpin(self.manager, self.monitor.handle());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::lockword::InflatedMonitorLockword;

    struct RawWriter;

    impl UnboundMiscWordWriter for RawWriter {
        fn write_unbound_misc_word(&self, object: &Object, pre_binding_misc: u64) {
            object.header().write_misc(pre_binding_misc);
        }
    }

    fn manager(layout: WordLayout) -> JavaMonitorManager {
        let manager = JavaMonitorManager::new(&Options::default().with_layout(layout));
        manager.register_monitor_unbinder(Arc::new(RawWriter));
        manager.initialize(Phase::Bootstrapping);
        manager
    }

    fn hard_bind(manager: &JavaMonitorManager, object: &ObjectRef) -> Arc<JavaMonitor> {
        let monitor = manager.bind_monitor(object);
        let header = object.header();
        monitor.set_displaced_misc(header.read_misc());
        monitor.set_displaced_hash(header.read_hash());
        let (misc, hash) = manager.layout().bound_words(monitor.handle());
        header.write_hash(hash.raw());
        header.write_misc(misc.raw());
        monitor
    }

    #[test]
    fn pool_is_populated_and_grows() {
        let manager = manager(WordLayout::Wide64);
        assert_eq!(manager.bindable_count(), 50);
        assert_eq!(manager.unbound_count(), 50);

        let objects: Vec<_> = (0..20).map(|_| Object::new()).collect();
        let monitors: Vec<_> = objects.iter().map(|o| manager.bind_monitor(o)).collect();
        // 30 free is below the midpoint between 25 and 50.
        assert_eq!(manager.bindable_count(), 100);
        let handles: HashSet<_> = monitors.iter().map(|m| m.handle()).collect();
        assert_eq!(handles.len(), monitors.len());

        for monitor in &monitors {
            manager.unbind_monitor(monitor);
        }
        assert_eq!(manager.unbound_count(), 100);
    }

    #[test]
    fn gc_unbinds_unowned_monitors() {
        for layout in [WordLayout::Wide64, WordLayout::Split32] {
            let manager = manager(layout);
            let object = Object::new();
            let hashword = InflatedMonitorLockword::from_hashcode(layout, 77);
            if !layout.is_64bit() {
                object.header().write_hash(hashword.raw());
            }
            let free = manager.unbound_count();
            let monitor = hard_bind(&manager, &object);
            assert!(object.header().read_misc() & 0b11 == 0b11);

            manager.before_garbage_collection();
            manager.after_garbage_collection();

            assert_eq!(object.header().read_misc(), 0);
            if !layout.is_64bit() {
                assert_eq!(object.header().read_hash(), hashword.raw());
            }
            assert!(!monitor.is_bound());
            assert_eq!(manager.unbound_count(), free);
        }
    }

    #[test]
    fn owned_and_pinned_monitors_survive_gc() {
        let manager = manager(WordLayout::Wide64);
        let owned = Object::new();
        let pinned = Object::new();
        let owned_monitor = hard_bind(&manager, &owned);
        let pinned_monitor = hard_bind(&manager, &pinned);
        owned_monitor.monitor_enter();
        let guard = manager.protect_binding(pinned_monitor.handle());

        manager.before_garbage_collection();
        manager.after_garbage_collection();

        assert!(owned_monitor.is_bound());
        assert!(pinned_monitor.is_bound());
        assert_eq!(
            InflatedMonitorLockword::from_raw(pinned.header().read_misc()).get_bound_monitor(),
            pinned_monitor.handle()
        );

        owned_monitor.monitor_exit().unwrap();
        drop(guard);
        manager.before_garbage_collection();
        manager.after_garbage_collection();
        assert!(!owned_monitor.is_bound());
        assert!(!pinned_monitor.is_bound());
    }

    #[test]
    fn dead_objects_release_their_monitor() {
        let manager = manager(WordLayout::Wide64);
        let object = Object::new();
        let monitor = hard_bind(&manager, &object);
        monitor.monitor_enter();
        monitor.monitor_exit().unwrap();
        monitor.set_binding_protection(BindingProtection::Protected);
        drop(object);

        manager.before_garbage_collection();
        manager.after_garbage_collection();
        assert!(!monitor.is_bound());
    }

    #[test]
    fn sticky_monitors_never_deflate() {
        for layout in [WordLayout::Wide64, WordLayout::Split32] {
            let manager = manager(layout);
            let early = manager.new_vm_lock("EARLY_LOCK");
            assert_eq!(early.header().read_misc(), 0);
            manager.initialize(Phase::Primordial);
            let late = manager.new_vm_lock("LATE_LOCK");

            for _ in 0..2 {
                manager.before_garbage_collection();
                manager.after_garbage_collection();
            }
            for lock in [&early, &late] {
                let header = lock.header();
                let snapshot = layout.snapshot(header);
                let handle = layout.bound_monitor(header, &snapshot).unwrap();
                assert!(manager.monitor(handle).is_sticky());
            }
            assert_eq!(early.name(), Some("EARLY_LOCK"));
        }
    }
}
