//! Inflated mode: every locked object is bound to a heavyweight monitor.

use std::sync::Arc;

use super::{DelegatedThreadHoldsMonitorResult, ModeDelegate, MonitorSchemeEntry};
use crate::{
    object_model::{create_hash_code, Object, ObjectRef},
    sync::{
        error::{MonitorError, MonitorResult},
        lockword::{
            BiasedLockword, HashableLockword, InflatedMonitorLockword, LockwordSnapshot,
            ModalLockword, MonitorHandle, ThinLockword, WordLayout,
        },
        manager::{BindingGuard, JavaMonitorManager, UnboundMiscWordWriter},
        monitor::JavaMonitor,
    },
    threading::Thread,
    Phase,
};

/// Monitor bound and entered for an object whose lock word does not
/// reference it yet. Dropping it without [`SpeculativeBinding::commit`]
/// exits the monitor and returns it to the pool.
struct SpeculativeBinding<'a> {
    manager: &'a JavaMonitorManager,
    monitor: Option<Arc<JavaMonitor>>,
}

impl<'a> SpeculativeBinding<'a> {
    fn new(manager: &'a JavaMonitorManager) -> Self {
        Self {
            manager,
            monitor: None,
        }
    }

    /// Bind and enter a monitor on first use, reuse it afterwards.
    fn monitor(&mut self, object: &ObjectRef) -> Arc<JavaMonitor> {
        let manager = self.manager;
        self.monitor
            .get_or_insert_with(|| {
                let monitor = manager.bind_monitor(object);
                monitor.monitor_enter();
                monitor
            })
            .clone()
    }

    fn commit(mut self) {
        self.monitor = None;
    }
}

impl Drop for SpeculativeBinding<'_> {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            log::trace!("rolling back speculative binding of {monitor:?}");
            let released = monitor.monitor_exit();
            debug_assert!(released.is_ok());
            self.manager.unbind_monitor(&monitor);
        }
    }
}

struct FastPathUnbinder;

impl UnboundMiscWordWriter for FastPathUnbinder {
    fn write_unbound_misc_word(&self, object: &Object, pre_binding_misc: u64) {
        object.header().write_misc(pre_binding_misc);
    }
}

struct ThinLockUnbinder;

impl UnboundMiscWordWriter for ThinLockUnbinder {
    fn write_unbound_misc_word(&self, object: &Object, pre_binding_misc: u64) {
        let lockword = ThinLockword::from(pre_binding_misc).as_unlocked();
        object.header().write_misc(lockword.raw());
    }
}

struct BiasedLockUnbinder;

impl UnboundMiscWordWriter for BiasedLockUnbinder {
    fn write_unbound_misc_word(&self, object: &Object, pre_binding_misc: u64) {
        let lockword = BiasedLockword::from(pre_binding_misc).as_anon_biased();
        object.header().write_misc(lockword.raw());
    }
}

/// Operations shared by the fast path and the delegates.
pub struct InflatedMonitorModeHandler {
    manager: Arc<JavaMonitorManager>,
    layout: WordLayout,
}

impl InflatedMonitorModeHandler {
    fn new(manager: Arc<JavaMonitorManager>, unbinder: Arc<dyn UnboundMiscWordWriter>) -> Self {
        manager.register_monitor_unbinder(unbinder);
        let layout = manager.layout();
        Self { manager, layout }
    }

    pub fn as_fast_path(manager: Arc<JavaMonitorManager>) -> FastPath {
        FastPath(Self::new(manager, Arc::new(FastPathUnbinder)))
    }

    pub fn as_thin_lock_delegate(manager: Arc<JavaMonitorManager>) -> ThinLockDelegate {
        ThinLockDelegate(Self::new(manager, Arc::new(ThinLockUnbinder)))
    }

    /// # Panics
    ///
    /// Biased locking only exists on the 64-bit layout.
    pub fn as_biased_lock_delegate(manager: Arc<JavaMonitorManager>) -> BiasedLockDelegate {
        assert!(
            manager.layout().is_64bit(),
            "biased locking is not implemented for the 32-bit layout"
        );
        BiasedLockDelegate(Self::new(manager, Arc::new(BiasedLockUnbinder)))
    }

    pub fn manager(&self) -> &Arc<JavaMonitorManager> {
        &self.manager
    }

    pub fn layout(&self) -> WordLayout {
        self.layout
    }

    /// Read the lock words of `object` and pin the bound monitor, if any.
    /// Must be called inside the mutator scope.
    fn read_misc_and_protect_binding(
        &self,
        object: &Object,
    ) -> (LockwordSnapshot, Option<BindingGuard>) {
        let header = object.header();
        let snapshot = self.layout.snapshot(header);
        let guard = self
            .layout
            .bound_monitor(header, &snapshot)
            .map(|handle| self.manager.protect_binding(handle));
        (snapshot, guard)
    }

    /// Monitor bound to `object`, if any. Must be called inside the mutator scope.
    fn bound_monitor(&self, object: &Object) -> Option<Arc<JavaMonitor>> {
        let header = object.header();
        let snapshot = self.layout.snapshot(header);
        self.layout
            .bound_monitor(header, &snapshot)
            .map(|handle| self.manager.monitor(handle))
    }

    /// Hashcode kept in the displaced word of a bound monitor, installing a
    /// fresh one if there is none yet.
    fn make_bound_hash_code(&self, monitor: &JavaMonitor) -> u32 {
        let layout = self.layout;
        loop {
            let displaced = HashableLockword::from(match layout {
                WordLayout::Wide64 => monitor.displaced_misc(),
                WordLayout::Split32 => monitor.displaced_hash(),
            });
            let hashcode = displaced.hashcode(layout);
            if hashcode != 0 {
                return hashcode;
            }
            let hashcode = create_hash_code(layout);
            let new = displaced.with_hashcode(layout, hashcode);
            let witness = match layout {
                WordLayout::Wide64 => {
                    monitor.compare_and_swap_displaced_misc(displaced.raw(), new.raw())
                }
                WordLayout::Split32 => {
                    monitor.compare_and_swap_displaced_hash(displaced.raw(), new.raw())
                }
            };
            if witness == displaced.raw() {
                return hashcode;
            }
            let installed = HashableLockword::from(witness).hashcode(layout);
            if installed != 0 {
                return installed;
            }
        }
    }

    fn monitor_exit_bound(&self, object: &Object, lockword: InflatedMonitorLockword) -> MonitorResult {
        if !lockword.is_bound() {
            return Err(MonitorError::IllegalMonitorState);
        }
        let monitor = {
            let _scope = self.manager.mutator_scope();
            self.bound_monitor(object)
        };
        match monitor {
            Some(monitor) => monitor.monitor_exit(),
            None => Err(MonitorError::IllegalMonitorState),
        }
    }

    fn monitor_notify_bound(
        &self,
        object: &Object,
        all: bool,
        lockword: InflatedMonitorLockword,
    ) -> MonitorResult {
        if !lockword.is_bound() {
            return Err(MonitorError::IllegalMonitorState);
        }
        let monitor = {
            let _scope = self.manager.mutator_scope();
            self.bound_monitor(object)
        };
        match monitor {
            Some(monitor) => monitor.monitor_notify(all),
            None => Err(MonitorError::IllegalMonitorState),
        }
    }

    fn monitor_wait_bound(
        &self,
        object: &Object,
        timeout_ms: u64,
        lockword: InflatedMonitorLockword,
    ) -> MonitorResult {
        if !lockword.is_bound() {
            return Err(MonitorError::IllegalMonitorState);
        }
        let guard = {
            let _scope = self.manager.mutator_scope();
            self.read_misc_and_protect_binding(object).1
        };
        match guard {
            Some(guard) => guard.monitor().monitor_wait(timeout_ms),
            None => Err(MonitorError::IllegalMonitorState),
        }
    }

    /// `None` when the object is not bound.
    fn bound_thread_holds_monitor(&self, object: &Object, thread: &Thread) -> Option<bool> {
        let _scope = self.manager.mutator_scope();
        self.bound_monitor(object)
            .map(|monitor| monitor.is_owned_by(thread))
    }

    fn before_garbage_collection(&self) {
        self.manager.before_garbage_collection();
    }

    fn after_garbage_collection(&self) {
        self.manager.after_garbage_collection();
    }

    fn delegate_make_hashcode(&self, object: &Object) -> Option<u32> {
        let _scope = self.manager.mutator_scope();
        let (_, guard) = self.read_misc_and_protect_binding(object);
        guard.map(|guard| self.make_bound_hash_code(guard.monitor()))
    }

    fn delegate_monitor_enter(&self, object: &Object) -> bool {
        let guard = {
            let _scope = self.manager.mutator_scope();
            self.read_misc_and_protect_binding(object).1
        };
        match guard {
            Some(guard) => {
                guard.monitor().monitor_enter();
                true
            }
            None => false,
        }
    }

    fn delegate_thread_holds_monitor(
        &self,
        object: &Object,
        thread: &Thread,
    ) -> DelegatedThreadHoldsMonitorResult {
        match self.bound_thread_holds_monitor(object, thread) {
            Some(true) => DelegatedThreadHoldsMonitorResult::True,
            Some(false) => DelegatedThreadHoldsMonitorResult::False,
            None => DelegatedThreadHoldsMonitorResult::NotThisMode,
        }
    }

    /// Make a freshly bound monitor mirror a lightweight lock held by
    /// `owner` `rcount` times, or unowned when `rcount` is zero.
    fn stage(
        &self,
        monitor: &JavaMonitor,
        displaced_misc: u64,
        hashword: ModalLockword,
        owner: u32,
        rcount: u32,
    ) {
        monitor.set_displaced_misc(displaced_misc);
        if !self.layout.is_64bit() {
            monitor.set_displaced_hash(hashword.raw());
        }
        if rcount != 0 {
            monitor.monitor_private_acquire(owner, rcount);
        } else {
            monitor.monitor_private_release();
        }
    }

    fn prepared_monitor(&self, prepared: ModalLockword) -> Arc<JavaMonitor> {
        let handle: MonitorHandle = InflatedMonitorLockword::from(prepared).get_bound_monitor();
        self.manager.monitor(handle)
    }

    fn cancel_prepared_modal_lockword(&self, prepared: ModalLockword) {
        let monitor = self.prepared_monitor(prepared);
        self.manager.unbind_monitor(&monitor);
    }
}

/// Inflated mode as the fast path of a scheme.
pub struct FastPath(InflatedMonitorModeHandler);

impl FastPath {
    pub fn handler(&self) -> &InflatedMonitorModeHandler {
        &self.0
    }
}

impl MonitorSchemeEntry for FastPath {
    fn initialize(&self, phase: Phase) {
        if phase == Phase::Bootstrapping {
            self.0.manager.set_require_proxy_acquirable_monitors(false);
        }
    }

    fn monitor_enter(&self, object: &ObjectRef) {
        let this = &self.0;
        let layout = this.layout;
        let header = object.header();
        let guard = {
            let _scope = this.manager.mutator_scope();
            let mut snapshot = layout.snapshot(header);
            let mut speculative = SpeculativeBinding::new(&this.manager);
            loop {
                if let Some(handle) = layout.bound_monitor(header, &snapshot) {
                    drop(speculative);
                    break this.manager.protect_binding(handle);
                }

                let monitor = speculative.monitor(object);
                monitor.set_displaced_misc(snapshot.lockword.as_unbound().raw());
                if !layout.is_64bit() {
                    monitor.set_displaced_hash(snapshot.hashword.raw());
                }
                let (misc, hash) = layout.bound_words(monitor.handle());
                match layout {
                    WordLayout::Wide64 => {
                        let witness =
                            header.compare_and_swap_misc(snapshot.lockword.raw(), misc.raw());
                        if witness == snapshot.lockword.raw() {
                            speculative.commit();
                            return;
                        }
                        snapshot.lockword = witness.into();
                    }
                    WordLayout::Split32 => {
                        let witness =
                            header.compare_and_swap_hash(snapshot.hashword.raw(), hash.raw());
                        if witness == snapshot.hashword.raw() {
                            header.write_misc(misc.raw());
                            speculative.commit();
                            return;
                        }
                        // Either another binder won, or a hashcode was installed.
                        snapshot.hashword = witness.into();
                        snapshot.lockword = header.read_misc().into();
                    }
                }
                log::trace!("lost lock word race on {object:?}, retrying");
            }
        };
        guard.monitor().monitor_enter();
    }

    fn monitor_exit(&self, object: &ObjectRef) -> MonitorResult {
        let lockword = InflatedMonitorLockword::from(object.header().read_misc());
        self.0.monitor_exit_bound(object, lockword)
    }

    fn monitor_notify(&self, object: &ObjectRef, all: bool) -> MonitorResult {
        let lockword = InflatedMonitorLockword::from(object.header().read_misc());
        self.0.monitor_notify_bound(object, all, lockword)
    }

    fn monitor_wait(&self, object: &ObjectRef, timeout_ms: u64) -> MonitorResult {
        let lockword = InflatedMonitorLockword::from(object.header().read_misc());
        self.0.monitor_wait_bound(object, timeout_ms, lockword)
    }

    fn make_hash_code(&self, object: &ObjectRef) -> u32 {
        let this = &self.0;
        let layout = this.layout;
        let header = object.header();
        let _scope = this.manager.mutator_scope();
        loop {
            let (snapshot, guard) = this.read_misc_and_protect_binding(object);
            if let Some(guard) = guard {
                return this.make_bound_hash_code(guard.monitor());
            }
            let carrier = layout.hash_carrier(&snapshot);
            let hashcode = carrier.hashcode(layout);
            if hashcode != 0 {
                return hashcode;
            }
            let hashcode = create_hash_code(layout);
            match layout {
                WordLayout::Wide64 => {
                    let new = InflatedMonitorLockword::unbound_from_hashcode(layout, hashcode);
                    if header.compare_and_swap_misc(carrier.raw(), new.raw()) == carrier.raw() {
                        return hashcode;
                    }
                }
                WordLayout::Split32 => {
                    let new = carrier.with_hashcode(layout, hashcode);
                    if header.compare_and_swap_hash(carrier.raw(), new.raw()) == carrier.raw() {
                        let misc = snapshot.lockword;
                        if !misc.is_inflated() {
                            // Loses only to a binder, which installs its own misc word.
                            header.compare_and_swap_misc(misc.raw(), misc.as_unbound().raw());
                        }
                        return hashcode;
                    }
                }
            }
        }
    }

    fn create_misc(&self) -> ModalLockword {
        InflatedMonitorLockword::unbound_from_hashcode(self.0.layout, 0).into()
    }

    fn thread_holds_monitor(&self, object: &ObjectRef, thread: &Thread) -> bool {
        self.0
            .bound_thread_holds_monitor(object, thread)
            .unwrap_or(false)
    }

    fn before_garbage_collection(&self) {
        self.0.before_garbage_collection();
    }

    fn after_garbage_collection(&self) {
        self.0.after_garbage_collection();
    }
}

macro_rules! delegate_common {
    () => {
        fn delegate_make_hashcode(&self, object: &ObjectRef, _lockword: ModalLockword) -> Option<u32> {
            self.0.delegate_make_hashcode(object)
        }

        fn delegate_monitor_enter(&self, object: &ObjectRef, _lockword: ModalLockword, _thread_id: u32) -> bool {
            self.0.delegate_monitor_enter(object)
        }

        fn delegate_monitor_exit(&self, object: &ObjectRef, lockword: ModalLockword) -> MonitorResult {
            self.0.monitor_exit_bound(object, lockword.into())
        }

        fn delegate_monitor_notify(&self, object: &ObjectRef, all: bool, lockword: ModalLockword) -> MonitorResult {
            self.0.monitor_notify_bound(object, all, lockword.into())
        }

        fn delegate_monitor_wait(&self, object: &ObjectRef, timeout_ms: u64, lockword: ModalLockword) -> MonitorResult {
            self.0.monitor_wait_bound(object, timeout_ms, lockword.into())
        }

        fn delegate_thread_holds_monitor(
            &self,
            object: &ObjectRef,
            _lockword: ModalLockword,
            thread: &Thread,
        ) -> DelegatedThreadHoldsMonitorResult {
            self.0.delegate_thread_holds_monitor(object, thread)
        }

        fn cancel_prepared_modal_lockword(&self, prepared: ModalLockword) {
            self.0.cancel_prepared_modal_lockword(prepared);
        }

        fn delegate_before_garbage_collection(&self) {
            self.0.before_garbage_collection();
        }

        fn delegate_after_garbage_collection(&self) {
            self.0.after_garbage_collection();
        }
    };
}

/// Inflated mode behind thin locks.
pub struct ThinLockDelegate(InflatedMonitorModeHandler);

impl ThinLockDelegate {
    pub fn handler(&self) -> &InflatedMonitorModeHandler {
        &self.0
    }

    fn stage_thin(&self, monitor: &JavaMonitor, lockword: ModalLockword, hashword: ModalLockword) {
        let thin = ThinLockword::from(lockword);
        self.0.stage(
            monitor,
            thin.as_unlocked().raw(),
            hashword,
            thin.lock_owner_id(),
            thin.recursion_count(),
        );
    }
}

impl ModeDelegate for ThinLockDelegate {
    fn initialize(&self, phase: Phase) {
        if phase == Phase::Bootstrapping {
            self.0.manager.set_require_proxy_acquirable_monitors(true);
        }
    }

    fn prepare_modal_lockword(&self, object: &ObjectRef, lockword: ModalLockword) -> ModalLockword {
        let monitor = self.0.manager.bind_monitor(object);
        let hashword = self.0.layout.read_hashword(object.header());
        self.stage_thin(&monitor, lockword, hashword.into());
        InflatedMonitorLockword::bound_from_monitor(monitor.handle()).into()
    }

    fn reprepare_modal_lockword(
        &self,
        prepared: ModalLockword,
        lockword: ModalLockword,
        hashword: ModalLockword,
    ) -> ModalLockword {
        let monitor = self.0.prepared_monitor(prepared);
        self.stage_thin(&monitor, lockword, hashword);
        prepared
    }

    delegate_common!();
}

/// Inflated mode behind biased locks. 64-bit layout only.
pub struct BiasedLockDelegate(InflatedMonitorModeHandler);

impl BiasedLockDelegate {
    pub fn handler(&self) -> &InflatedMonitorModeHandler {
        &self.0
    }

    fn stage_biased(&self, monitor: &JavaMonitor, lockword: ModalLockword) {
        let biased = BiasedLockword::from(lockword);
        // The owner id may already have been recycled; the bias is stale then.
        self.0.stage(
            monitor,
            biased.raw(),
            ModalLockword::default(),
            biased.bias_owner_id(),
            biased.recursion_count(),
        );
    }
}

impl ModeDelegate for BiasedLockDelegate {
    fn initialize(&self, phase: Phase) {
        if phase == Phase::Bootstrapping {
            self.0.manager.set_require_proxy_acquirable_monitors(true);
        }
    }

    fn prepare_modal_lockword(&self, object: &ObjectRef, lockword: ModalLockword) -> ModalLockword {
        let monitor = self.0.manager.bind_monitor(object);
        self.stage_biased(&monitor, lockword);
        InflatedMonitorLockword::bound_from_monitor(monitor.handle()).into()
    }

    fn reprepare_modal_lockword(
        &self,
        prepared: ModalLockword,
        lockword: ModalLockword,
        _hashword: ModalLockword,
    ) -> ModalLockword {
        let monitor = self.0.prepared_monitor(prepared);
        self.stage_biased(&monitor, lockword);
        prepared
    }

    delegate_common!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{options::Options, sync::lockword::MAX_RECURSION_COUNT};

    fn manager(layout: WordLayout) -> Arc<JavaMonitorManager> {
        Arc::new(JavaMonitorManager::new(&Options::default().with_layout(layout)))
    }

    fn fast_path(layout: WordLayout) -> FastPath {
        let handler = InflatedMonitorModeHandler::as_fast_path(manager(layout));
        handler.initialize(Phase::Bootstrapping);
        handler.handler().manager().initialize(Phase::Bootstrapping);
        handler
    }

    fn thin_delegate(layout: WordLayout) -> ThinLockDelegate {
        let delegate = InflatedMonitorModeHandler::as_thin_lock_delegate(manager(layout));
        delegate.initialize(Phase::Bootstrapping);
        delegate.handler().manager().initialize(Phase::Bootstrapping);
        delegate
    }

    #[test]
    fn enter_binds_and_exit_keeps_binding() {
        for layout in [WordLayout::Wide64, WordLayout::Split32] {
            let handler = fast_path(layout);
            let object = Object::new();
            let me = Thread::current();

            handler.monitor_enter(&object);
            handler.monitor_enter(&object);
            assert!(InflatedMonitorLockword::from(object.header().read_misc()).is_bound());
            assert!(handler.thread_holds_monitor(&object, &me));

            handler.monitor_exit(&object).unwrap();
            handler.monitor_exit(&object).unwrap();
            assert!(!handler.thread_holds_monitor(&object, &me));
            assert_eq!(
                handler.monitor_exit(&object),
                Err(MonitorError::IllegalMonitorState)
            );
        }
    }

    #[test]
    fn operations_on_unbound_object_are_illegal() {
        for layout in [WordLayout::Wide64, WordLayout::Split32] {
            let handler = fast_path(layout);
            let object = Object::new();
            assert_eq!(handler.monitor_exit(&object), Err(MonitorError::IllegalMonitorState));
            assert_eq!(
                handler.monitor_notify(&object, true),
                Err(MonitorError::IllegalMonitorState)
            );
            assert_eq!(
                handler.monitor_wait(&object, 1),
                Err(MonitorError::IllegalMonitorState)
            );
            assert!(!handler.thread_holds_monitor(&object, &Thread::current()));
        }
    }

    #[test]
    fn hash_code_survives_binding_and_deflation() {
        for layout in [WordLayout::Wide64, WordLayout::Split32] {
            let handler = fast_path(layout);
            let object = Object::new();

            let is_unbound_inflated = |object: &Object| {
                let misc = ModalLockword::from(object.header().read_misc());
                misc.is_inflated() && !misc.is_bound()
            };

            let hash = handler.make_hash_code(&object);
            assert_ne!(hash, 0);
            assert!(is_unbound_inflated(&object));
            assert_eq!(handler.make_hash_code(&object), hash);

            handler.monitor_enter(&object);
            assert_eq!(handler.make_hash_code(&object), hash);
            handler.monitor_exit(&object).unwrap();

            handler.before_garbage_collection();
            handler.after_garbage_collection();
            assert!(is_unbound_inflated(&object));
            assert_eq!(handler.make_hash_code(&object), hash);
        }
    }

    #[test]
    fn fresh_words_deflate_to_unbound_inflated() {
        for layout in [WordLayout::Wide64, WordLayout::Split32] {
            let handler = fast_path(layout);
            let created = InflatedMonitorLockword::from(handler.create_misc());
            assert!(created.is_inflated() && !created.is_bound());

            // A zero word from an object not created through the scheme.
            let object = Object::new();
            handler.monitor_enter(&object);
            handler.monitor_exit(&object).unwrap();
            handler.before_garbage_collection();
            handler.after_garbage_collection();
            assert_eq!(object.header().read_misc(), created.raw());
            assert_eq!(object.header().read_hash(), 0);
        }
    }

    #[test]
    fn hash_code_installed_while_bound_survives_deflation() {
        for layout in [WordLayout::Wide64, WordLayout::Split32] {
            let handler = fast_path(layout);
            let object = Object::new();

            handler.monitor_enter(&object);
            let hash = handler.make_hash_code(&object);
            handler.monitor_exit(&object).unwrap();

            handler.before_garbage_collection();
            handler.after_garbage_collection();
            assert_eq!(handler.make_hash_code(&object), hash);
        }
    }

    #[test]
    fn speculative_binding_rolls_back() {
        let manager = manager(WordLayout::Wide64);
        manager.initialize(Phase::Bootstrapping);
        let object = Object::new();
        let free = manager.unbound_count();
        {
            let mut speculative = SpeculativeBinding::new(&manager);
            let monitor = speculative.monitor(&object);
            assert!(monitor.is_owned_by(&Thread::current()));
            assert_eq!(manager.unbound_count(), free - 1);
        }
        assert_eq!(manager.unbound_count(), free);
    }

    #[test]
    fn prepare_mirrors_held_thin_lock() {
        for layout in [WordLayout::Wide64, WordLayout::Split32] {
            let delegate = thin_delegate(layout);
            let object = Object::new();
            let owner = Thread::current();

            let mut thin = ThinLockword::unlocked_from_hashcode(layout, 0).as_locked_once_by(owner.id());
            for _ in 1..MAX_RECURSION_COUNT {
                thin = thin.increment_count();
            }
            let prepared = delegate.prepare_modal_lockword(&object, thin.into());
            let monitor = delegate.handler().prepared_monitor(prepared);
            assert!(monitor.is_owned_by(&owner));
            assert_eq!(monitor.recursion_count(), MAX_RECURSION_COUNT);
            assert_eq!(monitor.displaced_misc(), thin.as_unlocked().raw());

            let unlocked = thin.as_unlocked();
            let again = delegate.reprepare_modal_lockword(prepared, unlocked.into(), ModalLockword::default());
            assert_eq!(again, prepared);
            assert_eq!(monitor.owner_id(), 0);

            delegate.cancel_prepared_modal_lockword(prepared);
            assert!(!monitor.is_bound());
        }
    }

    #[test]
    fn delegate_reports_not_this_mode_for_thin_words() {
        let delegate = thin_delegate(WordLayout::Wide64);
        let object = Object::new();
        let me = Thread::current();
        let lockword = ModalLockword::from(object.header().read_misc());
        assert_eq!(delegate.delegate_make_hashcode(&object, lockword), None);
        assert!(!delegate.delegate_monitor_enter(&object, lockword, me.id()));
        assert_eq!(
            delegate.delegate_thread_holds_monitor(&object, lockword, &me),
            DelegatedThreadHoldsMonitorResult::NotThisMode
        );
        assert_eq!(
            delegate.delegate_monitor_exit(&object, lockword),
            Err(MonitorError::IllegalMonitorState)
        );
    }

    #[test]
    fn biased_delegate_deflates_to_anonymous_bias() {
        let manager = manager(WordLayout::Wide64);
        let delegate = InflatedMonitorModeHandler::as_biased_lock_delegate(manager.clone());
        delegate.initialize(Phase::Bootstrapping);
        manager.initialize(Phase::Bootstrapping);

        let object = Object::new();
        let me = Thread::current();
        let biased = BiasedLockword::anon_biased_from_hashcode(1234)
            .as_biased_to(me.id())
            .increment_count();
        object.header().write_misc(biased.raw());

        let _scope = manager.mutator_scope();
        let prepared = delegate.prepare_modal_lockword(&object, biased.into());
        let witness = object.header().compare_and_swap_misc(biased.raw(), prepared.raw());
        assert_eq!(witness, biased.raw());
        drop(_scope);

        assert_eq!(
            delegate.delegate_thread_holds_monitor(&object, prepared, &me),
            DelegatedThreadHoldsMonitorResult::True
        );
        assert_eq!(delegate.delegate_make_hashcode(&object, prepared), Some(1234));
        delegate.delegate_monitor_exit(&object, prepared).unwrap();

        delegate.delegate_before_garbage_collection();
        delegate.delegate_after_garbage_collection();
        let restored = BiasedLockword::from(object.header().read_misc());
        assert_eq!(restored, BiasedLockword::anon_biased_from_hashcode(1234));
    }

    #[test]
    #[should_panic]
    fn biased_delegate_needs_wide_layout() {
        InflatedMonitorModeHandler::as_biased_lock_delegate(manager(WordLayout::Split32));
    }
}
