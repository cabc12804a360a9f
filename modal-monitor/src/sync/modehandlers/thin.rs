//! Thin locks: owner id and recursion count live in the misc word itself.
//! Contention, recursion overflow and `wait` inflate the lock through a
//! [`ModeDelegate`].

use std::sync::Arc;

use super::{DelegatedThreadHoldsMonitorResult, ModeDelegate, MonitorSchemeEntry};
use crate::{
    object_model::{create_hash_code, ObjectRef},
    options::Options,
    sync::{
        error::{MonitorError, MonitorResult},
        lockword::{HashableLockword, InflatedMonitorLockword, ModalLockword, ThinLockword, WordLayout},
        manager::JavaMonitorManager,
    },
    threading::Thread,
    Phase,
};

pub struct ThinLockModeHandler<D: ModeDelegate> {
    delegate: D,
    manager: Arc<JavaMonitorManager>,
    layout: WordLayout,
    thin_lock_retries: usize,
}

impl<D: ModeDelegate> ThinLockModeHandler<D> {
    pub fn new(delegate: D, manager: Arc<JavaMonitorManager>, options: &Options) -> Self {
        let layout = manager.layout();
        Self {
            delegate,
            manager,
            layout,
            thin_lock_retries: options.thin_lock_retries.max(1),
        }
    }

    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    /// Replace the thin lock word `lockword` of `object` with a bound
    /// inflated word. Returns the misc word now installed, which is a word
    /// inflated by another thread if that thread won the race.
    fn inflate(&self, object: &ObjectRef, lockword: ThinLockword) -> ModalLockword {
        let header = object.header();
        let _scope = self.manager.mutator_scope();
        let mut prepared = self.delegate.prepare_modal_lockword(object, lockword.into());
        let mut thin = lockword;
        loop {
            let handle = InflatedMonitorLockword::from(prepared).get_bound_monitor();
            let (misc, hash) = self.layout.bound_words(handle);
            let answer = ModalLockword::from(header.compare_and_swap_misc(thin.raw(), misc.raw()));
            if answer == ModalLockword::from(thin) {
                if !self.layout.is_64bit() {
                    self.install_bound_hashword(object, prepared, thin, hash);
                }
                log::trace!("inflated {object:?}");
                return misc.into();
            }
            if answer.is_inflated() {
                self.delegate.cancel_prepared_modal_lockword(prepared);
                return answer;
            }
            // New owner, new recursion count or a new hashcode.
            thin = ThinLockword::from(answer);
            let hashword = self.layout.read_hashword(header);
            prepared = self
                .delegate
                .reprepare_modal_lockword(prepared, answer, hashword.into());
        }
    }

    /// Second half of inflation on the 32-bit layout. Hashcodes may still be
    /// installed into the hash word until the bound word replaces it.
    fn install_bound_hashword(
        &self,
        object: &ObjectRef,
        mut prepared: ModalLockword,
        thin: ThinLockword,
        bound: InflatedMonitorLockword,
    ) {
        let header = object.header();
        let monitor = self
            .manager
            .monitor(InflatedMonitorLockword::from(prepared).get_bound_monitor());
        loop {
            let staged = monitor.displaced_hash();
            let witness = header.compare_and_swap_hash(staged, bound.raw());
            if witness == staged {
                return;
            }
            debug_assert!(!InflatedMonitorLockword::from(witness).is_bound());
            prepared = self
                .delegate
                .reprepare_modal_lockword(prepared, thin.into(), witness.into());
        }
    }

    fn slow_path_monitor_enter(&self, object: &ObjectRef, lockword: ModalLockword, thread_id: u32) {
        let header = object.header();
        let mut new_lockword = lockword;
        let mut retries = self.thin_lock_retries;
        loop {
            if ThinLockword::is_thin_lockword(new_lockword) {
                let thin = ThinLockword::from(new_lockword);
                if thin.lock_owner_id() == thread_id {
                    if !thin.count_overflow() {
                        let answer = header.compare_and_swap_misc(thin.raw(), thin.increment_count().raw());
                        if answer == thin.raw() {
                            return;
                        }
                        // Inflated, or a hashcode was installed.
                        new_lockword = answer.into();
                        continue;
                    }
                } else {
                    let unlocked = thin.as_unlocked();
                    let locked = unlocked.as_locked_once_by(thread_id);
                    let answer = header.compare_and_swap_misc(unlocked.raw(), locked.raw());
                    if answer == unlocked.raw() {
                        return;
                    }
                    new_lockword = answer.into();
                    retries -= 1;
                    if retries > 0 || !ThinLockword::is_thin_lockword(new_lockword) {
                        continue;
                    }
                }
                // Recursion overflow or too much contention.
                new_lockword = self.inflate(object, ThinLockword::from(new_lockword));
            }

            if self
                .delegate
                .delegate_monitor_enter(object, new_lockword, thread_id)
            {
                return;
            }
            // Deflated in the meantime.
            new_lockword = header.read_misc().into();
            retries = self.thin_lock_retries;
        }
    }

    fn slow_path_monitor_exit(
        &self,
        object: &ObjectRef,
        lockword: ModalLockword,
        thread_id: u32,
    ) -> MonitorResult {
        if !ThinLockword::is_thin_lockword(lockword) {
            // Cannot be deflated while we own it.
            return self.delegate.delegate_monitor_exit(object, lockword);
        }
        let header = object.header();
        let mut thin = ThinLockword::from(lockword);
        if thin.count_underflow() || thin.lock_owner_id() != thread_id {
            return Err(MonitorError::IllegalMonitorState);
        }
        loop {
            let answer = ModalLockword::from(
                header.compare_and_swap_misc(thin.raw(), thin.decrement_count().raw()),
            );
            if answer == ModalLockword::from(thin) {
                return Ok(());
            }
            if answer.is_inflated() {
                return self.delegate.delegate_monitor_exit(object, answer);
            }
            // A hashcode was installed.
            thin = ThinLockword::from(answer);
        }
    }

    fn read_hashword(&self, object: &ObjectRef) -> HashableLockword {
        self.layout.read_hashword(object.header()).into()
    }

    /// Hashcode of `object` given the misc word and hash word as last read,
    /// in that order.
    fn make_hash_code_from(
        &self,
        object: &ObjectRef,
        mut lockword: ModalLockword,
        mut hashword: HashableLockword,
    ) -> u32 {
        let layout = self.layout;
        let header = object.header();
        let mut new_hashcode = 0;
        loop {
            if ThinLockword::is_thin_lockword(lockword) {
                if InflatedMonitorLockword::from(hashword).is_bound() {
                    // Inflated after the misc word was read; the hash word
                    // now references the monitor.
                    lockword = header.read_misc().into();
                    hashword = self.read_hashword(object);
                    continue;
                }
                let carrier = match layout {
                    WordLayout::Wide64 => HashableLockword::from(lockword),
                    WordLayout::Split32 => hashword,
                };
                let hashcode = carrier.hashcode(layout);
                if hashcode != 0 {
                    return hashcode;
                }
                if new_hashcode == 0 {
                    new_hashcode = create_hash_code(layout);
                }
                let new = carrier.with_hashcode(layout, new_hashcode);
                let answer = match layout {
                    WordLayout::Wide64 => header.compare_and_swap_misc(carrier.raw(), new.raw()),
                    WordLayout::Split32 => header.compare_and_swap_hash(carrier.raw(), new.raw()),
                };
                if answer == carrier.raw() {
                    return new_hashcode;
                }
                // Another thread installed a hashcode, or the lock was inflated.
                lockword = header.read_misc().into();
                hashword = self.read_hashword(object);
                continue;
            }
            if let Some(hashcode) = self.delegate.delegate_make_hashcode(object, lockword) {
                return hashcode;
            }
            // Deflated in the meantime.
            lockword = header.read_misc().into();
            hashword = self.read_hashword(object);
        }
    }
}

impl<D: ModeDelegate> MonitorSchemeEntry for ThinLockModeHandler<D> {
    fn initialize(&self, phase: Phase) {
        self.delegate.initialize(phase);
    }

    fn create_misc(&self) -> ModalLockword {
        ThinLockword::unlocked_from_hashcode(self.layout, 0).into()
    }

    fn monitor_enter(&self, object: &ObjectRef) {
        let thread_id = Thread::current_id();
        let header = object.header();
        let lockword = ModalLockword::from(header.read_misc());
        if !ThinLockword::is_thin_lockword(lockword) {
            return self.slow_path_monitor_enter(object, lockword, thread_id);
        }
        let unlocked = ThinLockword::from(lockword).as_unlocked();
        let locked = unlocked.as_locked_once_by(thread_id);
        let answer = header.compare_and_swap_misc(unlocked.raw(), locked.raw());
        if answer != unlocked.raw() {
            self.slow_path_monitor_enter(object, answer.into(), thread_id);
        }
    }

    fn monitor_exit(&self, object: &ObjectRef) -> MonitorResult {
        let thread_id = Thread::current_id();
        let header = object.header();
        let lockword = ModalLockword::from(header.read_misc());
        if !ThinLockword::is_thin_lockword(lockword) {
            return self.slow_path_monitor_exit(object, lockword, thread_id);
        }
        let unlocked = ThinLockword::from(lockword).as_unlocked();
        let locked = unlocked.as_locked_once_by(thread_id);
        let answer = header.compare_and_swap_misc(locked.raw(), unlocked.raw());
        if answer == locked.raw() {
            Ok(())
        } else {
            self.slow_path_monitor_exit(object, answer.into(), thread_id)
        }
    }

    fn monitor_notify(&self, object: &ObjectRef, all: bool) -> MonitorResult {
        let lockword = ModalLockword::from(object.header().read_misc());
        if ThinLockword::is_thin_lockword(lockword) {
            let thin = ThinLockword::from(lockword);
            if thin.count_underflow() || thin.lock_owner_id() != Thread::current_id() {
                return Err(MonitorError::IllegalMonitorState);
            }
            // Nobody can be waiting on a thin lock.
            return Ok(());
        }
        self.delegate.delegate_monitor_notify(object, all, lockword)
    }

    fn monitor_wait(&self, object: &ObjectRef, timeout_ms: u64) -> MonitorResult {
        let lockword = ModalLockword::from(object.header().read_misc());
        if ThinLockword::is_thin_lockword(lockword) {
            let thin = ThinLockword::from(lockword);
            if thin.count_underflow() || thin.lock_owner_id() != Thread::current_id() {
                return Err(MonitorError::IllegalMonitorState);
            }
            let inflated = self.inflate(object, thin);
            // Owned by us, so it stays bound.
            return self.delegate.delegate_monitor_wait(object, timeout_ms, inflated);
        }
        self.delegate
            .delegate_monitor_wait(object, timeout_ms, lockword)
    }

    fn make_hash_code(&self, object: &ObjectRef) -> u32 {
        let lockword = ModalLockword::from(object.header().read_misc());
        let hashword = self.read_hashword(object);
        self.make_hash_code_from(object, lockword, hashword)
    }

    fn thread_holds_monitor(&self, object: &ObjectRef, thread: &Thread) -> bool {
        let mut lockword = ModalLockword::from(object.header().read_misc());
        loop {
            if ThinLockword::is_thin_lockword(lockword) {
                let thin = ThinLockword::from(lockword);
                return !thin.count_underflow() && thin.lock_owner_id() == thread.id();
            }
            match self
                .delegate
                .delegate_thread_holds_monitor(object, lockword, thread)
            {
                DelegatedThreadHoldsMonitorResult::True => return true,
                DelegatedThreadHoldsMonitorResult::False => return false,
                DelegatedThreadHoldsMonitorResult::NotThisMode => {}
            }
            lockword = object.header().read_misc().into();
        }
    }

    fn before_garbage_collection(&self) {
        self.delegate.delegate_before_garbage_collection();
    }

    fn after_garbage_collection(&self) {
        self.delegate.delegate_after_garbage_collection();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use super::*;
    use crate::{
        object_model::Object,
        sync::{
            lockword::MAX_RECURSION_COUNT,
            modehandlers::{InflatedMonitorModeHandler, ThinLockDelegate},
        },
    };

    fn handler(layout: WordLayout) -> ThinLockModeHandler<ThinLockDelegate> {
        let options = Options::default().with_layout(layout);
        let manager = Arc::new(JavaMonitorManager::new(&options));
        let delegate = InflatedMonitorModeHandler::as_thin_lock_delegate(manager.clone());
        let handler = ThinLockModeHandler::new(delegate, manager.clone(), &options);
        handler.initialize(Phase::Bootstrapping);
        manager.initialize(Phase::Bootstrapping);
        handler
    }

    fn is_inflated(object: &Object) -> bool {
        ModalLockword::from(object.header().read_misc()).is_inflated()
    }

    #[test]
    fn uncontended_locking_stays_thin() {
        for layout in [WordLayout::Wide64, WordLayout::Split32] {
            let handler = handler(layout);
            let object = Object::new();
            let me = Thread::current();

            handler.monitor_enter(&object);
            handler.monitor_enter(&object);
            let thin = ThinLockword::from(object.header().read_misc());
            assert_eq!(thin.lock_owner_id(), me.id());
            assert_eq!(thin.recursion_count(), 2);
            assert!(handler.thread_holds_monitor(&object, &me));
            handler.monitor_notify(&object, false).unwrap();

            handler.monitor_exit(&object).unwrap();
            handler.monitor_exit(&object).unwrap();
            assert!(!is_inflated(&object));
            assert!(ThinLockword::from(object.header().read_misc()).count_underflow());
            assert!(!handler.thread_holds_monitor(&object, &me));
        }
    }

    #[test]
    fn exit_without_enter_is_illegal() {
        let handler = handler(WordLayout::host());
        let object = Object::new();
        assert_eq!(handler.monitor_exit(&object), Err(MonitorError::IllegalMonitorState));
        assert_eq!(
            handler.monitor_notify(&object, true),
            Err(MonitorError::IllegalMonitorState)
        );
        assert_eq!(handler.monitor_wait(&object, 1), Err(MonitorError::IllegalMonitorState));
    }

    #[test]
    fn recursion_overflow_inflates() {
        for layout in [WordLayout::Wide64, WordLayout::Split32] {
            let handler = handler(layout);
            let object = Object::new();
            let depth = MAX_RECURSION_COUNT + 5;
            for _ in 0..depth {
                handler.monitor_enter(&object);
            }
            assert!(is_inflated(&object));
            assert!(handler.thread_holds_monitor(&object, &Thread::current()));
            for _ in 0..depth {
                handler.monitor_exit(&object).unwrap();
            }
            assert!(!handler.thread_holds_monitor(&object, &Thread::current()));
            assert_eq!(handler.monitor_exit(&object), Err(MonitorError::IllegalMonitorState));
        }
    }

    #[test]
    fn wait_inflates_and_times_out() {
        for layout in [WordLayout::Wide64, WordLayout::Split32] {
            let handler = handler(layout);
            let object = Object::new();
            handler.monitor_enter(&object);
            handler.monitor_enter(&object);
            handler.monitor_wait(&object, 5).unwrap();
            assert!(is_inflated(&object));
            assert!(handler.thread_holds_monitor(&object, &Thread::current()));
            handler.monitor_exit(&object).unwrap();
            handler.monitor_exit(&object).unwrap();

            handler.before_garbage_collection();
            handler.after_garbage_collection();
            assert!(!is_inflated(&object));
        }
    }

    #[test]
    fn thin_hash_code_survives_inflation() {
        for layout in [WordLayout::Wide64, WordLayout::Split32] {
            let handler = handler(layout);
            let object = Object::new();
            let hash = handler.make_hash_code(&object);

            handler.monitor_enter(&object);
            assert_eq!(handler.make_hash_code(&object), hash);
            handler.monitor_wait(&object, 1).unwrap();
            assert_eq!(handler.make_hash_code(&object), hash);
            handler.monitor_exit(&object).unwrap();

            handler.before_garbage_collection();
            handler.after_garbage_collection();
            assert!(!is_inflated(&object));
            assert_eq!(handler.make_hash_code(&object), hash);
        }
    }

    #[test]
    fn split_hash_code_from_stale_thin_word_follows_inflation() {
        let handler = handler(WordLayout::Split32);
        for prehashed in [false, true] {
            let object = Object::new();
            let before = prehashed.then(|| handler.make_hash_code(&object));
            let stale = ModalLockword::from(object.header().read_misc());
            assert!(ThinLockword::is_thin_lockword(stale));

            handler.monitor_enter(&object);
            handler.monitor_wait(&object, 1).unwrap();
            let hashword = handler.read_hashword(&object);
            assert!(InflatedMonitorLockword::from(hashword).is_bound());

            // Misc word read before the inflation, hash word after it.
            let hash = handler.make_hash_code_from(&object, stale, hashword);
            assert_eq!(handler.make_hash_code(&object), hash);
            if let Some(before) = before {
                assert_eq!(hash, before);
            }
            handler.monitor_exit(&object).unwrap();
        }
    }

    #[test]
    fn contention_inflates_with_proxy_ownership() {
        let handler = Arc::new(handler(WordLayout::host()));
        let object = Object::new();
        let barrier = Arc::new(Barrier::new(2));

        handler.monitor_enter(&object);
        let contender = {
            let handler = handler.clone();
            let object = object.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                handler.monitor_enter(&object);
                let holds = handler.thread_holds_monitor(&object, &Thread::current());
                handler.monitor_exit(&object).unwrap();
                holds
            })
        };
        barrier.wait();
        // The contender inflates on our behalf once it runs out of retries.
        while !is_inflated(&object) {
            std::thread::yield_now();
        }
        assert!(handler.thread_holds_monitor(&object, &Thread::current()));
        handler.monitor_exit(&object).unwrap();
        assert!(contender.join().unwrap());
    }
}
