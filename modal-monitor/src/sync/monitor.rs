use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use atomic::Atomic;
use parking_lot::{Condvar, Mutex};

use super::{
    error::{MonitorError, MonitorResult},
    lockword::MonitorHandle,
};
use crate::{
    object_model::{Object, ObjectRef},
    threading::{Thread, ThreadState, THREAD_MANAGER},
};

/// Binding status of a pooled monitor, consulted by GC-time deflation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum BindingProtection {
    /// Free, or bound one-way: the monitor points to the object but the
    /// object does not know the monitor yet.
    #[default]
    PreAcquire,
    /// Bound both ways and not owned. May be unbound at the next GC.
    Unprotected,
    /// Bound both ways and owned or pinned by a thread.
    Protected,
}

unsafe impl bytemuck::NoUninit for BindingProtection {}

struct MonitorState {
    /// Threads blocked entering the monitor.
    entrants: usize,
    /// Tickets of waiting threads that were not notified yet, oldest first.
    waiters: VecDeque<u64>,
    next_ticket: u64,
}

/// Heavyweight monitor that can be bound to an object.
///
/// Ownership is tracked by thread id in `holder` together with the recursion
/// count. Both are only written while `state` is locked, but may be read
/// without it: a thread only ever observes its own id there while it really
/// owns the monitor.
pub struct JavaMonitor {
    handle: MonitorHandle,
    state: Mutex<MonitorState>,
    entry_cvar: Condvar,
    wait_cvar: Condvar,
    holder: AtomicU32,
    rec_count: AtomicU32,
    displaced_misc: AtomicU64,
    displaced_hash: AtomicU64,
    bound_object: Mutex<Option<Weak<Object>>>,
    protection: Atomic<BindingProtection>,
    requires_post_gc_refresh: AtomicBool,
    proxy_acquirable: bool,
    sticky: bool,
}

impl JavaMonitor {
    pub(crate) fn new(handle: MonitorHandle, proxy_acquirable: bool, sticky: bool) -> Self {
        Self {
            handle,
            state: Mutex::new(MonitorState {
                entrants: 0,
                waiters: VecDeque::new(),
                next_ticket: 0,
            }),
            entry_cvar: Condvar::new(),
            wait_cvar: Condvar::new(),
            holder: AtomicU32::new(0),
            rec_count: AtomicU32::new(0),
            displaced_misc: AtomicU64::new(0),
            displaced_hash: AtomicU64::new(0),
            bound_object: Mutex::new(None),
            protection: Atomic::new(BindingProtection::PreAcquire),
            requires_post_gc_refresh: AtomicBool::new(false),
            proxy_acquirable,
            sticky,
        }
    }

    pub fn handle(&self) -> MonitorHandle {
        self.handle
    }

    pub fn is_proxy_acquirable(&self) -> bool {
        self.proxy_acquirable
    }

    pub fn is_sticky(&self) -> bool {
        self.sticky
    }

    /// Acquire the monitor for the calling thread, blocking while another
    /// thread owns it.
    pub fn monitor_enter(&self) {
        let thread = Thread::current();
        let me = thread.id();
        if self.holder.load(Ordering::Relaxed) == me {
            self.rec_count.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut state = self.state.lock();
        if self.holder.load(Ordering::Relaxed) != 0 {
            thread.set_exec_status(ThreadState::Blocked);
            state.entrants += 1;
            while self.holder.load(Ordering::Relaxed) != 0 {
                self.entry_cvar.wait(&mut state);
            }
            state.entrants -= 1;
            thread.set_exec_status(ThreadState::Running);
        }
        self.holder.store(me, Ordering::Relaxed);
        self.rec_count.store(1, Ordering::Relaxed);
        self.set_binding_protection(BindingProtection::Protected);
    }

    pub fn monitor_exit(&self) -> MonitorResult {
        let me = Thread::current_id();
        if self.holder.load(Ordering::Relaxed) != me {
            return Err(MonitorError::IllegalMonitorState);
        }
        let count = self.rec_count.load(Ordering::Relaxed);
        if count > 1 {
            self.rec_count.store(count - 1, Ordering::Relaxed);
            return Ok(());
        }

        let state = self.state.lock();
        self.rec_count.store(0, Ordering::Relaxed);
        self.holder.store(0, Ordering::Relaxed);
        self.set_binding_protection(BindingProtection::Unprotected);
        if state.entrants > 0 {
            self.entry_cvar.notify_one();
        }
        Ok(())
    }

    /// Wait until notified, interrupted or `timeout_ms` milliseconds have
    /// passed. A zero timeout waits forever.
    ///
    /// The monitor is released completely for the duration of the wait and
    /// re-acquired with the same recursion count before returning, also when
    /// the wait fails with [`MonitorError::Interrupted`]. A waiter that was
    /// already notified when the interrupt arrived returns `Ok` and keeps the
    /// interrupt pending.
    pub fn monitor_wait(self: &Arc<Self>, timeout_ms: u64) -> MonitorResult {
        let thread = Thread::current();
        let me = thread.id();
        if self.holder.load(Ordering::Relaxed) != me {
            return Err(MonitorError::IllegalMonitorState);
        }

        let mut state = self.state.lock();
        {
            let mut park = thread.park_state().lock();
            if park.interrupted {
                park.interrupted = false;
                return Err(MonitorError::Interrupted);
            }
            park.parked_on = Some(self.clone());
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiters.push_back(ticket);

        let saved_count = self.rec_count.swap(0, Ordering::Relaxed);
        self.holder.store(0, Ordering::Relaxed);
        if state.entrants > 0 {
            self.entry_cvar.notify_one();
        }

        thread.set_exec_status(ThreadState::Waiting);
        let deadline = (timeout_ms != 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));
        loop {
            if !state.waiters.contains(&ticket) || thread.park_state().lock().interrupted {
                break;
            }
            match deadline {
                None => self.wait_cvar.wait(&mut state),
                Some(deadline) => {
                    if self.wait_cvar.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
        let notified = match state.waiters.iter().position(|&t| t == ticket) {
            Some(pos) => {
                state.waiters.remove(pos);
                false
            }
            None => true,
        };

        thread.set_exec_status(ThreadState::Blocked);
        if self.holder.load(Ordering::Relaxed) != 0 {
            state.entrants += 1;
            while self.holder.load(Ordering::Relaxed) != 0 {
                self.entry_cvar.wait(&mut state);
            }
            state.entrants -= 1;
        }
        self.holder.store(me, Ordering::Relaxed);
        self.rec_count.store(saved_count, Ordering::Relaxed);
        self.set_binding_protection(BindingProtection::Protected);
        thread.set_exec_status(ThreadState::Running);

        let interrupted = {
            let mut park = thread.park_state().lock();
            park.parked_on = None;
            !notified && std::mem::replace(&mut park.interrupted, false)
        };
        drop(state);

        if interrupted {
            Err(MonitorError::Interrupted)
        } else {
            Ok(())
        }
    }

    pub fn monitor_notify(&self, all: bool) -> MonitorResult {
        if self.holder.load(Ordering::Relaxed) != Thread::current_id() {
            return Err(MonitorError::IllegalMonitorState);
        }
        let mut state = self.state.lock();
        if all {
            state.waiters.clear();
        } else {
            state.waiters.pop_front();
        }
        self.wait_cvar.notify_all();
        Ok(())
    }

    /// Wake every waiter so it can re-check its interrupt flag.
    pub(crate) fn wake_waiters(&self) {
        let _state = self.state.lock();
        self.wait_cvar.notify_all();
    }

    /// Make `owner` hold the monitor `rcount` times without that thread taking
    /// part. Only legal before the monitor is visible to other threads.
    pub fn monitor_private_acquire(&self, owner: u32, rcount: u32) {
        assert!(
            self.proxy_acquirable,
            "{self:?} does not support proxy acquisition"
        );
        let _state = self.state.lock();
        self.holder.store(owner, Ordering::Relaxed);
        self.rec_count.store(rcount, Ordering::Relaxed);
        self.set_binding_protection(BindingProtection::Protected);
    }

    pub fn monitor_private_release(&self) {
        assert!(
            self.proxy_acquirable,
            "{self:?} does not support proxy acquisition"
        );
        let _state = self.state.lock();
        self.holder.store(0, Ordering::Relaxed);
        self.rec_count.store(0, Ordering::Relaxed);
    }

    pub fn is_owned_by(&self, thread: &Thread) -> bool {
        self.holder.load(Ordering::Relaxed) == thread.id()
    }

    /// Id of the owning thread, 0 if unowned.
    pub fn owner_id(&self) -> u32 {
        self.holder.load(Ordering::Relaxed)
    }

    pub fn owner(&self) -> Option<Arc<Thread>> {
        THREAD_MANAGER.thread_for_id(self.owner_id())
    }

    pub fn recursion_count(&self) -> u32 {
        self.rec_count.load(Ordering::Relaxed)
    }

    /// No owner, no waiters and no threads blocked entering.
    pub fn is_quiescent(&self) -> bool {
        let state = self.state.lock();
        self.holder.load(Ordering::Relaxed) == 0 && state.entrants == 0 && state.waiters.is_empty()
    }

    pub fn displaced_misc(&self) -> u64 {
        self.displaced_misc.load(Ordering::Acquire)
    }

    pub fn set_displaced_misc(&self, word: u64) {
        self.displaced_misc.store(word, Ordering::Release);
    }

    /// Returns the witnessed value: equal to `expected` on success.
    pub fn compare_and_swap_displaced_misc(&self, expected: u64, new: u64) -> u64 {
        match self.displaced_misc.compare_exchange(
            expected,
            new,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(witness) | Err(witness) => witness,
        }
    }

    pub fn displaced_hash(&self) -> u64 {
        self.displaced_hash.load(Ordering::Acquire)
    }

    pub fn set_displaced_hash(&self, word: u64) {
        self.displaced_hash.store(word, Ordering::Release);
    }

    pub fn compare_and_swap_displaced_hash(&self, expected: u64, new: u64) -> u64 {
        match self.displaced_hash.compare_exchange(
            expected,
            new,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(witness) | Err(witness) => witness,
        }
    }

    pub fn bound_object(&self) -> Option<ObjectRef> {
        self.bound_object.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Bound at all, even if the object died since.
    pub fn is_bound(&self) -> bool {
        self.bound_object.lock().is_some()
    }

    pub(crate) fn set_bound_object(&self, object: &ObjectRef) {
        *self.bound_object.lock() = Some(Arc::downgrade(object));
    }

    pub fn binding_protection(&self) -> BindingProtection {
        self.protection.load(atomic::Ordering::Relaxed)
    }

    pub(crate) fn set_binding_protection(&self, protection: BindingProtection) {
        self.protection.store(protection, atomic::Ordering::Relaxed);
    }

    pub(crate) fn requires_post_gc_refresh(&self) -> bool {
        self.requires_post_gc_refresh.load(Ordering::Relaxed)
    }

    pub(crate) fn set_requires_post_gc_refresh(&self, value: bool) {
        self.requires_post_gc_refresh.store(value, Ordering::Relaxed);
    }

    /// Back to the state of a monitor in the free pool.
    pub(crate) fn reset(&self) {
        let state = self.state.lock();
        debug_assert!(state.waiters.is_empty() && state.entrants == 0);
        self.holder.store(0, Ordering::Relaxed);
        self.rec_count.store(0, Ordering::Relaxed);
        self.displaced_misc.store(0, Ordering::Relaxed);
        self.displaced_hash.store(0, Ordering::Relaxed);
        *self.bound_object.lock() = None;
        self.set_binding_protection(BindingProtection::PreAcquire);
        self.set_requires_post_gc_refresh(false);
    }
}

impl fmt::Debug for JavaMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JavaMonitor")
            .field("handle", &self.handle)
            .field("owner", &self.owner_id())
            .field("rcount", &self.recursion_count())
            .field("protection", &self.binding_protection())
            .field("displaced_misc", &format_args!("{:#x}", self.displaced_misc()))
            .field("displaced_hash", &format_args!("{:#x}", self.displaced_hash()))
            .finish()
    }
}
