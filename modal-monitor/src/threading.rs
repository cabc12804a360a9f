//! Thread registry.
//!
//! Native threads are attached lazily the first time they touch the monitor
//! subsystem. Each attached thread receives a small non-zero id that fits the
//! owner field of a lightweight lock word; ids are recycled once the thread
//! exits.

use std::{
    fmt,
    sync::{Arc, LazyLock},
};

use atomic::Atomic;
use parking_lot::Mutex;

use crate::sync::{
    lockword::{MonitorHandle, MAX_LOCK_OWNER_ID},
    monitor::JavaMonitor,
};

/// Coarse execution state of an attached thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ThreadState {
    #[default]
    New,
    /// Attached and running.
    Running,
    /// Blocked entering a monitor.
    Blocked,
    /// Parked in `wait` on a monitor.
    Waiting,
    /// Detached. The id may already belong to another thread.
    Terminated,
}

unsafe impl bytemuck::NoUninit for ThreadState {}

pub(crate) struct ParkState {
    pub(crate) interrupted: bool,
    pub(crate) parked_on: Option<Arc<JavaMonitor>>,
}

pub struct Thread {
    id: u32,
    name: Option<String>,
    exec_status: Atomic<ThreadState>,
    park: Mutex<ParkState>,
    /// Monitors pinned by this thread, tagged with the id of their manager.
    pins: Mutex<Vec<(u64, MonitorHandle)>>,
}

impl Thread {
    fn new(id: u32, name: Option<String>) -> Self {
        Self {
            id,
            name,
            exec_status: Atomic::new(ThreadState::New),
            park: Mutex::new(ParkState {
                interrupted: false,
                parked_on: None,
            }),
            pins: Mutex::new(Vec::new()),
        }
    }

    /// The calling thread, attaching it on first use.
    pub fn current() -> Arc<Thread> {
        CURRENT_THREAD.with(|attachment| attachment.0.clone())
    }

    /// Id of the calling thread. Never zero.
    pub fn current_id() -> u32 {
        CURRENT_THREAD.with(|attachment| attachment.0.id)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn get_exec_status(&self) -> ThreadState {
        self.exec_status.load(atomic::Ordering::Relaxed)
    }

    pub(crate) fn set_exec_status(&self, status: ThreadState) {
        self.exec_status.store(status, atomic::Ordering::Relaxed);
    }

    /// Interrupt the thread. A thread waiting on a monitor wakes up and its
    /// `wait` fails with `Interrupted`; otherwise the next `wait` does.
    pub fn interrupt(&self) {
        let parked_on = {
            let mut park = self.park.lock();
            park.interrupted = true;
            park.parked_on.clone()
        };
        log::trace!("interrupting thread #{}", self.id);
        if let Some(monitor) = parked_on {
            monitor.wake_waiters();
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.park.lock().interrupted
    }

    /// Clear the interrupt flag, returning its previous value.
    pub fn clear_interrupted(&self) -> bool {
        std::mem::replace(&mut self.park.lock().interrupted, false)
    }

    pub(crate) fn park_state(&self) -> &Mutex<ParkState> {
        &self.park
    }

    pub(crate) fn pin(&self, manager: u64, handle: MonitorHandle) {
        self.pins.lock().push((manager, handle));
    }

    pub(crate) fn unpin(&self, manager: u64, handle: MonitorHandle) {
        let mut pins = self.pins.lock();
        if let Some(pos) = pins.iter().rposition(|&pin| pin == (manager, handle)) {
            pins.swap_remove(pos);
        }
    }

    pub(crate) fn pinned_by(&self, manager: u64) -> Vec<MonitorHandle> {
        self.pins
            .lock()
            .iter()
            .filter(|(owner, _)| *owner == manager)
            .map(|&(_, handle)| handle)
            .collect()
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("exec_status", &self.get_exec_status())
            .finish()
    }
}

struct Attachment(Arc<Thread>);

impl Attachment {
    fn attach() -> Self {
        let name = std::thread::current().name().map(str::to_owned);
        let thread = THREAD_MANAGER.add_thread(name);
        thread.set_exec_status(ThreadState::Running);
        Self(thread)
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.0.set_exec_status(ThreadState::Terminated);
        THREAD_MANAGER.remove_thread(&self.0);
    }
}

thread_local! {
    static CURRENT_THREAD: Attachment = Attachment::attach();
}

pub static THREAD_MANAGER: LazyLock<ThreadManager> = LazyLock::new(ThreadManager::new);

pub struct ThreadManager {
    inner: Mutex<ThreadManagerInner>,
}

struct ThreadManagerInner {
    threads: Vec<Option<Arc<Thread>>>,
    free_thread_indices: Vec<usize>,
}

impl ThreadManager {
    fn new() -> Self {
        Self {
            inner: Mutex::new(ThreadManagerInner {
                threads: Vec::new(),
                free_thread_indices: Vec::new(),
            }),
        }
    }

    fn add_thread(&self, name: Option<String>) -> Arc<Thread> {
        let mut inner = self.inner.lock();
        let idx = inner
            .free_thread_indices
            .pop()
            .unwrap_or(inner.threads.len());
        let id = idx as u32 + 1;
        assert!(
            id <= MAX_LOCK_OWNER_ID,
            "thread id {id} does not fit a lock word"
        );
        let thread = Arc::new(Thread::new(id, name));
        if idx >= inner.threads.len() {
            inner.threads.push(Some(thread.clone()));
        } else {
            inner.threads[idx] = Some(thread.clone());
        }
        log::trace!("attached thread #{id} ({:?})", thread.name());
        thread
    }

    fn remove_thread(&self, thread: &Thread) {
        let mut inner = self.inner.lock();
        let idx = thread.id as usize - 1;
        inner.threads[idx] = None;
        inner.free_thread_indices.push(idx);
        log::trace!("detached thread #{}", thread.id);
    }

    pub fn thread_for_id(&self, id: u32) -> Option<Arc<Thread>> {
        if id == 0 {
            return None;
        }
        let inner = self.inner.lock();
        inner.threads.get(id as usize - 1).cloned().flatten()
    }

    /// Snapshot of the attached threads.
    pub fn threads(&self) -> impl Iterator<Item = Arc<Thread>> {
        let inner = self.inner.lock();
        inner
            .threads
            .clone()
            .into_iter()
            .flat_map(|t| t.into_iter())
    }
}
