//! Task scheduling boundary.
//!
//! The channel core never suspends anything itself. It asks a [`TaskScheduler`] for a handle to
//! the current task, hands it every lock it holds when it needs to park, and asks it to make
//! other tasks runnable again. [`ThreadScheduler`] is the default implementation, where every OS
//! thread is a task.

use crate::chan::{
    core::Lock,
    error::{fatal, Fatal},
};
use smallvec::SmallVec;
use std::{
    any::Any,
    fmt::{self, Debug, Formatter},
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc,
        Condvar,
        Mutex,
    },
};


/// Opaque handle to a suspendable task
///
/// The channel core only clones handles and passes them back to the scheduler that created them.
/// The payload is whatever the scheduler needs to resume the task.
#[derive(Clone)]
pub struct TaskHandle {
    id: u64,
    payload: Arc<dyn Any + Send + Sync>,
}

impl TaskHandle {
    /// Construct from a scheduler-assigned id and payload
    pub fn new(id: u64, payload: Arc<dyn Any + Send + Sync>) -> Self {
        TaskHandle { id, payload }
    }

    /// Scheduler-assigned id of the task
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Scheduler-specific payload
    pub fn payload(&self) -> &(dyn Any + Send + Sync) {
        &*self.payload
    }
}

impl Debug for TaskHandle {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish_non_exhaustive()
    }
}


/// Why a task is parking
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ParkReason {
    /// Blocked sending on a channel
    ChanSend,
    /// Blocked receiving from a channel
    ChanRecv,
    /// Blocked in a select over one or more channels
    Select,
    /// Select with no cases that could ever fire
    SelectNoCases,
}

impl ParkReason {
    /// Short human-readable description
    pub fn as_str(self) -> &'static str {
        match self {
            ParkReason::ChanSend => "chan send",
            ParkReason::ChanRecv => "chan receive",
            ParkReason::Select => "select",
            ParkReason::SelectNoCases => "select (no cases)",
        }
    }
}

impl fmt::Display for ParkReason {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


/// Set of channel locks held by a task about to park
///
/// A scheduler must call [`release`](Self::release) (or drop the set) as part of parking, after
/// it has arranged that a concurrent [`TaskScheduler::ready`] for the parking task cannot be
/// lost.
pub struct LockSet<'a> {
    // in acquisition order.
    locks: SmallVec<[Lock<'a>; 4]>,
}

impl<'a> LockSet<'a> {
    /// Construct holding no locks
    pub fn empty() -> Self {
        LockSet { locks: SmallVec::new() }
    }

    /// Number of locks held
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no locks are held
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Release all held locks, in reverse acquisition order
    pub fn release(mut self) {
        while let Some(lock) = self.locks.pop() {
            drop(lock);
        }
    }

    // append a lock. caller is responsible for acquiring in a globally consistent order.
    pub(crate) fn push(&mut self, lock: Lock<'a>) {
        self.locks.push(lock);
    }

    // borrow the lock at the given acquisition position.
    pub(crate) fn get_mut(&mut self, idx: usize) -> &mut Lock<'a> {
        &mut self.locks[idx]
    }
}

impl<'a> Drop for LockSet<'a> {
    fn drop(&mut self) {
        while let Some(lock) = self.locks.pop() {
            drop(lock);
        }
    }
}

impl<'a> Debug for LockSet<'a> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("LockSet").field("len", &self.locks.len()).finish()
    }
}


/// Suspend/resume service consumed by channels and selects
///
/// Contract: a [`ready`](Self::ready) targeting a task that is inside (or about to enter)
/// [`park_unlock`](Self::park_unlock) must never be lost. The task must either not suspend at
/// all or be resumed.
pub trait TaskScheduler: Send + Sync {
    /// Handle to the calling task
    fn current_task(&self) -> TaskHandle;

    /// Atomically release `locks` and suspend the calling task until it is made ready
    ///
    /// May unwind, for example to cancel the task. The interrupted operation then unlinks
    /// everything it enqueued before the unwind leaves it.
    fn park_unlock(&self, locks: LockSet<'_>, reason: ParkReason);

    /// Make a suspended task runnable
    fn ready(&self, task: &TaskHandle);
}


/// Scheduler where every OS thread is a task
///
/// Parking blocks the thread on a per-thread signal. A `ready` that arrives between releasing the
/// locks and blocking leaves the signal in the notified state, so the thread does not block at
/// all.
#[derive(Debug, Default, Copy, Clone)]
pub struct ThreadScheduler;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: TaskHandle = TaskHandle::new(
        NEXT_TASK_ID.fetch_add(1, Relaxed),
        Arc::new(Signal::new()),
    );
}

impl ThreadScheduler {
    // run f with the calling thread's task handle and signal.
    fn with_current<R>(f: impl FnOnce(&TaskHandle, &Signal) -> R) -> R {
        CURRENT.with(|task| match task.payload().downcast_ref::<Signal>() {
            Some(signal) => f(task, signal),
            None => fatal(Fatal::Unreachable("thread task payload is not a signal")),
        })
    }
}

impl TaskScheduler for ThreadScheduler {
    fn current_task(&self) -> TaskHandle {
        Self::with_current(|task, _| task.clone())
    }

    fn park_unlock(&self, locks: LockSet<'_>, reason: ParkReason) {
        Self::with_current(|task, signal| {
            trace!(task = task.id(), %reason, locks = locks.len(), "parking");
            // releasing before waiting is safe because the signal latches notifications.
            locks.release();
            signal.wait();
        })
    }

    fn ready(&self, task: &TaskHandle) {
        match task.payload().downcast_ref::<Signal>() {
            Some(signal) => signal.notify(),
            None => fatal(Fatal::ForeignTask),
        }
    }
}


// synchronization signal state
#[derive(Debug)]
enum State {
    Empty,
    Waiting,
    Notified,
}

// synchronization signal
#[derive(Debug)]
struct Signal {
    state: Mutex<State>,
    cond: Condvar,
}

impl Signal {
    fn new() -> Self {
        Signal {
            state: Mutex::new(State::Empty),
            cond: Condvar::new(),
        }
    }

    // block until notified, consuming the notification. returns immediately if a notification
    // is already latched.
    fn wait(&self) {
        let mut lock = self.state.lock().unwrap();
        if let State::Notified = &*lock {
            *lock = State::Empty;
            return;
        }
        debug_assert!(matches!(&*lock, State::Empty));
        *lock = State::Waiting;
        while let State::Waiting = &*lock {
            lock = self.cond.wait(lock).unwrap();
        }
    }

    // wake the waiting thread, or latch the notification if it is not waiting yet.
    fn notify(&self) {
        let mut lock = self.state.lock().unwrap();
        match &*lock {
            State::Notified => (),
            State::Empty => {
                *lock = State::Notified;
            }
            State::Waiting => {
                *lock = State::Empty;
                self.cond.notify_one();
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::mpsc,
        thread,
        time::Duration,
    };

    #[test]
    fn task_ids_are_per_thread() {
        let sched = ThreadScheduler;
        let a = sched.current_task();
        let b = sched.current_task();
        assert_eq!(a.id(), b.id());
        let c = thread::spawn(move || ThreadScheduler.current_task().id()).join().unwrap();
        assert_ne!(a.id(), c);
    }

    #[test]
    fn ready_before_park_is_not_lost() {
        let sched = ThreadScheduler;
        let me = sched.current_task();
        sched.ready(&me);
        // would block forever if the notification were dropped
        sched.park_unlock(LockSet::empty(), ParkReason::ChanRecv);
    }

    #[test]
    fn ready_wakes_parked_thread() {
        let (send, recv) = mpsc::channel();
        let join = thread::spawn(move || {
            send.send(ThreadScheduler.current_task()).unwrap();
            ThreadScheduler.park_unlock(LockSet::empty(), ParkReason::ChanSend);
        });
        let task = recv.recv().unwrap();
        thread::sleep(Duration::from_millis(20));
        ThreadScheduler.ready(&task);
        join.join().unwrap();
    }

    #[test]
    fn park_reason_display() {
        assert_eq!(ParkReason::SelectNoCases.to_string(), "select (no cases)");
        assert_eq!(ParkReason::ChanRecv.as_str(), "chan receive");
    }
}
