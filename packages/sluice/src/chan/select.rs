// multi-way select over raw channels.
//
// one execution runs:
//
// - pass 1: with every involved channel locked, walk the cases in a fresh random order and fire
//   the first one that can complete immediately.
// - default: if nothing fired and there is a default case, take it.
// - pass 2: enqueue one waiter per case, all sharing one claim, and park with every lock
//   released atomically.
// - pass 3: re-lock and unlink every waiter that no partner dequeued.
//
// if the partner that woke us handed data over directly, we are done. otherwise the wake was
// only a notification (buffer state changed or a channel closed) and we go back to pass 1.

use super::{
    core::{Enqueued, RawChannel},
    error::{fatal, Fatal},
    waiter::{DataSlot, Dir, WaitToken, Waiter},
};
use crate::{
    runtime::Runtime,
    sched::{LockSet, ParkReason},
};
use rand::Rng;
use smallvec::SmallVec;
use std::{
    ptr::NonNull,
    sync::Arc,
    time::Instant,
};


/// One operation of a [`RawSelect`]
///
/// A case with no channel (`chan: None`) never fires, like an operation on a nil channel.
#[derive(Debug, Copy, Clone)]
pub enum Case<'a> {
    /// Receive into `slot`, or discard the value if `slot` is none
    Recv {
        chan: Option<&'a RawChannel>,
        slot: Option<NonNull<u8>>,
    },
    /// Send the value at `slot`
    Send {
        chan: Option<&'a RawChannel>,
        slot: NonNull<u8>,
    },
    /// Fires if no other case can complete immediately
    Default,
}

impl<'a> Case<'a> {
    /// The channel this case operates on, if any
    pub fn chan(&self) -> Option<&'a RawChannel> {
        match *self {
            Case::Recv { chan, .. } | Case::Send { chan, .. } => chan,
            Case::Default => None,
        }
    }
}

/// Outcome of a [`RawSelect`] execution
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Selected {
    /// Index of the case that fired
    pub index: usize,
    /// For a receive case, whether a value was received (false if the channel was closed).
    /// Always false for send and default cases.
    pub received: bool,
}

/// Select over a set of raw channel operations
///
/// Exactly one case fires per [`execute`](Self::execute). When several cases are ready at once,
/// which one fires is chosen uniformly at random.
#[derive(Debug)]
pub struct RawSelect<'a> {
    cases: Vec<Case<'a>>,
    rt: Runtime,
}

impl<'a> RawSelect<'a> {
    /// Construct with the global [`Runtime`]
    pub fn new(cases: impl IntoIterator<Item = Case<'a>>) -> Self {
        Self::with_runtime(cases, Runtime::global().clone())
    }

    /// Construct with a custom [`Runtime`]
    ///
    /// Its scheduler must be the one the channels involved use.
    pub fn with_runtime(cases: impl IntoIterator<Item = Case<'a>>, rt: Runtime) -> Self {
        RawSelect {
            cases: cases.into_iter().collect(),
            rt,
        }
    }

    /// The cases, in index order
    pub fn cases(&self) -> &[Case<'a>] {
        &self.cases
    }

    /// Block until one case fires, drawing the poll order from the thread-local RNG
    ///
    /// With no channel cases and no default case, blocks forever.
    ///
    /// Panics with "send on closed channel" if a send case is chosen on a closed channel.
    ///
    /// # Safety
    ///
    /// Every case's slot must be valid for reads (send) or writes (receive) of its channel's
    /// element size until this returns. Only the slot of the case that fired is accessed.
    pub unsafe fn execute(&self) -> Selected {
        self.execute_with_rng(&mut rand::thread_rng())
    }

    /// Like [`execute`](Self::execute), with a caller-provided RNG
    ///
    /// # Safety
    ///
    /// Same as [`execute`](Self::execute).
    pub unsafe fn execute_with_rng<R: Rng + ?Sized>(&self, rng: &mut R) -> Selected {
        match self.execute_inner(rng) {
            Ok(selected) => selected,
            Err(f) => fatal(f),
        }
    }

    // execute, reporting a send case chosen on a closed channel as an error instead of
    // panicking. no slot was accessed in that case.
    pub(crate) unsafe fn execute_inner<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
    ) -> Result<Selected, Fatal> {
        let order = poll_order(self.cases.len(), rng);
        let chans = lock_order(&self.cases);
        let default = self.cases.iter().position(|case| matches!(case, Case::Default));

        if chans.is_empty() {
            if let Some(index) = default {
                return Ok(Selected { index, received: false });
            }
            // nothing can ever wake us.
            self.rt.scheduler().park_unlock(LockSet::empty(), ParkReason::SelectNoCases);
            fatal(Fatal::Unreachable("select with no cases resumed"));
        }

        for case in &self.cases {
            if let &Case::Send { chan: Some(chan), slot } = case {
                self.rt.instrument().read(slot.as_ptr() as usize, chan.element_size());
            }
        }

        loop {
            // pass 1 - look for something already waiting
            let mut held = lock_all(&chans);
            for &index in &order {
                if let Some(selected) = self.poll_case(index, &chans, &mut held)? {
                    return Ok(selected);
                }
            }

            if let Some(index) = default {
                drop(held);
                return Ok(Selected { index, received: false });
            }

            // pass 2 - enqueue on all channels
            let token = WaitToken::new(self.rt.scheduler().current_task(), true);
            let mut enqueued = Enqueued::new(&token);
            for (index, case) in self.cases.iter().enumerate() {
                let (chan, dir, slot) = match *case {
                    Case::Recv { chan: Some(chan), slot } => (chan, Dir::Recv, DataSlot::new(slot)),
                    Case::Send { chan: Some(chan), slot } => {
                        (chan, Dir::Send, DataSlot::new(Some(slot)))
                    }
                    _ => continue,
                };
                let key = held.get_mut(lock_index(&chans, chan)).push_waiter(dir, Waiter {
                    token: Arc::clone(&token),
                    case: index,
                    slot,
                });
                enqueued.push(chan, dir, key);
            }

            // wait for someone to wake us up
            let parked_at = Instant::now();
            self.rt.scheduler().park_unlock(held, ParkReason::Select);
            let blocked_for = parked_at.elapsed();
            let keys = enqueued.disarm();

            // pass 3 - dequeue from unsuccessful channels
            let mut held = lock_all(&chans);
            for &(chan, dir, key) in &keys {
                held.get_mut(lock_index(&chans, chan)).remove_waiter(dir, key);
            }
            drop(held);

            match token.woken() {
                Some((index, true)) if index < self.cases.len() => {
                    trace!(task = token.task().id(), index, ?blocked_for, "select resumed");
                    let received = matches!(self.cases[index], Case::Recv { .. });
                    return Ok(Selected { index, received });
                }
                Some((index, false)) if index < self.cases.len() => {
                    trace!(task = token.task().id(), index, ?blocked_for, "futile select wakeup");
                }
                Some(_) => fatal(Fatal::CorruptWaitList),
                None => fatal(Fatal::SpuriousWakeup("selectgo")),
            }
        }
    }

    // try to fire one case with every lock held. on success or error, releases every lock.
    unsafe fn poll_case(
        &self,
        index: usize,
        chans: &[&'a RawChannel],
        held: &mut LockSet<'a>,
    ) -> Result<Option<Selected>, Fatal> {
        match self.cases[index] {
            Case::Recv { chan: Some(chan), slot } => {
                let lock = held.get_mut(lock_index(chans, chan));
                if chan.cap() == 0 {
                    if let Some(waiter) = lock.pop_waiter(Dir::Send) {
                        release(held);
                        chan.handoff_from_sender(&waiter, slot);
                        return Ok(Some(Selected { index, received: true }));
                    }
                } else if lock.count() > 0 {
                    lock.buffer_pop(slot);
                    let waiter = lock.pop_waiter(Dir::Send);
                    release(held);
                    if let Some(waiter) = waiter {
                        chan.wake(&waiter, false);
                    }
                    return Ok(Some(Selected { index, received: true }));
                }
                if lock.closed() {
                    release(held);
                    chan.clear_closed_slot(slot);
                    return Ok(Some(Selected { index, received: false }));
                }
                Ok(None)
            }
            Case::Send { chan: Some(chan), slot } => {
                let lock = held.get_mut(lock_index(chans, chan));
                if lock.closed() {
                    release(held);
                    return Err(Fatal::SendOnClosed);
                }
                if chan.cap() == 0 {
                    if let Some(waiter) = lock.pop_waiter(Dir::Recv) {
                        release(held);
                        chan.handoff_to_receiver(&waiter, slot);
                        return Ok(Some(Selected { index, received: false }));
                    }
                } else if lock.count() < chan.cap() {
                    lock.buffer_push(slot);
                    let waiter = lock.pop_waiter(Dir::Recv);
                    release(held);
                    if let Some(waiter) = waiter {
                        chan.wake(&waiter, false);
                    }
                    return Ok(Some(Selected { index, received: false }));
                }
                Ok(None)
            }
            Case::Recv { chan: None, .. } | Case::Send { chan: None, .. } | Case::Default => {
                Ok(None)
            }
        }
    }
}

// uniformly random permutation of 0..n, built by insertion.
pub(crate) fn poll_order<R: Rng + ?Sized>(n: usize, rng: &mut R) -> SmallVec<[usize; 8]> {
    let mut order = SmallVec::with_capacity(n);
    for i in 0..n {
        let j = rng.gen_range(0..=i);
        order.push(i);
        order[i] = order[j];
        order[j] = i;
    }
    order
}

// distinct channels of the cases, sorted by address. every multi-channel lock acquisition in
// the process goes through this order.
pub(crate) fn lock_order<'a>(cases: &[Case<'a>]) -> SmallVec<[&'a RawChannel; 4]> {
    let mut chans = cases.iter().filter_map(Case::chan).collect::<SmallVec<[_; 4]>>();
    chans.sort_unstable_by_key(|chan| chan.addr());
    chans.dedup_by_key(|chan| chan.addr());
    chans
}

// position of a channel's lock within a lock set acquired in lock order.
fn lock_index(chans: &[&RawChannel], chan: &RawChannel) -> usize {
    chans
        .binary_search_by_key(&chan.addr(), |c| c.addr())
        .unwrap_or_else(|_| fatal(Fatal::Unreachable("select case channel missing from lock order")))
}

fn lock_all<'a>(chans: &[&'a RawChannel]) -> LockSet<'a> {
    let mut held = LockSet::empty();
    for chan in chans {
        held.push(chan.lock());
    }
    held
}

// release every lock in a set we only have by reference.
fn release(held: &mut LockSet<'_>) {
    std::mem::replace(held, LockSet::empty()).release();
}
