// byte-level channel. the typed API and select are built on top of this.
//
// every field that matters lives in Locked behind the channel mutex. a few of them are mirrored
// into atomics, written only while holding the lock, so that non-blocking operations can bail
// without locking.

use super::{
    error::{fatal, Fatal, NewChannelError},
    waiter::{DataSlot, Dir, WaitQueue, WaitToken, Waiter, WaiterArena, WaiterKey},
};
use crate::{
    runtime::Runtime,
    sched::{LockSet, ParkReason},
};
use smallvec::SmallVec;
use std::{
    fmt::{self, Debug, Formatter},
    mem,
    ptr::NonNull,
    sync::{
        atomic::{
            Ordering::{Acquire, Release},
            AtomicBool,
            AtomicUsize,
        },
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    thread,
    time::Instant,
};


// element sizes must be strictly below this.
const MAX_ELEMENT_SIZE: usize = 1 << 16;


/// Bounded channel of fixed-size elements, moved as raw bytes
///
/// A capacity of 0 makes the channel unbuffered: every send completes only by handing its value
/// directly to a receiver. Most users want the typed [`Chan`](crate::Chan) instead.
///
/// Data is passed by pointer. Operations that take pointers are `unsafe`: the caller guarantees
/// that every pointer is valid for [`element_size`](Self::element_size) bytes of reads (sends)
/// or writes (receives) until the call returns.
pub struct RawChannel {
    capacity: usize,
    element_size: usize,
    rt: Runtime,
    lockable: Mutex<Locked>,

    // mirror of Locked.closed. monotonic.
    closed: AtomicBool,
    // mirror of Locked.count.
    count: AtomicUsize,
    // mirror of !Locked.recvq.is_empty().
    recv_waiting: AtomicBool,
    // mirror of !Locked.sendq.is_empty().
    send_waiting: AtomicBool,
}

// channel lockable state.
pub(crate) struct Locked {
    // ring storage of capacity * element_size bytes.
    buf: Box<[u8]>,
    // number of filled slots. invariant: count <= capacity.
    count: usize,
    // next slot to write. invariant: send_idx < capacity if capacity > 0.
    send_idx: usize,
    // next slot to read. invariant: recv_idx < capacity if capacity > 0.
    recv_idx: usize,
    // once true, never false again.
    closed: bool,
    arena: WaiterArena,
    sendq: WaitQueue,
    recvq: WaitQueue,
}

impl RawChannel {
    /// Construct with the global [`Runtime`], panicking if the shape is unsupported
    pub fn new(capacity: usize, element_size: usize) -> Self {
        Self::with_runtime(capacity, element_size, Runtime::global().clone())
    }

    /// Construct with a custom [`Runtime`], panicking if the shape is unsupported
    pub fn with_runtime(capacity: usize, element_size: usize, rt: Runtime) -> Self {
        match Self::try_with_runtime(capacity, element_size, rt) {
            Ok(chan) => chan,
            Err(e) => panic!("{}", e),
        }
    }

    /// Construct with the global [`Runtime`]
    pub fn try_new(capacity: usize, element_size: usize) -> Result<Self, NewChannelError> {
        Self::try_with_runtime(capacity, element_size, Runtime::global().clone())
    }

    /// Construct with a custom [`Runtime`]
    ///
    /// Fails if `element_size` is not below 64 KiB or if the buffer would exceed `isize::MAX`
    /// bytes.
    pub fn try_with_runtime(
        capacity: usize,
        element_size: usize,
        rt: Runtime,
    ) -> Result<Self, NewChannelError> {
        if element_size >= MAX_ELEMENT_SIZE {
            return Err(NewChannelError::ElementTooLarge(element_size));
        }
        let buf_len = capacity
            .checked_mul(element_size)
            .filter(|&n| n <= isize::MAX as usize)
            .ok_or(NewChannelError::CapacityOutOfRange { capacity, element_size })?;
        debug!(capacity, element_size, "creating channel");
        Ok(RawChannel {
            capacity,
            element_size,
            rt,
            lockable: Mutex::new(Locked {
                buf: vec![0; buf_len].into_boxed_slice(),
                count: 0,
                send_idx: 0,
                recv_idx: 0,
                closed: false,
                arena: WaiterArena::new(),
                sendq: WaitQueue::new(Dir::Send),
                recvq: WaitQueue::new(Dir::Recv),
            }),
            closed: AtomicBool::new(false),
            count: AtomicUsize::new(0),
            recv_waiting: AtomicBool::new(false),
            send_waiting: AtomicBool::new(false),
        })
    }

    /// Number of buffer slots, 0 if unbuffered
    pub fn cap(&self) -> usize {
        self.capacity
    }

    /// Number of buffered elements
    pub fn len(&self) -> usize {
        self.count.load(Acquire)
    }

    /// Whether no elements are buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size in bytes of one element
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// Whether the channel has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Acquire)
    }

    /// The runtime this channel was constructed with
    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    // address used as this channel's identity for lock ordering and instrumentation.
    pub(crate) fn addr(&self) -> usize {
        self as *const Self as usize
    }

    // lock the channel. no panic is raised while the lock is held, but a scheduler may unwind
    // out of park_unlock with locks still in its LockSet, which poisons them with the state
    // intact.
    pub(crate) fn lock(&self) -> Lock<'_> {
        Lock {
            chan: self,
            state: self.lockable.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    // whether a send could not proceed right now, judged without locking.
    fn send_not_ready(&self) -> bool {
        if self.capacity == 0 {
            !self.recv_waiting.load(Acquire)
        } else {
            self.count.load(Acquire) == self.capacity
        }
    }

    // whether a receive could not proceed right now, judged without locking.
    fn recv_not_ready(&self) -> bool {
        if self.capacity == 0 {
            !self.send_waiting.load(Acquire)
        } else {
            self.count.load(Acquire) == 0
        }
    }

    /// Send the element at `src`
    ///
    /// If `block` is false and the send cannot complete immediately, returns false. Otherwise
    /// blocks until the element is buffered or handed to a receiver and returns true.
    ///
    /// Panics with "send on closed channel" if the channel is closed, or becomes closed while
    /// the unbuffered send is blocked.
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads of `element_size` bytes until this returns. On success the
    /// bytes have been moved into the channel.
    pub unsafe fn send(&self, src: NonNull<u8>, block: bool) -> bool {
        match self.send_inner(src, block) {
            Ok(sent) => sent,
            Err(f) => fatal(f),
        }
    }

    // send, reporting a closed channel as an error instead of panicking, so that a typed caller
    // still owns its value when the error is raised. the bytes at src were never moved in that
    // case.
    pub(crate) unsafe fn send_inner(&self, src: NonNull<u8>, block: bool) -> Result<bool, Fatal> {
        self.rt.instrument().read(src.as_ptr() as usize, self.element_size);

        // a closed channel cannot become not-closed again, and a channel that is not ready for
        // sending cannot become ready without a partner taking the lock. so if we observe
        // not-closed and not-ready, there was a moment where both held, and we may report that
        // moment.
        if !block && !self.closed.load(Acquire) && self.send_not_ready() {
            return Ok(false);
        }

        let mut lock = self.lock();
        if lock.closed() {
            return Err(Fatal::SendOnClosed);
        }

        if self.capacity == 0 {
            if let Some(waiter) = lock.pop_waiter(Dir::Recv) {
                drop(lock);
                self.handoff_to_receiver(&waiter, src);
                return Ok(true);
            }
            if !block {
                return Ok(false);
            }

            // no receiver available: block on this channel.
            let token = self.park(lock, Dir::Send, DataSlot::new(Some(src)), ParkReason::ChanSend);

            // someone woke us up.
            return match token.woken() {
                Some((0, true)) => Ok(true),
                Some((0, false)) => {
                    if !self.is_closed() {
                        fatal(Fatal::SpuriousWakeup("chansend"));
                    }
                    Err(Fatal::SendOnClosed)
                }
                Some(_) => fatal(Fatal::CorruptWaitList),
                None => fatal(Fatal::SpuriousWakeup("chansend")),
            };
        }

        // wait for some space to write our data.
        while lock.count() == self.capacity {
            if !block {
                return Ok(false);
            }
            let token = self.park(lock, Dir::Send, DataSlot::none(), ParkReason::ChanSend);
            self.check_retry_wake(&token, "chansend");

            // someone woke us up - try again.
            lock = self.lock();
            if lock.closed() {
                return Err(Fatal::SendOnClosed);
            }
        }

        lock.buffer_push(src);
        let waiter = lock.pop_waiter(Dir::Recv);
        drop(lock);
        if let Some(waiter) = waiter {
            self.wake(&waiter, false);
        }
        Ok(true)
    }

    /// Shorthand for a non-blocking [`send`](Self::send)
    ///
    /// # Safety
    ///
    /// Same as [`send`](Self::send).
    pub unsafe fn try_send(&self, src: NonNull<u8>) -> bool {
        self.send(src, false)
    }

    /// Receive an element into `dst`, or discard it if `dst` is none
    ///
    /// Returns `(selected, received)`:
    ///
    /// - `(false, false)` if `block` is false and nothing could be received immediately.
    /// - `(true, false)` if the channel is closed and drained. `dst` is zeroed.
    /// - `(true, true)` if an element was written to `dst`.
    ///
    /// # Safety
    ///
    /// `dst`, if some, must be valid for writes of `element_size` bytes until this returns.
    pub unsafe fn recv(&self, dst: Option<NonNull<u8>>, block: bool) -> (bool, bool) {
        // reversed order compared to send: a channel that is not ready for receiving can become
        // ready and then closed, so closed-ness must be observed after not-ready-ness.
        if !block && self.recv_not_ready() && !self.closed.load(Acquire) {
            return (false, false);
        }

        let mut lock = self.lock();
        if self.capacity == 0 {
            if lock.closed() {
                return self.recv_closed(lock, dst);
            }
            if let Some(waiter) = lock.pop_waiter(Dir::Send) {
                drop(lock);
                self.handoff_from_sender(&waiter, dst);
                return (true, true);
            }
            if !block {
                return (false, false);
            }

            // no sender available: block on this channel.
            let token = self.park(lock, Dir::Recv, DataSlot::new(dst), ParkReason::ChanRecv);

            // someone woke us up.
            return match token.woken() {
                // a sender already wrote to dst.
                Some((0, true)) => (true, true),
                Some((0, false)) => {
                    let lock = self.lock();
                    if !lock.closed() {
                        drop(lock);
                        fatal(Fatal::SpuriousWakeup("chanrecv"));
                    }
                    self.recv_closed(lock, dst)
                }
                Some(_) => fatal(Fatal::CorruptWaitList),
                None => fatal(Fatal::SpuriousWakeup("chanrecv")),
            };
        }

        // wait for some data to appear.
        while lock.count() == 0 {
            if lock.closed() {
                return self.recv_closed(lock, dst);
            }
            if !block {
                return (false, false);
            }
            let token = self.park(lock, Dir::Recv, DataSlot::none(), ParkReason::ChanRecv);
            self.check_retry_wake(&token, "chanrecv");

            // someone woke us up - try again.
            lock = self.lock();
        }

        lock.buffer_pop(dst);
        let waiter = lock.pop_waiter(Dir::Send);
        drop(lock);
        if let Some(waiter) = waiter {
            self.wake(&waiter, false);
        }
        (true, true)
    }

    /// Shorthand for a non-blocking [`recv`](Self::recv)
    ///
    /// # Safety
    ///
    /// Same as [`recv`](Self::recv).
    pub unsafe fn try_recv(&self, dst: Option<NonNull<u8>>) -> (bool, bool) {
        self.recv(dst, false)
    }

    /// Close the channel
    ///
    /// Every blocked receiver resolves as closed. Every blocked sender panics with "send on
    /// closed channel" on its own return path. Buffered elements remain receivable.
    ///
    /// Panics with "close of closed channel" if already closed.
    pub fn close(&self) {
        let mut lock = self.lock();
        if lock.closed() {
            drop(lock);
            fatal(Fatal::CloseOfClosed);
        }
        self.rt.instrument().release(self.addr());
        lock.set_closed();

        // release all readers, then all writers.
        let mut woken = SmallVec::<[Waiter; 8]>::new();
        while let Some(waiter) = lock.pop_waiter(Dir::Recv) {
            woken.push(waiter);
        }
        let receivers = woken.len();
        while let Some(waiter) = lock.pop_waiter(Dir::Send) {
            woken.push(waiter);
        }
        drop(lock);
        debug!(receivers, senders = woken.len() - receivers, "closed channel");
        for waiter in &woken {
            self.wake(waiter, false);
        }
    }

    // finish a receive from a closed, drained channel. releases the lock.
    unsafe fn recv_closed(&self, lock: Lock<'_>, dst: Option<NonNull<u8>>) -> (bool, bool) {
        drop(lock);
        self.clear_closed_slot(dst);
        (true, false)
    }

    // zero a receive slot for a receive that observed the channel closed. must not hold the lock.
    pub(crate) unsafe fn clear_closed_slot(&self, dst: Option<NonNull<u8>>) {
        self.rt.instrument().acquire(self.addr());
        if let Some(dst) = dst {
            self.rt.instrument().write(dst.as_ptr() as usize, self.element_size);
            self.rt.mover().typed_clear(dst.as_ptr(), self.element_size);
        }
    }

    // copy src directly into a dequeued receive waiter's slot and wake it. must not hold the
    // lock.
    pub(crate) unsafe fn handoff_to_receiver(&self, waiter: &Waiter, src: NonNull<u8>) {
        self.rt.instrument().release(self.addr());
        if let Some(dst) = waiter.slot.get() {
            self.rt.instrument().write(dst.as_ptr() as usize, self.element_size);
            self.rt.mover().typed_copy(dst.as_ptr(), src.as_ptr(), self.element_size);
        }
        trace!(task = waiter.token.task().id(), case = waiter.case, "handoff to receiver");
        self.wake(waiter, true);
    }

    // copy a dequeued send waiter's value directly into dst and wake it. must not hold the lock.
    pub(crate) unsafe fn handoff_from_sender(&self, waiter: &Waiter, dst: Option<NonNull<u8>>) {
        self.rt.instrument().acquire(self.addr());
        if let (Some(dst), Some(src)) = (dst, waiter.slot.get()) {
            self.rt.instrument().write(dst.as_ptr() as usize, self.element_size);
            self.rt.mover().typed_copy(dst.as_ptr(), src.as_ptr(), self.element_size);
        }
        trace!(task = waiter.token.task().id(), case = waiter.case, "handoff from sender");
        self.wake(waiter, true);
    }

    // record how a dequeued waiter is being woken and make its task ready.
    pub(crate) fn wake(&self, waiter: &Waiter, handoff: bool) {
        waiter.token.set_woken(waiter.case, handoff);
        self.rt.scheduler().ready(waiter.token.task());
    }

    // enqueue a waiter, atomically release the lock and suspend until some partner wakes us.
    fn park(
        &self,
        mut lock: Lock<'_>,
        dir: Dir,
        slot: DataSlot,
        reason: ParkReason,
    ) -> Arc<WaitToken> {
        let token = WaitToken::new(self.rt.scheduler().current_task(), false);
        let key = lock.push_waiter(dir, Waiter { token: Arc::clone(&token), case: 0, slot });
        let mut enqueued = Enqueued::new(&token);
        enqueued.push(self, dir, key);

        let mut locks = LockSet::empty();
        locks.push(lock);
        let parked_at = Instant::now();
        self.rt.scheduler().park_unlock(locks, reason);
        enqueued.disarm();
        trace!(%reason, blocked_for = ?parked_at.elapsed(), "resumed");
        token
    }

    // validate a wake of a buffered-channel waiter, which carries no data and only means "try
    // again".
    fn check_retry_wake(&self, token: &WaitToken, op: &'static str) {
        match token.woken() {
            Some((0, _)) => (),
            Some(_) => fatal(Fatal::CorruptWaitList),
            None => fatal(Fatal::SpuriousWakeup(op)),
        }
    }
}

impl Debug for RawChannel {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("RawChannel")
            .field("capacity", &self.capacity)
            .field("element_size", &self.element_size)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}


// the waiters a task enqueued before one park.
//
// if park_unlock unwinds instead of returning, dropping this unlinks every waiter still queued
// and then waits for any partner that already dequeued one to finish with it, so that nothing
// is copied into or out of a slot in an unwound frame.
pub(crate) struct Enqueued<'a> {
    token: Arc<WaitToken>,
    keys: SmallVec<[(&'a RawChannel, Dir, WaiterKey); 4]>,
}

impl<'a> Enqueued<'a> {
    pub(crate) fn new(token: &Arc<WaitToken>) -> Self {
        Enqueued { token: Arc::clone(token), keys: SmallVec::new() }
    }

    pub(crate) fn push(&mut self, chan: &'a RawChannel, dir: Dir, key: WaiterKey) {
        self.keys.push((chan, dir, key));
    }

    // parking returned normally. hands back the keys for the caller to clean up.
    pub(crate) fn disarm(mut self) -> SmallVec<[(&'a RawChannel, Dir, WaiterKey); 4]> {
        mem::take(&mut self.keys)
    }
}

impl<'a> Drop for Enqueued<'a> {
    fn drop(&mut self) {
        if self.keys.is_empty() {
            return;
        }
        // a select claims its own token first, so no partner can start on another case.
        let claimed = self.token.try_claim();
        let mut dequeued = false;
        for &(chan, dir, key) in &self.keys {
            dequeued |= chan.lock().remove_waiter(dir, key).is_none();
        }
        let partner = if self.token.is_select() { !claimed } else { dequeued };
        warn!(task = self.token.task().id(), partner, "parking unwound, unlinked waiters");
        if partner {
            // the partner dequeued us under the lock and wakes us right after its copy.
            while self.token.woken().is_none() {
                thread::yield_now();
            }
        }
    }
}


// lock on a channel.
pub(crate) struct Lock<'a> {
    chan: &'a RawChannel,
    state: MutexGuard<'a, Locked>,
}

impl<'a> Lock<'a> {
    pub(crate) fn closed(&self) -> bool {
        self.state.closed
    }

    pub(crate) fn count(&self) -> usize {
        self.state.count
    }

    // mark closed. the caller must then drain both queues.
    fn set_closed(&mut self) {
        self.state.closed = true;
        self.chan.closed.store(true, Release);
    }

    // address of a ring slot.
    fn slot_ptr(&mut self, idx: usize) -> *mut u8 {
        debug_assert!(idx < self.chan.capacity);
        // for zero-sized elements this is the dangling pointer of the empty buffer, which is
        // fine because copies of length 0 never dereference it.
        self.state.buf.as_mut_ptr().wrapping_add(idx * self.chan.element_size)
    }

    // copy an element into the next free ring slot. caller checked count < capacity.
    pub(crate) unsafe fn buffer_push(&mut self, src: NonNull<u8>) {
        debug_assert!(self.state.count < self.chan.capacity);
        let slot = self.slot_ptr(self.state.send_idx);
        let instrument = self.chan.rt.instrument();
        instrument.acquire(slot as usize);
        instrument.release(slot as usize);
        self.chan.rt.mover().typed_copy(slot, src.as_ptr(), self.chan.element_size);
        self.state.send_idx += 1;
        if self.state.send_idx == self.chan.capacity {
            self.state.send_idx = 0;
        }
        self.state.count += 1;
        self.chan.count.store(self.state.count, Release);
    }

    // move the oldest buffered element into dst, or drop its bytes if dst is none, and zero the
    // ring slot. caller checked count > 0.
    pub(crate) unsafe fn buffer_pop(&mut self, dst: Option<NonNull<u8>>) {
        debug_assert!(self.state.count > 0);
        let slot = self.slot_ptr(self.state.recv_idx);
        let instrument = self.chan.rt.instrument();
        instrument.acquire(slot as usize);
        instrument.release(slot as usize);
        let mover = self.chan.rt.mover();
        if let Some(dst) = dst {
            instrument.write(dst.as_ptr() as usize, self.chan.element_size);
            mover.typed_copy(dst.as_ptr(), slot, self.chan.element_size);
        }
        mover.typed_clear(slot, self.chan.element_size);
        self.state.recv_idx += 1;
        if self.state.recv_idx == self.chan.capacity {
            self.state.recv_idx = 0;
        }
        self.state.count -= 1;
        self.chan.count.store(self.state.count, Release);
    }

    // dequeue the first claimable waiter of the given direction.
    pub(crate) fn pop_waiter(&mut self, dir: Dir) -> Option<Waiter> {
        let Locked { arena, sendq, recvq, .. } = &mut *self.state;
        let waiter = match dir {
            Dir::Send => sendq.pop(arena),
            Dir::Recv => recvq.pop(arena),
        };
        self.sync_waiting(dir);
        waiter
    }

    // enqueue a waiter at the back of the given direction's queue.
    pub(crate) fn push_waiter(&mut self, dir: Dir, waiter: Waiter) -> WaiterKey {
        let Locked { arena, sendq, recvq, .. } = &mut *self.state;
        let key = match dir {
            Dir::Send => sendq.push(arena, waiter),
            Dir::Recv => recvq.push(arena, waiter),
        };
        self.sync_waiting(dir);
        key
    }

    // unlink a specific waiter, if it has not already been dequeued.
    pub(crate) fn remove_waiter(&mut self, dir: Dir, key: WaiterKey) -> Option<Waiter> {
        let Locked { arena, sendq, recvq, .. } = &mut *self.state;
        let waiter = match dir {
            Dir::Send => sendq.remove(arena, key),
            Dir::Recv => recvq.remove(arena, key),
        };
        self.sync_waiting(dir);
        waiter
    }

    fn sync_waiting(&self, dir: Dir) {
        match dir {
            Dir::Send => self.chan.send_waiting.store(!self.state.sendq.is_empty(), Release),
            Dir::Recv => self.chan.recv_waiting.store(!self.state.recvq.is_empty(), Release),
        }
    }
}
