// exposed API of typed channels

use super::{
    core::RawChannel,
    error::*,
};
use crate::runtime::Runtime;
use std::{
    fmt::{self, Debug, Formatter},
    marker::PhantomData,
    mem::{self, size_of, ManuallyDrop, MaybeUninit},
    ptr::NonNull,
    sync::Arc,
};


// ==== helpers for lending values to the raw channel ====


// a value whose bytes are lent to the raw channel for a send. never dropped implicitly: once
// the channel took it, or if parking unwinds after a receiver may have taken it, it is leaked.
struct Outgoing<T> {
    msg: ManuallyDrop<T>,
}

impl<T> Outgoing<T> {
    fn new(msg: T) -> Self {
        Outgoing { msg: ManuallyDrop::new(msg) }
    }

    fn ptr(&self) -> NonNull<u8> {
        NonNull::from(&*self.msg).cast()
    }

    // take the value back after the channel declined it.
    fn into_inner(self) -> T {
        ManuallyDrop::into_inner(self.msg)
    }

    // drop the value after the channel refused it for being closed.
    fn drop_value(mut self) {
        unsafe { ManuallyDrop::drop(&mut self.msg) };
    }
}

// receive into a fresh slot, returning whether a value was written, and the slot.
unsafe fn recv_into<T>(raw: &RawChannel, block: bool) -> ((bool, bool), MaybeUninit<T>) {
    let mut slot = MaybeUninit::<T>::uninit();
    let res = raw.recv(Some(NonNull::from(&mut slot).cast()), block);
    (res, slot)
}


// ==== the exposed API ====


/// Bounded multi-producer multi-consumer channel
///
/// With a capacity of 0 the channel is a rendezvous: each send blocks until a receiver takes the
/// value. Otherwise up to `capacity` values are buffered in FIFO order.
///
/// Handles are cheap to clone and all refer to the same channel. Closing is explicit, via
/// [`close`](Self::close), and is not tied to dropping handles. Values still buffered when the
/// last handle is dropped are dropped with it.
pub struct Chan<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    raw: RawChannel,
    _p: PhantomData<T>,
}

// values move between threads through the channel, but are never shared.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if !mem::needs_drop::<T>() {
            return;
        }
        // no task can be parked on us, they would be holding a handle.
        loop {
            match unsafe { recv_into::<T>(&self.raw, false) } {
                ((true, true), mut slot) => unsafe { slot.assume_init_drop() },
                _ => break,
            }
        }
    }
}

impl<T> Chan<T> {
    /// Construct with the global [`Runtime`]
    ///
    /// Panics if `T` is 64 KiB or larger.
    pub fn new(capacity: usize) -> Self {
        Self::with_runtime(capacity, Runtime::global().clone())
    }

    /// Construct with the global [`Runtime`], failing if the element type is unsupported
    pub fn try_new(capacity: usize) -> Result<Self, NewChannelError> {
        Self::try_with_runtime(capacity, Runtime::global().clone())
    }

    /// Construct with a custom [`Runtime`]
    ///
    /// Panics if `T` is 64 KiB or larger.
    pub fn with_runtime(capacity: usize, rt: Runtime) -> Self {
        match Self::try_with_runtime(capacity, rt) {
            Ok(chan) => chan,
            Err(e) => panic!("{}", e),
        }
    }

    /// Construct with a custom [`Runtime`], failing if the element type is unsupported
    pub fn try_with_runtime(capacity: usize, rt: Runtime) -> Result<Self, NewChannelError> {
        let raw = RawChannel::try_with_runtime(capacity, size_of::<T>(), rt)?;
        Ok(Chan {
            inner: Arc::new(Inner { raw, _p: PhantomData }),
        })
    }

    /// Send a value, blocking until it is buffered or taken by a receiver
    ///
    /// Panics with "send on closed channel" if the channel is closed, or becomes closed while an
    /// unbuffered send is blocked. The value is dropped in that case.
    pub fn send(&self, msg: T) {
        let out = Outgoing::new(msg);
        if let Err(f) = unsafe { self.inner.raw.send_inner(out.ptr(), true) } {
            out.drop_value();
            fatal(f);
        }
    }

    /// Send a value if that is possible without blocking
    ///
    /// Panics with "send on closed channel" if the channel is closed.
    pub fn try_send(&self, msg: T) -> Result<(), TrySendError<T>> {
        let out = Outgoing::new(msg);
        match unsafe { self.inner.raw.send_inner(out.ptr(), false) } {
            Ok(true) => Ok(()),
            Ok(false) => Err(TrySendError { msg: out.into_inner() }),
            Err(f) => {
                out.drop_value();
                fatal(f);
            }
        }
    }

    /// Receive a value, blocking until one is available
    ///
    /// Returns `None` once the channel is closed and every buffered value has been received.
    pub fn recv(&self) -> Option<T> {
        match unsafe { recv_into::<T>(&self.inner.raw, true) } {
            ((_, true), slot) => Some(unsafe { slot.assume_init() }),
            _ => None,
        }
    }

    /// Receive a value if that is possible without blocking
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        match unsafe { recv_into::<T>(&self.inner.raw, false) } {
            ((true, true), slot) => Ok(unsafe { slot.assume_init() }),
            ((true, false), _) => Err(TryRecvError::Closed),
            _ => Err(TryRecvError::Empty),
        }
    }

    /// Close the channel
    ///
    /// Blocked receivers return `None`, buffered values remain receivable, and further sends
    /// panic. Panics with "close of closed channel" if already closed.
    pub fn close(&self) {
        self.inner.raw.close();
    }

    /// Number of buffered values
    pub fn len(&self) -> usize {
        self.inner.raw.len()
    }

    /// Whether no values are buffered
    pub fn is_empty(&self) -> bool {
        self.inner.raw.is_empty()
    }

    /// Buffer capacity, 0 if unbuffered
    pub fn cap(&self) -> usize {
        self.inner.raw.cap()
    }

    /// Whether the channel has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.raw.is_closed()
    }

    /// Blocking iterator over received values, ending once the channel is closed and drained
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { chan: self }
    }

    /// The underlying byte-level channel
    pub fn as_raw(&self) -> &RawChannel {
        &self.inner.raw
    }
}

impl<T> Clone for Chan<T> {
    fn clone(&self) -> Self {
        Chan { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Debug for Chan<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Chan")
            .field("len", &self.len())
            .field("cap", &self.cap())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<'a, T> IntoIterator for &'a Chan<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Blocking iterator over a channel's values, see [`Chan::iter`]
pub struct Iter<'a, T> {
    chan: &'a Chan<T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.chan.recv()
    }
}

impl<'a, T> Debug for Iter<'a, T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Iter").field("chan", self.chan).finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::chan::{
        core::tests::{cancelling_runtime, queued, wait_for_waiter, Cancel},
        waiter::Dir,
    };
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg32;
    use std::{
        panic::{catch_unwind, AssertUnwindSafe},
        thread,
        time::Duration,
    };

    #[test]
    fn unbuffered_ping_pong() {
        let ping = Chan::<String>::new(0);
        let pong = Chan::<String>::new(0);
        let join = thread::spawn({
            let (ping, pong) = (ping.clone(), pong.clone());
            move || {
                for msg in &ping {
                    pong.send(msg + "!");
                }
            }
        });
        for i in 0..100 {
            ping.send(i.to_string());
            assert_eq!(pong.recv().unwrap(), format!("{}!", i));
        }
        ping.close();
        join.join().unwrap();
    }

    #[test]
    fn try_send_gives_back_value() {
        let chan = Chan::new(2);
        chan.try_send(vec![1]).unwrap();
        chan.try_send(vec![2]).unwrap();
        assert_eq!(chan.try_send(vec![3]).unwrap_err().into_inner(), vec![3]);
        assert_eq!(chan.len(), 2);
        assert_eq!(chan.try_recv().unwrap(), vec![1]);
        assert_eq!(chan.try_recv().unwrap(), vec![2]);
        assert_eq!(chan.try_recv(), Err(TryRecvError::Empty));
        chan.close();
        assert_eq!(chan.try_recv(), Err(TryRecvError::Closed));
    }

    #[test]
    fn unbuffered_try_ops() {
        let chan = Chan::<u8>::new(0);
        assert_eq!(chan.try_send(1).unwrap_err().msg, 1);
        assert_eq!(chan.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(chan.cap(), 0);
    }

    #[test]
    fn iter_until_closed() {
        let chan = Chan::new(4);
        for i in 0..4 {
            chan.send(i);
        }
        chan.close();
        assert_eq!(chan.iter().collect::<Vec<i32>>(), vec![0, 1, 2, 3]);
        assert_eq!(chan.recv(), None);
    }

    #[test]
    fn close_wakes_blocked_recv() {
        let chan = Chan::<Box<u32>>::new(0);
        let join = thread::spawn({
            let chan = chan.clone();
            move || chan.recv()
        });
        thread::sleep(Duration::from_millis(20));
        chan.close();
        assert_eq!(join.join().unwrap(), None);
    }

    #[test]
    fn buffered_values_dropped_with_last_handle() {
        let counter = Arc::new(());
        let chan = Chan::new(3);
        for _ in 0..3 {
            chan.send(Arc::clone(&counter));
        }
        let chan2 = chan.clone();
        drop(chan);
        assert_eq!(Arc::strong_count(&counter), 4);
        drop(chan2);
        assert_eq!(Arc::strong_count(&counter), 1);
    }

    #[test]
    fn failed_send_drops_value() {
        let counter = Arc::new(());
        let chan = Chan::new(1);
        chan.close();
        let res = catch_unwind(AssertUnwindSafe(|| chan.send(Arc::clone(&counter))));
        assert!(res.is_err());
        assert_eq!(Arc::strong_count(&counter), 1);
    }

    #[test]
    fn close_drops_value_of_parked_send() {
        let counter = Arc::new(());
        let chan = Chan::new(0);
        let join = thread::spawn({
            let (chan, counter) = (chan.clone(), Arc::clone(&counter));
            move || chan.send(counter)
        });
        wait_for_waiter(chan.as_raw(), Dir::Send);
        chan.close();
        assert!(join.join().is_err());
        assert_eq!(Arc::strong_count(&counter), 1);
    }

    #[test]
    fn unwound_recv_leaves_no_waiter() {
        for cancel in [Cancel::Immediately, Cancel::HoldingLocks] {
            let chan = Chan::<String>::with_runtime(0, cancelling_runtime(cancel));
            assert!(catch_unwind(AssertUnwindSafe(|| chan.recv())).is_err());
            assert_eq!(queued(chan.as_raw(), Dir::Recv), 0);
            // nobody is left to take it
            assert_eq!(chan.try_send("x".to_owned()).unwrap_err().into_inner(), "x");
        }
    }

    #[test]
    fn unwound_send_leaves_no_waiter() {
        for capacity in [0, 1] {
            let rt = cancelling_runtime(Cancel::Immediately);
            let chan = Chan::<String>::with_runtime(capacity, rt);
            if capacity > 0 {
                chan.send("first".to_owned());
            }
            assert!(catch_unwind(AssertUnwindSafe(|| chan.send("second".to_owned()))).is_err());
            assert_eq!(queued(chan.as_raw(), Dir::Send), 0);
            if capacity > 0 {
                assert_eq!(chan.try_recv().unwrap(), "first");
            }
            assert_eq!(chan.try_recv(), Err(TryRecvError::Empty));
        }
    }

    #[test]
    fn cancel_after_handoff_does_not_double_drop() {
        let counter = Arc::new(());
        let chan = Chan::<Arc<()>>::with_runtime(0, cancelling_runtime(Cancel::AfterWake));

        // receiver cancelled after a sender already wrote into its slot
        let join = thread::spawn({
            let (chan, counter) = (chan.clone(), Arc::clone(&counter));
            move || {
                wait_for_waiter(chan.as_raw(), Dir::Recv);
                chan.try_send(counter).unwrap();
            }
        });
        assert!(catch_unwind(AssertUnwindSafe(|| chan.recv())).is_err());
        join.join().unwrap();
        // leaked with the unwound frame
        assert_eq!(Arc::strong_count(&counter), 2);

        // sender cancelled after a receiver already took its value
        let join = thread::spawn({
            let chan = chan.clone();
            move || {
                wait_for_waiter(chan.as_raw(), Dir::Send);
                chan.try_recv().unwrap()
            }
        });
        assert!(catch_unwind(AssertUnwindSafe(|| chan.send(Arc::clone(&counter)))).is_err());
        drop(join.join().unwrap());
        assert_eq!(Arc::strong_count(&counter), 2);
    }

    #[test]
    #[should_panic(expected = "send on closed channel")]
    fn send_on_closed_panics() {
        let chan = Chan::new(0);
        chan.close();
        chan.send(());
    }

    #[test]
    fn zero_sized_elements() {
        let chan = Chan::<()>::new(2);
        chan.send(());
        chan.send(());
        assert!(chan.try_send(()).is_err());
        assert_eq!(chan.len(), 2);
        assert_eq!(chan.recv(), Some(()));
        assert_eq!(chan.recv(), Some(()));
        chan.close();
        assert_eq!(chan.recv(), None);
    }

    #[test]
    fn element_too_large() {
        assert_eq!(
            Chan::<[u8; 1 << 16]>::try_new(1).unwrap_err(),
            NewChannelError::ElementTooLarge(1 << 16),
        );
        assert!(Chan::<[u8; (1 << 16) - 1]>::try_new(0).is_ok());
    }

    #[test]
    fn random_workloads_preserve_per_sender_order() {
        let mut rng = Pcg32::seed_from_u64(0xdeadbeef);
        for _ in 0..20 {
            let capacity = rng.gen_range(0..5);
            let senders = rng.gen_range(1..4);
            let count = rng.gen_range(1..300);
            let chan = Chan::<(usize, usize)>::new(capacity);
            let joins = (0..senders)
                .map(|s| {
                    let chan = chan.clone();
                    let seed = rng.gen::<u64>();
                    thread::spawn(move || {
                        let mut rng = Pcg32::seed_from_u64(seed);
                        for i in 0..count {
                            if rng.gen_bool(0.5) {
                                chan.send((s, i));
                            } else {
                                let mut msg = (s, i);
                                while let Err(e) = chan.try_send(msg) {
                                    msg = e.into_inner();
                                    thread::yield_now();
                                }
                            }
                        }
                    })
                })
                .collect::<Vec<_>>();
            let mut next = vec![0; senders];
            for _ in 0..senders * count {
                let (s, i) = chan.recv().unwrap();
                assert_eq!(next[s], i);
                next[s] += 1;
            }
            for join in joins {
                join.join().unwrap();
            }
            assert!(chan.is_empty());
        }
    }
}
