// typed select builder over the raw select.
//
// every case gets a heap slot: send cases own their value until the select moves it into the
// channel, receive cases provide the place the received value is written to. slots are type
// erased so cases of different element types fit in one select. a RecvCase token carries the
// type back out, and is tied to the selector that made it so the type cannot be confused.

use super::{
    api::Chan,
    error::fatal,
    select::{Case, RawSelect},
};
use crate::runtime::Runtime;
use rand::Rng;
use std::{
    fmt::{self, Debug, Formatter},
    marker::PhantomData,
    mem::{self, ManuallyDrop, MaybeUninit},
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering::Relaxed},
};


static NEXT_SELECTOR_ID: AtomicU64 = AtomicU64::new(1);


// heap allocation for one case's value.
struct Slot {
    ptr: NonNull<u8>,
    // whether the slot holds a value that we own.
    init: bool,
    free: unsafe fn(NonNull<u8>, bool),
}

impl Slot {
    fn new<T>(msg: Option<T>) -> Self {
        let init = msg.is_some();
        let boxed = Box::new(msg.map_or_else(MaybeUninit::uninit, MaybeUninit::new));
        Slot {
            ptr: NonNull::from(Box::leak(boxed)).cast(),
            init,
            free: free_slot::<T>,
        }
    }

    // move the value out. caller guarantees T is the slot's type and init is true.
    unsafe fn take<T>(mut self) -> T {
        debug_assert!(self.init);
        self.init = false;
        self.ptr.cast::<T>().as_ptr().read()
    }
}

unsafe fn free_slot<T>(ptr: NonNull<u8>, init: bool) {
    let mut boxed = Box::from_raw(ptr.cast::<MaybeUninit<T>>().as_ptr());
    if init {
        boxed.assume_init_drop();
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        unsafe { (self.free)(self.ptr, self.init) };
    }
}


/// Handle to a receive case of a [`Selector`], used to take the received value
pub struct RecvCase<T> {
    selector: u64,
    index: usize,
    _p: PhantomData<fn() -> T>,
}

impl<T> RecvCase<T> {
    /// Index of this case within its selector
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<T> Clone for RecvCase<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RecvCase<T> {}

impl<T> Debug for RecvCase<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("RecvCase").field("index", &self.index).finish()
    }
}

impl<T> PartialEq<usize> for RecvCase<T> {
    fn eq(&self, index: &usize) -> bool {
        self.index == *index
    }
}


/// Builder for a select over typed channels
///
/// Cases are numbered in the order they are added. Passing `None` as the channel adds a case that
/// never fires.
///
/// ```
/// use sluice::{Chan, Selector};
///
/// let data = Chan::<String>::new(1);
/// let quit = Chan::<()>::new(0);
/// data.send("hello".to_owned());
///
/// let mut sel = Selector::new();
/// let on_data = sel.recv(&data);
/// let on_quit = sel.recv(&quit);
/// let mut op = sel.select();
/// assert_eq!(op.index(), on_data.index());
/// assert_eq!(op.take(on_data).as_deref(), Some("hello"));
/// # let _ = on_quit;
/// ```
pub struct Selector<'a> {
    id: u64,
    cases: Vec<Case<'a>>,
    // parallel to cases. none for default cases and cases without a channel.
    slots: Vec<Option<Slot>>,
    rt: Runtime,
}

impl<'a> Selector<'a> {
    /// Construct with the global [`Runtime`]
    pub fn new() -> Self {
        Self::with_runtime(Runtime::global().clone())
    }

    /// Construct with a custom [`Runtime`], whose scheduler must be the one the channels use
    pub fn with_runtime(rt: Runtime) -> Self {
        Selector {
            id: NEXT_SELECTOR_ID.fetch_add(1, Relaxed),
            cases: Vec::new(),
            slots: Vec::new(),
            rt,
        }
    }

    /// Add a case receiving from `chan`
    pub fn recv<T: 'a>(&mut self, chan: impl Into<Option<&'a Chan<T>>>) -> RecvCase<T> {
        let index = self.cases.len();
        match chan.into() {
            Some(chan) => {
                let slot = Slot::new::<T>(None);
                self.cases.push(Case::Recv { chan: Some(chan.as_raw()), slot: Some(slot.ptr) });
                self.slots.push(Some(slot));
            }
            None => {
                self.cases.push(Case::Recv { chan: None, slot: None });
                self.slots.push(None);
            }
        }
        RecvCase { selector: self.id, index, _p: PhantomData }
    }

    /// Add a case sending `msg` into `chan`, returning the case's index
    ///
    /// If another case fires, `msg` is dropped along with the selector or the
    /// [`SelectedOperation`].
    pub fn send<T: 'a>(&mut self, chan: impl Into<Option<&'a Chan<T>>>, msg: T) -> usize {
        let index = self.cases.len();
        let slot = Slot::new(Some(msg));
        self.cases.push(Case::Send { chan: chan.into().map(Chan::as_raw), slot: slot.ptr });
        self.slots.push(Some(slot));
        index
    }

    /// Add a case that fires if no other case is ready, returning the case's index
    pub fn default_case(&mut self) -> usize {
        let index = self.cases.len();
        self.cases.push(Case::Default);
        self.slots.push(None);
        index
    }

    /// Block until one case fires
    ///
    /// Panics with "send on closed channel" if a send case is chosen on a closed channel.
    pub fn select(self) -> SelectedOperation {
        self.select_with_rng(&mut rand::thread_rng())
    }

    /// Like [`select`](Self::select), with a caller-provided RNG for the poll order
    pub fn select_with_rng<R: Rng + ?Sized>(mut self, rng: &mut R) -> SelectedOperation {
        let raw = RawSelect::with_runtime(self.cases.iter().copied(), self.rt.clone());
        // if parking unwinds, a receiver may already own a send value, so every slot is leaked.
        let lent = ManuallyDrop::new(mem::take(&mut self.slots));
        // slots are heap allocations that stay put while lent, and each matches its channel's
        // element type.
        let result = unsafe { raw.execute_inner(rng) };
        let mut slots = ManuallyDrop::into_inner(lent);
        let selected = match result {
            Ok(selected) => selected,
            Err(f) => {
                drop(slots);
                fatal(f);
            }
        };
        let mut slot = slots[selected.index].take();
        if let Some(slot) = &mut slot {
            // a winning send moved its value into the channel, a winning receive wrote one.
            slot.init = selected.received;
        }
        SelectedOperation {
            selector: self.id,
            index: selected.index,
            received: selected.received,
            slot: slot.filter(|slot| slot.init),
        }
    }
}

impl<'a> Default for Selector<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Debug for Selector<'a> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Selector").field("cases", &self.cases).finish_non_exhaustive()
    }
}


/// Outcome of [`Selector::select`]
pub struct SelectedOperation {
    selector: u64,
    index: usize,
    received: bool,
    // the received value, if any.
    slot: Option<Slot>,
}

impl SelectedOperation {
    /// Index of the case that fired
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether the case that fired was a receive that got a value
    ///
    /// False for a receive from a closed channel, and for send and default cases.
    pub fn received(&self) -> bool {
        self.received
    }

    /// Take the value received by `case`
    ///
    /// Returns `None` if a different case fired, the channel was closed, or the value was
    /// already taken. Panics if `case` came from a different selector.
    pub fn take<T>(&mut self, case: RecvCase<T>) -> Option<T> {
        assert_eq!(case.selector, self.selector, "receive case from a different selector");
        if case.index != self.index {
            return None;
        }
        // the token's selector and index pin T to the slot's type.
        self.slot.take().map(|slot| unsafe { slot.take::<T>() })
    }
}

impl Debug for SelectedOperation {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("SelectedOperation")
            .field("index", &self.index)
            .field("received", &self.received)
            .finish()
    }
}
