// implementation of sluice channels and select.
//
// the basic architecture is that of a classic rendezvous channel. it is as such:
//
// channel handles wrap around Arc<RawChannel>, and RawChannel wraps around Mutex<locked state>
//                                                                             |
//          /------------------------------------------------------------------/
//          v
//       locked state
//          |
//          |------ it contains a ring buffer of capacity * element_size bytes holding the
//          |       buffered elements. an unbuffered channel has an empty ring and moves every
//          |       element directly from sender to receiver.
//          |
//          |------ it contains a waiter arena, which holds every blocked participant, and two
//          |       wait queues threaded through it:
//          |
//          |       the "send queue" holds a waiter for each blocked sender. a waiter points at
//          |       the sender's value and at a wait token shared with the blocked task. the
//          |       queue order is used to achieve fairness.
//          |
//          \------ the "recv queue" is the same idea for blocked receivers.
//
// a select enqueues one waiter per case on every channel it involves, all sharing one token
// with a claim flag. whoever flips the claim first gets to complete the select, every other
// partner skips those waiters.
//
// tasks are parked and readied through the scheduler in the runtime, never while holding a lock.
//
// the organization of these modules is as such:
//
//      These are used like
//      library utilities:
//    /--------------------\
//
//      waiter<----------------core: This is the sin-eater of the unsafety. It presents channels
//                   |         ^  ^  of raw bytes, with the locked primitives both direct
//      error<-------/         |  |  operations and select are built from.
//                             |  |
//                             |  select: The three-pass select protocol over raw channels.
//                             |  ^
//                             |  |
//                             api / selector: Typed, safe wrappers that the crate re-exports
//                                             publically.

pub(crate) mod error;
pub(crate) mod api;
pub(crate) mod selector;
pub(crate) mod select;
pub(crate) mod core;

mod waiter;
