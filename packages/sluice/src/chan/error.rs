// channel error types.

use std::fmt::{self, Debug, Display, Formatter};
use thiserror::Error;


// ==== non-fatal outcomes ====


/// Error for attempting a channel operation without blocking, and the operation not being able
/// to complete immediately
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Error)]
#[error("operation would block")]
pub struct WouldBlockError;

/// Error for trying to send without blocking into a channel that is full or, if unbuffered, has
/// no waiting receiver
///
/// Gives back the message that could not be sent.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TrySendError<T> {
    /// The message that could not be sent
    pub msg: T,
}

impl<T> TrySendError<T> {
    /// Take back the message that could not be sent
    pub fn into_inner(self) -> T {
        self.msg
    }
}

impl<T> Debug for TrySendError<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("TrySendError").finish_non_exhaustive()
    }
}

impl<T> Display for TrySendError<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&WouldBlockError, f)
    }
}

impl<T> std::error::Error for TrySendError<T> {}

impl<T> From<TrySendError<T>> for WouldBlockError {
    fn from(_: TrySendError<T>) -> Self {
        WouldBlockError
    }
}

/// Error for trying to receive from a channel without blocking
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Error)]
pub enum TryRecvError {
    /// No message is buffered and, if unbuffered, no sender is waiting
    #[error("receiving on an empty channel")]
    Empty,
    /// The channel is closed and all buffered messages have been received
    #[error("receiving on a closed channel")]
    Closed,
}

/// Error for constructing a channel with an unsupported shape
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Error)]
pub enum NewChannelError {
    /// Element size must be strictly less than 64 KiB
    #[error("invalid channel element size: {0} bytes")]
    ElementTooLarge(usize),
    /// Buffer size in bytes would overflow the address space
    #[error("channel size out of range: {capacity} elements of {element_size} bytes")]
    CapacityOutOfRange {
        /// Requested capacity in elements
        capacity: usize,
        /// Element size in bytes
        element_size: usize,
    },
}


// ==== fatal errors ====


/// Unrecoverable channel errors
///
/// These are logic errors, never environmental failures, and are never returned as values.
/// Misuse by the caller ([`SendOnClosed`](Self::SendOnClosed),
/// [`CloseOfClosed`](Self::CloseOfClosed), [`ForeignTask`](Self::ForeignTask)) panics with the
/// displayed message. A broken internal invariant aborts the process.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Error)]
pub enum Fatal {
    /// Sending on a closed channel
    #[error("send on closed channel")]
    SendOnClosed,
    /// Closing a closed channel
    #[error("close of closed channel")]
    CloseOfClosed,
    /// A task was woken for a waiter it did not enqueue
    #[error("waiting list is corrupted")]
    CorruptWaitList,
    /// A task resumed with no corresponding state change
    #[error("{0}: spurious wakeup")]
    SpuriousWakeup(&'static str),
    /// A task resumed from a park that has no waker
    #[error("unreachable: {0}")]
    Unreachable(&'static str),
    /// A scheduler was asked to ready a task it did not create
    #[error("ready called with a task from a different scheduler")]
    ForeignTask,
}

impl Fatal {
    /// Whether this indicates a broken invariant of the channel core itself, rather than misuse
    pub fn is_internal(self) -> bool {
        matches!(self, Fatal::CorruptWaitList | Fatal::SpuriousWakeup(_) | Fatal::Unreachable(_))
    }
}

// raise a fatal error. callers must not hold any channel lock.
#[cold]
#[track_caller]
pub(crate) fn fatal(f: Fatal) -> ! {
    error!(fatal = %f, internal = f.is_internal(), "fatal channel error");
    if f.is_internal() {
        std::process::abort();
    }
    panic!("{}", f);
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_messages() {
        assert_eq!(Fatal::SendOnClosed.to_string(), "send on closed channel");
        assert_eq!(Fatal::CloseOfClosed.to_string(), "close of closed channel");
        assert_eq!(Fatal::SpuriousWakeup("chansend").to_string(), "chansend: spurious wakeup");
        assert!(Fatal::CorruptWaitList.is_internal());
        assert!(!Fatal::SendOnClosed.is_internal());
    }

    #[test]
    #[should_panic(expected = "close of closed channel")]
    fn misuse_panics() {
        fatal(Fatal::CloseOfClosed);
    }

    #[test]
    fn try_send_error_gives_back_msg() {
        let e = TrySendError { msg: vec![1, 2, 3] };
        assert_eq!(e.to_string(), "operation would block");
        assert_eq!(e.into_inner(), vec![1, 2, 3]);
    }
}
