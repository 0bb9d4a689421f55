//! Go-style bounded channels with a fair multi-way select.
//!
//! A [`Chan`] has a fixed capacity. With capacity 0 every send is a rendezvous with a receiver.
//! A [`Selector`] waits on several channel operations at once and completes exactly one of them,
//! choosing uniformly at random among those ready.
//!
//! The typed API is built on the byte-level [`raw`] layer, and all blocking goes through the
//! [`TaskScheduler`](sched::TaskScheduler) of a [`Runtime`](runtime::Runtime).

#[macro_use]
extern crate tracing;

mod chan;
pub mod sched;
pub mod runtime;
pub mod util;

pub use crate::chan::{
    api::{Chan, Iter},
    selector::{RecvCase, SelectedOperation, Selector},
};

/// Byte-level channels and select
pub mod raw {
    pub use crate::chan::{
        core::RawChannel,
        select::{Case, RawSelect, Selected},
    };
}

/// Error types
pub mod error {
    pub use crate::chan::error::*;
}
