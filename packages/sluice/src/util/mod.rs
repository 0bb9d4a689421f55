//! Concurrency utilities.

pub mod claim;
