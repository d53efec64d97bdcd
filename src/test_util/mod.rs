//! This module contains utilities that are useful for testing code built on the
//!  transport core. They are used for testing the transport itself, but they are
//!  also exported for application testing.
//!
//! Making test utilities part of the crate's regular (non-#[cfg(test)]) code is
//!  the compromise that lets application crates reuse the in-memory socket and
//!  the canned capability implementations without a feature gate.

pub mod capabilities;
pub mod memory_socket;
