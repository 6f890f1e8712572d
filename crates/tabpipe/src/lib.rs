//! Public facade crate for `tabpipe`.
//!
//! This crate intentionally contains no IO or host-specific logic.
//! It re-exports the session model and traits from `tabpipe-core`.

pub use tabpipe_core::*;
