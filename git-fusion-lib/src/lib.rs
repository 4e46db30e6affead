//! Core functionality for the Git↔depot bridge.
//!
//! End users see an ordinary Git remote; behind it, every push is translated
//! into numbered depot changelists and every depot change made by other
//! clients is translated back into Git commits. This library is the
//! translation engine and its concurrency substrate; transports and
//! command-line front ends live elsewhere.

#![warn(missing_docs)]
#![warn(
    clippy::all,
    clippy::as_conversions,
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro
)]
#![allow(clippy::too_many_arguments, clippy::blocks_in_conditions)]

pub mod core;
pub mod depot;
pub mod git;
pub mod testing;
