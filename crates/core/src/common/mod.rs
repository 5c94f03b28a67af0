//! Common types and constants shared by every subsystem.
//!
//! This module provides:
//! 1. **Scalar types:** cycle/op counters, addresses, and their sentinels.
//! 2. **Address helpers:** core-id tagging of simulated addresses.
//! 3. **Errors:** the fatal invariant-violation type and its helper macros.

/// Fatal error type and invariant-check macros.
pub mod error;
/// Counters, addresses, and core-id address tagging.
pub mod types;

pub use error::{FATAL_EXIT_CODE, FatalError, SimResult};
pub use types::{Addr, Counter, MAX_CTR, ProcId, addr_proc_id, tag_addr, untag_addr};
