//! Recovery points for trapping guest code.
//!
//! A virtual-machine runtime that runs untrusted compiled code needs a way
//! out when that code faults: the fault is usually noticed in a signal
//! handler, many frames below the call that entered guest code, and the
//! only safe thing to do is to drop everything in between and report a trap.
//!
//! This crate provides two layers:
//!
//! - [`recovery_point`] and [`abandon`], a minimal setjmp/longjmp pair
//!   written as inline assembly. A recovery point captures the host state
//!   of its frame, publishes a pointer to it and runs a unit of work;
//!   abandoning jumps straight back to it.
//! - [`catch_traps`] and friends, which keep the innermost recovery point in
//!   thread-local storage so fault handlers can find it, and turn an
//!   abandonment into a [`Trap`] error.
//!
//! Abandoning never runs destructors of the frames it discards. See the
//! [`jump`] module documentation.
//!
//! ```
//! use vm_recovery::{catch_traps_default, raise_lib_trap, TrapCode};
//!
//! let result: Result<u32, _> = unsafe {
//!     catch_traps_default(|| {
//!         raise_lib_trap(TrapCode::UnreachableCodeReached);
//!     })
//! };
//! assert_eq!(
//!     result.unwrap_err().trap_code(),
//!     Some(TrapCode::UnreachableCodeReached)
//! );
//! ```

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]
#![allow(clippy::new_without_default)]
#![warn(
    clippy::mut_mut,
    clippy::nonminimal_bool,
    clippy::map_unwrap_or,
    clippy::print_stdout,
    clippy::unicode_not_nfc,
    clippy::use_self
)]

mod config;
pub mod jump;
mod trap;

pub use crate::config::{ParseSignalMaskPolicyError, RecoveryConfig, SignalMaskPolicy};
pub use crate::jump::{
    CompletionStatus, ExecutionSnapshot, WorkFn, WorkPayload, abandon, recovery_point,
    recovery_point_with_config,
};
pub use crate::trap::*;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
