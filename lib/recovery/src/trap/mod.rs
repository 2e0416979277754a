//! Trap scopes: the layer between raw recovery points and an embedder.
//!
//! An embedder wraps guest calls in [`catch_traps`]; its fault handlers
//! leave guest code through [`raise_lib_trap`].
mod trapcode;
mod traphandlers;

pub use trapcode::{ParseTrapCodeError, TrapCode};
pub use traphandlers::{
    TlsError, TlsRestore, Trap, catch_traps, catch_traps_default, current_snapshot,
    in_trap_scope, raise_lib_trap, raise_user_trap,
};
