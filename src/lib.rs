//! Embedding helpers for `vm-recovery`.
//!
//! The recovery crate stops at "give me a snapshot and I will jump to it".
//! This crate adds the process-wide piece a runtime needs on top: fault
//! handlers that turn host signals raised while guest code runs into traps.

#![deny(missing_docs, unused_imports, unused_variables)]

pub use vm_recovery as recovery;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod sighandler;
        pub use crate::sighandler::{init_traps, trap_code_for_signal};
    }
}
