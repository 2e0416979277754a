//! AArch64 capture and restore.
//!
//! Same scheme as the x86_64 glue: everything allocatable is declared
//! clobbered around the call into the work, and the registers LLVM keeps
//! for itself (`x19` and the frame pointer `x29`) travel in the snapshot
//! together with `sp` and the resume address. `clobber_abi("C")` covers
//! `x30` and the full vector registers, whose upper halves are not
//! callee-saved.

use super::{ExecutionSnapshot, PendingCall};
use std::arch::asm;

/// Register state stored by [`capture`].
///
/// Layout is fixed: the assembly below addresses these fields by offset.
#[repr(C)]
#[derive(Default)]
#[allow(dead_code)] // only ever touched by the assembly
pub(super) struct Registers {
    sp: usize,
    resume: usize,
    x19: usize,
    x29: usize,
}

unsafe extern "C" fn enter(call: *mut PendingCall, snapshot: *mut ExecutionSnapshot) {
    unsafe { super::run_pending(call, snapshot) }
}

/// Stores the registers into `snapshot` and runs `call`.
///
/// Returns `false` once the work returned, `true` when control came back
/// through [`restore`].
#[inline(always)]
pub(super) unsafe fn capture(snapshot: *mut ExecutionSnapshot, call: *mut PendingCall) -> bool {
    let resumed: usize;
    unsafe {
        asm!(
            "adr x2, 2f",
            "mov x3, sp",
            "stp x3, x2, [x1]",
            "stp x19, x29, [x1, #16]",
            "bl {enter}",
            "mov x0, #0",
            "2:",
            enter = sym enter,
            inlateout("x0") call => resumed,
            in("x1") snapshot,
            lateout("x20") _,
            lateout("x21") _,
            lateout("x22") _,
            lateout("x23") _,
            lateout("x24") _,
            lateout("x25") _,
            lateout("x26") _,
            lateout("x27") _,
            lateout("x28") _,
            clobber_abi("C"),
        );
    }
    resumed != 0
}

/// Jumps back to the `2:` label of the [`capture`] block that filled
/// `snapshot`, with `x0` set to 1.
#[inline(always)]
pub(super) unsafe fn restore(snapshot: *const ExecutionSnapshot) -> ! {
    unsafe {
        asm!(
            "ldp x19, x29, [x0, #16]",
            "ldp x2, x3, [x0]",
            "mov sp, x2",
            "mov x0, #1",
            "br x3",
            in("x0") snapshot,
            options(noreturn),
        )
    }
}
