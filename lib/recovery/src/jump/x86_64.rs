//! x86_64 capture and restore.
//!
//! The capture block calls into the work itself, so to the compiler the
//! whole recovery point is a single `asm!` that returns once. Every register
//! the compiler may allocate is declared clobbered, which makes it spill
//! anything live across the block to its own frame. That leaves the two
//! registers LLVM reserves, `rbx` and `rbp`, plus `rsp` and the resume
//! address: those are stored in the snapshot and reloaded by `restore`.
//!
//! The work trampoline uses the System V ABI on every OS, so the same
//! assembly serves Windows hosts as well.

use super::{ExecutionSnapshot, PendingCall};
use std::arch::asm;

/// Register state stored by [`capture`].
///
/// Layout is fixed: the assembly below addresses these fields by offset.
#[repr(C)]
#[derive(Default)]
#[allow(dead_code)] // only ever touched by the assembly
pub(super) struct Registers {
    rsp: usize,
    resume: usize,
    rbx: usize,
    rbp: usize,
}

unsafe extern "sysv64" fn enter(call: *mut PendingCall, snapshot: *mut ExecutionSnapshot) {
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
            "lea rax, [rip + 2f]",
            "mov [rsi], rsp",
            "mov [rsi + 8], rax",
            "mov [rsi + 16], rbx",
            "mov [rsi + 24], rbp",
            "call {enter}",
            "xor eax, eax",
            "2:",
            enter = sym enter,
            in("rdi") call,
            in("rsi") snapshot,
            lateout("rax") resumed,
            lateout("r12") _,
            lateout("r13") _,
            lateout("r14") _,
            lateout("r15") _,
            clobber_abi("sysv64"),
        );
    }
    resumed != 0
}

/// Jumps back to the `2:` label of the [`capture`] block that filled
/// `snapshot`, with `rax` set to 1.
#[inline(always)]
pub(super) unsafe fn restore(snapshot: *const ExecutionSnapshot) -> ! {
    unsafe {
        asm!(
            "mov rbx, [rdi + 16]",
            "mov rbp, [rdi + 24]",
            "mov rsp, [rdi]",
            "mov eax, 1",
            "jmp qword ptr [rdi + 8]",
            in("rdi") snapshot,
            options(noreturn),
        )
    }
}
