//! We install signal handlers to handle traps raised by guest code.
//! Otherwise faults such as `SIGFPE` kill the whole process instead of
//! ending the guest call with an error.
//!
//! A fault is only turned into a trap when the faulting thread is inside a
//! trap scope. Anything else is forwarded to whatever handler was installed
//! before ours, or re-executed under the default disposition.

use std::cell::UnsafeCell;
use std::io;
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::sync::OnceLock;
use vm_recovery::{TrapCode, in_trap_scope, raise_lib_trap};

/// The `sigaction` that was in place before [`init_traps`] replaced it.
struct PreviousAction(UnsafeCell<MaybeUninit<libc::sigaction>>);

// Written once under `INIT`, only read afterwards.
unsafe impl Sync for PreviousAction {}

impl PreviousAction {
    const fn new() -> Self {
        Self(UnsafeCell::new(MaybeUninit::uninit()))
    }
}

static PREV_SIGSEGV: PreviousAction = PreviousAction::new();
static PREV_SIGBUS: PreviousAction = PreviousAction::new();
static PREV_SIGILL: PreviousAction = PreviousAction::new();
static PREV_SIGFPE: PreviousAction = PreviousAction::new();

/// Maps a fault signal to the trap it reports.
pub fn trap_code_for_signal(signum: libc::c_int) -> Option<TrapCode> {
    match signum {
        libc::SIGSEGV | libc::SIGBUS => Some(TrapCode::HeapAccessOutOfBounds),
        libc::SIGILL => Some(TrapCode::UnreachableCodeReached),
        libc::SIGFPE => Some(TrapCode::IntegerDivisionByZero),
        _ => None,
    }
}

/// Installs the fault handlers for this process.
///
/// Only the first call does anything; later calls report its outcome.
pub fn init_traps() -> io::Result<()> {
    static INIT: OnceLock<Result<(), libc::c_int>> = OnceLock::new();
    init_once(&INIT, || unsafe { platform_init() })
}

fn init_once(
    slot: &OnceLock<Result<(), libc::c_int>>,
    init: impl FnOnce() -> io::Result<()>,
) -> io::Result<()> {
    let outcome = slot.get_or_init(|| {
        init().map_err(|error| error.raw_os_error().unwrap_or(libc::EINVAL))
    });
    (*outcome).map_err(io::Error::from_raw_os_error)
}

unsafe fn platform_init() -> io::Result<()> {
    let register = |slot: &PreviousAction, signal: libc::c_int| -> io::Result<()> {
        let mut handler: libc::sigaction = unsafe { mem::zeroed() };
        // SA_SIGINFO gives us access to the fault details.
        //
        // SA_ONSTACK lets the handler run on an alternate stack so it still
        // works when the main stack is exhausted.
        //
        // SA_NODEFER keeps the signal unblocked while we are inside the
        // handler. We leave it by jumping, so without it the signal would
        // stay blocked for the rest of the thread's life.
        handler.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER | libc::SA_ONSTACK;
        handler.sa_sigaction = trap_handler as usize;
        unsafe {
            libc::sigemptyset(&mut handler.sa_mask);
            if libc::sigaction(signal, &handler, (*slot.0.get()).as_mut_ptr()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        tracing::debug!(signal, "installed trap handler");
        Ok(())
    };

    register(&PREV_SIGSEGV, libc::SIGSEGV)?;
    register(&PREV_SIGILL, libc::SIGILL)?;
    register(&PREV_SIGFPE, libc::SIGFPE)?;
    // Guard page hits and unaligned accesses show up as SIGBUS on some
    // targets.
    register(&PREV_SIGBUS, libc::SIGBUS)?;
    Ok(())
}

unsafe extern "C" fn trap_handler(
    signum: libc::c_int,
    siginfo: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let previous = match signum {
        libc::SIGSEGV => &PREV_SIGSEGV,
        libc::SIGBUS => &PREV_SIGBUS,
        libc::SIGFPE => &PREV_SIGFPE,
        libc::SIGILL => &PREV_SIGILL,
        _ => return,
    };

    if in_trap_scope() {
        if let Some(code) = trap_code_for_signal(signum) {
            unsafe { raise_lib_trap(code) }
        }
    }

    // This signal is not ours to handle, forward it to the next handler. If
    // there is none (SIG_DFL or SIG_IGN), restore the original disposition
    // and return: the faulting instruction runs again and fails the usual
    // way.
    unsafe {
        let previous = &*(*previous.0.get()).as_ptr();
        if previous.sa_flags & libc::SA_SIGINFO != 0 {
            mem::transmute::<
                usize,
                extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void),
            >(previous.sa_sigaction)(signum, siginfo, context)
        } else if previous.sa_sigaction == libc::SIG_DFL || previous.sa_sigaction == libc::SIG_IGN
        {
            libc::sigaction(signum, previous, ptr::null_mut());
        } else {
            mem::transmute::<usize, extern "C" fn(libc::c_int)>(previous.sa_sigaction)(signum)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_signals_map_to_trap_codes() {
        assert_eq!(
            trap_code_for_signal(libc::SIGFPE),
            Some(TrapCode::IntegerDivisionByZero)
        );
        assert_eq!(
            trap_code_for_signal(libc::SIGILL),
            Some(TrapCode::UnreachableCodeReached)
        );
        assert_eq!(
            trap_code_for_signal(libc::SIGSEGV),
            Some(TrapCode::HeapAccessOutOfBounds)
        );
        assert_eq!(trap_code_for_signal(libc::SIGUSR1), None);
    }

    #[test]
    fn first_init_outcome_sticks() {
        let slot = OnceLock::new();
        let err = init_once(&slot, || Err(io::Error::from_raw_os_error(libc::EPERM))).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EPERM));

        let mut ran_again = false;
        let err = init_once(&slot, || {
            ran_again = true;
            Ok(())
        })
        .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EPERM));
        assert!(!ran_again);

        let slot = OnceLock::new();
        assert!(init_once(&slot, || Ok(())).is_ok());
        assert!(init_once(&slot, || Err(io::Error::from_raw_os_error(libc::EPERM))).is_ok());
    }
}
