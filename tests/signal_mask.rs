//! Abandoning from a signal handler that was installed without
//! `SA_NODEFER`: the kernel blocks the signal while the handler runs, and
//! since the handler never returns only the recovery point can unblock it.
#![cfg(all(unix, not(feature = "coverage")))]

use std::mem;
use std::ptr::{self, addr_of_mut};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use serial_test::serial;
use vm_recovery::{
    CompletionStatus, ExecutionSnapshot, RecoveryConfig, SignalMaskPolicy, WorkPayload, abandon,
    recovery_point_with_config,
};

static SNAPSHOT: AtomicPtr<ExecutionSnapshot> = AtomicPtr::new(ptr::null_mut());
static HANDLED: AtomicUsize = AtomicUsize::new(0);

extern "C" fn on_sigusr1(_signum: libc::c_int) {
    HANDLED.fetch_add(1, Ordering::SeqCst);
    let snapshot = SNAPSHOT.load(Ordering::SeqCst);
    if !snapshot.is_null() {
        unsafe { abandon(snapshot) }
    }
}

fn install_handler() {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = on_sigusr1 as usize;
        action.sa_flags = 0;
        libc::sigemptyset(&mut action.sa_mask);
        assert_eq!(libc::sigaction(libc::SIGUSR1, &action, ptr::null_mut()), 0);
    }
}

fn sigusr1_blocked() -> bool {
    unsafe {
        let mut current: libc::sigset_t = mem::zeroed();
        assert_eq!(
            libc::pthread_sigmask(libc::SIG_SETMASK, ptr::null(), &mut current),
            0
        );
        libc::sigismember(&current, libc::SIGUSR1) == 1
    }
}

fn unblock_sigusr1() {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGUSR1);
        assert_eq!(
            libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, ptr::null_mut()),
            0
        );
    }
}

struct Work {
    snapshot: *const ExecutionSnapshot,
    after_raise: bool,
}

unsafe extern "C" fn raise_sigusr1(payload: WorkPayload) {
    let work = payload.cast::<Work>();
    unsafe {
        SNAPSHOT.store((*work).snapshot.cast_mut(), Ordering::SeqCst);
        libc::raise(libc::SIGUSR1);
        (*work).after_raise = true;
    }
}

fn run(policy: SignalMaskPolicy) -> (CompletionStatus, bool) {
    install_handler();
    unblock_sigusr1();
    HANDLED.store(0, Ordering::SeqCst);

    let config = RecoveryConfig::new().signal_mask(policy);
    let mut work = Work {
        snapshot: ptr::null(),
        after_raise: false,
    };
    let this: *mut Work = &mut work;
    let status = unsafe {
        recovery_point_with_config(
            &config,
            addr_of_mut!((*this).snapshot),
            raise_sigusr1,
            this.cast(),
        )
    };
    SNAPSHOT.store(ptr::null_mut(), Ordering::SeqCst);

    assert_eq!(HANDLED.load(Ordering::SeqCst), 1);
    let blocked = sigusr1_blocked();
    unblock_sigusr1();
    assert!(!work.after_raise);
    (status, blocked)
}

#[test]
#[serial]
fn ignore_policy_leaves_handler_mask_in_place() {
    let (status, blocked) = run(SignalMaskPolicy::Ignore);
    assert_eq!(status, CompletionStatus::Abandoned);
    assert!(blocked);
}

#[test]
#[serial]
fn preserve_policy_restores_mask() {
    let (status, blocked) = run(SignalMaskPolicy::Preserve);
    assert_eq!(status, CompletionStatus::Abandoned);
    assert!(!blocked);
}
