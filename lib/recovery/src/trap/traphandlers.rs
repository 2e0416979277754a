//! Trap scopes built on top of the raw recovery points.
//!
//! [`catch_traps`] is the entry point an embedder wraps around every call
//! into guest code. It registers per-thread state in TLS, runs the closure
//! under a recovery point and turns an abandonment into a [`Trap`]. A fault
//! handler running on the same thread can then use [`raise_lib_trap`] to
//! leave guest code.

use super::trapcode::TrapCode;
use crate::config::RecoveryConfig;
use crate::jump::{self, CompletionStatus, ExecutionSnapshot, WorkPayload};
use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::error::Error;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{Ordering, compiler_fence};
use thiserror::Error;

pub use tls::{TlsError, TlsRestore};

/// The error produced when execution inside [`catch_traps`] trapped.
#[derive(Debug, Error)]
pub enum Trap {
    /// A trap raised by the embedder through [`raise_user_trap`].
    #[error("{0}")]
    User(Box<dyn Error + Send + Sync>),

    /// A trap raised by the runtime or a fault handler through
    /// [`raise_lib_trap`].
    #[error("{}", .0.message())]
    Lib(TrapCode),

    /// The scope's snapshot was abandoned directly, with no reason recorded.
    #[error("execution abandoned")]
    Abandoned,
}

impl Trap {
    /// Creates a user trap from any error.
    pub fn user(error: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self::User(error.into())
    }

    /// The trap code, if this trap was raised with one.
    pub fn trap_code(&self) -> Option<TrapCode> {
        match self {
            Self::Lib(code) => Some(*code),
            _ => None,
        }
    }

    /// Attempts to downcast a user trap to a concrete error type.
    pub fn downcast<T: Error + 'static>(self) -> Result<T, Self> {
        match self {
            Self::User(error) => error.downcast::<T>().map(|error| *error).map_err(Self::User),
            other => Err(other),
        }
    }

    /// Returns a reference to the user error, if it is of type `T`.
    pub fn downcast_ref<T: Error + 'static>(&self) -> Option<&T> {
        match self {
            Self::User(error) => error.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl From<TrapCode> for Trap {
    fn from(code: TrapCode) -> Self {
        Self::Lib(code)
    }
}

/// Why a scope was abandoned.
enum UnwindReason {
    UserTrap(Box<dyn Error + Send + Sync>),
    LibTrap(TrapCode),
}

/// Per-call state reachable from TLS while a [`catch_traps`] scope runs.
pub(crate) struct CallThreadState {
    unwind: UnsafeCell<Option<UnwindReason>>,
    snapshot: Cell<*const ExecutionSnapshot>,
    prev: Cell<tls::Ptr>,
}

impl CallThreadState {
    #[inline]
    fn new() -> Self {
        Self {
            unwind: UnsafeCell::new(None),
            snapshot: Cell::new(ptr::null()),
            prev: Cell::new(ptr::null()),
        }
    }

    /// Records `reason` and abandons to this scope's recovery point.
    ///
    /// No allocation happens here: the reason was built by the caller and
    /// the slot it replaces is always empty.
    fn unwind_with(&self, reason: UnwindReason) -> ! {
        unsafe {
            ptr::write(self.unwind.get(), Some(reason));
            jump::abandon(self.snapshot.get())
        }
    }

    /// Whether the recovery point of this scope has published its snapshot
    /// and not yet returned.
    fn is_armed(&self) -> bool {
        !self.snapshot.get().is_null()
    }

    fn take_unwind_reason(&self) -> Trap {
        match unsafe { (*self.unwind.get()).take() } {
            Some(UnwindReason::UserTrap(error)) => Trap::User(error),
            Some(UnwindReason::LibTrap(code)) => Trap::Lib(code),
            None => Trap::Abandoned,
        }
    }
}

/// Storage handed to the work trampoline through the payload pointer.
struct ClosureCall<F, R> {
    closure: Option<F>,
    result: Option<R>,
    panic: Option<Box<dyn Any + Send>>,
}

unsafe extern "C" fn call_closure<F, R>(payload: WorkPayload)
where
    F: FnOnce() -> R,
{
    let call = unsafe { &mut *payload.cast::<ClosureCall<F, R>>() };
    if let Some(closure) = call.closure.take() {
        // Panics must not unwind through the recovery point frame; stash the
        // payload and resume it once the recovery point has returned.
        match panic::catch_unwind(AssertUnwindSafe(closure)) {
            Ok(result) => call.result = Some(result),
            Err(payload) => call.panic = Some(payload),
        }
    }
}

/// Runs `closure` inside a trap scope.
///
/// Returns `Ok` with the closure's result if it returned, or `Err` with the
/// [`Trap`] that abandoned it. A panic inside the closure is resumed once
/// the scope has been torn down.
///
/// Scopes nest: raising a trap abandons only the innermost one.
///
/// # Safety
///
/// A trap abandons every frame between the raise site and this scope
/// without running destructors, including the closure's own frame and
/// anything it captured by value. Callers must make sure the code that can
/// trap only holds state that may be leaked, or track it out of band.
pub unsafe fn catch_traps<F, R>(config: &RecoveryConfig, closure: F) -> Result<R, Trap>
where
    F: FnOnce() -> R,
{
    let state = CallThreadState::new();
    let mut call = ClosureCall {
        closure: Some(closure),
        result: None,
        panic: None,
    };

    tracing::trace!(signal_mask = %config.signal_mask, "entering trap scope");
    let status = tls::set(&state, || {
        let status = unsafe {
            jump::recovery_point_with_config(
                config,
                state.snapshot.as_ptr(),
                call_closure::<F, R>,
                (&mut call as *mut ClosureCall<F, R>).cast(),
            )
        };
        // The snapshot died with the recovery point frame. Unpublish it
        // before the scope is unlinked so a signal landing in between sees
        // no scope at all.
        state.snapshot.set(ptr::null());
        compiler_fence(Ordering::SeqCst);
        status
    });

    match status {
        CompletionStatus::Completed => {
            tracing::trace!("trap scope completed");
            if let Some(payload) = call.panic.take() {
                panic::resume_unwind(payload);
            }
            match call.result.take() {
                Some(result) => Ok(result),
                // Unreachable: the trampoline always stores a result or a
                // panic before returning.
                None => Err(Trap::Abandoned),
            }
        }
        CompletionStatus::Abandoned => {
            let trap = state.take_unwind_reason();
            tracing::debug!(%trap, "trap scope abandoned");
            Err(trap)
        }
    }
}

/// Like [`catch_traps`], with the default [`RecoveryConfig`].
///
/// # Safety
///
/// See [`catch_traps`].
pub unsafe fn catch_traps_default<F, R>(closure: F) -> Result<R, Trap>
where
    F: FnOnce() -> R,
{
    unsafe { catch_traps(&RecoveryConfig::default(), closure) }
}

/// Abandons the innermost trap scope with `code`.
///
/// This neither allocates nor logs and is meant to be called from a
/// signal handler.
///
/// # Safety
///
/// Every frame between the caller and the innermost [`catch_traps`] scope is
/// discarded without running destructors.
///
/// # Panics
///
/// Panics if the current thread is not inside a trap scope. Fault handlers
/// should check [`in_trap_scope`] first.
pub unsafe fn raise_lib_trap(code: TrapCode) -> ! {
    unsafe { unwind_innermost(UnwindReason::LibTrap(code), "raise_lib_trap") }
}

/// Abandons the innermost trap scope with a user error.
///
/// Not for signal handlers: the error is boxed here.
///
/// # Safety
///
/// See [`raise_lib_trap`].
///
/// # Panics
///
/// Panics if the current thread is not inside a trap scope.
pub unsafe fn raise_user_trap(error: Box<dyn Error + Send + Sync>) -> ! {
    tracing::trace!(%error, "raising user trap");
    unsafe { unwind_innermost(UnwindReason::UserTrap(error), "raise_user_trap") }
}

unsafe fn unwind_innermost(reason: UnwindReason, caller: &str) -> ! {
    let state = tls::with(|state| {
        state
            .filter(|state| state.is_armed())
            .map(|state| state as *const CallThreadState)
    });
    match state {
        Some(state) => unsafe { (*state).unwind_with(reason) },
        None => panic!("{caller} called outside of a trap scope"),
    }
}

/// Whether the current thread is running inside a [`catch_traps`] scope.
///
/// Only true while the innermost scope's snapshot is valid, so a fault
/// handler seeing `true` may call [`raise_lib_trap`].
pub fn in_trap_scope() -> bool {
    tls::with(|state| state.is_some_and(CallThreadState::is_armed))
}

/// The snapshot published by the innermost [`catch_traps`] scope.
///
/// The pointer is only valid while that scope is running. Passing it to
/// [`abandon`](crate::abandon) ends the scope with [`Trap::Abandoned`].
pub fn current_snapshot() -> Option<*const ExecutionSnapshot> {
    tls::with(|state| {
        state
            .map(|state| state.snapshot.get())
            .filter(|snapshot| !snapshot.is_null())
    })
}

// TLS for the chain of active trap scopes. The signal handler of the
// embedder reads it to find where to jump to.
mod tls {
    use super::CallThreadState;
    use std::ptr;
    use thiserror::Error;

    pub use raw::Ptr;

    // Accessors are kept out of line: an embedder that switches stacks may
    // resume on another OS thread, so a TLS borrow must never span a call
    // that could switch.
    mod raw {
        use super::CallThreadState;
        use std::cell::Cell;
        use std::ptr;

        pub type Ptr = *const CallThreadState;

        thread_local!(static PTR: Cell<Ptr> = const { Cell::new(ptr::null()) });

        #[inline(never)]
        pub fn replace(val: Ptr) -> Ptr {
            PTR.with(|p| p.replace(val))
        }

        #[inline(never)]
        pub fn get() -> Ptr {
            PTR.with(|p| p.get())
        }
    }

    /// Misuse of [`TlsRestore`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
    pub enum TlsError {
        /// [`TlsRestore::take`] was called outside of any trap scope.
        #[error("no trap scope is active on this thread")]
        NoActiveScope,
        /// The scope held by a [`TlsRestore`] is still linked into a chain.
        #[error("trap scope is already linked into a thread's scope chain")]
        AlreadyLinked,
    }

    /// Detached TLS state of a trap scope.
    ///
    /// Used by embedders that switch stacks: take the state before
    /// switching away from a stack running guest code and put it back once
    /// that stack is resumed, possibly on another thread.
    #[derive(Debug)]
    pub struct TlsRestore(Ptr);

    // The token is how a scope follows its stack to another thread.
    unsafe impl Send for TlsRestore {}

    impl TlsRestore {
        /// Unlinks the innermost trap scope from this thread and returns a
        /// token for [`TlsRestore::replace`].
        ///
        /// # Safety
        ///
        /// The stack holding the scope must not run again until the token
        /// has been replaced.
        pub unsafe fn take() -> Result<Self, TlsError> {
            let raw = raw::get();
            if raw.is_null() {
                return Err(TlsError::NoActiveScope);
            }
            let prev = unsafe { (*raw).prev.replace(ptr::null()) };
            raw::replace(prev);
            Ok(Self(raw))
        }

        /// Links the scope back in as the innermost one of this thread.
        ///
        /// # Safety
        ///
        /// Must be called on the stack the token was taken from, before any
        /// code of that scope runs again.
        pub unsafe fn replace(self) -> Result<(), TlsError> {
            unsafe {
                if !(*self.0).prev.get().is_null() {
                    return Err(TlsError::AlreadyLinked);
                }
                let prev = raw::get();
                (*self.0).prev.set(prev);
            }
            raw::replace(self.0);
            Ok(())
        }
    }

    /// Makes `state` the innermost scope while `closure` runs.
    pub fn set<R>(state: &CallThreadState, closure: impl FnOnce() -> R) -> R {
        struct Reset<'a>(&'a CallThreadState);

        impl Drop for Reset<'_> {
            #[inline]
            fn drop(&mut self) {
                debug_assert!(
                    !self.0.is_armed(),
                    "trap scope unlinked while its snapshot is still published"
                );
                raw::replace(self.0.prev.replace(ptr::null()));
            }
        }

        let prev = raw::replace(state);
        state.prev.set(prev);
        let _reset = Reset(state);
        closure()
    }

    /// Calls `closure` with the innermost scope, if any.
    pub fn with<R>(closure: impl FnOnce(Option<&CallThreadState>) -> R) -> R {
        let p = raw::get();
        unsafe { closure(if p.is_null() { None } else { Some(&*p) }) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug, PartialEq)]
    struct OutOfFuel(u32);

    impl fmt::Display for OutOfFuel {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "out of fuel after {} steps", self.0)
        }
    }

    impl Error for OutOfFuel {}

    #[test]
    fn returns_closure_result() {
        let result = unsafe { catch_traps_default(|| 40 + 2) };
        assert_eq!(result.unwrap(), 42);
        assert!(!in_trap_scope());
    }

    #[test]
    fn lib_trap_becomes_error() {
        let mut reached = 0;
        let result: Result<(), Trap> = unsafe {
            catch_traps_default(|| {
                reached += 1;
                raise_lib_trap(TrapCode::IntegerDivisionByZero);
            })
        };
        let trap = result.unwrap_err();
        assert_eq!(trap.trap_code(), Some(TrapCode::IntegerDivisionByZero));
        assert_eq!(trap.to_string(), "integer divide by zero");
        assert_eq!(reached, 1);
        assert!(!in_trap_scope());
    }

    #[test]
    fn user_trap_keeps_the_error() {
        let result: Result<(), Trap> = unsafe {
            catch_traps_default(|| {
                raise_user_trap(Box::new(OutOfFuel(7)));
            })
        };
        let trap = result.unwrap_err();
        assert_eq!(trap.to_string(), "out of fuel after 7 steps");
        assert_eq!(trap.downcast_ref::<OutOfFuel>(), Some(&OutOfFuel(7)));
        assert_eq!(trap.downcast::<OutOfFuel>().unwrap(), OutOfFuel(7));
    }

    #[test]
    fn downcast_of_other_traps_fails() {
        let trap = Trap::from(TrapCode::StackOverflow);
        assert!(trap.downcast_ref::<OutOfFuel>().is_none());
        let trap = trap.downcast::<OutOfFuel>().unwrap_err();
        assert_eq!(trap.trap_code(), Some(TrapCode::StackOverflow));
    }

    #[test]
    fn raw_abandon_of_current_snapshot() {
        let result: Result<(), Trap> = unsafe {
            catch_traps_default(|| {
                let snapshot = current_snapshot().unwrap();
                jump::abandon(snapshot);
            })
        };
        assert!(matches!(result, Err(Trap::Abandoned)));
        assert_eq!(current_snapshot(), None);
    }

    #[test]
    fn scope_is_registered_while_running() {
        assert!(!in_trap_scope());
        let inside = unsafe { catch_traps_default(|| (in_trap_scope(), current_snapshot())) };
        let (in_scope, snapshot) = inside.unwrap();
        assert!(in_scope);
        assert!(snapshot.is_some());
        assert!(!in_trap_scope());
    }

    #[test]
    fn unpublished_scope_is_not_a_trap_scope() {
        let state = CallThreadState::new();
        let (in_scope, snapshot) = tls::set(&state, || (in_trap_scope(), current_snapshot()));
        assert!(!in_scope);
        assert_eq!(snapshot, None);

        let raised = panic::catch_unwind(AssertUnwindSafe(|| {
            tls::set(&state, || unsafe {
                raise_lib_trap(TrapCode::Interrupt);
            })
        }));
        let payload = raised.unwrap_err();
        let message = payload.downcast_ref::<String>().unwrap();
        assert_eq!(message, "raise_lib_trap called outside of a trap scope");
        assert!(!in_trap_scope());
    }

    #[test]
    fn returned_scope_is_unpublished_before_unlinking() {
        let outer = unsafe {
            catch_traps_default(|| {
                let outer_snapshot = current_snapshot();
                let inner: Result<(), Trap> = catch_traps_default(|| {
                    raise_lib_trap(TrapCode::Interrupt);
                });
                assert_eq!(inner.unwrap_err().trap_code(), Some(TrapCode::Interrupt));
                let completed = catch_traps_default(current_snapshot).unwrap();
                assert_ne!(completed, outer_snapshot);
                (in_trap_scope(), current_snapshot() == outer_snapshot)
            })
        };
        assert_eq!(outer.unwrap(), (true, true));
        assert!(!in_trap_scope());
    }

    #[test]
    fn take_without_scope_fails() {
        let err = unsafe { TlsRestore::take() }.unwrap_err();
        assert_eq!(err, TlsError::NoActiveScope);
    }
}
