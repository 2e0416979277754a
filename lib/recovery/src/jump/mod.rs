//! Recovery points and abandonment.
//!
//! [`recovery_point`] captures the host execution state of its own frame into
//! an [`ExecutionSnapshot`], publishes a pointer to that snapshot through an
//! out-parameter and then runs a unit of work. Any code running below it on
//! the same native stack, including a signal handler that interrupted that
//! code, may pass the published pointer to [`abandon`]. Control then lands
//! back in the recovery point, which reports [`CompletionStatus::Abandoned`]
//! instead of [`CompletionStatus::Completed`].
//!
//! Abandoning discards every frame between the call to [`abandon`] and the
//! recovery point without running any of their cleanup: no `Drop` impls run
//! and nothing those frames allocated is released. Any resource acquired in
//! that window leaks unless the embedder tracks it out of band. Frames that
//! can be abandoned should therefore only hold plain data.
//!
//! Neither operation allocates, takes a lock or logs, so [`abandon`] can be
//! called from a signal handler.

use crate::config::RecoveryConfig;
use std::ffi::c_void;
use std::fmt;

mod sigmask;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        use self::x86_64 as arch;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        use self::aarch64 as arch;
    } else {
        compile_error!("vm-recovery supports only x86_64 and aarch64 hosts");
    }
}

use self::sigmask::SavedMask;

/// Opaque pointer-sized value handed unmodified to the work function.
pub type WorkPayload = *mut c_void;

/// A unit of work run under a recovery point.
pub type WorkFn = unsafe extern "C" fn(WorkPayload);

/// How a call to [`recovery_point`] ended.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
#[must_use]
pub enum CompletionStatus {
    /// The work function returned normally.
    Completed,
    /// Something below the recovery point called [`abandon`] with its
    /// snapshot.
    Abandoned,
}

impl CompletionStatus {
    /// Returns `true` if the work returned normally.
    pub fn is_completed(self) -> bool {
        self == Self::Completed
    }

    /// Returns `true` if the recovery point was resumed through [`abandon`].
    pub fn is_abandoned(self) -> bool {
        self == Self::Abandoned
    }
}

/// Host execution state captured by [`recovery_point`].
///
/// The snapshot lives in the frame of the recovery point that created it and
/// is only valid until that frame returns. Code below the recovery point only
/// ever sees it through a `*const ExecutionSnapshot`; it cannot be copied or
/// moved out.
#[repr(C)]
pub struct ExecutionSnapshot {
    // Must stay the first field: the assembly addresses the registers
    // relative to the snapshot pointer.
    registers: arch::Registers,
    signal_mask: SavedMask,
}

impl fmt::Debug for ExecutionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionSnapshot")
            .field("signal_mask_saved", &self.signal_mask.is_saved())
            .finish_non_exhaustive()
    }
}

/// The arguments of a recovery point, read back on the capture path.
struct PendingCall {
    snapshot_out: *mut *const ExecutionSnapshot,
    work: WorkFn,
    payload: WorkPayload,
}

/// Entered from the architecture glue once the registers are stored.
///
/// Only ever runs on the original capture path.
unsafe fn run_pending(call: *mut PendingCall, snapshot: *const ExecutionSnapshot) {
    unsafe {
        let call = &*call;
        *call.snapshot_out = snapshot;
        (call.work)(call.payload);
    }
}

/// Runs `work(payload)` under a fresh recovery point using the default
/// [`RecoveryConfig`].
///
/// See [`recovery_point_with_config`].
///
/// # Safety
///
/// Same as [`recovery_point_with_config`].
pub unsafe fn recovery_point(
    snapshot_out: *mut *const ExecutionSnapshot,
    work: WorkFn,
    payload: WorkPayload,
) -> CompletionStatus {
    unsafe { recovery_point_with_config(&RecoveryConfig::default(), snapshot_out, work, payload) }
}

/// Runs `work(payload)` under a fresh recovery point.
///
/// The snapshot is captured first, then a pointer to it is written to
/// `snapshot_out`, and only then does `work` start. If `work` returns, the
/// result is [`CompletionStatus::Completed`]. If anything below calls
/// [`abandon`] with the published pointer, `work` is cut short and the
/// result is [`CompletionStatus::Abandoned`].
///
/// The published pointer must not be used once this function has returned.
/// Callers that stored it somewhere longer-lived should clear it.
///
/// # Safety
///
/// - `snapshot_out` must be valid for writes.
/// - Every frame that can be discarded by [`abandon`] must be safe to
///   discard without running its destructors.
/// - A panic escaping `work` aborts the process, since `work` is an
///   `extern "C"` function.
#[inline(never)]
pub unsafe fn recovery_point_with_config(
    config: &RecoveryConfig,
    snapshot_out: *mut *const ExecutionSnapshot,
    work: WorkFn,
    payload: WorkPayload,
) -> CompletionStatus {
    let mut snapshot = ExecutionSnapshot {
        registers: arch::Registers::default(),
        signal_mask: SavedMask::capture(config.signal_mask),
    };
    let mut call = PendingCall {
        snapshot_out,
        work,
        payload,
    };
    if unsafe { arch::capture(&mut snapshot, &mut call) } {
        CompletionStatus::Abandoned
    } else {
        CompletionStatus::Completed
    }
}

/// Resumes the recovery point that published `snapshot`.
///
/// Execution continues as if that recovery point returned
/// [`CompletionStatus::Abandoned`]. All frames in between are discarded
/// without running destructors. If the snapshot was taken with
/// [`SignalMaskPolicy::Preserve`](crate::SignalMaskPolicy::Preserve) the
/// thread's signal mask is reset to the captured one first.
///
/// This never allocates or locks and may be called from a signal handler.
///
/// # Safety
///
/// `snapshot` must have been published by a recovery point whose frame is
/// still live on the current thread's stack, below which the caller is
/// running.
pub unsafe fn abandon(snapshot: *const ExecutionSnapshot) -> ! {
    unsafe {
        (*snapshot).signal_mask.restore();
        arch::restore(snapshot)
    }
}
