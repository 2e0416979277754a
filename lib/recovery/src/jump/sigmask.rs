//! Optional save/restore of the thread signal mask around a recovery point.

use crate::config::SignalMaskPolicy;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use std::mem::MaybeUninit;
        use std::ptr;

        pub(super) struct SavedMask {
            saved: bool,
            set: MaybeUninit<libc::sigset_t>,
        }

        impl SavedMask {
            pub(super) fn capture(policy: SignalMaskPolicy) -> Self {
                let mut set = MaybeUninit::uninit();
                let saved = match policy {
                    SignalMaskPolicy::Ignore => false,
                    // Passing a null `set` only reads the current mask, this
                    // cannot fail.
                    SignalMaskPolicy::Preserve => unsafe {
                        libc::pthread_sigmask(libc::SIG_SETMASK, ptr::null(), set.as_mut_ptr())
                            == 0
                    },
                };
                Self { saved, set }
            }

            pub(super) fn is_saved(&self) -> bool {
                self.saved
            }

            /// Reinstalls the captured mask. `pthread_sigmask` is
            /// async-signal-safe.
            pub(super) unsafe fn restore(&self) {
                if self.saved {
                    unsafe {
                        libc::pthread_sigmask(
                            libc::SIG_SETMASK,
                            self.set.as_ptr(),
                            ptr::null_mut(),
                        );
                    }
                }
            }
        }
    } else {
        // No signal masks here; `Preserve` degrades to `Ignore`.
        pub(super) struct SavedMask;

        impl SavedMask {
            pub(super) fn capture(_policy: SignalMaskPolicy) -> Self {
                SavedMask
            }

            pub(super) fn is_saved(&self) -> bool {
                false
            }

            pub(super) unsafe fn restore(&self) {}
        }
    }
}
