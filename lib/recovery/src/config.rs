//! Runtime configuration for recovery points.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What a recovery point does with the thread signal mask.
///
/// A trap raised from a signal handler leaves the handler without returning
/// from it, so whatever mask the kernel installed for the handler stays in
/// effect after the jump unless it is put back explicitly.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, Default)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "enable-serde", serde(rename_all = "kebab-case"))]
pub enum SignalMaskPolicy {
    /// Leave the signal mask alone.
    ///
    /// Capturing and restoring never enter the kernel. This is the right
    /// choice when the embedder never changes the mask and installs its
    /// fault handlers with `SA_NODEFER`.
    #[default]
    Ignore,
    /// Record the mask when the recovery point is set up and reinstall it
    /// on abandonment.
    ///
    /// Has no effect on targets without signal masks.
    Preserve,
}

impl SignalMaskPolicy {
    /// Whether the mask is saved and restored.
    pub fn preserves_mask(self) -> bool {
        self == Self::Preserve
    }
}

impl Display for SignalMaskPolicy {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Ignore => "ignore",
            Self::Preserve => "preserve",
        })
    }
}

/// Error returned when parsing an unknown [`SignalMaskPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown signal mask policy `{0}`, expected `ignore` or `preserve`")]
pub struct ParseSignalMaskPolicyError(String);

impl FromStr for SignalMaskPolicy {
    type Err = ParseSignalMaskPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ignore" => Ok(Self::Ignore),
            "preserve" => Ok(Self::Preserve),
            other => Err(ParseSignalMaskPolicyError(other.to_string())),
        }
    }
}

/// Configuration shared by [`recovery_point_with_config`] and
/// [`catch_traps`].
///
/// [`recovery_point_with_config`]: crate::recovery_point_with_config
/// [`catch_traps`]: crate::catch_traps
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, Default)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "enable-serde", serde(default, rename_all = "kebab-case"))]
pub struct RecoveryConfig {
    /// Signal mask handling, see [`SignalMaskPolicy`].
    pub signal_mask: SignalMaskPolicy,
}

impl RecoveryConfig {
    /// Creates a configuration with the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the signal mask policy.
    pub fn signal_mask(mut self, policy: SignalMaskPolicy) -> Self {
        self.signal_mask = policy;
        self
    }

    /// Shorthand for choosing between [`SignalMaskPolicy::Preserve`] and
    /// [`SignalMaskPolicy::Ignore`].
    pub fn preserve_signal_mask(self, enable: bool) -> Self {
        self.signal_mask(if enable {
            SignalMaskPolicy::Preserve
        } else {
            SignalMaskPolicy::Ignore
        })
    }
}
