//! Trap codes describing the reason for a trap.

use core::fmt::{self, Display, Formatter};
use core::str::FromStr;
#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A trap code describing the reason for a trap.
///
/// Trap codes are plain `Copy` data so a fault handler can record one
/// without allocating.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, Error)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
#[repr(u32)]
pub enum TrapCode {
    /// The current stack space was exhausted.
    StackOverflow = 0,

    /// A memory access fell outside of the guest's linear memory.
    HeapAccessOutOfBounds = 1,

    /// A memory access was misaligned.
    HeapMisaligned = 2,

    /// A table access was out of bounds.
    TableAccessOutOfBounds = 3,

    /// Indirect call to a null table entry.
    IndirectCallToNull = 4,

    /// Signature mismatch on indirect call.
    BadSignature = 5,

    /// An integer arithmetic operation caused an overflow.
    IntegerOverflow = 6,

    /// An integer division by zero.
    IntegerDivisionByZero = 7,

    /// Failed float-to-int conversion.
    BadConversionToInteger = 8,

    /// Code that was supposed to have been unreachable was reached.
    UnreachableCodeReached = 9,

    /// An atomic memory access was attempted with an unaligned pointer.
    UnalignedAtomic = 10,

    /// Execution was interrupted from outside the guest.
    Interrupt = 11,
}

impl TrapCode {
    /// Every trap code, in discriminant order.
    pub const ALL: [Self; 12] = [
        Self::StackOverflow,
        Self::HeapAccessOutOfBounds,
        Self::HeapMisaligned,
        Self::TableAccessOutOfBounds,
        Self::IndirectCallToNull,
        Self::BadSignature,
        Self::IntegerOverflow,
        Self::IntegerDivisionByZero,
        Self::BadConversionToInteger,
        Self::UnreachableCodeReached,
        Self::UnalignedAtomic,
        Self::Interrupt,
    ];

    /// Gets the message for this trap code
    pub fn message(&self) -> &'static str {
        match self {
            Self::StackOverflow => "call stack exhausted",
            Self::HeapAccessOutOfBounds => "out of bounds memory access",
            Self::HeapMisaligned => "misaligned heap",
            Self::TableAccessOutOfBounds => "undefined element: out of bounds table access",
            Self::IndirectCallToNull => "uninitialized element",
            Self::BadSignature => "indirect call type mismatch",
            Self::IntegerOverflow => "integer overflow",
            Self::IntegerDivisionByZero => "integer divide by zero",
            Self::BadConversionToInteger => "invalid conversion to integer",
            Self::UnreachableCodeReached => "unreachable",
            Self::UnalignedAtomic => "unaligned atomic access",
            Self::Interrupt => "interrupted",
        }
    }

    /// Short identifier used by `Display` and `FromStr`.
    fn identifier(&self) -> &'static str {
        match self {
            Self::StackOverflow => "stk_ovf",
            Self::HeapAccessOutOfBounds => "heap_get_oob",
            Self::HeapMisaligned => "heap_misaligned",
            Self::TableAccessOutOfBounds => "table_get_oob",
            Self::IndirectCallToNull => "icall_null",
            Self::BadSignature => "bad_sig",
            Self::IntegerOverflow => "int_ovf",
            Self::IntegerDivisionByZero => "int_divz",
            Self::BadConversionToInteger => "bad_toint",
            Self::UnreachableCodeReached => "unreachable",
            Self::UnalignedAtomic => "unalign_atom",
            Self::Interrupt => "interrupt",
        }
    }
}

impl Display for TrapCode {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

/// Error returned when parsing an unknown [`TrapCode`] identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown trap code `{0}`")]
pub struct ParseTrapCodeError(String);

impl FromStr for TrapCode {
    type Err = ParseTrapCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|code| code.identifier() == s)
            .ok_or_else(|| ParseTrapCodeError(s.to_string()))
    }
}
