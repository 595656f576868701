//! Strongly-typed identifiers for Gavel entities.
//!
//! Explicit wrapper types prevent bugs from mixing up a node id with a log
//! index or a term with a message number. All wrappers are 64-bit and
//! zero-cost.

use std::fmt;

/// Macro to generate strongly-typed u64 wrappers.
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new value from a raw u64.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next value in sequence.
            ///
            /// # Panics
            /// Panics on overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "id overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

define_id!(NodeId, "node", "Unique identifier for a Gavel node in the cluster.");
define_id!(TermId, "term", "Consensus term number; monotonically increasing logical epoch.");
define_id!(
    LogIndex,
    "idx",
    "Index into the replicated log. Indexes are 1-based; 0 is the none-sentinel."
);
define_id!(
    MsgSeq,
    "seq",
    "Per-destination monotonic message number used for FIFO duplicate rejection."
);

impl LogIndex {
    /// The sentinel meaning "no entry".
    pub const NONE: Self = Self(0);

    /// Returns the previous index, saturating at the sentinel.
    #[inline]
    #[must_use]
    pub const fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}
