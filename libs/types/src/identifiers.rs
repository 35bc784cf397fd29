//! Typed identifiers
//!
//! Objects, nodes and timers are all addressed by plain integers on the wire.
//! Wrapping them keeps an object id from being passed where a node id is
//! expected. `-1` is the "no identity assigned" sentinel for every kind.

use serde::{Deserialize, Serialize};

/// Generate a typed integer identifier with a `DEFAULT` sentinel.
macro_rules! define_typed_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize
        )]
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Sentinel meaning "not assigned"
            pub const DEFAULT: Self = Self(-1);

            #[inline(always)]
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            #[inline(always)]
            pub const fn into_inner(self) -> i64 {
                self.0
            }

            /// True when this is the unassigned sentinel
            #[inline(always)]
            pub const fn is_default(&self) -> bool {
                self.0 == Self::DEFAULT.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::DEFAULT
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                if self.is_default() {
                    write!(f, "{}(-)", stringify!($name))
                } else {
                    write!(f, "{}({})", stringify!($name), self.0)
                }
            }
        }

        impl From<i64> for $name {
            #[inline(always)]
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            #[inline(always)]
            fn from(id: $name) -> i64 {
                id.0
            }
        }
    };
}

define_typed_id! {
    /// Identity of a runtime object (actor or manager)
    ObjectId
}

define_typed_id! {
    /// Identity of a node in the distributed directory
    NodeId
}

define_typed_id! {
    /// Identity of a timer ordered by an object
    TimerId
}
