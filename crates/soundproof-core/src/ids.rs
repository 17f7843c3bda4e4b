//! Opaque entity identifiers.
//!
//! Ids are small monotonic integers allocated process-locally by [`IdGen`].
//! `-1` is the shared "invalid" sentinel. The model stores only ids, never
//! references, so entities can refer to each other without ownership cycles.

use std::sync::atomic::{AtomicI64, Ordering};

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub i64);

        impl $name {
            /// The sentinel "no such entity" value.
            pub const INVALID: Self = Self(-1);

            #[must_use]
            pub fn is_valid(self) -> bool {
                self.0 >= 0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::INVALID
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id! {
    /// A set of sandboxes sharing one processing epoch.
    GroupId
}
entity_id! {
    /// A child process hosting plugin instances.
    SandboxId
}
entity_id! {
    /// One plugin instance inside a sandbox.
    DeviceId
}
entity_id! {
    /// One factory entry inside a scanned plugin file.
    PluginId
}
entity_id! {
    /// A scanned plugin file on disk.
    PlugfileId
}

/// Index of a parameter within a device's parameter table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParamIdx(pub usize);

impl ParamIdx {
    pub const INVALID: Self = Self(usize::MAX);

    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 != usize::MAX
    }
}

impl Default for ParamIdx {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Monotonic id allocator shared by every entity kind.
#[derive(Debug, Default)]
pub struct IdGen(AtomicI64);

impl IdGen {
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub fn next(&self) -> i64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}
