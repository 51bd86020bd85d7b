//! Interned key types identifying commands, groups, pools, and collapsers
//!
//! Keys are cheap to clone and hash and are stable for the process lifetime;
//! the [`Registry`](crate::registry::Registry) uses them to index per-key
//! statistics, breakers, and gates.

use std::fmt;
use std::sync::Arc;

macro_rules! key_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Arc<str>);

        impl $name {
            /// Create a key from a name
            #[must_use]
            pub fn new(name: impl AsRef<str>) -> Self {
                Self(Arc::from(name.as_ref()))
            }

            /// The key name
            #[must_use]
            pub fn name(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(name: &str) -> Self {
                Self::new(name)
            }
        }

        impl From<String> for $name {
            fn from(name: String) -> Self {
                Self::new(name)
            }
        }
    };
}

key_type! {
    /// Identifies one logical command type (breaker, metrics, and cache scope)
    CommandKey
}

key_type! {
    /// Groups related commands for reporting
    GroupKey
}

key_type! {
    /// Identifies the isolation pool a command executes on
    PoolKey
}

key_type! {
    /// Identifies a collapser and its batching window
    CollapserKey
}
