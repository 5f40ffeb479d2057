//! Identifiers for pools, processes and channels, and where fresh ones come from.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            #[must_use]
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$name> for Uuid {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

define_id!(
    /// Scope that owns processes and the lock ticket they commit under.
    PoolId
);
define_id!(
    /// One process execution.
    ProcessId
);
define_id!(
    /// A channel; keeps its id for the whole session.
    ChannelId
);

/// Source of fresh identifiers.
pub trait IdSource: Send + Sync {
    fn fresh(&self) -> Uuid;
}

/// Random v4 identifiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIds;

impl IdSource for RandomIds {
    fn fresh(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Deterministic identifiers `1, 2, 3, ...`, for tests and replay.
#[derive(Debug, Default)]
pub struct SequentialIds {
    issued: AtomicU64,
}

impl SequentialIds {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue after `issued` identifiers, e.g. when resuming a restored store.
    #[must_use]
    pub fn starting_after(issued: u64) -> Self {
        Self {
            issued: AtomicU64::new(issued),
        }
    }
}

impl IdSource for SequentialIds {
    fn fresh(&self) -> Uuid {
        let n = self.issued.fetch_add(1, Ordering::Relaxed) + 1;
        Uuid::from_u128(u128::from(n))
    }
}
