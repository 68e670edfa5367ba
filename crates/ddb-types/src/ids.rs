use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", $label, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                $name(value)
            }
        }
    };
}

define_id!(
    /// Identifier of a deduplication store.
    StoreId,
    "store"
);
define_id!(
    /// Identifier of one partition (index shard) of a store.
    SubstoreId,
    "substore"
);
define_id!(
    /// Identifier of an immutable write unit.
    VolumeId,
    "volume"
);
define_id!(
    /// Identifier handed out by the job scheduler. `JobId::NONE` (0) is never
    /// assigned to a real job and marks "no snapshot".
    JobId,
    "job"
);

impl JobId {
    pub const NONE: JobId = JobId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}
