//! Row identifiers.
//!
//! Every persisted row is keyed by a store-assigned integer. Each table gets
//! its own newtype so a stage id can never be passed where a build id is
//! expected. The zero value means "not yet persisted".

use derive_more::Display;
use serde::{Deserialize, Serialize};

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
            Serialize, Deserialize, Display,
        )]
        #[serde(transparent)]
        #[display("{_0}")]
        pub struct $name(pub i64);

        impl $name {
            /// Whether the row has been assigned an id by the store.
            pub fn is_set(&self) -> bool {
                self.0 != 0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

row_id!(
    /// Identifies a build.
    BuildId
);
row_id!(
    /// Identifies a stage.
    StageId
);
row_id!(
    /// Identifies a step.
    StepId
);
row_id!(
    /// Identifies a repository.
    RepoId
);
row_id!(
    /// Identifies a user.
    UserId
);
