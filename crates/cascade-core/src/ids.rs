//! Strongly-typed identifiers for domain entities.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! define_id {
    ($name:ident, $prefix:expr) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let uuid_str = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ok(Self(Uuid::parse_str(uuid_str)?))
            }
        }
    };
}

define_id!(ProjectId, "prj");
define_id!(ApplicationId, "app");
define_id!(PipelineId, "pip");
define_id!(EnvironmentId, "env");
define_id!(StageId, "stg");
define_id!(JobId, "job");
define_id!(TriggerId, "trg");
define_id!(BuildId, "bld");
define_id!(BuildJobId, "abd");
define_id!(WorkerId, "wrk");

impl EnvironmentId {
    /// The "no environment" sentinel used by build pipelines.
    pub const NONE: EnvironmentId = EnvironmentId(Uuid::nil());

    pub fn is_none(&self) -> bool {
        self.0.is_nil()
    }
}
