//! Strongly-typed identifiers for domain entities.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! define_id {
    ($name:ident, $prefix:expr) => {
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
            Deserialize,
            schemars::JsonSchema,
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

define_id!(RunId, "run");
define_id!(RunnerId, "rnr");
define_id!(DispatchId, "dsp");

/// Identifies one job execution inside a run.
///
/// Plain jobs use their definition id; matrix expansions append the
/// combination index, e.g. `test[2]`.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn expanded(job_id: &str, index: usize) -> Self {
        Self(format!("{}[{}]", job_id, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The definition id this key was expanded from.
    pub fn job_id(&self) -> &str {
        match self.0.rfind('[') {
            Some(pos) if self.0.ends_with(']') => &self.0[..pos],
            _ => &self.0,
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
