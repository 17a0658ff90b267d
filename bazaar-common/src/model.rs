// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use poem_openapi::{Enum, NewType, Object};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

pub mod error {
    use poem_openapi::Object;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
    pub struct ErrorBody {
        pub error: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
    pub struct ErrorsBody {
        pub errors: Vec<String>,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize, Object)]
pub struct Empty {}

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            Ord,
            PartialOrd,
            Serialize,
            Deserialize,
            NewType,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new_v4() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|err| format!("Invalid {}: {err}", stringify!($name)))
            }
        }

        impl TryFrom<&str> for $name {
            type Error = String;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::from_str(value)
            }
        }
    };
}

uuid_id!(UserId);
uuid_id!(TeamId);
uuid_id!(ModelId);
uuid_id!(UploadId);
uuid_id!(ApiKeyId);
uuid_id!(BackupId);

macro_rules! str_enum {
    ($name:ident, $(($variant:ident, $repr:literal)),+ $(,)?) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $repr),+
                }
            }

            pub const ALL: &'static [$name] = &[$(Self::$variant),+];
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($repr => Ok(Self::$variant),)+
                    _ => Err(format!("Invalid {}: {s}", stringify!($name))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Enum)]
#[serde(rename_all = "kebab-case")]
#[oai(rename_all = "kebab-case")]
pub enum ModelType {
    Ndb,
    NlpToken,
    NlpText,
    EnterpriseSearch,
    KnowledgeExtraction,
}

str_enum!(
    ModelType,
    (Ndb, "ndb"),
    (NlpToken, "nlp-token"),
    (NlpText, "nlp-text"),
    (EnterpriseSearch, "enterprise-search"),
    (KnowledgeExtraction, "knowledge-extraction"),
);

impl ModelType {
    /// Composite models are assembled from already trained sub-models and
    /// carry dependency edges instead of a training job of their own.
    pub fn is_composite(&self) -> bool {
        matches!(self, Self::EnterpriseSearch | Self::KnowledgeExtraction)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum JobStatus {
    NotStarted,
    Starting,
    InProgress,
    Complete,
    Failed,
    Stopped,
}

str_enum!(
    JobStatus,
    (NotStarted, "not_started"),
    (Starting, "starting"),
    (InProgress, "in_progress"),
    (Complete, "complete"),
    (Failed, "failed"),
    (Stopped, "stopped"),
);

impl JobStatus {
    /// The orchestrator is (or should be) running a job for this status.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Stopped)
    }

    /// Statuses from which a fresh job start is allowed.
    pub fn may_start(&self) -> bool {
        matches!(self, Self::NotStarted | Self::Failed | Self::Stopped)
    }

    fn progress_rank(&self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::Starting => 1,
            Self::InProgress => 2,
            Self::Stopped => 3,
            Self::Failed => 4,
            Self::Complete => 5,
        }
    }

    /// Effective status of a model given the statuses of its transitive
    /// dependencies: failed dominates, complete requires everything
    /// complete, otherwise the least advanced in-flight status wins.
    pub fn rollup(own: JobStatus, dependencies: impl IntoIterator<Item = JobStatus>) -> JobStatus {
        let mut all = vec![own];
        all.extend(dependencies);

        if all.iter().any(|status| *status == JobStatus::Failed) {
            JobStatus::Failed
        } else if all.iter().all(|status| *status == JobStatus::Complete) {
            JobStatus::Complete
        } else {
            all.into_iter()
                .filter(|status| *status != JobStatus::Complete)
                .min_by_key(JobStatus::progress_rank)
                .unwrap_or(JobStatus::Complete)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum JobType {
    Train,
    Deploy,
}

str_enum!(JobType, (Train, "train"), (Deploy, "deploy"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

str_enum!(LogLevel, (Info, "info"), (Warning, "warning"), (Error, "error"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum ModelAccess {
    Private,
    Protected,
    Public,
}

str_enum!(
    ModelAccess,
    (Private, "private"),
    (Protected, "protected"),
    (Public, "public"),
);

/// What the audience selected by `ModelAccess` may do with the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum DefaultPermission {
    Read,
    Write,
}

str_enum!(DefaultPermission, (Read, "read"), (Write, "write"));

/// Effective permission of a user on a model. Ordered so that guards can be
/// written as `permission >= required`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Enum,
)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum ModelPermission {
    None,
    Read,
    Write,
    Owner,
}

str_enum!(
    ModelPermission,
    (None, "none"),
    (Read, "read"),
    (Write, "write"),
    (Owner, "owner"),
);

impl From<DefaultPermission> for ModelPermission {
    fn from(value: DefaultPermission) -> Self {
        match value {
            DefaultPermission::Read => ModelPermission::Read,
            DefaultPermission::Write => ModelPermission::Write,
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::from_str(status.as_str()), Ok(*status));
        }
    }

    #[test]
    fn rollup_failed_dominates() {
        let effective = JobStatus::rollup(
            JobStatus::Complete,
            [JobStatus::Complete, JobStatus::Failed, JobStatus::Starting],
        );
        assert_eq!(effective, JobStatus::Failed);
    }

    #[test]
    fn rollup_complete_requires_all_complete() {
        let effective = JobStatus::rollup(
            JobStatus::Complete,
            [JobStatus::Complete, JobStatus::Complete],
        );
        assert_eq!(effective, JobStatus::Complete);

        let effective = JobStatus::rollup(
            JobStatus::Complete,
            [JobStatus::Complete, JobStatus::InProgress],
        );
        assert_eq!(effective, JobStatus::InProgress);
    }

    #[test]
    fn rollup_least_advanced_wins() {
        let effective = JobStatus::rollup(
            JobStatus::Complete,
            [JobStatus::Starting, JobStatus::NotStarted],
        );
        assert_eq!(effective, JobStatus::NotStarted);
    }

    #[test]
    fn permissions_are_ordered() {
        assert!(ModelPermission::Owner > ModelPermission::Write);
        assert!(ModelPermission::Write > ModelPermission::Read);
        assert!(ModelPermission::Read > ModelPermission::None);
    }
}
