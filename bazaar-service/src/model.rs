use bazaar_common::model::{
    ApiKeyId, BackupId, DefaultPermission, JobStatus, LogLevel, ModelAccess, ModelId, ModelType,
    TeamId, UploadId, UserId,
};
use chrono::{DateTime, Utc};
use poem_openapi::{Enum, Object};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
pub struct VersionInfo {
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
pub struct HealthcheckResponse {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct SignupRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct Team {
    pub id: TeamId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct TeamMember {
    pub user_id: UserId,
    pub username: String,
    pub is_team_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct CreateTeamRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct Model {
    pub id: ModelId,
    pub name: String,
    pub model_type: ModelType,
    pub owner_id: UserId,
    pub parent_id: Option<ModelId>,
    pub team_id: Option<TeamId>,
    pub access: ModelAccess,
    pub default_permission: DefaultPermission,
    pub train_status: JobStatus,
    pub deploy_status: JobStatus,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct ModelInfo {
    pub model: Model,
    /// Rolled up over the model and its transitive dependencies.
    pub effective_train_status: JobStatus,
    pub dependencies: Vec<ModelId>,
}

/// Effective permission triple for the calling principal, with the token or
/// API key expiry when one applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct ModelPermissions {
    pub read: bool,
    pub write: bool,
    pub owner: bool,
    pub exp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct UpdateAccessRequest {
    pub access: ModelAccess,
    pub team_id: Option<TeamId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct UpdateDefaultPermissionRequest {
    pub permission: DefaultPermission,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct CreateApiKeyRequest {
    pub name: String,
    pub expires_at: DateTime<Utc>,
    /// Additional models besides the one in the request path.
    #[oai(default)]
    #[serde(default)]
    pub model_ids: Vec<ModelId>,
    #[oai(default)]
    #[serde(default)]
    pub all_models: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct ApiKey {
    pub id: ApiKeyId,
    pub name: String,
    pub created_by: UserId,
    pub expires_at: DateTime<Utc>,
    pub all_models: bool,
    pub model_ids: Vec<ModelId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct CreatedApiKey {
    /// The full secret; this is the only time it is returned.
    pub key: String,
    pub data: ApiKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct Upload {
    pub id: UploadId,
    pub owner_id: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum FileLocation {
    Upload,
    S3,
    Azure,
    Gcp,
    Local,
}

impl Display for FileLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let repr = match self {
            FileLocation::Upload => "upload",
            FileLocation::S3 => "s3",
            FileLocation::Azure => "azure",
            FileLocation::Gcp => "gcp",
            FileLocation::Local => "local",
        };
        write!(f, "{repr}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub path: String,
    pub location: FileLocation,
    pub source_id: Option<String>,
    #[oai(default)]
    #[serde(default)]
    pub options: HashMap<String, String>,
    #[oai(default)]
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct JobOptions {
    pub allocation_cores: u32,
    pub allocation_memory_mb: Option<u64>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            allocation_cores: 1,
            allocation_memory_mb: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct TrainNdbRequest {
    pub model_name: String,
    pub data: Vec<FileDescriptor>,
    #[oai(default)]
    #[serde(default)]
    pub model_options: HashMap<String, String>,
    #[oai(default)]
    #[serde(default)]
    pub job_options: JobOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct RetrainNdbRequest {
    pub model_name: String,
    pub base_model_id: ModelId,
    #[oai(default)]
    #[serde(default)]
    pub job_options: JobOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct TrainNlpRequest {
    pub model_name: String,
    pub data: Vec<FileDescriptor>,
    #[oai(default)]
    #[serde(default)]
    pub model_options: HashMap<String, String>,
    #[oai(default)]
    #[serde(default)]
    pub job_options: JobOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct NlpDatagenRequest {
    pub model_name: String,
    /// Which NLP model the generated data trains: nlp-token or nlp-text.
    pub target_type: ModelType,
    pub task_prompt: String,
    pub llm_provider: Option<String>,
    #[oai(default)]
    #[serde(default)]
    pub model_options: HashMap<String, String>,
    #[oai(default)]
    #[serde(default)]
    pub job_options: JobOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct CreateCompositeRequest {
    pub model_name: String,
    pub dependency_ids: Vec<ModelId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct TrainResponse {
    pub model_id: ModelId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct UploadDataResponse {
    pub upload_id: UploadId,
}

/// The statuses a worker may report back; the control plane owns the rest of
/// the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum WorkerStatus {
    InProgress,
    Complete,
    Failed,
}

impl From<WorkerStatus> for JobStatus {
    fn from(value: WorkerStatus) -> Self {
        match value {
            WorkerStatus::InProgress => JobStatus::InProgress,
            WorkerStatus::Complete => JobStatus::Complete,
            WorkerStatus::Failed => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct UpdateStatusRequest {
    pub status: WorkerStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct WorkerLogRequest {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct StatusResponse {
    pub model_id: ModelId,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum LogSource {
    Worker,
    OrchestratorStdout,
    OrchestratorStderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct LogLine {
    pub source: LogSource,
    pub level: Option<LogLevel>,
    pub message: String,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct LogsResponse {
    pub logs: Vec<LogLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct DeployRequest {
    pub deployment_name: Option<String>,
    #[oai(default)]
    #[serde(default)]
    pub autoscaling: bool,
    #[oai(default = "default_min_instances")]
    #[serde(default = "default_min_instances")]
    pub min_instances: u32,
    #[oai(default = "default_max_instances")]
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
    /// Requested memory in MB; values below 500 fall back to the model's
    /// size-in-memory metadata or the 1000 MB default.
    pub memory_mb: Option<u64>,
}

fn default_min_instances() -> u32 {
    1
}

fn default_max_instances() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct DeployResponse {
    pub model_id: ModelId,
    pub status: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct StartModelUploadRequest {
    pub model_name: String,
    pub model_type: ModelType,
    /// SHA-256 of the final artifact, verified at commit when declared.
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct StartModelUploadResponse {
    pub model_id: ModelId,
    pub upload_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct CommitModelUploadResponse {
    pub model_id: ModelId,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct Backup {
    pub id: BackupId,
    pub path: String,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
pub struct DeleteResponse {}

/// Everything a training worker needs, serialized to
/// `models/<model_id>/train_config.json` before the job starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainConfig {
    pub model_id: ModelId,
    pub model_type: ModelType,
    pub license_payload: String,
    pub job_token: String,
    pub callback_base_url: String,
    pub data: Vec<FileDescriptor>,
    pub model_options: HashMap<String, String>,
}

/// Serialized to `models/<model_id>/deploy_config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployConfig {
    pub model_id: ModelId,
    pub model_type: ModelType,
    pub deployment_name: String,
    pub license_payload: String,
    pub job_token: String,
    pub callback_base_url: String,
    pub autoscaling: bool,
    pub min_instances: u32,
    pub max_instances: u32,
    pub memory_mb: u64,
}

/// Attribute keys with platform-level meaning.
pub mod attribute {
    pub const LLM_PROVIDER: &str = "llm_provider";
    pub const METADATA: &str = "metadata";
    pub const CHECKSUM: &str = "checksum";
}

/// Parses `size_in_memory` (bytes) out of the `metadata` attribute JSON.
pub fn size_in_memory_bytes(attributes: &HashMap<String, String>) -> Option<u64> {
    let metadata = attributes.get(attribute::METADATA)?;
    let value: serde_json::Value = serde_json::from_str(metadata).ok()?;
    value.get("size_in_memory")?.as_u64()
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(WorkerStatus::InProgress),
            "complete" => Ok(WorkerStatus::Complete),
            "failed" => Ok(WorkerStatus::Failed),
            _ => Err(format!("Invalid WorkerStatus: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn size_in_memory_parses_metadata_attribute() {
        let mut attributes = HashMap::new();
        attributes.insert(
            attribute::METADATA.to_string(),
            r#"{"size_in_memory": 2500000000, "sources": 3}"#.to_string(),
        );
        assert_eq!(size_in_memory_bytes(&attributes), Some(2_500_000_000));
    }

    #[test]
    fn size_in_memory_missing_or_malformed_is_none() {
        assert_eq!(size_in_memory_bytes(&HashMap::new()), None);

        let mut attributes = HashMap::new();
        attributes.insert(attribute::METADATA.to_string(), "not json".to_string());
        assert_eq!(size_in_memory_bytes(&attributes), None);
    }
}
