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

use crate::auth::{Authorisation, JobAuthorisation, JobTokenRole};
use crate::config::WorkerImagesConfig;
use crate::license::{LicenseError, LicenseVerifier};
use crate::model::{
    attribute, size_in_memory_bytes, DeployConfig, DeployRequest, DeployResponse, LogsResponse,
    StatusResponse, WorkerStatus,
};
use crate::orchestrator::{
    deploy_job_name, stop_job_if_exists, AutoscalingBounds, JobSpec, JobState, MountSpec,
    OrchestratorClient, OrchestratorError, ON_PREM_LLM_JOB,
};
use crate::repo::job_log::JobLogRepo;
use crate::repo::model::{ModelRecord, ModelRepo};
use crate::service::model::ModelService;
use crate::service::token::TokenService;
use crate::service::train::{collect_job_logs, TrainError, CPU_MHZ_PER_CORE};
use async_trait::async_trait;
use bazaar_common::model::{JobStatus, JobType, LogLevel, ModelId, ModelType};
use bazaar_common::SafeDisplay;
use bazaar_service_base::repo::RepoError;
use bazaar_service_base::storage::{ObjectStore, StorageError};
use chrono::Duration;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info};

const JOB_TOKEN_TTL_DAYS: i64 = 1000;
const MIN_USER_MEMORY_MB: u64 = 500;
const DEFAULT_MEMORY_MB: u64 = 1000;
const LLM_JOB_CORES: u64 = 4;
const LLM_JOB_MEMORY_MB: u64 = 8000;

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("Model not found: {0}")]
    ModelNotFound(ModelId),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Dependency {0} has not completed training")]
    DependencyNotComplete(ModelId),
    #[error("Model {0} is still used by {1} non-stopped model(s)")]
    DependencyInUse(ModelId, usize),
    #[error(transparent)]
    License(#[from] LicenseError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Model(#[from] crate::service::model::ModelError),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SafeDisplay for DeployError {
    fn to_safe_string(&self) -> String {
        match self {
            DeployError::License(inner) => inner.to_safe_string(),
            DeployError::Orchestrator(inner) => inner.to_safe_string(),
            DeployError::Storage(inner) => inner.to_safe_string(),
            DeployError::Model(inner) => inner.to_safe_string(),
            DeployError::InternalRepoError(inner) => inner.to_safe_string(),
            DeployError::Internal(_) => "Internal error".to_string(),
            other => other.to_string(),
        }
    }
}

pub fn deploy_config_path(model_id: &ModelId) -> String {
    format!("models/{model_id}/deploy_config.json")
}

/// Memory reservation precedence: an explicit request of at least 500 MB
/// wins, then the model's size-in-memory metadata (bytes scaled to MB plus
/// headroom), then the 1000 MB default.
pub fn memory_reservation_mb(
    requested_mb: Option<u64>,
    attributes: &HashMap<String, String>,
) -> u64 {
    if let Some(requested) = requested_mb {
        if requested >= MIN_USER_MEMORY_MB {
            return requested;
        }
    }
    if let Some(bytes) = size_in_memory_bytes(attributes) {
        return bytes / 1_000_000 + 1000;
    }
    DEFAULT_MEMORY_MB
}

#[async_trait]
pub trait DeployService: Send + Sync {
    async fn deploy(
        &self,
        auth: &Authorisation,
        model_id: &ModelId,
        request: &DeployRequest,
    ) -> Result<DeployResponse, DeployError>;

    /// Stops the deployment; rejected while non-stopped downstream models
    /// depend on this one.
    async fn undeploy(&self, model_id: &ModelId) -> Result<(), DeployError>;

    async fn status(&self, model_id: &ModelId) -> Result<StatusResponse, DeployError>;

    /// Raw deploy status for the worker's own polling.
    async fn status_internal(&self, job: &JobAuthorisation) -> Result<StatusResponse, DeployError>;

    async fn logs(&self, model_id: &ModelId) -> Result<LogsResponse, DeployError>;

    async fn update_status(
        &self,
        job: &JobAuthorisation,
        status: WorkerStatus,
    ) -> Result<(), DeployError>;

    async fn append_log(
        &self,
        job: &JobAuthorisation,
        level: LogLevel,
        message: &str,
    ) -> Result<(), DeployError>;
}

pub struct DeployServiceDefault {
    model_repo: Arc<dyn ModelRepo>,
    job_log_repo: Arc<dyn JobLogRepo>,
    model_service: Arc<dyn ModelService>,
    license: Arc<LicenseVerifier>,
    orchestrator: Arc<dyn OrchestratorClient>,
    token_service: Arc<TokenService>,
    object_store: Arc<dyn ObjectStore>,
    images: WorkerImagesConfig,
    storage_mount_source: String,
}

impl DeployServiceDefault {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model_repo: Arc<dyn ModelRepo>,
        job_log_repo: Arc<dyn JobLogRepo>,
        model_service: Arc<dyn ModelService>,
        license: Arc<LicenseVerifier>,
        orchestrator: Arc<dyn OrchestratorClient>,
        token_service: Arc<TokenService>,
        object_store: Arc<dyn ObjectStore>,
        images: WorkerImagesConfig,
        storage_mount_source: String,
    ) -> Self {
        Self {
            model_repo,
            job_log_repo,
            model_service,
            license,
            orchestrator,
            token_service,
            object_store,
            images,
            storage_mount_source,
        }
    }

    fn callback_base_url(&self) -> String {
        format!("http://{}/api/v2", self.orchestrator.ingress_hostname())
    }

    async fn require_model(&self, model_id: &ModelId) -> Result<ModelRecord, DeployError> {
        self.model_repo
            .get(&model_id.0)
            .await?
            .ok_or(DeployError::ModelNotFound(*model_id))
    }

    /// The deployed model and every transitive dependency must have
    /// completed training.
    async fn ensure_train_complete(&self, record: &ModelRecord) -> Result<(), DeployError> {
        if record.train_status != JobStatus::Complete.as_str() {
            return Err(DeployError::InvalidState(format!(
                "model {} train status is {}",
                record.id, record.train_status
            )));
        }
        for dependency in self
            .model_service
            .list_dependencies(&ModelId(record.id))
            .await?
        {
            if dependency.id != record.id
                && dependency.train_status != JobStatus::Complete.as_str()
            {
                return Err(DeployError::DependencyNotComplete(ModelId(dependency.id)));
            }
        }
        Ok(())
    }

    /// Idempotent start of the shared on-prem LLM job used by models that
    /// declare `llm_provider = "on-prem"`.
    async fn ensure_on_prem_llm(&self) -> Result<(), DeployError> {
        let info = self.orchestrator.job_info(ON_PREM_LLM_JOB).await?;
        if info.status == JobState::Running {
            return Ok(());
        }

        stop_job_if_exists(self.orchestrator.as_ref(), ON_PREM_LLM_JOB).await?;
        self.orchestrator
            .start_job(&JobSpec {
                name: ON_PREM_LLM_JOB.to_string(),
                image: Some(self.images.llm.clone()),
                script: None,
                cpu_mhz: LLM_JOB_CORES * CPU_MHZ_PER_CORE,
                memory_mb: LLM_JOB_MEMORY_MB,
                memory_max_mb: LLM_JOB_MEMORY_MB * 4,
                autoscaling: None,
                env: HashMap::new(),
                mounts: vec![MountSpec {
                    source: self.storage_mount_source.clone(),
                    target: "/data".to_string(),
                }],
            })
            .await?;
        info!(job = ON_PREM_LLM_JOB, "Started shared on-prem LLM job");
        Ok(())
    }
}

#[async_trait]
impl DeployService for DeployServiceDefault {
    async fn deploy(
        &self,
        auth: &Authorisation,
        model_id: &ModelId,
        request: &DeployRequest,
    ) -> Result<DeployResponse, DeployError> {
        let record = self.require_model(model_id).await?;
        self.ensure_train_complete(&record).await?;

        let current = JobStatus::from_str(&record.deploy_status).unwrap_or(JobStatus::Failed);
        if !current.may_start() {
            return Err(DeployError::InvalidState(format!(
                "deployment of model {model_id} is already {current}"
            )));
        }

        let attributes: HashMap<String, String> = self
            .model_repo
            .get_attributes(&record.id)
            .await?
            .into_iter()
            .collect();

        let cpu_mhz = CPU_MHZ_PER_CORE;
        let license_payload = self.license.verify(cpu_mhz).await?;

        if attributes.get(attribute::LLM_PROVIDER).map(String::as_str) == Some("on-prem") {
            self.ensure_on_prem_llm().await?;
        }

        let memory_mb = memory_reservation_mb(request.memory_mb, &attributes);
        let deployment_name = request
            .deployment_name
            .clone()
            .unwrap_or_else(|| record.name.clone());

        let job_token = self.token_service.issue_job_token(
            model_id,
            JobTokenRole::Deploy,
            Duration::days(JOB_TOKEN_TTL_DAYS),
        );
        let model_type = ModelType::from_str(&record.model_type)
            .map_err(DeployError::Internal)?;
        let config = DeployConfig {
            model_id: *model_id,
            model_type,
            deployment_name,
            license_payload,
            job_token: job_token.clone(),
            callback_base_url: self.callback_base_url(),
            autoscaling: request.autoscaling,
            min_instances: request.min_instances,
            max_instances: request.max_instances.max(request.min_instances),
            memory_mb,
        };
        let config_bytes = serde_json::to_vec_pretty(&config)
            .map_err(|err| DeployError::Internal(err.to_string()))?;
        self.object_store
            .put_bytes(&deploy_config_path(model_id), config_bytes)
            .await?;

        let job_name = deploy_job_name(model_id);
        let spec = JobSpec {
            name: job_name.clone(),
            image: Some(self.images.deploy.clone()),
            script: None,
            cpu_mhz,
            memory_mb,
            memory_max_mb: memory_mb * 4,
            autoscaling: request.autoscaling.then_some(AutoscalingBounds {
                min_instances: request.min_instances,
                max_instances: request.max_instances.max(request.min_instances),
            }),
            env: HashMap::from([
                ("MODEL_ID".to_string(), model_id.to_string()),
                ("JOB_TOKEN".to_string(), job_token),
                ("CONFIG_PATH".to_string(), deploy_config_path(model_id)),
                ("CALLBACK_BASE_URL".to_string(), self.callback_base_url()),
            ]),
            mounts: vec![MountSpec {
                source: self.storage_mount_source.clone(),
                target: "/data".to_string(),
            }],
        };

        stop_job_if_exists(self.orchestrator.as_ref(), &job_name).await?;
        match self.orchestrator.start_job(&spec).await {
            Ok(()) => {
                self.model_repo
                    .update_deploy_status(
                        &record.id,
                        &[JobStatus::NotStarted, JobStatus::Failed, JobStatus::Stopped],
                        JobStatus::Starting,
                    )
                    .await?;
                info!(model_id = %model_id, job = %job_name, actor = %auth.user.id, "Deployment started");
                Ok(DeployResponse {
                    model_id: *model_id,
                    status: JobStatus::Starting,
                })
            }
            Err(err) => {
                error!(model_id = %model_id, "Failed to start deployment job: {err}");
                self.model_repo
                    .update_deploy_status(
                        &record.id,
                        &[JobStatus::NotStarted, JobStatus::Failed, JobStatus::Stopped],
                        JobStatus::Failed,
                    )
                    .await?;
                self.job_log_repo
                    .append(
                        &record.id,
                        JobType::Deploy.as_str(),
                        LogLevel::Error.as_str(),
                        &format!("failed to submit deployment job: {err}"),
                    )
                    .await?;
                Err(err.into())
            }
        }
    }

    async fn undeploy(&self, model_id: &ModelId) -> Result<(), DeployError> {
        let record = self.require_model(model_id).await?;

        let blocking = self.model_service.has_blocking_dependents(model_id).await?;
        if blocking > 0 {
            return Err(DeployError::DependencyInUse(*model_id, blocking));
        }

        stop_job_if_exists(self.orchestrator.as_ref(), &deploy_job_name(model_id)).await?;
        // stopped wins from any prior state
        self.model_repo
            .update_deploy_status(
                &record.id,
                &[
                    JobStatus::NotStarted,
                    JobStatus::Starting,
                    JobStatus::InProgress,
                    JobStatus::Complete,
                    JobStatus::Failed,
                ],
                JobStatus::Stopped,
            )
            .await?;
        info!(model_id = %model_id, "Deployment stopped");
        Ok(())
    }

    async fn status(&self, model_id: &ModelId) -> Result<StatusResponse, DeployError> {
        let record = self.require_model(model_id).await?;
        Ok(StatusResponse {
            model_id: *model_id,
            status: JobStatus::from_str(&record.deploy_status)
                .unwrap_or(JobStatus::Failed),
        })
    }

    async fn status_internal(
        &self,
        job: &JobAuthorisation,
    ) -> Result<StatusResponse, DeployError> {
        self.status(&job.model_id).await
    }

    async fn logs(&self, model_id: &ModelId) -> Result<LogsResponse, DeployError> {
        self.require_model(model_id).await?;
        collect_job_logs(
            self.orchestrator.as_ref(),
            self.job_log_repo.as_ref(),
            &model_id.0,
            JobType::Deploy,
            &deploy_job_name(model_id),
        )
        .await
        .map_err(|err| match err {
            TrainError::Orchestrator(inner) => DeployError::Orchestrator(inner),
            TrainError::InternalRepoError(inner) => DeployError::InternalRepoError(inner),
            other => DeployError::Internal(other.to_string()),
        })
    }

    async fn update_status(
        &self,
        job: &JobAuthorisation,
        status: WorkerStatus,
    ) -> Result<(), DeployError> {
        let from: &[JobStatus] = match status {
            WorkerStatus::InProgress => &[JobStatus::Starting],
            WorkerStatus::Complete | WorkerStatus::Failed => {
                &[JobStatus::Starting, JobStatus::InProgress]
            }
        };
        self.model_repo
            .update_deploy_status(&job.model_id.0, from, status.into())
            .await?;
        Ok(())
    }

    async fn append_log(
        &self,
        job: &JobAuthorisation,
        level: LogLevel,
        message: &str,
    ) -> Result<(), DeployError> {
        self.job_log_repo
            .append(
                &job.model_id.0,
                JobType::Deploy.as_str(),
                level.as_str(),
                message,
            )
            .await?;
        Ok(())
    }
}
