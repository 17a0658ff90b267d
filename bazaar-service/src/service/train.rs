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
    attribute, CreateCompositeRequest, FileDescriptor, FileLocation, JobOptions, LogLine,
    LogSource, LogsResponse, NlpDatagenRequest, RetrainNdbRequest, StatusResponse, TrainConfig,
    TrainNdbRequest, TrainNlpRequest, TrainResponse, WorkerStatus,
};
use crate::orchestrator::{
    stop_job_if_exists, train_job_name, JobSpec, MountSpec, OrchestratorClient, OrchestratorError,
};
use crate::repo::job_log::JobLogRepo;
use crate::repo::model::{CreateModelOutcome, ModelRecord, ModelRepo};
use crate::service::model::ModelService;
use crate::service::token::TokenService;
use crate::service::upload::{UploadError, UploadService};
use async_trait::async_trait;
use bazaar_common::model::{
    DefaultPermission, JobStatus, JobType, LogLevel, ModelAccess, ModelId, ModelType, UploadId,
};
use bazaar_common::SafeDisplay;
use bazaar_service_base::repo::RepoError;
use bazaar_service_base::storage::{ObjectStore, StorageError};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

pub const CPU_MHZ_PER_CORE: u64 = 2400;
const JOB_TOKEN_TTL_DAYS: i64 = 1000;
const DEFAULT_TRAIN_MEMORY_MB: u64 = 2000;

#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("Model not found: {0}")]
    ModelNotFound(ModelId),
    #[error("Duplicate model name: {0}")]
    DuplicateName(String),
    #[error("Parent model not found: {0}")]
    ParentMissing(ModelId),
    #[error("Parent model {0} has not completed training")]
    ParentNotComplete(ModelId),
    #[error("Dependency model not found: {0}")]
    DependencyMissing(ModelId),
    #[error("No training report available for model {0}")]
    ReportNotFound(ModelId),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Upload(#[from] UploadError),
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

impl SafeDisplay for TrainError {
    fn to_safe_string(&self) -> String {
        match self {
            TrainError::Upload(inner) => inner.to_safe_string(),
            TrainError::License(inner) => inner.to_safe_string(),
            TrainError::Orchestrator(inner) => inner.to_safe_string(),
            TrainError::Storage(inner) => inner.to_safe_string(),
            TrainError::Model(inner) => inner.to_safe_string(),
            TrainError::InternalRepoError(inner) => inner.to_safe_string(),
            TrainError::Internal(_) => "Internal error".to_string(),
            other => other.to_string(),
        }
    }
}

pub fn train_config_path(model_id: &ModelId) -> String {
    format!("models/{model_id}/train_config.json")
}

pub fn train_reports_prefix(model_id: &ModelId) -> String {
    format!("models/{model_id}/train_reports/")
}

/// Union of the orchestrator's stdout/stderr capture and the worker-posted
/// log rows; stored rows keep their timestamps and chronological order.
pub(crate) async fn collect_job_logs(
    orchestrator: &dyn OrchestratorClient,
    job_log_repo: &dyn JobLogRepo,
    model_id: &Uuid,
    job_type: JobType,
    job_name: &str,
) -> Result<LogsResponse, TrainError> {
    let mut logs = Vec::new();

    for chunk in orchestrator.job_logs(job_name).await? {
        if !chunk.stdout.is_empty() {
            logs.push(LogLine {
                source: LogSource::OrchestratorStdout,
                level: None,
                message: chunk.stdout,
                timestamp: None,
            });
        }
        if !chunk.stderr.is_empty() {
            logs.push(LogLine {
                source: LogSource::OrchestratorStderr,
                level: None,
                message: chunk.stderr,
                timestamp: None,
            });
        }
    }

    for record in job_log_repo.list(model_id, job_type.as_str()).await? {
        logs.push(LogLine {
            source: LogSource::Worker,
            level: LogLevel::from_str(&record.level).ok(),
            message: record.message,
            timestamp: Some(record.created_at),
        });
    }

    Ok(LogsResponse { logs })
}

#[async_trait]
pub trait TrainService: Send + Sync {
    async fn train_ndb(
        &self,
        auth: &Authorisation,
        request: &TrainNdbRequest,
    ) -> Result<TrainResponse, TrainError>;

    /// Fine-tunes an existing completed NDB model; lineage is recorded via
    /// `parent_id`.
    async fn retrain_ndb(
        &self,
        auth: &Authorisation,
        request: &RetrainNdbRequest,
    ) -> Result<TrainResponse, TrainError>;

    async fn train_nlp(
        &self,
        auth: &Authorisation,
        model_type: ModelType,
        request: &TrainNlpRequest,
    ) -> Result<TrainResponse, TrainError>;

    /// LLM-generated training data; the worker generates a data set from the
    /// task prompt and then trains the target NLP model.
    async fn datagen(
        &self,
        auth: &Authorisation,
        request: &NlpDatagenRequest,
    ) -> Result<TrainResponse, TrainError>;

    /// Composite models are assembled from trained sub-models: the row is
    /// created complete, with dependency edges instead of a job.
    async fn create_composite(
        &self,
        auth: &Authorisation,
        model_type: ModelType,
        request: &CreateCompositeRequest,
    ) -> Result<TrainResponse, TrainError>;

    async fn status(&self, model_id: &ModelId) -> Result<StatusResponse, TrainError>;

    async fn report(&self, model_id: &ModelId) -> Result<serde_json::Value, TrainError>;

    async fn logs(&self, model_id: &ModelId) -> Result<LogsResponse, TrainError>;

    async fn update_status(
        &self,
        job: &JobAuthorisation,
        status: WorkerStatus,
    ) -> Result<(), TrainError>;

    async fn append_log(
        &self,
        job: &JobAuthorisation,
        level: LogLevel,
        message: &str,
    ) -> Result<(), TrainError>;
}

pub struct TrainServiceDefault {
    model_repo: Arc<dyn ModelRepo>,
    job_log_repo: Arc<dyn JobLogRepo>,
    model_service: Arc<dyn ModelService>,
    upload_service: Arc<dyn UploadService>,
    license: Arc<LicenseVerifier>,
    orchestrator: Arc<dyn OrchestratorClient>,
    token_service: Arc<TokenService>,
    object_store: Arc<dyn ObjectStore>,
    images: WorkerImagesConfig,
    storage_mount_source: String,
}

impl TrainServiceDefault {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model_repo: Arc<dyn ModelRepo>,
        job_log_repo: Arc<dyn JobLogRepo>,
        model_service: Arc<dyn ModelService>,
        upload_service: Arc<dyn UploadService>,
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
            upload_service,
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

    fn new_record(
        &self,
        auth: &Authorisation,
        name: &str,
        model_type: ModelType,
        parent_id: Option<ModelId>,
        train_status: JobStatus,
    ) -> ModelRecord {
        let now = Utc::now();
        ModelRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            model_type: model_type.as_str().to_string(),
            owner_id: auth.user.id.0,
            parent_id: parent_id.map(|id| id.0),
            team_id: None,
            access: ModelAccess::Private.as_str().to_string(),
            default_permission: DefaultPermission::Read.as_str().to_string(),
            train_status: train_status.as_str().to_string(),
            deploy_status: JobStatus::NotStarted.as_str().to_string(),
            published_at: None,
            created_at: now,
            train_status_updated_at: now,
            deploy_status_updated_at: now,
        }
    }

    fn map_create_outcome(
        outcome: CreateModelOutcome,
        name: &str,
        parent_id: Option<ModelId>,
    ) -> Result<(), TrainError> {
        match outcome {
            CreateModelOutcome::Created => Ok(()),
            CreateModelOutcome::DuplicateName => Err(TrainError::DuplicateName(name.to_string())),
            CreateModelOutcome::ParentMissing => Err(TrainError::ParentMissing(
                parent_id.unwrap_or(ModelId(Uuid::nil())),
            )),
            CreateModelOutcome::ParentNotComplete => Err(TrainError::ParentNotComplete(
                parent_id.unwrap_or(ModelId(Uuid::nil())),
            )),
            CreateModelOutcome::DependencyMissing(id) => {
                Err(TrainError::DependencyMissing(ModelId(id)))
            }
        }
    }

    /// Normalizes file descriptors: upload references are ownership-checked
    /// and rewritten to their staging prefix, other locations pass through.
    async fn normalize_descriptors(
        &self,
        auth: &Authorisation,
        data: Vec<FileDescriptor>,
    ) -> Result<Vec<FileDescriptor>, TrainError> {
        let mut normalized = Vec::with_capacity(data.len());
        for mut descriptor in data {
            if descriptor.path.is_empty() {
                return Err(TrainError::InvalidInput(
                    "file descriptor path must not be empty".to_string(),
                ));
            }
            if descriptor.location == FileLocation::Upload {
                let raw = descriptor
                    .path
                    .trim_start_matches("uploads/")
                    .split('/')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                let upload_id = UploadId::from_str(&raw).map_err(TrainError::InvalidInput)?;
                self.upload_service
                    .verify_owned(&upload_id, &auth.user.id)
                    .await?;
                descriptor.path = format!("uploads/{upload_id}");
            }
            normalized.push(descriptor);
        }
        Ok(normalized)
    }

    async fn submit(
        &self,
        auth: &Authorisation,
        name: &str,
        model_type: ModelType,
        parent_id: Option<ModelId>,
        data: Vec<FileDescriptor>,
        model_options: HashMap<String, String>,
        job_options: &JobOptions,
        attributes: Vec<(String, String)>,
    ) -> Result<TrainResponse, TrainError> {
        if name.is_empty() {
            return Err(TrainError::InvalidInput(
                "model_name must not be empty".to_string(),
            ));
        }

        let data = self.normalize_descriptors(auth, data).await?;

        let cpu_mhz = job_options.allocation_cores.max(1) as u64 * CPU_MHZ_PER_CORE;
        let license_payload = self.license.verify(cpu_mhz).await?;

        let record = self.new_record(auth, name, model_type, parent_id, JobStatus::NotStarted);
        Self::map_create_outcome(
            self.model_repo.create(&record, &[], &attributes).await?,
            name,
            parent_id,
        )?;
        let model_id = ModelId(record.id);

        let job_token = self.token_service.issue_job_token(
            &model_id,
            JobTokenRole::Train,
            Duration::days(JOB_TOKEN_TTL_DAYS),
        );
        let config = TrainConfig {
            model_id,
            model_type,
            license_payload,
            job_token: job_token.clone(),
            callback_base_url: self.callback_base_url(),
            data,
            model_options,
        };
        let config_bytes = serde_json::to_vec_pretty(&config)
            .map_err(|err| TrainError::Internal(err.to_string()))?;
        self.object_store
            .put_bytes(&train_config_path(&model_id), config_bytes)
            .await?;

        let memory_mb = job_options
            .allocation_memory_mb
            .unwrap_or(DEFAULT_TRAIN_MEMORY_MB);
        let job_name = train_job_name(&model_id);
        let spec = JobSpec {
            name: job_name.clone(),
            image: Some(self.images.train.clone()),
            script: None,
            cpu_mhz,
            memory_mb,
            memory_max_mb: memory_mb * 4,
            autoscaling: None,
            env: HashMap::from([
                ("MODEL_ID".to_string(), model_id.to_string()),
                ("JOB_TOKEN".to_string(), job_token),
                ("CONFIG_PATH".to_string(), train_config_path(&model_id)),
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
                    .update_train_status(
                        &record.id,
                        &[JobStatus::NotStarted],
                        JobStatus::Starting,
                    )
                    .await?;
                info!(model_id = %model_id, job = %job_name, "Training started");
                Ok(TrainResponse { model_id })
            }
            Err(err) => {
                error!(model_id = %model_id, "Failed to start training job: {err}");
                self.model_repo
                    .update_train_status(&record.id, &[JobStatus::NotStarted], JobStatus::Failed)
                    .await?;
                self.job_log_repo
                    .append(
                        &record.id,
                        JobType::Train.as_str(),
                        LogLevel::Error.as_str(),
                        &format!("failed to submit training job: {err}"),
                    )
                    .await?;
                Err(err.into())
            }
        }
    }
}

#[async_trait]
impl TrainService for TrainServiceDefault {
    async fn train_ndb(
        &self,
        auth: &Authorisation,
        request: &TrainNdbRequest,
    ) -> Result<TrainResponse, TrainError> {
        if request.data.is_empty() {
            return Err(TrainError::InvalidInput(
                "ndb training requires at least one data file".to_string(),
            ));
        }
        self.submit(
            auth,
            &request.model_name,
            ModelType::Ndb,
            None,
            request.data.clone(),
            request.model_options.clone(),
            &request.job_options,
            Vec::new(),
        )
        .await
    }

    async fn retrain_ndb(
        &self,
        auth: &Authorisation,
        request: &RetrainNdbRequest,
    ) -> Result<TrainResponse, TrainError> {
        self.submit(
            auth,
            &request.model_name,
            ModelType::Ndb,
            Some(request.base_model_id),
            Vec::new(),
            HashMap::new(),
            &request.job_options,
            Vec::new(),
        )
        .await
    }

    async fn train_nlp(
        &self,
        auth: &Authorisation,
        model_type: ModelType,
        request: &TrainNlpRequest,
    ) -> Result<TrainResponse, TrainError> {
        if !matches!(model_type, ModelType::NlpToken | ModelType::NlpText) {
            return Err(TrainError::InvalidInput(format!(
                "not an NLP model type: {model_type}"
            )));
        }
        if request.data.is_empty() {
            return Err(TrainError::InvalidInput(
                "nlp training requires at least one data file".to_string(),
            ));
        }
        self.submit(
            auth,
            &request.model_name,
            model_type,
            None,
            request.data.clone(),
            request.model_options.clone(),
            &request.job_options,
            Vec::new(),
        )
        .await
    }

    async fn datagen(
        &self,
        auth: &Authorisation,
        request: &NlpDatagenRequest,
    ) -> Result<TrainResponse, TrainError> {
        if !matches!(request.target_type, ModelType::NlpToken | ModelType::NlpText) {
            return Err(TrainError::InvalidInput(format!(
                "datagen target must be an NLP model type, got {}",
                request.target_type
            )));
        }
        if request.task_prompt.is_empty() {
            return Err(TrainError::InvalidInput(
                "task_prompt must not be empty".to_string(),
            ));
        }

        let mut model_options = request.model_options.clone();
        model_options.insert("task_prompt".to_string(), request.task_prompt.clone());
        model_options.insert("datagen".to_string(), "true".to_string());

        let mut attributes = Vec::new();
        if let Some(llm_provider) = &request.llm_provider {
            attributes.push((attribute::LLM_PROVIDER.to_string(), llm_provider.clone()));
        }

        self.submit(
            auth,
            &request.model_name,
            request.target_type,
            None,
            Vec::new(),
            model_options,
            &request.job_options,
            attributes,
        )
        .await
    }

    async fn create_composite(
        &self,
        auth: &Authorisation,
        model_type: ModelType,
        request: &CreateCompositeRequest,
    ) -> Result<TrainResponse, TrainError> {
        if !model_type.is_composite() {
            return Err(TrainError::InvalidInput(format!(
                "not a composite model type: {model_type}"
            )));
        }
        if request.dependency_ids.is_empty() {
            return Err(TrainError::InvalidInput(
                "a composite model requires at least one dependency".to_string(),
            ));
        }

        let mut has_retrieval = false;
        for dependency in &request.dependency_ids {
            let record = self
                .model_repo
                .get(&dependency.0)
                .await?
                .ok_or(TrainError::DependencyMissing(*dependency))?;
            if record.model_type == ModelType::Ndb.as_str() {
                has_retrieval = true;
            }
        }
        if !has_retrieval {
            return Err(TrainError::InvalidInput(
                "a composite model requires an ndb dependency".to_string(),
            ));
        }

        // assembled, not trained: the composite's own status is complete and
        // its effective status is the read-time rollup over dependencies
        let record = self.new_record(
            auth,
            &request.model_name,
            model_type,
            None,
            JobStatus::Complete,
        );
        let dependencies: Vec<Uuid> = request.dependency_ids.iter().map(|id| id.0).collect();
        Self::map_create_outcome(
            self.model_repo
                .create(&record, &dependencies, &[])
                .await?,
            &request.model_name,
            None,
        )?;

        Ok(TrainResponse {
            model_id: ModelId(record.id),
        })
    }

    async fn status(&self, model_id: &ModelId) -> Result<StatusResponse, TrainError> {
        let record = self
            .model_repo
            .get(&model_id.0)
            .await?
            .ok_or(TrainError::ModelNotFound(*model_id))?;
        let status = self.model_service.effective_train_status(&record).await?;
        Ok(StatusResponse {
            model_id: *model_id,
            status,
        })
    }

    async fn report(&self, model_id: &ModelId) -> Result<serde_json::Value, TrainError> {
        self.model_repo
            .get(&model_id.0)
            .await?
            .ok_or(TrainError::ModelNotFound(*model_id))?;

        let mut reports = self
            .object_store
            .list(&train_reports_prefix(model_id))
            .await?;
        reports.sort();
        let latest = reports.pop().ok_or(TrainError::ReportNotFound(*model_id))?;

        let bytes = self.object_store.get_bytes(&latest).await?;
        serde_json::from_slice(&bytes).map_err(|err| TrainError::Internal(err.to_string()))
    }

    async fn logs(&self, model_id: &ModelId) -> Result<LogsResponse, TrainError> {
        self.model_repo
            .get(&model_id.0)
            .await?
            .ok_or(TrainError::ModelNotFound(*model_id))?;
        collect_job_logs(
            self.orchestrator.as_ref(),
            self.job_log_repo.as_ref(),
            &model_id.0,
            JobType::Train,
            &train_job_name(model_id),
        )
        .await
    }

    async fn update_status(
        &self,
        job: &JobAuthorisation,
        status: WorkerStatus,
    ) -> Result<(), TrainError> {
        let from: &[JobStatus] = match status {
            WorkerStatus::InProgress => &[JobStatus::Starting],
            WorkerStatus::Complete | WorkerStatus::Failed => {
                &[JobStatus::Starting, JobStatus::InProgress]
            }
        };
        // resent terminal statuses affect zero rows; that is the idempotent
        // path and still a success for the worker
        self.model_repo
            .update_train_status(&job.model_id.0, from, status.into())
            .await?;
        Ok(())
    }

    async fn append_log(
        &self,
        job: &JobAuthorisation,
        level: LogLevel,
        message: &str,
    ) -> Result<(), TrainError> {
        self.job_log_repo
            .append(
                &job.model_id.0,
                JobType::Train.as_str(),
                level.as_str(),
                message,
            )
            .await?;
        Ok(())
    }
}
