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
use crate::model::{
    attribute, CommitModelUploadResponse, StartModelUploadRequest, StartModelUploadResponse,
};
use crate::repo::model::{CreateModelOutcome, ModelRecord, ModelRepo};
use crate::repo::model_upload::{ModelUploadRecord, ModelUploadRepo};
use crate::service::model::artifact_path;
use crate::service::token::TokenService;
use async_trait::async_trait;
use bazaar_common::model::{DefaultPermission, JobStatus, ModelAccess, ModelId};
use bazaar_common::SafeDisplay;
use bazaar_service_base::repo::RepoError;
use bazaar_service_base::storage::{ByteStream, ObjectStore, StorageError};
use chrono::{Duration, Utc};
use futures::{StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const UPLOAD_TOKEN_TTL_HOURS: i64 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ModelUploadError {
    #[error("Duplicate model name: {0}")]
    DuplicateName(String),
    #[error("No upload session for model {0}")]
    SessionNotFound(ModelId),
    #[error("Out-of-order chunk: expected {expected}, got {got}")]
    ChunkOutOfOrder { expected: i64, got: i64 },
    #[error("Checksum mismatch: declared {declared}, computed {computed}")]
    ChecksumMismatch { declared: String, computed: String },
    #[error("Upload session is already committed")]
    AlreadyCommitted,
    #[error("Commit without any uploaded chunks")]
    NoChunks,
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for ModelUploadError {
    fn to_safe_string(&self) -> String {
        match self {
            ModelUploadError::Storage(inner) => inner.to_safe_string(),
            ModelUploadError::InternalRepoError(inner) => inner.to_safe_string(),
            other => other.to_string(),
        }
    }
}

fn chunk_path(model_id: &ModelId, chunk_idx: i64) -> String {
    format!("models/{model_id}/chunks/{chunk_idx:08}")
}

fn chunks_prefix(model_id: &ModelId) -> String {
    format!("models/{model_id}/chunks/")
}

/// Chunked, resumable upload of an already trained model artifact. Chunks
/// are staged as indexed objects in strict order; commit streams the
/// concatenation into the final artifact while hashing it.
#[async_trait]
pub trait ModelUploadService: Send + Sync {
    async fn start(
        &self,
        auth: &Authorisation,
        request: &StartModelUploadRequest,
    ) -> Result<StartModelUploadResponse, ModelUploadError>;

    async fn put_chunk(
        &self,
        job: &JobAuthorisation,
        chunk_idx: i64,
        data: ByteStream,
    ) -> Result<(), ModelUploadError>;

    async fn commit(
        &self,
        job: &JobAuthorisation,
    ) -> Result<CommitModelUploadResponse, ModelUploadError>;
}

pub struct ModelUploadServiceDefault {
    model_repo: Arc<dyn ModelRepo>,
    model_upload_repo: Arc<dyn ModelUploadRepo>,
    object_store: Arc<dyn ObjectStore>,
    token_service: Arc<TokenService>,
}

impl ModelUploadServiceDefault {
    pub fn new(
        model_repo: Arc<dyn ModelRepo>,
        model_upload_repo: Arc<dyn ModelUploadRepo>,
        object_store: Arc<dyn ObjectStore>,
        token_service: Arc<TokenService>,
    ) -> Self {
        Self {
            model_repo,
            model_upload_repo,
            object_store,
            token_service,
        }
    }

    async fn session(&self, model_id: &ModelId) -> Result<ModelUploadRecord, ModelUploadError> {
        self.model_upload_repo
            .get(&model_id.0)
            .await?
            .ok_or(ModelUploadError::SessionNotFound(*model_id))
    }

    /// SHA-256 over the staged chunks in index order, streamed.
    async fn digest_chunks(
        &self,
        model_id: &ModelId,
        chunk_count: i64,
    ) -> Result<String, ModelUploadError> {
        let mut hasher = Sha256::new();
        for chunk_idx in 0..chunk_count {
            let mut stream = self.object_store.get(&chunk_path(model_id, chunk_idx)).await?;
            while let Some(piece) = stream.next().await {
                hasher.update(&piece.map_err(StorageError::Io)?);
            }
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// The ordered concatenation of all staged chunks as one stream.
    fn concatenated_chunks(&self, model_id: &ModelId, chunk_count: i64) -> ByteStream {
        let store = self.object_store.clone();
        let paths: Vec<String> = (0..chunk_count)
            .map(|chunk_idx| chunk_path(model_id, chunk_idx))
            .collect();

        Box::pin(
            futures::stream::iter(paths)
                .then(move |path| {
                    let store = store.clone();
                    async move {
                        store
                            .get(&path)
                            .await
                            .map_err(|err| std::io::Error::other(err.to_string()))
                    }
                })
                .try_flatten(),
        )
    }
}

#[async_trait]
impl ModelUploadService for ModelUploadServiceDefault {
    async fn start(
        &self,
        auth: &Authorisation,
        request: &StartModelUploadRequest,
    ) -> Result<StartModelUploadResponse, ModelUploadError> {
        if request.model_name.is_empty() {
            return Err(ModelUploadError::InvalidInput(
                "model_name must not be empty".to_string(),
            ));
        }

        let now = Utc::now();
        let record = ModelRecord {
            id: Uuid::new_v4(),
            name: request.model_name.clone(),
            model_type: request.model_type.as_str().to_string(),
            owner_id: auth.user.id.0,
            parent_id: None,
            team_id: None,
            access: ModelAccess::Private.as_str().to_string(),
            default_permission: DefaultPermission::Read.as_str().to_string(),
            train_status: JobStatus::NotStarted.as_str().to_string(),
            deploy_status: JobStatus::NotStarted.as_str().to_string(),
            published_at: None,
            created_at: now,
            train_status_updated_at: now,
            deploy_status_updated_at: now,
        };

        match self.model_repo.create(&record, &[], &[]).await? {
            CreateModelOutcome::Created => {}
            CreateModelOutcome::DuplicateName => {
                return Err(ModelUploadError::DuplicateName(request.model_name.clone()))
            }
            other => {
                return Err(ModelUploadError::InvalidInput(format!(
                    "unexpected creation outcome: {other:?}"
                )))
            }
        }

        let model_id = ModelId(record.id);
        self.model_upload_repo
            .create(&ModelUploadRecord {
                model_id: record.id,
                declared_checksum: request.checksum.clone(),
                next_chunk: 0,
                bytes_received: 0,
                committed: false,
            })
            .await?;

        let upload_token = self.token_service.issue_job_token(
            &model_id,
            JobTokenRole::Upload,
            Duration::hours(UPLOAD_TOKEN_TTL_HOURS),
        );

        Ok(StartModelUploadResponse {
            model_id,
            upload_token,
        })
    }

    async fn put_chunk(
        &self,
        job: &JobAuthorisation,
        chunk_idx: i64,
        data: ByteStream,
    ) -> Result<(), ModelUploadError> {
        let session = self.session(&job.model_id).await?;
        if session.committed {
            return Err(ModelUploadError::AlreadyCommitted);
        }
        if chunk_idx != session.next_chunk {
            return Err(ModelUploadError::ChunkOutOfOrder {
                expected: session.next_chunk,
                got: chunk_idx,
            });
        }

        let received = Arc::new(AtomicU64::new(0));
        let counted = {
            let received = received.clone();
            data.inspect_ok(move |piece| {
                received.fetch_add(piece.len() as u64, Ordering::Relaxed);
            })
        };
        self.object_store
            .put(&chunk_path(&job.model_id, chunk_idx), Box::pin(counted))
            .await?;

        let advanced = self
            .model_upload_repo
            .advance(
                &job.model_id.0,
                chunk_idx,
                received.load(Ordering::Relaxed) as i64,
            )
            .await?;
        if !advanced {
            // lost a race against a concurrent sender of the same chunk
            let session = self.session(&job.model_id).await?;
            return Err(ModelUploadError::ChunkOutOfOrder {
                expected: session.next_chunk,
                got: chunk_idx,
            });
        }
        Ok(())
    }

    async fn commit(
        &self,
        job: &JobAuthorisation,
    ) -> Result<CommitModelUploadResponse, ModelUploadError> {
        let session = self.session(&job.model_id).await?;
        if session.committed {
            return Err(ModelUploadError::AlreadyCommitted);
        }
        if session.next_chunk == 0 {
            return Err(ModelUploadError::NoChunks);
        }

        let computed = self.digest_chunks(&job.model_id, session.next_chunk).await?;
        if let Some(declared) = &session.declared_checksum {
            if !declared.eq_ignore_ascii_case(&computed) {
                // leave the model row in not_started; the client restarts
                // the upload from chunk zero
                self.model_upload_repo.reset(&job.model_id.0).await?;
                self.object_store
                    .delete_prefix(&chunks_prefix(&job.model_id))
                    .await?;
                return Err(ModelUploadError::ChecksumMismatch {
                    declared: declared.clone(),
                    computed,
                });
            }
        }

        let artifact = self.concatenated_chunks(&job.model_id, session.next_chunk);
        self.object_store
            .put(&artifact_path(&job.model_id), artifact)
            .await?;

        if !self.model_upload_repo.mark_committed(&job.model_id.0).await? {
            return Err(ModelUploadError::AlreadyCommitted);
        }
        self.model_repo
            .update_train_status(
                &job.model_id.0,
                &[JobStatus::NotStarted],
                JobStatus::Complete,
            )
            .await?;
        self.model_repo
            .set_attribute(&job.model_id.0, attribute::CHECKSUM, &computed)
            .await?;
        self.object_store
            .delete_prefix(&chunks_prefix(&job.model_id))
            .await?;

        info!(model_id = %job.model_id, checksum = %computed, "Model upload committed");
        Ok(CommitModelUploadResponse {
            model_id: job.model_id,
            checksum: computed,
        })
    }
}
