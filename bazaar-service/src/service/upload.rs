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

use crate::auth::Authorisation;
use crate::model::Upload;
use crate::repo::upload::{UploadRecord, UploadRepo};
use async_trait::async_trait;
use bazaar_common::model::{UploadId, UserId};
use bazaar_common::SafeDisplay;
use bazaar_service_base::repo::RepoError;
use bazaar_service_base::storage::{ByteStream, ObjectStore, StorageError};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Upload not found: {0}")]
    NotFound(UploadId),
    #[error("Upload {0} belongs to a different user")]
    NotOwned(UploadId),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for UploadError {
    fn to_safe_string(&self) -> String {
        match self {
            UploadError::Storage(inner) => inner.to_safe_string(),
            UploadError::InternalRepoError(inner) => inner.to_safe_string(),
            other => other.to_string(),
        }
    }
}

pub fn upload_prefix(upload_id: &UploadId) -> String {
    format!("uploads/{upload_id}/")
}

/// Staging area for training inputs: a per-upload directory only the creator
/// may reference from a train request.
#[async_trait]
pub trait UploadService: Send + Sync {
    async fn create(&self, auth: &Authorisation) -> Result<Upload, UploadError>;

    async fn store_file(
        &self,
        upload_id: &UploadId,
        file_name: &str,
        data: ByteStream,
    ) -> Result<(), UploadError>;

    /// Fails with `NotOwned` when the upload exists but belongs to someone
    /// else; train requests use this before accepting an upload reference.
    async fn verify_owned(
        &self,
        upload_id: &UploadId,
        user_id: &UserId,
    ) -> Result<Upload, UploadError>;

    async fn list_files(&self, upload_id: &UploadId) -> Result<Vec<String>, UploadError>;
}

pub struct UploadServiceDefault {
    upload_repo: Arc<dyn UploadRepo>,
    object_store: Arc<dyn ObjectStore>,
}

impl UploadServiceDefault {
    pub fn new(upload_repo: Arc<dyn UploadRepo>, object_store: Arc<dyn ObjectStore>) -> Self {
        Self {
            upload_repo,
            object_store,
        }
    }

    fn sanitize_file_name(file_name: &str) -> Result<String, UploadError> {
        let name = file_name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .to_string();
        if name.is_empty() || name == "." || name == ".." {
            return Err(UploadError::InvalidInput(format!(
                "invalid file name: {file_name}"
            )));
        }
        Ok(name)
    }
}

#[async_trait]
impl UploadService for UploadServiceDefault {
    async fn create(&self, auth: &Authorisation) -> Result<Upload, UploadError> {
        let record = UploadRecord {
            id: Uuid::new_v4(),
            owner_id: auth.user.id.0,
            created_at: Utc::now(),
        };
        self.upload_repo.create(&record).await?;
        Ok(record.into())
    }

    async fn store_file(
        &self,
        upload_id: &UploadId,
        file_name: &str,
        data: ByteStream,
    ) -> Result<(), UploadError> {
        let name = Self::sanitize_file_name(file_name)?;
        let path = format!("{}{name}", upload_prefix(upload_id));
        self.object_store.put(&path, data).await?;
        Ok(())
    }

    async fn verify_owned(
        &self,
        upload_id: &UploadId,
        user_id: &UserId,
    ) -> Result<Upload, UploadError> {
        let record = self
            .upload_repo
            .get(&upload_id.0)
            .await?
            .ok_or(UploadError::NotFound(*upload_id))?;
        if record.owner_id != user_id.0 {
            return Err(UploadError::NotOwned(*upload_id));
        }
        Ok(record.into())
    }

    async fn list_files(&self, upload_id: &UploadId) -> Result<Vec<String>, UploadError> {
        Ok(self.object_store.list(&upload_prefix(upload_id)).await?)
    }
}
