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
use crate::model::Backup;
use crate::repo::api_key::ApiKeyRepo;
use crate::repo::backup::{BackupRecord, BackupRepo};
use crate::repo::job_log::JobLogRepo;
use crate::repo::model::ModelRepo;
use crate::repo::team::TeamRepo;
use crate::repo::upload::UploadRepo;
use crate::repo::user::UserRepo;
use async_trait::async_trait;
use bazaar_common::SafeDisplay;
use bazaar_service_base::repo::RepoError;
use bazaar_service_base::storage::{ObjectStore, StorageError};
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
    #[error("Backup serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SafeDisplay for BackupError {
    fn to_safe_string(&self) -> String {
        match self {
            BackupError::Storage(inner) => inner.to_safe_string(),
            BackupError::InternalRepoError(inner) => inner.to_safe_string(),
            BackupError::Serialization(_) => "Backup serialization failed".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct BackupManifest {
    created_at: chrono::DateTime<Utc>,
    tables: BTreeMap<String, usize>,
    checksums: BTreeMap<String, String>,
}

/// Snapshots the relational state as JSON table dumps plus a manifest under
/// `backups/<timestamp>/`; artifacts already live in the object store.
#[async_trait]
pub trait BackupService: Send + Sync {
    async fn create(&self, auth: &Authorisation) -> Result<Backup, BackupError>;

    async fn list(&self) -> Result<Vec<Backup>, BackupError>;
}

pub struct BackupServiceDefault {
    user_repo: Arc<dyn UserRepo>,
    team_repo: Arc<dyn TeamRepo>,
    model_repo: Arc<dyn ModelRepo>,
    upload_repo: Arc<dyn UploadRepo>,
    api_key_repo: Arc<dyn ApiKeyRepo>,
    job_log_repo: Arc<dyn JobLogRepo>,
    backup_repo: Arc<dyn BackupRepo>,
    object_store: Arc<dyn ObjectStore>,
}

impl BackupServiceDefault {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_repo: Arc<dyn UserRepo>,
        team_repo: Arc<dyn TeamRepo>,
        model_repo: Arc<dyn ModelRepo>,
        upload_repo: Arc<dyn UploadRepo>,
        api_key_repo: Arc<dyn ApiKeyRepo>,
        job_log_repo: Arc<dyn JobLogRepo>,
        backup_repo: Arc<dyn BackupRepo>,
        object_store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            user_repo,
            team_repo,
            model_repo,
            upload_repo,
            api_key_repo,
            job_log_repo,
            backup_repo,
            object_store,
        }
    }

    async fn dump_table<T: Serialize>(
        &self,
        prefix: &str,
        table: &str,
        rows: &[T],
        manifest_tables: &mut BTreeMap<String, usize>,
        manifest_checksums: &mut BTreeMap<String, String>,
    ) -> Result<(), BackupError> {
        let bytes = serde_json::to_vec_pretty(rows)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        manifest_checksums.insert(table.to_string(), hex::encode(hasher.finalize()));
        manifest_tables.insert(table.to_string(), rows.len());

        self.object_store
            .put_bytes(&format!("{prefix}/db/{table}.json"), bytes)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BackupService for BackupServiceDefault {
    async fn create(&self, auth: &Authorisation) -> Result<Backup, BackupError> {
        let created_at = Utc::now();
        let prefix = format!("backups/{}", created_at.format("%Y%m%d%H%M%S"));

        let mut tables = BTreeMap::new();
        let mut checksums = BTreeMap::new();

        let users = self.user_repo.list().await?;
        self.dump_table(&prefix, "users", &users, &mut tables, &mut checksums)
            .await?;
        let teams = self.team_repo.list().await?;
        self.dump_table(&prefix, "teams", &teams, &mut tables, &mut checksums)
            .await?;
        let team_members = self.team_repo.list_all_members().await?;
        self.dump_table(
            &prefix,
            "team_members",
            &team_members,
            &mut tables,
            &mut checksums,
        )
        .await?;
        let models = self.model_repo.list().await?;
        self.dump_table(&prefix, "models", &models, &mut tables, &mut checksums)
            .await?;
        let attributes = self.model_repo.list_all_attributes().await?;
        self.dump_table(
            &prefix,
            "model_attributes",
            &attributes,
            &mut tables,
            &mut checksums,
        )
        .await?;
        let dependencies = self.model_repo.list_all_dependencies().await?;
        self.dump_table(
            &prefix,
            "model_dependencies",
            &dependencies,
            &mut tables,
            &mut checksums,
        )
        .await?;
        let uploads = self.upload_repo.list_all().await?;
        self.dump_table(&prefix, "uploads", &uploads, &mut tables, &mut checksums)
            .await?;
        let api_keys = self.api_key_repo.list_all().await?;
        self.dump_table(&prefix, "api_keys", &api_keys, &mut tables, &mut checksums)
            .await?;
        let job_logs = self.job_log_repo.list_all().await?;
        self.dump_table(&prefix, "job_logs", &job_logs, &mut tables, &mut checksums)
            .await?;

        let manifest = BackupManifest {
            created_at,
            tables,
            checksums,
        };
        self.object_store
            .put_bytes(
                &format!("{prefix}/manifest.json"),
                serde_json::to_vec_pretty(&manifest)?,
            )
            .await?;

        let record = BackupRecord {
            id: Uuid::new_v4(),
            path: prefix.clone(),
            created_by: auth.user.id.0,
            created_at,
            status: "complete".to_string(),
        };
        self.backup_repo.create(&record).await?;

        info!(path = %prefix, "Backup written");
        Ok(record.into())
    }

    async fn list(&self) -> Result<Vec<Backup>, BackupError> {
        Ok(self
            .backup_repo
            .list()
            .await?
            .into_iter()
            .map(Into::into)
            .collect())
    }
}
