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
use crate::model::{Model, ModelInfo};
use crate::repo::model::{ModelRecord, ModelRepo};
use async_trait::async_trait;
use bazaar_common::model::{
    DefaultPermission, JobStatus, ModelAccess, ModelId, ModelType, TeamId, UserId,
};
use bazaar_common::SafeDisplay;
use bazaar_service_base::repo::RepoError;
use bazaar_service_base::storage::{ByteStream, ObjectStore, StorageError};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Model not found: {0}")]
    NotFound(ModelId),
    #[error("Model {0} is still required by {1} non-stopped model(s)")]
    DependencyInUse(ModelId, usize),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Model artifact not found for {0}")]
    ArtifactMissing(ModelId),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for ModelError {
    fn to_safe_string(&self) -> String {
        match self {
            ModelError::Storage(inner) => inner.to_safe_string(),
            ModelError::InternalRepoError(inner) => inner.to_safe_string(),
            other => other.to_string(),
        }
    }
}

pub fn artifact_path(model_id: &ModelId) -> String {
    format!("models/{model_id}/model/model.bin")
}

pub fn model_prefix(model_id: &ModelId) -> String {
    format!("models/{model_id}/")
}

#[async_trait]
pub trait ModelService: Send + Sync {
    async fn get_record(&self, id: &ModelId) -> Result<ModelRecord, ModelError>;

    async fn to_model(&self, record: ModelRecord) -> Result<Model, ModelError>;

    async fn get_info(&self, id: &ModelId) -> Result<ModelInfo, ModelError>;

    async fn list(&self, auth: &Authorisation) -> Result<Vec<ModelInfo>, ModelError>;

    /// Deletion is blocked while any non-stopped model transitively depends
    /// on this one; model storage is removed with the rows.
    async fn delete(&self, id: &ModelId) -> Result<(), ModelError>;

    async fn set_access(
        &self,
        id: &ModelId,
        access: ModelAccess,
        team_id: Option<TeamId>,
    ) -> Result<(), ModelError>;

    async fn set_default_permission(
        &self,
        id: &ModelId,
        permission: DefaultPermission,
    ) -> Result<(), ModelError>;

    async fn download(&self, id: &ModelId) -> Result<ByteStream, ModelError>;

    /// The model itself plus every transitive dependency, depth-first and
    /// deterministic.
    async fn list_dependencies(&self, id: &ModelId) -> Result<Vec<ModelRecord>, ModelError>;

    /// Rollup over the model and its transitive dependencies (failed
    /// dominates, complete requires all complete).
    async fn effective_train_status(&self, record: &ModelRecord) -> Result<JobStatus, ModelError>;

    /// Whether any other non-stopped model transitively depends on this one.
    async fn has_blocking_dependents(&self, id: &ModelId) -> Result<usize, ModelError>;
}

pub struct ModelServiceDefault {
    model_repo: Arc<dyn ModelRepo>,
    object_store: Arc<dyn ObjectStore>,
}

impl ModelServiceDefault {
    pub fn new(model_repo: Arc<dyn ModelRepo>, object_store: Arc<dyn ObjectStore>) -> Self {
        Self {
            model_repo,
            object_store,
        }
    }

    fn parse_status(status: &str) -> JobStatus {
        JobStatus::from_str(status).unwrap_or(JobStatus::Failed)
    }
}

#[async_trait]
impl ModelService for ModelServiceDefault {
    async fn get_record(&self, id: &ModelId) -> Result<ModelRecord, ModelError> {
        self.model_repo
            .get(&id.0)
            .await?
            .ok_or(ModelError::NotFound(*id))
    }

    async fn to_model(&self, record: ModelRecord) -> Result<Model, ModelError> {
        let attributes = self
            .model_repo
            .get_attributes(&record.id)
            .await?
            .into_iter()
            .collect();

        Ok(Model {
            id: ModelId(record.id),
            name: record.name,
            model_type: ModelType::from_str(&record.model_type)
                .map_err(ModelError::InvalidInput)?,
            owner_id: UserId(record.owner_id),
            parent_id: record.parent_id.map(ModelId),
            team_id: record.team_id.map(TeamId),
            access: ModelAccess::from_str(&record.access).map_err(ModelError::InvalidInput)?,
            default_permission: DefaultPermission::from_str(&record.default_permission)
                .map_err(ModelError::InvalidInput)?,
            train_status: Self::parse_status(&record.train_status),
            deploy_status: Self::parse_status(&record.deploy_status),
            published_at: record.published_at,
            created_at: record.created_at,
            attributes,
        })
    }

    async fn get_info(&self, id: &ModelId) -> Result<ModelInfo, ModelError> {
        let record = self.get_record(id).await?;
        let effective_train_status = self.effective_train_status(&record).await?;
        let dependencies = self
            .model_repo
            .dependencies_of(&record.id)
            .await?
            .into_iter()
            .map(ModelId)
            .collect();
        let model = self.to_model(record).await?;
        Ok(ModelInfo {
            model,
            effective_train_status,
            dependencies,
        })
    }

    async fn list(&self, auth: &Authorisation) -> Result<Vec<ModelInfo>, ModelError> {
        let records = if auth.user.is_admin {
            self.model_repo.list().await?
        } else {
            self.model_repo.list_visible(&auth.user.id.0).await?
        };

        let mut infos = Vec::with_capacity(records.len());
        for record in records {
            let effective_train_status = self.effective_train_status(&record).await?;
            let dependencies = self
                .model_repo
                .dependencies_of(&record.id)
                .await?
                .into_iter()
                .map(ModelId)
                .collect();
            let model = self.to_model(record).await?;
            infos.push(ModelInfo {
                model,
                effective_train_status,
                dependencies,
            });
        }
        Ok(infos)
    }

    async fn delete(&self, id: &ModelId) -> Result<(), ModelError> {
        self.get_record(id).await?;
        let blocking = self.has_blocking_dependents(id).await?;
        if blocking > 0 {
            return Err(ModelError::DependencyInUse(*id, blocking));
        }

        self.model_repo.delete(&id.0).await?;
        self.object_store.delete_prefix(&model_prefix(id)).await?;
        info!(model_id = %id, "Model deleted");
        Ok(())
    }

    async fn set_access(
        &self,
        id: &ModelId,
        access: ModelAccess,
        team_id: Option<TeamId>,
    ) -> Result<(), ModelError> {
        let record = self.get_record(id).await?;

        // protected requires a team; private/public forbid one
        let team_id = match access {
            ModelAccess::Protected => Some(
                team_id
                    .ok_or_else(|| {
                        ModelError::InvalidInput(
                            "protected access requires a team_id".to_string(),
                        )
                    })?
                    .0,
            ),
            ModelAccess::Private | ModelAccess::Public => {
                if team_id.is_some() {
                    return Err(ModelError::InvalidInput(
                        "team_id is only valid with protected access".to_string(),
                    ));
                }
                None
            }
        };

        let published_at = match access {
            ModelAccess::Public => record.published_at.or_else(|| Some(chrono::Utc::now())),
            _ => None,
        };

        self.model_repo
            .set_access(&id.0, access.as_str(), team_id, published_at)
            .await?;
        Ok(())
    }

    async fn set_default_permission(
        &self,
        id: &ModelId,
        permission: DefaultPermission,
    ) -> Result<(), ModelError> {
        self.get_record(id).await?;
        self.model_repo
            .set_default_permission(&id.0, permission.as_str())
            .await?;
        Ok(())
    }

    async fn download(&self, id: &ModelId) -> Result<ByteStream, ModelError> {
        self.get_record(id).await?;
        match self.object_store.get(&artifact_path(id)).await {
            Ok(stream) => Ok(stream),
            Err(StorageError::NotFound(_)) => Err(ModelError::ArtifactMissing(*id)),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_dependencies(&self, id: &ModelId) -> Result<Vec<ModelRecord>, ModelError> {
        let root = self.get_record(id).await?;

        let mut result = Vec::new();
        let mut visited: HashSet<Uuid> = HashSet::new();
        let mut stack: Vec<Uuid> = vec![root.id];

        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            let record = self
                .model_repo
                .get(&current)
                .await?
                .ok_or(ModelError::NotFound(ModelId(current)))?;
            result.push(record);

            // depth-first, stable: children pushed in reverse id order
            let mut children = self.model_repo.dependencies_of(&current).await?;
            children.sort();
            for child in children.into_iter().rev() {
                if !visited.contains(&child) {
                    stack.push(child);
                }
            }
        }
        Ok(result)
    }

    async fn effective_train_status(&self, record: &ModelRecord) -> Result<JobStatus, ModelError> {
        let own = Self::parse_status(&record.train_status);
        let transitive = self.list_dependencies(&ModelId(record.id)).await?;
        let dependency_statuses = transitive
            .iter()
            .filter(|dep| dep.id != record.id)
            .map(|dep| Self::parse_status(&dep.train_status));
        Ok(JobStatus::rollup(own, dependency_statuses))
    }

    async fn has_blocking_dependents(&self, id: &ModelId) -> Result<usize, ModelError> {
        let mut blocking = HashSet::new();
        let mut visited: HashSet<Uuid> = HashSet::from([id.0]);
        let mut queue: Vec<Uuid> = vec![id.0];

        while let Some(current) = queue.pop() {
            for dependent in self.model_repo.dependents_of(&current).await? {
                if !visited.insert(dependent.id) {
                    continue;
                }
                if dependent.deploy_status != JobStatus::Stopped.as_str() {
                    blocking.insert(dependent.id);
                }
                queue.push(dependent.id);
            }
        }
        Ok(blocking.len())
    }
}
