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

use crate::auth::{Authorisation, API_KEY_PREFIX};
use crate::model::{ApiKey, CreateApiKeyRequest, CreatedApiKey};
use crate::repo::api_key::{ApiKeyRecord, ApiKeyRepo};
use crate::service::auth::hash_api_key_secret;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bazaar_common::model::{ApiKeyId, ModelId, UserId};
use bazaar_common::SafeDisplay;
use bazaar_service_base::repo::RepoError;
use chrono::Utc;
use rand::RngCore;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ApiKeyError {
    #[error("API key not found: {0}")]
    NotFound(ApiKeyId),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Permission denied: only the key's creator or an admin may delete it")]
    NotCreator,
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for ApiKeyError {
    fn to_safe_string(&self) -> String {
        match self {
            ApiKeyError::InternalRepoError(inner) => inner.to_safe_string(),
            other => other.to_string(),
        }
    }
}

#[async_trait]
pub trait ApiKeyService: Send + Sync {
    /// Issues a key scoped to `model_id` (plus any extra models in the
    /// request). The secret is returned once and stored only as a SHA-256.
    async fn create(
        &self,
        auth: &Authorisation,
        model_id: &ModelId,
        request: &CreateApiKeyRequest,
    ) -> Result<CreatedApiKey, ApiKeyError>;

    async fn list_for_model(&self, model_id: &ModelId) -> Result<Vec<ApiKey>, ApiKeyError>;

    async fn delete(&self, auth: &Authorisation, key_id: &ApiKeyId) -> Result<(), ApiKeyError>;
}

pub struct ApiKeyServiceDefault {
    api_key_repo: Arc<dyn ApiKeyRepo>,
}

impl ApiKeyServiceDefault {
    pub fn new(api_key_repo: Arc<dyn ApiKeyRepo>) -> Self {
        Self { api_key_repo }
    }

    fn generate_secret() -> String {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    async fn to_api_key(&self, record: ApiKeyRecord) -> Result<ApiKey, ApiKeyError> {
        let model_ids = self
            .api_key_repo
            .model_ids(&record.id)
            .await?
            .into_iter()
            .map(ModelId)
            .collect();
        Ok(ApiKey {
            id: ApiKeyId(record.id),
            name: record.name,
            created_by: UserId(record.created_by),
            expires_at: record.expires_at,
            all_models: record.all_models,
            model_ids,
        })
    }
}

#[async_trait]
impl ApiKeyService for ApiKeyServiceDefault {
    async fn create(
        &self,
        auth: &Authorisation,
        model_id: &ModelId,
        request: &CreateApiKeyRequest,
    ) -> Result<CreatedApiKey, ApiKeyError> {
        if request.name.is_empty() {
            return Err(ApiKeyError::InvalidInput("name must not be empty".to_string()));
        }
        if request.expires_at <= Utc::now() {
            return Err(ApiKeyError::InvalidInput(
                "expiry must be in the future".to_string(),
            ));
        }

        let secret = Self::generate_secret();
        let record = ApiKeyRecord {
            id: Uuid::new_v4(),
            hashed_secret: hash_api_key_secret(&secret),
            created_by: auth.user.id.0,
            name: request.name.clone(),
            expires_at: request.expires_at,
            all_models: request.all_models,
        };

        let mut model_ids: Vec<Uuid> = Vec::new();
        if !request.all_models {
            model_ids.push(model_id.0);
            for extra in &request.model_ids {
                if !model_ids.contains(&extra.0) {
                    model_ids.push(extra.0);
                }
            }
        }

        self.api_key_repo.create(&record, &model_ids).await?;
        let data = self.to_api_key(record).await?;
        Ok(CreatedApiKey {
            key: format!("{API_KEY_PREFIX}{secret}"),
            data,
        })
    }

    async fn list_for_model(&self, model_id: &ModelId) -> Result<Vec<ApiKey>, ApiKeyError> {
        let records = self.api_key_repo.list_for_model(&model_id.0).await?;
        let mut keys = Vec::with_capacity(records.len());
        for record in records {
            keys.push(self.to_api_key(record).await?);
        }
        Ok(keys)
    }

    async fn delete(&self, auth: &Authorisation, key_id: &ApiKeyId) -> Result<(), ApiKeyError> {
        let record = self
            .api_key_repo
            .get(&key_id.0)
            .await?
            .ok_or(ApiKeyError::NotFound(*key_id))?;
        if record.created_by != auth.user.id.0 && !auth.user.is_admin {
            return Err(ApiKeyError::NotCreator);
        }
        self.api_key_repo.delete(&key_id.0).await?;
        Ok(())
    }
}
