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

use crate::auth::{
    ApiKeyScope, ApiKeySecret, Authorisation, JobAuthorisation, JobTokenRole,
    PlatformSecurityScheme, TokenSecret,
};
use crate::identity::{IdentityError, IdentityProvider};
use crate::repo::api_key::ApiKeyRepo;
use crate::repo::model::ModelRecord;
use crate::repo::team::TeamRepo;
use crate::repo::user::UserRepo;
use crate::service::token::{TokenError, TokenService};
use async_trait::async_trait;
use bazaar_common::model::{DefaultPermission, ModelAccess, ModelId, ModelPermission, TeamId};
use bazaar_common::SafeDisplay;
use bazaar_service_base::repo::RepoError;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum AuthServiceError {
    #[error("Invalid API key")]
    InvalidApiKey,
    #[error("API key expired")]
    ApiKeyExpired,
    #[error("API key does not cover model {0}")]
    ApiKeyModelMismatch(ModelId),
    #[error("API keys only authenticate model-deployment access: {0}")]
    ApiKeyNotAllowed(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for AuthServiceError {
    fn to_safe_string(&self) -> String {
        match self {
            AuthServiceError::InvalidApiKey => self.to_string(),
            AuthServiceError::ApiKeyExpired => self.to_string(),
            AuthServiceError::ApiKeyModelMismatch(_) => self.to_string(),
            AuthServiceError::ApiKeyNotAllowed(_) => self.to_string(),
            AuthServiceError::PermissionDenied(_) => self.to_string(),
            AuthServiceError::Identity(inner) => inner.to_safe_string(),
            AuthServiceError::InternalRepoError(inner) => inner.to_safe_string(),
        }
    }
}

impl From<TokenError> for AuthServiceError {
    fn from(value: TokenError) -> Self {
        match value {
            TokenError::Expired => AuthServiceError::Identity(IdentityError::TokenExpired),
            TokenError::Invalid(msg) => {
                AuthServiceError::Identity(IdentityError::InvalidToken(msg))
            }
        }
    }
}

pub fn hash_api_key_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

#[async_trait]
pub trait AuthService: Send + Sync {
    /// Combined authentication: the API-key header short-circuits the bearer
    /// JWT path. The resulting principal may be API-key restricted.
    async fn authorization(
        &self,
        scheme: PlatformSecurityScheme,
    ) -> Result<Authorisation, AuthServiceError>;

    /// Authentication for everything outside the deployment read surface;
    /// API keys are rejected here.
    async fn authorization_user(
        &self,
        scheme: PlatformSecurityScheme,
    ) -> Result<Authorisation, AuthServiceError>;

    async fn authorize_job(
        &self,
        token: &TokenSecret,
        allowed_roles: &[JobTokenRole],
    ) -> Result<JobAuthorisation, AuthServiceError>;

    /// The permission ladder: admin and owner give Owner, public gives the
    /// default permission, team membership gives the default permission or
    /// Owner for team admins. The result is never below any single rung.
    async fn get_model_permission(
        &self,
        auth: &Authorisation,
        model: &ModelRecord,
    ) -> Result<ModelPermission, AuthServiceError>;

    async fn ensure_model_permission(
        &self,
        auth: &Authorisation,
        model: &ModelRecord,
        min: ModelPermission,
    ) -> Result<(), AuthServiceError>;

    fn ensure_admin(&self, auth: &Authorisation) -> Result<(), AuthServiceError>;

    async fn ensure_team_admin(
        &self,
        auth: &Authorisation,
        team_id: &TeamId,
    ) -> Result<(), AuthServiceError>;

    async fn ensure_team_member(
        &self,
        auth: &Authorisation,
        team_id: &TeamId,
    ) -> Result<(), AuthServiceError>;
}

pub struct AuthServiceDefault {
    identity: Arc<dyn IdentityProvider>,
    token_service: Arc<TokenService>,
    user_repo: Arc<dyn UserRepo>,
    team_repo: Arc<dyn TeamRepo>,
    api_key_repo: Arc<dyn ApiKeyRepo>,
}

impl AuthServiceDefault {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        token_service: Arc<TokenService>,
        user_repo: Arc<dyn UserRepo>,
        team_repo: Arc<dyn TeamRepo>,
        api_key_repo: Arc<dyn ApiKeyRepo>,
    ) -> Self {
        Self {
            identity,
            token_service,
            user_repo,
            team_repo,
            api_key_repo,
        }
    }

    async fn authorize_api_key(
        &self,
        secret: &ApiKeySecret,
    ) -> Result<Authorisation, AuthServiceError> {
        let hashed = hash_api_key_secret(secret.stripped());
        let record = self
            .api_key_repo
            .get_by_hash(&hashed)
            .await?
            .ok_or(AuthServiceError::InvalidApiKey)?;

        if Utc::now() > record.expires_at {
            return Err(AuthServiceError::ApiKeyExpired);
        }

        let user = self
            .user_repo
            .get(&record.created_by)
            .await?
            .ok_or(AuthServiceError::InvalidApiKey)?;

        let model_ids = self
            .api_key_repo
            .model_ids(&record.id)
            .await?
            .into_iter()
            .map(ModelId)
            .collect();

        Ok(Authorisation::via_api_key(
            user.into(),
            ApiKeyScope {
                all_models: record.all_models,
                model_ids,
                expires_at: record.expires_at,
            },
        ))
    }

    async fn authorize_bearer(
        &self,
        token: &TokenSecret,
    ) -> Result<Authorisation, AuthServiceError> {
        let authenticated = self.identity.authenticate(token).await?;
        Ok(Authorisation::for_user(
            authenticated.user,
            authenticated.expires_at,
        ))
    }
}

#[async_trait]
impl AuthService for AuthServiceDefault {
    async fn authorization(
        &self,
        scheme: PlatformSecurityScheme,
    ) -> Result<Authorisation, AuthServiceError> {
        match scheme {
            PlatformSecurityScheme::ApiKey(key) => self.authorize_api_key(&key.0).await,
            PlatformSecurityScheme::Bearer(bearer) => self.authorize_bearer(&bearer.0).await,
        }
    }

    async fn authorization_user(
        &self,
        scheme: PlatformSecurityScheme,
    ) -> Result<Authorisation, AuthServiceError> {
        match scheme {
            PlatformSecurityScheme::ApiKey(_) => Err(AuthServiceError::ApiKeyNotAllowed(
                "this endpoint requires a user token".to_string(),
            )),
            PlatformSecurityScheme::Bearer(bearer) => self.authorize_bearer(&bearer.0).await,
        }
    }

    async fn authorize_job(
        &self,
        token: &TokenSecret,
        allowed_roles: &[JobTokenRole],
    ) -> Result<JobAuthorisation, AuthServiceError> {
        let job = self.token_service.verify_job_token(token)?;
        if !allowed_roles.contains(&job.role) {
            return Err(AuthServiceError::Identity(IdentityError::InvalidToken(
                format!("job token role {} not accepted here", job.role.as_str()),
            )));
        }
        Ok(job)
    }

    async fn get_model_permission(
        &self,
        auth: &Authorisation,
        model: &ModelRecord,
    ) -> Result<ModelPermission, AuthServiceError> {
        if auth.user.is_admin {
            return Ok(ModelPermission::Owner);
        }

        let mut permission = ModelPermission::None;
        if model.owner_id == auth.user.id.0 {
            permission = permission.max(ModelPermission::Owner);
        }

        let default_permission = DefaultPermission::from_str(&model.default_permission)
            .map(ModelPermission::from)
            .unwrap_or(ModelPermission::Read);

        match ModelAccess::from_str(&model.access) {
            Ok(ModelAccess::Public) => {
                permission = permission.max(default_permission);
            }
            Ok(ModelAccess::Protected) => {
                if let Some(team_id) = model.team_id {
                    if let Some(member) =
                        self.team_repo.get_member(&team_id, &auth.user.id.0).await?
                    {
                        let team_level = if member.is_team_admin {
                            ModelPermission::Owner
                        } else {
                            default_permission
                        };
                        permission = permission.max(team_level);
                    }
                }
            }
            _ => {}
        }

        Ok(permission)
    }

    async fn ensure_model_permission(
        &self,
        auth: &Authorisation,
        model: &ModelRecord,
        min: ModelPermission,
    ) -> Result<(), AuthServiceError> {
        if let Some(scope) = &auth.api_key_scope {
            if min > ModelPermission::Read {
                return Err(AuthServiceError::ApiKeyNotAllowed(
                    "API keys never grant write or owner access".to_string(),
                ));
            }
            if !scope.covers(&ModelId(model.id)) {
                return Err(AuthServiceError::ApiKeyModelMismatch(ModelId(model.id)));
            }
        }

        let permission = self.get_model_permission(auth, model).await?;
        if permission >= min {
            Ok(())
        } else {
            Err(AuthServiceError::PermissionDenied(format!(
                "{} access required on model {}",
                min.as_str(),
                model.id
            )))
        }
    }

    fn ensure_admin(&self, auth: &Authorisation) -> Result<(), AuthServiceError> {
        if auth.is_api_key() {
            return Err(AuthServiceError::ApiKeyNotAllowed(
                "admin endpoints require a user token".to_string(),
            ));
        }
        if auth.user.is_admin {
            Ok(())
        } else {
            Err(AuthServiceError::PermissionDenied(
                "admin access required".to_string(),
            ))
        }
    }

    async fn ensure_team_admin(
        &self,
        auth: &Authorisation,
        team_id: &TeamId,
    ) -> Result<(), AuthServiceError> {
        if auth.user.is_admin {
            return Ok(());
        }
        let member = self.team_repo.get_member(&team_id.0, &auth.user.id.0).await?;
        match member {
            Some(member) if member.is_team_admin => Ok(()),
            _ => Err(AuthServiceError::PermissionDenied(format!(
                "team admin access required on team {team_id}"
            ))),
        }
    }

    async fn ensure_team_member(
        &self,
        auth: &Authorisation,
        team_id: &TeamId,
    ) -> Result<(), AuthServiceError> {
        if auth.user.is_admin {
            return Ok(());
        }
        let member = self.team_repo.get_member(&team_id.0, &auth.user.id.0).await?;
        match member {
            Some(_) => Ok(()),
            None => Err(AuthServiceError::PermissionDenied(format!(
                "team membership required on team {team_id}"
            ))),
        }
    }
}
