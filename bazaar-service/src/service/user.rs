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
use crate::identity::{IdentityError, IdentityProvider, LoginTokens};
use crate::model::{LoginRequest, SignupRequest, User};
use crate::repo::model::ModelRepo;
use crate::repo::user::UserRepo;
use async_trait::async_trait;
use bazaar_common::model::UserId;
use bazaar_common::SafeDisplay;
use bazaar_service_base::repo::RepoError;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum UserError {
    #[error("User not found: {0}")]
    NotFound(UserId),
    #[error("Direct signup is disabled by the identity provider")]
    SignupDisabled,
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for UserError {
    fn to_safe_string(&self) -> String {
        match self {
            UserError::NotFound(_) => self.to_string(),
            UserError::SignupDisabled => self.to_string(),
            UserError::Identity(inner) => inner.to_safe_string(),
            UserError::InternalRepoError(inner) => inner.to_safe_string(),
        }
    }
}

#[async_trait]
pub trait UserService: Send + Sync {
    async fn signup(&self, request: &SignupRequest) -> Result<User, UserError>;

    async fn login(&self, request: &LoginRequest) -> Result<LoginTokens, UserError>;

    async fn get(&self, id: &UserId) -> Result<User, UserError>;

    /// Admins see everyone; everyone else sees themselves and the users they
    /// share a team with.
    async fn list(&self, auth: &Authorisation) -> Result<Vec<User>, UserError>;

    async fn set_admin(&self, id: &UserId, is_admin: bool) -> Result<(), UserError>;

    /// Deletes the user; their models transfer to the deleting admin.
    async fn delete(&self, id: &UserId, auth: &Authorisation) -> Result<(), UserError>;
}

pub struct UserServiceDefault {
    identity: Arc<dyn IdentityProvider>,
    user_repo: Arc<dyn UserRepo>,
    model_repo: Arc<dyn ModelRepo>,
}

impl UserServiceDefault {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        user_repo: Arc<dyn UserRepo>,
        model_repo: Arc<dyn ModelRepo>,
    ) -> Self {
        Self {
            identity,
            user_repo,
            model_repo,
        }
    }
}

#[async_trait]
impl UserService for UserServiceDefault {
    async fn signup(&self, request: &SignupRequest) -> Result<User, UserError> {
        if !self.identity.allow_direct_signup() {
            return Err(UserError::SignupDisabled);
        }
        let user = self
            .identity
            .create_user(
                &request.username,
                &request.email,
                Some(&request.password),
                false,
            )
            .await?;
        info!(user_id = %user.id, username = %user.username, "User signed up");
        Ok(user)
    }

    async fn login(&self, request: &LoginRequest) -> Result<LoginTokens, UserError> {
        Ok(self
            .identity
            .login_with_email(&request.email, &request.password)
            .await?)
    }

    async fn get(&self, id: &UserId) -> Result<User, UserError> {
        let record = self
            .user_repo
            .get(&id.0)
            .await?
            .ok_or(UserError::NotFound(*id))?;
        Ok(record.into())
    }

    async fn list(&self, auth: &Authorisation) -> Result<Vec<User>, UserError> {
        if auth.user.is_admin {
            let records = self.user_repo.list().await?;
            return Ok(records.into_iter().map(Into::into).collect());
        }

        let mut users: Vec<User> = self
            .user_repo
            .list_teammates(&auth.user.id.0)
            .await?
            .into_iter()
            .map(Into::into)
            .collect();
        if !users.iter().any(|user| user.id == auth.user.id) {
            users.push(auth.user.clone());
            users.sort_by(|a, b| a.username.cmp(&b.username));
        }
        Ok(users)
    }

    async fn set_admin(&self, id: &UserId, is_admin: bool) -> Result<(), UserError> {
        if !self.user_repo.set_admin(&id.0, is_admin).await? {
            return Err(UserError::NotFound(*id));
        }
        Ok(())
    }

    async fn delete(&self, id: &UserId, auth: &Authorisation) -> Result<(), UserError> {
        let record = self
            .user_repo
            .get(&id.0)
            .await?
            .ok_or(UserError::NotFound(*id))?;

        // Reassign owned models to the acting admin before the row goes;
        // name collisions get a disambiguating suffix.
        let owned = self.model_repo.list_by_owner(&record.id).await?;
        for model in owned {
            let moved = self
                .model_repo
                .set_owner_and_name(&model.id, &auth.user.id.0, &model.name)
                .await;
            match moved {
                Ok(_) => {}
                Err(error) if error.is_unique_violation() => {
                    let fallback = format!("{}-{}", model.name, &model.id.to_string()[..8]);
                    self.model_repo
                        .set_owner_and_name(&model.id, &auth.user.id.0, &fallback)
                        .await?;
                }
                Err(error) => return Err(error.into()),
            }
        }

        self.identity.delete_user(id).await?;
        if !self.user_repo.delete(&id.0).await? {
            return Err(UserError::NotFound(*id));
        }
        info!(user_id = %id, actor = %auth.user.id, "User deleted, models transferred");
        Ok(())
    }
}
