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

use crate::auth::TokenSecret;
use crate::config::SsoConfig;
use crate::identity::{AuthenticatedUser, IdentityError, IdentityProvider, LoginTokens};
use crate::model::User;
use crate::repo::user::{UserRecord, UserRepo};
use async_trait::async_trait;
use bazaar_common::model::UserId;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

/// Userinfo document of the external identity provider. The subject is the
/// provider's stable UUID for the user and becomes the local user id.
#[derive(Debug, Clone, Deserialize)]
struct UserInfo {
    sub: Uuid,
    preferred_username: String,
    email: String,
}

/// External-SSO identity: bearer tokens are validated against the provider's
/// userinfo endpoint on every request, and a local user row is created
/// lazily on first login.
pub struct SsoIdentityProvider {
    user_repo: Arc<dyn UserRepo>,
    client: reqwest::Client,
    config: SsoConfig,
}

impl SsoIdentityProvider {
    pub fn new(user_repo: Arc<dyn UserRepo>, config: &SsoConfig) -> Result<Self, IdentityError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| IdentityError::Unavailable(err.to_string()))?;
        Ok(Self {
            user_repo,
            client,
            config: config.clone(),
        })
    }

    async fn fetch_userinfo(&self, token: &TokenSecret) -> Result<UserInfo, IdentityError> {
        let response = self
            .client
            .get(self.config.userinfo_url.clone())
            .bearer_auth(&token.value)
            .send()
            .await
            .map_err(|err| IdentityError::Unavailable(err.to_string()))?;

        match response.status() {
            status if status.is_success() => response
                .json::<UserInfo>()
                .await
                .map_err(|err| IdentityError::Unavailable(err.to_string())),
            reqwest::StatusCode::UNAUTHORIZED => {
                Err(IdentityError::InvalidToken("rejected by provider".to_string()))
            }
            status => Err(IdentityError::Unavailable(format!(
                "userinfo endpoint returned {status}"
            ))),
        }
    }

    async fn local_user_for(&self, info: &UserInfo) -> Result<User, IdentityError> {
        if let Some(record) = self.user_repo.get(&info.sub).await? {
            return Ok(record.into());
        }

        let record = UserRecord {
            id: info.sub,
            username: info.preferred_username.clone(),
            email: info.email.clone(),
            password_hash: None,
            is_admin: false,
            created_at: Utc::now(),
        };
        match self.user_repo.create(&record).await {
            Ok(()) => Ok(record.into()),
            // Concurrent first logins of the same subject
            Err(error) if error.is_unique_violation() => {
                let record = self
                    .user_repo
                    .get(&info.sub)
                    .await?
                    .ok_or_else(|| IdentityError::Internal("user vanished".to_string()))?;
                Ok(record.into())
            }
            Err(error) => Err(error.into()),
        }
    }
}

#[async_trait]
impl IdentityProvider for SsoIdentityProvider {
    fn allow_direct_signup(&self) -> bool {
        false
    }

    fn token_expiration(&self) -> chrono::Duration {
        // Token lifetime is owned by the provider; we re-validate per call.
        chrono::Duration::zero()
    }

    async fn login_with_email(
        &self,
        _email: &str,
        _password: &str,
    ) -> Result<LoginTokens, IdentityError> {
        Err(IdentityError::NotSupported)
    }

    async fn authenticate(&self, token: &TokenSecret) -> Result<AuthenticatedUser, IdentityError> {
        let info = self.fetch_userinfo(token).await?;
        let user = self.local_user_for(&info).await?;
        Ok(AuthenticatedUser {
            user,
            expires_at: None,
        })
    }

    async fn create_user(
        &self,
        username: &str,
        email: &str,
        _password: Option<&str>,
        is_admin: bool,
    ) -> Result<User, IdentityError> {
        if self.user_repo.get_by_username(username).await?.is_some() {
            return Err(IdentityError::UsernameAlreadyInUse(username.to_string()));
        }
        if self.user_repo.get_by_email(email).await?.is_some() {
            return Err(IdentityError::EmailAlreadyInUse(email.to_string()));
        }

        let record = UserRecord {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash: None,
            is_admin,
            created_at: Utc::now(),
        };
        self.user_repo.create(&record).await?;
        Ok(record.into())
    }

    async fn verify_user(&self, _email: &str, _password: &str) -> Result<User, IdentityError> {
        Err(IdentityError::NotSupported)
    }

    async fn delete_user(&self, _user_id: &UserId) -> Result<(), IdentityError> {
        // The account lives in the external provider; only the local row is
        // removed by the caller.
        Ok(())
    }
}
