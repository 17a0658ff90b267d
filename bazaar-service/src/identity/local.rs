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
use crate::identity::{AuthenticatedUser, IdentityError, IdentityProvider, LoginTokens};
use crate::model::User;
use crate::repo::user::{UserRecord, UserRepo};
use crate::service::token::{TokenError, TokenService};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use bazaar_common::model::UserId;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// Password-backed identity: argon2 at rest, short-lived HS256 access
/// tokens.
pub struct LocalIdentityProvider {
    user_repo: Arc<dyn UserRepo>,
    token_service: Arc<TokenService>,
}

impl LocalIdentityProvider {
    pub fn new(user_repo: Arc<dyn UserRepo>, token_service: Arc<TokenService>) -> Self {
        Self {
            user_repo,
            token_service,
        }
    }

    fn hash_password(password: &str) -> Result<String, IdentityError> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|err| IdentityError::Internal(err.to_string()))
    }

    fn verify_password(password: &str, hash: &str) -> Result<(), IdentityError> {
        let parsed = PasswordHash::new(hash).map_err(|err| IdentityError::Internal(err.to_string()))?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| IdentityError::InvalidCredentials)
    }

    async fn user_by_credentials(
        &self,
        email: &str,
        password: &str,
    ) -> Result<UserRecord, IdentityError> {
        let record = self
            .user_repo
            .get_by_email(email)
            .await?
            .ok_or_else(|| IdentityError::UserNotFoundWithEmail(email.to_string()))?;

        match &record.password_hash {
            Some(hash) => Self::verify_password(password, hash)?,
            None => return Err(IdentityError::InvalidCredentials),
        }
        Ok(record)
    }
}

#[async_trait]
impl IdentityProvider for LocalIdentityProvider {
    fn allow_direct_signup(&self) -> bool {
        true
    }

    fn token_expiration(&self) -> chrono::Duration {
        self.token_service.user_token_ttl()
    }

    async fn login_with_email(
        &self,
        email: &str,
        password: &str,
    ) -> Result<LoginTokens, IdentityError> {
        let record = self.user_by_credentials(email, password).await?;
        let user: User = record.into();
        let (access_token, expires_at) = self.token_service.issue_user_token(&user.id);
        Ok(LoginTokens {
            access_token,
            expires_at,
            user,
        })
    }

    async fn authenticate(&self, token: &TokenSecret) -> Result<AuthenticatedUser, IdentityError> {
        let (user_id, expires_at) =
            self.token_service
                .verify_user_token(token)
                .map_err(|err| match err {
                    TokenError::Expired => IdentityError::TokenExpired,
                    TokenError::Invalid(msg) => IdentityError::InvalidToken(msg),
                })?;

        let record = self
            .user_repo
            .get(&user_id.0)
            .await?
            .ok_or_else(|| IdentityError::InvalidToken("unknown user".to_string()))?;

        Ok(AuthenticatedUser {
            user: record.into(),
            expires_at: Some(expires_at),
        })
    }

    async fn create_user(
        &self,
        username: &str,
        email: &str,
        password: Option<&str>,
        is_admin: bool,
    ) -> Result<User, IdentityError> {
        if self.user_repo.get_by_username(username).await?.is_some() {
            return Err(IdentityError::UsernameAlreadyInUse(username.to_string()));
        }
        if self.user_repo.get_by_email(email).await?.is_some() {
            return Err(IdentityError::EmailAlreadyInUse(email.to_string()));
        }

        let password_hash = password.map(Self::hash_password).transpose()?;
        let record = UserRecord {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash,
            is_admin,
            created_at: Utc::now(),
        };

        match self.user_repo.create(&record).await {
            Ok(()) => Ok(record.into()),
            // Lost the race against a concurrent signup with the same keys
            Err(error) if error.is_unique_violation() => {
                Err(IdentityError::EmailAlreadyInUse(email.to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn verify_user(&self, email: &str, password: &str) -> Result<User, IdentityError> {
        let record = self.user_by_credentials(email, password).await?;
        Ok(record.into())
    }

    async fn delete_user(&self, _user_id: &UserId) -> Result<(), IdentityError> {
        // Credentials live in the user row; nothing else to clean up.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn password_hashes_verify_and_differ_per_salt() {
        let first = LocalIdentityProvider::hash_password("secret-password").unwrap();
        let second = LocalIdentityProvider::hash_password("secret-password").unwrap();

        assert_ne!(first, second);
        assert!(LocalIdentityProvider::verify_password("secret-password", &first).is_ok());
        assert!(matches!(
            LocalIdentityProvider::verify_password("wrong", &first),
            Err(IdentityError::InvalidCredentials)
        ));
    }
}
