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

pub mod local;
pub mod sso;

use crate::auth::TokenSecret;
use crate::model::User;
use async_trait::async_trait;
use bazaar_common::model::UserId;
use bazaar_common::SafeDisplay;
use bazaar_service_base::repo::RepoError;
use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("No user found with email {0}")]
    UserNotFoundWithEmail(String),
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Username already in use: {0}")]
    UsernameAlreadyInUse(String),
    #[error("Email already in use: {0}")]
    EmailAlreadyInUse(String),
    #[error("Invalid token: {0}")]
    InvalidToken(String),
    #[error("Token expired")]
    TokenExpired,
    #[error("Operation not supported by this identity provider")]
    NotSupported,
    #[error("Identity provider unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
    #[error("Internal identity error: {0}")]
    Internal(String),
}

impl SafeDisplay for IdentityError {
    fn to_safe_string(&self) -> String {
        match self {
            IdentityError::UserNotFoundWithEmail(_) => self.to_string(),
            IdentityError::InvalidCredentials => self.to_string(),
            IdentityError::UsernameAlreadyInUse(_) => self.to_string(),
            IdentityError::EmailAlreadyInUse(_) => self.to_string(),
            IdentityError::InvalidToken(_) => "Invalid token".to_string(),
            IdentityError::TokenExpired => self.to_string(),
            IdentityError::NotSupported => self.to_string(),
            IdentityError::Unavailable(_) => "Identity provider unavailable".to_string(),
            IdentityError::InternalRepoError(inner) => inner.to_safe_string(),
            IdentityError::Internal(_) => "Internal identity error".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoginTokens {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub user: User,
}

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user: User,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Pluggable authentication. Every authenticated request resolves to a local
/// user row regardless of the backing provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn allow_direct_signup(&self) -> bool;

    fn token_expiration(&self) -> chrono::Duration;

    async fn login_with_email(
        &self,
        email: &str,
        password: &str,
    ) -> Result<LoginTokens, IdentityError>;

    /// Validates a bearer token and loads the user behind it.
    async fn authenticate(&self, token: &TokenSecret) -> Result<AuthenticatedUser, IdentityError>;

    async fn create_user(
        &self,
        username: &str,
        email: &str,
        password: Option<&str>,
        is_admin: bool,
    ) -> Result<User, IdentityError>;

    /// Credential check without issuing a token.
    async fn verify_user(&self, email: &str, password: &str) -> Result<User, IdentityError>;

    /// Provider-side cleanup when a user row is removed.
    async fn delete_user(&self, user_id: &UserId) -> Result<(), IdentityError>;
}
