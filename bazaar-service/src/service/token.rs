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

use crate::auth::{JobAuthorisation, JobTokenRole, TokenSecret};
use bazaar_common::model::{ModelId, UserId};
use bazaar_common::SafeDisplay;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

const ROLE_USER: &str = "user";

/// Both user tokens and job tokens are HS256 JWTs signed with the same
/// secret; the `role` claim distinguishes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    sub: String,
    role: String,
    exp: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Token expired")]
    Expired,
    #[error("Invalid token: {0}")]
    Invalid(String),
}

impl SafeDisplay for TokenError {
    fn to_safe_string(&self) -> String {
        match self {
            TokenError::Expired => self.to_string(),
            TokenError::Invalid(_) => "Invalid token".to_string(),
        }
    }
}

pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    user_token_ttl: Duration,
}

impl TokenService {
    pub fn new(secret: &str, user_token_ttl: std::time::Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            user_token_ttl: Duration::seconds(user_token_ttl.as_secs() as i64),
        }
    }

    pub fn user_token_ttl(&self) -> Duration {
        self.user_token_ttl
    }

    pub fn issue_user_token(&self, user_id: &UserId) -> (String, DateTime<Utc>) {
        let expires_at = Utc::now() + self.user_token_ttl;
        let token = self.sign(&Claims {
            sub: user_id.to_string(),
            role: ROLE_USER.to_string(),
            exp: expires_at.timestamp(),
        });
        (token, expires_at)
    }

    pub fn issue_job_token(
        &self,
        model_id: &ModelId,
        role: JobTokenRole,
        ttl: Duration,
    ) -> String {
        let expires_at = Utc::now() + ttl;
        self.sign(&Claims {
            sub: model_id.to_string(),
            role: role.as_str().to_string(),
            exp: expires_at.timestamp(),
        })
    }

    pub fn verify_user_token(
        &self,
        token: &TokenSecret,
    ) -> Result<(UserId, DateTime<Utc>), TokenError> {
        let claims = self.decode(token)?;
        if claims.role != ROLE_USER {
            return Err(TokenError::Invalid(format!(
                "expected a user token, got role {}",
                claims.role
            )));
        }
        let user_id = UserId::from_str(&claims.sub).map_err(TokenError::Invalid)?;
        let expires_at = DateTime::<Utc>::from_timestamp(claims.exp, 0)
            .ok_or_else(|| TokenError::Invalid("invalid expiry".to_string()))?;
        Ok((user_id, expires_at))
    }

    pub fn verify_job_token(&self, token: &TokenSecret) -> Result<JobAuthorisation, TokenError> {
        let claims = self.decode(token)?;
        let role = JobTokenRole::from_str(&claims.role)
            .map_err(|_| TokenError::Invalid(format!("unexpected role {}", claims.role)))?;
        let model_id = ModelId::from_str(&claims.sub).map_err(TokenError::Invalid)?;
        Ok(JobAuthorisation { model_id, role })
    }

    fn sign(&self, claims: &Claims) -> String {
        // HS256 signing of serializable claims cannot fail
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .unwrap_or_default()
    }

    fn decode(&self, token: &TokenSecret) -> Result<Claims, TokenError> {
        let validation = Validation::new(Algorithm::HS256);
        jsonwebtoken::decode::<Claims>(&token.value, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid(err.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn service() -> TokenService {
        TokenService::new("test-secret", std::time::Duration::from_secs(900))
    }

    #[test]
    fn user_token_roundtrip() {
        let tokens = service();
        let user_id = UserId::new_v4();
        let (token, expires_at) = tokens.issue_user_token(&user_id);

        let (verified_id, verified_exp) = tokens
            .verify_user_token(&TokenSecret { value: token })
            .unwrap();
        assert_eq!(verified_id, user_id);
        assert_eq!(verified_exp.timestamp(), expires_at.timestamp());
    }

    #[test]
    fn job_token_carries_model_and_role() {
        let tokens = service();
        let model_id = ModelId::new_v4();
        let token = tokens.issue_job_token(&model_id, JobTokenRole::Deploy, Duration::days(1000));

        let job = tokens
            .verify_job_token(&TokenSecret { value: token })
            .unwrap();
        assert_eq!(job.model_id, model_id);
        assert_eq!(job.role, JobTokenRole::Deploy);
    }

    #[test]
    fn job_token_is_not_a_user_token() {
        let tokens = service();
        let model_id = ModelId::new_v4();
        let token = tokens.issue_job_token(&model_id, JobTokenRole::Upload, Duration::hours(1));

        let result = tokens.verify_user_token(&TokenSecret { value: token });
        assert!(matches!(result, Err(TokenError::Invalid(_))));
    }

    #[test]
    fn tampered_token_is_rejected() {
        let tokens = service();
        let (token, _) = tokens.issue_user_token(&UserId::new_v4());
        let other = TokenService::new("other-secret", std::time::Duration::from_secs(900));

        let result = other.verify_user_token(&TokenSecret { value: token });
        assert!(matches!(result, Err(TokenError::Invalid(_))));
    }
}
