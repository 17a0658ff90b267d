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

use crate::model::User;
use bazaar_common::model::ModelId;
use chrono::{DateTime, Utc};
use poem::Request;
use poem_openapi::auth::{ApiKey, Bearer};
use poem_openapi::SecurityScheme;
use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

pub const API_KEY_PREFIX: &str = "bzk-";

/// A raw bearer token (user or job JWT) as presented by the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenSecret {
    pub value: String,
}

impl FromStr for TokenSecret {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("empty token".to_string());
        }
        Ok(Self {
            value: s.to_string(),
        })
    }
}

impl Display for TokenSecret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "****")
    }
}

/// A raw `X-API-Key` header value, prefix included.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ApiKeySecret {
    pub value: String,
}

impl ApiKeySecret {
    /// The secret part without the presentation prefix.
    pub fn stripped(&self) -> &str {
        self.value
            .strip_prefix(API_KEY_PREFIX)
            .unwrap_or(&self.value)
    }
}

impl FromStr for ApiKeySecret {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("empty api key".to_string());
        }
        Ok(Self {
            value: s.to_string(),
        })
    }
}

/// Combined user authentication: an `X-API-Key` header short-circuits the
/// bearer JWT path.
#[derive(SecurityScheme)]
pub enum PlatformSecurityScheme {
    ApiKey(PlatformApiKey),
    Bearer(PlatformBearer),
}

#[derive(SecurityScheme)]
#[oai(rename = "Token", ty = "bearer", checker = "bearer_checker")]
pub struct PlatformBearer(pub TokenSecret);

#[derive(SecurityScheme)]
#[oai(
    rename = "ApiKey",
    ty = "api_key",
    key_name = "X-API-Key",
    key_in = "header",
    checker = "api_key_checker"
)]
pub struct PlatformApiKey(pub ApiKeySecret);

/// Worker callbacks authenticate with a job JWT carrying the model identity.
#[derive(SecurityScheme)]
#[oai(rename = "JobToken", ty = "bearer", checker = "bearer_checker")]
pub struct JobSecurityScheme(pub TokenSecret);

async fn bearer_checker(_: &Request, bearer: Bearer) -> Option<TokenSecret> {
    TokenSecret::from_str(&bearer.token).ok()
}

async fn api_key_checker(_: &Request, api_key: ApiKey) -> Option<ApiKeySecret> {
    ApiKeySecret::from_str(&api_key.key).ok()
}

/// Scope of an API key: either everything its creator can read, or an
/// explicit model set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyScope {
    pub all_models: bool,
    pub model_ids: HashSet<ModelId>,
    pub expires_at: DateTime<Utc>,
}

impl ApiKeyScope {
    pub fn covers(&self, model_id: &ModelId) -> bool {
        self.all_models || self.model_ids.contains(model_id)
    }
}

/// The authenticated principal of a request. When `api_key_scope` is set the
/// request came in through an API key; the effective user is the key's
/// creator and the reachable surface is restricted to deployment reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorisation {
    pub user: User,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub api_key_scope: Option<ApiKeyScope>,
}

impl Authorisation {
    pub fn for_user(user: User, token_expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            user,
            token_expires_at,
            api_key_scope: None,
        }
    }

    pub fn via_api_key(user: User, scope: ApiKeyScope) -> Self {
        Self {
            user,
            token_expires_at: Some(scope.expires_at),
            api_key_scope: Some(scope),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.user.is_admin
    }

    pub fn is_api_key(&self) -> bool {
        self.api_key_scope.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTokenRole {
    Train,
    Deploy,
    Upload,
}

impl JobTokenRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobTokenRole::Train => "train",
            JobTokenRole::Deploy => "deploy",
            JobTokenRole::Upload => "upload",
        }
    }
}

impl FromStr for JobTokenRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(JobTokenRole::Train),
            "deploy" => Ok(JobTokenRole::Deploy),
            "upload" => Ok(JobTokenRole::Upload),
            _ => Err(format!("Invalid job token role: {s}")),
        }
    }
}

/// Identity proven by a job JWT: the model the job belongs to, not a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobAuthorisation {
    pub model_id: ModelId,
    pub role: JobTokenRole,
}
