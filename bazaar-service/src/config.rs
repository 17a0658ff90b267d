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

use bazaar_common::config::{ConfigLoader, DbConfig};
use bazaar_common::model::Empty;
use bazaar_common::tracing::TracingConfig;
use bazaar_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlatformServiceConfig {
    pub tracing: TracingConfig,
    pub http_port: u16,
    pub db: DbConfig,
    pub storage: BlobStorageConfig,
    pub orchestrator: OrchestratorConfig,
    pub license: LicenseConfig,
    pub identity: IdentityConfig,
    /// Signs both user and job JWTs; the claim set distinguishes the role.
    pub jwt_secret: String,
    #[serde(with = "humantime_serde")]
    pub user_token_ttl: Duration,
    pub job_sync: JobSyncConfig,
    pub worker_images: WorkerImagesConfig,
    pub accounts: AccountsConfig,
    pub cors_origin_regex: String,
}

impl Default for PlatformServiceConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("bazaar-service"),
            http_port: 8080,
            db: DbConfig::default(),
            storage: BlobStorageConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            license: LicenseConfig::default(),
            identity: IdentityConfig::default(),
            jwt_secret: "dev-only-jwt-secret".to_string(),
            user_token_ttl: Duration::from_secs(15 * 60),
            job_sync: JobSyncConfig::default(),
            worker_images: WorkerImagesConfig::default(),
            accounts: AccountsConfig::default(),
            cors_origin_regex: "http://localhost:.*".to_string(),
        }
    }
}

impl SafeDisplay for PlatformServiceConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "HTTP port: {}", self.http_port);
        let _ = writeln!(&mut result, "DB:");
        let _ = writeln!(&mut result, "{}", self.db.to_safe_string_indented());
        let _ = writeln!(&mut result, "storage:");
        let _ = writeln!(&mut result, "{}", self.storage.to_safe_string_indented());
        let _ = writeln!(&mut result, "orchestrator:");
        let _ = writeln!(
            &mut result,
            "{}",
            self.orchestrator.to_safe_string_indented()
        );
        let _ = writeln!(&mut result, "license:");
        let _ = writeln!(&mut result, "{}", self.license.to_safe_string_indented());
        let _ = writeln!(&mut result, "identity:");
        let _ = writeln!(&mut result, "{}", self.identity.to_safe_string_indented());
        let _ = writeln!(&mut result, "JWT secret: ****");
        let _ = writeln!(&mut result, "user token TTL: {:?}", self.user_token_ttl);
        let _ = writeln!(&mut result, "job sync:");
        let _ = writeln!(&mut result, "{}", self.job_sync.to_safe_string_indented());
        let _ = writeln!(&mut result, "worker images:");
        let _ = writeln!(
            &mut result,
            "{}",
            self.worker_images.to_safe_string_indented()
        );
        let _ = writeln!(&mut result, "accounts:");
        let _ = writeln!(&mut result, "{}", self.accounts.to_safe_string_indented());
        let _ = writeln!(&mut result, "CORS origin regex: {}", self.cors_origin_regex);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "config")]
pub enum BlobStorageConfig {
    Local(LocalBlobStorageConfig),
    InMemory(Empty),
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        BlobStorageConfig::Local(LocalBlobStorageConfig::default())
    }
}

impl SafeDisplay for BlobStorageConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        match self {
            BlobStorageConfig::Local(inner) => {
                let _ = writeln!(&mut result, "local:");
                let _ = writeln!(&mut result, "{}", inner.to_safe_string_indented());
            }
            BlobStorageConfig::InMemory(_) => {
                let _ = writeln!(&mut result, "in-memory");
            }
        }
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalBlobStorageConfig {
    pub root_path: PathBuf,
}

impl Default for LocalBlobStorageConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("data/storage"),
        }
    }
}

impl SafeDisplay for LocalBlobStorageConfig {
    fn to_safe_string(&self) -> String {
        format!("root path: {}\n", self.root_path.display())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "config")]
pub enum OrchestratorConfig {
    Http(HttpOrchestratorConfig),
    /// Single-box installs and tests: jobs tracked in process, never spawned.
    InProcess(InProcessOrchestratorConfig),
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig::Http(HttpOrchestratorConfig::default())
    }
}

impl SafeDisplay for OrchestratorConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        match self {
            OrchestratorConfig::Http(inner) => {
                let _ = writeln!(&mut result, "http:");
                let _ = writeln!(&mut result, "{}", inner.to_safe_string_indented());
            }
            OrchestratorConfig::InProcess(inner) => {
                let _ = writeln!(&mut result, "in-process:");
                let _ = writeln!(&mut result, "{}", inner.to_safe_string_indented());
            }
        }
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpOrchestratorConfig {
    pub endpoint: Url,
    pub ingress_hostname: String,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for HttpOrchestratorConfig {
    fn default() -> Self {
        Self {
            endpoint: Url::parse("http://localhost:4646").expect("valid default endpoint"),
            ingress_hostname: "localhost".to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl SafeDisplay for HttpOrchestratorConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "endpoint: {}", self.endpoint);
        let _ = writeln!(&mut result, "ingress hostname: {}", self.ingress_hostname);
        let _ = writeln!(&mut result, "request timeout: {:?}", self.request_timeout);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InProcessOrchestratorConfig {
    pub ingress_hostname: String,
}

impl Default for InProcessOrchestratorConfig {
    fn default() -> Self {
        Self {
            ingress_hostname: "localhost".to_string(),
        }
    }
}

impl SafeDisplay for InProcessOrchestratorConfig {
    fn to_safe_string(&self) -> String {
        format!("ingress hostname: {}\n", self.ingress_hostname)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LicenseConfig {
    pub path: PathBuf,
    /// Base64 DER Ed25519 public key the license JWT is verified with.
    pub public_key: String,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("config/license.jwt"),
            public_key: "MCowBQYDK2VwAyEA9gxANNtlWPBBTm0IEgvMgCEUXw+ohwffyM9wOL4O1pg=".to_string(),
        }
    }
}

impl SafeDisplay for LicenseConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "path: {}", self.path.display());
        let _ = writeln!(&mut result, "public key: {}", self.public_key);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "config")]
pub enum IdentityConfig {
    Local(Empty),
    Sso(SsoConfig),
}

impl Default for IdentityConfig {
    fn default() -> Self {
        IdentityConfig::Local(Empty {})
    }
}

impl SafeDisplay for IdentityConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        match self {
            IdentityConfig::Local(_) => {
                let _ = writeln!(&mut result, "local");
            }
            IdentityConfig::Sso(inner) => {
                let _ = writeln!(&mut result, "sso:");
                let _ = writeln!(&mut result, "{}", inner.to_safe_string_indented());
            }
        }
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SsoConfig {
    pub userinfo_url: Url,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for SsoConfig {
    fn default() -> Self {
        Self {
            userinfo_url: Url::parse("http://localhost:8180/realms/bazaar/userinfo")
                .expect("valid default userinfo url"),
            request_timeout: Duration::from_secs(1),
        }
    }
}

impl SafeDisplay for SsoConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "userinfo url: {}", self.userinfo_url);
        let _ = writeln!(&mut result, "request timeout: {:?}", self.request_timeout);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSyncConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// How long after the last status update an orchestrator-dead job may
    /// stay unreported before the reconciliation loop marks it failed.
    #[serde(with = "humantime_serde")]
    pub grace: Duration,
}

impl Default for JobSyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            grace: Duration::from_secs(60),
        }
    }
}

impl SafeDisplay for JobSyncConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "interval: {:?}", self.interval);
        let _ = writeln!(&mut result, "grace: {:?}", self.grace);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerImagesConfig {
    pub train: String,
    pub deploy: String,
    pub llm: String,
}

impl Default for WorkerImagesConfig {
    fn default() -> Self {
        Self {
            train: "bazaar/train-worker:latest".to_string(),
            deploy: "bazaar/deploy-worker:latest".to_string(),
            llm: "bazaar/llm-worker:latest".to_string(),
        }
    }
}

impl SafeDisplay for WorkerImagesConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "train: {}", self.train);
        let _ = writeln!(&mut result, "deploy: {}", self.deploy);
        let _ = writeln!(&mut result, "llm: {}", self.llm);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct AccountsConfig {
    pub accounts: HashMap<String, AccountConfig>,
}

impl SafeDisplay for AccountsConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        for (id, account) in &self.accounts {
            let _ = writeln!(&mut result, "{id}:");
            let _ = writeln!(&mut result, "{}", account.to_safe_string_indented());
        }
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountConfig {
    pub username: String,
    pub email: String,
    pub password: String,
    pub is_admin: bool,
}

impl SafeDisplay for AccountConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "username: {}", self.username);
        let _ = writeln!(&mut result, "email: {}", self.email);
        let _ = writeln!(&mut result, "password: ****");
        let _ = writeln!(&mut result, "is admin: {}", self.is_admin);
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<PlatformServiceConfig> {
    ConfigLoader::new(&PathBuf::from("config/bazaar-service.toml"))
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use crate::config::make_config_loader;

    #[test]
    pub fn config_is_loadable() {
        make_config_loader().load().expect("Failed to load config");
    }
}
