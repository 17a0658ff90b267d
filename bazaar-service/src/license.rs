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

use crate::config::LicenseConfig;
use crate::orchestrator::{OrchestratorClient, OrchestratorError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bazaar_common::SafeDisplay;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum LicenseError {
    #[error("License signature invalid: {0}")]
    InvalidSignature(String),
    #[error("License expired")]
    Expired,
    #[error("License CPU limit exceeded: limit {limit_mhz} MHz, in use {current_mhz} MHz, requested {requested_mhz} MHz")]
    CpuExceeded {
        limit_mhz: u64,
        current_mhz: u64,
        requested_mhz: u64,
    },
    #[error("Failed to read license file: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

impl SafeDisplay for LicenseError {
    fn to_safe_string(&self) -> String {
        match self {
            LicenseError::InvalidSignature(_) => "License signature invalid".to_string(),
            LicenseError::Expired => self.to_string(),
            LicenseError::CpuExceeded { .. } => self.to_string(),
            LicenseError::Io(_) => "Failed to read license file".to_string(),
            LicenseError::Orchestrator(inner) => inner.to_safe_string(),
        }
    }
}

/// Claims of the signed license descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseClaims {
    pub cpu_mhz_limit: u64,
    pub exp: i64,
    /// Opaque string forwarded to every worker job.
    pub payload: String,
}

/// Verifies the EdDSA-signed license at boot and gates every job start on
/// the cluster-wide CPU cap.
pub struct LicenseVerifier {
    claims: LicenseClaims,
    orchestrator: Arc<dyn OrchestratorClient>,
}

/// SPKI header of an Ed25519 public key; the verifier accepts both SPKI and
/// raw 32-byte keys.
const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

fn raw_ed25519_public_key(der: &[u8]) -> &[u8] {
    if der.len() == 44 && der[..12] == ED25519_SPKI_PREFIX {
        &der[12..]
    } else {
        der
    }
}

impl LicenseVerifier {
    pub fn load(
        config: &LicenseConfig,
        orchestrator: Arc<dyn OrchestratorClient>,
    ) -> Result<Self, LicenseError> {
        let token = std::fs::read_to_string(&config.path)?;
        let claims = Self::parse(token.trim(), &config.public_key)?;
        Ok(Self {
            claims,
            orchestrator,
        })
    }

    pub fn from_token(
        token: &str,
        public_key: &str,
        orchestrator: Arc<dyn OrchestratorClient>,
    ) -> Result<Self, LicenseError> {
        let claims = Self::parse(token, public_key)?;
        Ok(Self {
            claims,
            orchestrator,
        })
    }

    fn parse(token: &str, public_key_base64: &str) -> Result<LicenseClaims, LicenseError> {
        let der = BASE64
            .decode(public_key_base64)
            .map_err(|err| LicenseError::InvalidSignature(err.to_string()))?;
        let key = DecodingKey::from_ed_der(raw_ed25519_public_key(&der));

        let mut validation = Validation::new(Algorithm::EdDSA);
        // Expiry is checked per verification so an expired license still
        // parses at boot and fails job starts with the right error.
        validation.validate_exp = false;

        let data = jsonwebtoken::decode::<LicenseClaims>(token, &key, &validation)
            .map_err(|err| LicenseError::InvalidSignature(err.to_string()))?;
        Ok(data.claims)
    }

    pub fn cpu_mhz_limit(&self) -> u64 {
        self.claims.cpu_mhz_limit
    }

    /// Gate called before any job start: expiry, then cluster CPU headroom.
    /// Returns the license payload that is forwarded to the worker.
    pub async fn verify(&self, requested_mhz: u64) -> Result<String, LicenseError> {
        if Utc::now().timestamp() > self.claims.exp {
            return Err(LicenseError::Expired);
        }

        let current_mhz = self.orchestrator.total_cpu_usage_mhz().await?;
        if current_mhz + requested_mhz > self.claims.cpu_mhz_limit {
            return Err(LicenseError::CpuExceeded {
                limit_mhz: self.claims.cpu_mhz_limit,
                current_mhz,
                requested_mhz,
            });
        }

        Ok(self.claims.payload.clone())
    }
}

#[cfg(test)]
pub mod testing {
    use super::LicenseClaims;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use jsonwebtoken::{Algorithm, EncodingKey, Header};

    // Fixed Ed25519 keypair (PKCS#8 private, SPKI public) used only by tests.
    pub const TEST_PRIVATE_KEY: &str =
        "MC4CAQAwBQYDK2VwBCIEIMDNO+xRAwWTDqt5wN84sCHviRldQMiylmSK715b5JnW";
    pub const TEST_PUBLIC_KEY: &str =
        "MCowBQYDK2VwAyEA9gxANNtlWPBBTm0IEgvMgCEUXw+ohwffyM9wOL4O1pg=";

    pub fn sign_license(claims: &LicenseClaims) -> String {
        let der = BASE64.decode(TEST_PRIVATE_KEY).expect("valid test key");
        let key = EncodingKey::from_ed_der(&der);
        jsonwebtoken::encode(&Header::new(Algorithm::EdDSA), claims, &key)
            .expect("license signing")
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::testing::{sign_license, TEST_PUBLIC_KEY};
    use super::*;
    use crate::orchestrator::in_process::InProcessOrchestrator;
    use crate::orchestrator::JobSpec;
    use std::collections::HashMap;

    fn claims(cpu_mhz_limit: u64, exp_offset_secs: i64) -> LicenseClaims {
        LicenseClaims {
            cpu_mhz_limit,
            exp: Utc::now().timestamp() + exp_offset_secs,
            payload: "worker-payload".to_string(),
        }
    }

    fn verifier(claims: &LicenseClaims, orchestrator: Arc<dyn OrchestratorClient>) -> LicenseVerifier {
        LicenseVerifier::from_token(&sign_license(claims), TEST_PUBLIC_KEY, orchestrator)
            .expect("valid license")
    }

    #[test]
    async fn valid_license_returns_worker_payload() {
        let orchestrator = Arc::new(InProcessOrchestrator::new("localhost"));
        let verifier = verifier(&claims(10_000, 3600), orchestrator);

        let payload = verifier.verify(2400).await.unwrap();
        assert_eq!(payload, "worker-payload");
    }

    #[test]
    async fn expired_license_fails_verification_but_parses() {
        let orchestrator = Arc::new(InProcessOrchestrator::new("localhost"));
        let verifier = verifier(&claims(10_000, -3600), orchestrator);

        assert!(matches!(
            verifier.verify(2400).await,
            Err(LicenseError::Expired)
        ));
    }

    #[test]
    async fn cpu_cap_counts_running_jobs() {
        let orchestrator = Arc::new(InProcessOrchestrator::new("localhost"));
        orchestrator
            .start_job(&JobSpec {
                name: "busy".to_string(),
                image: None,
                script: None,
                cpu_mhz: 9_000,
                memory_mb: 100,
                memory_max_mb: 400,
                autoscaling: None,
                env: HashMap::new(),
                mounts: Vec::new(),
            })
            .await
            .unwrap();

        let verifier = verifier(&claims(10_000, 3600), orchestrator);
        let result = verifier.verify(2400).await;
        assert!(matches!(result, Err(LicenseError::CpuExceeded { .. })));
    }

    #[test]
    fn tampered_license_is_rejected() {
        let orchestrator: Arc<dyn OrchestratorClient> =
            Arc::new(InProcessOrchestrator::new("localhost"));
        let mut token = sign_license(&claims(10_000, 3600));
        token.push('x');

        let result = LicenseVerifier::from_token(&token, TEST_PUBLIC_KEY, orchestrator);
        assert!(matches!(result, Err(LicenseError::InvalidSignature(_))));
    }
}
