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

pub mod http;
pub mod in_process;

use async_trait::async_trait;
use bazaar_common::model::ModelId;
use bazaar_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const ON_PREM_LLM_JOB: &str = "shared-llm-onprem";

pub fn train_job_name(model_id: &ModelId) -> String {
    format!("train-{model_id}")
}

pub fn deploy_job_name(model_id: &ModelId) -> String {
    format!("deploy-{model_id}")
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Orchestrator unavailable: {0}")]
    Unavailable(String),
    #[error("Job already running: {0}")]
    DuplicateJob(String),
    #[error("Orchestrator API error: {0}")]
    Api(String),
}

impl SafeDisplay for OrchestratorError {
    fn to_safe_string(&self) -> String {
        match self {
            OrchestratorError::Unavailable(_) => "Orchestrator unavailable".to_string(),
            OrchestratorError::DuplicateJob(_) => self.to_string(),
            OrchestratorError::Api(_) => "Orchestrator API error".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Running,
    Dead,
    Pending,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub name: String,
    pub status: JobState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JobLogChunk {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalingBounds {
    pub min_instances: u32,
    pub max_instances: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
}

/// Everything the orchestrator needs to run a job. Names are deterministic
/// per model and purpose so restarts address the same job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub image: Option<String>,
    pub script: Option<String>,
    pub cpu_mhz: u64,
    pub memory_mb: u64,
    pub memory_max_mb: u64,
    pub autoscaling: Option<AutoscalingBounds>,
    pub env: HashMap<String, String>,
    pub mounts: Vec<MountSpec>,
}

/// The small job-lifecycle surface the control plane assumes of the cluster
/// orchestrator.
#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    /// Fails cleanly when a job with the same name is already running;
    /// callers intending a fresh start stop the name first.
    async fn start_job(&self, spec: &JobSpec) -> Result<(), OrchestratorError>;

    async fn stop_job(&self, name: &str) -> Result<(), OrchestratorError>;

    async fn job_info(&self, name: &str) -> Result<JobInfo, OrchestratorError>;

    async fn job_logs(&self, name: &str) -> Result<Vec<JobLogChunk>, OrchestratorError>;

    async fn total_cpu_usage_mhz(&self) -> Result<u64, OrchestratorError>;

    fn ingress_hostname(&self) -> String;
}

/// Stop-if-exists: the half of the fresh-start protocol that tolerates a
/// missing job.
pub async fn stop_job_if_exists(
    client: &dyn OrchestratorClient,
    name: &str,
) -> Result<(), OrchestratorError> {
    match client.job_info(name).await {
        Ok(JobInfo {
            status: JobState::NotFound,
            ..
        }) => Ok(()),
        Ok(_) => client.stop_job(name).await,
        Err(err) => Err(err),
    }
}
