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

use crate::orchestrator::{
    JobInfo, JobLogChunk, JobSpec, JobState, OrchestratorClient, OrchestratorError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

struct JobEntry {
    spec: JobSpec,
    status: JobState,
    logs: Vec<JobLogChunk>,
}

/// Job table without a real scheduler behind it; backs single-box installs
/// and the test suites. Helpers let tests drive orchestrator-side state
/// (e.g. a job dying without the worker reporting back).
#[derive(Clone)]
pub struct InProcessOrchestrator {
    jobs: Arc<RwLock<HashMap<String, JobEntry>>>,
    ingress_hostname: String,
}

impl InProcessOrchestrator {
    pub fn new(ingress_hostname: &str) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            ingress_hostname: ingress_hostname.to_string(),
        }
    }

    pub async fn set_job_status(&self, name: &str, status: JobState) {
        if let Some(entry) = self.jobs.write().await.get_mut(name) {
            entry.status = status;
        }
    }

    /// Simulates the orchestrator losing every job (e.g. a cluster wipe).
    pub async fn clear(&self) {
        self.jobs.write().await.clear();
    }

    pub async fn push_log(&self, name: &str, stdout: &str, stderr: &str) {
        if let Some(entry) = self.jobs.write().await.get_mut(name) {
            entry.logs.push(JobLogChunk {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            });
        }
    }

    pub async fn running_jobs(&self) -> Vec<String> {
        self.jobs
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.status == JobState::Running)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub async fn job_spec(&self, name: &str) -> Option<JobSpec> {
        self.jobs
            .read()
            .await
            .get(name)
            .map(|entry| entry.spec.clone())
    }
}

#[async_trait]
impl OrchestratorClient for InProcessOrchestrator {
    async fn start_job(&self, spec: &JobSpec) -> Result<(), OrchestratorError> {
        let mut jobs = self.jobs.write().await;
        if let Some(existing) = jobs.get(&spec.name) {
            if existing.status == JobState::Running {
                return Err(OrchestratorError::DuplicateJob(spec.name.clone()));
            }
        }
        jobs.insert(
            spec.name.clone(),
            JobEntry {
                spec: spec.clone(),
                status: JobState::Running,
                logs: Vec::new(),
            },
        );
        Ok(())
    }

    async fn stop_job(&self, name: &str) -> Result<(), OrchestratorError> {
        self.jobs.write().await.remove(name);
        Ok(())
    }

    async fn job_info(&self, name: &str) -> Result<JobInfo, OrchestratorError> {
        let status = self
            .jobs
            .read()
            .await
            .get(name)
            .map(|entry| entry.status)
            .unwrap_or(JobState::NotFound);
        Ok(JobInfo {
            name: name.to_string(),
            status,
        })
    }

    async fn job_logs(&self, name: &str) -> Result<Vec<JobLogChunk>, OrchestratorError> {
        Ok(self
            .jobs
            .read()
            .await
            .get(name)
            .map(|entry| entry.logs.clone())
            .unwrap_or_default())
    }

    async fn total_cpu_usage_mhz(&self) -> Result<u64, OrchestratorError> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|entry| entry.status == JobState::Running)
            .map(|entry| entry.spec.cpu_mhz)
            .sum())
    }

    fn ingress_hostname(&self) -> String {
        self.ingress_hostname.clone()
    }
}
