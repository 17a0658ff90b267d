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

use crate::config::HttpOrchestratorConfig;
use crate::orchestrator::{
    JobInfo, JobLogChunk, JobSpec, JobState, OrchestratorClient, OrchestratorError,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

/// REST client for the cluster orchestrator's job API.
pub struct HttpOrchestratorClient {
    client: reqwest::Client,
    base_url: Url,
    ingress_hostname: String,
}

#[derive(Deserialize)]
struct CpuUsageResponse {
    total_mhz: u64,
}

impl HttpOrchestratorClient {
    pub fn new(config: &HttpOrchestratorConfig) -> Result<Self, OrchestratorError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| OrchestratorError::Unavailable(err.to_string()))?;
        Ok(Self {
            client,
            base_url: config.endpoint.clone(),
            ingress_hostname: config.ingress_hostname.clone(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, OrchestratorError> {
        self.base_url
            .join(path)
            .map_err(|err| OrchestratorError::Api(err.to_string()))
    }
}

fn connection_error(err: reqwest::Error) -> OrchestratorError {
    OrchestratorError::Unavailable(err.to_string())
}

async fn api_error(response: reqwest::Response) -> OrchestratorError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    OrchestratorError::Api(format!("{status}: {body}"))
}

#[async_trait]
impl OrchestratorClient for HttpOrchestratorClient {
    async fn start_job(&self, spec: &JobSpec) -> Result<(), OrchestratorError> {
        let response = self
            .client
            .post(self.url("v1/jobs")?)
            .json(spec)
            .send()
            .await
            .map_err(connection_error)?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(OrchestratorError::DuplicateJob(spec.name.clone())),
            _ => Err(api_error(response).await),
        }
    }

    async fn stop_job(&self, name: &str) -> Result<(), OrchestratorError> {
        let response = self
            .client
            .delete(self.url(&format!("v1/jobs/{name}"))?)
            .send()
            .await
            .map_err(connection_error)?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(api_error(response).await),
        }
    }

    async fn job_info(&self, name: &str) -> Result<JobInfo, OrchestratorError> {
        let response = self
            .client
            .get(self.url(&format!("v1/jobs/{name}"))?)
            .send()
            .await
            .map_err(connection_error)?;

        match response.status() {
            status if status.is_success() => {
                response.json::<JobInfo>().await.map_err(connection_error)
            }
            StatusCode::NOT_FOUND => Ok(JobInfo {
                name: name.to_string(),
                status: JobState::NotFound,
            }),
            _ => Err(api_error(response).await),
        }
    }

    async fn job_logs(&self, name: &str) -> Result<Vec<JobLogChunk>, OrchestratorError> {
        let response = self
            .client
            .get(self.url(&format!("v1/jobs/{name}/logs"))?)
            .send()
            .await
            .map_err(connection_error)?;

        match response.status() {
            status if status.is_success() => response
                .json::<Vec<JobLogChunk>>()
                .await
                .map_err(connection_error),
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            _ => Err(api_error(response).await),
        }
    }

    async fn total_cpu_usage_mhz(&self) -> Result<u64, OrchestratorError> {
        let response = self
            .client
            .get(self.url("v1/usage/cpu")?)
            .send()
            .await
            .map_err(connection_error)?;

        if response.status().is_success() {
            let usage = response
                .json::<CpuUsageResponse>()
                .await
                .map_err(connection_error)?;
            Ok(usage.total_mhz)
        } else {
            Err(api_error(response).await)
        }
    }

    fn ingress_hostname(&self) -> String {
        self.ingress_hostname.clone()
    }
}
