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

use crate::orchestrator::{deploy_job_name, train_job_name, JobState, OrchestratorClient};
use crate::repo::job_log::JobLogRepo;
use crate::repo::model::{ModelRecord, ModelRepo};
use bazaar_common::model::{JobStatus, JobType, LogLevel, ModelId};
use bazaar_service_base::repo::RepoError;
use chrono::Utc;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct JobSyncInner {
    model_repo: Arc<dyn ModelRepo>,
    job_log_repo: Arc<dyn JobLogRepo>,
    orchestrator: Arc<dyn OrchestratorClient>,
    grace: chrono::Duration,
}

struct RunningLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Reconciles stored job statuses with what the orchestrator actually runs.
/// A job the orchestrator reports dead, whose worker stayed silent past the
/// grace window, is flipped to failed with an explanatory log entry. The
/// loop holds no state between ticks and is safe to restart at any time.
pub struct JobStatusSync {
    inner: Arc<JobSyncInner>,
    running: tokio::sync::Mutex<Option<RunningLoop>>,
}

impl JobStatusSync {
    pub fn new(
        model_repo: Arc<dyn ModelRepo>,
        job_log_repo: Arc<dyn JobLogRepo>,
        orchestrator: Arc<dyn OrchestratorClient>,
        grace: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(JobSyncInner {
                model_repo,
                job_log_repo,
                orchestrator,
                grace: chrono::Duration::seconds(grace.as_secs() as i64),
            }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn start(&self, interval: Duration) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = sync_once(&inner).await {
                            warn!("Job status sync tick failed: {err}");
                        }
                    }
                }
            }
            info!("Job status sync stopped");
        });

        *running = Some(RunningLoop { cancel, handle });
        info!(interval_ms = interval.as_millis() as u64, "Job status sync started");
    }

    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            running.cancel.cancel();
            let _ = running.handle.await;
        }
    }

    /// One reconciliation pass; exposed so tests can tick deterministically.
    pub async fn sync_once(&self) -> Result<(), RepoError> {
        sync_once(&self.inner).await
    }
}

async fn sync_once(inner: &JobSyncInner) -> Result<(), RepoError> {
    for record in inner.model_repo.list_active().await? {
        sync_job(inner, &record, JobType::Train).await?;
        sync_job(inner, &record, JobType::Deploy).await?;
    }
    Ok(())
}

async fn sync_job(
    inner: &JobSyncInner,
    record: &ModelRecord,
    job_type: JobType,
) -> Result<(), RepoError> {
    let (status, updated_at) = match job_type {
        JobType::Train => (&record.train_status, record.train_status_updated_at),
        JobType::Deploy => (&record.deploy_status, record.deploy_status_updated_at),
    };
    let active = JobStatus::from_str(status)
        .map(|status| status.is_active())
        .unwrap_or(false);
    if !active {
        return Ok(());
    }

    let model_id = ModelId(record.id);
    let job_name = match job_type {
        JobType::Train => train_job_name(&model_id),
        JobType::Deploy => deploy_job_name(&model_id),
    };

    let info = match inner.orchestrator.job_info(&job_name).await {
        Ok(info) => info,
        Err(err) => {
            // transient orchestrator trouble; the next tick retries
            warn!(job = %job_name, "Job status sync skipped: {err}");
            return Ok(());
        }
    };

    match info.status {
        JobState::Running | JobState::Pending => Ok(()),
        JobState::Dead | JobState::NotFound => {
            // a quiet worker gets the grace window before the job is
            // declared lost
            if Utc::now() - updated_at < inner.grace {
                return Ok(());
            }

            let transitioned = match job_type {
                JobType::Train => {
                    inner
                        .model_repo
                        .update_train_status(
                            &record.id,
                            &[JobStatus::Starting, JobStatus::InProgress],
                            JobStatus::Failed,
                        )
                        .await?
                }
                JobType::Deploy => {
                    inner
                        .model_repo
                        .update_deploy_status(
                            &record.id,
                            &[JobStatus::Starting, JobStatus::InProgress],
                            JobStatus::Failed,
                        )
                        .await?
                }
            };

            if transitioned {
                warn!(
                    model_id = %model_id,
                    job = %job_name,
                    orchestrator_status = ?info.status,
                    "Orchestrator reports job gone; marking failed"
                );
                inner
                    .job_log_repo
                    .append(
                        &record.id,
                        job_type.as_str(),
                        LogLevel::Error.as_str(),
                        &format!(
                            "orchestrator reports job '{job_name}' as {:?} without a terminal \
                             status from the worker; marking {} failed",
                            info.status,
                            job_type.as_str()
                        ),
                    )
                    .await?;
            }
            Ok(())
        }
    }
}
