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

use async_trait::async_trait;
use bazaar_service_base::db::Pool;
use bazaar_service_base::repo::RepoError;
use chrono::{DateTime, Utc};
use conditional_trait_gen::trait_gen;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(sqlx::FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct JobLogRecord {
    pub id: i64,
    pub model_id: Uuid,
    pub job_type: String,
    pub level: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait JobLogRepo: Send + Sync {
    async fn append(
        &self,
        model_id: &Uuid,
        job_type: &str,
        level: &str,
        message: &str,
    ) -> Result<(), RepoError>;

    async fn list(&self, model_id: &Uuid, job_type: &str) -> Result<Vec<JobLogRecord>, RepoError>;

    async fn list_all(&self) -> Result<Vec<JobLogRecord>, RepoError>;
}

pub struct DbJobLogRepo<DB: Pool> {
    db_pool: DB,
}

impl<DB: Pool> DbJobLogRepo<DB> {
    pub fn new(db_pool: DB) -> Self {
        Self { db_pool }
    }
}

#[trait_gen(bazaar_service_base::db::postgres::PostgresPool -> bazaar_service_base::db::postgres::PostgresPool, bazaar_service_base::db::sqlite::SqlitePool)]
#[async_trait]
impl JobLogRepo for DbJobLogRepo<bazaar_service_base::db::postgres::PostgresPool> {
    async fn append(
        &self,
        model_id: &Uuid,
        job_type: &str,
        level: &str,
        message: &str,
    ) -> Result<(), RepoError> {
        let query = sqlx::query(
            r#"
              INSERT INTO job_logs (model_id, job_type, level, message, created_at)
              VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(*model_id)
        .bind(job_type)
        .bind(level)
        .bind(message)
        .bind(Utc::now());

        self.db_pool
            .with_rw("job_log", "append")
            .execute(query)
            .await?;
        Ok(())
    }

    async fn list(&self, model_id: &Uuid, job_type: &str) -> Result<Vec<JobLogRecord>, RepoError> {
        let query = sqlx::query_as::<_, JobLogRecord>(
            r#"
              SELECT * FROM job_logs
              WHERE model_id = $1 AND job_type = $2
              ORDER BY created_at, id
            "#,
        )
        .bind(*model_id)
        .bind(job_type);

        self.db_pool
            .with_ro("job_log", "list")
            .fetch_all_as(query)
            .await
    }

    async fn list_all(&self) -> Result<Vec<JobLogRecord>, RepoError> {
        let query = sqlx::query_as::<_, JobLogRecord>("SELECT * FROM job_logs ORDER BY id");

        self.db_pool
            .with_ro("job_log", "list_all")
            .fetch_all_as(query)
            .await
    }
}
