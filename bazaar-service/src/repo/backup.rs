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

use crate::model::Backup;
use async_trait::async_trait;
use bazaar_common::model::{BackupId, UserId};
use bazaar_service_base::db::Pool;
use bazaar_service_base::repo::RepoError;
use chrono::{DateTime, Utc};
use conditional_trait_gen::trait_gen;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(sqlx::FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: Uuid,
    pub path: String,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub status: String,
}

impl From<BackupRecord> for Backup {
    fn from(value: BackupRecord) -> Self {
        Backup {
            id: BackupId(value.id),
            path: value.path,
            created_by: UserId(value.created_by),
            created_at: value.created_at,
            status: value.status,
        }
    }
}

#[async_trait]
pub trait BackupRepo: Send + Sync {
    async fn create(&self, backup: &BackupRecord) -> Result<(), RepoError>;

    async fn list(&self) -> Result<Vec<BackupRecord>, RepoError>;
}

pub struct DbBackupRepo<DB: Pool> {
    db_pool: DB,
}

impl<DB: Pool> DbBackupRepo<DB> {
    pub fn new(db_pool: DB) -> Self {
        Self { db_pool }
    }
}

#[trait_gen(bazaar_service_base::db::postgres::PostgresPool -> bazaar_service_base::db::postgres::PostgresPool, bazaar_service_base::db::sqlite::SqlitePool)]
#[async_trait]
impl BackupRepo for DbBackupRepo<bazaar_service_base::db::postgres::PostgresPool> {
    async fn create(&self, backup: &BackupRecord) -> Result<(), RepoError> {
        let query = sqlx::query(
            r#"
              INSERT INTO backups (id, path, created_by, created_at, status)
              VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(backup.id)
        .bind(backup.path.as_str())
        .bind(backup.created_by)
        .bind(backup.created_at)
        .bind(backup.status.as_str());

        self.db_pool
            .with_rw("backup", "create")
            .execute(query)
            .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<BackupRecord>, RepoError> {
        let query =
            sqlx::query_as::<_, BackupRecord>("SELECT * FROM backups ORDER BY created_at DESC");

        self.db_pool
            .with_ro("backup", "list")
            .fetch_all_as(query)
            .await
    }
}
