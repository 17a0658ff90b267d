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

use crate::model::Upload;
use async_trait::async_trait;
use bazaar_common::model::{UploadId, UserId};
use bazaar_service_base::db::Pool;
use bazaar_service_base::repo::RepoError;
use chrono::{DateTime, Utc};
use conditional_trait_gen::trait_gen;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(sqlx::FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl From<UploadRecord> for Upload {
    fn from(value: UploadRecord) -> Self {
        Upload {
            id: UploadId(value.id),
            owner_id: UserId(value.owner_id),
            created_at: value.created_at,
        }
    }
}

#[async_trait]
pub trait UploadRepo: Send + Sync {
    async fn create(&self, upload: &UploadRecord) -> Result<(), RepoError>;

    async fn get(&self, id: &Uuid) -> Result<Option<UploadRecord>, RepoError>;

    async fn list_all(&self) -> Result<Vec<UploadRecord>, RepoError>;

    async fn delete(&self, id: &Uuid) -> Result<bool, RepoError>;
}

pub struct DbUploadRepo<DB: Pool> {
    db_pool: DB,
}

impl<DB: Pool> DbUploadRepo<DB> {
    pub fn new(db_pool: DB) -> Self {
        Self { db_pool }
    }
}

#[trait_gen(bazaar_service_base::db::postgres::PostgresPool -> bazaar_service_base::db::postgres::PostgresPool, bazaar_service_base::db::sqlite::SqlitePool)]
#[async_trait]
impl UploadRepo for DbUploadRepo<bazaar_service_base::db::postgres::PostgresPool> {
    async fn create(&self, upload: &UploadRecord) -> Result<(), RepoError> {
        let query = sqlx::query("INSERT INTO uploads (id, owner_id, created_at) VALUES ($1, $2, $3)")
            .bind(upload.id)
            .bind(upload.owner_id)
            .bind(upload.created_at);

        self.db_pool
            .with_rw("upload", "create")
            .execute(query)
            .await?;
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<UploadRecord>, RepoError> {
        let query =
            sqlx::query_as::<_, UploadRecord>("SELECT * FROM uploads WHERE id = $1").bind(*id);

        self.db_pool
            .with_ro("upload", "get")
            .fetch_optional_as(query)
            .await
    }

    async fn list_all(&self) -> Result<Vec<UploadRecord>, RepoError> {
        let query = sqlx::query_as::<_, UploadRecord>("SELECT * FROM uploads");

        self.db_pool
            .with_ro("upload", "list_all")
            .fetch_all_as(query)
            .await
    }

    async fn delete(&self, id: &Uuid) -> Result<bool, RepoError> {
        let query = sqlx::query("DELETE FROM uploads WHERE id = $1").bind(*id);

        let result = self
            .db_pool
            .with_rw("upload", "delete")
            .execute(query)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
