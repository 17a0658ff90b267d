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
use conditional_trait_gen::trait_gen;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A chunked artifact-upload session. `next_chunk` is the only index the
/// server will accept next, which makes the ordering check a single guarded
/// update.
#[derive(sqlx::FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct ModelUploadRecord {
    pub model_id: Uuid,
    pub declared_checksum: Option<String>,
    pub next_chunk: i64,
    pub bytes_received: i64,
    pub committed: bool,
}

#[async_trait]
pub trait ModelUploadRepo: Send + Sync {
    async fn create(&self, session: &ModelUploadRecord) -> Result<(), RepoError>;

    async fn get(&self, model_id: &Uuid) -> Result<Option<ModelUploadRecord>, RepoError>;

    /// Accepts chunk `expected_chunk` and advances the session; false means
    /// the session is missing, committed, or the chunk is out of order.
    async fn advance(
        &self,
        model_id: &Uuid,
        expected_chunk: i64,
        chunk_bytes: i64,
    ) -> Result<bool, RepoError>;

    async fn mark_committed(&self, model_id: &Uuid) -> Result<bool, RepoError>;

    /// Rewinds a failed commit so the client can retry from chunk zero.
    async fn reset(&self, model_id: &Uuid) -> Result<(), RepoError>;
}

pub struct DbModelUploadRepo<DB: Pool> {
    db_pool: DB,
}

impl<DB: Pool> DbModelUploadRepo<DB> {
    pub fn new(db_pool: DB) -> Self {
        Self { db_pool }
    }
}

#[trait_gen(bazaar_service_base::db::postgres::PostgresPool -> bazaar_service_base::db::postgres::PostgresPool, bazaar_service_base::db::sqlite::SqlitePool)]
#[async_trait]
impl ModelUploadRepo for DbModelUploadRepo<bazaar_service_base::db::postgres::PostgresPool> {
    async fn create(&self, session: &ModelUploadRecord) -> Result<(), RepoError> {
        let query = sqlx::query(
            r#"
              INSERT INTO model_uploads
                (model_id, declared_checksum, next_chunk, bytes_received, committed)
              VALUES
                ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(session.model_id)
        .bind(session.declared_checksum.as_deref())
        .bind(session.next_chunk)
        .bind(session.bytes_received)
        .bind(session.committed);

        self.db_pool
            .with_rw("model_upload", "create")
            .execute(query)
            .await?;
        Ok(())
    }

    async fn get(&self, model_id: &Uuid) -> Result<Option<ModelUploadRecord>, RepoError> {
        let query = sqlx::query_as::<_, ModelUploadRecord>(
            "SELECT * FROM model_uploads WHERE model_id = $1",
        )
        .bind(*model_id);

        self.db_pool
            .with_ro("model_upload", "get")
            .fetch_optional_as(query)
            .await
    }

    async fn advance(
        &self,
        model_id: &Uuid,
        expected_chunk: i64,
        chunk_bytes: i64,
    ) -> Result<bool, RepoError> {
        let query = sqlx::query(
            r#"
              UPDATE model_uploads
              SET next_chunk = next_chunk + 1, bytes_received = bytes_received + $3
              WHERE model_id = $1 AND next_chunk = $2 AND NOT committed
            "#,
        )
        .bind(*model_id)
        .bind(expected_chunk)
        .bind(chunk_bytes);

        let result = self
            .db_pool
            .with_rw("model_upload", "advance")
            .execute(query)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_committed(&self, model_id: &Uuid) -> Result<bool, RepoError> {
        let query = sqlx::query(
            "UPDATE model_uploads SET committed = true WHERE model_id = $1 AND NOT committed",
        )
        .bind(*model_id);

        let result = self
            .db_pool
            .with_rw("model_upload", "mark_committed")
            .execute(query)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reset(&self, model_id: &Uuid) -> Result<(), RepoError> {
        let query = sqlx::query(
            r#"
              UPDATE model_uploads
              SET next_chunk = 0, bytes_received = 0, committed = false
              WHERE model_id = $1
            "#,
        )
        .bind(*model_id);

        self.db_pool
            .with_rw("model_upload", "reset")
            .execute(query)
            .await?;
        Ok(())
    }
}
