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
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub hashed_secret: String,
    pub created_by: Uuid,
    pub name: String,
    pub expires_at: DateTime<Utc>,
    pub all_models: bool,
}

#[async_trait]
pub trait ApiKeyRepo: Send + Sync {
    async fn create(&self, key: &ApiKeyRecord, model_ids: &[Uuid]) -> Result<(), RepoError>;

    async fn get(&self, id: &Uuid) -> Result<Option<ApiKeyRecord>, RepoError>;

    /// Lookup by the SHA-256 of the presented secret; the secret itself is
    /// never stored.
    async fn get_by_hash(&self, hashed_secret: &str) -> Result<Option<ApiKeyRecord>, RepoError>;

    async fn model_ids(&self, key_id: &Uuid) -> Result<Vec<Uuid>, RepoError>;

    async fn list_for_model(&self, model_id: &Uuid) -> Result<Vec<ApiKeyRecord>, RepoError>;

    async fn list_all(&self) -> Result<Vec<ApiKeyRecord>, RepoError>;

    async fn delete(&self, id: &Uuid) -> Result<bool, RepoError>;
}

pub struct DbApiKeyRepo<DB: Pool> {
    db_pool: DB,
}

impl<DB: Pool> DbApiKeyRepo<DB> {
    pub fn new(db_pool: DB) -> Self {
        Self { db_pool }
    }
}

#[trait_gen(bazaar_service_base::db::postgres::PostgresPool -> bazaar_service_base::db::postgres::PostgresPool, bazaar_service_base::db::sqlite::SqlitePool)]
#[async_trait]
impl ApiKeyRepo for DbApiKeyRepo<bazaar_service_base::db::postgres::PostgresPool> {
    async fn create(&self, key: &ApiKeyRecord, model_ids: &[Uuid]) -> Result<(), RepoError> {
        let mut tx = self.db_pool.with_rw("api_key", "create").begin().await?;

        tx.execute(
            sqlx::query(
                r#"
                  INSERT INTO api_keys
                    (id, hashed_secret, created_by, name, expires_at, all_models)
                  VALUES
                    ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(key.id)
            .bind(key.hashed_secret.as_str())
            .bind(key.created_by)
            .bind(key.name.as_str())
            .bind(key.expires_at)
            .bind(key.all_models),
        )
        .await?;

        for model_id in model_ids {
            tx.execute(
                sqlx::query("INSERT INTO api_key_models (api_key_id, model_id) VALUES ($1, $2)")
                    .bind(key.id)
                    .bind(*model_id),
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<ApiKeyRecord>, RepoError> {
        let query =
            sqlx::query_as::<_, ApiKeyRecord>("SELECT * FROM api_keys WHERE id = $1").bind(*id);

        self.db_pool
            .with_ro("api_key", "get")
            .fetch_optional_as(query)
            .await
    }

    async fn get_by_hash(&self, hashed_secret: &str) -> Result<Option<ApiKeyRecord>, RepoError> {
        let query =
            sqlx::query_as::<_, ApiKeyRecord>("SELECT * FROM api_keys WHERE hashed_secret = $1")
                .bind(hashed_secret);

        self.db_pool
            .with_ro("api_key", "get_by_hash")
            .fetch_optional_as(query)
            .await
    }

    async fn model_ids(&self, key_id: &Uuid) -> Result<Vec<Uuid>, RepoError> {
        let query = sqlx::query_as::<_, (Uuid,)>(
            "SELECT model_id FROM api_key_models WHERE api_key_id = $1 ORDER BY model_id",
        )
        .bind(*key_id);

        let rows = self
            .db_pool
            .with_ro("api_key", "model_ids")
            .fetch_all_as(query)
            .await?;
        Ok(rows.into_iter().map(|(model_id,)| model_id).collect())
    }

    async fn list_for_model(&self, model_id: &Uuid) -> Result<Vec<ApiKeyRecord>, RepoError> {
        let query = sqlx::query_as::<_, ApiKeyRecord>(
            r#"
              SELECT DISTINCT k.* FROM api_keys k
              LEFT JOIN api_key_models km ON km.api_key_id = k.id
              WHERE km.model_id = $1 OR k.all_models
              ORDER BY k.name
            "#,
        )
        .bind(*model_id);

        self.db_pool
            .with_ro("api_key", "list_for_model")
            .fetch_all_as(query)
            .await
    }

    async fn list_all(&self) -> Result<Vec<ApiKeyRecord>, RepoError> {
        let query = sqlx::query_as::<_, ApiKeyRecord>("SELECT * FROM api_keys");

        self.db_pool
            .with_ro("api_key", "list_all")
            .fetch_all_as(query)
            .await
    }

    async fn delete(&self, id: &Uuid) -> Result<bool, RepoError> {
        let query = sqlx::query("DELETE FROM api_keys WHERE id = $1").bind(*id);

        let result = self
            .db_pool
            .with_rw("api_key", "delete")
            .execute(query)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
