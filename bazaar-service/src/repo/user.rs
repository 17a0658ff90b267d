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

use crate::model::User;
use async_trait::async_trait;
use bazaar_common::model::UserId;
use bazaar_service_base::db::Pool;
use bazaar_service_base::repo::RepoError;
use chrono::{DateTime, Utc};
use conditional_trait_gen::trait_gen;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(sqlx::FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: Option<String>,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

impl From<UserRecord> for User {
    fn from(value: UserRecord) -> Self {
        User {
            id: UserId(value.id),
            username: value.username,
            email: value.email,
            is_admin: value.is_admin,
            created_at: value.created_at,
        }
    }
}

#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn create(&self, user: &UserRecord) -> Result<(), RepoError>;

    async fn get(&self, id: &Uuid) -> Result<Option<UserRecord>, RepoError>;

    async fn get_by_username(&self, username: &str) -> Result<Option<UserRecord>, RepoError>;

    async fn get_by_email(&self, email: &str) -> Result<Option<UserRecord>, RepoError>;

    async fn list(&self) -> Result<Vec<UserRecord>, RepoError>;

    /// Users sharing at least one team with the given user.
    async fn list_teammates(&self, user_id: &Uuid) -> Result<Vec<UserRecord>, RepoError>;

    async fn set_admin(&self, id: &Uuid, is_admin: bool) -> Result<bool, RepoError>;

    async fn delete(&self, id: &Uuid) -> Result<bool, RepoError>;
}

pub struct DbUserRepo<DB: Pool> {
    db_pool: DB,
}

impl<DB: Pool> DbUserRepo<DB> {
    pub fn new(db_pool: DB) -> Self {
        Self { db_pool }
    }
}

#[trait_gen(bazaar_service_base::db::postgres::PostgresPool -> bazaar_service_base::db::postgres::PostgresPool, bazaar_service_base::db::sqlite::SqlitePool)]
#[async_trait]
impl UserRepo for DbUserRepo<bazaar_service_base::db::postgres::PostgresPool> {
    async fn create(&self, user: &UserRecord) -> Result<(), RepoError> {
        let query = sqlx::query(
            r#"
              INSERT INTO users
                (id, username, email, password_hash, is_admin, created_at)
              VALUES
                ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(user.id)
        .bind(user.username.as_str())
        .bind(user.email.as_str())
        .bind(user.password_hash.as_deref())
        .bind(user.is_admin)
        .bind(user.created_at);

        self.db_pool.with_rw("user", "create").execute(query).await?;
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<UserRecord>, RepoError> {
        let query =
            sqlx::query_as::<_, UserRecord>("SELECT * FROM users WHERE id = $1").bind(*id);

        self.db_pool
            .with_ro("user", "get")
            .fetch_optional_as(query)
            .await
    }

    async fn get_by_username(&self, username: &str) -> Result<Option<UserRecord>, RepoError> {
        let query = sqlx::query_as::<_, UserRecord>("SELECT * FROM users WHERE username = $1")
            .bind(username);

        self.db_pool
            .with_ro("user", "get_by_username")
            .fetch_optional_as(query)
            .await
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<UserRecord>, RepoError> {
        let query =
            sqlx::query_as::<_, UserRecord>("SELECT * FROM users WHERE email = $1").bind(email);

        self.db_pool
            .with_ro("user", "get_by_email")
            .fetch_optional_as(query)
            .await
    }

    async fn list(&self) -> Result<Vec<UserRecord>, RepoError> {
        let query = sqlx::query_as::<_, UserRecord>("SELECT * FROM users ORDER BY username");

        self.db_pool
            .with_ro("user", "list")
            .fetch_all_as(query)
            .await
    }

    async fn list_teammates(&self, user_id: &Uuid) -> Result<Vec<UserRecord>, RepoError> {
        let query = sqlx::query_as::<_, UserRecord>(
            r#"
              SELECT DISTINCT u.* FROM users u
              JOIN team_members tm ON tm.user_id = u.id
              WHERE tm.team_id IN (SELECT team_id FROM team_members WHERE user_id = $1)
              ORDER BY u.username
            "#,
        )
        .bind(*user_id);

        self.db_pool
            .with_ro("user", "list_teammates")
            .fetch_all_as(query)
            .await
    }

    async fn set_admin(&self, id: &Uuid, is_admin: bool) -> Result<bool, RepoError> {
        let query = sqlx::query("UPDATE users SET is_admin = $2 WHERE id = $1")
            .bind(*id)
            .bind(is_admin);

        let result = self
            .db_pool
            .with_rw("user", "set_admin")
            .execute(query)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: &Uuid) -> Result<bool, RepoError> {
        let query = sqlx::query("DELETE FROM users WHERE id = $1").bind(*id);

        let result = self
            .db_pool
            .with_rw("user", "delete")
            .execute(query)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
