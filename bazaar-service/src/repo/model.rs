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
use bazaar_common::model::JobStatus;
use bazaar_service_base::db::Pool;
use bazaar_service_base::repo::RepoError;
use chrono::{DateTime, Utc};
use conditional_trait_gen::trait_gen;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(sqlx::FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    pub id: Uuid,
    pub name: String,
    pub model_type: String,
    pub owner_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub team_id: Option<Uuid>,
    pub access: String,
    pub default_permission: String,
    pub train_status: String,
    pub deploy_status: String,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub train_status_updated_at: DateTime<Utc>,
    pub deploy_status_updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct ModelAttributeRecord {
    pub model_id: Uuid,
    pub key: String,
    pub value: String,
}

#[derive(sqlx::FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct ModelDependencyRecord {
    pub model_id: Uuid,
    pub dependency_id: Uuid,
}

/// Result of the transactional model insert; every outcome is decided inside
/// one serializable transaction so two concurrent submissions with the same
/// `(owner, name)` are linearized by the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateModelOutcome {
    Created,
    DuplicateName,
    ParentMissing,
    ParentNotComplete,
    DependencyMissing(Uuid),
}

#[async_trait]
pub trait ModelRepo: Send + Sync {
    async fn create(
        &self,
        model: &ModelRecord,
        dependencies: &[Uuid],
        attributes: &[(String, String)],
    ) -> Result<CreateModelOutcome, RepoError>;

    async fn get(&self, id: &Uuid) -> Result<Option<ModelRecord>, RepoError>;

    async fn get_by_owner_and_name(
        &self,
        owner_id: &Uuid,
        name: &str,
    ) -> Result<Option<ModelRecord>, RepoError>;

    async fn list(&self) -> Result<Vec<ModelRecord>, RepoError>;

    /// Owned, public, or visible through team membership.
    async fn list_visible(&self, user_id: &Uuid) -> Result<Vec<ModelRecord>, RepoError>;

    async fn list_by_owner(&self, owner_id: &Uuid) -> Result<Vec<ModelRecord>, RepoError>;

    /// Models with a train or deploy job the orchestrator should be running.
    async fn list_active(&self) -> Result<Vec<ModelRecord>, RepoError>;

    async fn delete(&self, id: &Uuid) -> Result<bool, RepoError>;

    /// Guarded train-status transition; false when the current status is not
    /// in `from` (which makes worker resends idempotent).
    async fn update_train_status(
        &self,
        id: &Uuid,
        from: &[JobStatus],
        to: JobStatus,
    ) -> Result<bool, RepoError>;

    async fn update_deploy_status(
        &self,
        id: &Uuid,
        from: &[JobStatus],
        to: JobStatus,
    ) -> Result<bool, RepoError>;

    async fn set_access(
        &self,
        id: &Uuid,
        access: &str,
        team_id: Option<Uuid>,
        published_at: Option<DateTime<Utc>>,
    ) -> Result<bool, RepoError>;

    async fn set_default_permission(&self, id: &Uuid, permission: &str)
        -> Result<bool, RepoError>;

    async fn set_owner_and_name(
        &self,
        id: &Uuid,
        owner_id: &Uuid,
        name: &str,
    ) -> Result<bool, RepoError>;

    /// Team deletion: every attached model becomes private.
    async fn detach_team(&self, team_id: &Uuid) -> Result<u64, RepoError>;

    /// Member removal: the removed user's models attached to this team
    /// become private.
    async fn detach_user_team_models(
        &self,
        user_id: &Uuid,
        team_id: &Uuid,
    ) -> Result<u64, RepoError>;

    async fn dependencies_of(&self, id: &Uuid) -> Result<Vec<Uuid>, RepoError>;

    async fn dependents_of(&self, id: &Uuid) -> Result<Vec<ModelRecord>, RepoError>;

    async fn list_all_dependencies(&self) -> Result<Vec<ModelDependencyRecord>, RepoError>;

    async fn get_attributes(&self, model_id: &Uuid) -> Result<Vec<(String, String)>, RepoError>;

    async fn set_attribute(&self, model_id: &Uuid, key: &str, value: &str)
        -> Result<(), RepoError>;

    async fn list_all_attributes(&self) -> Result<Vec<ModelAttributeRecord>, RepoError>;

    /// Number of models depending on this one, optionally restricted to
    /// those whose deploy status is not `stopped`.
    async fn count_downstream(&self, id: &Uuid, active_only: bool) -> Result<i64, RepoError>;
}

pub struct DbModelRepo<DB: Pool> {
    db_pool: DB,
}

impl<DB: Pool> DbModelRepo<DB> {
    pub fn new(db_pool: DB) -> Self {
        Self { db_pool }
    }
}

fn status_list(statuses: &[JobStatus]) -> String {
    statuses
        .iter()
        .map(|status| format!("'{}'", status.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[trait_gen(bazaar_service_base::db::postgres::PostgresPool -> bazaar_service_base::db::postgres::PostgresPool, bazaar_service_base::db::sqlite::SqlitePool)]
#[async_trait]
impl ModelRepo for DbModelRepo<bazaar_service_base::db::postgres::PostgresPool> {
    async fn create(
        &self,
        model: &ModelRecord,
        dependencies: &[Uuid],
        attributes: &[(String, String)],
    ) -> Result<CreateModelOutcome, RepoError> {
        let mut tx = self.db_pool.with_rw("model", "create").begin().await?;

        let duplicate = tx
            .fetch_optional_as(
                sqlx::query_as::<_, (Uuid,)>(
                    "SELECT id FROM models WHERE owner_id = $1 AND name = $2",
                )
                .bind(model.owner_id)
                .bind(model.name.as_str()),
            )
            .await?;
        if duplicate.is_some() {
            tx.rollback().await?;
            return Ok(CreateModelOutcome::DuplicateName);
        }

        if let Some(parent_id) = model.parent_id {
            let parent = tx
                .fetch_optional_as(
                    sqlx::query_as::<_, (String,)>(
                        "SELECT train_status FROM models WHERE id = $1",
                    )
                    .bind(parent_id),
                )
                .await?;
            match parent {
                None => {
                    tx.rollback().await?;
                    return Ok(CreateModelOutcome::ParentMissing);
                }
                Some((status,)) if status != JobStatus::Complete.as_str() => {
                    tx.rollback().await?;
                    return Ok(CreateModelOutcome::ParentNotComplete);
                }
                Some(_) => {}
            }
        }

        for dependency_id in dependencies {
            let exists = tx
                .fetch_optional_as(
                    sqlx::query_as::<_, (Uuid,)>("SELECT id FROM models WHERE id = $1")
                        .bind(*dependency_id),
                )
                .await?;
            if exists.is_none() {
                tx.rollback().await?;
                return Ok(CreateModelOutcome::DependencyMissing(*dependency_id));
            }
        }

        let insert = tx
            .execute(
                sqlx::query(
                    r#"
                      INSERT INTO models
                        (id, name, model_type, owner_id, parent_id, team_id, access,
                         default_permission, train_status, deploy_status, published_at,
                         created_at, train_status_updated_at, deploy_status_updated_at)
                      VALUES
                        ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                    "#,
                )
                .bind(model.id)
                .bind(model.name.as_str())
                .bind(model.model_type.as_str())
                .bind(model.owner_id)
                .bind(model.parent_id)
                .bind(model.team_id)
                .bind(model.access.as_str())
                .bind(model.default_permission.as_str())
                .bind(model.train_status.as_str())
                .bind(model.deploy_status.as_str())
                .bind(model.published_at)
                .bind(model.created_at)
                .bind(model.train_status_updated_at)
                .bind(model.deploy_status_updated_at),
            )
            .await;
        match insert {
            Ok(_) => {}
            Err(error) if error.is_unique_violation() => {
                tx.rollback().await?;
                return Ok(CreateModelOutcome::DuplicateName);
            }
            Err(error) => {
                tx.rollback().await?;
                return Err(error);
            }
        }

        for dependency_id in dependencies {
            tx.execute(
                sqlx::query(
                    "INSERT INTO model_dependencies (model_id, dependency_id) VALUES ($1, $2)",
                )
                .bind(model.id)
                .bind(*dependency_id),
            )
            .await?;
        }

        for (key, value) in attributes {
            tx.execute(
                sqlx::query(
                    "INSERT INTO model_attributes (model_id, key, value) VALUES ($1, $2, $3)",
                )
                .bind(model.id)
                .bind(key.as_str())
                .bind(value.as_str()),
            )
            .await?;
        }

        tx.commit().await?;
        Ok(CreateModelOutcome::Created)
    }

    async fn get(&self, id: &Uuid) -> Result<Option<ModelRecord>, RepoError> {
        let query =
            sqlx::query_as::<_, ModelRecord>("SELECT * FROM models WHERE id = $1").bind(*id);

        self.db_pool
            .with_ro("model", "get")
            .fetch_optional_as(query)
            .await
    }

    async fn get_by_owner_and_name(
        &self,
        owner_id: &Uuid,
        name: &str,
    ) -> Result<Option<ModelRecord>, RepoError> {
        let query = sqlx::query_as::<_, ModelRecord>(
            "SELECT * FROM models WHERE owner_id = $1 AND name = $2",
        )
        .bind(*owner_id)
        .bind(name);

        self.db_pool
            .with_ro("model", "get_by_owner_and_name")
            .fetch_optional_as(query)
            .await
    }

    async fn list(&self) -> Result<Vec<ModelRecord>, RepoError> {
        let query =
            sqlx::query_as::<_, ModelRecord>("SELECT * FROM models ORDER BY created_at, id");

        self.db_pool
            .with_ro("model", "list")
            .fetch_all_as(query)
            .await
    }

    async fn list_visible(&self, user_id: &Uuid) -> Result<Vec<ModelRecord>, RepoError> {
        let query = sqlx::query_as::<_, ModelRecord>(
            r#"
              SELECT m.* FROM models m
              WHERE m.owner_id = $1
                 OR m.access = 'public'
                 OR (m.access = 'protected' AND EXISTS (
                        SELECT 1 FROM team_members tm
                        WHERE tm.team_id = m.team_id AND tm.user_id = $1))
              ORDER BY m.created_at, m.id
            "#,
        )
        .bind(*user_id);

        self.db_pool
            .with_ro("model", "list_visible")
            .fetch_all_as(query)
            .await
    }

    async fn list_by_owner(&self, owner_id: &Uuid) -> Result<Vec<ModelRecord>, RepoError> {
        let query = sqlx::query_as::<_, ModelRecord>(
            "SELECT * FROM models WHERE owner_id = $1 ORDER BY created_at, id",
        )
        .bind(*owner_id);

        self.db_pool
            .with_ro("model", "list_by_owner")
            .fetch_all_as(query)
            .await
    }

    async fn list_active(&self) -> Result<Vec<ModelRecord>, RepoError> {
        let query = sqlx::query_as::<_, ModelRecord>(
            r#"
              SELECT * FROM models
              WHERE train_status IN ('starting', 'in_progress')
                 OR deploy_status IN ('starting', 'in_progress')
              ORDER BY created_at, id
            "#,
        );

        self.db_pool
            .with_ro("model", "list_active")
            .fetch_all_as(query)
            .await
    }

    async fn delete(&self, id: &Uuid) -> Result<bool, RepoError> {
        let query = sqlx::query("DELETE FROM models WHERE id = $1").bind(*id);

        let result = self
            .db_pool
            .with_rw("model", "delete")
            .execute(query)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_train_status(
        &self,
        id: &Uuid,
        from: &[JobStatus],
        to: JobStatus,
    ) -> Result<bool, RepoError> {
        let sql = format!(
            "UPDATE models SET train_status = $2, train_status_updated_at = $3 \
             WHERE id = $1 AND train_status IN ({})",
            status_list(from)
        );
        let query = sqlx::query(&sql)
            .bind(*id)
            .bind(to.as_str())
            .bind(Utc::now());

        let result = self
            .db_pool
            .with_rw("model", "update_train_status")
            .execute(query)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_deploy_status(
        &self,
        id: &Uuid,
        from: &[JobStatus],
        to: JobStatus,
    ) -> Result<bool, RepoError> {
        let sql = format!(
            "UPDATE models SET deploy_status = $2, deploy_status_updated_at = $3 \
             WHERE id = $1 AND deploy_status IN ({})",
            status_list(from)
        );
        let query = sqlx::query(&sql)
            .bind(*id)
            .bind(to.as_str())
            .bind(Utc::now());

        let result = self
            .db_pool
            .with_rw("model", "update_deploy_status")
            .execute(query)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_access(
        &self,
        id: &Uuid,
        access: &str,
        team_id: Option<Uuid>,
        published_at: Option<DateTime<Utc>>,
    ) -> Result<bool, RepoError> {
        let query = sqlx::query(
            "UPDATE models SET access = $2, team_id = $3, published_at = $4 WHERE id = $1",
        )
        .bind(*id)
        .bind(access)
        .bind(team_id)
        .bind(published_at);

        let result = self
            .db_pool
            .with_rw("model", "set_access")
            .execute(query)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_default_permission(
        &self,
        id: &Uuid,
        permission: &str,
    ) -> Result<bool, RepoError> {
        let query = sqlx::query("UPDATE models SET default_permission = $2 WHERE id = $1")
            .bind(*id)
            .bind(permission);

        let result = self
            .db_pool
            .with_rw("model", "set_default_permission")
            .execute(query)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_owner_and_name(
        &self,
        id: &Uuid,
        owner_id: &Uuid,
        name: &str,
    ) -> Result<bool, RepoError> {
        let query = sqlx::query("UPDATE models SET owner_id = $2, name = $3 WHERE id = $1")
            .bind(*id)
            .bind(*owner_id)
            .bind(name);

        let result = self
            .db_pool
            .with_rw("model", "set_owner_and_name")
            .execute(query)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn detach_team(&self, team_id: &Uuid) -> Result<u64, RepoError> {
        let query = sqlx::query(
            "UPDATE models SET access = 'private', team_id = NULL WHERE team_id = $1",
        )
        .bind(*team_id);

        let result = self
            .db_pool
            .with_rw("model", "detach_team")
            .execute(query)
            .await?;
        Ok(result.rows_affected())
    }

    async fn detach_user_team_models(
        &self,
        user_id: &Uuid,
        team_id: &Uuid,
    ) -> Result<u64, RepoError> {
        let query = sqlx::query(
            r#"
              UPDATE models SET access = 'private', team_id = NULL
              WHERE owner_id = $1 AND team_id = $2
            "#,
        )
        .bind(*user_id)
        .bind(*team_id);

        let result = self
            .db_pool
            .with_rw("model", "detach_user_team_models")
            .execute(query)
            .await?;
        Ok(result.rows_affected())
    }

    async fn dependencies_of(&self, id: &Uuid) -> Result<Vec<Uuid>, RepoError> {
        let query = sqlx::query_as::<_, (Uuid,)>(
            "SELECT dependency_id FROM model_dependencies WHERE model_id = $1 ORDER BY dependency_id",
        )
        .bind(*id);

        let rows = self
            .db_pool
            .with_ro("model", "dependencies_of")
            .fetch_all_as(query)
            .await?;
        Ok(rows.into_iter().map(|(dependency_id,)| dependency_id).collect())
    }

    async fn dependents_of(&self, id: &Uuid) -> Result<Vec<ModelRecord>, RepoError> {
        let query = sqlx::query_as::<_, ModelRecord>(
            r#"
              SELECT m.* FROM models m
              JOIN model_dependencies d ON d.model_id = m.id
              WHERE d.dependency_id = $1
              ORDER BY m.created_at, m.id
            "#,
        )
        .bind(*id);

        self.db_pool
            .with_ro("model", "dependents_of")
            .fetch_all_as(query)
            .await
    }

    async fn list_all_dependencies(&self) -> Result<Vec<ModelDependencyRecord>, RepoError> {
        let query = sqlx::query_as::<_, ModelDependencyRecord>("SELECT * FROM model_dependencies");

        self.db_pool
            .with_ro("model", "list_all_dependencies")
            .fetch_all_as(query)
            .await
    }

    async fn get_attributes(&self, model_id: &Uuid) -> Result<Vec<(String, String)>, RepoError> {
        let query = sqlx::query_as::<_, (String, String)>(
            "SELECT key, value FROM model_attributes WHERE model_id = $1 ORDER BY key",
        )
        .bind(*model_id);

        self.db_pool
            .with_ro("model", "get_attributes")
            .fetch_all_as(query)
            .await
    }

    async fn set_attribute(
        &self,
        model_id: &Uuid,
        key: &str,
        value: &str,
    ) -> Result<(), RepoError> {
        let query = sqlx::query(
            r#"
              INSERT INTO model_attributes (model_id, key, value)
              VALUES ($1, $2, $3)
              ON CONFLICT (model_id, key) DO UPDATE SET value = $3
            "#,
        )
        .bind(*model_id)
        .bind(key)
        .bind(value);

        self.db_pool
            .with_rw("model", "set_attribute")
            .execute(query)
            .await?;
        Ok(())
    }

    async fn list_all_attributes(&self) -> Result<Vec<ModelAttributeRecord>, RepoError> {
        let query = sqlx::query_as::<_, ModelAttributeRecord>("SELECT * FROM model_attributes");

        self.db_pool
            .with_ro("model", "list_all_attributes")
            .fetch_all_as(query)
            .await
    }

    async fn count_downstream(&self, id: &Uuid, active_only: bool) -> Result<i64, RepoError> {
        let sql = if active_only {
            r#"
              SELECT COUNT(*) FROM model_dependencies d
              JOIN models m ON m.id = d.model_id
              WHERE d.dependency_id = $1 AND m.deploy_status != 'stopped'
            "#
        } else {
            r#"
              SELECT COUNT(*) FROM model_dependencies d
              JOIN models m ON m.id = d.model_id
              WHERE d.dependency_id = $1
            "#
        };
        let query = sqlx::query_as::<_, (i64,)>(sql).bind(*id);

        let (count,) = self
            .db_pool
            .with_ro("model", "count_downstream")
            .fetch_one_as(query)
            .await?;
        Ok(count)
    }
}
