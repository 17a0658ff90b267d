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

use crate::model::Team;
use async_trait::async_trait;
use bazaar_common::model::TeamId;
use bazaar_service_base::db::Pool;
use bazaar_service_base::repo::RepoError;
use chrono::{DateTime, Utc};
use conditional_trait_gen::trait_gen;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(sqlx::FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct TeamRecord {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl From<TeamRecord> for Team {
    fn from(value: TeamRecord) -> Self {
        Team {
            id: TeamId(value.id),
            name: value.name,
            created_at: value.created_at,
        }
    }
}

#[derive(sqlx::FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct TeamMemberRecord {
    pub team_id: Uuid,
    pub user_id: Uuid,
    pub is_team_admin: bool,
}

#[async_trait]
pub trait TeamRepo: Send + Sync {
    async fn create(&self, team: &TeamRecord) -> Result<(), RepoError>;

    async fn get(&self, id: &Uuid) -> Result<Option<TeamRecord>, RepoError>;

    async fn get_by_name(&self, name: &str) -> Result<Option<TeamRecord>, RepoError>;

    async fn list(&self) -> Result<Vec<TeamRecord>, RepoError>;

    async fn delete(&self, id: &Uuid) -> Result<bool, RepoError>;

    async fn upsert_member(&self, member: &TeamMemberRecord) -> Result<(), RepoError>;

    async fn remove_member(&self, team_id: &Uuid, user_id: &Uuid) -> Result<bool, RepoError>;

    async fn get_member(
        &self,
        team_id: &Uuid,
        user_id: &Uuid,
    ) -> Result<Option<TeamMemberRecord>, RepoError>;

    async fn list_members(&self, team_id: &Uuid) -> Result<Vec<TeamMemberRecord>, RepoError>;

    async fn list_all_members(&self) -> Result<Vec<TeamMemberRecord>, RepoError>;

    async fn set_member_admin(
        &self,
        team_id: &Uuid,
        user_id: &Uuid,
        is_team_admin: bool,
    ) -> Result<bool, RepoError>;
}

pub struct DbTeamRepo<DB: Pool> {
    db_pool: DB,
}

impl<DB: Pool> DbTeamRepo<DB> {
    pub fn new(db_pool: DB) -> Self {
        Self { db_pool }
    }
}

#[trait_gen(bazaar_service_base::db::postgres::PostgresPool -> bazaar_service_base::db::postgres::PostgresPool, bazaar_service_base::db::sqlite::SqlitePool)]
#[async_trait]
impl TeamRepo for DbTeamRepo<bazaar_service_base::db::postgres::PostgresPool> {
    async fn create(&self, team: &TeamRecord) -> Result<(), RepoError> {
        let query = sqlx::query("INSERT INTO teams (id, name, created_at) VALUES ($1, $2, $3)")
            .bind(team.id)
            .bind(team.name.as_str())
            .bind(team.created_at);

        self.db_pool.with_rw("team", "create").execute(query).await?;
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<TeamRecord>, RepoError> {
        let query =
            sqlx::query_as::<_, TeamRecord>("SELECT * FROM teams WHERE id = $1").bind(*id);

        self.db_pool
            .with_ro("team", "get")
            .fetch_optional_as(query)
            .await
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<TeamRecord>, RepoError> {
        let query =
            sqlx::query_as::<_, TeamRecord>("SELECT * FROM teams WHERE name = $1").bind(name);

        self.db_pool
            .with_ro("team", "get_by_name")
            .fetch_optional_as(query)
            .await
    }

    async fn list(&self) -> Result<Vec<TeamRecord>, RepoError> {
        let query = sqlx::query_as::<_, TeamRecord>("SELECT * FROM teams ORDER BY name");

        self.db_pool
            .with_ro("team", "list")
            .fetch_all_as(query)
            .await
    }

    async fn delete(&self, id: &Uuid) -> Result<bool, RepoError> {
        let query = sqlx::query("DELETE FROM teams WHERE id = $1").bind(*id);

        let result = self
            .db_pool
            .with_rw("team", "delete")
            .execute(query)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_member(&self, member: &TeamMemberRecord) -> Result<(), RepoError> {
        let query = sqlx::query(
            r#"
              INSERT INTO team_members (team_id, user_id, is_team_admin)
              VALUES ($1, $2, $3)
              ON CONFLICT (team_id, user_id) DO UPDATE SET is_team_admin = $3
            "#,
        )
        .bind(member.team_id)
        .bind(member.user_id)
        .bind(member.is_team_admin);

        self.db_pool
            .with_rw("team", "upsert_member")
            .execute(query)
            .await?;
        Ok(())
    }

    async fn remove_member(&self, team_id: &Uuid, user_id: &Uuid) -> Result<bool, RepoError> {
        let query = sqlx::query("DELETE FROM team_members WHERE team_id = $1 AND user_id = $2")
            .bind(*team_id)
            .bind(*user_id);

        let result = self
            .db_pool
            .with_rw("team", "remove_member")
            .execute(query)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_member(
        &self,
        team_id: &Uuid,
        user_id: &Uuid,
    ) -> Result<Option<TeamMemberRecord>, RepoError> {
        let query = sqlx::query_as::<_, TeamMemberRecord>(
            "SELECT * FROM team_members WHERE team_id = $1 AND user_id = $2",
        )
        .bind(*team_id)
        .bind(*user_id);

        self.db_pool
            .with_ro("team", "get_member")
            .fetch_optional_as(query)
            .await
    }

    async fn list_members(&self, team_id: &Uuid) -> Result<Vec<TeamMemberRecord>, RepoError> {
        let query = sqlx::query_as::<_, TeamMemberRecord>(
            "SELECT * FROM team_members WHERE team_id = $1",
        )
        .bind(*team_id);

        self.db_pool
            .with_ro("team", "list_members")
            .fetch_all_as(query)
            .await
    }

    async fn list_all_members(&self) -> Result<Vec<TeamMemberRecord>, RepoError> {
        let query = sqlx::query_as::<_, TeamMemberRecord>("SELECT * FROM team_members");

        self.db_pool
            .with_ro("team", "list_all_members")
            .fetch_all_as(query)
            .await
    }

    async fn set_member_admin(
        &self,
        team_id: &Uuid,
        user_id: &Uuid,
        is_team_admin: bool,
    ) -> Result<bool, RepoError> {
        let query = sqlx::query(
            "UPDATE team_members SET is_team_admin = $3 WHERE team_id = $1 AND user_id = $2",
        )
        .bind(*team_id)
        .bind(*user_id)
        .bind(is_team_admin);

        let result = self
            .db_pool
            .with_rw("team", "set_member_admin")
            .execute(query)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
