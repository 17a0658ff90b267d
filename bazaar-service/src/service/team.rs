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

use crate::model::{Team, TeamMember};
use crate::repo::model::ModelRepo;
use crate::repo::team::{TeamMemberRecord, TeamRecord, TeamRepo};
use crate::repo::user::UserRepo;
use async_trait::async_trait;
use bazaar_common::model::{ModelAccess, ModelId, TeamId, UserId};
use bazaar_common::SafeDisplay;
use bazaar_service_base::repo::RepoError;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum TeamError {
    #[error("Team not found: {0}")]
    NotFound(TeamId),
    #[error("User not found: {0}")]
    UserNotFound(UserId),
    #[error("User {0} is not a member of team {1}")]
    NotAMember(UserId, TeamId),
    #[error("Model not found: {0}")]
    ModelNotFound(ModelId),
    #[error("Model {0} is not attached to team {1}")]
    ModelNotAttached(ModelId, TeamId),
    #[error("Team name already in use: {0}")]
    DuplicateName(String),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for TeamError {
    fn to_safe_string(&self) -> String {
        match self {
            TeamError::InternalRepoError(inner) => inner.to_safe_string(),
            other => other.to_string(),
        }
    }
}

#[async_trait]
pub trait TeamService: Send + Sync {
    async fn create(&self, name: &str) -> Result<Team, TeamError>;

    async fn get(&self, id: &TeamId) -> Result<Team, TeamError>;

    async fn list(&self) -> Result<Vec<Team>, TeamError>;

    /// Deleting a team detaches all of its models (access resets to
    /// private).
    async fn delete(&self, id: &TeamId) -> Result<(), TeamError>;

    async fn add_user(&self, team_id: &TeamId, user_id: &UserId) -> Result<(), TeamError>;

    /// Removing a member silently downgrades their team-attached models to
    /// private.
    async fn remove_user(&self, team_id: &TeamId, user_id: &UserId) -> Result<(), TeamError>;

    async fn set_team_admin(
        &self,
        team_id: &TeamId,
        user_id: &UserId,
        is_team_admin: bool,
    ) -> Result<(), TeamError>;

    async fn list_members(&self, team_id: &TeamId) -> Result<Vec<TeamMember>, TeamError>;

    async fn attach_model(&self, team_id: &TeamId, model_id: &ModelId) -> Result<(), TeamError>;

    async fn detach_model(&self, team_id: &TeamId, model_id: &ModelId) -> Result<(), TeamError>;
}

pub struct TeamServiceDefault {
    team_repo: Arc<dyn TeamRepo>,
    user_repo: Arc<dyn UserRepo>,
    model_repo: Arc<dyn ModelRepo>,
}

impl TeamServiceDefault {
    pub fn new(
        team_repo: Arc<dyn TeamRepo>,
        user_repo: Arc<dyn UserRepo>,
        model_repo: Arc<dyn ModelRepo>,
    ) -> Self {
        Self {
            team_repo,
            user_repo,
            model_repo,
        }
    }

    async fn require_team(&self, id: &TeamId) -> Result<TeamRecord, TeamError> {
        self.team_repo
            .get(&id.0)
            .await?
            .ok_or(TeamError::NotFound(*id))
    }
}

#[async_trait]
impl TeamService for TeamServiceDefault {
    async fn create(&self, name: &str) -> Result<Team, TeamError> {
        let record = TeamRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        match self.team_repo.create(&record).await {
            Ok(()) => Ok(record.into()),
            Err(error) if error.is_unique_violation() => {
                Err(TeamError::DuplicateName(name.to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn get(&self, id: &TeamId) -> Result<Team, TeamError> {
        Ok(self.require_team(id).await?.into())
    }

    async fn list(&self) -> Result<Vec<Team>, TeamError> {
        Ok(self
            .team_repo
            .list()
            .await?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    async fn delete(&self, id: &TeamId) -> Result<(), TeamError> {
        self.require_team(id).await?;
        let detached = self.model_repo.detach_team(&id.0).await?;
        self.team_repo.delete(&id.0).await?;
        info!(team_id = %id, detached_models = detached, "Team deleted");
        Ok(())
    }

    async fn add_user(&self, team_id: &TeamId, user_id: &UserId) -> Result<(), TeamError> {
        self.require_team(team_id).await?;
        if self.user_repo.get(&user_id.0).await?.is_none() {
            return Err(TeamError::UserNotFound(*user_id));
        }

        // keep an existing admin flag on re-add
        let is_team_admin = self
            .team_repo
            .get_member(&team_id.0, &user_id.0)
            .await?
            .map(|member| member.is_team_admin)
            .unwrap_or(false);
        self.team_repo
            .upsert_member(&TeamMemberRecord {
                team_id: team_id.0,
                user_id: user_id.0,
                is_team_admin,
            })
            .await?;
        Ok(())
    }

    async fn remove_user(&self, team_id: &TeamId, user_id: &UserId) -> Result<(), TeamError> {
        self.require_team(team_id).await?;
        self.model_repo
            .detach_user_team_models(&user_id.0, &team_id.0)
            .await?;
        if !self.team_repo.remove_member(&team_id.0, &user_id.0).await? {
            return Err(TeamError::NotAMember(*user_id, *team_id));
        }
        Ok(())
    }

    async fn set_team_admin(
        &self,
        team_id: &TeamId,
        user_id: &UserId,
        is_team_admin: bool,
    ) -> Result<(), TeamError> {
        self.require_team(team_id).await?;
        if !self
            .team_repo
            .set_member_admin(&team_id.0, &user_id.0, is_team_admin)
            .await?
        {
            return Err(TeamError::NotAMember(*user_id, *team_id));
        }
        Ok(())
    }

    async fn list_members(&self, team_id: &TeamId) -> Result<Vec<TeamMember>, TeamError> {
        self.require_team(team_id).await?;
        let records = self.team_repo.list_members(&team_id.0).await?;

        let mut members = Vec::with_capacity(records.len());
        for record in records {
            let username = self
                .user_repo
                .get(&record.user_id)
                .await?
                .map(|user| user.username)
                .unwrap_or_default();
            members.push(TeamMember {
                user_id: UserId(record.user_id),
                username,
                is_team_admin: record.is_team_admin,
            });
        }
        members.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(members)
    }

    async fn attach_model(&self, team_id: &TeamId, model_id: &ModelId) -> Result<(), TeamError> {
        self.require_team(team_id).await?;
        if self.model_repo.get(&model_id.0).await?.is_none() {
            return Err(TeamError::ModelNotFound(*model_id));
        }
        self.model_repo
            .set_access(
                &model_id.0,
                ModelAccess::Protected.as_str(),
                Some(team_id.0),
                None,
            )
            .await?;
        Ok(())
    }

    async fn detach_model(&self, team_id: &TeamId, model_id: &ModelId) -> Result<(), TeamError> {
        self.require_team(team_id).await?;
        let model = self
            .model_repo
            .get(&model_id.0)
            .await?
            .ok_or(TeamError::ModelNotFound(*model_id))?;
        if model.team_id != Some(team_id.0) {
            return Err(TeamError::ModelNotAttached(*model_id, *team_id));
        }
        self.model_repo
            .set_access(&model_id.0, ModelAccess::Private.as_str(), None, None)
            .await?;
        Ok(())
    }
}
