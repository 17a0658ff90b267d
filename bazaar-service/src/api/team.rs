use crate::api::{ApiResult, ApiTags};
use crate::auth::PlatformSecurityScheme;
use crate::model::{CreateTeamRequest, Team, TeamMember};
use crate::service::auth::AuthService;
use crate::service::model::ModelService;
use crate::service::team::TeamService;
use bazaar_common::model::{Empty, ModelId, ModelPermission, TeamId, UserId};
use bazaar_common::recorded_http_api_request;
use poem_openapi::param::Path;
use poem_openapi::payload::Json;
use poem_openapi::*;
use std::sync::Arc;
use tracing::Instrument;

pub struct TeamApi {
    pub auth_service: Arc<dyn AuthService>,
    pub team_service: Arc<dyn TeamService>,
    pub model_service: Arc<dyn ModelService>,
}

#[OpenApi(prefix_path = "/api/v2/team", tag = ApiTags::Team)]
impl TeamApi {
    /// Create a team
    #[oai(path = "/create", method = "post", operation_id = "create_team")]
    async fn create(
        &self,
        request: Json<CreateTeamRequest>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<Team>> {
        let record = recorded_http_api_request!("create_team", name = request.0.name);
        let response = {
            let auth = self
                .auth_service
                .authorization_user(token)
                .instrument(record.span.clone())
                .await?;
            self.auth_service.ensure_admin(&auth)?;
            let team = self
                .team_service
                .create(&request.0.name)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(team))
        };

        record.result(response)
    }

    /// Delete a team
    ///
    /// Detaches all models of the team; their access resets to private.
    #[oai(path = "/:team_id", method = "delete", operation_id = "delete_team")]
    async fn delete(
        &self,
        team_id: Path<TeamId>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<Empty>> {
        let record = recorded_http_api_request!("delete_team", team_id = team_id.0.to_string());
        let response = {
            let auth = self
                .auth_service
                .authorization_user(token)
                .instrument(record.span.clone())
                .await?;
            self.auth_service.ensure_admin(&auth)?;
            self.team_service
                .delete(&team_id.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(Empty {}))
        };

        record.result(response)
    }

    /// List team members
    #[oai(path = "/:team_id/users", method = "get", operation_id = "list_team_users")]
    async fn list_users(
        &self,
        team_id: Path<TeamId>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<Vec<TeamMember>>> {
        let record = recorded_http_api_request!("list_team_users", team_id = team_id.0.to_string());
        let response = {
            let auth = self
                .auth_service
                .authorization_user(token)
                .instrument(record.span.clone())
                .await?;
            self.auth_service
                .ensure_team_member(&auth, &team_id.0)
                .instrument(record.span.clone())
                .await?;
            let members = self
                .team_service
                .list_members(&team_id.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(members))
        };

        record.result(response)
    }

    /// Add a user to the team
    #[oai(
        path = "/:team_id/users/:user_id",
        method = "post",
        operation_id = "add_team_user"
    )]
    async fn add_user(
        &self,
        team_id: Path<TeamId>,
        user_id: Path<UserId>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<Empty>> {
        let record = recorded_http_api_request!(
            "add_team_user",
            team_id = team_id.0.to_string(),
            user_id = user_id.0.to_string()
        );
        let response = {
            let auth = self
                .auth_service
                .authorization_user(token)
                .instrument(record.span.clone())
                .await?;
            self.auth_service
                .ensure_team_admin(&auth, &team_id.0)
                .instrument(record.span.clone())
                .await?;
            self.team_service
                .add_user(&team_id.0, &user_id.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(Empty {}))
        };

        record.result(response)
    }

    /// Remove a user from the team
    ///
    /// The removed user's models attached to this team become private.
    #[oai(
        path = "/:team_id/users/:user_id",
        method = "delete",
        operation_id = "remove_team_user"
    )]
    async fn remove_user(
        &self,
        team_id: Path<TeamId>,
        user_id: Path<UserId>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<Empty>> {
        let record = recorded_http_api_request!(
            "remove_team_user",
            team_id = team_id.0.to_string(),
            user_id = user_id.0.to_string()
        );
        let response = {
            let auth = self
                .auth_service
                .authorization_user(token)
                .instrument(record.span.clone())
                .await?;
            self.auth_service
                .ensure_team_admin(&auth, &team_id.0)
                .instrument(record.span.clone())
                .await?;
            self.team_service
                .remove_user(&team_id.0, &user_id.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(Empty {}))
        };

        record.result(response)
    }

    /// Grant team admin
    #[oai(
        path = "/:team_id/admins/:user_id",
        method = "post",
        operation_id = "add_team_admin"
    )]
    async fn add_admin(
        &self,
        team_id: Path<TeamId>,
        user_id: Path<UserId>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<Empty>> {
        let record = recorded_http_api_request!(
            "add_team_admin",
            team_id = team_id.0.to_string(),
            user_id = user_id.0.to_string()
        );
        let response = {
            let auth = self
                .auth_service
                .authorization_user(token)
                .instrument(record.span.clone())
                .await?;
            self.auth_service
                .ensure_team_admin(&auth, &team_id.0)
                .instrument(record.span.clone())
                .await?;
            self.team_service
                .set_team_admin(&team_id.0, &user_id.0, true)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(Empty {}))
        };

        record.result(response)
    }

    /// Revoke team admin
    #[oai(
        path = "/:team_id/admins/:user_id",
        method = "delete",
        operation_id = "remove_team_admin"
    )]
    async fn remove_admin(
        &self,
        team_id: Path<TeamId>,
        user_id: Path<UserId>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<Empty>> {
        let record = recorded_http_api_request!(
            "remove_team_admin",
            team_id = team_id.0.to_string(),
            user_id = user_id.0.to_string()
        );
        let response = {
            let auth = self
                .auth_service
                .authorization_user(token)
                .instrument(record.span.clone())
                .await?;
            self.auth_service
                .ensure_team_admin(&auth, &team_id.0)
                .instrument(record.span.clone())
                .await?;
            self.team_service
                .set_team_admin(&team_id.0, &user_id.0, false)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(Empty {}))
        };

        record.result(response)
    }

    /// Attach a model to the team
    ///
    /// The model becomes protected with this team as its audience.
    #[oai(
        path = "/:team_id/models/:model_id",
        method = "post",
        operation_id = "attach_team_model"
    )]
    async fn attach_model(
        &self,
        team_id: Path<TeamId>,
        model_id: Path<ModelId>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<Empty>> {
        let record = recorded_http_api_request!(
            "attach_team_model",
            team_id = team_id.0.to_string(),
            model_id = model_id.0.to_string()
        );
        let response = {
            let auth = self
                .auth_service
                .authorization_user(token)
                .instrument(record.span.clone())
                .await?;
            let model = self
                .model_service
                .get_record(&model_id.0)
                .instrument(record.span.clone())
                .await?;
            self.auth_service
                .ensure_model_permission(&auth, &model, ModelPermission::Owner)
                .instrument(record.span.clone())
                .await?;
            self.team_service
                .attach_model(&team_id.0, &model_id.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(Empty {}))
        };

        record.result(response)
    }

    /// Detach a model from the team
    #[oai(
        path = "/:team_id/models/:model_id",
        method = "delete",
        operation_id = "detach_team_model"
    )]
    async fn detach_model(
        &self,
        team_id: Path<TeamId>,
        model_id: Path<ModelId>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<Empty>> {
        let record = recorded_http_api_request!(
            "detach_team_model",
            team_id = team_id.0.to_string(),
            model_id = model_id.0.to_string()
        );
        let response = {
            let auth = self
                .auth_service
                .authorization_user(token)
                .instrument(record.span.clone())
                .await?;
            let model = self
                .model_service
                .get_record(&model_id.0)
                .instrument(record.span.clone())
                .await?;
            self.auth_service
                .ensure_model_permission(&auth, &model, ModelPermission::Owner)
                .instrument(record.span.clone())
                .await?;
            self.team_service
                .detach_model(&team_id.0, &model_id.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(Empty {}))
        };

        record.result(response)
    }
}
