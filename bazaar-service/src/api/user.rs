use crate::api::{ApiResult, ApiTags};
use crate::auth::PlatformSecurityScheme;
use crate::model::{LoginRequest, SignupRequest, TokenResponse, User};
use crate::service::auth::AuthService;
use crate::service::user::UserService;
use bazaar_common::model::{Empty, UserId};
use bazaar_common::recorded_http_api_request;
use poem_openapi::param::Path;
use poem_openapi::payload::Json;
use poem_openapi::*;
use std::sync::Arc;
use tracing::Instrument;

pub struct UserApi {
    pub auth_service: Arc<dyn AuthService>,
    pub user_service: Arc<dyn UserService>,
}

#[OpenApi(prefix_path = "/api/v2/user", tag = ApiTags::User)]
impl UserApi {
    /// Register a new user
    ///
    /// Only available with identity providers that allow direct signup.
    #[oai(path = "/signup", method = "post", operation_id = "signup")]
    async fn signup(&self, request: Json<SignupRequest>) -> ApiResult<Json<User>> {
        let record = recorded_http_api_request!("signup", username = request.0.username);
        let response = {
            let user = self
                .user_service
                .signup(&request.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(user))
        };

        record.result(response)
    }

    /// Log in with email and password
    ///
    /// Returns a short-lived access token.
    #[oai(path = "/login", method = "post", operation_id = "login")]
    async fn login(&self, request: Json<LoginRequest>) -> ApiResult<Json<TokenResponse>> {
        let record = recorded_http_api_request!("login", email = request.0.email);
        let response = {
            let tokens = self
                .user_service
                .login(&request.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(TokenResponse {
                access_token: tokens.access_token,
                expires_at: tokens.expires_at,
                user: tokens.user,
            }))
        };

        record.result(response)
    }

    /// Profile of the calling user
    #[oai(path = "/info", method = "get", operation_id = "user_info")]
    async fn info(&self, token: PlatformSecurityScheme) -> ApiResult<Json<User>> {
        let record = recorded_http_api_request!("user_info");
        let response = {
            let auth = self
                .auth_service
                .authorization_user(token)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(auth.user))
        };

        record.result(response)
    }

    /// List visible users
    ///
    /// Admins see everyone, other users see themselves and their teammates.
    #[oai(path = "/list", method = "get", operation_id = "user_list")]
    async fn list(&self, token: PlatformSecurityScheme) -> ApiResult<Json<Vec<User>>> {
        let record = recorded_http_api_request!("user_list");
        let response = {
            let auth = self
                .auth_service
                .authorization_user(token)
                .instrument(record.span.clone())
                .await?;
            let users = self
                .user_service
                .list(&auth)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(users))
        };

        record.result(response)
    }

    /// Promote a user to admin
    #[oai(path = "/:user_id/admin", method = "post", operation_id = "promote_admin")]
    async fn promote_admin(
        &self,
        user_id: Path<UserId>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<Empty>> {
        let record = recorded_http_api_request!("promote_admin", user_id = user_id.0.to_string());
        let response = {
            let auth = self
                .auth_service
                .authorization_user(token)
                .instrument(record.span.clone())
                .await?;
            self.auth_service.ensure_admin(&auth)?;
            self.user_service
                .set_admin(&user_id.0, true)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(Empty {}))
        };

        record.result(response)
    }

    /// Demote a user from admin
    #[oai(
        path = "/:user_id/admin",
        method = "delete",
        operation_id = "demote_admin"
    )]
    async fn demote_admin(
        &self,
        user_id: Path<UserId>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<Empty>> {
        let record = recorded_http_api_request!("demote_admin", user_id = user_id.0.to_string());
        let response = {
            let auth = self
                .auth_service
                .authorization_user(token)
                .instrument(record.span.clone())
                .await?;
            self.auth_service.ensure_admin(&auth)?;
            self.user_service
                .set_admin(&user_id.0, false)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(Empty {}))
        };

        record.result(response)
    }

    /// Delete a user
    ///
    /// The deleted user's models are transferred to the acting admin.
    #[oai(path = "/:user_id", method = "delete", operation_id = "delete_user")]
    async fn delete_user(
        &self,
        user_id: Path<UserId>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<Empty>> {
        let record = recorded_http_api_request!("delete_user", user_id = user_id.0.to_string());
        let response = {
            let auth = self
                .auth_service
                .authorization_user(token)
                .instrument(record.span.clone())
                .await?;
            self.auth_service.ensure_admin(&auth)?;
            self.user_service
                .delete(&user_id.0, &auth)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(Empty {}))
        };

        record.result(response)
    }
}
