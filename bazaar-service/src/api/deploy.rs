use crate::api::{ApiResult, ApiTags};
use crate::auth::{JobSecurityScheme, JobTokenRole, PlatformSecurityScheme};
use crate::model::{
    DeployRequest, DeployResponse, LogsResponse, StatusResponse, UpdateStatusRequest,
    WorkerLogRequest,
};
use crate::service::auth::AuthService;
use crate::service::deploy::DeployService;
use crate::service::model::ModelService;
use bazaar_common::model::{Empty, ModelId, ModelPermission};
use bazaar_common::recorded_http_api_request;
use poem_openapi::param::Path;
use poem_openapi::payload::Json;
use poem_openapi::*;
use std::sync::Arc;
use tracing::Instrument;

pub struct DeployApi {
    pub auth_service: Arc<dyn AuthService>,
    pub model_service: Arc<dyn ModelService>,
    pub deploy_service: Arc<dyn DeployService>,
}

#[OpenApi(prefix_path = "/api/v2/deploy", tag = ApiTags::Deploy)]
impl DeployApi {
    /// Worker callback: raw deployment status
    #[oai(
        path = "/status-internal",
        method = "get",
        operation_id = "deploy_status_internal"
    )]
    async fn status_internal(&self, token: JobSecurityScheme) -> ApiResult<Json<StatusResponse>> {
        let record = recorded_http_api_request!("deploy_status_internal");
        let response = {
            let job = self
                .auth_service
                .authorize_job(&token.0, &[JobTokenRole::Deploy])
                .instrument(record.span.clone())
                .await?;
            let status = self
                .deploy_service
                .status_internal(&job)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(status))
        };

        record.result(response)
    }

    /// Worker callback: deployment status update
    #[oai(
        path = "/update-status",
        method = "post",
        operation_id = "deploy_update_status"
    )]
    async fn update_status(
        &self,
        request: Json<UpdateStatusRequest>,
        token: JobSecurityScheme,
    ) -> ApiResult<Json<Empty>> {
        let record = recorded_http_api_request!("deploy_update_status");
        let response = {
            let job = self
                .auth_service
                .authorize_job(&token.0, &[JobTokenRole::Deploy])
                .instrument(record.span.clone())
                .await?;
            self.deploy_service
                .update_status(&job, request.0.status)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(Empty {}))
        };

        record.result(response)
    }

    /// Worker callback: deployment log line
    #[oai(path = "/log", method = "post", operation_id = "deploy_log")]
    async fn log(
        &self,
        request: Json<WorkerLogRequest>,
        token: JobSecurityScheme,
    ) -> ApiResult<Json<Empty>> {
        let record = recorded_http_api_request!("deploy_log");
        let response = {
            let job = self
                .auth_service
                .authorize_job(&token.0, &[JobTokenRole::Deploy])
                .instrument(record.span.clone())
                .await?;
            self.deploy_service
                .append_log(&job, request.0.level, &request.0.message)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(Empty {}))
        };

        record.result(response)
    }

    /// Deploy a trained model
    #[oai(path = "/:model_id", method = "post", operation_id = "deploy_model")]
    async fn deploy(
        &self,
        model_id: Path<ModelId>,
        request: Json<DeployRequest>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<DeployResponse>> {
        let record = recorded_http_api_request!("deploy_model", model_id = model_id.0.to_string());
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
            let deployed = self
                .deploy_service
                .deploy(&auth, &model_id.0, &request.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(deployed))
        };

        record.result(response)
    }

    /// Stop a deployment
    ///
    /// Rejected while non-stopped downstream models depend on this one.
    #[oai(path = "/:model_id", method = "delete", operation_id = "undeploy_model")]
    async fn undeploy(
        &self,
        model_id: Path<ModelId>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<Empty>> {
        let record =
            recorded_http_api_request!("undeploy_model", model_id = model_id.0.to_string());
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
            self.deploy_service
                .undeploy(&model_id.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(Empty {}))
        };

        record.result(response)
    }

    /// Deployment status
    ///
    /// Accepts scoped API keys as well as user tokens.
    #[oai(path = "/:model_id/status", method = "get", operation_id = "deploy_status")]
    async fn status(
        &self,
        model_id: Path<ModelId>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<StatusResponse>> {
        let record = recorded_http_api_request!("deploy_status", model_id = model_id.0.to_string());
        let response = {
            let auth = self
                .auth_service
                .authorization(token)
                .instrument(record.span.clone())
                .await?;
            let model = self
                .model_service
                .get_record(&model_id.0)
                .instrument(record.span.clone())
                .await?;
            self.auth_service
                .ensure_model_permission(&auth, &model, ModelPermission::Read)
                .instrument(record.span.clone())
                .await?;
            let status = self
                .deploy_service
                .status(&model_id.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(status))
        };

        record.result(response)
    }

    /// Deployment logs
    ///
    /// Accepts scoped API keys as well as user tokens.
    #[oai(path = "/:model_id/logs", method = "get", operation_id = "deploy_logs")]
    async fn logs(
        &self,
        model_id: Path<ModelId>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<LogsResponse>> {
        let record = recorded_http_api_request!("deploy_logs", model_id = model_id.0.to_string());
        let response = {
            let auth = self
                .auth_service
                .authorization(token)
                .instrument(record.span.clone())
                .await?;
            let model = self
                .model_service
                .get_record(&model_id.0)
                .instrument(record.span.clone())
                .await?;
            self.auth_service
                .ensure_model_permission(&auth, &model, ModelPermission::Read)
                .instrument(record.span.clone())
                .await?;
            let logs = self
                .deploy_service
                .logs(&model_id.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(logs))
        };

        record.result(response)
    }
}
