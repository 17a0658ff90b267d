use crate::api::{ApiResult, ApiTags};
use crate::auth::{JobSecurityScheme, JobTokenRole, PlatformSecurityScheme};
use crate::model::{
    ApiKey, CommitModelUploadResponse, CreateApiKeyRequest, CreatedApiKey, ModelInfo,
    ModelPermissions, StartModelUploadRequest, StartModelUploadResponse, UpdateAccessRequest,
    UpdateDefaultPermissionRequest,
};
use crate::service::api_key::ApiKeyService;
use crate::service::auth::AuthService;
use crate::service::model::ModelService;
use crate::service::model_upload::ModelUploadService;
use bazaar_common::model::{ApiKeyId, Empty, ModelId, ModelPermission};
use bazaar_common::recorded_http_api_request;
use poem_openapi::param::Path;
use poem_openapi::payload::{Binary, Json};
use poem_openapi::*;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::Instrument;

pub struct ModelApi {
    pub auth_service: Arc<dyn AuthService>,
    pub model_service: Arc<dyn ModelService>,
    pub model_upload_service: Arc<dyn ModelUploadService>,
    pub api_key_service: Arc<dyn ApiKeyService>,
}

#[OpenApi(prefix_path = "/api/v2/model", tag = ApiTags::Model)]
impl ModelApi {
    /// List visible models
    ///
    /// Owned models plus public ones and those shared through teams.
    #[oai(path = "/list", method = "get", operation_id = "model_list")]
    async fn list(&self, token: PlatformSecurityScheme) -> ApiResult<Json<Vec<ModelInfo>>> {
        let record = recorded_http_api_request!("model_list");
        let response = {
            let auth = self
                .auth_service
                .authorization_user(token)
                .instrument(record.span.clone())
                .await?;
            let models = self
                .model_service
                .list(&auth)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(models))
        };

        record.result(response)
    }

    /// Start a resumable model upload
    ///
    /// Creates the pending model row and returns a short-lived upload token
    /// for the chunk and commit endpoints.
    #[oai(path = "/upload", method = "post", operation_id = "start_model_upload")]
    async fn start_upload(
        &self,
        request: Json<StartModelUploadRequest>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<StartModelUploadResponse>> {
        let record =
            recorded_http_api_request!("start_model_upload", name = request.0.model_name);
        let response = {
            let auth = self
                .auth_service
                .authorization_user(token)
                .instrument(record.span.clone())
                .await?;
            let started = self
                .model_upload_service
                .start(&auth, &request.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(started))
        };

        record.result(response)
    }

    /// Upload one chunk
    ///
    /// Chunks must arrive in index order starting at zero.
    #[oai(
        path = "/upload/:chunk_idx",
        method = "post",
        operation_id = "upload_model_chunk"
    )]
    async fn upload_chunk(
        &self,
        chunk_idx: Path<u64>,
        body: Binary<poem::Body>,
        token: JobSecurityScheme,
    ) -> ApiResult<Json<Empty>> {
        let record = recorded_http_api_request!("upload_model_chunk", chunk_idx = chunk_idx.0);
        let response = {
            let job = self
                .auth_service
                .authorize_job(&token.0, &[JobTokenRole::Upload])
                .instrument(record.span.clone())
                .await?;
            let stream = Box::pin(ReaderStream::new(body.0.into_async_read()));
            self.model_upload_service
                .put_chunk(&job, chunk_idx.0 as i64, stream)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(Empty {}))
        };

        record.result(response)
    }

    /// Commit the uploaded chunks
    ///
    /// Verifies the declared SHA-256 (when given) and completes the model.
    #[oai(
        path = "/upload/commit",
        method = "post",
        operation_id = "commit_model_upload"
    )]
    async fn commit_upload(
        &self,
        token: JobSecurityScheme,
    ) -> ApiResult<Json<CommitModelUploadResponse>> {
        let record = recorded_http_api_request!("commit_model_upload");
        let response = {
            let job = self
                .auth_service
                .authorize_job(&token.0, &[JobTokenRole::Upload])
                .instrument(record.span.clone())
                .await?;
            let committed = self
                .model_upload_service
                .commit(&job)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(committed))
        };

        record.result(response)
    }

    /// Model details
    #[oai(path = "/:model_id", method = "get", operation_id = "get_model")]
    async fn get(
        &self,
        model_id: Path<ModelId>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<ModelInfo>> {
        let record = recorded_http_api_request!("get_model", model_id = model_id.0.to_string());
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
                .ensure_model_permission(&auth, &model, ModelPermission::Read)
                .instrument(record.span.clone())
                .await?;
            let info = self
                .model_service
                .get_info(&model_id.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(info))
        };

        record.result(response)
    }

    /// Delete a model
    ///
    /// Blocked while other non-stopped models depend on it.
    #[oai(path = "/:model_id", method = "delete", operation_id = "delete_model")]
    async fn delete(
        &self,
        model_id: Path<ModelId>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<Empty>> {
        let record = recorded_http_api_request!("delete_model", model_id = model_id.0.to_string());
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
            self.model_service
                .delete(&model_id.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(Empty {}))
        };

        record.result(response)
    }

    /// Change model visibility
    #[oai(path = "/:model_id/access", method = "post", operation_id = "set_model_access")]
    async fn set_access(
        &self,
        model_id: Path<ModelId>,
        request: Json<UpdateAccessRequest>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<Empty>> {
        let record =
            recorded_http_api_request!("set_model_access", model_id = model_id.0.to_string());
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
            self.model_service
                .set_access(&model_id.0, request.0.access, request.0.team_id)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(Empty {}))
        };

        record.result(response)
    }

    /// Change what the model's audience may do
    #[oai(
        path = "/:model_id/default-permission",
        method = "post",
        operation_id = "set_model_default_permission"
    )]
    async fn set_default_permission(
        &self,
        model_id: Path<ModelId>,
        request: Json<UpdateDefaultPermissionRequest>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<Empty>> {
        let record = recorded_http_api_request!(
            "set_model_default_permission",
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
            self.model_service
                .set_default_permission(&model_id.0, request.0.permission)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(Empty {}))
        };

        record.result(response)
    }

    /// Effective permissions of the caller on this model
    #[oai(
        path = "/:model_id/permissions",
        method = "get",
        operation_id = "get_model_permissions"
    )]
    async fn permissions(
        &self,
        model_id: Path<ModelId>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<ModelPermissions>> {
        let record = recorded_http_api_request!(
            "get_model_permissions",
            model_id = model_id.0.to_string()
        );
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
            let permission = self
                .auth_service
                .get_model_permission(&auth, &model)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(ModelPermissions {
                read: permission >= ModelPermission::Read,
                write: permission >= ModelPermission::Write,
                owner: permission >= ModelPermission::Owner,
                exp: auth.token_expires_at,
            }))
        };

        record.result(response)
    }

    /// Download the model artifact
    #[oai(
        path = "/:model_id/download",
        method = "get",
        operation_id = "download_model"
    )]
    async fn download(
        &self,
        model_id: Path<ModelId>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Binary<poem::Body>> {
        let record =
            recorded_http_api_request!("download_model", model_id = model_id.0.to_string());
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
                .ensure_model_permission(&auth, &model, ModelPermission::Read)
                .instrument(record.span.clone())
                .await?;
            let stream = self
                .model_service
                .download(&model_id.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Binary(poem::Body::from_bytes_stream(stream)))
        };

        record.result(response)
    }

    /// Issue an API key for this model
    ///
    /// The returned secret is shown exactly once.
    #[oai(
        path = "/:model_id/api-keys",
        method = "post",
        operation_id = "create_api_key"
    )]
    async fn create_api_key(
        &self,
        model_id: Path<ModelId>,
        request: Json<CreateApiKeyRequest>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<CreatedApiKey>> {
        let record =
            recorded_http_api_request!("create_api_key", model_id = model_id.0.to_string());
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
            let created = self
                .api_key_service
                .create(&auth, &model_id.0, &request.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(created))
        };

        record.result(response)
    }

    /// List API keys covering this model
    #[oai(
        path = "/:model_id/api-keys",
        method = "get",
        operation_id = "list_api_keys"
    )]
    async fn list_api_keys(
        &self,
        model_id: Path<ModelId>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<Vec<ApiKey>>> {
        let record = recorded_http_api_request!("list_api_keys", model_id = model_id.0.to_string());
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
            let keys = self
                .api_key_service
                .list_for_model(&model_id.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(keys))
        };

        record.result(response)
    }

    /// Revoke an API key
    #[oai(
        path = "/:model_id/api-keys/:key_id",
        method = "delete",
        operation_id = "delete_api_key"
    )]
    async fn delete_api_key(
        &self,
        model_id: Path<ModelId>,
        key_id: Path<ApiKeyId>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<Empty>> {
        let record = recorded_http_api_request!(
            "delete_api_key",
            model_id = model_id.0.to_string(),
            key_id = key_id.0.to_string()
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
            self.api_key_service
                .delete(&auth, &key_id.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(Empty {}))
        };

        record.result(response)
    }
}
