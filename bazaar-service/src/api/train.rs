use crate::api::{ApiResult, ApiTags};
use crate::auth::{JobSecurityScheme, JobTokenRole, PlatformSecurityScheme};
use crate::model::{
    CreateCompositeRequest, LogsResponse, NlpDatagenRequest, RetrainNdbRequest, StatusResponse,
    TrainNdbRequest, TrainNlpRequest, TrainResponse, UpdateStatusRequest, UploadDataResponse,
    WorkerLogRequest,
};
use crate::service::auth::AuthService;
use crate::service::model::ModelService;
use crate::service::train::TrainService;
use crate::service::upload::UploadService;
use bazaar_common::model::{Empty, ModelId, ModelPermission, ModelType};
use bazaar_common::recorded_http_api_request;
use poem_openapi::param::Path;
use poem_openapi::payload::Json;
use poem_openapi::types::multipart::Upload;
use poem_openapi::*;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::Instrument;

#[derive(Multipart)]
pub struct UploadDataPayload {
    pub files: Vec<Upload>,
}

pub struct TrainApi {
    pub auth_service: Arc<dyn AuthService>,
    pub model_service: Arc<dyn ModelService>,
    pub train_service: Arc<dyn TrainService>,
    pub upload_service: Arc<dyn UploadService>,
}

#[OpenApi(prefix_path = "/api/v2/train", tag = ApiTags::Train)]
impl TrainApi {
    /// Train a retrieval (NDB) model
    #[oai(path = "/ndb", method = "post", operation_id = "train_ndb")]
    async fn train_ndb(
        &self,
        request: Json<TrainNdbRequest>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<TrainResponse>> {
        let record = recorded_http_api_request!("train_ndb", name = request.0.model_name);
        let response = {
            let auth = self
                .auth_service
                .authorization_user(token)
                .instrument(record.span.clone())
                .await?;
            let started = self
                .train_service
                .train_ndb(&auth, &request.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(started))
        };

        record.result(response)
    }

    /// Fine-tune an existing NDB model
    #[oai(path = "/ndb-retrain", method = "post", operation_id = "retrain_ndb")]
    async fn retrain_ndb(
        &self,
        request: Json<RetrainNdbRequest>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<TrainResponse>> {
        let record = recorded_http_api_request!("retrain_ndb", name = request.0.model_name);
        let response = {
            let auth = self
                .auth_service
                .authorization_user(token)
                .instrument(record.span.clone())
                .await?;
            let started = self
                .train_service
                .retrain_ndb(&auth, &request.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(started))
        };

        record.result(response)
    }

    /// Train a token-classification NLP model
    #[oai(path = "/nlp-token", method = "post", operation_id = "train_nlp_token")]
    async fn train_nlp_token(
        &self,
        request: Json<TrainNlpRequest>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<TrainResponse>> {
        let record = recorded_http_api_request!("train_nlp_token", name = request.0.model_name);
        let response = {
            let auth = self
                .auth_service
                .authorization_user(token)
                .instrument(record.span.clone())
                .await?;
            let started = self
                .train_service
                .train_nlp(&auth, ModelType::NlpToken, &request.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(started))
        };

        record.result(response)
    }

    /// Train a text-classification NLP model
    #[oai(path = "/nlp-text", method = "post", operation_id = "train_nlp_text")]
    async fn train_nlp_text(
        &self,
        request: Json<TrainNlpRequest>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<TrainResponse>> {
        let record = recorded_http_api_request!("train_nlp_text", name = request.0.model_name);
        let response = {
            let auth = self
                .auth_service
                .authorization_user(token)
                .instrument(record.span.clone())
                .await?;
            let started = self
                .train_service
                .train_nlp(&auth, ModelType::NlpText, &request.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(started))
        };

        record.result(response)
    }

    /// Train an NLP model on LLM-generated data
    #[oai(path = "/nlp-datagen", method = "post", operation_id = "train_nlp_datagen")]
    async fn train_nlp_datagen(
        &self,
        request: Json<NlpDatagenRequest>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<TrainResponse>> {
        let record = recorded_http_api_request!("train_nlp_datagen", name = request.0.model_name);
        let response = {
            let auth = self
                .auth_service
                .authorization_user(token)
                .instrument(record.span.clone())
                .await?;
            let started = self
                .train_service
                .datagen(&auth, &request.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(started))
        };

        record.result(response)
    }

    /// Assemble an enterprise-search model from trained sub-models
    #[oai(
        path = "/enterprise-search",
        method = "post",
        operation_id = "create_enterprise_search"
    )]
    async fn create_enterprise_search(
        &self,
        request: Json<CreateCompositeRequest>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<TrainResponse>> {
        let record =
            recorded_http_api_request!("create_enterprise_search", name = request.0.model_name);
        let response = {
            let auth = self
                .auth_service
                .authorization_user(token)
                .instrument(record.span.clone())
                .await?;
            let created = self
                .train_service
                .create_composite(&auth, ModelType::EnterpriseSearch, &request.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(created))
        };

        record.result(response)
    }

    /// Assemble a knowledge-extraction model from trained sub-models
    #[oai(
        path = "/knowledge-extraction",
        method = "post",
        operation_id = "create_knowledge_extraction"
    )]
    async fn create_knowledge_extraction(
        &self,
        request: Json<CreateCompositeRequest>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<TrainResponse>> {
        let record =
            recorded_http_api_request!("create_knowledge_extraction", name = request.0.model_name);
        let response = {
            let auth = self
                .auth_service
                .authorization_user(token)
                .instrument(record.span.clone())
                .await?;
            let created = self
                .train_service
                .create_composite(&auth, ModelType::KnowledgeExtraction, &request.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(created))
        };

        record.result(response)
    }

    /// Stage training data files
    ///
    /// Streams each part into a fresh upload directory; later train requests
    /// reference it by upload id.
    #[oai(path = "/upload-data", method = "post", operation_id = "upload_data")]
    async fn upload_data(
        &self,
        payload: UploadDataPayload,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<UploadDataResponse>> {
        let record = recorded_http_api_request!("upload_data");
        let response = {
            let auth = self
                .auth_service
                .authorization_user(token)
                .instrument(record.span.clone())
                .await?;
            let upload = self
                .upload_service
                .create(&auth)
                .instrument(record.span.clone())
                .await?;

            for file in payload.files {
                let file_name = file
                    .file_name()
                    .map(|name| name.to_string())
                    .unwrap_or_else(|| "part".to_string());
                let stream = Box::pin(ReaderStream::new(file.into_async_read()));
                self.upload_service
                    .store_file(&upload.id, &file_name, stream)
                    .instrument(record.span.clone())
                    .await?;
            }

            Ok(Json(UploadDataResponse {
                upload_id: upload.id,
            }))
        };

        record.result(response)
    }

    /// Effective training status
    ///
    /// Rolled up over the model and its transitive dependencies.
    #[oai(path = "/:model_id/status", method = "get", operation_id = "train_status")]
    async fn status(
        &self,
        model_id: Path<ModelId>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<StatusResponse>> {
        let record = recorded_http_api_request!("train_status", model_id = model_id.0.to_string());
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
            let status = self
                .train_service
                .status(&model_id.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(status))
        };

        record.result(response)
    }

    /// Training logs
    ///
    /// Union of orchestrator stdout/stderr and worker-posted entries.
    #[oai(path = "/:model_id/logs", method = "get", operation_id = "train_logs")]
    async fn logs(
        &self,
        model_id: Path<ModelId>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<LogsResponse>> {
        let record = recorded_http_api_request!("train_logs", model_id = model_id.0.to_string());
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
            let logs = self
                .train_service
                .logs(&model_id.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(logs))
        };

        record.result(response)
    }

    /// Latest training report
    #[oai(path = "/:model_id/report", method = "get", operation_id = "train_report")]
    async fn report(
        &self,
        model_id: Path<ModelId>,
        token: PlatformSecurityScheme,
    ) -> ApiResult<Json<serde_json::Value>> {
        let record = recorded_http_api_request!("train_report", model_id = model_id.0.to_string());
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
            let report = self
                .train_service
                .report(&model_id.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(report))
        };

        record.result(response)
    }

    /// Worker callback: training status update
    #[oai(
        path = "/update-status",
        method = "post",
        operation_id = "train_update_status"
    )]
    async fn update_status(
        &self,
        request: Json<UpdateStatusRequest>,
        token: JobSecurityScheme,
    ) -> ApiResult<Json<Empty>> {
        let record = recorded_http_api_request!("train_update_status");
        let response = {
            let job = self
                .auth_service
                .authorize_job(&token.0, &[JobTokenRole::Train])
                .instrument(record.span.clone())
                .await?;
            self.train_service
                .update_status(&job, request.0.status)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(Empty {}))
        };

        record.result(response)
    }

    /// Worker callback: training log line
    #[oai(path = "/log", method = "post", operation_id = "train_log")]
    async fn log(
        &self,
        request: Json<WorkerLogRequest>,
        token: JobSecurityScheme,
    ) -> ApiResult<Json<Empty>> {
        let record = recorded_http_api_request!("train_log");
        let response = {
            let job = self
                .auth_service
                .authorize_job(&token.0, &[JobTokenRole::Train])
                .instrument(record.span.clone())
                .await?;
            self.train_service
                .append_log(&job, request.0.level, &request.0.message)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(Empty {}))
        };

        record.result(response)
    }
}
