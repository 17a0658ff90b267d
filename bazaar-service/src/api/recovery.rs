use crate::api::{ApiResult, ApiTags};
use crate::auth::PlatformSecurityScheme;
use crate::model::Backup;
use crate::service::auth::AuthService;
use crate::service::backup::BackupService;
use bazaar_common::recorded_http_api_request;
use poem_openapi::payload::Json;
use poem_openapi::*;
use std::sync::Arc;
use tracing::Instrument;

pub struct RecoveryApi {
    pub auth_service: Arc<dyn AuthService>,
    pub backup_service: Arc<dyn BackupService>,
}

#[OpenApi(prefix_path = "/api/v2/recovery", tag = ApiTags::Recovery)]
impl RecoveryApi {
    /// Snapshot the platform state
    ///
    /// Dumps the relational state into the object store next to the
    /// artifacts it describes.
    #[oai(path = "/backup", method = "post", operation_id = "create_backup")]
    async fn create_backup(&self, token: PlatformSecurityScheme) -> ApiResult<Json<Backup>> {
        let record = recorded_http_api_request!("create_backup");
        let response = {
            let auth = self
                .auth_service
                .authorization_user(token)
                .instrument(record.span.clone())
                .await?;
            self.auth_service.ensure_admin(&auth)?;
            let backup = self
                .backup_service
                .create(&auth)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(backup))
        };

        record.result(response)
    }

    /// List backups
    #[oai(path = "/backups", method = "get", operation_id = "list_backups")]
    async fn list_backups(&self, token: PlatformSecurityScheme) -> ApiResult<Json<Vec<Backup>>> {
        let record = recorded_http_api_request!("list_backups");
        let response = {
            let auth = self
                .auth_service
                .authorization_user(token)
                .instrument(record.span.clone())
                .await?;
            self.auth_service.ensure_admin(&auth)?;
            let backups = self
                .backup_service
                .list()
                .instrument(record.span.clone())
                .await?;
            Ok(Json(backups))
        };

        record.result(response)
    }
}
