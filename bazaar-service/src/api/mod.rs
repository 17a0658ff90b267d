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

use crate::bootstrap::Services;
use crate::identity::IdentityError;
use crate::license::LicenseError;
use crate::service::api_key::ApiKeyError;
use crate::service::auth::AuthServiceError;
use crate::service::backup::BackupError;
use crate::service::deploy::DeployError;
use crate::service::model::ModelError;
use crate::service::model_upload::ModelUploadError;
use crate::service::team::TeamError;
use crate::service::train::TrainError;
use crate::service::upload::UploadError;
use crate::service::user::UserError;
use bazaar_common::metrics::api::TraceErrorKind;
use bazaar_common::model::error::{ErrorBody, ErrorsBody};
use bazaar_common::SafeDisplay;
use poem_openapi::payload::Json;
use poem_openapi::{ApiResponse, OpenApiService, Tags};

mod deploy;
mod healthcheck;
mod model;
mod recovery;
mod team;
mod train;
mod user;

#[derive(Tags)]
pub enum ApiTags {
    User,
    Team,
    Model,
    Train,
    Deploy,
    Recovery,
    HealthCheck,
}

#[derive(ApiResponse, Debug, Clone)]
pub enum ApiError {
    /// Invalid request, returning with a list of issues detected in the request
    #[oai(status = 400)]
    BadRequest(Json<ErrorsBody>),
    /// Unauthorized request
    #[oai(status = 401)]
    Unauthorized(Json<ErrorBody>),
    /// Forbidden Request
    #[oai(status = 403)]
    Forbidden(Json<ErrorBody>),
    /// Entity not found
    #[oai(status = 404)]
    NotFound(Json<ErrorBody>),
    #[oai(status = 409)]
    Conflict(Json<ErrorBody>),
    /// Request understood but not processable (e.g. duplicate names)
    #[oai(status = 422)]
    Unprocessable(Json<ErrorBody>),
    /// Internal server error
    #[oai(status = 500)]
    InternalError(Json<ErrorBody>),
}

impl ApiError {
    pub fn bad_request(error: impl SafeDisplay) -> Self {
        ApiError::BadRequest(Json(ErrorsBody {
            errors: vec![error.to_safe_string()],
        }))
    }

    pub fn unauthorized(error: impl SafeDisplay) -> Self {
        ApiError::Unauthorized(Json(ErrorBody {
            error: error.to_safe_string(),
        }))
    }

    pub fn forbidden(error: impl SafeDisplay) -> Self {
        ApiError::Forbidden(Json(ErrorBody {
            error: error.to_safe_string(),
        }))
    }

    pub fn not_found(error: impl SafeDisplay) -> Self {
        ApiError::NotFound(Json(ErrorBody {
            error: error.to_safe_string(),
        }))
    }

    pub fn conflict(error: impl SafeDisplay) -> Self {
        ApiError::Conflict(Json(ErrorBody {
            error: error.to_safe_string(),
        }))
    }

    pub fn unprocessable(error: impl SafeDisplay) -> Self {
        ApiError::Unprocessable(Json(ErrorBody {
            error: error.to_safe_string(),
        }))
    }

    pub fn internal(error: impl SafeDisplay) -> Self {
        ApiError::InternalError(Json(ErrorBody {
            error: error.to_safe_string(),
        }))
    }
}

impl TraceErrorKind for ApiError {
    fn trace_error_kind(&self) -> &'static str {
        match &self {
            ApiError::BadRequest(_) => "BadRequest",
            ApiError::Unauthorized(_) => "Unauthorized",
            ApiError::Forbidden(_) => "Forbidden",
            ApiError::NotFound(_) => "NotFound",
            ApiError::Conflict(_) => "Conflict",
            ApiError::Unprocessable(_) => "Unprocessable",
            ApiError::InternalError(_) => "InternalError",
        }
    }

    fn is_expected(&self) -> bool {
        !matches!(self, ApiError::InternalError(_))
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<AuthServiceError> for ApiError {
    fn from(value: AuthServiceError) -> Self {
        match &value {
            AuthServiceError::InvalidApiKey => Self::unauthorized(value),
            AuthServiceError::ApiKeyExpired => Self::forbidden(value),
            AuthServiceError::ApiKeyModelMismatch(_) => Self::forbidden(value),
            AuthServiceError::ApiKeyNotAllowed(_) => Self::forbidden(value),
            AuthServiceError::PermissionDenied(_) => Self::forbidden(value),
            AuthServiceError::Identity(identity) => match identity {
                IdentityError::InvalidToken(_)
                | IdentityError::TokenExpired
                | IdentityError::InvalidCredentials
                | IdentityError::UserNotFoundWithEmail(_) => Self::unauthorized(value),
                IdentityError::UsernameAlreadyInUse(_) | IdentityError::EmailAlreadyInUse(_) => {
                    Self::unprocessable(value)
                }
                IdentityError::NotSupported => Self::conflict(value),
                IdentityError::Unavailable(_)
                | IdentityError::InternalRepoError(_)
                | IdentityError::Internal(_) => Self::internal(value),
            },
            AuthServiceError::InternalRepoError(_) => Self::internal(value),
        }
    }
}

impl From<UserError> for ApiError {
    fn from(value: UserError) -> Self {
        match &value {
            UserError::NotFound(_) => Self::not_found(value),
            UserError::SignupDisabled => Self::conflict(value),
            UserError::Identity(identity) => match identity {
                IdentityError::InvalidToken(_)
                | IdentityError::TokenExpired
                | IdentityError::InvalidCredentials
                | IdentityError::UserNotFoundWithEmail(_) => Self::unauthorized(value),
                IdentityError::UsernameAlreadyInUse(_) | IdentityError::EmailAlreadyInUse(_) => {
                    Self::unprocessable(value)
                }
                IdentityError::NotSupported => Self::conflict(value),
                IdentityError::Unavailable(_)
                | IdentityError::InternalRepoError(_)
                | IdentityError::Internal(_) => Self::internal(value),
            },
            UserError::InternalRepoError(_) => Self::internal(value),
        }
    }
}

impl From<TeamError> for ApiError {
    fn from(value: TeamError) -> Self {
        match &value {
            TeamError::NotFound(_)
            | TeamError::UserNotFound(_)
            | TeamError::ModelNotFound(_)
            | TeamError::NotAMember(_, _)
            | TeamError::ModelNotAttached(_, _) => Self::not_found(value),
            TeamError::DuplicateName(_) => Self::unprocessable(value),
            TeamError::InternalRepoError(_) => Self::internal(value),
        }
    }
}

impl From<ModelError> for ApiError {
    fn from(value: ModelError) -> Self {
        match &value {
            ModelError::NotFound(_) | ModelError::ArtifactMissing(_) => Self::not_found(value),
            ModelError::DependencyInUse(_, _) => Self::conflict(value),
            ModelError::InvalidInput(_) => Self::bad_request(value),
            ModelError::Storage(_) | ModelError::InternalRepoError(_) => Self::internal(value),
        }
    }
}

impl From<ApiKeyError> for ApiError {
    fn from(value: ApiKeyError) -> Self {
        match &value {
            ApiKeyError::NotFound(_) => Self::not_found(value),
            ApiKeyError::InvalidInput(_) => Self::bad_request(value),
            ApiKeyError::NotCreator => Self::forbidden(value),
            ApiKeyError::InternalRepoError(_) => Self::internal(value),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(value: UploadError) -> Self {
        match &value {
            UploadError::NotFound(_) => Self::not_found(value),
            UploadError::NotOwned(_) => Self::forbidden(value),
            UploadError::InvalidInput(_) => Self::bad_request(value),
            UploadError::Storage(_) | UploadError::InternalRepoError(_) => Self::internal(value),
        }
    }
}

impl From<ModelUploadError> for ApiError {
    fn from(value: ModelUploadError) -> Self {
        match &value {
            ModelUploadError::DuplicateName(_) => Self::unprocessable(value),
            ModelUploadError::SessionNotFound(_) => Self::not_found(value),
            ModelUploadError::ChunkOutOfOrder { .. }
            | ModelUploadError::ChecksumMismatch { .. }
            | ModelUploadError::NoChunks
            | ModelUploadError::InvalidInput(_) => Self::bad_request(value),
            ModelUploadError::AlreadyCommitted => Self::conflict(value),
            ModelUploadError::Storage(_) | ModelUploadError::InternalRepoError(_) => {
                Self::internal(value)
            }
        }
    }
}

impl From<TrainError> for ApiError {
    fn from(value: TrainError) -> Self {
        match &value {
            TrainError::ModelNotFound(_) | TrainError::ReportNotFound(_) => Self::not_found(value),
            TrainError::DuplicateName(_)
            | TrainError::ParentMissing(_)
            | TrainError::DependencyMissing(_) => Self::unprocessable(value),
            TrainError::ParentNotComplete(_) => Self::conflict(value),
            TrainError::InvalidInput(_) => Self::bad_request(value),
            TrainError::Upload(upload) => match upload {
                UploadError::NotOwned(_) => Self::forbidden(value),
                UploadError::NotFound(_) => Self::not_found(value),
                UploadError::InvalidInput(_) => Self::bad_request(value),
                _ => Self::internal(value),
            },
            TrainError::License(license) => match license {
                LicenseError::Expired | LicenseError::CpuExceeded { .. } => Self::forbidden(value),
                _ => Self::internal(value),
            },
            TrainError::Orchestrator(_)
            | TrainError::Storage(_)
            | TrainError::InternalRepoError(_)
            | TrainError::Internal(_) => Self::internal(value),
            TrainError::Model(model) => match model {
                ModelError::NotFound(_) => Self::not_found(value),
                ModelError::InvalidInput(_) => Self::bad_request(value),
                _ => Self::internal(value),
            },
        }
    }
}

impl From<DeployError> for ApiError {
    fn from(value: DeployError) -> Self {
        match &value {
            DeployError::ModelNotFound(_) => Self::not_found(value),
            DeployError::InvalidState(_)
            | DeployError::DependencyNotComplete(_)
            | DeployError::DependencyInUse(_, _) => Self::conflict(value),
            DeployError::License(license) => match license {
                LicenseError::Expired | LicenseError::CpuExceeded { .. } => Self::forbidden(value),
                _ => Self::internal(value),
            },
            DeployError::Orchestrator(_)
            | DeployError::Storage(_)
            | DeployError::InternalRepoError(_)
            | DeployError::Internal(_) => Self::internal(value),
            DeployError::Model(model) => match model {
                ModelError::NotFound(_) => Self::not_found(value),
                _ => Self::internal(value),
            },
        }
    }
}

impl From<BackupError> for ApiError {
    fn from(value: BackupError) -> Self {
        Self::internal(value)
    }
}

pub type Apis = (
    user::UserApi,
    team::TeamApi,
    model::ModelApi,
    train::TrainApi,
    deploy::DeployApi,
    recovery::RecoveryApi,
    healthcheck::HealthcheckApi,
);

pub fn make_open_api_service(services: &Services) -> OpenApiService<Apis, ()> {
    OpenApiService::new(
        (
            user::UserApi {
                auth_service: services.auth_service.clone(),
                user_service: services.user_service.clone(),
            },
            team::TeamApi {
                auth_service: services.auth_service.clone(),
                team_service: services.team_service.clone(),
                model_service: services.model_service.clone(),
            },
            model::ModelApi {
                auth_service: services.auth_service.clone(),
                model_service: services.model_service.clone(),
                model_upload_service: services.model_upload_service.clone(),
                api_key_service: services.api_key_service.clone(),
            },
            train::TrainApi {
                auth_service: services.auth_service.clone(),
                model_service: services.model_service.clone(),
                train_service: services.train_service.clone(),
                upload_service: services.upload_service.clone(),
            },
            deploy::DeployApi {
                auth_service: services.auth_service.clone(),
                model_service: services.model_service.clone(),
                deploy_service: services.deploy_service.clone(),
            },
            recovery::RecoveryApi {
                auth_service: services.auth_service.clone(),
                backup_service: services.backup_service.clone(),
            },
            healthcheck::HealthcheckApi,
        ),
        "Model Bazaar API",
        crate::VERSION,
    )
}
