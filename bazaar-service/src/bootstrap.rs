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

use crate::config::{
    BlobStorageConfig, IdentityConfig, OrchestratorConfig, PlatformServiceConfig,
};
use crate::identity::local::LocalIdentityProvider;
use crate::identity::sso::SsoIdentityProvider;
use crate::identity::IdentityProvider;
use crate::license::LicenseVerifier;
use crate::orchestrator::http::HttpOrchestratorClient;
use crate::orchestrator::in_process::InProcessOrchestrator;
use crate::orchestrator::OrchestratorClient;
use crate::repo;
use crate::service;
use crate::service::job_sync::JobStatusSync;
use crate::service::token::TokenService;
use bazaar_common::config::DbConfig;
use bazaar_service_base::db::postgres::PostgresPool;
use bazaar_service_base::db::sqlite::SqlitePool;
use bazaar_service_base::db::Pool;
use bazaar_service_base::storage::fs::FsObjectStore;
use bazaar_service_base::storage::memory::InMemoryObjectStore;
use bazaar_service_base::storage::ObjectStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct Services {
    pub auth_service: Arc<dyn service::auth::AuthService>,
    pub user_service: Arc<dyn service::user::UserService>,
    pub team_service: Arc<dyn service::team::TeamService>,
    pub model_service: Arc<dyn service::model::ModelService>,
    pub api_key_service: Arc<dyn service::api_key::ApiKeyService>,
    pub upload_service: Arc<dyn service::upload::UploadService>,
    pub model_upload_service: Arc<dyn service::model_upload::ModelUploadService>,
    pub train_service: Arc<dyn service::train::TrainService>,
    pub deploy_service: Arc<dyn service::deploy::DeployService>,
    pub backup_service: Arc<dyn service::backup::BackupService>,
    pub job_status_sync: Arc<JobStatusSync>,
    pub identity: Arc<dyn IdentityProvider>,
    pub orchestrator: Arc<dyn OrchestratorClient>,
    pub object_store: Arc<dyn ObjectStore>,
}

impl Services {
    pub async fn new(config: &PlatformServiceConfig) -> Result<Self, String> {
        let object_store: Arc<dyn ObjectStore> = match &config.storage {
            BlobStorageConfig::Local(local) => Arc::new(
                FsObjectStore::new(&local.root_path)
                    .await
                    .map_err(|err| err.to_string())?,
            ),
            BlobStorageConfig::InMemory(_) => Arc::new(InMemoryObjectStore::new()),
        };

        let orchestrator: Arc<dyn OrchestratorClient> = match &config.orchestrator {
            OrchestratorConfig::Http(http) => {
                Arc::new(HttpOrchestratorClient::new(http).map_err(|err| err.to_string())?)
            }
            OrchestratorConfig::InProcess(in_process) => {
                Arc::new(InProcessOrchestrator::new(&in_process.ingress_hostname))
            }
        };

        // fatal at boot on parse or signature failure
        let license = Arc::new(
            LicenseVerifier::load(&config.license, orchestrator.clone())
                .map_err(|err| format!("License verification failed: {err}"))?,
        );

        match config.db.clone() {
            DbConfig::Postgres(db_config) => {
                let db_pool = PostgresPool::configured(&db_config)
                    .await
                    .map_err(|err| err.to_string())?;
                Self::make_with_db(config, db_pool, object_store, orchestrator, license).await
            }
            DbConfig::Sqlite(db_config) => {
                let db_pool = SqlitePool::configured(&db_config)
                    .await
                    .map_err(|err| err.to_string())?;
                Self::make_with_db(config, db_pool, object_store, orchestrator, license).await
            }
        }
    }

    pub async fn make_with_db<DB>(
        config: &PlatformServiceConfig,
        db_pool: DB,
        object_store: Arc<dyn ObjectStore>,
        orchestrator: Arc<dyn OrchestratorClient>,
        license: Arc<LicenseVerifier>,
    ) -> Result<Self, String>
    where
        DB: Pool + Clone + Send + Sync + 'static,
        repo::user::DbUserRepo<DB>: repo::user::UserRepo,
        repo::team::DbTeamRepo<DB>: repo::team::TeamRepo,
        repo::model::DbModelRepo<DB>: repo::model::ModelRepo,
        repo::api_key::DbApiKeyRepo<DB>: repo::api_key::ApiKeyRepo,
        repo::upload::DbUploadRepo<DB>: repo::upload::UploadRepo,
        repo::model_upload::DbModelUploadRepo<DB>: repo::model_upload::ModelUploadRepo,
        repo::job_log::DbJobLogRepo<DB>: repo::job_log::JobLogRepo,
        repo::backup::DbBackupRepo<DB>: repo::backup::BackupRepo,
    {
        let user_repo: Arc<dyn repo::user::UserRepo> =
            Arc::new(repo::user::DbUserRepo::new(db_pool.clone()));
        let team_repo: Arc<dyn repo::team::TeamRepo> =
            Arc::new(repo::team::DbTeamRepo::new(db_pool.clone()));
        let model_repo: Arc<dyn repo::model::ModelRepo> =
            Arc::new(repo::model::DbModelRepo::new(db_pool.clone()));
        let api_key_repo: Arc<dyn repo::api_key::ApiKeyRepo> =
            Arc::new(repo::api_key::DbApiKeyRepo::new(db_pool.clone()));
        let upload_repo: Arc<dyn repo::upload::UploadRepo> =
            Arc::new(repo::upload::DbUploadRepo::new(db_pool.clone()));
        let model_upload_repo: Arc<dyn repo::model_upload::ModelUploadRepo> =
            Arc::new(repo::model_upload::DbModelUploadRepo::new(db_pool.clone()));
        let job_log_repo: Arc<dyn repo::job_log::JobLogRepo> =
            Arc::new(repo::job_log::DbJobLogRepo::new(db_pool.clone()));
        let backup_repo: Arc<dyn repo::backup::BackupRepo> =
            Arc::new(repo::backup::DbBackupRepo::new(db_pool.clone()));

        let token_service = Arc::new(TokenService::new(
            &config.jwt_secret,
            config.user_token_ttl,
        ));

        let identity: Arc<dyn IdentityProvider> = match &config.identity {
            IdentityConfig::Local(_) => Arc::new(LocalIdentityProvider::new(
                user_repo.clone(),
                token_service.clone(),
            )),
            IdentityConfig::Sso(sso) => Arc::new(
                SsoIdentityProvider::new(user_repo.clone(), sso)
                    .map_err(|err| err.to_string())?,
            ),
        };

        let auth_service: Arc<dyn service::auth::AuthService> =
            Arc::new(service::auth::AuthServiceDefault::new(
                identity.clone(),
                token_service.clone(),
                user_repo.clone(),
                team_repo.clone(),
                api_key_repo.clone(),
            ));

        let user_service: Arc<dyn service::user::UserService> =
            Arc::new(service::user::UserServiceDefault::new(
                identity.clone(),
                user_repo.clone(),
                model_repo.clone(),
            ));

        let team_service: Arc<dyn service::team::TeamService> =
            Arc::new(service::team::TeamServiceDefault::new(
                team_repo.clone(),
                user_repo.clone(),
                model_repo.clone(),
            ));

        let model_service: Arc<dyn service::model::ModelService> = Arc::new(
            service::model::ModelServiceDefault::new(model_repo.clone(), object_store.clone()),
        );

        let api_key_service: Arc<dyn service::api_key::ApiKeyService> = Arc::new(
            service::api_key::ApiKeyServiceDefault::new(api_key_repo.clone()),
        );

        let upload_service: Arc<dyn service::upload::UploadService> =
            Arc::new(service::upload::UploadServiceDefault::new(
                upload_repo.clone(),
                object_store.clone(),
            ));

        let model_upload_service: Arc<dyn service::model_upload::ModelUploadService> =
            Arc::new(service::model_upload::ModelUploadServiceDefault::new(
                model_repo.clone(),
                model_upload_repo.clone(),
                object_store.clone(),
                token_service.clone(),
            ));

        let storage_mount_source = match &config.storage {
            BlobStorageConfig::Local(local) => local.root_path.display().to_string(),
            BlobStorageConfig::InMemory(_) => "memory".to_string(),
        };

        let train_service: Arc<dyn service::train::TrainService> =
            Arc::new(service::train::TrainServiceDefault::new(
                model_repo.clone(),
                job_log_repo.clone(),
                model_service.clone(),
                upload_service.clone(),
                license.clone(),
                orchestrator.clone(),
                token_service.clone(),
                object_store.clone(),
                config.worker_images.clone(),
                storage_mount_source.clone(),
            ));

        let deploy_service: Arc<dyn service::deploy::DeployService> =
            Arc::new(service::deploy::DeployServiceDefault::new(
                model_repo.clone(),
                job_log_repo.clone(),
                model_service.clone(),
                license.clone(),
                orchestrator.clone(),
                token_service.clone(),
                object_store.clone(),
                config.worker_images.clone(),
                storage_mount_source,
            ));

        let backup_service: Arc<dyn service::backup::BackupService> =
            Arc::new(service::backup::BackupServiceDefault::new(
                user_repo.clone(),
                team_repo.clone(),
                model_repo.clone(),
                upload_repo.clone(),
                api_key_repo.clone(),
                job_log_repo.clone(),
                backup_repo.clone(),
                object_store.clone(),
            ));

        let job_status_sync = Arc::new(JobStatusSync::new(
            model_repo.clone(),
            job_log_repo.clone(),
            orchestrator.clone(),
            config.job_sync.grace,
        ));

        Ok(Self {
            auth_service,
            user_service,
            team_service,
            model_service,
            api_key_service,
            upload_service,
            model_upload_service,
            train_service,
            deploy_service,
            backup_service,
            job_status_sync,
            identity,
            orchestrator,
            object_store,
        })
    }
}
