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

pub mod api;
pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod identity;
pub mod license;
pub mod model;
pub mod orchestrator;
pub mod repo;
pub mod service;

use crate::api::Apis;
use crate::bootstrap::Services;
use crate::config::{AccountConfig, AccountsConfig, PlatformServiceConfig};
use crate::identity::{IdentityError, IdentityProvider};
use anyhow::{anyhow, Context};
use bazaar_common::config::DbConfig;
use bazaar_service_base::db;
use bazaar_service_base::migration::{IncludedMigrationsDir, Migrations};
use include_dir::{include_dir, Dir};
use poem::listener::{Acceptor, Listener};
use poem::middleware::Cors;
use poem::{EndpointExt, Route};
use poem_openapi::OpenApiService;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, Instrument};

#[cfg(test)]
test_r::enable!();

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub static DB_MIGRATIONS: Dir = include_dir!("$CARGO_MANIFEST_DIR/db/migration");

pub struct RunDetails {
    pub http_port: u16,
}

#[derive(Clone)]
pub struct PlatformService {
    config: PlatformServiceConfig,
    services: Services,
}

impl PlatformService {
    pub async fn new(config: PlatformServiceConfig) -> Result<Self, anyhow::Error> {
        debug!("Initializing platform service");

        let migrations = IncludedMigrationsDir::new(&DB_MIGRATIONS)
            .context("materializing DB migrations")?;

        match config.db.clone() {
            DbConfig::Postgres(c) => {
                db::postgres::migrate(&c, &migrations.postgres_migrations())
                    .await
                    .context("Postgres DB migration")?;
            }
            DbConfig::Sqlite(c) => {
                db::sqlite::migrate(&c, &migrations.sqlite_migrations())
                    .await
                    .context("SQLite DB migration")?;
            }
        };

        let services = Services::new(&config)
            .await
            .map_err(|err| anyhow!(err).context("Service initialization"))?;

        create_all_initial_accounts(&config.accounts, &services.identity).await?;

        Ok(Self { config, services })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub async fn run(
        &self,
        join_set: &mut JoinSet<Result<(), anyhow::Error>>,
    ) -> Result<RunDetails, anyhow::Error> {
        let http_port = self.start_http_server(join_set).await?;

        self.services
            .job_status_sync
            .start(self.config.job_sync.interval)
            .await;

        info!("Started platform service on http port {}", http_port);
        Ok(RunDetails { http_port })
    }

    pub async fn shutdown(&self) {
        self.services.job_status_sync.stop().await;
    }

    pub fn http_service(&self) -> OpenApiService<Apis, ()> {
        api::make_open_api_service(&self.services)
    }

    async fn start_http_server(
        &self,
        join_set: &mut JoinSet<Result<(), anyhow::Error>>,
    ) -> Result<u16, anyhow::Error> {
        let api_service = api::make_open_api_service(&self.services);

        let ui = api_service.swagger_ui();
        let spec = api_service.spec_endpoint_yaml();

        let cors = Cors::new().allow_origin_regex(&self.config.cors_origin_regex);

        let app = Route::new()
            .nest("/", api_service)
            .nest("/docs", ui)
            .nest("/specs", spec)
            .with(cors);

        let poem_listener =
            poem::listener::TcpListener::bind(format!("0.0.0.0:{}", self.config.http_port));
        let acceptor = poem_listener.into_acceptor().await?;
        let port = acceptor.local_addr()[0]
            .as_socket_addr()
            .map(|addr| addr.port())
            .ok_or_else(|| anyhow!("Failed to resolve HTTP listener address"))?;

        join_set.spawn(
            async move {
                poem::Server::new_with_acceptor(acceptor)
                    .run(app)
                    .await
                    .map_err(|e| e.into())
            }
            .in_current_span(),
        );

        Ok(port)
    }
}

async fn create_all_initial_accounts(
    accounts_config: &AccountsConfig,
    identity: &Arc<dyn IdentityProvider>,
) -> Result<(), anyhow::Error> {
    for account_config in accounts_config.accounts.values() {
        create_initial_account(account_config, identity).await?;
    }
    Ok(())
}

async fn create_initial_account(
    account_config: &AccountConfig,
    identity: &Arc<dyn IdentityProvider>,
) -> Result<(), anyhow::Error> {
    info!(
        "Ensuring initial account ({}, admin: {})",
        account_config.username, account_config.is_admin
    );

    let created = identity
        .create_user(
            &account_config.username,
            &account_config.email,
            Some(&account_config.password),
            account_config.is_admin,
        )
        .await;

    match created {
        Ok(_) => Ok(()),
        // already provisioned on an earlier boot
        Err(IdentityError::UsernameAlreadyInUse(_)) | Err(IdentityError::EmailAlreadyInUse(_)) => {
            Ok(())
        }
        Err(err) => Err(anyhow!(err).context("initial account creation")),
    }
}
