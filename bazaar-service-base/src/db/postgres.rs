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

use crate::db::Pool;
use crate::migration::MigrationError;
use crate::repo::RepoError;
use bazaar_common::config::DbPostgresConfig;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolOptions, PgQueryResult, PgRow};
use sqlx::query::{Query, QueryAs};
use sqlx::{FromRow, Postgres, Transaction};
use std::path::Path;
use tracing::{error, info};

#[derive(Clone)]
pub struct PostgresPool {
    read_pool: sqlx::PgPool,
    write_pool: sqlx::PgPool,
}

impl PostgresPool {
    pub async fn configured(config: &DbPostgresConfig) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(connect_options(config))
            .await?;

        Ok(Self {
            read_pool: pool.clone(),
            write_pool: pool,
        })
    }

    pub fn with_ro(&self, svc_name: &'static str, api_name: &'static str) -> PostgresLabelledApi {
        PostgresLabelledApi {
            pool: self.read_pool.clone(),
            svc_name,
            api_name,
        }
    }

    pub fn with_rw(&self, svc_name: &'static str, api_name: &'static str) -> PostgresLabelledApi {
        PostgresLabelledApi {
            pool: self.write_pool.clone(),
            svc_name,
            api_name,
        }
    }
}

impl Pool for PostgresPool {}

fn connect_options(config: &DbPostgresConfig) -> PgConnectOptions {
    let options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .database(&config.database)
        .username(&config.username)
        .password(&config.password);

    match &config.schema {
        Some(schema) => options.options([("search_path", schema.as_str())]),
        None => options,
    }
}

pub async fn migrate(config: &DbPostgresConfig, migrations: &Path) -> Result<(), MigrationError> {
    info!(
        "Running Postgres migrations from {}",
        migrations.display()
    );
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect_with(connect_options(config))
        .await?;

    if let Some(schema) = &config.schema {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{schema}\""))
            .execute(&pool)
            .await?;
    }

    let migrator = Migrator::new(migrations.to_path_buf()).await?;
    migrator.run(&pool).await?;
    pool.close().await;
    Ok(())
}

pub struct PostgresLabelledApi {
    pool: sqlx::PgPool,
    svc_name: &'static str,
    api_name: &'static str,
}

impl PostgresLabelledApi {
    pub async fn execute(
        &self,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<PgQueryResult, RepoError> {
        self.record(query.execute(&self.pool).await)
    }

    pub async fn fetch_optional_as<T>(
        &self,
        query: QueryAs<'_, Postgres, T, PgArguments>,
    ) -> Result<Option<T>, RepoError>
    where
        T: Send + Unpin + for<'r> FromRow<'r, PgRow>,
    {
        self.record(query.fetch_optional(&self.pool).await)
    }

    pub async fn fetch_one_as<T>(
        &self,
        query: QueryAs<'_, Postgres, T, PgArguments>,
    ) -> Result<T, RepoError>
    where
        T: Send + Unpin + for<'r> FromRow<'r, PgRow>,
    {
        self.record(query.fetch_one(&self.pool).await)
    }

    pub async fn fetch_all_as<T>(
        &self,
        query: QueryAs<'_, Postgres, T, PgArguments>,
    ) -> Result<Vec<T>, RepoError>
    where
        T: Send + Unpin + for<'r> FromRow<'r, PgRow>,
    {
        self.record(query.fetch_all(&self.pool).await)
    }

    /// Starts a serializable transaction; concurrent mutations of the same
    /// rows are linearized by the database.
    pub async fn begin(&self) -> Result<PostgresTransaction, RepoError> {
        let mut tx = self.record(self.pool.begin().await)?;
        self.record(
            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *tx)
                .await,
        )?;
        Ok(PostgresTransaction {
            tx,
            svc_name: self.svc_name,
            api_name: self.api_name,
        })
    }

    fn record<R>(&self, result: Result<R, sqlx::Error>) -> Result<R, RepoError> {
        result.map_err(|err| {
            let repo_error: RepoError = err.into();
            if !repo_error.is_unique_violation() {
                error!(
                    svc = self.svc_name,
                    api = self.api_name,
                    "DB call failed: {repo_error}"
                );
            }
            repo_error
        })
    }
}

pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
    svc_name: &'static str,
    api_name: &'static str,
}

impl PostgresTransaction {
    pub async fn execute(
        &mut self,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<PgQueryResult, RepoError> {
        let result = query.execute(&mut *self.tx).await;
        self.record(result)
    }

    pub async fn fetch_optional_as<T>(
        &mut self,
        query: QueryAs<'_, Postgres, T, PgArguments>,
    ) -> Result<Option<T>, RepoError>
    where
        T: Send + Unpin + for<'r> FromRow<'r, PgRow>,
    {
        let result = query.fetch_optional(&mut *self.tx).await;
        self.record(result)
    }

    pub async fn fetch_all_as<T>(
        &mut self,
        query: QueryAs<'_, Postgres, T, PgArguments>,
    ) -> Result<Vec<T>, RepoError>
    where
        T: Send + Unpin + for<'r> FromRow<'r, PgRow>,
    {
        let result = query.fetch_all(&mut *self.tx).await;
        self.record(result)
    }

    pub async fn commit(self) -> Result<(), RepoError> {
        self.tx.commit().await.map_err(RepoError::from)
    }

    pub async fn rollback(self) -> Result<(), RepoError> {
        self.tx.rollback().await.map_err(RepoError::from)
    }

    fn record<R>(&self, result: Result<R, sqlx::Error>) -> Result<R, RepoError> {
        result.map_err(|err| {
            let repo_error: RepoError = err.into();
            if !repo_error.is_unique_violation() {
                error!(
                    svc = self.svc_name,
                    api = self.api_name,
                    "DB call failed: {repo_error}"
                );
            }
            repo_error
        })
    }
}
