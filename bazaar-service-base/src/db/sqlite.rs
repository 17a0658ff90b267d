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
use bazaar_common::config::DbSqliteConfig;
use sqlx::migrate::Migrator;
use sqlx::query::{Query, QueryAs};
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteQueryResult,
    SqliteRow,
};
use sqlx::{FromRow, Sqlite, Transaction};
use std::path::Path;
use tracing::{error, info};

/// SQLite pool pair: many readers, a single writer connection. WAL mode
/// keeps readers unblocked while the writer holds the file.
#[derive(Clone)]
pub struct SqlitePool {
    read_pool: sqlx::SqlitePool,
    write_pool: sqlx::SqlitePool,
}

impl SqlitePool {
    pub async fn configured(config: &DbSqliteConfig) -> Result<Self, sqlx::Error> {
        let options = connect_options(config);
        let write_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;
        let read_pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        Ok(Self {
            read_pool,
            write_pool,
        })
    }

    pub fn with_ro(&self, svc_name: &'static str, api_name: &'static str) -> SqliteLabelledApi {
        SqliteLabelledApi {
            pool: self.read_pool.clone(),
            svc_name,
            api_name,
        }
    }

    pub fn with_rw(&self, svc_name: &'static str, api_name: &'static str) -> SqliteLabelledApi {
        SqliteLabelledApi {
            pool: self.write_pool.clone(),
            svc_name,
            api_name,
        }
    }
}

impl Pool for SqlitePool {}

fn connect_options(config: &DbSqliteConfig) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(&config.database)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
}

pub async fn migrate(config: &DbSqliteConfig, migrations: &Path) -> Result<(), MigrationError> {
    info!("Running SQLite migrations from {}", migrations.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(connect_options(config))
        .await?;

    let migrator = Migrator::new(migrations.to_path_buf()).await?;
    migrator.run(&pool).await?;
    pool.close().await;
    Ok(())
}

pub struct SqliteLabelledApi {
    pool: sqlx::SqlitePool,
    svc_name: &'static str,
    api_name: &'static str,
}

impl SqliteLabelledApi {
    pub async fn execute<'a>(
        &self,
        query: Query<'a, Sqlite, SqliteArguments<'a>>,
    ) -> Result<SqliteQueryResult, RepoError> {
        self.record(query.execute(&self.pool).await)
    }

    pub async fn fetch_optional_as<'a, T>(
        &self,
        query: QueryAs<'a, Sqlite, T, SqliteArguments<'a>>,
    ) -> Result<Option<T>, RepoError>
    where
        T: Send + Unpin + for<'r> FromRow<'r, SqliteRow>,
    {
        self.record(query.fetch_optional(&self.pool).await)
    }

    pub async fn fetch_one_as<'a, T>(
        &self,
        query: QueryAs<'a, Sqlite, T, SqliteArguments<'a>>,
    ) -> Result<T, RepoError>
    where
        T: Send + Unpin + for<'r> FromRow<'r, SqliteRow>,
    {
        self.record(query.fetch_one(&self.pool).await)
    }

    pub async fn fetch_all_as<'a, T>(
        &self,
        query: QueryAs<'a, Sqlite, T, SqliteArguments<'a>>,
    ) -> Result<Vec<T>, RepoError>
    where
        T: Send + Unpin + for<'r> FromRow<'r, SqliteRow>,
    {
        self.record(query.fetch_all(&self.pool).await)
    }

    /// SQLite is serialized by the single writer connection; no isolation
    /// statement needed.
    pub async fn begin(&self) -> Result<SqliteTransaction, RepoError> {
        let tx = self.record(self.pool.begin().await)?;
        Ok(SqliteTransaction {
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

pub struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
    svc_name: &'static str,
    api_name: &'static str,
}

impl SqliteTransaction {
    pub async fn execute<'a>(
        &mut self,
        query: Query<'a, Sqlite, SqliteArguments<'a>>,
    ) -> Result<SqliteQueryResult, RepoError> {
        let result = query.execute(&mut *self.tx).await;
        self.record(result)
    }

    pub async fn fetch_optional_as<'a, T>(
        &mut self,
        query: QueryAs<'a, Sqlite, T, SqliteArguments<'a>>,
    ) -> Result<Option<T>, RepoError>
    where
        T: Send + Unpin + for<'r> FromRow<'r, SqliteRow>,
    {
        let result = query.fetch_optional(&mut *self.tx).await;
        self.record(result)
    }

    pub async fn fetch_all_as<'a, T>(
        &mut self,
        query: QueryAs<'a, Sqlite, T, SqliteArguments<'a>>,
    ) -> Result<Vec<T>, RepoError>
    where
        T: Send + Unpin + for<'r> FromRow<'r, SqliteRow>,
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
