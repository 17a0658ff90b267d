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

use include_dir::Dir;
use std::path::PathBuf;
use tempfile::TempDir;

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Failed to materialize embedded migrations: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database connection failed: {0}")]
    Connection(#[from] sqlx::Error),
    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// SQL migration directories, one subdirectory per database dialect.
pub trait Migrations {
    fn sqlite_migrations(&self) -> PathBuf;
    fn postgres_migrations(&self) -> PathBuf;
}

/// Migrations embedded into the binary with `include_dir`, materialized to a
/// temp directory so the sqlx migrator can walk them.
pub struct IncludedMigrationsDir {
    extracted: TempDir,
}

impl IncludedMigrationsDir {
    pub fn new(dir: &'static Dir<'static>) -> Result<Self, MigrationError> {
        let extracted = tempfile::tempdir()?;
        dir.extract(extracted.path())?;
        Ok(Self { extracted })
    }
}

impl Migrations for IncludedMigrationsDir {
    fn sqlite_migrations(&self) -> PathBuf {
        self.extracted.path().join("sqlite")
    }

    fn postgres_migrations(&self) -> PathBuf {
        self.extracted.path().join("postgres")
    }
}
