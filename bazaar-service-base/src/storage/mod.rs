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

pub mod fs;
pub mod memory;

use async_trait::async_trait;
use bazaar_common::SafeDisplay;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;

pub type ByteStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Invalid object path: {0}")]
    InvalidPath(String),
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Internal(String),
}

impl SafeDisplay for StorageError {
    fn to_safe_string(&self) -> String {
        match self {
            StorageError::NotFound(_) => self.to_string(),
            StorageError::InvalidPath(_) => self.to_string(),
            StorageError::Io(_) => "Storage I/O error".to_string(),
            StorageError::Internal(_) => "Internal storage error".to_string(),
        }
    }
}

/// Hierarchical, path-addressed byte store. Paths are `/`-separated relative
/// keys; writes are atomic, so a concurrent reader observes either the
/// previous object or the complete new one, never a partial write.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, path: &str, data: ByteStream) -> Result<(), StorageError>;

    async fn get(&self, path: &str) -> Result<ByteStream, StorageError>;

    async fn exists(&self, path: &str) -> Result<bool, StorageError>;

    /// All object paths starting with `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    async fn delete_prefix(&self, prefix: &str) -> Result<(), StorageError>;

    async fn put_bytes(&self, path: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let bytes = Bytes::from(bytes);
        self.put(path, Box::pin(futures::stream::once(async move { Ok(bytes) })))
            .await
    }

    async fn get_bytes(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let mut stream = self.get(path).await?;
        let mut buffer = Vec::new();
        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer)
    }
}
