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

use crate::storage::{ByteStream, ObjectStore, StorageError};
use async_trait::async_trait;
use futures::StreamExt;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

const TMP_DIR: &str = ".tmp";

/// Object store over a local or shared filesystem root. Writes stream into a
/// scratch file under `.tmp` on the same filesystem and are renamed into
/// place, which is the atomicity contract on POSIX filesystems.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(root.join(TMP_DIR)).await?;
        Ok(Self { root })
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        let valid = !path.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, path: &str, mut data: ByteStream) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let scratch = self.root.join(TMP_DIR).join(Uuid::new_v4().to_string());
        let mut file = tokio::fs::File::create(&scratch).await?;
        while let Some(chunk) = data.next().await {
            file.write_all(&chunk?).await?;
        }
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&scratch, &target).await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<ByteStream, StorageError> {
        let target = self.resolve(path)?;
        match tokio::fs::File::open(&target).await {
            Ok(file) => Ok(Box::pin(ReaderStream::new(file))),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let target = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&target).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut results = Vec::new();
        let mut stack = vec![self.root.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let entry_path = entry.path();
                if dir == self.root && entry.file_name() == TMP_DIR {
                    continue;
                }
                if entry.file_type().await?.is_dir() {
                    stack.push(entry_path);
                } else {
                    let relative = entry_path
                        .strip_prefix(&self.root)
                        .map_err(|err| StorageError::Internal(err.to_string()))?;
                    let key = relative.to_string_lossy().replace('\\', "/");
                    if key.starts_with(prefix) {
                        results.push(key);
                    }
                }
            }
        }

        results.sort();
        Ok(results)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), StorageError> {
        let target = self.resolve(prefix)?;
        match tokio::fs::metadata(&target).await {
            Ok(meta) if meta.is_dir() => Ok(tokio::fs::remove_dir_all(&target).await?),
            Ok(_) => Ok(tokio::fs::remove_file(&target).await?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::storage::ObjectStore;

    #[test]
    async fn put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path()).await.unwrap();

        store
            .put_bytes("models/a/config.json", b"{}".to_vec())
            .await
            .unwrap();

        assert!(store.exists("models/a/config.json").await.unwrap());
        assert_eq!(store.get_bytes("models/a/config.json").await.unwrap(), b"{}");
    }

    #[test]
    async fn list_is_sorted_and_prefix_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path()).await.unwrap();

        store.put_bytes("models/b/2", vec![2]).await.unwrap();
        store.put_bytes("models/b/1", vec![1]).await.unwrap();
        store.put_bytes("uploads/x", vec![0]).await.unwrap();

        assert_eq!(
            store.list("models/b/").await.unwrap(),
            vec!["models/b/1".to_string(), "models/b/2".to_string()]
        );
    }

    #[test]
    async fn rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path()).await.unwrap();

        let result = store.put_bytes("../outside", vec![1]).await;
        assert!(matches!(result, Err(StorageError::InvalidPath(_))));
    }

    #[test]
    async fn missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path()).await.unwrap();

        let result = store.get_bytes("missing").await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }
}
