use common::{Error, Result};
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// A resolved storage location: the store serving it plus the key prefix inside that store.
#[derive(Clone)]
pub struct StorageLocation {
    pub url: String,
    pub store: Arc<dyn ObjectStore>,
    pub prefix: Path,
}

impl std::fmt::Debug for StorageLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageLocation")
            .field("url", &self.url)
            .field("prefix", &self.prefix)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub extensions: Option<Vec<String>>,
}

impl ListOptions {
    pub fn with_extensions(extensions: &[&str]) -> Self {
        Self {
            extensions: Some(extensions.iter().map(|ext| ext.to_string()).collect()),
        }
    }

    fn matches(&self, key: &str) -> bool {
        match &self.extensions {
            Some(extensions) => extensions.iter().any(|ext| key.ends_with(ext.as_str())),
            None => true,
        }
    }
}

/// `s3a://` is what Hadoop-era configs use for the same buckets.
pub fn normalize_location(location: &str) -> String {
    match location.strip_prefix("s3a://") {
        Some(rest) => format!("s3://{}", rest),
        None => location.to_string(),
    }
}

impl StorageLocation {
    /// Lists every object beneath the prefix, recursively, sorted by key.
    pub async fn list_files(&self, options: &ListOptions) -> Result<Vec<ObjectMeta>> {
        let mut files: Vec<ObjectMeta> = self
            .store
            .list(Some(&self.prefix))
            .try_filter(|meta| futures::future::ready(options.matches(meta.location.as_ref())))
            .try_collect()
            .await?;

        files.sort_by(|a, b| a.location.as_ref().cmp(b.location.as_ref()));

        if files.is_empty() {
            info!(location = %self.url, "No files found");
        } else {
            debug!(location = %self.url, count = files.len(), "Listed files");
        }

        Ok(files)
    }

    pub async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let bytes = self.store.get(path).await?.bytes().await?;
        Ok(bytes.to_vec())
    }

    /// Deletes everything beneath the prefix and returns how many objects went.
    pub async fn purge(&self) -> Result<usize> {
        let files = self.list_files(&ListOptions::default()).await?;
        for meta in &files {
            self.store.delete(&meta.location).await?;
        }
        if !files.is_empty() {
            info!(location = %self.url, deleted = files.len(), "Purged existing objects");
        }
        Ok(files.len())
    }

    pub async fn put_json<T: Serialize>(&self, file_name: &str, value: &T) -> Result<Path> {
        if file_name.is_empty() || file_name.contains('/') {
            return Err(Error::InvalidInput(format!(
                "'{}' is not a plain file name",
                file_name
            )));
        }
        let path = self.prefix.child(file_name);
        let body = serde_json::to_vec_pretty(value)?;
        self.store.put(&path, body.into()).await?;
        Ok(path)
    }
}
