//! Access to the control plane's artifact store.
//!
//! The directory and the job runner only talk to the store through
//! [`ArtifactStore`], so tests and alternative transports can supply their
//! own backend. [`FsArtifactStore`] reads the store's on-disk layout:
//!
//! ```text
//! <root>/plugins/<name>#<version>/artifact
//! <root>/plugins/<name>#<version>/record.json   {"hash": "...", "dependencies": [...]}
//! <root>/inputs/<graph id>
//! ```

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::PluginDescriptor;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} is not in the artifact store")]
    NotFound(String),

    #[error("invalid artifact id '{0}'")]
    InvalidId(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("corrupt record {path}: {message}")]
    Corrupt { path: PathBuf, message: String },
}

/// What the control plane knows about a published plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRecord {
    /// Hex SHA-256 of the artifact. Compared case-insensitively.
    pub hash: String,
    /// Plugins that must be installed before this one.
    #[serde(default)]
    pub dependencies: Vec<PluginDescriptor>,
}

#[derive(Debug, Clone)]
pub struct PluginArtifact {
    pub record: PluginRecord,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Recorded metadata for a plugin, `None` if the store has no such plugin.
    async fn plugin_record(
        &self,
        descriptor: &PluginDescriptor,
    ) -> Result<Option<PluginRecord>, StoreError>;

    async fn fetch_plugin(&self, descriptor: &PluginDescriptor)
    -> Result<PluginArtifact, StoreError>;

    /// Raw bytes of an input graph.
    async fn fetch_input(&self, id: &str) -> Result<Vec<u8>, StoreError>;
}

/// Artifact store backed by a directory tree, typically a shared mount.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn plugin_dir(&self, descriptor: &PluginDescriptor) -> PathBuf {
        self.root.join("plugins").join(descriptor.to_string())
    }

    fn input_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(id);
        let valid = !id.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.root.join("inputs").join(relative))
    }

    async fn read_record(&self, descriptor: &PluginDescriptor) -> Result<Option<PluginRecord>, StoreError> {
        let path = self.plugin_dir(descriptor).join("record.json");
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(path, e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                path,
                message: e.to_string(),
            })
    }
}

fn io_error(path: PathBuf, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path,
        source: Arc::new(source),
    }
}

async fn read_existing(path: PathBuf, what: String) -> Result<Vec<u8>, StoreError> {
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(what)),
        Err(e) => Err(io_error(path, e)),
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn plugin_record(
        &self,
        descriptor: &PluginDescriptor,
    ) -> Result<Option<PluginRecord>, StoreError> {
        self.read_record(descriptor).await
    }

    async fn fetch_plugin(
        &self,
        descriptor: &PluginDescriptor,
    ) -> Result<PluginArtifact, StoreError> {
        let record = self
            .read_record(descriptor)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("plugin {descriptor}")))?;
        let bytes = read_existing(
            self.plugin_dir(descriptor).join("artifact"),
            format!("artifact of plugin {descriptor}"),
        )
        .await?;
        tracing::debug!(plugin = %descriptor, bytes = bytes.len(), "Fetched plugin from artifact store");
        Ok(PluginArtifact { record, bytes })
    }

    async fn fetch_input(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.input_path(id)?;
        read_existing(path, format!("input {id}")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish(root: &Path, descriptor: &str, record: &str, artifact: &[u8]) {
        let dir = root.join("plugins").join(descriptor);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("record.json"), record).unwrap();
        std::fs::write(dir.join("artifact"), artifact).unwrap();
    }

    #[tokio::test]
    async fn reads_published_plugin() {
        let dir = tempfile::tempdir().unwrap();
        publish(
            dir.path(),
            "tsp#1.0",
            r#"{"hash":"ABC","dependencies":["graphs#2.1"]}"#,
            b"#!/bin/sh\n",
        );
        let store = FsArtifactStore::new(dir.path());
        let descriptor = PluginDescriptor::parse("tsp#1.0").unwrap();

        let artifact = store.fetch_plugin(&descriptor).await.unwrap();
        assert_eq!(artifact.record.hash, "ABC");
        assert_eq!(
            artifact.record.dependencies,
            vec![PluginDescriptor::parse("graphs#2.1").unwrap()]
        );
        assert_eq!(artifact.bytes, b"#!/bin/sh\n");
    }

    #[tokio::test]
    async fn unknown_plugin_has_no_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let descriptor = PluginDescriptor::parse("tsp#1.0").unwrap();

        assert!(store.plugin_record(&descriptor).await.unwrap().is_none());
        assert!(matches!(
            store.fetch_plugin(&descriptor).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn corrupt_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        publish(dir.path(), "tsp#1.0", "not json", b"");
        let store = FsArtifactStore::new(dir.path());
        let descriptor = PluginDescriptor::parse("tsp#1.0").unwrap();

        assert!(matches!(
            store.plugin_record(&descriptor).await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn input_ids_stay_inside_the_store() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("inputs/set1")).unwrap();
        std::fs::write(dir.path().join("inputs/set1/g1"), "p edge 2 1").unwrap();
        let store = FsArtifactStore::new(dir.path());

        assert_eq!(store.fetch_input("set1/g1").await.unwrap(), b"p edge 2 1");
        assert!(matches!(
            store.fetch_input("../secret").await,
            Err(StoreError::InvalidId(_))
        ));
        assert!(matches!(
            store.fetch_input("/etc/passwd").await,
            Err(StoreError::InvalidId(_))
        ));
        assert!(matches!(
            store.fetch_input("missing").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
