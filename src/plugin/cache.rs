use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::PluginDescriptor;
use super::descriptor::MANIFEST_SUFFIX;
use super::store::PluginArtifact;

/// Manifest written next to every cached artifact so the cache can be
/// rediscovered and used without asking the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CacheManifest {
    descriptor: PluginDescriptor,
    hash: String,
    #[serde(default)]
    dependencies: Vec<PluginDescriptor>,
}

/// A plugin artifact held in the local cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CacheEntry {
    pub descriptor: PluginDescriptor,
    pub path: PathBuf,
    /// Hex SHA-256 of the artifact at the time it was cached.
    pub hash: String,
    pub dependencies: Vec<PluginDescriptor>,
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub(crate) async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(sha256_hex(&bytes))
}

#[derive(Debug, Clone)]
pub(crate) struct PluginCache {
    dir: PathBuf,
}

impl PluginCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn artifact_path(&self, descriptor: &PluginDescriptor) -> PathBuf {
        self.dir.join(descriptor.artifact_file_name())
    }

    fn manifest_path(&self, descriptor: &PluginDescriptor) -> PathBuf {
        self.dir.join(descriptor.manifest_file_name())
    }

    /// Scans the cache directory for manifests whose artifact is present.
    pub async fn discover(&self) -> std::io::Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e),
        };

        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            let is_manifest = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(MANIFEST_SUFFIX));
            if !is_manifest {
                continue;
            }
            let manifest: CacheManifest = match tokio::fs::read(&path)
                .await
                .map_err(|e| e.to_string())
                .and_then(|raw| serde_json::from_slice(&raw).map_err(|e| e.to_string()))
            {
                Ok(manifest) => manifest,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable cache manifest");
                    continue;
                }
            };
            let artifact = self.artifact_path(&manifest.descriptor);
            if !tokio::fs::try_exists(&artifact).await.unwrap_or(false) {
                tracing::warn!(plugin = %manifest.descriptor, "Cache manifest without artifact, skipping");
                continue;
            }
            entries.push(CacheEntry {
                descriptor: manifest.descriptor,
                path: artifact,
                hash: manifest.hash,
                dependencies: manifest.dependencies,
            });
        }

        entries.sort_by(|a, b| a.descriptor.cmp(&b.descriptor));
        Ok(entries)
    }

    /// Writes a fetched artifact and its manifest into the cache.
    pub async fn store(
        &self,
        descriptor: &PluginDescriptor,
        artifact: &PluginArtifact,
    ) -> std::io::Result<CacheEntry> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.artifact_path(descriptor);
        tokio::fs::write(&path, &artifact.bytes).await?;
        make_executable(&path).await?;

        let manifest = CacheManifest {
            descriptor: descriptor.clone(),
            hash: sha256_hex(&artifact.bytes),
            dependencies: artifact.record.dependencies.clone(),
        };
        let json = serde_json::to_vec_pretty(&manifest).map_err(std::io::Error::other)?;
        tokio::fs::write(self.manifest_path(descriptor), json).await?;

        tracing::debug!(plugin = %descriptor, path = %path.display(), "Cached plugin artifact");
        Ok(CacheEntry {
            descriptor: manifest.descriptor,
            path,
            hash: manifest.hash,
            dependencies: manifest.dependencies,
        })
    }

    /// Deletes the artifact and its manifest. Missing files are not an error.
    pub async fn evict(&self, descriptor: &PluginDescriptor) -> std::io::Result<()> {
        for path in [self.artifact_path(descriptor), self.manifest_path(descriptor)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
pub(crate) async fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
pub(crate) async fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
