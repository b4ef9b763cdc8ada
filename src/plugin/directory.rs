use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::cache::{self, CacheEntry, PluginCache};
use super::store::{ArtifactStore, StoreError};
use super::{Capability, PluginDescriptor, PluginError, PluginResult, process};

/// An activated plugin, ready to be run by a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInstance {
    descriptor: PluginDescriptor,
    program: PathBuf,
    plugin_path: PathBuf,
    capabilities: Vec<Capability>,
}

impl PluginInstance {
    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    /// The installed executable.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Directory holding this plugin's installed dependencies.
    pub fn plugin_path(&self) -> &Path {
        &self.plugin_path
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn provides(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

#[derive(Debug, Clone)]
struct Installed {
    path: PathBuf,
    dependencies: Vec<PluginDescriptor>,
}

#[derive(Debug, Default)]
struct DirectoryState {
    cached: HashMap<PluginDescriptor, CacheEntry>,
    installed: HashMap<PluginDescriptor, Installed>,
    active: HashMap<PluginDescriptor, Arc<PluginInstance>>,
}

/// Resolves plugins for jobs, from the running set, the install directory, the
/// local cache or the artifact store, in that order.
pub struct PluginDirectory {
    store: Arc<dyn ArtifactStore>,
    cache: PluginCache,
    install_dir: PathBuf,
    development_mode: bool,
    state: Mutex<DirectoryState>,
}

impl std::fmt::Debug for PluginDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDirectory")
            .field("cache", &self.cache)
            .field("install_dir", &self.install_dir)
            .field("development_mode", &self.development_mode)
            .finish_non_exhaustive()
    }
}

impl PluginDirectory {
    /// Opens the directory and registers every artifact already in the cache.
    pub async fn open(
        cache_dir: impl Into<PathBuf>,
        install_dir: impl Into<PathBuf>,
        store: Arc<dyn ArtifactStore>,
        development_mode: bool,
    ) -> std::io::Result<Self> {
        let cache_dir = cache_dir.into();
        tokio::fs::create_dir_all(&cache_dir).await?;
        let cache = PluginCache::new(&cache_dir);

        let mut state = DirectoryState::default();
        for entry in cache.discover().await? {
            tracing::debug!(plugin = %entry.descriptor, "Found plugin in cache");
            state.cached.insert(entry.descriptor.clone(), entry);
        }
        tracing::info!(
            cache_dir = %cache_dir.display(),
            cached = state.cached.len(),
            development_mode,
            "Plugin directory opened"
        );

        Ok(Self {
            store,
            cache,
            install_dir: install_dir.into(),
            development_mode,
            state: Mutex::new(state),
        })
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    /// Descriptors currently held in the local cache.
    pub async fn cached(&self) -> Vec<PluginDescriptor> {
        let state = self.state.lock().await;
        let mut cached: Vec<_> = state.cached.keys().cloned().collect();
        cached.sort();
        cached
    }

    pub async fn installed(&self) -> Vec<PluginDescriptor> {
        let state = self.state.lock().await;
        let mut installed: Vec<_> = state.installed.keys().cloned().collect();
        installed.sort();
        installed
    }

    pub async fn active(&self) -> Vec<PluginDescriptor> {
        let state = self.state.lock().await;
        let mut active: Vec<_> = state.active.keys().cloned().collect();
        active.sort();
        active
    }

    /// Returns a running plugin offering `capability`, installing and
    /// activating it together with its dependencies if needed.
    pub async fn resolve(
        &self,
        descriptor: &str,
        capability: Capability,
    ) -> PluginResult<Arc<PluginInstance>> {
        let descriptor = PluginDescriptor::parse(descriptor)?;
        let mut state = self.state.lock().await;

        let running = state.active.get(&descriptor).cloned();
        let instance = match running {
            Some(instance) => {
                tracing::debug!(plugin = %descriptor, "Plugin already active");
                instance
            }
            None => {
                if !state.installed.contains_key(&descriptor) {
                    let order = self.install_order(&mut state, &descriptor).await?;
                    for plugin in &order {
                        self.install(&mut state, plugin).await?;
                    }
                } else {
                    tracing::debug!(plugin = %descriptor, "Plugin installed, activating");
                }
                self.activate(&mut state, &descriptor).await?
            }
        };

        if !instance.provides(capability) {
            return Err(PluginError::not_found(
                &descriptor,
                format!("plugin does not provide the {capability} capability"),
            ));
        }
        Ok(instance)
    }

    /// Post-order walk of the dependency graph rooted at `root`; every
    /// dependency comes before the plugins that need it.
    async fn install_order(
        &self,
        state: &mut DirectoryState,
        root: &PluginDescriptor,
    ) -> PluginResult<Vec<PluginDescriptor>> {
        let mut order = Vec::new();
        let mut done = HashSet::new();
        let mut on_path = HashSet::new();

        let deps = self.dependencies_of(state, root).await?;
        on_path.insert(root.clone());
        let mut stack = vec![(root.clone(), reversed(deps))];

        loop {
            let next = match stack.last_mut() {
                Some((_, remaining)) => remaining.pop(),
                None => break,
            };
            match next {
                Some(dep) => {
                    if done.contains(&dep) {
                        continue;
                    }
                    if on_path.contains(&dep) {
                        return Err(PluginError::not_found(
                            root,
                            format!("dependency cycle through {dep}"),
                        ));
                    }
                    let deps = self.dependencies_of(state, &dep).await?;
                    on_path.insert(dep.clone());
                    stack.push((dep, reversed(deps)));
                }
                None => {
                    if let Some((node, _)) = stack.pop() {
                        on_path.remove(&node);
                        done.insert(node.clone());
                        order.push(node);
                    }
                }
            }
        }
        Ok(order)
    }

    async fn dependencies_of(
        &self,
        state: &mut DirectoryState,
        descriptor: &PluginDescriptor,
    ) -> PluginResult<Vec<PluginDescriptor>> {
        if let Some(installed) = state.installed.get(descriptor) {
            return Ok(installed.dependencies.clone());
        }
        Ok(self.ensure_cached(state, descriptor).await?.dependencies)
    }

    /// Returns the cache entry for `descriptor`, fetching it from the store
    /// unless a cached copy may be used.
    async fn ensure_cached(
        &self,
        state: &mut DirectoryState,
        descriptor: &PluginDescriptor,
    ) -> PluginResult<CacheEntry> {
        if !self.development_mode {
            if let Some(entry) = state.cached.get(descriptor) {
                tracing::debug!(plugin = %descriptor, "Using cached plugin");
                return Ok(entry.clone());
            }
        }

        tracing::debug!(plugin = %descriptor, "Fetching plugin from artifact store");
        let artifact = self.store.fetch_plugin(descriptor).await.map_err(|e| match e {
            StoreError::NotFound(_) => {
                PluginError::not_found(descriptor, "not in the artifact store")
            }
            other => PluginError::not_found(descriptor, other.to_string()),
        })?;
        let entry = self
            .cache
            .store(descriptor, &artifact)
            .await
            .map_err(|e| PluginError::io(descriptor, e))?;
        state.cached.insert(descriptor.clone(), entry.clone());
        Ok(entry)
    }

    async fn install(
        &self,
        state: &mut DirectoryState,
        descriptor: &PluginDescriptor,
    ) -> PluginResult<()> {
        if state.installed.contains_key(descriptor) {
            return Ok(());
        }
        let entry = state.cached.get(descriptor).cloned().ok_or_else(|| {
            PluginError::not_found(descriptor, "supposed to be cached but missing from the cache")
        })?;
        if !tokio::fs::try_exists(&entry.path).await.unwrap_or(false) {
            return Err(PluginError::not_found(
                descriptor,
                format!("cached artifact {} disappeared", entry.path.display()),
            ));
        }

        let target = self.install_dir.join(descriptor.artifact_file_name());
        tokio::fs::create_dir_all(&self.install_dir)
            .await
            .map_err(|e| PluginError::io(descriptor, e))?;
        tokio::fs::copy(&entry.path, &target)
            .await
            .map_err(|e| PluginError::io(descriptor, e))?;
        cache::make_executable(&target)
            .await
            .map_err(|e| PluginError::io(descriptor, e))?;

        tracing::debug!(plugin = %descriptor, path = %target.display(), "Installed plugin");
        state.installed.insert(
            descriptor.clone(),
            Installed {
                path: target,
                dependencies: entry.dependencies,
            },
        );
        Ok(())
    }

    async fn activate(
        &self,
        state: &mut DirectoryState,
        descriptor: &PluginDescriptor,
    ) -> PluginResult<Arc<PluginInstance>> {
        let installed = state.installed.get(descriptor).cloned().ok_or_else(|| {
            PluginError::not_found(descriptor, "activated before it was installed")
        })?;
        let capabilities = process::describe(&installed.path, descriptor)
            .await
            .map_err(|e| PluginError::not_found(descriptor, format!("activation failed: {e}")))?;

        let instance = Arc::new(PluginInstance {
            descriptor: descriptor.clone(),
            program: installed.path,
            plugin_path: self.install_dir.clone(),
            capabilities,
        });
        tracing::debug!(plugin = %descriptor, capabilities = ?instance.capabilities, "Activated plugin");
        state.active.insert(descriptor.clone(), instance.clone());
        Ok(instance)
    }

    /// Deactivates and uninstalls every plugin. Failures are logged and the
    /// directory is left empty regardless.
    pub async fn reset_all(&self) {
        let mut state = self.state.lock().await;
        let active = state.active.len();
        state.active.clear();

        for (descriptor, installed) in state.installed.drain() {
            match tokio::fs::remove_file(&installed.path).await {
                Ok(()) => tracing::debug!(plugin = %descriptor, "Uninstalled plugin"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(plugin = %descriptor, error = %e, "Failed to uninstall plugin")
                }
            }
        }
        tracing::debug!(active, "All plugins stopped");
    }

    /// Re-hashes every cached artifact and evicts the ones whose hash no
    /// longer matches the artifact store's record. Returns the evicted
    /// descriptors.
    ///
    /// When the store cannot be asked, or has no record, the entry is kept.
    pub async fn validate_cache(&self) -> Vec<PluginDescriptor> {
        tracing::info!("Validating cached plugins");
        let mut state = self.state.lock().await;
        let mut entries: Vec<CacheEntry> = state.cached.values().cloned().collect();
        entries.sort_by(|a, b| a.descriptor.cmp(&b.descriptor));

        let mut evicted = Vec::new();
        for entry in entries {
            if self.cache_entry_is_stale(&entry).await {
                if let Err(e) = self.cache.evict(&entry.descriptor).await {
                    tracing::warn!(plugin = %entry.descriptor, error = %e, "Failed to delete cached plugin");
                }
                state.cached.remove(&entry.descriptor);
                tracing::info!(plugin = %entry.descriptor, "Removed invalid plugin from cache");
                evicted.push(entry.descriptor);
            }
        }

        tracing::info!(
            kept = state.cached.len(),
            evicted = evicted.len(),
            "Cache validated"
        );
        evicted
    }

    async fn cache_entry_is_stale(&self, entry: &CacheEntry) -> bool {
        let actual = match cache::sha256_file(&entry.path).await {
            Ok(hash) => hash,
            Err(e) => {
                tracing::warn!(plugin = %entry.descriptor, error = %e, "Cached plugin unreadable");
                return true;
            }
        };
        match self.store.plugin_record(&entry.descriptor).await {
            Ok(Some(record)) => !record.hash.eq_ignore_ascii_case(&actual),
            Ok(None) => {
                tracing::debug!(plugin = %entry.descriptor, "No store record for cached plugin, keeping it");
                false
            }
            Err(e) => {
                tracing::warn!(plugin = %entry.descriptor, error = %e, "Could not check cached plugin, keeping it");
                false
            }
        }
    }
}

fn reversed(mut deps: Vec<PluginDescriptor>) -> Vec<PluginDescriptor> {
    deps.reverse();
    deps
}
