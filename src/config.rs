use std::path::PathBuf;
use std::time::Duration;

/// Port the control server listens on for worker connections.
pub const DEFAULT_CONTROL_PORT: u16 = 33380;

/// Location of the artifact store the control server publishes plugins and
/// input graphs into.
///
/// The worker reads it as a plain directory tree (usually a shared mount).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root of the store: `plugins/` and `inputs/` live below it.
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("monet_store"),
        }
    }
}

/// Timing of the control-plane connection.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Fixed delay between reconnection attempts.
    pub reconnect_interval: Duration,
    /// How long the connection may stay silent before a `Ping` is sent.
    pub idle_timeout: Duration,
    /// How long to wait for the `Pong` after a `Ping`.
    pub heartbeat_deadline: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(120),
            heartbeat_deadline: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub host: String,
    pub control_port: u16,
    /// Directory holding cached plugin artifacts and their manifests.
    pub cache_dir: PathBuf,
    /// Directory the JSON-lines measurement files are written to.
    pub measurement_dir: PathBuf,
    /// Ignore the plugin cache and always fetch from the control server.
    pub development_mode: bool,
    pub store: StoreConfig,
    pub session: SessionConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            control_port: DEFAULT_CONTROL_PORT,
            cache_dir: PathBuf::from("monet_cache"),
            measurement_dir: PathBuf::from("monet_measurements"),
            development_mode: false,
            store: StoreConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn new(host: impl Into<String>, control_port: u16) -> Self {
        Self {
            host: host.into(),
            control_port,
            ..Default::default()
        }
    }

    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    pub fn with_store_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.store.root = root.into();
        self
    }

    pub fn with_development_mode(mut self, enabled: bool) -> Self {
        self.development_mode = enabled;
        self
    }

    /// Address of the control server in `host:port` form.
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.host, self.control_port)
    }

    /// Directory plugins are installed into while a job uses them.
    pub fn install_dir(&self) -> PathBuf {
        self.cache_dir.join("installed")
    }
}
