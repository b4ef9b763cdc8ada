//! Plugin directory: resolves algorithm and parser plugins by descriptor,
//! installs their dependencies, keeps a verified local cache and fetches
//! missing artifacts from the control plane's artifact store.
//!
//! A plugin is an executable. Activating it runs `<artifact> describe` to learn
//! which capabilities it offers; jobs then drive it through the process
//! protocol in [`process`].

mod cache;
pub mod descriptor;
mod directory;
pub mod process;
pub mod store;

use std::sync::Arc;

use thiserror::Error;

pub use descriptor::PluginDescriptor;
pub use directory::{PluginDirectory, PluginInstance};

/// Role a plugin can fill for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Algorithm,
    Parser,
}

impl Capability {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Algorithm => "algorithm",
            Self::Parser => "parser",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PluginError {
    /// Malformed descriptor, missing artifact, failed activation, dependency
    /// cycle or missing capability.
    #[error("plugin {descriptor} not found: {reason}")]
    NotFound { descriptor: String, reason: String },

    #[error("plugin {plugin} failed to start: {source}")]
    Spawn {
        plugin: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("plugin {plugin} violated the process protocol: {message}")]
    Protocol { plugin: String, message: String },

    #[error("plugin {plugin} exited with {status}")]
    Exit { plugin: String, status: String },

    #[error("plugin {plugin} I/O error: {source}")]
    Io {
        plugin: String,
        #[source]
        source: Arc<std::io::Error>,
    },
}

impl PluginError {
    pub fn not_found(descriptor: impl ToString, reason: impl Into<String>) -> Self {
        Self::NotFound {
            descriptor: descriptor.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(plugin: impl ToString, source: std::io::Error) -> Self {
        Self::Io {
            plugin: plugin.to_string(),
            source: Arc::new(source),
        }
    }
}

pub type PluginResult<T> = std::result::Result<T, PluginError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_wire_names() {
        assert_eq!(Capability::Algorithm.to_string(), "algorithm");
        let parsed: Vec<Capability> = serde_json::from_str(r#"["parser","algorithm"]"#).unwrap();
        assert_eq!(parsed, vec![Capability::Parser, Capability::Algorithm]);
    }

    #[test]
    fn not_found_message() {
        let err = PluginError::not_found("tsp#1.0", "no artifact in store");
        assert_eq!(err.to_string(), "plugin tsp#1.0 not found: no artifact in store");
    }
}
