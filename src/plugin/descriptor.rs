use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{PluginError, PluginResult};

static NAME_FORMAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-_A-Za-z0-9]+$").unwrap());

static VERSION_FORMAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(\.\d+)*([-.]\w+)?$").unwrap());

/// Ends every cache manifest file name. Artifact names hold a single `#`,
/// so they never end with it.
pub const MANIFEST_SUFFIX: &str = "#manifest.json";

/// Identifies a plugin as `name#version`.
///
/// Equality and hashing use both parts, so `tsp#1.0` and `tsp#1.1` are
/// distinct plugins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PluginDescriptor {
    name: String,
    version: String,
}

impl PluginDescriptor {
    /// Parses `name#version`, splitting at the last `#`.
    pub fn parse(descriptor: &str) -> PluginResult<Self> {
        let (name, version) = descriptor
            .rsplit_once('#')
            .ok_or_else(|| PluginError::not_found(descriptor, "descriptor has no '#'"))?;
        Self::new(name, version).map_err(|_| PluginError::not_found(descriptor, "malformed descriptor"))
    }

    pub fn new(name: &str, version: &str) -> PluginResult<Self> {
        if !NAME_FORMAT.is_match(name) {
            return Err(PluginError::not_found(
                format!("{name}#{version}"),
                format!("invalid plugin name '{name}'"),
            ));
        }
        if !VERSION_FORMAT.is_match(version) {
            return Err(PluginError::not_found(
                format!("{name}#{version}"),
                format!("invalid plugin version '{version}'"),
            ));
        }
        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
        })
    }

    pub fn is_valid(descriptor: &str) -> bool {
        Self::parse(descriptor).is_ok()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// File name used for the artifact in the local cache and the install
    /// directory. Neither part may contain `#`, so distinct descriptors never
    /// share a file.
    pub fn artifact_file_name(&self) -> String {
        self.to_string()
    }

    /// File name of the cache manifest stored next to the artifact.
    pub fn manifest_file_name(&self) -> String {
        format!("{}{MANIFEST_SUFFIX}", self.artifact_file_name())
    }
}

impl std::fmt::Display for PluginDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.name, self.version)
    }
}

impl FromStr for PluginDescriptor {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PluginDescriptor {
    type Error = PluginError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PluginDescriptor> for String {
    fn from(descriptor: PluginDescriptor) -> Self {
        descriptor.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_and_version() {
        let d = PluginDescriptor::parse("tsp-solver#1.2.0").unwrap();
        assert_eq!(d.name(), "tsp-solver");
        assert_eq!(d.version(), "1.2.0");
        assert_eq!(d.to_string(), "tsp-solver#1.2.0");
        assert_eq!(d.artifact_file_name(), "tsp-solver#1.2.0");
        assert_eq!(d.manifest_file_name(), "tsp-solver#1.2.0#manifest.json");
    }

    #[test]
    fn file_names_are_distinct_per_descriptor() {
        let descriptors = ["a-1#0", "a#1-0", "a#1.json", "a#1", "a_#1-_0"]
            .map(|d| PluginDescriptor::parse(d).unwrap());
        let mut names = std::collections::HashSet::new();
        for d in &descriptors {
            assert!(names.insert(d.artifact_file_name()), "{d}");
            assert!(names.insert(d.manifest_file_name()), "{d}");
            assert!(!d.artifact_file_name().ends_with(MANIFEST_SUFFIX));
        }
    }

    #[test]
    fn version_qualifiers() {
        assert!(PluginDescriptor::is_valid("nsga2#2.0-SNAPSHOT"));
        assert!(PluginDescriptor::is_valid("nsga2#2.0.1.rc1"));
        assert!(PluginDescriptor::is_valid("nsga_2#3"));
    }

    #[test]
    fn rejects_malformed() {
        for bad in ["", "tsp", "tsp#", "#1.0", "t s p#1.0", "tsp#one", "tsp#1..0", "tsp#1.0#2"] {
            assert!(!PluginDescriptor::is_valid(bad), "{bad} should be invalid");
        }
    }

    #[test]
    fn malformed_descriptor_is_not_found() {
        let err = PluginDescriptor::parse("tsp").unwrap_err();
        assert!(matches!(err, PluginError::NotFound { .. }));
    }

    #[test]
    fn equality_uses_name_and_version() {
        let a = PluginDescriptor::parse("tsp#1.0").unwrap();
        let b: PluginDescriptor = "tsp#1.0".parse().unwrap();
        let c = PluginDescriptor::parse("tsp#1.1").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn serde_as_string() {
        let d = PluginDescriptor::parse("dimacs#2.0").unwrap();
        assert_eq!(serde_json::to_string(&d).unwrap(), "\"dimacs#2.0\"");
        assert!(serde_json::from_str::<PluginDescriptor>("\"dimacs\"").is_err());
    }
}
