//! Provider configuration files
//!
//! Provider options can be given in a TOML file and overridden from the
//! command line.
//!
//! # Config File Locations
//!
//! Searched in order:
//! 1. Path given via `--config`
//! 2. `./vecfuse.toml`
//! 3. `./.vecfuse.toml`
//! 4. `<user config dir>/vecfuse/provider.toml`
//!
//! # Example Config File
//!
//! ```toml
//! [provider]
//! # stackvm | llvm | avx2 | avx512 (default: llvm, which probes the host)
//! target = "avx2"
//! enable_per_node_parallel = true
//! allow_unaligned_buffers = false
//! ```
//!
//! The keys may also appear at the top level without the `[provider]` header.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct RootConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<ProviderConfig>,

    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    direct: Option<ProviderConfig>,
}

/// Provider settings as written in a config file; every field is optional
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    /// Code-generation target profile
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_per_node_parallel: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_unaligned_buffers: Option<bool>,
}

impl ProviderConfig {
    /// Load from a TOML file, sectioned or flat
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let root: RootConfig = toml::from_str(&contents).map_err(|e| ConfigError::ParseError(path.to_path_buf(), e))?;
        Ok(root.provider.or(root.direct).unwrap_or_default())
    }

    /// Load the first config file found in the standard locations
    pub fn find_and_load() -> Result<Option<Self>, ConfigError> {
        for candidate in Self::search_paths() {
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "loading provider config");
                return Self::load(&candidate).map(Some);
            }
        }
        Ok(None)
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("./vecfuse.toml"), PathBuf::from("./.vecfuse.toml")];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("vecfuse").join("provider.toml"));
        }
        paths
    }

    /// Write as a sectioned TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let root = RootConfig {
            provider: Some(self.clone()),
            direct: None,
        };
        let contents = toml::to_string_pretty(&root).map_err(ConfigError::SerializeError)?;
        std::fs::write(path.as_ref(), contents).map_err(|e| ConfigError::IoError(path.as_ref().to_path_buf(), e))
    }

    /// Combine with command-line values; the command line wins
    pub fn merge_with_cli(
        &self,
        target: Option<String>,
        enable_per_node_parallel: Option<bool>,
        allow_unaligned_buffers: Option<bool>,
    ) -> ProviderOptions {
        ProviderOptions {
            target: target.or_else(|| self.target.clone()),
            enable_per_node_parallel: enable_per_node_parallel.or(self.enable_per_node_parallel).unwrap_or(false),
            allow_unaligned_buffers: allow_unaligned_buffers.or(self.allow_unaligned_buffers).unwrap_or(false),
        }
    }
}

/// Resolved options for constructing an execution provider
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderOptions {
    /// Target profile; `None` selects `llvm`
    pub target: Option<String>,
    pub enable_per_node_parallel: bool,
    pub allow_unaligned_buffers: bool,
}

impl ProviderOptions {
    pub fn with_target(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            ..Default::default()
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    IoError(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file {0}: {1}")]
    ParseError(PathBuf, #[source] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[source] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_sectioned_config() {
        let file = write_config(
            r#"
            [provider]
            target = "avx512"
            enable_per_node_parallel = true
        "#,
        );
        let config = ProviderConfig::load(file.path()).unwrap();
        assert_eq!(config.target.as_deref(), Some("avx512"));
        assert_eq!(config.enable_per_node_parallel, Some(true));
        assert_eq!(config.allow_unaligned_buffers, None);
    }

    #[test]
    fn test_flat_config() {
        let file = write_config(
            r#"
            target = "stackvm"
            allow_unaligned_buffers = true
        "#,
        );
        let config = ProviderConfig::load(file.path()).unwrap();
        assert_eq!(config.target.as_deref(), Some("stackvm"));
        assert_eq!(config.allow_unaligned_buffers, Some(true));
    }

    #[test]
    fn test_other_sections_ignored() {
        let file = write_config(
            r#"
            [logging]
            level = "debug"

            [provider]
            target = "llvm"
        "#,
        );
        let config = ProviderConfig::load(file.path()).unwrap();
        assert_eq!(config.target.as_deref(), Some("llvm"));
    }

    #[test]
    fn test_invalid_type_is_parse_error() {
        let file = write_config(
            r#"
            [provider]
            enable_per_node_parallel = "yes"
        "#,
        );
        let err = ProviderConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(..)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProviderConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::IoError(..)));
    }

    #[test]
    fn test_save_and_load() {
        let original = ProviderConfig {
            target: Some("avx2".into()),
            enable_per_node_parallel: Some(false),
            allow_unaligned_buffers: Some(true),
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vecfuse.toml");
        original.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("[provider]"));
        assert_eq!(ProviderConfig::load(&path).unwrap(), original);
    }

    #[test]
    fn test_cli_overrides_file() {
        let config = ProviderConfig {
            target: Some("avx2".into()),
            enable_per_node_parallel: Some(true),
            allow_unaligned_buffers: None,
        };
        let options = config.merge_with_cli(Some("stackvm".into()), None, Some(true));
        assert_eq!(options.target.as_deref(), Some("stackvm"));
        assert!(options.enable_per_node_parallel);
        assert!(options.allow_unaligned_buffers);

        let defaults = ProviderConfig::default().merge_with_cli(None, None, None);
        assert_eq!(defaults, ProviderOptions::default());
    }
}
