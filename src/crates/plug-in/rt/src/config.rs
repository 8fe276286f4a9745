use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest tile edge accepted in the configuration
pub const MAX_TILE_SIZE: u32 = 1024;

/// Upper bound on bytes per pixel of any drawable
pub const MAX_BPP: usize = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Whether plug-ins should print a stack trace when they crash
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackTraceMode {
    #[default]
    Never,
    Query,
    Always,
}

impl StackTraceMode {
    pub fn as_arg(self) -> &'static str {
        match self {
            StackTraceMode::Never => "never",
            StackTraceMode::Query => "query",
            StackTraceMode::Always => "always",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterpreterConfig {
    /// Program that runs scripts of this kind
    pub program: PathBuf,

    /// Extra argument placed between the interpreter and the script
    #[serde(default)]
    pub arg: Option<String>,

    /// File extensions handled by this interpreter, without the dot
    #[serde(default)]
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EnvironmentConfig {
    /// Start from the host's own environment
    pub inherit: bool,

    /// Variables added or overridden for every plug-in
    pub set: BTreeMap<String, String>,

    /// Variables removed from the inherited environment
    pub unset: Vec<String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            inherit: true,
            set: BTreeMap::new(),
            unset: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HostConfig {
    /// Directories searched for plug-in executables
    pub plug_in_path: Vec<PathBuf>,

    pub tile_width: u32,
    pub tile_height: u32,

    /// Try to move tile pixels through shared memory
    pub use_shm: bool,

    /// Time a plug-in gets to exit after a quit request before it is killed
    #[serde(with = "humantime_serde")]
    pub quit_grace: Duration,

    pub stack_trace_mode: StackTraceMode,

    pub interpreters: Vec<InterpreterConfig>,

    pub environment: EnvironmentConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            plug_in_path: Vec::new(),
            tile_width: 64,
            tile_height: 64,
            use_shm: true,
            quit_grace: Duration::from_millis(10),
            stack_trace_mode: StackTraceMode::Never,
            interpreters: Vec::new(),
            environment: EnvironmentConfig::default(),
        }
    }
}

impl HostConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: HostConfig =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("tile_width", self.tile_width),
            ("tile_height", self.tile_height),
        ] {
            if value == 0 || value > MAX_TILE_SIZE {
                return Err(ConfigError::Invalid(format!(
                    "{} must be between 1 and {}, got {}",
                    name, MAX_TILE_SIZE, value
                )));
            }
        }

        for interp in &self.interpreters {
            if interp.program.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(
                    "interpreter program must not be empty".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Size of the bulk tile channel: one tile at the largest pixel size
    pub fn tile_buffer_size(&self) -> usize {
        self.tile_width as usize * self.tile_height as usize * MAX_BPP
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.tile_width, 64);
        assert_eq!(config.quit_grace, Duration::from_millis(10));
        assert_eq!(config.tile_buffer_size(), 64 * 64 * 16);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "plug_in_path: [/usr/lib/host/plug-ins]\n\
             use_shm: false\n\
             quit_grace: 250ms\n\
             stack_trace_mode: query\n\
             interpreters:\n\
             \x20 - program: /usr/bin/python3\n\
             \x20   extensions: [py]\n\
             environment:\n\
             \x20 unset: [DISPLAY]\n"
        )
        .unwrap();

        let config = HostConfig::from_yaml_file(file.path()).unwrap();
        assert!(!config.use_shm);
        assert_eq!(config.quit_grace, Duration::from_millis(250));
        assert_eq!(config.stack_trace_mode, StackTraceMode::Query);
        assert_eq!(config.interpreters[0].extensions, vec!["py"]);
        assert_eq!(config.environment.unset, vec!["DISPLAY"]);
        assert!(config.environment.inherit);
        assert_eq!(config.tile_height, 64);
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "tile_size: 12").unwrap();
        assert!(matches!(
            HostConfig::from_yaml_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_rejects_oversized_tiles() {
        let config = HostConfig {
            tile_width: 4096,
            ..HostConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
