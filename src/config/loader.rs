//! Configuration loading from disk.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::schema::RuntimeConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Read a TOML file into a configuration without validating it.
///
/// Validation runs after command-line overrides have been applied.
pub fn load_config(path: &Path) -> Result<RuntimeConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: RuntimeConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

/// Validate a fully assembled configuration.
pub fn finalize(config: RuntimeConfig) -> Result<RuntimeConfig, ConfigError> {
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("{}-{}-{name}", env!("CARGO_PKG_NAME"), uuid::Uuid::new_v4()));
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_file() {
        let path = temp_file("ok.toml", "[http]\nbind_address = \"127.0.0.1:0\"\n");
        let config = load_config(&path).unwrap();
        assert_eq!(config.http.bind_address, "127.0.0.1:0");
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn reports_parse_errors_with_path() {
        let path = temp_file("bad.toml", "[http\n");
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.toml"));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/chronostore.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn finalize_joins_errors() {
        let mut config = RuntimeConfig::default();
        config.log.level = "loud".into();
        config.grpc.bind_address = "x".into();
        let err = finalize(config).unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("invalid configuration: log.level"));
        assert!(text.contains(", grpc.bind_address"));
    }
}
