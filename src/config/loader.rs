//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::GatewayConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Settings given on the command line. They win over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind_address: Option<String>,
    pub backend_url: Option<String>,
    pub development_mode: bool,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut GatewayConfig) {
        if let Some(address) = &self.bind_address {
            config.listener.bind_address = address.clone();
        }
        if let Some(url) = &self.backend_url {
            config.backend.url = url.clone();
        }
        config.development_mode |= self.development_mode;
    }
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<GatewayConfig, ConfigError> {
    let config = parse_unvalidated(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    parse_config(&content)
}

/// Load the file (or the defaults when `path` is `None`), apply the
/// overrides, then validate the merged result.
pub fn load_config_with(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<GatewayConfig, ConfigError> {
    let mut config = match path {
        Some(path) => parse_unvalidated(&fs::read_to_string(path).map_err(ConfigError::Io)?)?,
        None => GatewayConfig::default(),
    };
    overrides.apply(&mut config);
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

fn parse_unvalidated(content: &str) -> Result<GatewayConfig, ConfigError> {
    toml::from_str(content).map_err(ConfigError::Parse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            development_mode = true

            [backend]
            url = "http://127.0.0.1:3000/"

            [archive]
            cache_root = "/var/cache/git-gateway"
            "#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert!(config.development_mode);
        assert_eq!(config.archive.cache_root.to_str(), Some("/var/cache/git-gateway"));
    }

    #[test]
    fn test_validation_errors_are_reported() {
        let err = parse_config("[backend]\nproxy_headers_timeout_secs = 0\n").unwrap_err();
        match err {
            ConfigError::Validation(errors) => assert_eq!(errors.len(), 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_overrides_are_validated() {
        let overrides = ConfigOverrides {
            backend_url: Some("https://rails.example.com/".into()),
            ..Default::default()
        };
        match load_config_with(None, &overrides).unwrap_err() {
            ConfigError::Validation(errors) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].field, "backend.url");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_override_repairs_file_value() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[backend]\nurl = \"ftp://rails/\"").unwrap();
        assert!(matches!(load_config(file.path()), Err(ConfigError::Validation(_))));

        let overrides = ConfigOverrides {
            bind_address: Some("127.0.0.1:9000".into()),
            backend_url: Some("http://127.0.0.1:3000/".into()),
            development_mode: true,
        };
        let config = load_config_with(Some(file.path()), &overrides).unwrap();
        assert_eq!(config.listener.bind_address, "127.0.0.1:9000");
        assert_eq!(config.backend.url, "http://127.0.0.1:3000/");
        assert!(config.development_mode);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            load_config(Path::new("/nonexistent/git-gateway.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
