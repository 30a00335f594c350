//! Configuration loading from disk and the environment.
//!
//! Precedence, lowest to highest: built-in defaults, TOML config file,
//! environment variables (`TUNGO_SERVER_*` / `TUNGO_CLIENT_*`).

use std::path::Path;
use std::str::FromStr;
use std::{env, fs};

use crate::config::schema::{ClientConfig, ServerConfig};
use crate::config::validation::{validate_client_config, validate_server_config, ValidationError};

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

const SERVER_ENV_PREFIX: &str = "TUNGO_SERVER_";
const CLIENT_ENV_PREFIX: &str = "TUNGO_CLIENT_";

/// Load and validate a server configuration.
///
/// `path` may be `None`, in which case only defaults and environment
/// variables apply. A missing explicit file is an error; settings from the
/// environment always win over the file.
pub fn load_server_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = fs::read_to_string(p).map_err(ConfigError::Io)?;
            toml::from_str(&content).map_err(ConfigError::Parse)?
        }
        None => ServerConfig::default(),
    };

    apply_server_env(&mut config);
    validate_server_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate a client configuration. Same precedence rules as
/// [`load_server_config`].
pub fn load_client_config(path: Option<&Path>) -> Result<ClientConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = fs::read_to_string(p).map_err(ConfigError::Io)?;
            toml::from_str(&content).map_err(ConfigError::Parse)?
        }
        None => ClientConfig::default(),
    };

    apply_client_env(&mut config);
    validate_client_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

fn env_override<T: FromStr>(prefix: &str, key: &str, target: &mut T) {
    let var = format!("{}{}", prefix, key);
    if let Ok(raw) = env::var(&var) {
        match raw.parse() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!(var = %var, value = %raw, "Ignoring unparseable environment override"),
        }
    }
}

fn apply_server_env(config: &mut ServerConfig) {
    env_override(SERVER_ENV_PREFIX, "ID", &mut config.id);
    env_override(SERVER_ENV_PREFIX, "HOST", &mut config.host);
    env_override(SERVER_ENV_PREFIX, "PORT", &mut config.port);
    env_override(SERVER_ENV_PREFIX, "CONTROL_PORT", &mut config.control_port);
    env_override(SERVER_ENV_PREFIX, "METRICS_PORT", &mut config.metrics_port);
    env_override(SERVER_ENV_PREFIX, "MAX_CONNECTIONS", &mut config.max_connections);
    env_override(SERVER_ENV_PREFIX, "REQUIRE_AUTH", &mut config.require_auth);
    env_override(SERVER_ENV_PREFIX, "ALLOW_ANONYMOUS", &mut config.allow_anonymous);
    env_override(SERVER_ENV_PREFIX, "DOMAIN", &mut config.domain);
    env_override(SERVER_ENV_PREFIX, "PUBLIC_URL", &mut config.public_url);
    env_override(SERVER_ENV_PREFIX, "READ_TIMEOUT_SECS", &mut config.read_timeout_secs);
    env_override(SERVER_ENV_PREFIX, "WRITE_TIMEOUT_SECS", &mut config.write_timeout_secs);
    env_override(SERVER_ENV_PREFIX, "IDLE_TIMEOUT_SECS", &mut config.idle_timeout_secs);
    env_override(SERVER_ENV_PREFIX, "REDIS_URL", &mut config.redis_url);
    env_override(SERVER_ENV_PREFIX, "LOG_LEVEL", &mut config.log_level);
    env_override(SERVER_ENV_PREFIX, "LOG_FORMAT", &mut config.log_format);
}

fn apply_client_env(config: &mut ClientConfig) {
    env_override(CLIENT_ENV_PREFIX, "SERVER_URL", &mut config.server_url);
    env_override(CLIENT_ENV_PREFIX, "SERVER_HOST", &mut config.server_host);
    env_override(CLIENT_ENV_PREFIX, "CONTROL_PORT", &mut config.control_port);
    env_override(CLIENT_ENV_PREFIX, "LOCAL_HOST", &mut config.local_host);
    env_override(CLIENT_ENV_PREFIX, "LOCAL_PORT", &mut config.local_port);
    env_override(CLIENT_ENV_PREFIX, "SUBDOMAIN", &mut config.subdomain);
    env_override(CLIENT_ENV_PREFIX, "SECRET_KEY", &mut config.secret_key);
    env_override(CLIENT_ENV_PREFIX, "PASSWORD", &mut config.password);
    env_override(CLIENT_ENV_PREFIX, "RECONNECT_TOKEN", &mut config.reconnect_token);
    env_override(CLIENT_ENV_PREFIX, "CONNECT_TIMEOUT_SECS", &mut config.connect_timeout_secs);
    env_override(CLIENT_ENV_PREFIX, "RETRY_INTERVAL_SECS", &mut config.retry_interval_secs);
    env_override(CLIENT_ENV_PREFIX, "MAX_RETRIES", &mut config.max_retries);
    env_override(CLIENT_ENV_PREFIX, "INSECURE_TLS", &mut config.insecure_tls);
    env_override(CLIENT_ENV_PREFIX, "CAPTURE_TRAFFIC", &mut config.capture_traffic);
    env_override(CLIENT_ENV_PREFIX, "LOG_LEVEL", &mut config.log_level);
    env_override(CLIENT_ENV_PREFIX, "LOG_FORMAT", &mut config.log_format);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        assert!(load_server_config(None).is_ok());
        assert!(load_client_config(None).is_ok());
    }

    #[test]
    fn file_values_are_applied() {
        let dir = std::env::temp_dir().join("tungo-config-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("server.toml");
        fs::write(
            &path,
            r#"
id = "s7"
port = 18080
domain = "{{ .subdomain }}.tunnel.test"
"#,
        )
        .unwrap();

        let config = load_server_config(Some(&path)).unwrap();
        assert_eq!(config.id, "s7");
        assert_eq!(config.port, 18080);
        assert_eq!(config.domain, "{{ .subdomain }}.tunnel.test");
        // Untouched fields keep their defaults.
        assert_eq!(config.control_port, 5000);
    }

    #[test]
    fn env_wins_over_defaults() {
        env::set_var("TUNGO_SERVER_CONTROL_PORT", "15000");
        env::set_var("TUNGO_SERVER_LOG_LEVEL", "debug");
        let config = load_server_config(None).unwrap();
        env::remove_var("TUNGO_SERVER_CONTROL_PORT");
        env::remove_var("TUNGO_SERVER_LOG_LEVEL");

        assert_eq!(config.control_port, 15000);
        assert_eq!(config.log_level, "debug");
    }
}
