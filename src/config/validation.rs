//! Configuration validation logic.

use crate::config::schema::{ClientConfig, ServerConfig};

/// Placeholder that must appear in the domain template.
pub const SUBDOMAIN_PLACEHOLDER: &str = "{{ .subdomain }}";

/// Error type for configuration validation failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation error: {}", self.0)
    }
}

const VALID_LOG_LEVELS: &[&str] = &["debug", "info", "warn", "error"];
const VALID_LOG_FORMATS: &[&str] = &["json", "console"];

fn check_logging(log_level: &str, log_format: &str, errors: &mut Vec<ValidationError>) {
    if !VALID_LOG_LEVELS.contains(&log_level) {
        errors.push(ValidationError(format!("invalid log level: {}", log_level)));
    }
    if !VALID_LOG_FORMATS.contains(&log_format) {
        errors.push(ValidationError(format!("invalid log format: {}", log_format)));
    }
}

/// Validate a ServerConfig for semantic correctness.
pub fn validate_server_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.id.is_empty() {
        errors.push(ValidationError("server id cannot be empty".to_string()));
    }
    if config.port == 0 {
        errors.push(ValidationError("port cannot be 0".to_string()));
    }
    if config.control_port == 0 {
        errors.push(ValidationError("control_port cannot be 0".to_string()));
    }
    if config.port == config.control_port {
        errors.push(ValidationError(
            "port and control_port must differ".to_string(),
        ));
    }
    if config.max_connections == 0 {
        errors.push(ValidationError("max_connections must be positive".to_string()));
    }
    if !config.domain.contains(SUBDOMAIN_PLACEHOLDER) {
        errors.push(ValidationError(format!(
            "domain template must contain '{}'",
            SUBDOMAIN_PLACEHOLDER
        )));
    }
    if !config.require_auth && !config.allow_anonymous {
        errors.push(ValidationError(
            "allow_anonymous=false requires require_auth=true".to_string(),
        ));
    }
    check_logging(&config.log_level, &config.log_format, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate a ClientConfig for semantic correctness.
pub fn validate_client_config(config: &ClientConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server_url.is_empty() && config.server_host.is_empty() && config.server_cluster.is_empty() {
        errors.push(ValidationError(
            "one of server_url, server_host, or server_cluster must be configured".to_string(),
        ));
    }
    for (i, node) in config.server_cluster.iter().enumerate() {
        if node.host.is_empty() {
            errors.push(ValidationError(format!("server_cluster[{}]: host cannot be empty", i)));
        }
        if node.port == 0 {
            errors.push(ValidationError(format!("server_cluster[{}]: port cannot be 0", i)));
        }
    }
    if config.local_host.is_empty() {
        errors.push(ValidationError("local_host cannot be empty".to_string()));
    }
    if config.local_port == 0 {
        errors.push(ValidationError("local_port cannot be 0".to_string()));
    }
    check_logging(&config.log_level, &config.log_format, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_defaults() {
        assert!(validate_server_config(&ServerConfig::default()).is_ok());
        assert!(validate_client_config(&ClientConfig::default()).is_ok());
    }

    #[test]
    fn test_domain_requires_placeholder() {
        let mut config = ServerConfig::default();
        config.domain = "tunnel.example.com".into();

        let errs = validate_server_config(&config).unwrap_err();
        assert!(errs.iter().any(|e| e.0.contains("subdomain")));
    }

    #[test]
    fn test_port_collision_rejected() {
        let mut config = ServerConfig::default();
        config.control_port = config.port;

        let errs = validate_server_config(&config).unwrap_err();
        assert!(errs.iter().any(|e| e.0.contains("must differ")));
    }

    #[test]
    fn test_client_requires_a_server() {
        let mut config = ClientConfig::default();
        config.server_host.clear();

        let errs = validate_client_config(&config).unwrap_err();
        assert!(errs.iter().any(|e| e.0.contains("server_url")));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = ServerConfig::default();
        config.log_level = "verbose".into();

        let errs = validate_server_config(&config).unwrap_err();
        assert_eq!(errs.len(), 1);
        assert!(errs[0].0.contains("invalid log level"));
    }
}
