//! Configuration loading, schema, and validation.

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_client_config, load_server_config, ConfigError};
pub use schema::{parse_server_url, ClientConfig, ServerConfig, ServerNode};
pub use validation::{validate_client_config, validate_server_config, ValidationError};
