//! Client side: control-connection engine and local origin adapter.

pub mod engine;
pub mod origin;

pub use engine::{ClientError, TunnelClient};
pub use origin::LocalStream;
