//! TunGo - reverse HTTP tunnel service.
//!
//! Gives a process behind NAT a stable public URL. A long-lived client
//! keeps an outbound control connection to a public server; incoming
//! public requests for the tenant's subdomain are multiplexed over that
//! connection, delivered to the client's local HTTP origin, and answered
//! back over the same leg.
//!
//! ```text
//!   public request            tunnel server                tunnel client
//!   ──────────────▶ ┌────────────────────────┐   init/data   ┌──────────────┐
//!                   │ router ── connection   │ ────────────▶ │ engine       │
//!                   │   │        manager     │               │   │          │
//!                   │   ▼           │        │   data/end    │   ▼          │
//!                   │ registry ◀────┘        │ ◀──────────── │ local origin │
//!                   └────────────────────────┘               └──────────────┘
//!                        │
//!                        ▼ (remote owner)
//!                    peer proxy ──▶ owning server
//! ```
//!
//! Multiple servers cooperate as a cluster: the registry is the shared
//! tenant directory, and requests that land on a non-owning server are
//! forwarded to the owner by the peer proxy.

// Core subsystems
pub mod config;
pub mod protocol;
pub mod registry;

// Server and client halves
pub mod client;
pub mod server;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::{ClientConfig, ServerConfig};
pub use lifecycle::Shutdown;
pub use server::TunnelServer;
