//! offline-syncd library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod config;
pub mod engine;
pub mod ws_transport;

// Re-export key types for convenience
pub use config::{ConfigError, DaemonConfig};
pub use engine::Engine;
pub use ws_transport::{AckEnvelope, RequestEnvelope, WsTransport, MAX_MESSAGE_SIZE};
