//! Exchange wrapper client module
//!
//! This module provides the public face of the crate: the exchange wrapper
//! with its post/subscribe/ack/shutdown operations, the registry that
//! memoizes wrappers, and their configuration.

/// Connection and exchange configuration
pub mod config;
/// Client error types
pub mod error;
/// The exchange wrapper
pub mod exchange;
/// Memoizing wrapper factory
pub mod registry;
/// Shutdown completion signal
pub mod shutdown;

// Re-export commonly used types for convenience
pub use config::{ConnectionConfig, ExchangeConfig, WrapperSettings};
pub use error::BroadcastError;
pub use exchange::ExchangeWrapper;
pub use registry::ExchangeRegistry;
pub use shutdown::ShutdownSignal;
