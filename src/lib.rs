//! # AMQP Broadcast
//!
//! Topic-based broadcast over a single reusable channel of a broker
//! connection that may drop and recover at any time.
//!
//! ## Features
//!
//! - **Wildcard Subscriptions**: AMQP topic patterns (`*`, `#`) compiled once
//!   into anchored matchers
//! - **Buffered Posts**: Posts made while the channel is down are published in
//!   order as soon as it opens
//! - **Automatic Topology Recovery**: Exchange, queue and bindings are
//!   re-established on every reconnect
//! - **Manual Acknowledgment**: The latest delivery per pattern can be acked
//! - **Graceful Shutdown**: Waits for pending posts, then for the connection
//!   to report the disconnect
//! - **Pluggable Serialization**: Bincode by default, JSON behind the `json`
//!   feature
//!
//! ## Quick Start
//!
//! ```rust
//! use amqp_broadcast::prelude::*;
//! use amqp_broadcast::broker::MemoryBroker;
//! use bincode::{Decode, Encode};
//!
//! #[derive(Encode, Decode, Debug)]
//! struct Ping {
//!     seq: u32,
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> amqp_broadcast::Result<()> {
//! let registry = ExchangeRegistry::<Ping>::new(MemoryBroker::new());
//! let exchange = registry.get_exchange(
//!     &ConnectionConfig::default(),
//!     "messages",
//! )?;
//!
//! exchange.on("ping.*", |key, ping| println!("{key}: {}", ping.seq))?;
//! exchange.post("ping.eu", &Ping { seq: 1 })?;
//!
//! registry.shutdown_all().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Pattern Matching
//!
//! Routing keys and patterns are dot-separated:
//!
//! - `*` matches exactly one segment (e.g., `msg.*.yolo`)
//! - `#` matches zero or more segments (e.g., `msg.#`, or `#` for everything)
//!
//! ## Brokers
//!
//! The wrapper drives a broker through the [`broker::BrokerConnection`] and
//! [`broker::BrokerChannel`] traits. An in-memory implementation,
//! [`broker::MemoryBroker`], is included for tests and demos.

#![warn(missing_docs)]

// Core modules
pub mod broker;
pub mod client;
pub mod message_serializer;
pub mod routing;
pub mod topic;

// === Core Public API ===
pub use client::{
	BroadcastError, ConnectionConfig, ExchangeConfig, ExchangeRegistry,
	ExchangeWrapper, ShutdownSignal, WrapperSettings,
};

// Message serialization
#[cfg(feature = "json")]
pub use message_serializer::JsonSerializer;
pub use message_serializer::{BincodeSerializer, MessageSerializer};

// === Advanced API ===
pub use routing::{ChannelState, ShutdownPhase};
pub use topic::{TopicPattern, TopicPatternError};

/// Result type alias for operations that may fail with BroadcastError
pub type Result<T> = std::result::Result<T, BroadcastError>;

/// Prelude module for convenient imports
///
/// ```rust
/// use amqp_broadcast::prelude::*;
/// ```
pub mod prelude {
	//! Essential types for most broadcast applications

	pub use crate::{
		BincodeSerializer, BroadcastError, ConnectionConfig, ExchangeConfig,
		ExchangeRegistry, ExchangeWrapper, MessageSerializer, Result,
		ShutdownSignal,
	};
}

/// Advanced types and utilities for complex use cases
///
/// This module contains types that are useful for advanced scenarios:
/// - Implementing a broker backend
/// - Manual pattern handling
/// - Inspecting wrapper state
///
/// ```rust
/// use amqp_broadcast::advanced::*;
/// ```
pub mod advanced {
	//! Advanced types for complex use cases

	pub use crate::broker::{
		BrokerChannel, BrokerConnection, ChannelEvent, ChannelHandle,
		ConnectionFactory, ConsumeOptions, Delivery, ExchangeKind,
		ExchangeOptions, QueueOptions,
	};
	pub use crate::client::WrapperSettings;
	pub use crate::{ChannelState, ShutdownPhase, TopicPattern};

	// Topic utilities
	pub use crate::topic::{TopicPatternItem, limits, validation};
}

/// Error types used throughout the library
///
/// ```rust
/// use amqp_broadcast::errors::*;
/// ```
pub mod errors {
	//! All error types used in the library

	pub use crate::broker::BrokerError;
	pub use crate::topic::RoutingKeyError;
	pub use crate::{BroadcastError, TopicPatternError};
}
