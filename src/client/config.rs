//! Configuration for connections and exchange wrappers

use std::collections::BTreeMap;
use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use super::error::BroadcastError;
use crate::broker::{ConsumeOptions, ExchangeOptions, QueueOptions};

/// Default broker address
pub const DEFAULT_HOST: &str = "amqp://localhost";
/// Default exchange name
pub const DEFAULT_EXCHANGE_NAME: &str = "messages";

/// Broker connection settings.
///
/// Wrappers created with equal connection configs share one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
	/// Broker URL
	pub host: String,
	/// Broker-specific authentication and TLS settings, passed through
	pub options: BTreeMap<String, String>,
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		Self {
			host: DEFAULT_HOST.to_string(),
			options: BTreeMap::new(),
		}
	}
}

impl ConnectionConfig {
	/// Config for the given broker URL
	pub fn new(host: impl Into<String>) -> Self {
		Self {
			host: host.into(),
			options: BTreeMap::new(),
		}
	}

	/// Adds a pass-through connection option
	pub fn with_option(
		mut self,
		key: impl Into<String>,
		value: impl Into<String>,
	) -> Self {
		self.options.insert(key.into(), value.into());
		self
	}
}

/// Wrapper-level behavior settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WrapperSettings {
	/// Routing keys remembered with their matching patterns (must be > 0)
	pub match_cache_size: usize,
	/// Match routing keys against patterns ignoring case
	pub case_insensitive_patterns: bool,
}

impl Default for WrapperSettings {
	fn default() -> Self {
		Self {
			match_cache_size: 128,
			case_insensitive_patterns: false,
		}
	}
}

impl WrapperSettings {
	/// Match cache capacity, rejecting zero
	pub fn match_cache_capacity(&self) -> Result<NonZeroUsize, BroadcastError> {
		NonZeroUsize::new(self.match_cache_size).ok_or_else(|| {
			BroadcastError::ConfigurationValue(
				"match_cache_size must be greater than zero".to_string(),
			)
		})
	}
}

/// Exchange and queue settings for one wrapper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
	/// Topic exchange to publish to and bind from
	pub exchange_name: String,
	/// Passed to the exchange declaration
	pub exchange_options: ExchangeOptions,
	/// Queue name; empty lets the broker pick one
	pub queue_name: String,
	/// Passed to the queue declaration
	pub queue_options: QueueOptions,
	/// Passed when starting the consumer
	pub consume_options: ConsumeOptions,
	/// Prefetch count applied once the queue is declared
	pub prefetch: Option<u16>,
	/// Wrapper behavior settings
	pub settings: WrapperSettings,
}

impl Default for ExchangeConfig {
	fn default() -> Self {
		Self {
			exchange_name: DEFAULT_EXCHANGE_NAME.to_string(),
			exchange_options: ExchangeOptions::default(),
			queue_name: String::new(),
			queue_options: QueueOptions::default(),
			consume_options: ConsumeOptions::default(),
			prefetch: None,
			settings: WrapperSettings::default(),
		}
	}
}

impl ExchangeConfig {
	/// Config for the named exchange with default queue settings
	pub fn new(exchange_name: impl Into<String>) -> Self {
		Self {
			exchange_name: exchange_name.into(),
			..Self::default()
		}
	}

	/// Uses a named, shared queue
	pub fn with_queue(
		mut self,
		queue_name: impl Into<String>,
		options: QueueOptions,
	) -> Self {
		self.queue_name = queue_name.into();
		self.queue_options = options;
		self
	}

	/// Requires explicit acknowledgment of deliveries
	pub fn with_manual_ack(mut self) -> Self {
		self.consume_options.no_ack = false;
		self
	}

	/// Sets the channel prefetch count
	pub fn with_prefetch(mut self, prefetch: u16) -> Self {
		self.prefetch = Some(prefetch);
		self
	}

	/// Returns true if deliveries must be acknowledged by the application
	pub fn requires_ack(&self) -> bool {
		!self.consume_options.no_ack
	}
}

impl From<&str> for ExchangeConfig {
	fn from(exchange_name: &str) -> Self {
		Self::new(exchange_name)
	}
}

impl From<String> for ExchangeConfig {
	fn from(exchange_name: String) -> Self {
		Self::new(exchange_name)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_follow_broadcast_conventions() {
		let config = ExchangeConfig::default();
		assert_eq!(config.exchange_name, "messages");
		assert!(!config.exchange_options.durable);
		assert!(config.queue_name.is_empty());
		assert!(config.queue_options.exclusive);
		assert!(config.consume_options.no_ack);
		assert_eq!(config.prefetch, None);
		assert!(!config.requires_ack());
		assert_eq!(ConnectionConfig::default().host, "amqp://localhost");
	}

	#[test]
	fn bare_name_converts_to_config() {
		let config: ExchangeConfig = "events".into();
		assert_eq!(config.exchange_name, "events");
		assert_eq!(config.queue_options, QueueOptions::default());
	}

	#[cfg(feature = "json")]
	#[test]
	fn partial_config_deserializes_with_defaults() {
		let config: ExchangeConfig = serde_json::from_str(
			r#"{ "queue_name": "shared.message.queue",
			     "queue_options": { "exclusive": false },
			     "prefetch": 10 }"#,
		)
		.unwrap();
		assert_eq!(config.exchange_name, "messages");
		assert_eq!(config.queue_name, "shared.message.queue");
		assert!(!config.queue_options.exclusive);
		assert_eq!(config.prefetch, Some(10));
		assert_eq!(config.settings.match_cache_size, 128);
	}
}
