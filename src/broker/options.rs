//! Declare and consume options passed through to the broker

use serde::{Deserialize, Serialize};

/// Exchange routing type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
	/// Routes on dot-separated wildcard patterns
	Topic,
}

impl ExchangeKind {
	/// Broker-side name of the exchange type
	pub fn as_str(&self) -> &'static str {
		match self {
			| ExchangeKind::Topic => "topic",
		}
	}
}

/// Options for declaring an exchange
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeOptions {
	/// Survive broker restarts
	pub durable: bool,
	/// Delete when the last queue is unbound
	pub auto_delete: bool,
	/// Reject direct publishes from clients
	pub internal: bool,
}

/// Options for declaring a queue
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
	/// Scoped to the declaring channel and deleted with it
	pub exclusive: bool,
	/// Survive broker restarts
	pub durable: bool,
	/// Delete when the last consumer goes away
	pub auto_delete: bool,
}

impl Default for QueueOptions {
	fn default() -> Self {
		Self {
			exclusive: true,
			durable: false,
			auto_delete: false,
		}
	}
}

/// Options for consuming a queue
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumeOptions {
	/// Deliveries count as acknowledged as soon as they are sent
	pub no_ack: bool,
	/// Refuse other consumers on the same queue
	pub exclusive: bool,
}

impl Default for ConsumeOptions {
	fn default() -> Self {
		Self {
			no_ack: true,
			exclusive: false,
		}
	}
}
