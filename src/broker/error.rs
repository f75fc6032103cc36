use thiserror::Error;

/// Errors reported by broker connections and channels
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
	/// The channel is not open
	#[error("Channel is closed")]
	ChannelClosed,

	/// The connection has been shut down and cannot create channels
	#[error("Connection is closed")]
	ConnectionClosed,

	/// The broker rejected or failed an operation
	#[error("Broker operation '{operation}' failed: {reason}")]
	Operation {
		/// Name of the failed operation
		operation: &'static str,
		/// Broker-supplied failure description
		reason: String,
	},
}

impl BrokerError {
	/// Creates a new Operation error
	pub fn operation(operation: &'static str, reason: impl Into<String>) -> Self {
		Self::Operation {
			operation,
			reason: reason.into(),
		}
	}
}
