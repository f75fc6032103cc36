use crate::broker::BrokerError;
use crate::topic::{RoutingKeyError, TopicPatternError};

/// Errors that can occur in exchange wrapper operations
#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
	/// Payload could not be serialized at post time
	#[error("Broadcast message preparation error: {0}")]
	Encode(String),

	/// The broker failed a publish while flushing pending posts.
	///
	/// The whole batch is gone: `dropped` entries were never published.
	#[error(
		"Broadcast message cannot be delivered ({dropped} pending posts \
		 dropped): {source}"
	)]
	Publish {
		/// Failure reported by the broker
		#[source]
		source: BrokerError,
		/// Number of buffered posts discarded with the batch
		dropped: usize,
	},

	/// Other broker operation failures
	#[error("Broker error: {0}")]
	Broker(#[from] BrokerError),

	/// Invalid subscription pattern
	#[error("Topic pattern error: {0}")]
	TopicPattern(#[from] TopicPatternError),

	/// Invalid routing key for publishing
	#[error("Routing key error: {0}")]
	RoutingKey(#[from] RoutingKeyError),

	/// Invalid configuration parameter values
	#[error("Invalid configuration value: {0}")]
	ConfigurationValue(String),

	/// The wrapper is closing for shutdown or already shut down
	#[error("Exchange wrapper has been shut down")]
	ShutDown,

	/// The wrapper went away before its shutdown completed
	#[error("Shutdown was interrupted before the connection disconnected")]
	ShutdownInterrupted,
}
