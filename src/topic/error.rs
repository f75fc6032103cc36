//! Error types and utilities for the topic module
//!
//! This module contains the routing key error and shared constants for the
//! entire topic module. Pattern errors live next to the pattern compiler.

use thiserror::Error;

/// Errors raised when a routing key cannot be used for publishing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingKeyError {
	/// Routing key exceeds the AMQP short string limit
	#[error("Routing key is too long: {length} > {max}")]
	TooLong {
		/// Length of the rejected key in bytes
		length: usize,
		/// Largest accepted length
		max: usize,
	},
}

/// Topic processing limits and constants
pub mod limits {
	/// Maximum routing key length in bytes (AMQP short string)
	pub const MAX_ROUTING_KEY_LENGTH: usize = 255;

	/// Segment separator used by topic exchanges
	pub const SEGMENT_SEPARATOR: char = '.';
}

/// Validation utilities for topic operations
pub mod validation {
	use super::RoutingKeyError;
	use super::limits::*;

	/// Validates a concrete routing key before it is queued for publishing.
	///
	/// `*` and `#` carry no meaning in a routing key and are accepted as
	/// literal characters. The empty key is valid too.
	pub fn validate_routing_key(key: &str) -> Result<(), RoutingKeyError> {
		if key.len() > MAX_ROUTING_KEY_LENGTH {
			return Err(RoutingKeyError::TooLong {
				length: key.len(),
				max: MAX_ROUTING_KEY_LENGTH,
			});
		}
		Ok(())
	}
}
