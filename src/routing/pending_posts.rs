use std::collections::VecDeque;

use arcstr::ArcStr;
use bytes::Bytes;

use crate::broker::BrokerChannel;
use crate::client::error::BroadcastError;

/// An encoded post waiting for the channel to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPost {
	/// Routing key to publish with
	pub topic: ArcStr,
	/// Encoded payload
	pub payload: Bytes,
}

/// Ordered buffer of posts not yet handed to the broker
#[derive(Debug, Default)]
pub struct PendingPosts {
	entries: VecDeque<PendingPost>,
}

impl PendingPosts {
	/// Creates an empty buffer
	pub fn new() -> Self {
		Self::default()
	}

	/// Appends a post to the tail
	pub fn enqueue(&mut self, topic: ArcStr, payload: Bytes) {
		self.entries.push_back(PendingPost { topic, payload });
	}

	/// Number of buffered posts
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	/// Returns true if nothing is buffered
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Publishes every buffered post in enqueue order and returns how many
	/// were sent.
	///
	/// The buffer is emptied before the first publish, so a failing publish
	/// drops the failed post and everything behind it; nothing is requeued.
	pub fn flush(
		&mut self,
		channel: &dyn BrokerChannel,
		exchange: &str,
	) -> Result<usize, BroadcastError> {
		let batch = std::mem::take(&mut self.entries);
		let total = batch.len();
		for (sent, post) in batch.into_iter().enumerate() {
			if let Err(source) =
				channel.publish(exchange, &post.topic, post.payload)
			{
				return Err(BroadcastError::Publish {
					source,
					dropped: total - sent,
				});
			}
		}
		Ok(total)
	}
}
