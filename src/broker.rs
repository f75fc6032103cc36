//! Broker capability interface
//!
//! The exchange wrapper drives a broker connection it does not implement.
//! Anything that can declare exchanges and queues, bind, consume, publish and
//! acknowledge on a logical channel can back it by implementing
//! [`BrokerConnection`] and [`BrokerChannel`]. The connection owns the
//! reconnect policy: the wrapper only reacts to the [`ChannelEvent::Opened`]
//! and [`ChannelEvent::Closed`] transitions it is handed.

/// Broker error types
pub mod error;
pub mod memory;
pub mod options;

use std::sync::Arc;

use arcstr::ArcStr;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

pub use error::BrokerError;
pub use memory::{BrokerOperation, MemoryBroker, MemoryConnection};
pub use options::{ConsumeOptions, ExchangeKind, ExchangeOptions, QueueOptions};

use crate::client::config::ConnectionConfig;

/// A message delivered to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
	/// Channel-scoped tag used for acknowledgment
	pub delivery_tag: u64,
	/// Exchange the message was published to
	pub exchange: ArcStr,
	/// Routing key the message was published with
	pub routing_key: ArcStr,
	/// Encoded payload
	pub payload: Bytes,
	/// True if the broker delivered this message before
	pub redelivered: bool,
}

/// Notifications emitted by a channel.
///
/// Every channel starts closed. `Opened` is emitted each time the channel
/// becomes usable (first connect and every reconnect), `Closed` each time it
/// stops being usable. Deliveries only arrive between the two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
	/// Channel is usable; topology must be (re)established
	Opened,
	/// Channel is gone; exclusive queues and delivery tags are invalid
	Closed,
	/// A message arrived for a consumer on this channel
	Delivery(Delivery),
}

/// Receiver side of a channel's event stream
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// A freshly created channel together with its event stream
pub struct ChannelHandle {
	/// Operations on the channel
	pub channel: Arc<dyn BrokerChannel>,
	/// Lifecycle transitions and deliveries, in order
	pub events: ChannelEvents,
}

/// Operations on a logical broker channel.
///
/// `publish` and `ack` are buffered writes and never suspend; everything that
/// needs a broker round trip is async.
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
	/// Declares an exchange, succeeding if an equivalent one already exists
	async fn assert_exchange(
		&self,
		name: &str,
		kind: ExchangeKind,
		options: &ExchangeOptions,
	) -> Result<(), BrokerError>;

	/// Declares a queue and returns its effective name.
	///
	/// An empty `name` asks the broker to generate one.
	async fn assert_queue(
		&self,
		name: &str,
		options: &QueueOptions,
	) -> Result<ArcStr, BrokerError>;

	/// Limits the number of unacknowledged deliveries on this channel
	async fn prefetch(&self, count: u16) -> Result<(), BrokerError>;

	/// Starts consuming a queue; deliveries arrive as [`ChannelEvent::Delivery`]
	async fn consume(
		&self,
		queue: &str,
		options: &ConsumeOptions,
	) -> Result<(), BrokerError>;

	/// Binds `queue` to `exchange` with a topic pattern
	async fn bind_queue(
		&self,
		queue: &str,
		exchange: &str,
		pattern: &str,
	) -> Result<(), BrokerError>;

	/// Deletes a queue
	async fn delete_queue(&self, queue: &str) -> Result<(), BrokerError>;

	/// Publishes a message to an exchange
	fn publish(
		&self,
		exchange: &str,
		routing_key: &str,
		payload: Bytes,
	) -> Result<(), BrokerError>;

	/// Acknowledges a delivery received on this channel
	fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

	/// Closes the channel for good; no further `Opened` follows
	async fn close(&self) -> Result<(), BrokerError>;
}

/// A broker connection that may drop and recover at any time
pub trait BrokerConnection: Send + Sync + 'static {
	/// Creates a new channel on this connection
	fn create_channel(&self) -> Result<ChannelHandle, BrokerError>;

	/// Subscribes to disconnect notifications.
	///
	/// One `()` is sent every time the connection goes down, whether it
	/// recovers afterwards or not.
	fn subscribe_disconnect(&self) -> broadcast::Receiver<()>;
}

/// Opens connections for a given configuration.
///
/// Returned connections connect and reconnect in the background; creating one
/// never waits for the broker.
pub trait ConnectionFactory: Send + Sync + 'static {
	/// Creates a connection for `config`
	fn connect(
		&self,
		config: &ConnectionConfig,
	) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}
