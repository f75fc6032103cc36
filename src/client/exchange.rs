use std::fmt;
use std::sync::Arc;

use arcstr::ArcStr;
use tokio::sync::mpsc;
use tracing::debug;

use super::config::ExchangeConfig;
use super::error::BroadcastError;
use super::shutdown::ShutdownSignal;
use crate::broker::BrokerConnection;
use crate::message_serializer::{BincodeSerializer, MessageSerializer};
use crate::routing::{
	ChannelState, ExchangeCore, LifecycleActor, ShutdownPhase,
};

/// Topic broadcast over one channel of a shared broker connection.
///
/// Posts are buffered until the channel is open and then published in
/// order. Subscribers register wildcard patterns; every inbound message is
/// decoded once and handed to each callback whose pattern accepts its
/// routing key. The exchange, queue and bindings are re-established every
/// time the connection recovers.
///
/// Cloning yields another handle to the same wrapper.
///
/// # Example
///
/// ```rust
/// use amqp_broadcast::{ExchangeConfig, ExchangeWrapper, JsonSerializer};
/// use amqp_broadcast::broker::MemoryBroker;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> amqp_broadcast::Result<()> {
/// let broker = MemoryBroker::new();
/// let exchange = ExchangeWrapper::<serde_json::Value, _>::new(
/// 	broker.open_connection(),
/// 	ExchangeConfig::new("messages"),
/// 	JsonSerializer,
/// )?;
///
/// exchange.on("msg.#", |key, value| println!("{key}: {value}"))?;
/// exchange.post("msg.test.yolo", &serde_json::json!({ "test": "yolo" }))?;
/// exchange.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct ExchangeWrapper<T, F = BincodeSerializer> {
	core: Arc<ExchangeCore<T, F>>,
	connection: Arc<dyn BrokerConnection>,
}

impl<T, F> Clone for ExchangeWrapper<T, F> {
	fn clone(&self) -> Self {
		Self {
			core: self.core.clone(),
			connection: self.connection.clone(),
		}
	}
}

impl<T, F> ExchangeWrapper<T, F>
where
	T: Send + 'static,
	F: MessageSerializer<T>,
{
	/// Creates a wrapper on a new channel of `connection`.
	///
	/// Must be called within a tokio runtime: the wrapper's lifecycle task is
	/// spawned right away.
	pub fn new(
		connection: Arc<dyn BrokerConnection>,
		config: impl Into<ExchangeConfig>,
		serializer: F,
	) -> Result<Self, BroadcastError> {
		let config = config.into();
		let identity =
			arcstr::format!("{}#{}", config.exchange_name, config.queue_name);
		Self::with_identity(identity, connection, config, serializer)
	}

	pub(crate) fn with_identity(
		identity: ArcStr,
		connection: Arc<dyn BrokerConnection>,
		config: ExchangeConfig,
		serializer: F,
	) -> Result<Self, BroadcastError> {
		config.settings.match_cache_capacity()?;
		let (commands_tx, commands_rx) = mpsc::unbounded_channel();
		let handle = connection.create_channel()?;
		let disconnects = connection.subscribe_disconnect();
		let core = Arc::new(ExchangeCore::new(
			identity,
			config,
			handle.channel,
			serializer,
			commands_tx,
		)?);
		LifecycleActor::spawn(&core, handle.events, commands_rx, disconnects);
		debug!(identity = %core.identity(), "Exchange wrapper created");
		Ok(Self { core, connection })
	}

	/// Encodes `value` and publishes it with `topic` as routing key.
	///
	/// While the channel is not open the post is buffered and published, in
	/// order, once it opens. Encoding failures and publish failures of the
	/// flush this post triggers are returned here.
	pub fn post(&self, topic: &str, value: &T) -> Result<(), BroadcastError> {
		self.core.post(topic, value)
	}

	/// Calls `callback` with the routing key and decoded payload of every
	/// message matching `pattern`.
	///
	/// A new pattern is bound right away if the channel is open, otherwise on
	/// the next open. Registering a known pattern again only adds the
	/// callback.
	pub fn on<C>(&self, pattern: &str, callback: C) -> Result<(), BroadcastError>
	where C: Fn(&str, &T) + Send + Sync + 'static {
		self.core.subscribe(pattern, Arc::new(callback))
	}

	/// Acknowledges the most recent message delivered for `pattern`.
	///
	/// Does nothing if no message is retained for it, which is always the
	/// case when consuming without manual acknowledgment.
	///
	/// A delivery matching several patterns is retained under each of them.
	/// Acknowledge it through one pattern only: a second ack of the same
	/// delivery tag is a broker error, and a real broker closes the channel
	/// over it.
	pub fn ack(&self, pattern: &str) -> Result<(), BroadcastError> {
		self.core.ack(pattern)
	}

	/// Requests a graceful shutdown.
	///
	/// The channel closes once no posts are pending; the returned signal
	/// resolves when the connection then reports a disconnect. Calling this
	/// again returns a signal for the same completion.
	pub fn shutdown(&self) -> ShutdownSignal {
		ShutdownSignal::new(self.core.request_shutdown())
	}

	/// Returns true if the channel is open and its topology established
	pub fn is_open(&self) -> bool {
		self.core.channel_state().is_open()
	}

	/// Current channel state
	pub fn channel_state(&self) -> ChannelState {
		self.core.channel_state()
	}

	/// Progress of the shutdown, if one was requested
	pub fn shutdown_phase(&self) -> ShutdownPhase {
		self.core.shutdown_phase()
	}

	/// Returns true once a requested shutdown has completed
	pub fn is_terminated(&self) -> bool {
		self.shutdown_phase() == ShutdownPhase::Complete
	}

	/// Name of the consumed queue, known once it has been declared
	pub fn queue_name(&self) -> Option<ArcStr> {
		self.core.lock().queue_name.clone()
	}

	/// Exchange this wrapper publishes to and binds from
	pub fn exchange_name(&self) -> &str {
		self.core.exchange()
	}

	/// Registry key of this wrapper: `exchange#queue`
	pub fn identity(&self) -> &str {
		self.core.identity()
	}

	/// Number of posts waiting for the channel to open
	pub fn pending_posts(&self) -> usize {
		self.core.lock().pending.len()
	}

	/// Subscribed patterns, in registration order
	pub fn patterns(&self) -> Vec<ArcStr> {
		self.core.patterns()
	}

	/// Connection the wrapper's channel lives on
	pub fn connection(&self) -> &Arc<dyn BrokerConnection> {
		&self.connection
	}

	/// Configuration the wrapper was created with
	pub fn config(&self) -> &ExchangeConfig {
		self.core.config()
	}
}

impl<T, F> fmt::Debug for ExchangeWrapper<T, F>
where
	T: Send + 'static,
	F: MessageSerializer<T>,
{
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ExchangeWrapper")
			.field("identity", &self.identity())
			.field("channel_state", &self.channel_state())
			.field("shutdown", &self.shutdown_phase())
			.finish()
	}
}
