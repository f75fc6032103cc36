//! In-process topic broker
//!
//! Implements the broker capability entirely in memory so wrappers can be
//! exercised without a running AMQP server. Routing uses the crate's own
//! [`TopicPattern`] matcher. Connections can be dropped and recovered on
//! demand to drive the reconnect path, and publishes can be made to fail.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arcstr::ArcStr;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, broadcast, mpsc};
use tracing::debug;

use super::{
	BrokerChannel, BrokerConnection, BrokerError, ChannelEvent, ChannelHandle,
	ConnectionFactory, ConsumeOptions, Delivery, ExchangeKind, ExchangeOptions,
	QueueOptions,
};
use crate::client::config::ConnectionConfig;
use crate::topic::TopicPattern;

/// Record of a successful broker operation, in execution order
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum BrokerOperation {
	/// Exchange declared or confirmed
	AssertExchange { exchange: ArcStr, kind: ExchangeKind },
	/// Queue declared; `queue` is the effective name
	AssertQueue { queue: ArcStr },
	/// Prefetch limit applied
	Prefetch { count: u16 },
	/// Consumer started
	Consume { queue: ArcStr },
	/// Pattern bound from `exchange` to `queue`
	Bind { queue: ArcStr, exchange: ArcStr, pattern: ArcStr },
	/// Queue deleted
	DeleteQueue { queue: ArcStr },
	/// Message accepted by the exchange
	Publish { exchange: ArcStr, routing_key: ArcStr },
	/// Delivery acknowledged
	Ack { delivery_tag: u64, routing_key: ArcStr },
	/// Channel closed by the client
	CloseChannel,
}

#[derive(Debug, Clone)]
struct Message {
	exchange: ArcStr,
	routing_key: ArcStr,
	payload: Bytes,
	redelivered: bool,
}

struct QueueState {
	options: QueueOptions,
	owner: Option<u64>,
	bindings: Vec<(ArcStr, TopicPattern)>,
	consumers: Vec<(u64, ConsumeOptions)>,
	next_consumer: usize,
	backlog: VecDeque<Message>,
}

struct ConnectionState {
	up: bool,
	closed: bool,
	channels: Vec<u64>,
	disconnect_tx: broadcast::Sender<()>,
}

struct ChannelState {
	connection: u64,
	events: mpsc::UnboundedSender<ChannelEvent>,
	open: bool,
	closed_by_client: bool,
	next_tag: u64,
	unacked: HashMap<u64, (ArcStr, Message)>,
}

#[derive(Default)]
struct BrokerState {
	next_id: u64,
	exchanges: HashMap<ArcStr, ExchangeKind>,
	queues: HashMap<ArcStr, QueueState>,
	connections: HashMap<u64, ConnectionState>,
	channels: HashMap<u64, ChannelState>,
	operations: Vec<BrokerOperation>,
	failing_publishes: usize,
}

impl BrokerState {
	fn next_id(&mut self) -> u64 {
		self.next_id += 1;
		self.next_id
	}

	fn open_channel(
		&mut self,
		id: u64,
	) -> Result<&mut ChannelState, BrokerError> {
		match self.channels.get_mut(&id) {
			| Some(channel) if channel.open => Ok(channel),
			| _ => Err(BrokerError::ChannelClosed),
		}
	}

	fn route(&mut self, message: Message) -> usize {
		let targets: Vec<ArcStr> = self
			.queues
			.iter()
			.filter(|(_, queue)| {
				queue.bindings.iter().any(|(exchange, pattern)| {
					*exchange == message.exchange
						&& pattern.matches(&message.routing_key)
				})
			})
			.map(|(name, _)| name.clone())
			.collect();
		for queue in &targets {
			self.enqueue(queue, message.clone());
		}
		targets.len()
	}

	fn enqueue(&mut self, queue_name: &ArcStr, message: Message) {
		let BrokerState {
			queues, channels, ..
		} = self;
		let Some(queue) = queues.get_mut(queue_name) else {
			return;
		};
		let live: Vec<usize> = queue
			.consumers
			.iter()
			.enumerate()
			.filter(|(_, (channel, _))| {
				channels.get(channel).is_some_and(|c| c.open)
			})
			.map(|(index, _)| index)
			.collect();
		if live.is_empty() {
			queue.backlog.push_back(message);
			return;
		}
		let pick = live[queue.next_consumer % live.len()];
		queue.next_consumer = queue.next_consumer.wrapping_add(1);
		let (channel_id, options) = &queue.consumers[pick];
		let Some(channel) = channels.get_mut(channel_id) else {
			return;
		};
		channel.next_tag += 1;
		let delivery = Delivery {
			delivery_tag: channel.next_tag,
			exchange: message.exchange.clone(),
			routing_key: message.routing_key.clone(),
			payload: message.payload.clone(),
			redelivered: message.redelivered,
		};
		if !options.no_ack {
			channel
				.unacked
				.insert(channel.next_tag, (queue_name.clone(), message));
		}
		let _ = channel.events.send(ChannelEvent::Delivery(delivery));
	}

	fn drain_backlog(&mut self, queue_name: &ArcStr) {
		let backlog = match self.queues.get_mut(queue_name) {
			| Some(queue) => std::mem::take(&mut queue.backlog),
			| None => return,
		};
		for message in backlog {
			self.enqueue(queue_name, message);
		}
	}

	/// Tears down everything scoped to a channel that stopped being usable.
	fn channel_lost(&mut self, id: u64) {
		let unacked = match self.channels.get_mut(&id) {
			| Some(channel) if channel.open => {
				channel.open = false;
				let _ = channel.events.send(ChannelEvent::Closed);
				std::mem::take(&mut channel.unacked)
			}
			| _ => return,
		};
		self.queues.retain(|_, queue| {
			if queue.owner == Some(id) {
				return false;
			}
			let before = queue.consumers.len();
			queue.consumers.retain(|(channel, _)| *channel != id);
			!(queue.options.auto_delete
				&& before > 0
				&& queue.consumers.is_empty())
		});
		let mut requeued: Vec<_> = unacked.into_iter().collect();
		requeued.sort_by_key(|(tag, _)| *tag);
		for (_, (queue, mut message)) in requeued {
			message.redelivered = true;
			if let Some(queue) = self.queues.get_mut(&queue) {
				queue.backlog.push_back(message);
			}
		}
	}

	fn disconnect(&mut self, connection: u64) {
		let channels = match self.connections.get_mut(&connection) {
			| Some(conn) if conn.up => {
				conn.up = false;
				conn.channels.clone()
			}
			| _ => return,
		};
		for channel in channels {
			self.channel_lost(channel);
		}
		if let Some(conn) = self.connections.get(&connection) {
			let _ = conn.disconnect_tx.send(());
		}
	}

	/// Closes a connection for good. Termination is always reported as a
	/// disconnect, even if the connection was already down.
	fn terminate(&mut self, connection: u64) {
		let was_up = match self.connections.get_mut(&connection) {
			| Some(conn) if !conn.closed => {
				conn.closed = true;
				conn.up
			}
			| _ => return,
		};
		if was_up {
			self.disconnect(connection);
		} else if let Some(conn) = self.connections.get(&connection) {
			let _ = conn.disconnect_tx.send(());
		}
	}
}

/// Shared in-memory broker.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
	state: Arc<Mutex<BrokerState>>,
	declarations: Arc<RwLock<()>>,
}

impl MemoryBroker {
	/// Creates an empty broker
	pub fn new() -> Self {
		Self::default()
	}

	fn lock(&self) -> MutexGuard<'_, BrokerState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Opens a new connection. It starts up.
	pub fn open_connection(&self) -> Arc<MemoryConnection> {
		let (disconnect_tx, _) = broadcast::channel(16);
		let mut state = self.lock();
		let id = state.next_id();
		state.connections.insert(
			id,
			ConnectionState {
				up: true,
				closed: false,
				channels: Vec::new(),
				disconnect_tx: disconnect_tx.clone(),
			},
		);
		Arc::new(MemoryConnection {
			id,
			broker: self.clone(),
			disconnect_tx,
		})
	}

	/// Stalls exchange declarations until the returned guard is dropped.
	///
	/// Lets a test observe a wrapper whose open sequence is in progress.
	pub async fn hold_declarations(&self) -> OwnedRwLockWriteGuard<()> {
		self.declarations.clone().write_owned().await
	}

	/// Makes the next `count` publishes fail
	pub fn fail_next_publishes(&self, count: usize) {
		self.lock().failing_publishes = count;
	}

	/// Publishes a raw payload as if it came from another client.
	///
	/// Returns the number of queues the message was routed to.
	pub fn inject(
		&self,
		exchange: &str,
		routing_key: &str,
		payload: impl Into<Bytes>,
	) -> usize {
		self.lock().route(Message {
			exchange: ArcStr::from(exchange),
			routing_key: ArcStr::from(routing_key),
			payload: payload.into(),
			redelivered: false,
		})
	}

	/// Successful operations so far, oldest first
	pub fn operations(&self) -> Vec<BrokerOperation> {
		self.lock().operations.clone()
	}

	/// Routing keys published through channels, oldest first
	pub fn published_keys(&self) -> Vec<ArcStr> {
		self.lock()
			.operations
			.iter()
			.filter_map(|op| match op {
				| BrokerOperation::Publish { routing_key, .. } => {
					Some(routing_key.clone())
				}
				| _ => None,
			})
			.collect()
	}

	/// Returns true if a queue with this name exists
	pub fn has_queue(&self, name: &str) -> bool {
		self.lock().queues.contains_key(name)
	}

	/// Patterns bound to `queue`
	pub fn bindings(&self, queue: &str) -> Vec<ArcStr> {
		self.lock()
			.queues
			.get(queue)
			.map(|q| q.bindings.iter().map(|(_, p)| p.pattern().clone()).collect())
			.unwrap_or_default()
	}
}

impl ConnectionFactory for MemoryBroker {
	fn connect(
		&self,
		config: &ConnectionConfig,
	) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
		debug!(host = %config.host, "Opening in-memory broker connection");
		Ok(self.open_connection())
	}
}

/// Connection to a [`MemoryBroker`]
pub struct MemoryConnection {
	id: u64,
	broker: MemoryBroker,
	disconnect_tx: broadcast::Sender<()>,
}

impl MemoryConnection {
	/// Simulates a network failure: every channel closes and a disconnect
	/// is broadcast. Exclusive queues are lost, unacked messages requeued.
	pub fn drop_connection(&self) {
		self.broker.lock().disconnect(self.id);
	}

	/// Recovers after [`drop_connection`](Self::drop_connection): channels
	/// not closed by their owner are reopened.
	pub fn reconnect(&self) {
		let mut state = self.broker.lock();
		let channels = match state.connections.get_mut(&self.id) {
			| Some(conn) if !conn.up && !conn.closed => {
				conn.up = true;
				conn.channels.clone()
			}
			| _ => return,
		};
		for id in channels {
			if let Some(channel) = state.channels.get_mut(&id) {
				if !channel.closed_by_client {
					channel.open = true;
					let _ = channel.events.send(ChannelEvent::Opened);
				}
			}
		}
	}

	/// Closes the connection for good
	pub fn close(&self) {
		self.broker.lock().terminate(self.id);
	}

	/// Returns true while the connection is up
	pub fn is_up(&self) -> bool {
		self.broker
			.lock()
			.connections
			.get(&self.id)
			.is_some_and(|c| c.up)
	}
}

impl BrokerConnection for MemoryConnection {
	fn create_channel(&self) -> Result<ChannelHandle, BrokerError> {
		let (events_tx, events) = mpsc::unbounded_channel();
		let mut state = self.broker.lock();
		let up = match state.connections.get(&self.id) {
			| Some(conn) if !conn.closed => conn.up,
			| _ => return Err(BrokerError::ConnectionClosed),
		};
		let id = state.next_id();
		if up {
			let _ = events_tx.send(ChannelEvent::Opened);
		}
		state.channels.insert(
			id,
			ChannelState {
				connection: self.id,
				events: events_tx,
				open: up,
				closed_by_client: false,
				next_tag: 0,
				unacked: HashMap::new(),
			},
		);
		if let Some(conn) = state.connections.get_mut(&self.id) {
			conn.channels.push(id);
		}
		let channel = MemoryChannel {
			id,
			broker: self.broker.clone(),
		};
		Ok(ChannelHandle {
			channel: Arc::new(channel),
			events,
		})
	}

	fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
		self.disconnect_tx.subscribe()
	}
}

/// Channel on a [`MemoryConnection`]
pub struct MemoryChannel {
	id: u64,
	broker: MemoryBroker,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
	async fn assert_exchange(
		&self,
		name: &str,
		kind: ExchangeKind,
		_options: &ExchangeOptions,
	) -> Result<(), BrokerError> {
		drop(self.broker.declarations.read().await);
		let mut state = self.broker.lock();
		state.open_channel(self.id)?;
		let name = ArcStr::from(name);
		match state.exchanges.get(&name) {
			| Some(existing) if *existing != kind => {
				return Err(BrokerError::operation(
					"assert_exchange",
					format!(
						"exchange '{name}' exists with type {}",
						existing.as_str()
					),
				));
			}
			| Some(_) => {}
			| None => {
				state.exchanges.insert(name.clone(), kind);
			}
		}
		state
			.operations
			.push(BrokerOperation::AssertExchange { exchange: name, kind });
		Ok(())
	}

	async fn assert_queue(
		&self,
		name: &str,
		options: &QueueOptions,
	) -> Result<ArcStr, BrokerError> {
		let mut state = self.broker.lock();
		state.open_channel(self.id)?;
		let name = if name.is_empty() {
			let id = state.next_id();
			arcstr::format!("amq.gen-{id}")
		} else {
			ArcStr::from(name)
		};
		match state.queues.get(&name) {
			| Some(queue) if queue.owner.is_some_and(|o| o != self.id) => {
				return Err(BrokerError::operation(
					"assert_queue",
					format!("queue '{name}' is locked by another channel"),
				));
			}
			| Some(_) => {}
			| None => {
				state.queues.insert(
					name.clone(),
					QueueState {
						options: options.clone(),
						owner: options.exclusive.then_some(self.id),
						bindings: Vec::new(),
						consumers: Vec::new(),
						next_consumer: 0,
						backlog: VecDeque::new(),
					},
				);
			}
		}
		state.operations.push(BrokerOperation::AssertQueue {
			queue: name.clone(),
		});
		Ok(name)
	}

	async fn prefetch(&self, count: u16) -> Result<(), BrokerError> {
		let mut state = self.broker.lock();
		state.open_channel(self.id)?;
		state.operations.push(BrokerOperation::Prefetch { count });
		Ok(())
	}

	async fn consume(
		&self,
		queue: &str,
		options: &ConsumeOptions,
	) -> Result<(), BrokerError> {
		let mut state = self.broker.lock();
		state.open_channel(self.id)?;
		let name = ArcStr::from(queue);
		let Some(queue_state) = state.queues.get_mut(&name) else {
			return Err(BrokerError::operation(
				"consume",
				format!("no queue '{name}'"),
			));
		};
		if queue_state.consumers.iter().any(|(_, o)| o.exclusive)
			|| (options.exclusive && !queue_state.consumers.is_empty())
		{
			return Err(BrokerError::operation(
				"consume",
				format!("queue '{name}' has an exclusive consumer"),
			));
		}
		queue_state.consumers.push((self.id, options.clone()));
		state
			.operations
			.push(BrokerOperation::Consume { queue: name.clone() });
		state.drain_backlog(&name);
		Ok(())
	}

	async fn bind_queue(
		&self,
		queue: &str,
		exchange: &str,
		pattern: &str,
	) -> Result<(), BrokerError> {
		let compiled = TopicPattern::compile(pattern)
			.map_err(|e| BrokerError::operation("bind_queue", e.to_string()))?;
		let mut state = self.broker.lock();
		state.open_channel(self.id)?;
		let exchange = ArcStr::from(exchange);
		if !state.exchanges.contains_key(&exchange) {
			return Err(BrokerError::operation(
				"bind_queue",
				format!("no exchange '{exchange}'"),
			));
		}
		let name = ArcStr::from(queue);
		let Some(queue_state) = state.queues.get_mut(&name) else {
			return Err(BrokerError::operation(
				"bind_queue",
				format!("no queue '{name}'"),
			));
		};
		if !queue_state
			.bindings
			.iter()
			.any(|(e, p)| *e == exchange && p.as_str() == pattern)
		{
			queue_state.bindings.push((exchange.clone(), compiled));
		}
		state.operations.push(BrokerOperation::Bind {
			queue: name,
			exchange,
			pattern: ArcStr::from(pattern),
		});
		Ok(())
	}

	async fn delete_queue(&self, queue: &str) -> Result<(), BrokerError> {
		let mut state = self.broker.lock();
		state.open_channel(self.id)?;
		let name = ArcStr::from(queue);
		state.queues.remove(&name);
		state
			.operations
			.push(BrokerOperation::DeleteQueue { queue: name });
		Ok(())
	}

	fn publish(
		&self,
		exchange: &str,
		routing_key: &str,
		payload: Bytes,
	) -> Result<(), BrokerError> {
		let mut state = self.broker.lock();
		state.open_channel(self.id)?;
		if state.failing_publishes > 0 {
			state.failing_publishes -= 1;
			return Err(BrokerError::operation("publish", "injected failure"));
		}
		let exchange = ArcStr::from(exchange);
		if !state.exchanges.contains_key(&exchange) {
			return Err(BrokerError::operation(
				"publish",
				format!("no exchange '{exchange}'"),
			));
		}
		let routing_key = ArcStr::from(routing_key);
		state.operations.push(BrokerOperation::Publish {
			exchange: exchange.clone(),
			routing_key: routing_key.clone(),
		});
		state.route(Message {
			exchange,
			routing_key,
			payload,
			redelivered: false,
		});
		Ok(())
	}

	fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
		let mut state = self.broker.lock();
		let channel = state.open_channel(self.id)?;
		if channel.unacked.remove(&delivery.delivery_tag).is_none() {
			return Err(BrokerError::operation(
				"ack",
				format!("unknown delivery tag {}", delivery.delivery_tag),
			));
		}
		state.operations.push(BrokerOperation::Ack {
			delivery_tag: delivery.delivery_tag,
			routing_key: delivery.routing_key.clone(),
		});
		Ok(())
	}

	async fn close(&self) -> Result<(), BrokerError> {
		let mut state = self.broker.lock();
		let connection = match state.channels.get_mut(&self.id) {
			| Some(channel) if !channel.closed_by_client => {
				channel.closed_by_client = true;
				channel.connection
			}
			| _ => return Err(BrokerError::ChannelClosed),
		};
		state.channel_lost(self.id);
		state.operations.push(BrokerOperation::CloseChannel);

		let all_closed = state.connections.get(&connection).is_some_and(|conn| {
			conn.channels.iter().all(|id| {
				state.channels.get(id).is_none_or(|c| c.closed_by_client)
			})
		});
		if all_closed {
			debug!(connection, "Last channel closed, closing connection");
			state.terminate(connection);
		}
		Ok(())
	}
}
