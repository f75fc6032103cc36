//! State shared between an exchange wrapper and its lifecycle actor

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arcstr::ArcStr;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::lifecycle::{ChannelState, LifecycleCommand};
use super::pending_posts::PendingPosts;
use super::subscriptions::{Callback, LastMessages, SubscriptionTable};
use crate::broker::{BrokerChannel, Delivery};
use crate::client::config::ExchangeConfig;
use crate::client::error::BroadcastError;
use crate::message_serializer::MessageSerializer;
use crate::topic::validation::validate_routing_key;

/// Progress of a requested shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
	/// No shutdown requested
	Running,
	/// Requested, waiting for pending posts to drain
	Requested,
	/// Channel close issued, waiting for the connection to disconnect
	Closing,
	/// Connection disconnected; the wrapper is finished
	Complete,
}

impl ShutdownPhase {
	/// True once a shutdown has been requested
	pub fn is_requested(self) -> bool {
		!matches!(self, ShutdownPhase::Running)
	}

	/// True once the channel close has been issued
	pub fn rejects_posts(self) -> bool {
		matches!(self, ShutdownPhase::Closing | ShutdownPhase::Complete)
	}
}

pub(crate) struct CoreState<T> {
	pub(crate) channel_state: ChannelState,
	pub(crate) queue_name: Option<ArcStr>,
	pub(crate) subscriptions: SubscriptionTable<T>,
	pub(crate) last_messages: LastMessages,
	pub(crate) pending: PendingPosts,
	pub(crate) shutdown: ShutdownPhase,
}

impl<T> CoreState<T> {
	/// Moves a requested shutdown to `Closing` once nothing is left to
	/// publish. Returns true if the channel should be closed now.
	fn check_shutdown(&mut self) -> bool {
		if self.shutdown == ShutdownPhase::Requested && self.pending.is_empty() {
			self.shutdown = ShutdownPhase::Closing;
			return true;
		}
		false
	}
}

/// Everything one wrapper owns apart from its lifecycle task.
///
/// The mutex guards plain data only. It is never held across an `.await` and
/// is released before subscriber callbacks run, so callbacks may call back
/// into the wrapper.
pub(crate) struct ExchangeCore<T, F> {
	identity: ArcStr,
	config: ExchangeConfig,
	exchange: ArcStr,
	channel: Arc<dyn BrokerChannel>,
	serializer: F,
	state: Mutex<CoreState<T>>,
	commands: mpsc::UnboundedSender<LifecycleCommand>,
	shutdown_tx: watch::Sender<bool>,
}

impl<T, F> ExchangeCore<T, F>
where
	T: Send + 'static,
	F: MessageSerializer<T>,
{
	pub(crate) fn new(
		identity: ArcStr,
		config: ExchangeConfig,
		channel: Arc<dyn BrokerChannel>,
		serializer: F,
		commands: mpsc::UnboundedSender<LifecycleCommand>,
	) -> Result<Self, BroadcastError> {
		let cache_size = config.settings.match_cache_capacity()?;
		let (shutdown_tx, _) = watch::channel(false);
		Ok(Self {
			identity,
			exchange: ArcStr::from(config.exchange_name.as_str()),
			state: Mutex::new(CoreState {
				channel_state: ChannelState::Closed,
				queue_name: None,
				subscriptions: SubscriptionTable::new(
					cache_size,
					config.settings.case_insensitive_patterns,
				),
				last_messages: LastMessages::default(),
				pending: PendingPosts::new(),
				shutdown: ShutdownPhase::Running,
			}),
			config,
			channel,
			serializer,
			commands,
			shutdown_tx,
		})
	}

	pub(crate) fn lock(&self) -> MutexGuard<'_, CoreState<T>> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	pub(crate) fn identity(&self) -> &ArcStr {
		&self.identity
	}

	pub(crate) fn config(&self) -> &ExchangeConfig {
		&self.config
	}

	pub(crate) fn exchange(&self) -> &ArcStr {
		&self.exchange
	}

	pub(crate) fn channel(&self) -> &Arc<dyn BrokerChannel> {
		&self.channel
	}

	fn request_close(&self) {
		debug!(exchange = %self.exchange, "Pending posts drained, closing channel");
		if self.commands.send(LifecycleCommand::Close).is_err() {
			warn!(
				exchange = %self.exchange,
				"Lifecycle task is gone, channel close not issued"
			);
		}
	}

	/// Encodes `value`, buffers it and flushes if the channel is open.
	pub(crate) fn post(&self, topic: &str, value: &T) -> Result<(), BroadcastError> {
		validate_routing_key(topic)?;
		let payload = self
			.serializer
			.serialize(value)
			.map_err(|e| BroadcastError::Encode(format!("{e:?}")))?;

		let mut state = self.lock();
		if state.shutdown.rejects_posts() {
			return Err(BroadcastError::ShutDown);
		}
		state.pending.enqueue(ArcStr::from(topic), Bytes::from(payload));
		let flushed = if state.channel_state.is_open() {
			state.pending.flush(self.channel.as_ref(), &self.exchange)
		} else {
			debug!(
				exchange = %self.exchange,
				topic,
				pending = state.pending.len(),
				"Channel not open, post buffered"
			);
			Ok(0)
		};
		let close = state.check_shutdown();
		drop(state);

		if close {
			self.request_close();
		}
		flushed.map(|_| ())
	}

	/// Registers `callback` for `pattern`. New patterns are handed to the
	/// lifecycle task for binding.
	pub(crate) fn subscribe(
		&self,
		pattern: &str,
		callback: Callback<T>,
	) -> Result<(), BroadcastError> {
		let pattern = ArcStr::from(pattern);
		let fresh = self.lock().subscriptions.subscribe(pattern.clone(), callback)?;
		if fresh {
			debug!(exchange = %self.exchange, pattern = %pattern, "New topic pattern");
			if self.commands.send(LifecycleCommand::Bind(pattern)).is_err() {
				warn!(
					exchange = %self.exchange,
					"Lifecycle task is gone, pattern will not be bound"
				);
			}
		}
		Ok(())
	}

	/// Acknowledges the delivery retained for `pattern`, if any
	pub(crate) fn ack(&self, pattern: &str) -> Result<(), BroadcastError> {
		let Some(delivery) = self.lock().last_messages.take(pattern) else {
			return Ok(());
		};
		debug!(
			pattern,
			routing_key = %delivery.routing_key,
			delivery_tag = delivery.delivery_tag,
			"Acknowledging message"
		);
		self.channel.ack(&delivery)?;
		Ok(())
	}

	/// Records the shutdown request and closes right away unless posts are
	/// still waiting for an open sequence to finish.
	pub(crate) fn request_shutdown(&self) -> watch::Receiver<bool> {
		let receiver = self.shutdown_tx.subscribe();
		let mut state = self.lock();
		if state.shutdown.is_requested() {
			return receiver;
		}
		info!(exchange = %self.exchange, "Shutdown requested");
		state.shutdown = ShutdownPhase::Requested;
		let close = if state.channel_state == ChannelState::Closed {
			if !state.pending.is_empty() {
				warn!(
					exchange = %self.exchange,
					dropped = state.pending.len(),
					"Channel is closed, pending posts will not be published"
				);
				state.pending = PendingPosts::new();
			}
			state.shutdown = ShutdownPhase::Closing;
			true
		} else {
			state.check_shutdown()
		};
		drop(state);

		if close {
			self.request_close();
		}
		receiver
	}

	/// Marks the shutdown complete. Returns false if none was requested.
	pub(crate) fn complete_shutdown(&self) -> bool {
		let mut state = self.lock();
		if !state.shutdown.is_requested() {
			return false;
		}
		state.shutdown = ShutdownPhase::Complete;
		drop(state);
		info!(exchange = %self.exchange, "Shutdown complete");
		self.shutdown_tx.send_replace(true);
		true
	}

	pub(crate) fn shutdown_phase(&self) -> ShutdownPhase {
		self.lock().shutdown
	}

	pub(crate) fn channel_state(&self) -> ChannelState {
		self.lock().channel_state
	}

	pub(crate) fn set_channel_state(&self, channel_state: ChannelState) {
		self.lock().channel_state = channel_state;
	}

	/// Finishes an open sequence: the channel becomes usable and everything
	/// buffered while it was not is published.
	pub(crate) fn channel_opened(&self) {
		let mut state = self.lock();
		state.channel_state = ChannelState::Open;
		let flushed = state.pending.flush(self.channel.as_ref(), &self.exchange);
		let close = state.check_shutdown();
		drop(state);

		match flushed {
			| Ok(0) => {}
			| Ok(sent) => {
				info!(exchange = %self.exchange, sent, "Published buffered posts")
			}
			| Err(err) => {
				error!(exchange = %self.exchange, error = %err, "Failed to flush buffered posts")
			}
		}
		if close {
			self.request_close();
		}
	}

	/// The channel stopped being usable. Retained deliveries can no longer
	/// be acknowledged.
	pub(crate) fn channel_closed(&self) {
		let mut state = self.lock();
		state.channel_state = ChannelState::Closed;
		state.last_messages.clear();
	}

	pub(crate) fn set_queue_name(&self, queue: ArcStr) {
		self.lock().queue_name = Some(queue);
	}

	pub(crate) fn patterns(&self) -> Vec<ArcStr> {
		self.lock().subscriptions.patterns()
	}

	/// Decodes a delivery and notifies every subscriber whose pattern
	/// accepts its routing key.
	pub(crate) fn dispatch(&self, delivery: Delivery) {
		let value = match self.serializer.deserialize(&delivery.payload) {
			| Ok(value) => Some(value),
			| Err(err) => {
				let queue = self.lock().queue_name.clone();
				warn!(
					exchange = %self.exchange,
					queue = ?queue,
					routing_key = %delivery.routing_key,
					error = ?err,
					"Broadcast message parsing error, message dropped"
				);
				None
			}
		};

		if let Some(value) = value {
			let matched = {
				let mut state = self.lock();
				let matched = state.subscriptions.matching(&delivery.routing_key);
				if self.config.requires_ack() {
					for subscription in &matched {
						state
							.last_messages
							.retain(subscription.pattern.clone(), delivery.clone());
					}
				}
				matched
			};
			if matched.is_empty() {
				debug!(routing_key = %delivery.routing_key, "No pattern matched delivery");
			}
			for subscription in matched {
				for callback in &subscription.callbacks {
					callback(delivery.routing_key.as_str(), &value);
				}
			}
		}

		let close = self.lock().check_shutdown();
		if close {
			self.request_close();
		}
	}
}
