use std::collections::HashSet;
use std::sync::{Arc, Weak};

use arcstr::ArcStr;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::exchange_core::ExchangeCore;
use crate::broker::{
	BrokerChannel, BrokerError, ChannelEvent, ChannelEvents, ExchangeKind,
};
use crate::message_serializer::MessageSerializer;

/// Observable state of the wrapper's channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
	/// No usable channel
	Closed,
	/// Channel usable, topology being (re)established
	Opening,
	/// Topology established; posts publish directly
	Open,
	/// Close issued by a shutdown
	Closing,
}

impl ChannelState {
	/// Snapshot predicate: posts are published rather than buffered
	pub fn is_open(self) -> bool {
		matches!(self, ChannelState::Open)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LifecycleCommand {
	Bind(ArcStr),
	Close,
}

/// Topology established on the current channel session
#[derive(Debug, Default)]
struct Session {
	queue: Option<ArcStr>,
	bound: HashSet<ArcStr>,
}

/// Single task driving one wrapper's channel.
///
/// Channel transitions, deliveries, bind/close commands and connection
/// disconnects are all handled here, one at a time.
pub(crate) struct LifecycleActor<T, F> {
	core: Weak<ExchangeCore<T, F>>,
	channel: Arc<dyn BrokerChannel>,
	exclusive_queue: bool,
	events: ChannelEvents,
	events_done: bool,
	commands: mpsc::UnboundedReceiver<LifecycleCommand>,
	disconnects: broadcast::Receiver<()>,
	disconnects_done: bool,
	session: Session,
	closed: bool,
}

impl<T, F> LifecycleActor<T, F>
where
	T: Send + 'static,
	F: MessageSerializer<T>,
{
	pub(crate) fn spawn(
		core: &Arc<ExchangeCore<T, F>>,
		events: ChannelEvents,
		commands: mpsc::UnboundedReceiver<LifecycleCommand>,
		disconnects: broadcast::Receiver<()>,
	) -> JoinHandle<()> {
		let actor = Self {
			core: Arc::downgrade(core),
			channel: core.channel().clone(),
			exclusive_queue: core.config().queue_options.exclusive,
			events,
			events_done: false,
			commands,
			disconnects,
			disconnects_done: false,
			session: Session::default(),
			closed: false,
		};
		tokio::spawn(actor.run())
	}

	async fn run(mut self) {
		loop {
			tokio::select! {
				event = self.events.recv(), if !self.events_done => match event {
					| Some(event) => self.handle_event(event).await,
					| None => {
						debug!("Channel event stream ended");
						self.events_done = true;
					}
				},
				command = self.commands.recv() => match command {
					| Some(LifecycleCommand::Bind(pattern)) => self.handle_bind(pattern).await,
					| Some(LifecycleCommand::Close) => self.handle_close().await,
					| None => {
						debug!("Exchange wrapper dropped, stopping lifecycle task");
						self.handle_close().await;
						break;
					}
				},
				result = self.disconnects.recv(), if !self.disconnects_done => {
					if let Err(RecvError::Closed) = result {
						self.disconnects_done = true;
					}
					if self.handle_disconnect().await {
						break;
					}
				}
			}
		}
	}

	async fn handle_event(&mut self, event: ChannelEvent) {
		match event {
			| ChannelEvent::Opened => self.handle_opened().await,
			| ChannelEvent::Closed => self.handle_closed(),
			| ChannelEvent::Delivery(delivery) => {
				if let Some(core) = self.core.upgrade() {
					core.dispatch(delivery);
				}
			}
		}
	}

	async fn handle_opened(&mut self) {
		if self.closed {
			return;
		}
		let Some(core) = self.core.upgrade() else {
			return;
		};
		self.session = Session::default();
		core.set_channel_state(ChannelState::Opening);
		debug!(exchange = %core.exchange(), "Channel opened, establishing topology");

		match self.open_sequence(&core).await {
			| Ok(()) => {
				info!(
					exchange = %core.exchange(),
					queue = ?self.session.queue,
					patterns = self.session.bound.len(),
					"Exchange ready"
				);
				core.channel_opened();
			}
			| Err(err) => {
				error!(
					exchange = %core.exchange(),
					error = %err,
					"Failed to establish exchange topology"
				);
				core.set_channel_state(ChannelState::Closed);
			}
		}
	}

	async fn open_sequence(
		&mut self,
		core: &ExchangeCore<T, F>,
	) -> Result<(), BrokerError> {
		let config = core.config();
		debug!(
			exchange = %core.exchange(),
			options = ?config.exchange_options,
			"Asserting exchange"
		);
		self.channel
			.assert_exchange(
				&config.exchange_name,
				ExchangeKind::Topic,
				&config.exchange_options,
			)
			.await?;

		let patterns = core.patterns();
		if patterns.is_empty() {
			debug!(exchange = %core.exchange(), "No patterns registered, queue not declared");
			return Ok(());
		}
		let queue = self.declare_queue(core).await?;
		debug!(
			exchange = %core.exchange(),
			queue = %queue,
			count = patterns.len(),
			"Binding topic patterns"
		);
		for pattern in patterns {
			self.bind(core, &queue, pattern).await?;
		}
		Ok(())
	}

	async fn declare_queue(
		&mut self,
		core: &ExchangeCore<T, F>,
	) -> Result<ArcStr, BrokerError> {
		let config = core.config();
		let queue = self
			.channel
			.assert_queue(&config.queue_name, &config.queue_options)
			.await?;
		if let Some(count) = config.prefetch {
			self.channel.prefetch(count).await?;
		}
		core.set_queue_name(queue.clone());
		debug!(
			queue = %queue,
			options = ?config.consume_options,
			"Queue declared, consuming messages"
		);
		self.channel.consume(&queue, &config.consume_options).await?;
		self.session.queue = Some(queue.clone());
		Ok(queue)
	}

	async fn bind(
		&mut self,
		core: &ExchangeCore<T, F>,
		queue: &str,
		pattern: ArcStr,
	) -> Result<(), BrokerError> {
		if self.session.bound.contains(&pattern) {
			return Ok(());
		}
		self.channel
			.bind_queue(queue, core.exchange(), &pattern)
			.await?;
		self.session.bound.insert(pattern);
		Ok(())
	}

	async fn handle_bind(&mut self, pattern: ArcStr) {
		let Some(core) = self.core.upgrade() else {
			return;
		};
		if !core.channel_state().is_open() {
			debug!(pattern = %pattern, "Channel not open, binding on next open");
			return;
		}
		match self.bind_late(&core, pattern.clone()).await {
			| Ok(()) => debug!(pattern = %pattern, "Pattern bound"),
			| Err(err) => error!(
				exchange = %core.exchange(),
				pattern = %pattern,
				error = %err,
				"Failed to bind topic pattern"
			),
		}
	}

	/// Binds a pattern registered after the open sequence, declaring the
	/// queue first if no pattern existed when the channel opened.
	async fn bind_late(
		&mut self,
		core: &ExchangeCore<T, F>,
		pattern: ArcStr,
	) -> Result<(), BrokerError> {
		let queue = match self.session.queue.clone() {
			| Some(queue) => queue,
			| None => self.declare_queue(core).await?,
		};
		self.bind(core, &queue, pattern).await
	}

	fn handle_closed(&mut self) {
		self.session = Session::default();
		if let Some(core) = self.core.upgrade() {
			info!(exchange = %core.exchange(), "Channel closed");
			core.channel_closed();
		}
	}

	/// Deletes the session's exclusive queue, then closes the channel for good.
	async fn handle_close(&mut self) {
		if self.closed {
			return;
		}
		self.closed = true;
		let core = self.core.upgrade();
		if let Some(core) = &core {
			core.set_channel_state(ChannelState::Closing);
		}

		if self.exclusive_queue {
			if let Some(queue) = self.session.queue.take() {
				debug!(queue = %queue, "Deleting temporary queue");
				if let Err(err) = self.channel.delete_queue(&queue).await {
					warn!(queue = %queue, error = %err, "Failed to delete temporary queue");
				}
			}
		}
		if let Err(err) = self.channel.close().await {
			warn!(error = %err, "Failed to close channel");
		}
		self.session = Session::default();
		if let Some(core) = &core {
			core.channel_closed();
		}
	}

	/// Returns true once the wrapper's shutdown has completed.
	async fn handle_disconnect(&mut self) -> bool {
		let Some(core) = self.core.upgrade() else {
			return true;
		};
		if !core.shutdown_phase().is_requested() {
			warn!(exchange = %core.exchange(), "Connection lost, waiting for reconnect");
			return false;
		}
		self.handle_close().await;
		core.complete_shutdown();
		true
	}
}
