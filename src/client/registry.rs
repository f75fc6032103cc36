use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arcstr::ArcStr;
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::config::{ConnectionConfig, ExchangeConfig};
use super::error::BroadcastError;
use super::exchange::ExchangeWrapper;
use crate::broker::{BrokerConnection, BrokerError, ConnectionFactory};
use crate::message_serializer::{BincodeSerializer, MessageSerializer};

/// Owner of live exchange wrappers and the connections they share.
///
/// Wrappers are memoized by identity, `exchange#queue`. A config without a
/// queue name gets a fresh sequence number as its queue part, so each such
/// request creates its own wrapper. Wrappers asking for equal
/// [`ConnectionConfig`]s share one connection.
pub struct ExchangeRegistry<T, F = BincodeSerializer> {
	factory: Arc<dyn ConnectionFactory>,
	serializer: F,
	connections: Mutex<HashMap<ConnectionConfig, Arc<dyn BrokerConnection>>>,
	exchanges: Mutex<HashMap<ArcStr, ExchangeWrapper<T, F>>>,
	client_count: AtomicUsize,
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T, F> ExchangeRegistry<T, F>
where
	T: Send + 'static,
	F: MessageSerializer<T>,
{
	/// Creates a registry that opens connections through `factory` and
	/// encodes payloads with the default serializer
	pub fn new(factory: impl ConnectionFactory) -> Self {
		Self::with_serializer(factory, F::default())
	}

	/// Creates a registry with an explicit serializer
	pub fn with_serializer(factory: impl ConnectionFactory, serializer: F) -> Self {
		Self {
			factory: Arc::new(factory),
			serializer,
			connections: Mutex::new(HashMap::new()),
			exchanges: Mutex::new(HashMap::new()),
			client_count: AtomicUsize::new(0),
		}
	}

	fn identity_for(&self, config: &ExchangeConfig) -> ArcStr {
		if config.queue_name.is_empty() {
			let client = self.client_count.fetch_add(1, Ordering::Relaxed);
			arcstr::format!("{}#{}", config.exchange_name, client)
		} else {
			arcstr::format!("{}#{}", config.exchange_name, config.queue_name)
		}
	}

	fn connection_for(
		&self,
		config: &ConnectionConfig,
		fresh: bool,
	) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
		let mut connections = lock(&self.connections);
		if !fresh {
			if let Some(connection) = connections.get(config) {
				return Ok(connection.clone());
			}
		}
		info!(host = %config.host, "Opening broker connection");
		let connection = self.factory.connect(config)?;
		connections.insert(config.clone(), connection.clone());
		Ok(connection)
	}

	/// Returns the wrapper for this exchange and queue, creating it on
	/// first request.
	///
	/// A cached wrapper whose shutdown completed is replaced. Must be called
	/// within a tokio runtime.
	pub fn get_exchange(
		&self,
		connection: &ConnectionConfig,
		exchange: impl Into<ExchangeConfig>,
	) -> Result<ExchangeWrapper<T, F>, BroadcastError> {
		let config = exchange.into();
		let identity = self.identity_for(&config);

		let mut exchanges = lock(&self.exchanges);
		if let Some(existing) = exchanges.get(&identity) {
			if !existing.is_terminated() {
				return Ok(existing.clone());
			}
			debug!(identity = %identity, "Replacing terminated exchange wrapper");
		}

		let wrapper = match ExchangeWrapper::with_identity(
			identity.clone(),
			self.connection_for(connection, false)?,
			config.clone(),
			self.serializer.clone(),
		) {
			| Err(BroadcastError::Broker(BrokerError::ConnectionClosed)) => {
				warn!(host = %connection.host, "Cached connection is closed, reconnecting");
				ExchangeWrapper::with_identity(
					identity.clone(),
					self.connection_for(connection, true)?,
					config,
					self.serializer.clone(),
				)?
			}
			| result => result?,
		};
		exchanges.insert(identity, wrapper.clone());
		Ok(wrapper)
	}

	/// Returns the cached wrapper with this identity
	pub fn lookup(&self, identity: &str) -> Option<ExchangeWrapper<T, F>> {
		lock(&self.exchanges).get(identity).cloned()
	}

	/// Removes a wrapper from the cache without shutting it down
	pub fn evict(&self, identity: &str) -> Option<ExchangeWrapper<T, F>> {
		lock(&self.exchanges).remove(identity)
	}

	/// Number of cached wrappers
	pub fn len(&self) -> usize {
		lock(&self.exchanges).len()
	}

	/// Returns true if no wrapper is cached
	pub fn is_empty(&self) -> bool {
		lock(&self.exchanges).is_empty()
	}

	/// Shuts down every cached wrapper and waits for all of them.
	///
	/// The cache and the connection pool are emptied first, so wrappers
	/// requested afterwards start from scratch.
	pub async fn shutdown_all(&self) -> Result<(), BroadcastError> {
		let wrappers: Vec<_> = lock(&self.exchanges).drain().map(|(_, w)| w).collect();
		lock(&self.connections).clear();
		info!(count = wrappers.len(), "Shutting down all exchange wrappers");

		let signals = wrappers.iter().map(|wrapper| wrapper.shutdown().wait());
		join_all(signals).await.into_iter().collect()
	}
}
