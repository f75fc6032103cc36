#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use amqp_broadcast::broker::{BrokerOperation, MemoryBroker, MemoryConnection};
use amqp_broadcast::{ExchangeConfig, ExchangeWrapper};
use bincode::{Decode, Encode};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::{sleep, timeout};

pub const WAIT: Duration = Duration::from_secs(2);

#[derive(Encode, Decode, Debug, Clone, PartialEq)]
pub struct Note {
	pub id: u32,
	pub text: String,
}

pub fn note(id: u32) -> Note {
	Note {
		id,
		text: format!("note {id}"),
	}
}

pub type Wrapper = ExchangeWrapper<Note>;

pub fn wrapper(
	connection: &Arc<MemoryConnection>,
	config: impl Into<ExchangeConfig>,
) -> Wrapper {
	ExchangeWrapper::new(connection.clone(), config, Default::default())
		.expect("wrapper creation failed")
}

/// Polls `condition` until it holds, failing the test after [`WAIT`]
pub async fn eventually(mut condition: impl FnMut() -> bool) {
	timeout(WAIT, async {
		while !condition() {
			sleep(Duration::from_millis(2)).await;
		}
	})
	.await
	.expect("condition not reached in time");
}

/// Callback forwarding every notification into a channel
pub fn recorder() -> (
	impl Fn(&str, &Note) + Clone + Send + Sync + 'static,
	UnboundedReceiver<(String, Note)>,
) {
	let (tx, rx) = mpsc::unbounded_channel();
	let callback = move |key: &str, value: &Note| {
		let _ = tx.send((key.to_string(), value.clone()));
	};
	(callback, rx)
}

pub async fn next<T>(rx: &mut UnboundedReceiver<T>) -> T {
	timeout(WAIT, rx.recv())
		.await
		.expect("timed out waiting for a message")
		.expect("recorder closed")
}

pub fn count_ops(
	broker: &MemoryBroker,
	predicate: impl Fn(&BrokerOperation) -> bool,
) -> usize {
	broker.operations().iter().filter(|op| predicate(op)).count()
}

pub fn position(
	broker: &MemoryBroker,
	predicate: impl Fn(&BrokerOperation) -> bool,
) -> Option<usize> {
	broker.operations().iter().position(predicate)
}
