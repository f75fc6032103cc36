use std::future::{Future, IntoFuture};
use std::pin::Pin;

use tokio::sync::watch;

use super::error::BroadcastError;

/// Completion signal returned by [`ExchangeWrapper::shutdown`].
///
/// Resolves once, when the connection reports a disconnect after the
/// wrapper's pending posts drained and its channel closed. Every call to
/// `shutdown` on the same wrapper yields a signal for the same completion.
///
/// [`ExchangeWrapper::shutdown`]: crate::ExchangeWrapper::shutdown
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
	receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
	pub(crate) fn new(receiver: watch::Receiver<bool>) -> Self {
		Self { receiver }
	}

	/// Returns true if the shutdown already completed
	pub fn is_complete(&self) -> bool {
		*self.receiver.borrow()
	}

	/// Waits for the shutdown to complete.
	///
	/// Fails with [`BroadcastError::ShutdownInterrupted`] if the wrapper is
	/// dropped first.
	pub async fn wait(mut self) -> Result<(), BroadcastError> {
		self.receiver
			.wait_for(|complete| *complete)
			.await
			.map(|_| ())
			.map_err(|_| BroadcastError::ShutdownInterrupted)
	}
}

impl IntoFuture for ShutdownSignal {
	type Output = Result<(), BroadcastError>;
	type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

	fn into_future(self) -> Self::IntoFuture {
		Box::pin(self.wait())
	}
}
