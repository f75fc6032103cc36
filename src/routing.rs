//! Channel lifecycle, outbound buffering and inbound dispatch
//!
//! Everything behind an [`ExchangeWrapper`](crate::ExchangeWrapper): the
//! ordered buffer of posts waiting for an open channel, the table of
//! subscribed patterns with their callbacks, and the single task that reacts
//! to channel transitions and re-establishes topology on every reconnect.

pub(crate) mod exchange_core;
/// Channel state machine and the task driving it
pub mod lifecycle;
/// Outbound post buffer
pub mod pending_posts;
/// Pattern subscriptions and retained deliveries
pub mod subscriptions;

pub use exchange_core::ShutdownPhase;
pub use lifecycle::ChannelState;
pub use pending_posts::{PendingPost, PendingPosts};
pub use subscriptions::{
	Callback, LastMessages, MatchedSubscription, Subscription, SubscriptionTable,
};

pub(crate) use exchange_core::ExchangeCore;
pub(crate) use lifecycle::LifecycleActor;
