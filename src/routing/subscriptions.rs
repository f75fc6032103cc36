use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use arcstr::ArcStr;
use lru::LruCache;
use smallvec::SmallVec;

use crate::broker::Delivery;
use crate::topic::{TopicPattern, TopicPatternError};

/// Subscriber callback, invoked with the routing key and decoded payload
pub type Callback<T> = Arc<dyn Fn(&str, &T) + Send + Sync>;

type MatchedIndices = SmallVec<[usize; 4]>;

/// One subscribed pattern with its compiled matcher and callbacks
pub struct Subscription<T> {
	pattern: TopicPattern,
	callbacks: Vec<Callback<T>>,
}

impl<T> Subscription<T> {
	/// The compiled pattern
	pub fn pattern(&self) -> &TopicPattern {
		&self.pattern
	}

	/// Number of registered callbacks
	pub fn callback_count(&self) -> usize {
		self.callbacks.len()
	}
}

/// Callbacks to notify for one matching pattern, detached from the table
pub struct MatchedSubscription<T> {
	/// Pattern that accepted the routing key
	pub pattern: ArcStr,
	/// Callbacks registered for that pattern, in registration order
	pub callbacks: Vec<Callback<T>>,
}

/// Subscriptions keyed by pattern, in registration order.
///
/// Each distinct pattern string is compiled exactly once. Lookups by routing
/// key go through an LRU cache that is reset whenever a new pattern arrives.
pub struct SubscriptionTable<T> {
	subscriptions: Vec<Subscription<T>>,
	index: HashMap<ArcStr, usize>,
	match_cache: LruCache<ArcStr, MatchedIndices>,
	case_insensitive: bool,
}

impl<T> SubscriptionTable<T> {
	/// Creates an empty table
	pub fn new(cache_capacity: NonZeroUsize, case_insensitive: bool) -> Self {
		Self {
			subscriptions: Vec::new(),
			index: HashMap::new(),
			match_cache: LruCache::new(cache_capacity),
			case_insensitive,
		}
	}

	/// Adds a callback for `pattern`.
	///
	/// Returns `true` if the pattern was not known before and has just been
	/// compiled; a known pattern only gains another callback.
	pub fn subscribe(
		&mut self,
		pattern: ArcStr,
		callback: Callback<T>,
	) -> Result<bool, TopicPatternError> {
		if let Some(&position) = self.index.get(&pattern) {
			self.subscriptions[position].callbacks.push(callback);
			return Ok(false);
		}
		let compiled =
			TopicPattern::compile_with(pattern.clone(), self.case_insensitive)?;
		self.index.insert(pattern, self.subscriptions.len());
		self.subscriptions.push(Subscription {
			pattern: compiled,
			callbacks: vec![callback],
		});
		self.match_cache.clear();
		Ok(true)
	}

	/// Looks up a subscription by its pattern string
	pub fn get(&self, pattern: &str) -> Option<&Subscription<T>> {
		self.index.get(pattern).map(|&i| &self.subscriptions[i])
	}

	/// Registered patterns, in registration order
	pub fn patterns(&self) -> Vec<ArcStr> {
		self.subscriptions
			.iter()
			.map(|s| s.pattern.pattern().clone())
			.collect()
	}

	/// Number of distinct patterns
	pub fn len(&self) -> usize {
		self.subscriptions.len()
	}

	/// Returns true if no pattern is registered
	pub fn is_empty(&self) -> bool {
		self.subscriptions.is_empty()
	}

	/// Collects every subscription whose pattern accepts `routing_key`
	pub fn matching(&mut self, routing_key: &str) -> Vec<MatchedSubscription<T>> {
		let indices = match self.match_cache.get(routing_key) {
			| Some(cached) => cached.clone(),
			| None => {
				let found: MatchedIndices = self
					.subscriptions
					.iter()
					.enumerate()
					.filter(|(_, s)| s.pattern.matches(routing_key))
					.map(|(i, _)| i)
					.collect();
				self.match_cache
					.put(ArcStr::from(routing_key), found.clone());
				found
			}
		};
		indices
			.into_iter()
			.map(|i| {
				let subscription = &self.subscriptions[i];
				MatchedSubscription {
					pattern: subscription.pattern.pattern().clone(),
					callbacks: subscription.callbacks.clone(),
				}
			})
			.collect()
	}
}

impl<T> fmt::Debug for SubscriptionTable<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SubscriptionTable")
			.field("patterns", &self.patterns())
			.field("cached_keys", &self.match_cache.len())
			.finish()
	}
}

/// Most recent unacknowledged delivery per pattern
#[derive(Debug, Default)]
pub struct LastMessages {
	retained: HashMap<ArcStr, Delivery>,
}

impl LastMessages {
	/// Retains `delivery` for `pattern`, returning the one it supersedes.
	///
	/// The superseded delivery is not acknowledged.
	pub fn retain(
		&mut self,
		pattern: ArcStr,
		delivery: Delivery,
	) -> Option<Delivery> {
		self.retained.insert(pattern, delivery)
	}

	/// Removes and returns the retained delivery for `pattern`
	pub fn take(&mut self, pattern: &str) -> Option<Delivery> {
		self.retained.remove(pattern)
	}

	/// Drops every retained delivery
	pub fn clear(&mut self) {
		self.retained.clear();
	}

	/// Number of patterns with a retained delivery
	pub fn len(&self) -> usize {
		self.retained.len()
	}

	/// Returns true if nothing is retained
	pub fn is_empty(&self) -> bool {
		self.retained.is_empty()
	}
}
