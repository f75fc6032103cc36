mod common;

use std::time::Duration;

use amqp_broadcast::broker::{BrokerError, BrokerOperation, MemoryBroker, QueueOptions};
use amqp_broadcast::{BroadcastError, ChannelState, ExchangeConfig};
use bytes::Bytes;
use common::*;
use tokio::time::{sleep, timeout};

#[tokio::test]
async fn hash_suffix_pattern_receives_exact_key_and_payload() {
	let broker = MemoryBroker::new();
	let connection = broker.open_connection();
	let exchange = wrapper(&connection, "messages");
	let (callback, mut received) = recorder();

	exchange.on("msg.#", callback).unwrap();
	eventually(|| exchange.is_open()).await;
	exchange.post("msg.test.yolo", &note(1)).unwrap();

	assert_eq!(next(&mut received).await, ("msg.test.yolo".to_string(), note(1)));
}

#[tokio::test]
async fn star_pattern_rejects_wrong_segment_count() {
	let broker = MemoryBroker::new();
	let connection = broker.open_connection();
	let exchange = wrapper(&connection, "messages");
	let (callback, mut received) = recorder();

	exchange.on("*.*.yolo", callback).unwrap();
	eventually(|| exchange.is_open()).await;
	exchange.post("a.b.yolo", &note(1)).unwrap();
	exchange.post("a.yolo", &note(2)).unwrap();
	exchange.post("c.d.yolo", &note(3)).unwrap();

	assert_eq!(next(&mut received).await.0, "a.b.yolo");
	assert_eq!(next(&mut received).await.0, "c.d.yolo");
}

#[tokio::test]
async fn overlapping_patterns_each_fire_once() {
	let broker = MemoryBroker::new();
	let connection = broker.open_connection();
	let exchange = wrapper(&connection, "messages");
	let (all, mut all_rx) = recorder();
	let (msg, mut msg_rx) = recorder();

	exchange.on("#", all).unwrap();
	exchange.on("msg.#", msg).unwrap();
	eventually(|| exchange.is_open()).await;
	exchange.post("msg.x", &note(1)).unwrap();
	exchange.post("other", &note(2)).unwrap();

	assert_eq!(next(&mut all_rx).await.0, "msg.x");
	assert_eq!(next(&mut msg_rx).await.0, "msg.x");
	assert_eq!(next(&mut all_rx).await.0, "other");
	assert!(msg_rx.try_recv().is_err(), "msg.# must fire once and only for msg.x");
}

#[tokio::test]
async fn posts_buffered_while_closed_are_published_in_order_once() {
	let broker = MemoryBroker::new();
	let connection = broker.open_connection();
	connection.drop_connection();
	let exchange = wrapper(&connection, "messages");

	for (id, topic) in ["p1", "p2", "p3"].into_iter().enumerate() {
		exchange.post(topic, &note(id as u32)).unwrap();
	}
	sleep(Duration::from_millis(20)).await;
	assert!(broker.published_keys().is_empty());
	assert_eq!(exchange.pending_posts(), 3);
	assert!(!exchange.is_open());

	connection.reconnect();
	eventually(|| broker.published_keys().len() == 3).await;
	assert_eq!(broker.published_keys(), vec!["p1", "p2", "p3"]);
	assert_eq!(exchange.pending_posts(), 0);

	sleep(Duration::from_millis(20)).await;
	assert_eq!(broker.published_keys().len(), 3, "posts must be published exactly once");
}

#[tokio::test]
async fn duplicate_subscription_binds_once_and_keeps_both_callbacks() {
	let broker = MemoryBroker::new();
	let connection = broker.open_connection();
	let exchange = wrapper(&connection, "messages");
	let (first, mut first_rx) = recorder();
	let (second, mut second_rx) = recorder();

	exchange.on("msg.#", first).unwrap();
	exchange.on("msg.#", second).unwrap();
	eventually(|| exchange.is_open()).await;
	exchange.post("msg.a", &note(1)).unwrap();

	assert_eq!(next(&mut first_rx).await.1, note(1));
	assert_eq!(next(&mut second_rx).await.1, note(1));
	assert_eq!(exchange.patterns(), vec!["msg.#"]);
	let binds = count_ops(&broker, |op| {
		matches!(op, BrokerOperation::Bind { pattern, .. } if pattern == "msg.#")
	});
	assert_eq!(binds, 1);
}

#[tokio::test]
async fn pattern_registered_while_open_is_bound_right_away() {
	let broker = MemoryBroker::new();
	let connection = broker.open_connection();
	let exchange = wrapper(&connection, "messages");
	let (callback, mut received) = recorder();

	exchange.on("a.*", |_, _| {}).unwrap();
	eventually(|| exchange.is_open()).await;
	let queue = exchange.queue_name().unwrap();

	exchange.on("b.*", callback).unwrap();
	eventually(|| broker.bindings(&queue).iter().any(|p| p == "b.*")).await;
	exchange.post("b.1", &note(7)).unwrap();

	assert_eq!(next(&mut received).await, ("b.1".to_string(), note(7)));
}

#[tokio::test]
async fn queue_is_declared_on_first_subscription_when_opened_without_patterns() {
	let broker = MemoryBroker::new();
	let connection = broker.open_connection();
	let exchange = wrapper(&connection, "messages");

	eventually(|| exchange.is_open()).await;
	assert!(exchange.queue_name().is_none());
	assert_eq!(
		count_ops(&broker, |op| matches!(op, BrokerOperation::AssertQueue { .. })),
		0
	);

	let (callback, mut received) = recorder();
	exchange.on("late.#", callback).unwrap();
	eventually(|| exchange.queue_name().is_some()).await;
	let queue = exchange.queue_name().unwrap();
	eventually(|| broker.bindings(&queue).len() == 1).await;

	exchange.post("late.arrival", &note(1)).unwrap();
	assert_eq!(next(&mut received).await.0, "late.arrival");
}

#[tokio::test]
async fn open_sequence_declares_then_consumes_then_binds() {
	let broker = MemoryBroker::new();
	let connection = broker.open_connection();
	let config = ExchangeConfig::new("messages").with_prefetch(10);
	let exchange = wrapper(&connection, config);

	exchange.on("a.#", |_, _| {}).unwrap();
	exchange.on("b.#", |_, _| {}).unwrap();
	eventually(|| exchange.is_open()).await;

	let ops = broker.operations();
	let kinds: Vec<&str> = ops
		.iter()
		.map(|op| match op {
			| BrokerOperation::AssertExchange { .. } => "exchange",
			| BrokerOperation::AssertQueue { .. } => "queue",
			| BrokerOperation::Prefetch { count: 10 } => "prefetch",
			| BrokerOperation::Consume { .. } => "consume",
			| BrokerOperation::Bind { .. } => "bind",
			| _ => "other",
		})
		.collect();
	assert_eq!(kinds, vec!["exchange", "queue", "prefetch", "consume", "bind", "bind"]);
}

#[tokio::test]
async fn topology_is_reestablished_after_reconnect() {
	let broker = MemoryBroker::new();
	let connection = broker.open_connection();
	let exchange = wrapper(&connection, "messages");
	let (callback, mut received) = recorder();

	exchange.on("msg.#", callback).unwrap();
	eventually(|| exchange.is_open()).await;
	let first_queue = exchange.queue_name().unwrap();

	connection.drop_connection();
	eventually(|| exchange.channel_state() == ChannelState::Closed).await;
	assert!(!broker.has_queue(&first_queue));
	exchange.post("msg.while.down", &note(9)).unwrap();
	assert_eq!(exchange.pending_posts(), 1);

	connection.reconnect();
	eventually(|| exchange.is_open()).await;
	let second_queue = exchange.queue_name().unwrap();
	assert_ne!(first_queue, second_queue);
	assert_eq!(broker.bindings(&second_queue), vec!["msg.#"]);
	assert_eq!(next(&mut received).await, ("msg.while.down".to_string(), note(9)));
}

#[tokio::test]
async fn manual_ack_acknowledges_only_the_latest_delivery() {
	let broker = MemoryBroker::new();
	let connection = broker.open_connection();
	let exchange = wrapper(&connection, ExchangeConfig::new("jobs").with_manual_ack());
	let (callback, mut received) = recorder();

	exchange.on("job.#", callback).unwrap();
	eventually(|| exchange.is_open()).await;
	exchange.post("job.first", &note(1)).unwrap();
	exchange.post("job.second", &note(2)).unwrap();
	next(&mut received).await;
	next(&mut received).await;

	exchange.ack("job.#").unwrap();
	exchange.ack("job.#").unwrap();
	let acked: Vec<_> = broker
		.operations()
		.into_iter()
		.filter_map(|op| match op {
			| BrokerOperation::Ack { routing_key, .. } => Some(routing_key),
			| _ => None,
		})
		.collect();
	assert_eq!(acked, vec!["job.second"]);
}

#[tokio::test]
async fn delivery_matching_two_patterns_is_acked_once() {
	let broker = MemoryBroker::new();
	let connection = broker.open_connection();
	let exchange = wrapper(&connection, ExchangeConfig::new("jobs").with_manual_ack());
	let (callback, mut received) = recorder();

	exchange.on("job.#", callback.clone()).unwrap();
	exchange.on("job.*", callback).unwrap();
	eventually(|| exchange.is_open()).await;
	exchange.post("job.one", &note(1)).unwrap();
	next(&mut received).await;
	next(&mut received).await;

	exchange.ack("job.#").unwrap();
	assert!(matches!(
		exchange.ack("job.*"),
		Err(BroadcastError::Broker(BrokerError::Operation { operation: "ack", .. }))
	));
	assert_eq!(count_ops(&broker, |op| matches!(op, BrokerOperation::Ack { .. })), 1);
}

#[tokio::test]
async fn ack_without_retained_message_is_a_no_op() {
	let broker = MemoryBroker::new();
	let connection = broker.open_connection();
	let exchange = wrapper(&connection, "messages");
	let (callback, mut received) = recorder();

	exchange.on("msg.#", callback).unwrap();
	eventually(|| exchange.is_open()).await;
	exchange.post("msg.auto", &note(1)).unwrap();
	next(&mut received).await;

	exchange.ack("msg.#").unwrap();
	exchange.ack("never.subscribed").unwrap();
	assert_eq!(count_ops(&broker, |op| matches!(op, BrokerOperation::Ack { .. })), 0);
}

#[tokio::test]
async fn undecodable_message_is_dropped_and_dispatch_continues() {
	let broker = MemoryBroker::new();
	let connection = broker.open_connection();
	let exchange = wrapper(&connection, "messages");
	let (callback, mut received) = recorder();

	exchange.on("#", callback).unwrap();
	eventually(|| exchange.is_open()).await;
	assert_eq!(broker.inject("messages", "bad.payload", Bytes::new()), 1);
	exchange.post("good.payload", &note(5)).unwrap();

	assert_eq!(next(&mut received).await, ("good.payload".to_string(), note(5)));
}

#[tokio::test]
async fn publish_failure_is_returned_from_post() {
	let broker = MemoryBroker::new();
	let connection = broker.open_connection();
	let exchange = wrapper(&connection, "messages");
	eventually(|| exchange.is_open()).await;

	broker.fail_next_publishes(1);
	let err = exchange.post("msg.lost", &note(1)).unwrap_err();
	assert!(matches!(err, BroadcastError::Publish { dropped: 1, .. }));
	assert_eq!(exchange.pending_posts(), 0);

	exchange.post("msg.kept", &note(2)).unwrap();
	assert_eq!(broker.published_keys(), vec!["msg.kept"]);
}

#[tokio::test]
async fn failed_flush_on_open_drops_the_buffered_batch() {
	let broker = MemoryBroker::new();
	let connection = broker.open_connection();
	connection.drop_connection();
	let exchange = wrapper(&connection, "messages");
	for topic in ["q1", "q2", "q3"] {
		exchange.post(topic, &note(0)).unwrap();
	}

	broker.fail_next_publishes(1);
	connection.reconnect();
	eventually(|| exchange.is_open()).await;
	assert_eq!(exchange.pending_posts(), 0);
	assert!(broker.published_keys().is_empty());

	exchange.post("q4", &note(4)).unwrap();
	assert_eq!(broker.published_keys(), vec!["q4"]);
}

#[tokio::test]
async fn wildcard_characters_in_routing_key_are_published_literally() {
	let broker = MemoryBroker::new();
	let connection = broker.open_connection();
	let exchange = wrapper(&connection, "messages");
	eventually(|| exchange.is_open()).await;

	exchange.post("price.*", &note(1)).unwrap();
	exchange.post("tag.#", &note(2)).unwrap();
	assert_eq!(broker.published_keys(), vec!["price.*", "tag.#"]);
	assert_eq!(exchange.pending_posts(), 0);
}

#[tokio::test]
async fn overlong_routing_key_and_bad_pattern_are_rejected() {
	let broker = MemoryBroker::new();
	let connection = broker.open_connection();
	let exchange = wrapper(&connection, "messages");

	assert!(matches!(
		exchange.post(&"k".repeat(256), &note(1)),
		Err(BroadcastError::RoutingKey(_))
	));
	assert!(matches!(
		exchange.on("msg#", |_, _| {}),
		Err(BroadcastError::TopicPattern(_))
	));
	assert_eq!(exchange.pending_posts(), 0);
	assert!(exchange.patterns().is_empty());
}

#[tokio::test]
async fn hash_pattern_receives_key_with_zero_extra_segments() {
	let broker = MemoryBroker::new();
	let connection = broker.open_connection();
	let exchange = wrapper(&connection, "messages");
	let (callback, mut received) = recorder();

	exchange.on("msg.#", callback).unwrap();
	eventually(|| exchange.is_open()).await;
	exchange.post("msgs", &note(1)).unwrap();
	exchange.post("msg", &note(2)).unwrap();

	assert_eq!(next(&mut received).await, ("msg".to_string(), note(2)));
}

#[tokio::test]
async fn shutdown_deletes_exclusive_queue_before_closing() {
	let broker = MemoryBroker::new();
	let connection = broker.open_connection();
	let exchange = wrapper(&connection, "messages");

	exchange.on("msg.#", |_, _| {}).unwrap();
	eventually(|| exchange.is_open()).await;
	let queue = exchange.queue_name().unwrap();

	timeout(WAIT, exchange.shutdown()).await.unwrap().unwrap();
	assert!(exchange.is_terminated());
	assert!(!broker.has_queue(&queue));
	let deleted = position(&broker, |op| matches!(op, BrokerOperation::DeleteQueue { .. }));
	let closed = position(&broker, |op| matches!(op, BrokerOperation::CloseChannel));
	assert!(deleted.unwrap() < closed.unwrap());

	assert!(matches!(
		exchange.post("msg.late", &note(1)),
		Err(BroadcastError::ShutDown)
	));
}

#[tokio::test]
async fn shutdown_leaves_shared_queue_in_place() {
	let broker = MemoryBroker::new();
	let connection = broker.open_connection();
	let options = QueueOptions {
		exclusive: false,
		..QueueOptions::default()
	};
	let config = ExchangeConfig::new("messages").with_queue("shared.message.queue", options);
	let exchange = wrapper(&connection, config);

	exchange.on("msg.#", |_, _| {}).unwrap();
	eventually(|| exchange.is_open()).await;
	assert_eq!(exchange.queue_name().as_deref(), Some("shared.message.queue"));

	timeout(WAIT, exchange.shutdown()).await.unwrap().unwrap();
	assert!(broker.has_queue("shared.message.queue"));
	assert_eq!(
		count_ops(&broker, |op| matches!(op, BrokerOperation::DeleteQueue { .. })),
		0
	);
}

#[tokio::test]
async fn shutdown_waits_for_pending_posts_to_drain() {
	let broker = MemoryBroker::new();
	let connection = broker.open_connection();
	let held = broker.hold_declarations().await;
	let exchange = wrapper(&connection, "messages");

	exchange.post("drain.me", &note(1)).unwrap();
	eventually(|| exchange.channel_state() == ChannelState::Opening).await;
	let signal = exchange.shutdown();

	sleep(Duration::from_millis(20)).await;
	assert!(!signal.is_complete());
	assert_eq!(exchange.pending_posts(), 1);
	assert_eq!(count_ops(&broker, |op| matches!(op, BrokerOperation::CloseChannel)), 0);

	drop(held);
	timeout(WAIT, signal).await.unwrap().unwrap();
	assert_eq!(broker.published_keys(), vec!["drain.me"]);
	let published = position(&broker, |op| matches!(op, BrokerOperation::Publish { .. }));
	let closed = position(&broker, |op| matches!(op, BrokerOperation::CloseChannel));
	assert!(published.unwrap() < closed.unwrap());
}

#[tokio::test]
async fn shutdown_completes_only_when_connection_disconnects() {
	let broker = MemoryBroker::new();
	let connection = broker.open_connection();
	let first = wrapper(&connection, "first");
	let second = wrapper(&connection, "second");
	eventually(|| first.is_open() && second.is_open()).await;

	let first_done = first.shutdown();
	eventually(|| first.channel_state() == ChannelState::Closed).await;
	sleep(Duration::from_millis(20)).await;
	assert!(!first_done.is_complete(), "connection is still up for the second wrapper");
	assert!(connection.is_up());

	let second_done = second.shutdown();
	timeout(WAIT, second_done).await.unwrap().unwrap();
	timeout(WAIT, first_done).await.unwrap().unwrap();
	assert!(first.is_terminated() && second.is_terminated());
}

#[tokio::test]
async fn repeated_shutdown_resolves_the_same_completion() {
	let broker = MemoryBroker::new();
	let connection = broker.open_connection();
	let exchange = wrapper(&connection, "messages");
	eventually(|| exchange.is_open()).await;

	let first = exchange.shutdown();
	let second = exchange.shutdown();
	timeout(WAIT, first).await.unwrap().unwrap();
	timeout(WAIT, second).await.unwrap().unwrap();
	timeout(WAIT, exchange.shutdown()).await.unwrap().unwrap();
	assert_eq!(count_ops(&broker, |op| matches!(op, BrokerOperation::CloseChannel)), 1);
}

#[tokio::test]
async fn shutdown_while_disconnected_closes_immediately() {
	let broker = MemoryBroker::new();
	let connection = broker.open_connection();
	let exchange = wrapper(&connection, "messages");
	eventually(|| exchange.is_open()).await;

	connection.drop_connection();
	eventually(|| exchange.channel_state() == ChannelState::Closed).await;
	exchange.post("never.sent", &note(1)).unwrap();

	timeout(WAIT, exchange.shutdown()).await.unwrap().unwrap();
	assert_eq!(exchange.pending_posts(), 0);
	assert!(broker.published_keys().is_empty());
}
