use std::time::Duration;

use amqp_broadcast::broker::MemoryBroker;
use amqp_broadcast::{ConnectionConfig, ExchangeConfig, ExchangeRegistry, JsonSerializer};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time;
use tracing_subscriber::EnvFilter;

const PATTERNS: [&str; 5] = ["#", "msg.#", "msg.*.yolo", "#.yolo", "*.*.yolo"];

pub async fn test_main() -> Result<(), Box<dyn std::error::Error>> {
	let registry =
		ExchangeRegistry::<Value, JsonSerializer>::new(MemoryBroker::new());
	let broadcast = registry.get_exchange(
		&ConnectionConfig::default(),
		ExchangeConfig::new("messages"),
	)?;

	let (received_tx, mut received_rx) = mpsc::unbounded_channel();
	for pattern in PATTERNS {
		let received_tx = received_tx.clone();
		broadcast.on(pattern, move |topic, message| {
			println!("[{pattern}] Message to {topic} received: {message}");
			let _ = received_tx.send(());
		})?;
	}
	drop(received_tx);

	broadcast.post("msg.test.yolo", &json!({ "test": "yolo" }))?;

	let all_received = async {
		for _ in 0 .. PATTERNS.len() {
			if received_rx.recv().await.is_none() {
				break;
			}
		}
	};
	tokio::select! {
		_ = tokio::signal::ctrl_c() => println!("Interrupt received. Shutdown..."),
		_ = time::timeout(Duration::from_secs(5), all_received) => {
			println!("Shutdown...")
		}
	}

	registry.shutdown_all().await?;
	println!("Closed");
	Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| EnvFilter::new("amqp_broadcast=info")),
		)
		.init();
	test_main().await
}
