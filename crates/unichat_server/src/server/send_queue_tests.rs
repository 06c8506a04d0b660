#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use unichat_domain::Platform;
use unichat_platform::ChatSender;

use crate::server::send_queue::{SendError, SendQueueBuilder};

struct FakeSender {
	sent: Mutex<Vec<String>>,
	fail_on: Option<String>,
}

impl FakeSender {
	fn new(fail_on: Option<&str>) -> Arc<Self> {
		Arc::new(Self {
			sent: Mutex::new(Vec::new()),
			fail_on: fail_on.map(|s| s.to_string()),
		})
	}

	async fn sent(&self) -> Vec<String> {
		self.sent.lock().await.clone()
	}
}

#[async_trait::async_trait]
impl ChatSender for FakeSender {
	async fn send_chat(&self, text: &str) -> anyhow::Result<()> {
		if self.fail_on.as_deref() == Some(text) {
			anyhow::bail!("refused: {text}");
		}
		self.sent.lock().await.push(text.to_string());
		Ok(())
	}
}

#[tokio::test]
async fn delivers_in_enqueue_order_per_platform() {
	let sender = FakeSender::new(None);
	let queue = SendQueueBuilder::new()
		.register(Platform::Twitch, sender.clone(), Duration::from_millis(0))
		.start();

	for i in 0..5 {
		queue.enqueue(Platform::Twitch, format!("msg-{i}")).await.unwrap();
	}

	let sent = sender.sent().await;
	assert_eq!(sent, vec!["msg-0", "msg-1", "msg-2", "msg-3", "msg-4"]);
}

#[tokio::test]
async fn failure_is_reported_and_does_not_halt_the_worker() {
	let sender = FakeSender::new(Some("bad"));
	let queue = SendQueueBuilder::new()
		.register(Platform::Kick, sender.clone(), Duration::from_millis(0))
		.start();

	queue.enqueue(Platform::Kick, "first".to_string()).await.unwrap();

	let err = queue.enqueue(Platform::Kick, "bad".to_string()).await.unwrap_err();
	match err {
		SendError::Platform(detail) => assert!(detail.contains("refused")),
		other => panic!("expected platform error, got: {other:?}"),
	}

	// The worker keeps going for subsequent messages.
	queue.enqueue(Platform::Kick, "second".to_string()).await.unwrap();

	assert_eq!(sender.sent().await, vec!["first", "second"]);
}

#[tokio::test]
async fn unregistered_platform_is_a_configuration_error() {
	let queue = SendQueueBuilder::new()
		.register(Platform::Twitch, FakeSender::new(None), Duration::from_millis(0))
		.start();

	assert!(queue.is_registered(Platform::Twitch));
	assert!(!queue.is_registered(Platform::YouTube));

	let err = queue.enqueue(Platform::YouTube, "hello".to_string()).await.unwrap_err();
	assert!(matches!(err, SendError::NotRegistered(Platform::YouTube)));
}

#[tokio::test]
async fn platforms_proceed_independently() {
	let twitch = FakeSender::new(None);
	let kick = FakeSender::new(None);
	let queue = SendQueueBuilder::new()
		.register(Platform::Twitch, twitch.clone(), Duration::from_millis(0))
		.register(Platform::Kick, kick.clone(), Duration::from_millis(0))
		.start();

	let (a, b) = tokio::join!(
		queue.enqueue(Platform::Twitch, "to-twitch".to_string()),
		queue.enqueue(Platform::Kick, "to-kick".to_string()),
	);
	a.unwrap();
	b.unwrap();

	assert_eq!(twitch.sent().await, vec!["to-twitch"]);
	assert_eq!(kick.sent().await, vec!["to-kick"]);
}
