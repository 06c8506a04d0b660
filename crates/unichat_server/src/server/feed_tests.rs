#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;
use unichat_domain::Platform;
use unichat_platform::{NormalizedMessage, PlatformStatusEvent};

use crate::server::feed::{FeedSettings, run_feed_session};
use crate::server::hub::{EventHub, EventHubConfig, HubChannel, HubEvent};

fn settings() -> FeedSettings {
	FeedSettings {
		// Long enough that heartbeats never interleave with assertions.
		heartbeat_interval: Duration::from_secs(600),
		session_queue_capacity: 64,
	}
}

async fn next_frame(rx: &mut mpsc::Receiver<Bytes>) -> String {
	let bytes = timeout(Duration::from_millis(500), rx.recv())
		.await
		.expect("frame within timeout")
		.expect("session open");
	String::from_utf8(bytes.to_vec()).expect("utf-8 frame")
}

fn start_session(hub: &EventHub) -> mpsc::Receiver<Bytes> {
	let (tx, rx) = mpsc::channel(64);
	tokio::spawn(run_feed_session(hub.clone(), settings(), tx));
	rx
}

#[tokio::test]
async fn session_greets_then_streams_hub_events() {
	let hub = EventHub::new(EventHubConfig::default());
	let mut rx = start_session(&hub);

	let hello = next_frame(&mut rx).await;
	assert!(hello.starts_with("data: "), "frames use the event-stream format");
	assert!(hello.ends_with("\n\n"), "frames are two-newline delimited");
	assert!(hello.contains(r#""type":"hello""#));

	// Give the session a moment to register its hub subscriptions.
	timeout(Duration::from_millis(500), async {
		while hub.subscriber_count(HubChannel::Chat).await == 0 {
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.expect("session subscribes");

	hub.publish(HubEvent::Chat(Box::new(NormalizedMessage::new(
		Platform::Kick,
		"7",
		"kickviewer",
		"hello feed",
	))))
	.await;

	let frame = next_frame(&mut rx).await;
	assert!(frame.contains(r#""type":"chat""#));
	assert!(frame.contains("hello feed"));
	assert!(frame.contains(r#""platform":"kick""#));
}

#[tokio::test]
async fn cached_status_snapshot_is_replayed_on_connect() {
	let hub = EventHub::new(EventHubConfig::default());

	hub.publish(HubEvent::Status(PlatformStatusEvent {
		platform: Platform::YouTube,
		live: true,
		stream_id: Some("vid-1".to_string()),
		detail: "live".to_string(),
		time: SystemTime::now(),
	}))
	.await;

	let mut rx = start_session(&hub);

	let hello = next_frame(&mut rx).await;
	assert!(hello.contains(r#""type":"hello""#));

	let status = next_frame(&mut rx).await;
	assert!(status.contains(r#""type":"status""#));
	assert!(status.contains(r#""platform":"youtube""#));
	assert!(status.contains("vid-1"));
}

#[tokio::test]
async fn two_sessions_receive_late_joiner_does_not() {
	let hub = EventHub::new(EventHubConfig::default());
	let mut rx_a = start_session(&hub);
	let mut rx_b = start_session(&hub);

	assert!(next_frame(&mut rx_a).await.contains("hello"));
	assert!(next_frame(&mut rx_b).await.contains("hello"));

	timeout(Duration::from_millis(500), async {
		while hub.subscriber_count(HubChannel::Chat).await < 2 {
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.expect("both sessions subscribe");

	hub.publish(HubEvent::Chat(Box::new(NormalizedMessage::new(
		Platform::Twitch,
		"1",
		"viewer",
		"broadcast-once",
	))))
	.await;

	assert!(next_frame(&mut rx_a).await.contains("broadcast-once"));
	assert!(next_frame(&mut rx_b).await.contains("broadcast-once"));

	// A session that joins after publication sees the greeting and nothing else.
	let mut rx_c = start_session(&hub);
	assert!(next_frame(&mut rx_c).await.contains("hello"));
	let extra = timeout(Duration::from_millis(100), rx_c.recv()).await;
	assert!(extra.is_err(), "late joiner must not receive earlier chat");
}

#[tokio::test]
async fn disconnect_tears_down_all_subscriptions() {
	let hub = EventHub::new(EventHubConfig::default());
	let mut rx = start_session(&hub);

	assert!(next_frame(&mut rx).await.contains("hello"));

	timeout(Duration::from_millis(500), async {
		while hub.subscriber_count(HubChannel::Chat).await == 0 {
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.expect("session subscribes");

	// Simulate the client going away.
	drop(rx);

	// The next delivery attempt hits the closed queue and the session
	// unsubscribes from all three channels exactly once.
	hub.publish(HubEvent::Chat(Box::new(NormalizedMessage::new(
		Platform::Twitch,
		"1",
		"viewer",
		"into the void",
	))))
	.await;

	timeout(Duration::from_millis(500), async {
		loop {
			let chat = hub.subscriber_count(HubChannel::Chat).await;
			let moderation = hub.subscriber_count(HubChannel::Moderation).await;
			let status = hub.subscriber_count(HubChannel::PlatformStatus).await;
			if chat == 0 && moderation == 0 && status == 0 {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.expect("all subscriptions released after disconnect");
}
