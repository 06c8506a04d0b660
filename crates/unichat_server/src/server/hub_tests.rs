#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime};

use tokio::time::timeout;
use unichat_domain::Platform;
use unichat_platform::{NormalizedMessage, PlatformStatusEvent};

use crate::server::hub::{EventHub, EventHubConfig, HubChannel, HubEvent};

fn mk_chat(text: &str) -> HubEvent {
	HubEvent::Chat(Box::new(NormalizedMessage::new(Platform::Twitch, "u1", "viewer", text)))
}

fn mk_status(platform: Platform, live: bool) -> HubEvent {
	HubEvent::Status(PlatformStatusEvent {
		platform,
		live,
		stream_id: None,
		detail: "test".to_string(),
		time: SystemTime::now(),
	})
}

fn chat_text(ev: HubEvent) -> String {
	match ev {
		HubEvent::Chat(msg) => msg.text,
		other => panic!("expected Chat event, got: {other:?}"),
	}
}

#[tokio::test]
async fn subscriber_sees_publishes_in_order() {
	let hub = EventHub::new(EventHubConfig::default());
	let (_id, mut rx) = hub.subscribe(HubChannel::Chat).await;

	for i in 0..5 {
		hub.publish(mk_chat(&format!("m-{i}"))).await;
	}

	for i in 0..5 {
		let ev = timeout(Duration::from_millis(250), rx.recv())
			.await
			.expect("expected event within timeout")
			.expect("channel open");
		assert_eq!(chat_text(ev), format!("m-{i}"));
	}
}

#[tokio::test]
async fn late_subscriber_misses_earlier_events() {
	let hub = EventHub::new(EventHubConfig::default());

	let (_a, mut rx_a) = hub.subscribe(HubChannel::Chat).await;
	let (_b, mut rx_b) = hub.subscribe(HubChannel::Chat).await;

	hub.publish(mk_chat("early")).await;

	// Both registered subscribers receive it verbatim.
	assert_eq!(chat_text(rx_a.recv().await.unwrap()), "early");
	assert_eq!(chat_text(rx_b.recv().await.unwrap()), "early");

	// A third session that subscribes after publication sees nothing.
	let (_c, mut rx_c) = hub.subscribe(HubChannel::Chat).await;
	let got = timeout(Duration::from_millis(50), rx_c.recv()).await;
	assert!(got.is_err(), "late subscriber unexpectedly received an earlier event");
}

#[tokio::test]
async fn unsubscribe_stops_delivery_and_is_idempotent() {
	let hub = EventHub::new(EventHubConfig::default());
	let (id, mut rx) = hub.subscribe(HubChannel::Chat).await;

	hub.publish(mk_chat("before")).await;
	assert_eq!(chat_text(rx.recv().await.unwrap()), "before");

	hub.unsubscribe(id).await;
	hub.publish(mk_chat("after")).await;

	// Sender side is gone, so the stream ends instead of delivering.
	let got = timeout(Duration::from_millis(100), rx.recv()).await.expect("stream closed");
	assert!(got.is_none(), "unsubscribed receiver should see end-of-stream");

	// Calling again (and again) is harmless.
	hub.unsubscribe(id).await;
	hub.unsubscribe(id).await;

	assert_eq!(hub.subscriber_count(HubChannel::Chat).await, 0);
}

#[tokio::test]
async fn status_subscriber_receives_cached_snapshot() {
	let hub = EventHub::new(EventHubConfig::default());

	hub.publish(mk_status(Platform::Twitch, true)).await;
	hub.publish(mk_status(Platform::YouTube, false)).await;
	// A newer twitch status replaces the cached one.
	hub.publish(mk_status(Platform::Twitch, false)).await;

	let (_id, mut rx) = hub.subscribe(HubChannel::PlatformStatus).await;

	let mut seen = Vec::new();
	for _ in 0..2 {
		let ev = timeout(Duration::from_millis(250), rx.recv())
			.await
			.expect("cached status within timeout")
			.expect("channel open");
		match ev {
			HubEvent::Status(st) => seen.push((st.platform, st.live)),
			other => panic!("expected Status event, got: {other:?}"),
		}
	}

	seen.sort();
	assert_eq!(seen, vec![(Platform::Twitch, false), (Platform::YouTube, false)]);

	// Then only subsequently published events.
	hub.publish(mk_status(Platform::Kick, true)).await;
	let ev = rx.recv().await.unwrap();
	match ev {
		HubEvent::Status(st) => assert_eq!((st.platform, st.live), (Platform::Kick, true)),
		other => panic!("expected Status event, got: {other:?}"),
	}
}

#[tokio::test]
async fn slow_subscriber_does_not_block_siblings() {
	let hub = EventHub::new(EventHubConfig {
		subscriber_queue_capacity: 1,
		debug_logs: false,
	});

	let (_slow, _rx_slow) = hub.subscribe(HubChannel::Chat).await;
	let (_ok, mut rx_ok) = hub.subscribe(HubChannel::Chat).await;

	// First publish fills the slow subscriber's queue (it never drains).
	hub.publish(mk_chat("m-1")).await;
	assert_eq!(chat_text(rx_ok.recv().await.unwrap()), "m-1");

	// Subsequent publishes drop for the slow subscriber but still reach
	// the healthy one.
	hub.publish(mk_chat("m-2")).await;
	let ev = timeout(Duration::from_millis(250), rx_ok.recv())
		.await
		.expect("healthy subscriber delivery within timeout")
		.expect("channel open");
	assert_eq!(chat_text(ev), "m-2");
}

#[tokio::test]
async fn channels_are_independent() {
	let hub = EventHub::new(EventHubConfig::default());
	let (_id, mut chat_rx) = hub.subscribe(HubChannel::Chat).await;

	hub.publish(mk_status(Platform::Kick, true)).await;

	let got = timeout(Duration::from_millis(50), chat_rx.recv()).await;
	assert!(got.is_err(), "chat subscriber received a status event");
}
