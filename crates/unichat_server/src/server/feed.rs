#![forbid(unsafe_code)]

use std::convert::Infallible;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::Response;
use hyper::body::Frame;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use unichat_domain::Platform;

use crate::server::hub::{EventHub, HubChannel, HubEvent};
use crate::util::time::{to_unix_ms, unix_ms_now};

/// Viewer feed settings.
#[derive(Debug, Clone)]
pub struct FeedSettings {
	/// Heartbeat cadence; keeps intermediary proxies from closing the
	/// stream and flushes out dead connections.
	pub heartbeat_interval: Duration,

	/// Capacity of the per-session outbound byte queue.
	pub session_queue_capacity: usize,
}

impl Default for FeedSettings {
	fn default() -> Self {
		Self {
			heartbeat_interval: Duration::from_secs(25),
			session_queue_capacity: 64,
		}
	}
}

/// Wire representation of feed events: one JSON object per event.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum FeedEvent {
	Hello {
		server_time_unix_ms: i64,
	},
	Chat {
		platform: Platform,
		user_id: String,
		username: String,
		text: String,
		badges: Vec<String>,
		sent_at_unix_ms: i64,
	},
	Moderation {
		kind: String,
		platform: Platform,
		target_user_id: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		duration_seconds: Option<u64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		reason: Option<String>,
		actor_id: String,
		time_unix_ms: i64,
	},
	Status {
		platform: Platform,
		live: bool,
		#[serde(skip_serializing_if = "Option::is_none")]
		stream_id: Option<String>,
		detail: String,
		time_unix_ms: i64,
	},
	Ping {
		server_time_unix_ms: i64,
	},
}

impl FeedEvent {
	fn from_hub(event: HubEvent) -> Self {
		match event {
			HubEvent::Chat(msg) => FeedEvent::Chat {
				platform: msg.platform,
				user_id: msg.user_id,
				username: msg.username,
				text: msg.text,
				badges: msg.badges,
				sent_at_unix_ms: to_unix_ms(msg.sent_at),
			},
			HubEvent::Moderation(ev) => FeedEvent::Moderation {
				kind: ev.kind.as_str().to_string(),
				platform: ev.platform,
				target_user_id: ev.target_user_id,
				duration_seconds: ev.duration_seconds,
				reason: ev.reason,
				actor_id: ev.actor_id,
				time_unix_ms: to_unix_ms(ev.time),
			},
			HubEvent::Status(st) => FeedEvent::Status {
				platform: st.platform,
				live: st.live,
				stream_id: st.stream_id,
				detail: st.detail,
				time_unix_ms: to_unix_ms(st.time),
			},
		}
	}
}

/// Frame an event per the event-stream wire format (two-newline delimiter).
fn sse_frame(event: &FeedEvent) -> Option<Bytes> {
	match serde_json::to_string(event) {
		Ok(json) => Some(Bytes::from(format!("data: {json}\n\n"))),
		Err(e) => {
			warn!(error = %e, "failed to serialize feed event");
			None
		}
	}
}

/// One viewer session: subscribes to all three hub channels, emits the
/// greeting, streams events plus heartbeats, and tears everything down
/// exactly once when any exit path fires.
pub(crate) async fn run_feed_session(hub: EventHub, settings: FeedSettings, out: mpsc::Sender<Bytes>) {
	let session_id = unichat_platform::new_session_id();

	let (chat_id, mut chat_rx) = hub.subscribe(HubChannel::Chat).await;
	let (moderation_id, mut moderation_rx) = hub.subscribe(HubChannel::Moderation).await;
	// Status subscription replays the cached last-known snapshot into the
	// queue before any live event.
	let (status_id, mut status_rx) = hub.subscribe(HubChannel::PlatformStatus).await;

	metrics::counter!("unichat_feed_sessions_total").increment(1);

	let hello = FeedEvent::Hello {
		server_time_unix_ms: unix_ms_now(),
	};

	let mut alive = match sse_frame(&hello) {
		Some(frame) => out.send(frame).await.is_ok(),
		None => false,
	};

	let mut heartbeat = tokio::time::interval(settings.heartbeat_interval);
	heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	heartbeat.tick().await;

	// Every exit path (client close, write failure, hub teardown) funnels
	// through this loop's end so the unsubscribe below runs exactly once.
	while alive {
		let frame = tokio::select! {
			ev = chat_rx.recv() => ev.map(FeedEvent::from_hub),
			ev = moderation_rx.recv() => ev.map(FeedEvent::from_hub),
			ev = status_rx.recv() => ev.map(FeedEvent::from_hub),
			_ = heartbeat.tick() => Some(FeedEvent::Ping {
				server_time_unix_ms: unix_ms_now(),
			}),
		};

		match frame {
			Some(event) => {
				if let Some(bytes) = sse_frame(&event) {
					alive = out.send(bytes).await.is_ok();
				}
			}
			None => {
				// A hub-side prune dropped one of our senders.
				alive = false;
			}
		}
	}

	hub.unsubscribe(chat_id).await;
	hub.unsubscribe(moderation_id).await;
	hub.unsubscribe(status_id).await;

	metrics::counter!("unichat_feed_sessions_closed_total").increment(1);
	debug!(%session_id, "feed session closed and unsubscribed");
}

/// Build the unbounded event-stream response for one viewer.
pub fn serve_feed(hub: EventHub, settings: FeedSettings) -> Response<BoxBody<Bytes, Infallible>> {
	let (tx, mut rx) = mpsc::channel::<Bytes>(settings.session_queue_capacity);

	tokio::spawn(run_feed_session(hub, settings, tx));

	let stream = futures::stream::poll_fn(move |cx| {
		rx.poll_recv(cx)
			.map(|item| item.map(|bytes| Ok::<_, Infallible>(Frame::data(bytes))))
	});

	Response::builder()
		.header("Content-Type", "text/event-stream")
		.header("Cache-Control", "no-cache")
		.header("Connection", "keep-alive")
		.body(StreamBody::new(stream).boxed())
		.unwrap()
}
