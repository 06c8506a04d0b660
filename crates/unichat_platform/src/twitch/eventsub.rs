#![forbid(unsafe_code)]

use std::time::SystemTime;

use anyhow::Context;
use serde::Deserialize;
use unichat_domain::Platform;

use crate::NormalizedMessage;

/// EventSub metadata (present on all WebSocket messages).
#[allow(dead_code)]
#[derive(Debug, Deserialize)]
pub(crate) struct EventSubMetadata {
	pub(crate) message_id: String,
	pub(crate) message_type: String,
	pub(crate) message_timestamp: String,

	#[serde(default)]
	pub(crate) subscription_type: Option<String>,
}

/// A lightweight peek struct to cheaply inspect message_type/subscription_type.
#[derive(Debug, Deserialize)]
pub(crate) struct EventSubMetadataPeek {
	pub(crate) metadata: EventSubMetadataPeekInner,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubMetadataPeekInner {
	pub(crate) message_type: String,
	#[serde(default)]
	pub(crate) subscription_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubWelcomeMessage {
	#[allow(dead_code)]
	pub(crate) metadata: EventSubMetadata,
	pub(crate) payload: EventSubWelcomePayload,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubWelcomePayload {
	pub(crate) session: EventSubWelcomeSession,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubWelcomeSession {
	pub(crate) id: String,

	#[allow(dead_code)]
	pub(crate) status: String,

	#[serde(default)]
	pub(crate) keepalive_timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubNotification<TEvent> {
	pub(crate) metadata: EventSubMetadata,
	pub(crate) payload: EventSubNotificationPayload<TEvent>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubNotificationPayload<TEvent> {
	#[allow(dead_code)]
	pub(crate) subscription: EventSubSubscription,
	pub(crate) event: TEvent,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubSubscription {
	#[allow(dead_code)]
	pub(crate) id: String,

	#[serde(rename = "type")]
	#[allow(dead_code)]
	pub(crate) r#type: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChannelChatMessageEvent {
	#[allow(dead_code)]
	pub(crate) broadcaster_user_id: String,
	#[allow(dead_code)]
	pub(crate) broadcaster_user_login: String,

	pub(crate) chatter_user_id: String,
	pub(crate) chatter_user_login: String,
	pub(crate) chatter_user_name: String,

	#[allow(dead_code)]
	pub(crate) message_id: String,
	pub(crate) message: ChannelChatMessageContent,
	#[serde(default)]
	pub(crate) badges: Vec<TwitchChatBadge>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TwitchChatBadge {
	pub(crate) set_id: String,
	pub(crate) id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChannelChatMessageContent {
	pub(crate) text: String,
}

/// Extract `metadata.message_type` from a raw EventSub WS JSON string.
pub(crate) fn peek_message_type(raw_json: &str) -> anyhow::Result<String> {
	let peek: EventSubMetadataPeek = serde_json::from_str(raw_json).context("parse EventSub metadata peek")?;
	Ok(peek.metadata.message_type)
}

/// Parse a raw WS message as `session_welcome`.
pub(crate) fn parse_welcome(raw_json: &str) -> anyhow::Result<EventSubWelcomeMessage> {
	serde_json::from_str(raw_json).context("parse session_welcome")
}

/// Convert a `metadata.message_timestamp` RFC3339 timestamp into `SystemTime`.
///
/// EventSub timestamps are RFC3339 with fractional seconds and Zulu (UTC).
pub(crate) fn parse_message_timestamp_system_time(ts: &str) -> anyhow::Result<SystemTime> {
	let dt = chrono::DateTime::parse_from_rfc3339(ts).context("parse EventSub RFC3339 timestamp")?;
	Ok(SystemTime::from(dt.with_timezone(&chrono::Utc)))
}

/// Normalize a raw WS message if it is a `channel.chat.message` notification.
///
/// Returns `Ok(None)` for every other message type.
pub(crate) fn try_normalize_chat_message(raw_json: &str) -> anyhow::Result<Option<NormalizedMessage>> {
	let peek: EventSubMetadataPeek = serde_json::from_str(raw_json).context("parse EventSub metadata peek")?;

	if peek.metadata.message_type != "notification" {
		return Ok(None);
	}
	if peek.metadata.subscription_type.as_deref() != Some("channel.chat.message") {
		return Ok(None);
	}

	let msg: EventSubNotification<ChannelChatMessageEvent> =
		serde_json::from_str(raw_json).context("parse channel.chat.message notification")?;

	let sent_at = parse_message_timestamp_system_time(&msg.metadata.message_timestamp)?;
	let event = msg.payload.event;

	let username = if event.chatter_user_name.trim().is_empty() {
		event.chatter_user_login
	} else {
		event.chatter_user_name
	};

	let mut normalized = NormalizedMessage::new(Platform::Twitch, event.chatter_user_id, username, event.message.text);
	normalized.sent_at = sent_at;
	normalized.badges = event
		.badges
		.into_iter()
		.map(|badge| format!("twitch:{}:{}", badge.set_id, badge.id))
		.collect();

	Ok(Some(normalized))
}

#[cfg(test)]
mod tests {
	use super::*;

	const CHAT_NOTIFICATION: &str = r#"{
		"metadata": {
			"message_id": "befa7b53-d79d-478f-86b9-120f112b044e",
			"message_type": "notification",
			"message_timestamp": "2023-07-19T10:11:12.464757833Z",
			"subscription_type": "channel.chat.message"
		},
		"payload": {
			"subscription": {
				"id": "f1c2a387-161a-49f9-a165-0f21d7a4e1c4",
				"type": "channel.chat.message"
			},
			"event": {
				"broadcaster_user_id": "1971641",
				"broadcaster_user_login": "streamer",
				"chatter_user_id": "4145994",
				"chatter_user_login": "viewer32",
				"chatter_user_name": "Viewer32",
				"message_id": "cc106a89-1814-919d-454c-f4f2f970aae7",
				"message": { "text": "Hi chat" },
				"badges": [
					{ "set_id": "moderator", "id": "1" },
					{ "set_id": "subscriber", "id": "12" }
				]
			}
		}
	}"#;

	#[test]
	fn normalizes_chat_notification() {
		let msg = try_normalize_chat_message(CHAT_NOTIFICATION).unwrap().unwrap();
		assert_eq!(msg.platform, Platform::Twitch);
		assert_eq!(msg.user_id, "4145994");
		assert_eq!(msg.username, "Viewer32");
		assert_eq!(msg.text, "Hi chat");
		assert_eq!(msg.badges, vec!["twitch:moderator:1", "twitch:subscriber:12"]);
	}

	#[test]
	fn ignores_non_chat_messages() {
		let keepalive = r#"{
			"metadata": {
				"message_id": "84c1e79a-2521-4c95-8e97-7c58f4b72934",
				"message_type": "session_keepalive",
				"message_timestamp": "2023-07-19T10:11:12.634234626Z"
			},
			"payload": {}
		}"#;

		assert!(try_normalize_chat_message(keepalive).unwrap().is_none());
		assert_eq!(peek_message_type(keepalive).unwrap(), "session_keepalive");
	}

	#[test]
	fn parses_welcome_session() {
		let welcome = r#"{
			"metadata": {
				"message_id": "96a3f3b5-5dec-4eed-908e-e11ee657416c",
				"message_type": "session_welcome",
				"message_timestamp": "2023-07-19T14:56:51.634234626Z"
			},
			"payload": {
				"session": {
					"id": "AQoQILE98gtqShGmLD7AM6yJThAB",
					"status": "connected",
					"keepalive_timeout_seconds": 10
				}
			}
		}"#;

		let parsed = parse_welcome(welcome).unwrap();
		assert_eq!(parsed.payload.session.id, "AQoQILE98gtqShGmLD7AM6yJThAB");
		assert_eq!(parsed.payload.session.keepalive_timeout_seconds, Some(10));
	}
}
