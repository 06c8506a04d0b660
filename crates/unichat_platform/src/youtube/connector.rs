#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use unichat_domain::Platform;

use super::client::{YouTubeApiClient, YtChatMessage};
use super::{LiveSnapshot, YouTubeLiveState};
use crate::{
	ChatConnector, ConnectorControl, ConnectorControlRx, ConnectorEvent, ConnectorEventTx, ConnectorState, NormalizedMessage,
	SecretString, backoff_delay, new_session_id, status, status_error, validate_message,
};

#[derive(Clone)]
pub struct YouTubeConfig {
	pub api_key: SecretString,
	pub channel_id: String,
	pub api_base_url: String,

	/// How often to re-check liveness while offline.
	pub live_check_interval: Duration,

	/// TTL for the shared liveness cache consulted by request handlers.
	pub cache_ttl: Duration,

	/// Floor under the server-directed chat polling interval.
	pub poll_floor: Duration,

	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
}

impl YouTubeConfig {
	pub fn new(api_key: SecretString, channel_id: impl Into<String>) -> Self {
		Self {
			api_key,
			channel_id: channel_id.into(),
			api_base_url: "https://www.googleapis.com/youtube/v3".to_string(),
			live_check_interval: Duration::from_secs(60),
			cache_ttl: Duration::from_secs(30),
			poll_floor: Duration::from_secs(2),
			reconnect_min_delay: Duration::from_secs(1),
			reconnect_max_delay: Duration::from_secs(60),
		}
	}
}

/// YouTube live chat connector. There is no push channel; the loop polls
/// `liveChatMessages` while a stream is live and re-checks liveness on a
/// slower cadence while offline.
pub struct YouTubeChatConnector {
	cfg: YouTubeConfig,
	live: YouTubeLiveState,
	state: ConnectorState,
	last_auth_error_notice: Option<String>,
}

impl YouTubeChatConnector {
	pub fn new(cfg: YouTubeConfig) -> Self {
		let client = Arc::new(YouTubeApiClient::new(cfg.api_base_url.clone(), cfg.api_key.clone()));
		let live = YouTubeLiveState::new(client, cfg.channel_id.clone(), cfg.cache_ttl);
		Self {
			cfg,
			live,
			state: ConnectorState::Disconnected,
			last_auth_error_notice: None,
		}
	}

	/// Shared liveness state for request handlers and the command surface.
	pub fn live_state(&self) -> YouTubeLiveState {
		self.live.clone()
	}

	fn has_config(&self) -> bool {
		!self.cfg.api_key.is_empty() && !self.cfg.channel_id.trim().is_empty()
	}

	fn set_state(&mut self, next: ConnectorState) {
		if self.state != next {
			debug!(platform = %Platform::YouTube, from = %self.state, to = %next, "youtube connector state");
			self.state = next;
		}
	}

	fn maybe_notice_auth_issue(&mut self, reason: &str, events_tx: &ConnectorEventTx) {
		if self.last_auth_error_notice.as_deref() != Some(reason) {
			self.last_auth_error_notice = Some(reason.to_string());
			warn!(platform = %Platform::YouTube, %reason, "youtube connector configuration problem");
			let _ = events_tx.try_send(status(Platform::YouTube, false, reason.to_string()));
		}
	}

	async fn run_loop(mut self, mut control_rx: ConnectorControlRx, events_tx: ConnectorEventTx) -> anyhow::Result<()> {
		let platform = Platform::YouTube;
		let session_id = new_session_id();

		info!(%platform, %session_id, "youtube connector starting");

		// Missing configuration fails closed: one notice, then block on
		// control messages instead of hammering the API.
		if !self.has_config() {
			self.set_state(ConnectorState::Disconnected);
			self.maybe_notice_auth_issue("waiting for youtube configuration (api key + channel id)", &events_tx);

			loop {
				match control_rx.recv().await {
					Some(ConnectorControl::UpdateAuth { .. }) => {
						// The data API key is static config, not an OAuth
						// grant; nothing to apply here.
					}
					Some(ConnectorControl::Shutdown) | None => {
						self.set_state(ConnectorState::Stopped);
						let _ = events_tx.try_send(status(platform, false, "youtube connector stopped"));
						return Ok(());
					}
				}
			}
		}

		let mut error_attempt: u32 = 0;
		let mut announced_offline = false;

		'outer: loop {
			self.set_state(ConnectorState::Connecting);

			let snapshot: LiveSnapshot = match self.live.snapshot().await {
				Ok(s) => s,
				Err(e) => {
					error_attempt = error_attempt.saturating_add(1);
					self.set_state(ConnectorState::Reconnecting);
					let _ = events_tx.try_send(status_error(platform, "youtube liveness check failed", e));
					let delay = backoff_delay(error_attempt, self.cfg.reconnect_min_delay, self.cfg.reconnect_max_delay);
					if wait_or_shutdown(&mut control_rx, delay).await {
						break 'outer;
					}
					continue;
				}
			};

			let Some(chat_id) = snapshot.chat_id.clone() else {
				self.set_state(ConnectorState::Disconnected);
				if !announced_offline {
					announced_offline = true;
					let _ = events_tx.try_send(status(platform, false, "youtube channel offline"));
				}
				if wait_or_shutdown(&mut control_rx, self.cfg.live_check_interval).await {
					break 'outer;
				}
				self.live.invalidate();
				continue;
			};

			error_attempt = 0;
			announced_offline = false;
			self.set_state(ConnectorState::Connected);
			metrics::counter!("unichat_youtube_connected_total").increment(1);

			let mut connected_status = status(platform, true, format!("youtube live chat polling (chat_id={chat_id})"));
			if let ConnectorEvent::Status(st) = &mut connected_status {
				st.stream_id = snapshot.video_id.clone();
			}
			let _ = events_tx.try_send(connected_status);

			let mut page_token: Option<String> = None;
			let mut primed = false;

			loop {
				let page = match self.live.client_arc().list_live_chat_messages(&chat_id, page_token.as_deref()).await {
					Ok(page) => page,
					Err(e) => {
						error_attempt = error_attempt.saturating_add(1);
						self.set_state(ConnectorState::Reconnecting);
						let _ = events_tx.try_send(status_error(platform, "youtube chat poll failed", e));
						let delay = backoff_delay(error_attempt, self.cfg.reconnect_min_delay, self.cfg.reconnect_max_delay);
						if wait_or_shutdown(&mut control_rx, delay).await {
							break 'outer;
						}
						self.live.invalidate();
						break;
					}
				};

				error_attempt = 0;
				page_token = page.next_page_token.clone();

				if page.chat_ended {
					let _ = events_tx.try_send(status(platform, false, "youtube live chat ended"));
					self.live.invalidate();
					break;
				}

				// The first page is history from before we attached; use it
				// only to obtain the paging cursor.
				if primed {
					for item in page.messages {
						match normalize_chat_item(item) {
							Some(normalized) => {
								metrics::counter!("unichat_youtube_chat_messages_total").increment(1);
								if events_tx.try_send(ConnectorEvent::Chat(Box::new(normalized))).is_err() {
									metrics::counter!("unichat_youtube_chat_dropped_total").increment(1);
								}
							}
							None => {
								debug!(%platform, "skipping youtube chat item without text");
							}
						}
					}
				} else {
					primed = true;
				}

				let delay = page.polling_interval.max(self.cfg.poll_floor);
				if wait_or_shutdown(&mut control_rx, delay).await {
					break 'outer;
				}
			}
		}

		self.set_state(ConnectorState::Stopped);
		let _ = events_tx.try_send(status(platform, false, "youtube connector stopped"));
		Ok(())
	}
}

/// Sleep for `delay` while watching the control channel.
/// Returns `true` when the connector should stop.
async fn wait_or_shutdown(control_rx: &mut ConnectorControlRx, delay: Duration) -> bool {
	tokio::select! {
		_ = sleep(delay) => false,
		cmd = control_rx.recv() => !matches!(cmd, Some(ConnectorControl::UpdateAuth { .. })),
	}
}

fn normalize_chat_item(item: YtChatMessage) -> Option<NormalizedMessage> {
	let text = item.snippet.display_message?;

	let mut msg = NormalizedMessage::new(
		Platform::YouTube,
		item.author_details.channel_id,
		item.author_details.display_name,
		text,
	);

	if item.author_details.is_chat_owner {
		msg.badges.push("youtube:owner".to_string());
	}
	if item.author_details.is_chat_moderator {
		msg.badges.push("youtube:moderator".to_string());
	}
	if item.author_details.is_chat_sponsor {
		msg.badges.push("youtube:member".to_string());
	}

	if let Some(ts) = item.snippet.published_at.as_deref()
		&& let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(ts)
	{
		msg.sent_at = SystemTime::from(parsed.with_timezone(&chrono::Utc));
	}

	validate_message(&msg).ok()?;
	Some(msg)
}

#[async_trait]
impl ChatConnector for YouTubeChatConnector {
	fn platform(&self) -> Platform {
		Platform::YouTube
	}

	async fn run(self: Box<Self>, control_rx: ConnectorControlRx, events_tx: ConnectorEventTx) -> anyhow::Result<()> {
		self.run_loop(control_rx, events_tx).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn normalizes_chat_item_with_badges() {
		let item: YtChatMessage = serde_json::from_str(
			r#"{
				"snippet": {
					"displayMessage": "hello youtube",
					"publishedAt": "2024-05-02T12:00:00Z"
				},
				"authorDetails": {
					"channelId": "UCabc",
					"displayName": "TubeViewer",
					"isChatModerator": true,
					"isChatOwner": false,
					"isChatSponsor": true
				}
			}"#,
		)
		.unwrap();

		let msg = normalize_chat_item(item).unwrap();
		assert_eq!(msg.platform, Platform::YouTube);
		assert_eq!(msg.user_id, "UCabc");
		assert_eq!(msg.username, "TubeViewer");
		assert_eq!(msg.text, "hello youtube");
		assert_eq!(msg.badges, vec!["youtube:moderator", "youtube:member"]);
	}

	#[test]
	fn drops_items_without_display_text() {
		let item: YtChatMessage = serde_json::from_str(
			r#"{
				"snippet": {},
				"authorDetails": { "channelId": "UCabc", "displayName": "TubeViewer" }
			}"#,
		)
		.unwrap();

		assert!(normalize_chat_item(item).is_none());
	}
}
