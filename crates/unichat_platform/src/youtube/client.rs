#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, anyhow};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::SecretString;

/// YouTube Data API v3 client. Read paths use the API key; write paths
/// (chat send, bans) require an OAuth bearer token supplied per call.
#[derive(Debug, Clone)]
pub struct YouTubeApiClient {
	base_url: String,
	api_key: SecretString,
	client: reqwest::Client,
}

impl YouTubeApiClient {
	pub fn new(base_url: impl Into<String>, api_key: SecretString) -> Self {
		Self {
			base_url: base_url.into(),
			api_key,
			client: reqwest::Client::new(),
		}
	}

	fn key(&self) -> anyhow::Result<&str> {
		if self.api_key.is_empty() {
			return Err(anyhow!("missing youtube api key"));
		}
		Ok(self.api_key.expose())
	}

	fn url(&self, path: &str) -> String {
		format!("{}{path}", self.base_url.trim_end_matches('/'))
	}

	/// Find the currently-live video for a channel, if any.
	pub async fn search_live_video_id(&self, channel_id: &str) -> anyhow::Result<Option<String>> {
		let url = self.url(&format!(
			"/search?part=id&channelId={}&eventType=live&type=video&key={}",
			urlencoding::encode(channel_id),
			urlencoding::encode(self.key()?),
		));

		let resp = self.client.get(url).send().await.context("youtube search live")?;
		if !resp.status().is_success() {
			return Err(anyhow!("youtube search live failed: status={}", resp.status()));
		}

		let body: YtSearchResponse = resp.json().await.context("parse youtube search response")?;
		Ok(body.items.into_iter().filter_map(|item| item.id.video_id).next())
	}

	/// Resolve the active live chat id of a video, if chat is enabled.
	pub async fn active_live_chat_id(&self, video_id: &str) -> anyhow::Result<Option<String>> {
		let url = self.url(&format!(
			"/videos?part=liveStreamingDetails&id={}&key={}",
			urlencoding::encode(video_id),
			urlencoding::encode(self.key()?),
		));

		let resp = self.client.get(url).send().await.context("youtube get video")?;
		if !resp.status().is_success() {
			return Err(anyhow!("youtube get video failed: status={}", resp.status()));
		}

		let body: YtVideosResponse = resp.json().await.context("parse youtube videos response")?;
		Ok(body
			.items
			.into_iter()
			.filter_map(|item| item.live_streaming_details)
			.filter_map(|details| details.active_live_chat_id)
			.next())
	}

	/// Fetch one page of live chat messages.
	pub async fn list_live_chat_messages(
		&self,
		live_chat_id: &str,
		page_token: Option<&str>,
	) -> anyhow::Result<LiveChatPage> {
		let mut url = self.url(&format!(
			"/liveChat/messages?liveChatId={}&part=snippet,authorDetails&key={}",
			urlencoding::encode(live_chat_id),
			urlencoding::encode(self.key()?),
		));
		if let Some(token) = page_token {
			url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
		}

		let resp = self.client.get(url).send().await.context("youtube list chat messages")?;
		if resp.status() == StatusCode::FORBIDDEN || resp.status() == StatusCode::NOT_FOUND {
			// Chat is gone (stream ended or chat disabled).
			return Ok(LiveChatPage {
				messages: Vec::new(),
				next_page_token: None,
				polling_interval: Duration::from_secs(10),
				chat_ended: true,
			});
		}
		if !resp.status().is_success() {
			return Err(anyhow!("youtube list chat messages failed: status={}", resp.status()));
		}

		let body: YtLiveChatMessagesResponse = resp.json().await.context("parse youtube chat messages response")?;
		let chat_ended = body.offline_at.is_some();

		Ok(LiveChatPage {
			messages: body.items,
			next_page_token: body.next_page_token,
			polling_interval: Duration::from_millis(body.polling_interval_millis.unwrap_or(5_000)),
			chat_ended,
		})
	}

	/// Post a chat message under the given OAuth credential.
	pub async fn insert_live_chat_message(&self, bearer_token: &str, live_chat_id: &str, text: &str) -> anyhow::Result<()> {
		let url = self.url("/liveChat/messages?part=snippet");
		let body = serde_json::json!({
			"snippet": {
				"liveChatId": live_chat_id,
				"type": "textMessageEvent",
				"textMessageDetails": { "messageText": text }
			}
		});

		let resp = self
			.client
			.post(url)
			.header("Authorization", format!("Bearer {}", bearer_token.trim()))
			.json(&body)
			.send()
			.await
			.context("youtube insert chat message")?;

		if !resp.status().is_success() {
			return Err(anyhow!("youtube insert chat message failed: status={}", resp.status()));
		}

		Ok(())
	}

	/// Ban (permanent) or timeout (temporary) a channel in a live chat.
	/// Returns the ban resource id, which is required for a later unban.
	pub async fn insert_live_chat_ban(
		&self,
		bearer_token: &str,
		live_chat_id: &str,
		banned_channel_id: &str,
		duration_seconds: Option<u32>,
	) -> anyhow::Result<String> {
		let url = self.url("/liveChat/bans?part=snippet");
		let body = match duration_seconds {
			Some(secs) => serde_json::json!({
				"snippet": {
					"liveChatId": live_chat_id,
					"type": "temporary",
					"banDurationSeconds": secs,
					"bannedUserDetails": { "channelId": banned_channel_id }
				}
			}),
			None => serde_json::json!({
				"snippet": {
					"liveChatId": live_chat_id,
					"type": "permanent",
					"bannedUserDetails": { "channelId": banned_channel_id }
				}
			}),
		};

		let resp = self
			.client
			.post(url)
			.header("Authorization", format!("Bearer {}", bearer_token.trim()))
			.json(&body)
			.send()
			.await
			.context("youtube insert chat ban")?;

		if !resp.status().is_success() {
			return Err(anyhow!("youtube insert chat ban failed: status={}", resp.status()));
		}

		let body: YtBanResponse = resp.json().await.context("parse youtube ban response")?;
		Ok(body.id)
	}

	pub async fn delete_live_chat_ban(&self, bearer_token: &str, ban_id: &str) -> anyhow::Result<()> {
		let url = self.url(&format!("/liveChat/bans?id={}", urlencoding::encode(ban_id)));

		let resp = self
			.client
			.delete(url)
			.header("Authorization", format!("Bearer {}", bearer_token.trim()))
			.send()
			.await
			.context("youtube delete chat ban")?;

		match resp.status() {
			StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
			status => Err(anyhow!("youtube delete chat ban failed: status={}", status)),
		}
	}
}

/// One page of live chat messages plus the server-directed polling hints.
#[derive(Debug)]
pub struct LiveChatPage {
	pub messages: Vec<YtChatMessage>,
	pub next_page_token: Option<String>,
	pub polling_interval: Duration,
	pub chat_ended: bool,
}

#[derive(Debug, Deserialize)]
struct YtSearchResponse {
	#[serde(default)]
	items: Vec<YtSearchItem>,
}

#[derive(Debug, Deserialize)]
struct YtSearchItem {
	id: YtSearchItemId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct YtSearchItemId {
	#[serde(default)]
	video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YtVideosResponse {
	#[serde(default)]
	items: Vec<YtVideoItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct YtVideoItem {
	#[serde(default)]
	live_streaming_details: Option<YtLiveStreamingDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct YtLiveStreamingDetails {
	#[serde(default)]
	active_live_chat_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct YtLiveChatMessagesResponse {
	#[serde(default)]
	items: Vec<YtChatMessage>,
	#[serde(default)]
	next_page_token: Option<String>,
	#[serde(default)]
	polling_interval_millis: Option<u64>,
	#[serde(default)]
	offline_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YtChatMessage {
	pub snippet: YtChatMessageSnippet,
	pub author_details: YtChatAuthor,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YtChatMessageSnippet {
	#[serde(default)]
	pub display_message: Option<String>,
	#[serde(default)]
	pub published_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YtChatAuthor {
	pub channel_id: String,
	pub display_name: String,
	#[serde(default)]
	pub is_chat_moderator: bool,
	#[serde(default)]
	pub is_chat_owner: bool,
	#[serde(default)]
	pub is_chat_sponsor: bool,
}

#[derive(Debug, Deserialize)]
struct YtBanResponse {
	id: String,
}
