#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use reqwest::StatusCode;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct KickApiClient {
	base_url: String,
	access_token: String,
	client: reqwest::Client,
}

impl KickApiClient {
	pub fn new(base_url: impl Into<String>, access_token: impl Into<String>) -> Self {
		Self {
			base_url: base_url.into(),
			access_token: access_token.into(),
			client: reqwest::Client::new(),
		}
	}

	fn auth_header(&self) -> anyhow::Result<String> {
		if self.access_token.trim().is_empty() {
			return Err(anyhow!("missing kick access token"));
		}
		Ok(format!("Bearer {}", self.access_token.trim()))
	}

	pub async fn send_chat_message(&self, broadcaster_user_id: u64, content: &str) -> anyhow::Result<()> {
		let url = format!("{}/public/v1/chat", self.base_url.trim_end_matches('/'));
		let body = KickPostChatRequest {
			broadcaster_user_id,
			content: content.to_string(),
			type_field: "user".to_string(),
		};

		let resp = self
			.client
			.post(url)
			.header("Authorization", self.auth_header()?)
			.json(&body)
			.send()
			.await
			.context("kick send chat")?;

		match resp.status() {
			StatusCode::OK | StatusCode::CREATED => Ok(()),
			status => Err(anyhow!("kick send chat failed: status={}", status)),
		}
	}

	/// Ban or timeout a user. A duration makes it a timeout; `None` is permanent.
	pub async fn ban_user(
		&self,
		broadcaster_user_id: u64,
		user_id: u64,
		duration_seconds: Option<u32>,
		reason: Option<&str>,
	) -> anyhow::Result<()> {
		let url = format!("{}/public/v1/moderation/bans", self.base_url.trim_end_matches('/'));
		let body = KickBanRequest {
			broadcaster_user_id,
			user_id,
			duration: duration_seconds,
			reason: reason.map(|v| v.to_string()),
		};
		let resp = self
			.client
			.post(url)
			.header("Authorization", self.auth_header()?)
			.json(&body)
			.send()
			.await
			.context("kick ban user")?;

		match resp.status() {
			StatusCode::OK | StatusCode::CREATED => Ok(()),
			status => Err(anyhow!("kick ban user failed: status={}", status)),
		}
	}

	pub async fn unban_user(&self, broadcaster_user_id: u64, user_id: u64) -> anyhow::Result<()> {
		let url = format!("{}/public/v1/moderation/bans", self.base_url.trim_end_matches('/'));
		let body = KickUnbanRequest {
			broadcaster_user_id,
			user_id,
		};
		let resp = self
			.client
			.delete(url)
			.header("Authorization", self.auth_header()?)
			.json(&body)
			.send()
			.await
			.context("kick unban user")?;

		match resp.status() {
			StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
			status => Err(anyhow!("kick unban user failed: status={}", status)),
		}
	}

	/// Resolve a channel slug to the broadcaster's numeric user id.
	pub async fn resolve_broadcaster_id(&self, slug: &str) -> anyhow::Result<Option<u64>> {
		let url = format!(
			"{}/public/v1/channels?slug={}",
			self.base_url.trim_end_matches('/'),
			urlencoding::encode(slug)
		);

		let resp = self
			.client
			.get(url)
			.header("Authorization", self.auth_header()?)
			.send()
			.await
			.context("kick get channels")?;

		if resp.status() == StatusCode::NOT_FOUND {
			return Ok(None);
		}
		if !resp.status().is_success() {
			return Err(anyhow!("kick get channels failed: status={}", resp.status()));
		}

		let body: KickChannelsResponse = resp.json().await.context("parse kick channels response")?;
		Ok(body
			.data
			.into_iter()
			.find(|c| c.slug.eq_ignore_ascii_case(slug))
			.map(|c| c.broadcaster_user_id))
	}
}

#[derive(Debug, serde::Serialize)]
struct KickPostChatRequest {
	broadcaster_user_id: u64,
	content: String,
	#[serde(rename = "type")]
	type_field: String,
}

#[derive(Debug, serde::Serialize)]
struct KickBanRequest {
	broadcaster_user_id: u64,
	user_id: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	duration: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	reason: Option<String>,
}

#[derive(Debug, serde::Serialize)]
struct KickUnbanRequest {
	broadcaster_user_id: u64,
	user_id: u64,
}

#[derive(Debug, Deserialize)]
struct KickChannelsResponse {
	data: Vec<KickChannelData>,
}

#[derive(Debug, Deserialize)]
struct KickChannelData {
	broadcaster_user_id: u64,
	slug: String,
}
