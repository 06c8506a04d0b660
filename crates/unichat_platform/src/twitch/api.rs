#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use url::Url;

const EVENTSUB_SUBSCRIPTIONS_PATH: &str = "/helix/eventsub/subscriptions";
const CHAT_MESSAGES_PATH: &str = "/helix/chat/messages";
const MODERATION_BANS_PATH: &str = "/helix/moderation/bans";

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

async fn send_with_retry(req: reqwest::RequestBuilder, label: &'static str) -> anyhow::Result<reqwest::Response> {
	let retry_builder = req.try_clone();
	let resp = req.send().await.with_context(|| format!("helix {label} send"))?;
	let status = resp.status();

	if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
		let body = resp.text().await.unwrap_or_default();
		anyhow::bail!("helix auth failed (status={status}) body={body}");
	}

	if status == StatusCode::TOO_MANY_REQUESTS
		&& let Some(delay) = retry_delay_from_headers(resp.headers())
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(delay).await;
		let retry_resp = retry.send().await.with_context(|| format!("helix {label} retry send"))?;
		return Ok(retry_resp);
	}

	if status.is_server_error()
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(Duration::from_millis(250)).await;
		let retry_resp = retry.send().await.with_context(|| format!("helix {label} retry send"))?;
		return Ok(retry_resp);
	}

	Ok(resp)
}

/// Minimal Helix client scoped to what the hub needs: identity lookups,
/// EventSub chat subscriptions, chat sending and ban management.
#[derive(Clone, Debug)]
pub struct TwitchApiClient {
	http: reqwest::Client,
	base_url: Url,
	client_id: String,
	bearer_token: String,
}

#[derive(Debug, Serialize)]
struct HelixChatSubscriptionCondition<'a> {
	broadcaster_user_id: &'a str,
	user_id: &'a str,
}

#[derive(Debug, Serialize)]
struct HelixWebsocketTransport<'a> {
	method: &'static str,
	session_id: &'a str,
}

#[derive(Debug, Serialize)]
struct HelixCreateSubscriptionRequest<'a> {
	r#type: &'static str,
	version: &'static str,
	condition: HelixChatSubscriptionCondition<'a>,
	transport: HelixWebsocketTransport<'a>,
}

#[derive(Debug, Serialize)]
struct HelixSendChatMessage<'a> {
	broadcaster_id: &'a str,
	sender_id: &'a str,
	message: &'a str,
}

#[derive(Debug, Serialize)]
struct HelixBanRequest<'a> {
	data: HelixBanData<'a>,
}

#[derive(Debug, Serialize)]
struct HelixBanData<'a> {
	user_id: &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	duration: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	reason: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct HelixUsersResponse {
	data: Vec<HelixUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixUser {
	pub id: String,
	#[allow(dead_code)]
	pub login: String,
	#[serde(default)]
	#[allow(dead_code)]
	pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixCreateSubscriptionResponse {
	pub(crate) data: Vec<HelixSubscriptionData>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixSubscriptionData {
	pub(crate) id: String,
}

impl TwitchApiClient {
	pub fn new(base_url: &str, client_id: String, bearer_token: String) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("unichat/0.x (eventsub-ws)")
			.build()
			.context("build reqwest client")?;
		let base_url = Url::parse(base_url).context("parse helix base url")?;

		Ok(Self {
			http,
			base_url,
			client_id,
			bearer_token,
		})
	}

	fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		req.header("Client-Id", &self.client_id)
			.header("Authorization", format!("Bearer {}", self.bearer_token))
	}

	fn url(&self, path_and_query: &str) -> anyhow::Result<Url> {
		self.base_url.join(path_and_query).context("join helix url")
	}

	pub async fn get_user_by_login(&self, login: &str) -> anyhow::Result<Option<HelixUser>> {
		let url = self.url(&format!("/helix/users?login={}", urlencoding::encode(login)))?;

		let resp = send_with_retry(self.authed(self.http.get(url)), "GET /helix/users")
			.await
			.context("helix GET /helix/users send")?;

		let status = resp.status();
		let body = resp.text().await.context("helix GET /helix/users read body")?;

		if !status.is_success() {
			anyhow::bail!("helix GET /helix/users failed: status={status} body={body}");
		}

		let parsed: HelixUsersResponse = serde_json::from_str(&body).context("helix users parse json")?;
		Ok(parsed.data.into_iter().next())
	}

	pub async fn get_token_user(&self) -> anyhow::Result<HelixUser> {
		let url = self.url("/helix/users")?;

		let resp = send_with_retry(self.authed(self.http.get(url)), "GET /helix/users (whoami)")
			.await
			.context("helix GET /helix/users (whoami) send")?;

		let status = resp.status();
		let body = resp.text().await.context("helix GET /helix/users (whoami) read body")?;

		if !status.is_success() {
			anyhow::bail!("helix GET /helix/users (whoami) failed: status={status} body={body}");
		}

		let parsed: HelixUsersResponse = serde_json::from_str(&body).context("helix users (whoami) parse json")?;

		parsed.data.into_iter().next().context("helix whoami returned empty data")
	}

	/// Create a `channel.chat.message` EventSub subscription on a websocket session.
	pub(crate) async fn create_chat_message_subscription(
		&self,
		session_id: &str,
		broadcaster_user_id: &str,
		user_id: &str,
	) -> anyhow::Result<HelixCreateSubscriptionResponse> {
		let url = self.url(EVENTSUB_SUBSCRIPTIONS_PATH)?;

		let req = HelixCreateSubscriptionRequest {
			r#type: "channel.chat.message",
			version: "1",
			condition: HelixChatSubscriptionCondition {
				broadcaster_user_id,
				user_id,
			},
			transport: HelixWebsocketTransport {
				method: "websocket",
				session_id,
			},
		};

		let resp = send_with_retry(
			self.authed(self.http.post(url)).json(&req),
			"POST /helix/eventsub/subscriptions",
		)
		.await
		.context("helix create chat subscription send")?;

		let status = resp.status();
		let body = resp.text().await.context("helix create chat subscription read body")?;

		if !status.is_success() {
			anyhow::bail!("helix create chat subscription failed: status={status} body={body}");
		}

		serde_json::from_str(&body).context("helix create chat subscription parse json")
	}

	pub async fn send_chat_message(&self, broadcaster_id: &str, sender_id: &str, message: &str) -> anyhow::Result<()> {
		let url = self.url(CHAT_MESSAGES_PATH)?;

		let req = HelixSendChatMessage {
			broadcaster_id,
			sender_id,
			message,
		};

		let resp = send_with_retry(self.authed(self.http.post(url)).json(&req), "POST /helix/chat/messages")
			.await
			.context("helix send chat send")?;

		let status = resp.status();
		if !status.is_success() {
			let body = resp.text().await.unwrap_or_default();
			anyhow::bail!("helix send chat failed: status={status} body={body}");
		}

		Ok(())
	}

	/// Ban or timeout a user. A `duration` makes it a timeout; `None` is permanent.
	pub async fn ban_user(
		&self,
		broadcaster_id: &str,
		moderator_id: &str,
		user_id: &str,
		duration: Option<u32>,
		reason: Option<&str>,
	) -> anyhow::Result<()> {
		let url = self.url(&format!(
			"{base}?broadcaster_id={b}&moderator_id={m}",
			base = MODERATION_BANS_PATH,
			b = urlencoding::encode(broadcaster_id),
			m = urlencoding::encode(moderator_id),
		))?;

		let req = HelixBanRequest {
			data: HelixBanData {
				user_id,
				duration,
				reason,
			},
		};

		let resp = send_with_retry(self.authed(self.http.post(url)).json(&req), "POST /helix/moderation/bans")
			.await
			.context("helix ban send")?;

		let status = resp.status();
		if !status.is_success() {
			let body = resp.text().await.unwrap_or_default();
			anyhow::bail!("helix ban failed: status={status} body={body}");
		}

		Ok(())
	}

	pub async fn unban_user(&self, broadcaster_id: &str, moderator_id: &str, user_id: &str) -> anyhow::Result<()> {
		let url = self.url(&format!(
			"{base}?broadcaster_id={b}&moderator_id={m}&user_id={u}",
			base = MODERATION_BANS_PATH,
			b = urlencoding::encode(broadcaster_id),
			m = urlencoding::encode(moderator_id),
			u = urlencoding::encode(user_id),
		))?;

		let resp = send_with_retry(self.authed(self.http.delete(url)), "DELETE /helix/moderation/bans")
			.await
			.context("helix unban send")?;

		let status = resp.status();
		if !status.is_success() {
			let body = resp.text().await.unwrap_or_default();
			anyhow::bail!("helix unban failed: status={status} body={body}");
		}

		Ok(())
	}
}
