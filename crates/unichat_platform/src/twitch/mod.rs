#![forbid(unsafe_code)]

mod api;
mod connector;
mod eventsub;

pub use api::TwitchApiClient;
pub use connector::{TwitchChatConnector, TwitchConfig};

use crate::{ActingCredential, ChatSender, ModerationApi};

/// Outbound command surface for Twitch: chat sending under the default
/// credential, moderation under whichever credential the dispatcher resolved.
pub struct TwitchCommands {
	api_base_url: String,
	client_id: String,
	broadcaster_id: String,
	default_credential: ActingCredential,
}

impl TwitchCommands {
	pub fn new(
		api_base_url: impl Into<String>,
		client_id: impl Into<String>,
		broadcaster_id: impl Into<String>,
		default_credential: ActingCredential,
	) -> Self {
		Self {
			api_base_url: api_base_url.into(),
			client_id: client_id.into(),
			broadcaster_id: broadcaster_id.into(),
			default_credential,
		}
	}

	fn client(&self, bearer_token: &str) -> anyhow::Result<TwitchApiClient> {
		if self.client_id.trim().is_empty() {
			return Err(anyhow::anyhow!("missing twitch client_id"));
		}
		TwitchApiClient::new(&self.api_base_url, self.client_id.clone(), bearer_token.to_string())
	}
}

#[async_trait::async_trait]
impl ChatSender for TwitchCommands {
	async fn send_chat(&self, text: &str) -> anyhow::Result<()> {
		let client = self.client(self.default_credential.token.expose())?;
		client
			.send_chat_message(&self.broadcaster_id, &self.default_credential.platform_user_id, text)
			.await
	}
}

#[async_trait::async_trait]
impl ModerationApi for TwitchCommands {
	async fn timeout_user(
		&self,
		credential: &ActingCredential,
		target_user_id: &str,
		duration_seconds: u32,
		reason: Option<&str>,
	) -> anyhow::Result<()> {
		let client = self.client(credential.token.expose())?;
		client
			.ban_user(
				&self.broadcaster_id,
				&credential.platform_user_id,
				target_user_id,
				Some(duration_seconds),
				reason,
			)
			.await
	}

	async fn ban_user(&self, credential: &ActingCredential, target_user_id: &str, reason: Option<&str>) -> anyhow::Result<()> {
		let client = self.client(credential.token.expose())?;
		client
			.ban_user(&self.broadcaster_id, &credential.platform_user_id, target_user_id, None, reason)
			.await
	}

	async fn unban_user(&self, credential: &ActingCredential, target_user_id: &str) -> anyhow::Result<()> {
		let client = self.client(credential.token.expose())?;
		client
			.unban_user(&self.broadcaster_id, &credential.platform_user_id, target_user_id)
			.await
	}
}
