#![forbid(unsafe_code)]

mod client;
mod connector;

pub use client::KickApiClient;
pub use connector::{KickChatConnector, KickConfig};

use crate::{ActingCredential, ChatSender, ModerationApi};

/// Outbound command surface for Kick.
pub struct KickCommands {
	base_url: String,
	broadcaster_user_id: u64,
	default_credential: ActingCredential,
}

impl KickCommands {
	pub fn new(base_url: impl Into<String>, broadcaster_user_id: u64, default_credential: ActingCredential) -> Self {
		Self {
			base_url: base_url.into(),
			broadcaster_user_id,
			default_credential,
		}
	}

	fn client(&self, access_token: &str) -> KickApiClient {
		KickApiClient::new(self.base_url.clone(), access_token.to_string())
	}
}

fn parse_numeric_id(value: &str) -> anyhow::Result<u64> {
	value
		.trim()
		.parse::<u64>()
		.map_err(|_| anyhow::anyhow!("kick user ids are numeric, got: {value}"))
}

#[async_trait::async_trait]
impl ChatSender for KickCommands {
	async fn send_chat(&self, text: &str) -> anyhow::Result<()> {
		self.client(self.default_credential.token.expose())
			.send_chat_message(self.broadcaster_user_id, text)
			.await
	}
}

#[async_trait::async_trait]
impl ModerationApi for KickCommands {
	async fn timeout_user(
		&self,
		credential: &ActingCredential,
		target_user_id: &str,
		duration_seconds: u32,
		reason: Option<&str>,
	) -> anyhow::Result<()> {
		let user_id = parse_numeric_id(target_user_id)?;
		self.client(credential.token.expose())
			.ban_user(self.broadcaster_user_id, user_id, Some(duration_seconds), reason)
			.await
	}

	async fn ban_user(&self, credential: &ActingCredential, target_user_id: &str, reason: Option<&str>) -> anyhow::Result<()> {
		let user_id = parse_numeric_id(target_user_id)?;
		self.client(credential.token.expose())
			.ban_user(self.broadcaster_user_id, user_id, None, reason)
			.await
	}

	async fn unban_user(&self, credential: &ActingCredential, target_user_id: &str) -> anyhow::Result<()> {
		let user_id = parse_numeric_id(target_user_id)?;
		self.client(credential.token.expose())
			.unban_user(self.broadcaster_user_id, user_id)
			.await
	}
}
