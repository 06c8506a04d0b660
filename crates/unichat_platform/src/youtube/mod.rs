#![forbid(unsafe_code)]

mod client;
mod connector;

pub use client::YouTubeApiClient;
pub use connector::{YouTubeChatConnector, YouTubeConfig};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::anyhow;
use parking_lot::{Mutex, RwLock};
use unichat_domain::Platform;

use crate::{ActingCredential, ChatSender, ModerationApi, PlatformStatusEvent};

/// Cached liveness snapshot for the configured channel.
#[derive(Debug, Clone)]
pub struct LiveSnapshot {
	pub live: bool,
	pub video_id: Option<String>,
	pub chat_id: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedLive {
	fetched_at: Instant,
	snapshot: LiveSnapshot,
}

impl CachedLive {
	fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
		now.duration_since(self.fetched_at) < ttl
	}
}

/// Shared liveness state: the connector's poll loop and request handlers
/// both read through this, so API call volume stays bounded by the TTL.
#[derive(Clone)]
pub struct YouTubeLiveState {
	client: Arc<YouTubeApiClient>,
	channel_id: String,
	cache: Arc<RwLock<Option<CachedLive>>>,
	cache_ttl: Duration,
}

impl YouTubeLiveState {
	pub fn new(client: Arc<YouTubeApiClient>, channel_id: impl Into<String>, cache_ttl: Duration) -> Self {
		Self {
			client,
			channel_id: channel_id.into(),
			cache: Arc::new(RwLock::new(None)),
			cache_ttl,
		}
	}

	fn cached(&self) -> Option<LiveSnapshot> {
		let guard = self.cache.read();
		guard
			.as_ref()
			.filter(|c| c.is_fresh(Instant::now(), self.cache_ttl))
			.map(|c| c.snapshot.clone())
	}

	fn store(&self, snapshot: LiveSnapshot) {
		let mut guard = self.cache.write();
		*guard = Some(CachedLive {
			fetched_at: Instant::now(),
			snapshot,
		});
	}

	pub(crate) fn invalidate(&self) {
		let mut guard = self.cache.write();
		*guard = None;
	}

	pub(crate) fn client_arc(&self) -> Arc<YouTubeApiClient> {
		Arc::clone(&self.client)
	}

	async fn fetch_snapshot(&self) -> anyhow::Result<LiveSnapshot> {
		let video_id = self.client.search_live_video_id(&self.channel_id).await?;
		let chat_id = match video_id.as_deref() {
			Some(id) => self.client.active_live_chat_id(id).await?,
			None => None,
		};

		Ok(LiveSnapshot {
			live: chat_id.is_some(),
			video_id,
			chat_id,
		})
	}

	/// Cached liveness; fetches once when the cache is stale.
	pub async fn is_live(&self) -> anyhow::Result<bool> {
		Ok(self.snapshot().await?.live)
	}

	/// Cached active chat id; fetches once when the cache is stale.
	pub async fn active_chat_id(&self) -> anyhow::Result<Option<String>> {
		Ok(self.snapshot().await?.chat_id)
	}

	pub async fn snapshot(&self) -> anyhow::Result<LiveSnapshot> {
		if let Some(snapshot) = self.cached() {
			return Ok(snapshot);
		}

		let snapshot = self.fetch_snapshot().await?;
		self.store(snapshot.clone());
		Ok(snapshot)
	}

	/// Bypass the cache, perform one fresh lookup, update the cache, and
	/// return a status event for publication on the status channel.
	pub async fn check_live_now(&self) -> anyhow::Result<PlatformStatusEvent> {
		let snapshot = self.fetch_snapshot().await?;
		self.store(snapshot.clone());

		Ok(PlatformStatusEvent {
			platform: Platform::YouTube,
			live: snapshot.live,
			stream_id: snapshot.video_id,
			detail: if snapshot.live {
				"youtube live (manual check)".to_string()
			} else {
				"youtube offline (manual check)".to_string()
			},
			time: SystemTime::now(),
		})
	}
}

/// Outbound command surface for YouTube.
///
/// Unbans need the ban resource id YouTube returned at ban time; ids are
/// retained in memory for the process lifetime.
pub struct YouTubeCommands {
	live: YouTubeLiveState,
	client: Arc<YouTubeApiClient>,
	default_credential: ActingCredential,
	ban_ids_by_channel: Mutex<HashMap<String, String>>,
}

impl YouTubeCommands {
	pub fn new(live: YouTubeLiveState, default_credential: ActingCredential) -> Self {
		let client = live.client_arc();
		Self {
			live,
			client,
			default_credential,
			ban_ids_by_channel: Mutex::new(HashMap::new()),
		}
	}

	async fn require_chat_id(&self) -> anyhow::Result<String> {
		self.live
			.active_chat_id()
			.await?
			.ok_or_else(|| anyhow!("youtube channel has no active live chat"))
	}
}

#[async_trait::async_trait]
impl ChatSender for YouTubeCommands {
	async fn send_chat(&self, text: &str) -> anyhow::Result<()> {
		let chat_id = self.require_chat_id().await?;
		self.client
			.insert_live_chat_message(self.default_credential.token.expose(), &chat_id, text)
			.await
	}
}

#[async_trait::async_trait]
impl ModerationApi for YouTubeCommands {
	async fn timeout_user(
		&self,
		credential: &ActingCredential,
		target_user_id: &str,
		duration_seconds: u32,
		_reason: Option<&str>,
	) -> anyhow::Result<()> {
		let chat_id = self.require_chat_id().await?;
		let ban_id = self
			.client
			.insert_live_chat_ban(credential.token.expose(), &chat_id, target_user_id, Some(duration_seconds))
			.await?;
		self.ban_ids_by_channel.lock().insert(target_user_id.to_string(), ban_id);
		Ok(())
	}

	async fn ban_user(&self, credential: &ActingCredential, target_user_id: &str, _reason: Option<&str>) -> anyhow::Result<()> {
		let chat_id = self.require_chat_id().await?;
		let ban_id = self
			.client
			.insert_live_chat_ban(credential.token.expose(), &chat_id, target_user_id, None)
			.await?;
		self.ban_ids_by_channel.lock().insert(target_user_id.to_string(), ban_id);
		Ok(())
	}

	async fn unban_user(&self, credential: &ActingCredential, target_user_id: &str) -> anyhow::Result<()> {
		let ban_id = self
			.ban_ids_by_channel
			.lock()
			.get(target_user_id)
			.cloned()
			.ok_or_else(|| anyhow!("no retained youtube ban id for channel {target_user_id}"))?;

		self.client.delete_live_chat_ban(credential.token.expose(), &ban_id).await?;
		self.ban_ids_by_channel.lock().remove(target_user_id);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cache_entry_freshness_respects_ttl() {
		let snapshot = LiveSnapshot {
			live: true,
			video_id: Some("v".to_string()),
			chat_id: Some("c".to_string()),
		};
		let entry = CachedLive {
			fetched_at: Instant::now(),
			snapshot,
		};

		let now = Instant::now();
		assert!(entry.is_fresh(now, Duration::from_secs(30)));
		assert!(!entry.is_fresh(now + Duration::from_secs(31), Duration::from_secs(30)));
	}

	#[test]
	fn stale_cache_is_ignored() {
		let client = Arc::new(YouTubeApiClient::new(
			"https://www.googleapis.com/youtube/v3",
			crate::SecretString::new("key"),
		));
		let live = YouTubeLiveState::new(client, "UC123", Duration::from_secs(0));

		live.store(LiveSnapshot {
			live: true,
			video_id: None,
			chat_id: None,
		});

		// TTL of zero means nothing is ever fresh.
		assert!(live.cached().is_none());
	}
}
