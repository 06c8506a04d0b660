#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;
use unichat_domain::AccountKey;
use unichat_platform::SecretString;

/// Default config path: `~/.unichat/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".unichat").join("config.toml"))
}

/// Load the hub config from TOML and env overrides.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<HubConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = HubConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Hub config (v1).
#[derive(Debug, Clone, Default)]
pub struct HubConfig {
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
	pub roles: RoleSettings,
	pub moderation: ModerationSettings,
	pub twitch: TwitchSettings,
	pub kick: KickSettings,
	pub youtube: YouTubeSettings,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Shared secret for the subscription-notification webhook.
	pub webhook_secret: Option<SecretString>,
	/// Shared secret for cron-triggered endpoints.
	pub cron_secret: Option<SecretString>,
	/// Viewer feed heartbeat cadence.
	pub heartbeat_interval: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	pub enabled: bool,
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
}

/// Static owner/admin allow-lists as `platform:username` entries.
#[derive(Debug, Clone, Default)]
pub struct RoleSettings {
	pub owners: Vec<AccountKey>,
	pub admins: Vec<AccountKey>,
}

#[derive(Debug, Clone)]
pub struct ModerationSettings {
	/// Internal user id of the channel owner (credential fallback).
	pub owner_user_id: String,
	pub reaper_sweep_interval: Duration,
	pub reaper_staleness: Duration,
	/// Quarantined (unlinked) accounts older than this are purged by cron.
	pub quarantine_max_age: Duration,
	/// Minimum spacing between outbound sends, per platform.
	pub send_min_spacing: Duration,
}

impl Default for ModerationSettings {
	fn default() -> Self {
		Self {
			owner_user_id: String::new(),
			reaper_sweep_interval: Duration::from_secs(300),
			reaper_staleness: Duration::from_secs(300),
			quarantine_max_age: Duration::from_secs(30 * 24 * 3600),
			send_min_spacing: Duration::from_millis(1_100),
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct TwitchSettings {
	pub client_id: Option<String>,
	pub access_token: Option<SecretString>,
	pub broadcaster_login: Option<String>,
	pub broadcaster_id: Option<String>,
	pub eventsub_ws_url: Option<String>,
	pub api_base_url: Option<String>,
	pub reconnect_min_delay: Option<Duration>,
	pub reconnect_max_delay: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct KickSettings {
	pub base_url: Option<String>,
	pub access_token: Option<SecretString>,
	pub broadcaster_slug: Option<String>,
	pub broadcaster_user_id: Option<u64>,
	pub webhook_bind: Option<String>,
	pub webhook_path: Option<String>,
	pub webhook_public_key_path: Option<PathBuf>,
	pub webhook_verify_signatures: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct YouTubeSettings {
	pub api_key: Option<SecretString>,
	/// OAuth bearer for the owner/bot account; write paths need it.
	pub access_token: Option<SecretString>,
	pub channel_id: Option<String>,
	pub api_base_url: Option<String>,
	pub live_check_interval: Option<Duration>,
	pub cache_ttl: Option<Duration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	roles: FileRoleSettings,

	#[serde(default)]
	moderation: FileModerationSettings,

	#[serde(default)]
	twitch: FileTwitchSettings,

	#[serde(default)]
	kick: FileKickSettings,

	#[serde(default)]
	youtube: FileYouTubeSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	webhook_secret: Option<String>,
	cron_secret: Option<String>,
	heartbeat_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRoleSettings {
	#[serde(default)]
	owners: Vec<String>,
	#[serde(default)]
	admins: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileModerationSettings {
	owner_user_id: Option<String>,
	reaper_sweep_interval_secs: Option<u64>,
	reaper_staleness_secs: Option<u64>,
	quarantine_max_age_days: Option<u64>,
	send_min_spacing_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	client_id: Option<String>,
	access_token: Option<String>,
	broadcaster_login: Option<String>,
	broadcaster_id: Option<String>,
	eventsub_ws_url: Option<String>,
	api_base_url: Option<String>,
	reconnect_min_delay_ms: Option<u64>,
	reconnect_max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileKickSettings {
	base_url: Option<String>,
	access_token: Option<String>,
	broadcaster_slug: Option<String>,
	broadcaster_user_id: Option<u64>,
	webhook_bind: Option<String>,
	webhook_path: Option<String>,
	webhook_public_key_path: Option<String>,
	webhook_verify_signatures: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileYouTubeSettings {
	api_key: Option<String>,
	access_token: Option<String>,
	channel_id: Option<String>,
	api_base_url: Option<String>,
	live_check_interval_secs: Option<u64>,
	cache_ttl_secs: Option<u64>,
}

fn non_empty(value: Option<String>) -> Option<String> {
	value.filter(|s| !s.trim().is_empty())
}

fn parse_account_keys(raw: Vec<String>, list: &str) -> anyhow::Result<Vec<AccountKey>> {
	raw.into_iter()
		.map(|entry| AccountKey::parse(&entry).with_context(|| format!("parse {list} entry: {entry}")))
		.collect()
}

impl HubConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let defaults = ModerationSettings::default();

		Ok(Self {
			server: ServerSettings {
				metrics_bind: non_empty(file.server.metrics_bind),
				webhook_secret: non_empty(file.server.webhook_secret).map(SecretString::new),
				cron_secret: non_empty(file.server.cron_secret).map(SecretString::new),
				heartbeat_interval: file.server.heartbeat_interval_secs.map(Duration::from_secs),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: non_empty(file.persistence.database_url),
			},
			roles: RoleSettings {
				owners: parse_account_keys(file.roles.owners, "roles.owners")?,
				admins: parse_account_keys(file.roles.admins, "roles.admins")?,
			},
			moderation: ModerationSettings {
				owner_user_id: non_empty(file.moderation.owner_user_id).unwrap_or_default(),
				reaper_sweep_interval: file
					.moderation
					.reaper_sweep_interval_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.reaper_sweep_interval),
				reaper_staleness: file
					.moderation
					.reaper_staleness_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.reaper_staleness),
				quarantine_max_age: file
					.moderation
					.quarantine_max_age_days
					.map(|d| Duration::from_secs(d * 24 * 3600))
					.unwrap_or(defaults.quarantine_max_age),
				send_min_spacing: file
					.moderation
					.send_min_spacing_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.send_min_spacing),
			},
			twitch: TwitchSettings {
				client_id: non_empty(file.twitch.client_id),
				access_token: non_empty(file.twitch.access_token).map(SecretString::new),
				broadcaster_login: non_empty(file.twitch.broadcaster_login),
				broadcaster_id: non_empty(file.twitch.broadcaster_id),
				eventsub_ws_url: non_empty(file.twitch.eventsub_ws_url),
				api_base_url: non_empty(file.twitch.api_base_url),
				reconnect_min_delay: file.twitch.reconnect_min_delay_ms.map(Duration::from_millis),
				reconnect_max_delay: file.twitch.reconnect_max_delay_ms.map(Duration::from_millis),
			},
			kick: KickSettings {
				base_url: non_empty(file.kick.base_url),
				access_token: non_empty(file.kick.access_token).map(SecretString::new),
				broadcaster_slug: non_empty(file.kick.broadcaster_slug),
				broadcaster_user_id: file.kick.broadcaster_user_id,
				webhook_bind: non_empty(file.kick.webhook_bind),
				webhook_path: non_empty(file.kick.webhook_path),
				webhook_public_key_path: non_empty(file.kick.webhook_public_key_path).map(PathBuf::from),
				webhook_verify_signatures: file.kick.webhook_verify_signatures,
			},
			youtube: YouTubeSettings {
				api_key: non_empty(file.youtube.api_key).map(SecretString::new),
				access_token: non_empty(file.youtube.access_token).map(SecretString::new),
				channel_id: non_empty(file.youtube.channel_id),
				api_base_url: non_empty(file.youtube.api_base_url),
				live_check_interval: file.youtube.live_check_interval_secs.map(Duration::from_secs),
				cache_ttl: file.youtube.cache_ttl_secs.map(Duration::from_secs),
			},
		})
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut HubConfig) {
	if let Ok(v) = std::env::var("UNICHAT_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.enabled = true;
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("UNICHAT_WEBHOOK_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.webhook_secret = Some(SecretString::new(v));
			info!("server config: webhook_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("UNICHAT_CRON_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.cron_secret = Some(SecretString::new(v));
			info!("server config: cron_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("UNICHAT_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("UNICHAT_TWITCH_CLIENT_ID") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.twitch.client_id = Some(v);
			info!("twitch config: client_id overridden by env");
		}
	}

	if let Ok(v) = std::env::var("UNICHAT_TWITCH_ACCESS_TOKEN") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.twitch.access_token = Some(SecretString::new(v));
			info!("twitch config: access_token overridden by env");
		}
	}

	if let Ok(v) = std::env::var("UNICHAT_KICK_ACCESS_TOKEN") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.kick.access_token = Some(SecretString::new(v));
			info!("kick config: access_token overridden by env");
		}
	}

	if let Ok(v) = std::env::var("UNICHAT_YOUTUBE_API_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.youtube.api_key = Some(SecretString::new(v));
			info!("youtube config: api_key overridden by env");
		}
	}

	if let Ok(v) = std::env::var("UNICHAT_OWNER_USER_ID") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.moderation.owner_user_id = v;
			info!("moderation config: owner_user_id overridden by env");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use unichat_domain::Platform;

	#[test]
	fn parses_full_config() {
		let raw = r#"
			[server]
			metrics_bind = "127.0.0.1:9100"
			webhook_secret = "hook-secret"
			cron_secret = "cron-secret"
			heartbeat_interval_secs = 25

			[persistence]
			enabled = true
			database_url = "sqlite::memory:"

			[roles]
			owners = ["twitch:the_owner"]
			admins = ["kick:site_admin", "twitch:site_admin"]

			[moderation]
			owner_user_id = "user-owner"
			reaper_sweep_interval_secs = 120
			quarantine_max_age_days = 7

			[twitch]
			client_id = "abc"
			access_token = "tok"
			broadcaster_login = "the_owner"

			[youtube]
			api_key = "yt-key"
			channel_id = "UC123"
			cache_ttl_secs = 20
		"#;

		let file: FileConfig = toml::from_str(raw).unwrap();
		let cfg = HubConfig::from_file(file).unwrap();

		assert_eq!(cfg.server.metrics_bind.as_deref(), Some("127.0.0.1:9100"));
		assert!(cfg.persistence.enabled);
		assert_eq!(cfg.roles.owners.len(), 1);
		assert_eq!(cfg.roles.owners[0].platform, Platform::Twitch);
		assert_eq!(cfg.roles.admins.len(), 2);
		assert_eq!(cfg.moderation.owner_user_id, "user-owner");
		assert_eq!(cfg.moderation.reaper_sweep_interval, Duration::from_secs(120));
		assert_eq!(cfg.moderation.quarantine_max_age, Duration::from_secs(7 * 24 * 3600));
		assert_eq!(cfg.youtube.cache_ttl, Some(Duration::from_secs(20)));
	}

	#[test]
	fn rejects_bad_allow_list_entry() {
		let raw = r#"
			[roles]
			owners = ["not-a-key"]
		"#;

		let file: FileConfig = toml::from_str(raw).unwrap();
		assert!(HubConfig::from_file(file).is_err());
	}

	#[test]
	fn empty_config_uses_defaults() {
		let cfg = HubConfig::from_file(FileConfig::default()).unwrap();
		assert!(!cfg.persistence.enabled);
		assert_eq!(cfg.moderation.reaper_sweep_interval, Duration::from_secs(300));
		assert!(cfg.server.webhook_secret.is_none());
	}
}
