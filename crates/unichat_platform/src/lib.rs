#![forbid(unsafe_code)]

pub mod kick;
pub mod twitch;
pub mod youtube;

use std::fmt;
use std::time::{Duration, SystemTime};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use unichat_domain::Platform;
use uuid::Uuid;

/// Normalized chat message emitted by every connector.
///
/// Immutable once produced; the connector that built it owns it until the
/// event is handed to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedMessage {
	pub platform: Platform,

	/// Platform-native user id of the author.
	pub user_id: String,

	/// Display username as the platform reported it.
	pub username: String,

	pub text: String,

	/// Provider-specific badge/role hints (e.g. `twitch:moderator:1`).
	pub badges: Vec<String>,

	/// Platform timestamp when available, else connector receipt time.
	pub sent_at: SystemTime,
}

impl NormalizedMessage {
	pub fn new(platform: Platform, user_id: impl Into<String>, username: impl Into<String>, text: impl Into<String>) -> Self {
		Self {
			platform,
			user_id: user_id.into(),
			username: username.into(),
			text: text.into(),
			badges: Vec::new(),
			sent_at: SystemTime::now(),
		}
	}
}

/// Moderation action kinds dispatched through the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationKind {
	Timeout,
	Ban,
	Unban,
}

impl ModerationKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			ModerationKind::Timeout => "timeout",
			ModerationKind::Ban => "ban",
			ModerationKind::Unban => "unban",
		}
	}
}

impl fmt::Display for ModerationKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Moderation event produced by the dispatcher for hub consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationEvent {
	pub kind: ModerationKind,
	pub platform: Platform,

	/// Platform-native user id of the target.
	pub target_user_id: String,

	#[serde(default)]
	pub duration_seconds: Option<u64>,

	#[serde(default)]
	pub reason: Option<String>,

	/// Internal user id of the acting moderator.
	pub actor_id: String,

	pub time: SystemTime,
}

/// Platform liveness/status event.
///
/// The hub caches the last value per platform so late subscribers converge
/// on current state without polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformStatusEvent {
	pub platform: Platform,
	pub live: bool,

	/// Stream/video identifier when the platform exposes one.
	#[serde(default)]
	pub stream_id: Option<String>,

	pub detail: String,

	pub time: SystemTime,
}

/// Wrapper that redacts in logs.
#[derive(Clone, Default)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Connector lifecycle states.
///
/// `Stopped` is terminal and only reachable through a deliberate shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
	Disconnected,
	Connecting,
	Connected,
	Reconnecting,
	Stopped,
}

impl ConnectorState {
	pub const fn as_str(self) -> &'static str {
		match self {
			ConnectorState::Disconnected => "disconnected",
			ConnectorState::Connecting => "connecting",
			ConnectorState::Connected => "connected",
			ConnectorState::Reconnecting => "reconnecting",
			ConnectorState::Stopped => "stopped",
		}
	}
}

impl fmt::Display for ConnectorState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Server → connector control message.
#[derive(Debug)]
pub enum ConnectorControl {
	/// Update connector credentials.
	UpdateAuth { auth: ConnectorAuth },

	/// Request a graceful shutdown.
	Shutdown,
}

/// Connector authentication data.
#[derive(Debug, Clone)]
pub enum ConnectorAuth {
	/// No auth.
	None,

	/// OAuth-style bearer token.
	BearerToken {
		access_token: SecretString,
		refresh_token: Option<SecretString>,
		user_id: Option<String>,
		expires_in: Option<Duration>,
	},
}

/// Connector → server event message.
#[derive(Debug, Clone)]
pub enum ConnectorEvent {
	/// Normalized chat message.
	Chat(Box<NormalizedMessage>),

	/// Platform status update.
	Status(PlatformStatusEvent),
}

/// Credential a moderation call acts under.
///
/// `platform_user_id` is the identity the action appears under on the
/// platform (the moderator's own account, or the channel owner's).
#[derive(Debug, Clone)]
pub struct ActingCredential {
	pub token: SecretString,
	pub platform_user_id: String,
}

/// Helper types for wiring connectors.
pub type ConnectorControlTx = mpsc::Sender<ConnectorControl>;
pub type ConnectorControlRx = mpsc::Receiver<ConnectorControl>;
pub type ConnectorEventTx = mpsc::Sender<ConnectorEvent>;
pub type ConnectorEventRx = mpsc::Receiver<ConnectorEvent>;

/// Trait representing a runnable platform connector.
#[async_trait::async_trait]
pub trait ChatConnector: Send + Sync + 'static {
	/// Which platform this connector bridges.
	fn platform(&self) -> Platform;

	/// Run the connector until shutdown or fatal error.
	async fn run(self: Box<Self>, control_rx: ConnectorControlRx, events_tx: ConnectorEventTx) -> anyhow::Result<()>;
}

/// Outbound chat sender for one platform, registered with the send queue.
#[async_trait::async_trait]
pub trait ChatSender: Send + Sync {
	async fn send_chat(&self, text: &str) -> anyhow::Result<()>;
}

/// Platform moderation API surface used by the dispatcher and the reaper.
#[async_trait::async_trait]
pub trait ModerationApi: Send + Sync {
	async fn timeout_user(
		&self,
		credential: &ActingCredential,
		target_user_id: &str,
		duration_seconds: u32,
		reason: Option<&str>,
	) -> anyhow::Result<()>;

	async fn ban_user(&self, credential: &ActingCredential, target_user_id: &str, reason: Option<&str>) -> anyhow::Result<()>;

	async fn unban_user(&self, credential: &ActingCredential, target_user_id: &str) -> anyhow::Result<()>;
}

/// Build a standard bounded channel pair.
pub fn bounded_connector_channels(
	control_capacity: usize,
	events_capacity: usize,
) -> (ConnectorControlTx, ConnectorControlRx, ConnectorEventTx, ConnectorEventRx) {
	let (control_tx, control_rx) = mpsc::channel(control_capacity);
	let (events_tx, events_rx) = mpsc::channel(events_capacity);
	(control_tx, control_rx, events_tx, events_rx)
}

/// Build a status event.
pub fn status(platform: Platform, live: bool, detail: impl Into<String>) -> ConnectorEvent {
	ConnectorEvent::Status(PlatformStatusEvent {
		platform,
		live,
		stream_id: None,
		detail: detail.into(),
		time: SystemTime::now(),
	})
}

/// Build an error status event.
pub fn status_error(platform: Platform, detail: impl Into<String>, err: impl fmt::Display) -> ConnectorEvent {
	ConnectorEvent::Status(PlatformStatusEvent {
		platform,
		live: false,
		stream_id: None,
		detail: format!("{}: {err}", detail.into()),
		time: SystemTime::now(),
	})
}

/// Generate an opaque session id.
pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}

/// Exponential backoff clamped to `[min, max]`.
pub fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
	let pow = attempt.min(16);
	let ms = min.as_millis().saturating_mul(1u128 << pow);
	let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
	d.min(max).max(min)
}

/// Validate basic message invariants before publication.
pub fn validate_message(msg: &NormalizedMessage) -> anyhow::Result<()> {
	if msg.text.trim().is_empty() {
		return Err(anyhow!("chat message text must be non-empty"));
	}
	if msg.user_id.trim().is_empty() || msg.username.trim().is_empty() {
		return Err(anyhow!("chat message author fields must be non-empty"));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn backoff_grows_and_clamps() {
		let min = Duration::from_millis(500);
		let max = Duration::from_secs(30);

		assert_eq!(backoff_delay(0, min, max), min);
		assert_eq!(backoff_delay(1, min, max), Duration::from_secs(1));
		assert_eq!(backoff_delay(3, min, max), Duration::from_secs(4));
		assert_eq!(backoff_delay(20, min, max), max);
	}

	#[test]
	fn validate_rejects_blank_fields() {
		let mut msg = NormalizedMessage::new(Platform::Twitch, "1", "viewer", "hello");
		assert!(validate_message(&msg).is_ok());

		msg.text = "   ".to_string();
		assert!(validate_message(&msg).is_err());

		msg.text = "hello".to_string();
		msg.user_id = String::new();
		assert!(validate_message(&msg).is_err());
	}

	#[test]
	fn secret_string_redacts_debug_and_display() {
		let secret = SecretString::new("super-secret");
		assert_eq!(format!("{secret:?}"), "SecretString(<redacted>)");
		assert_eq!(secret.to_string(), "<redacted>");
		assert_eq!(secret.expose(), "super-secret");
	}
}
