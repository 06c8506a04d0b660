#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::info;
use unichat_platform::SecretString;

/// Header names of the subscription-notification webhook (EventSub wire format).
pub const MESSAGE_ID_HEADER: &str = "Twitch-Eventsub-Message-Id";
pub const MESSAGE_TIMESTAMP_HEADER: &str = "Twitch-Eventsub-Message-Timestamp";
pub const MESSAGE_SIGNATURE_HEADER: &str = "Twitch-Eventsub-Message-Signature";
pub const MESSAGE_TYPE_HEADER: &str = "Twitch-Eventsub-Message-Type";

const SIGNATURE_PREFIX: &str = "sha256=";

/// Verifies webhook payload signatures with the shared secret.
#[derive(Clone)]
pub struct WebhookVerifier {
	secret: SecretString,
}

impl WebhookVerifier {
	pub fn new(secret: SecretString) -> Self {
		Self { secret }
	}

	/// Compute the expected signature for (message id ‖ timestamp ‖ body):
	/// HMAC-SHA256, hex-encoded, `sha256=`-prefixed.
	pub fn compute_signature(&self, message_id: &str, timestamp: &str, body: &[u8]) -> String {
		let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.expose().as_bytes()).expect("hmac key");
		mac.update(message_id.as_bytes());
		mac.update(timestamp.as_bytes());
		mac.update(body);
		format!("{SIGNATURE_PREFIX}{}", hex_encode(&mac.finalize().into_bytes()))
	}

	/// Constant-time comparison against the provided signature header.
	pub fn verify(&self, message_id: &str, timestamp: &str, body: &[u8], provided: &str) -> bool {
		let expected = self.compute_signature(message_id, timestamp, body);
		constant_time_eq(expected.as_bytes(), provided.trim().as_bytes())
	}
}

fn hex_encode(bytes: &[u8]) -> String {
	let mut out = String::with_capacity(bytes.len() * 2);
	for b in bytes {
		out.push_str(&format!("{b:02x}"));
	}
	out
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

/// Classified webhook message.
#[derive(Debug)]
pub enum WebhookMessage {
	/// Challenge handshake: echo the token back as plain text.
	Verification { challenge: String },

	/// Subscription revoked upstream: acknowledge, no state change.
	Revocation,

	/// A notification to hand to the subscription-handling collaborator.
	Notification {
		subscription_type: String,
		event: serde_json::Value,
	},
}

#[derive(Debug, serde::Deserialize)]
struct WebhookEnvelope {
	#[serde(default)]
	challenge: Option<String>,
	#[serde(default)]
	subscription: Option<WebhookSubscription>,
	#[serde(default)]
	event: Option<serde_json::Value>,
}

#[derive(Debug, serde::Deserialize)]
struct WebhookSubscription {
	#[serde(rename = "type")]
	subscription_type: String,
}

/// Classify a verified payload by its message-type header.
pub fn classify_message(message_type: &str, body: &[u8]) -> anyhow::Result<WebhookMessage> {
	let envelope: WebhookEnvelope = serde_json::from_slice(body).context("parse webhook payload")?;

	match message_type {
		"webhook_callback_verification" => {
			let challenge = envelope
				.challenge
				.ok_or_else(|| anyhow!("verification message without challenge"))?;
			Ok(WebhookMessage::Verification { challenge })
		}
		"revocation" => Ok(WebhookMessage::Revocation),
		"notification" => {
			let subscription_type = envelope
				.subscription
				.map(|s| s.subscription_type)
				.ok_or_else(|| anyhow!("notification without subscription type"))?;
			let event = envelope.event.ok_or_else(|| anyhow!("notification without event"))?;
			Ok(WebhookMessage::Notification {
				subscription_type,
				event,
			})
		}
		other => Err(anyhow!("unknown webhook message type: {other}")),
	}
}

/// Collaborator that consumes subscription notifications. Benefit
/// bookkeeping itself lives outside the hub.
pub trait NotificationSink: Send + Sync {
	fn handle_notification(&self, subscription_type: &str, event: &serde_json::Value);
}

/// Default sink: structured log only.
pub struct LoggingNotificationSink;

impl NotificationSink for LoggingNotificationSink {
	fn handle_notification(&self, subscription_type: &str, event: &serde_json::Value) {
		info!(%subscription_type, event = %event, "subscription notification received");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	fn verifier() -> WebhookVerifier {
		WebhookVerifier::new(SecretString::new("s3cret-signing-key"))
	}

	#[test]
	fn accepts_correctly_signed_payload() {
		let v = verifier();
		let body = br#"{"subscription":{"type":"channel.subscribe"},"event":{"user_id":"1"}}"#;
		let signature = v.compute_signature("msg-1", "2024-06-01T00:00:00Z", body);

		assert!(signature.starts_with("sha256="));
		assert!(v.verify("msg-1", "2024-06-01T00:00:00Z", body, &signature));
	}

	#[test]
	fn rejects_tampered_body_and_wrong_signature() {
		let v = verifier();
		let body = br#"{"event":"original"}"#;
		let signature = v.compute_signature("msg-1", "ts", body);

		assert!(!v.verify("msg-1", "ts", br#"{"event":"tampered"}"#, &signature));
		assert!(!v.verify("msg-2", "ts", body, &signature));
		assert!(!v.verify("msg-1", "ts", body, "sha256=deadbeef"));

		let other = WebhookVerifier::new(SecretString::new("different-secret"));
		assert!(!other.verify("msg-1", "ts", body, &signature));
	}

	#[test]
	fn classifies_message_types() {
		let verification = br#"{"challenge":"pong-token","subscription":{"type":"channel.subscribe"}}"#;
		match classify_message("webhook_callback_verification", verification).unwrap() {
			WebhookMessage::Verification { challenge } => assert_eq!(challenge, "pong-token"),
			other => panic!("expected verification, got {other:?}"),
		}

		let revocation = br#"{"subscription":{"type":"channel.subscribe"}}"#;
		assert!(matches!(
			classify_message("revocation", revocation).unwrap(),
			WebhookMessage::Revocation
		));

		let notification = br#"{"subscription":{"type":"channel.subscribe"},"event":{"tier":"1000"}}"#;
		match classify_message("notification", notification).unwrap() {
			WebhookMessage::Notification { subscription_type, .. } => {
				assert_eq!(subscription_type, "channel.subscribe");
			}
			other => panic!("expected notification, got {other:?}"),
		}

		assert!(classify_message("mystery", b"{}").is_err());
	}

	proptest! {
		#[test]
		fn sign_then_verify_roundtrips(id in "[a-zA-Z0-9-]{1,32}", ts in "[ -~]{1,32}", body in proptest::collection::vec(any::<u8>(), 0..512)) {
			let v = verifier();
			let signature = v.compute_signature(&id, &ts, &body);
			prop_assert!(v.verify(&id, &ts, &body, &signature));
		}

		#[test]
		fn flipped_byte_never_verifies(body in proptest::collection::vec(any::<u8>(), 1..256), flip in 0usize..256) {
			let v = verifier();
			let signature = v.compute_signature("id", "ts", &body);

			let mut tampered = body.clone();
			let idx = flip % tampered.len();
			tampered[idx] ^= 0x01;

			prop_assert!(!v.verify("id", "ts", &tampered, &signature));
		}
	}
}
