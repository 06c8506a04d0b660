#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use unichat_domain::Platform;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rsa::RsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;

use crate::{
	ChatConnector, ConnectorAuth, ConnectorControl, ConnectorControlRx, ConnectorEvent, ConnectorEventTx, NormalizedMessage,
	SecretString, new_session_id, status, status_error, validate_message,
};

#[derive(Clone)]
pub struct KickConfig {
	pub base_url: String,
	pub access_token: SecretString,
	pub broadcaster_slug: String,
	pub webhook_bind: Option<SocketAddr>,
	pub webhook_path: String,
	/// PEM-encoded RSA public key Kick signs webhook payloads with.
	pub public_key_pem: Option<String>,
	pub verify_signatures: bool,
}

impl KickConfig {
	pub fn new(access_token: SecretString, broadcaster_slug: impl Into<String>) -> Self {
		Self {
			base_url: "https://api.kick.com".to_string(),
			access_token,
			broadcaster_slug: broadcaster_slug.into(),
			webhook_bind: None,
			webhook_path: "/kick/events".to_string(),
			public_key_pem: None,
			verify_signatures: true,
		}
	}
}

/// Kick connector. Kick delivers chat through signed webhooks rather than a
/// persistent socket, so the run loop owns a small hyper server plus the
/// control channel.
pub struct KickChatConnector {
	cfg: KickConfig,
	last_auth_error_notice: Option<String>,
}

impl KickChatConnector {
	pub fn new(cfg: KickConfig) -> Self {
		Self {
			cfg,
			last_auth_error_notice: None,
		}
	}

	fn maybe_notice_auth_issue(&mut self, reason: &str, events_tx: &ConnectorEventTx) {
		if self.last_auth_error_notice.as_deref() != Some(reason) {
			self.last_auth_error_notice = Some(reason.to_string());
			warn!(platform = %Platform::Kick, %reason, "kick connector configuration problem");
			let _ = events_tx.try_send(status(Platform::Kick, false, reason.to_string()));
		}
	}
}

/// Verify Kick's webhook signature: RSA PKCS1v15 over SHA-256 of
/// `message_id.timestamp.body`, base64-encoded.
pub(crate) fn verify_kick_signature(
	public_key: &RsaPublicKey,
	message_id: &str,
	timestamp: &str,
	body: &[u8],
	signature_b64: &str,
) -> bool {
	let mut signed = Vec::with_capacity(message_id.len() + timestamp.len() + body.len() + 2);
	signed.extend_from_slice(message_id.as_bytes());
	signed.push(b'.');
	signed.extend_from_slice(timestamp.as_bytes());
	signed.push(b'.');
	signed.extend_from_slice(body);
	let hash = Sha256::digest(&signed);

	let Ok(signature) = BASE64_STANDARD.decode(signature_b64) else {
		return false;
	};

	public_key
		.verify(rsa::pkcs1v15::Pkcs1v15Sign::new::<Sha256>(), &hash, &signature)
		.is_ok()
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct KickWebhookChatMessage {
	#[allow(dead_code)]
	pub(crate) message_id: String,
	pub(crate) content: String,
	pub(crate) created_at: Option<String>,
	pub(crate) sender: KickWebhookUser,
	pub(crate) broadcaster: Option<KickWebhookUser>,
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct KickWebhookUser {
	pub(crate) user_id: u64,
	pub(crate) username: String,
	pub(crate) channel_slug: String,
	pub(crate) identity: Option<KickWebhookIdentity>,
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct KickWebhookIdentity {
	#[serde(default)]
	pub(crate) badges: Vec<KickWebhookBadge>,
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct KickWebhookBadge {
	#[serde(rename = "type")]
	pub(crate) badge_type: Option<String>,
}

pub(crate) fn normalize_webhook_chat(payload: KickWebhookChatMessage) -> NormalizedMessage {
	let mut msg = NormalizedMessage::new(
		Platform::Kick,
		payload.sender.user_id.to_string(),
		payload.sender.username.clone(),
		payload.content,
	);

	msg.badges = payload
		.sender
		.identity
		.as_ref()
		.map(|identity| {
			identity
				.badges
				.iter()
				.filter_map(|badge| badge.badge_type.as_ref().map(|t| format!("kick:{t}")))
				.collect::<Vec<_>>()
		})
		.unwrap_or_default();

	if let Some(ts) = payload.created_at.as_deref()
		&& let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(ts)
	{
		msg.sent_at = SystemTime::from(parsed.with_timezone(&chrono::Utc));
	}

	msg
}

#[derive(Clone)]
struct KickWebhookState {
	path: String,
	broadcaster_slug: String,
	verify_signatures: bool,
	public_key: Option<RsaPublicKey>,
	events_tx: ConnectorEventTx,
}

async fn run_kick_webhook_server(bind: SocketAddr, state: KickWebhookState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_kick_webhook(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "kick webhook connection error");
			}
		});
	}
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
	Response::builder().status(status).body(Full::new(Bytes::new())).unwrap()
}

async fn handle_kick_webhook(
	req: Request<Incoming>,
	state: KickWebhookState,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let (parts, body) = req.into_parts();

	if parts.method != Method::POST {
		return Ok(empty_response(StatusCode::METHOD_NOT_ALLOWED));
	}

	if parts.uri.path() != state.path {
		return Ok(empty_response(StatusCode::NOT_FOUND));
	}

	metrics::counter!("unichat_kick_webhook_requests_total").increment(1);

	let headers = parts.headers;
	let event_type = headers.get("Kick-Event-Type").and_then(|v| v.to_str().ok()).unwrap_or("");
	let message_id = headers
		.get("Kick-Event-Message-Id")
		.and_then(|v| v.to_str().ok())
		.unwrap_or("");
	let timestamp = headers
		.get("Kick-Event-Message-Timestamp")
		.and_then(|v| v.to_str().ok())
		.unwrap_or("");
	let signature = headers
		.get("Kick-Event-Signature")
		.and_then(|v| v.to_str().ok())
		.unwrap_or("");

	let body_bytes = match body.collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(err) => {
			warn!(error = %err, "kick webhook body read failed");
			metrics::counter!("unichat_kick_webhook_body_errors_total").increment(1);
			return Ok(empty_response(StatusCode::BAD_REQUEST));
		}
	};

	if state.verify_signatures {
		let Some(public_key) = state.public_key.as_ref() else {
			metrics::counter!("unichat_kick_webhook_signature_missing_total").increment(1);
			return Ok(empty_response(StatusCode::UNAUTHORIZED));
		};
		if message_id.is_empty() || timestamp.is_empty() || signature.is_empty() {
			metrics::counter!("unichat_kick_webhook_signature_missing_total").increment(1);
			return Ok(empty_response(StatusCode::UNAUTHORIZED));
		}
		if !verify_kick_signature(public_key, message_id, timestamp, body_bytes.as_ref(), signature) {
			metrics::counter!("unichat_kick_webhook_signature_invalid_total").increment(1);
			return Ok(empty_response(StatusCode::UNAUTHORIZED));
		}
	}

	if event_type != "chat.message.sent" {
		metrics::counter!("unichat_kick_webhook_ignored_total").increment(1);
		return Ok(empty_response(StatusCode::NO_CONTENT));
	}

	let payload: KickWebhookChatMessage = match serde_json::from_slice(&body_bytes) {
		Ok(v) => v,
		Err(err) => {
			warn!(error = %err, "kick webhook payload parse failed");
			metrics::counter!("unichat_kick_webhook_parse_errors_total").increment(1);
			return Ok(empty_response(StatusCode::BAD_REQUEST));
		}
	};

	let channel_slug = payload
		.broadcaster
		.as_ref()
		.map(|b| b.channel_slug.as_str())
		.unwrap_or(payload.sender.channel_slug.as_str());
	if !channel_slug.eq_ignore_ascii_case(&state.broadcaster_slug) {
		metrics::counter!("unichat_kick_webhook_unsubscribed_total").increment(1);
		return Ok(empty_response(StatusCode::NO_CONTENT));
	}

	let normalized = normalize_webhook_chat(payload);
	if let Err(err) = validate_message(&normalized) {
		debug!(error = %err, "dropping invalid kick chat message");
		return Ok(empty_response(StatusCode::NO_CONTENT));
	}

	if state.events_tx.send(ConnectorEvent::Chat(Box::new(normalized))).await.is_err() {
		warn!("kick webhook ingest channel closed");
		metrics::counter!("unichat_kick_webhook_ingest_errors_total").increment(1);
	} else {
		metrics::counter!("unichat_kick_webhook_ingest_total").increment(1);
	}

	Ok(empty_response(StatusCode::OK))
}

#[async_trait]
impl ChatConnector for KickChatConnector {
	fn platform(&self) -> Platform {
		Platform::Kick
	}

	async fn run(self: Box<Self>, mut control_rx: ConnectorControlRx, events_tx: ConnectorEventTx) -> anyhow::Result<()> {
		let mut this = *self;
		let session_id = new_session_id();
		let platform = this.platform();

		if this.cfg.broadcaster_slug.trim().is_empty() {
			this.maybe_notice_auth_issue("kick broadcaster_slug not configured; connector idle", &events_tx);
		}

		if let Some(bind) = this.cfg.webhook_bind {
			let public_key = this
				.cfg
				.public_key_pem
				.as_deref()
				.and_then(|pem| match RsaPublicKey::from_public_key_pem(pem) {
					Ok(key) => Some(key),
					Err(err) => {
						warn!(error = %err, "kick webhook public key is not valid PEM");
						None
					}
				});

			if this.cfg.verify_signatures && public_key.is_none() {
				// Fail closed: the server still answers, but rejects every
				// payload until a key is configured.
				this.maybe_notice_auth_issue(
					"kick signature verification enabled without a public key; rejecting webhooks",
					&events_tx,
				);
			}

			let state = KickWebhookState {
				path: this.cfg.webhook_path.clone(),
				broadcaster_slug: this.cfg.broadcaster_slug.clone(),
				verify_signatures: this.cfg.verify_signatures,
				public_key,
				events_tx: events_tx.clone(),
			};

			let status_detail = format!("kick webhook listening on {bind}{}", this.cfg.webhook_path);
			let _ = events_tx.try_send(status(platform, true, status_detail));

			let events_tx_for_server = events_tx.clone();
			tokio::spawn(async move {
				if let Err(err) = run_kick_webhook_server(bind, state).await {
					warn!(error = %err, "kick webhook server stopped");
					let _ = events_tx_for_server.try_send(status_error(Platform::Kick, "kick webhook server stopped", err));
				}
			});
		} else {
			this.maybe_notice_auth_issue("kick webhook ingestion disabled (no webhook_bind configured)", &events_tx);
		}

		info!(%platform, %session_id, "kick connector online");

		loop {
			let cmd = control_rx.recv().await;
			let Some(cmd) = cmd else {
				info!(%platform, "kick connector control channel closed; shutting down");
				break;
			};

			match cmd {
				ConnectorControl::UpdateAuth { auth } => {
					if let ConnectorAuth::BearerToken { access_token, .. } = auth {
						this.cfg.access_token = access_token;
						this.last_auth_error_notice = None;
						let _ = events_tx.try_send(status(platform, true, "kick auth updated"));
					}
				}
				ConnectorControl::Shutdown => {
					info!(%platform, "kick connector received shutdown");
					break;
				}
			}
		}

		let _ = events_tx.try_send(status(platform, false, "kick connector offline"));
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn normalizes_webhook_chat_payload() {
		let payload: KickWebhookChatMessage = serde_json::from_str(
			r#"{
				"message_id": "8d342c12-6b21-4a32-9a3e-0f5ddabc0f28",
				"content": "hello kick",
				"created_at": "2024-03-01T18:22:03+00:00",
				"sender": {
					"user_id": 91827,
					"username": "kickviewer",
					"channel_slug": "somechannel",
					"identity": { "badges": [{ "type": "moderator" }, { "type": "og" }] }
				},
				"broadcaster": {
					"user_id": 555,
					"username": "somechannel",
					"channel_slug": "somechannel",
					"identity": null
				}
			}"#,
		)
		.unwrap();

		let msg = normalize_webhook_chat(payload);
		assert_eq!(msg.platform, Platform::Kick);
		assert_eq!(msg.user_id, "91827");
		assert_eq!(msg.username, "kickviewer");
		assert_eq!(msg.text, "hello kick");
		assert_eq!(msg.badges, vec!["kick:moderator", "kick:og"]);
	}

	#[test]
	fn signature_check_rejects_garbage_base64() {
		// Any syntactically valid RSA key works for the negative path.
		let pem = rsa_test_key();
		let key = RsaPublicKey::from_public_key_pem(&pem).unwrap();
		assert!(!verify_kick_signature(&key, "id", "ts", b"body", "!!not-base64!!"));
		assert!(!verify_kick_signature(&key, "id", "ts", b"body", "AAAA"));
	}

	fn rsa_test_key() -> String {
		// 512-bit throwaway key; only exercises decode + mismatch paths.
		concat!(
			"-----BEGIN PUBLIC KEY-----\n",
			"MFwwDQYJKoZIhvcNAQEBBQADSwAwSAJBAKj34GkxFhD90vcNLYLInFEX6Ppy1tPf\n",
			"9Cnzj4p4WGeKLs1Pt8QuKUpRKfFLfRYC9AIKjbJTWit+CqvjWYzvQwECAwEAAQ==\n",
			"-----END PUBLIC KEY-----\n",
		)
		.to_string()
	}
}
