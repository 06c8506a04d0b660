#![forbid(unsafe_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, warn};
use unichat_domain::Platform;
use unichat_platform::SecretString;
use unichat_platform::youtube::YouTubeLiveState;

use crate::server::dispatch::{DispatchError, ModerationDispatcher};
use crate::server::feed::{FeedSettings, serve_feed};
use crate::server::hub::{EventHub, HubEvent};
use crate::server::reaper::TimeoutReaper;
use crate::server::send_queue::{SendError, SendQueue};
use crate::server::store::ActionStore;
use crate::server::webhook::{
	MESSAGE_ID_HEADER, MESSAGE_SIGNATURE_HEADER, MESSAGE_TIMESTAMP_HEADER, MESSAGE_TYPE_HEADER, NotificationSink,
	WebhookMessage, WebhookVerifier, classify_message, constant_time_eq,
};

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// Everything the HTTP surface needs, wired once at startup.
#[derive(Clone)]
pub struct HttpContext {
	pub hub: EventHub,
	pub dispatcher: Arc<ModerationDispatcher>,
	pub send_queue: SendQueue,
	pub reaper: Arc<TimeoutReaper>,
	pub store: Arc<dyn ActionStore>,
	pub webhook: Option<WebhookVerifier>,
	pub notification_sink: Arc<dyn NotificationSink>,
	pub youtube_live: Option<YouTubeLiveState>,
	pub cron_secret: Option<SecretString>,
	pub quarantine_max_age: Duration,
	pub feed: FeedSettings,
	pub health: HealthState,
}

type HttpBody = BoxBody<Bytes, Infallible>;

fn full(bytes: impl Into<Bytes>) -> HttpBody {
	Full::new(bytes.into()).boxed()
}

fn empty_response(status: StatusCode) -> Response<HttpBody> {
	Response::builder().status(status).body(full(Bytes::new())).unwrap()
}

fn text_response(status: StatusCode, text: impl Into<String>) -> Response<HttpBody> {
	Response::builder()
		.status(status)
		.header("Content-Type", "text/plain; charset=utf-8")
		.body(full(text.into()))
		.unwrap()
}

fn json_response(status: StatusCode, value: &impl Serialize) -> Response<HttpBody> {
	match serde_json::to_vec(value) {
		Ok(body) => Response::builder()
			.status(status)
			.header("Content-Type", "application/json")
			.body(full(body))
			.unwrap(),
		Err(e) => {
			warn!(error = %e, "failed to serialize response body");
			empty_response(StatusCode::INTERNAL_SERVER_ERROR)
		}
	}
}

#[derive(Serialize)]
struct ErrorBody {
	error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response<HttpBody> {
	json_response(
		status,
		&ErrorBody {
			error: message.into(),
		},
	)
}

fn dispatch_error_response(err: DispatchError) -> Response<HttpBody> {
	let status = match &err {
		DispatchError::Unauthorized(_) => StatusCode::FORBIDDEN,
		DispatchError::Validation(_) => StatusCode::BAD_REQUEST,
		DispatchError::NotFound(_) => StatusCode::NOT_FOUND,
		DispatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
	};
	error_response(status, err.to_string())
}

pub async fn run_http_server(bind: SocketAddr, ctx: HttpContext) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let ctx = ctx.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle(req, ctx.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				debug!(error = %err, "http connection error");
			}
		});
	}
}

async fn handle(req: Request<Incoming>, ctx: HttpContext) -> Result<Response<HttpBody>, hyper::Error> {
	let method = req.method().clone();
	let path = req.uri().path().to_string();

	let response = match (method, path.as_str()) {
		(Method::GET, "/healthz") => text_response(StatusCode::OK, "ok"),
		(Method::GET, "/readyz") => {
			if ctx.health.is_ready() {
				text_response(StatusCode::OK, "ready")
			} else {
				text_response(StatusCode::SERVICE_UNAVAILABLE, "not-ready")
			}
		}

		(Method::GET, "/v1/feed") => serve_feed(ctx.hub.clone(), ctx.feed.clone()),

		(Method::POST, "/v1/webhooks/subscriptions") => handle_webhook(req, &ctx).await?,

		(Method::POST, "/v1/moderation/timeout") => handle_timeout(req, &ctx).await?,
		(Method::POST, "/v1/moderation/ban") => handle_ban(req, &ctx).await?,
		(Method::POST, "/v1/moderation/unban") => handle_unban(req, &ctx).await?,

		(Method::POST, "/v1/chat/send") => handle_chat_send(req, &ctx).await?,

		(Method::POST, "/v1/status/refresh") => handle_status_refresh(req, &ctx).await?,

		(Method::POST, "/v1/cron/reapply-timeouts") => handle_cron_reapply(req, &ctx).await?,
		(Method::POST, "/v1/cron/cleanup-quarantine") => handle_cron_quarantine(req, &ctx).await?,

		_ => empty_response(StatusCode::NOT_FOUND),
	};

	Ok(response)
}

async fn read_body(req: Request<Incoming>) -> Result<(hyper::http::request::Parts, Bytes), hyper::Error> {
	let (parts, body) = req.into_parts();
	let bytes = body.collect().await?.to_bytes();
	Ok((parts, bytes))
}

fn parse_json<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, Response<HttpBody>> {
	serde_json::from_slice(bytes).map_err(|e| error_response(StatusCode::BAD_REQUEST, format!("invalid request body: {e}")))
}

fn parse_platform(value: &str) -> Result<Platform, Response<HttpBody>> {
	value
		.parse::<Platform>()
		.map_err(|e| error_response(StatusCode::BAD_REQUEST, e.to_string()))
}

#[derive(Deserialize)]
struct TimeoutRequest {
	actor_id: String,
	platform: String,
	target_user_id: String,
	duration_seconds: u32,
	#[serde(default)]
	reason: Option<String>,
}

async fn handle_timeout(req: Request<Incoming>, ctx: &HttpContext) -> Result<Response<HttpBody>, hyper::Error> {
	let (_parts, bytes) = read_body(req).await?;
	let body: TimeoutRequest = match parse_json(&bytes) {
		Ok(v) => v,
		Err(resp) => return Ok(resp),
	};
	let platform = match parse_platform(&body.platform) {
		Ok(p) => p,
		Err(resp) => return Ok(resp),
	};

	let outcome = ctx
		.dispatcher
		.apply_timeout(
			platform,
			&body.target_user_id,
			body.duration_seconds,
			body.reason,
			&body.actor_id,
		)
		.await;

	Ok(match outcome {
		Ok(outcome) => json_response(StatusCode::OK, &outcome),
		Err(e) => dispatch_error_response(e),
	})
}

#[derive(Deserialize)]
struct BanRequest {
	actor_id: String,
	platform: String,
	target_user_id: String,
	#[serde(default)]
	reason: Option<String>,
}

async fn handle_ban(req: Request<Incoming>, ctx: &HttpContext) -> Result<Response<HttpBody>, hyper::Error> {
	let (_parts, bytes) = read_body(req).await?;
	let body: BanRequest = match parse_json(&bytes) {
		Ok(v) => v,
		Err(resp) => return Ok(resp),
	};
	let platform = match parse_platform(&body.platform) {
		Ok(p) => p,
		Err(resp) => return Ok(resp),
	};

	let outcome = ctx
		.dispatcher
		.apply_ban(platform, &body.target_user_id, body.reason, &body.actor_id)
		.await;

	Ok(match outcome {
		Ok(outcome) => json_response(StatusCode::OK, &outcome),
		Err(e) => dispatch_error_response(e),
	})
}

#[derive(Deserialize)]
struct UnbanRequest {
	actor_id: String,
	platform: String,
	target_user_id: String,
}

async fn handle_unban(req: Request<Incoming>, ctx: &HttpContext) -> Result<Response<HttpBody>, hyper::Error> {
	let (_parts, bytes) = read_body(req).await?;
	let body: UnbanRequest = match parse_json(&bytes) {
		Ok(v) => v,
		Err(resp) => return Ok(resp),
	};
	let platform = match parse_platform(&body.platform) {
		Ok(p) => p,
		Err(resp) => return Ok(resp),
	};

	let outcome = ctx
		.dispatcher
		.apply_unban(platform, &body.target_user_id, &body.actor_id)
		.await;

	Ok(match outcome {
		Ok(outcome) => json_response(StatusCode::OK, &outcome),
		Err(e) => dispatch_error_response(e),
	})
}

#[derive(Deserialize)]
struct ChatSendRequest {
	platform: String,
	text: String,
}

#[derive(Serialize)]
struct ChatSendResponse {
	ok: bool,
}

async fn handle_chat_send(req: Request<Incoming>, ctx: &HttpContext) -> Result<Response<HttpBody>, hyper::Error> {
	let (_parts, bytes) = read_body(req).await?;
	let body: ChatSendRequest = match parse_json(&bytes) {
		Ok(v) => v,
		Err(resp) => return Ok(resp),
	};
	let platform = match parse_platform(&body.platform) {
		Ok(p) => p,
		Err(resp) => return Ok(resp),
	};
	if body.text.trim().is_empty() {
		return Ok(error_response(StatusCode::BAD_REQUEST, "text must be non-empty"));
	}

	Ok(match ctx.send_queue.enqueue(platform, body.text).await {
		Ok(()) => json_response(StatusCode::OK, &ChatSendResponse { ok: true }),
		Err(SendError::NotRegistered(p)) => error_response(StatusCode::NOT_FOUND, format!("no sender for platform {p}")),
		Err(SendError::WorkerStopped) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "send worker stopped"),
		Err(SendError::Platform(detail)) => error_response(StatusCode::BAD_GATEWAY, detail),
	})
}

#[derive(Deserialize, Default)]
struct StatusRefreshRequest {
	#[serde(default)]
	platform: Option<String>,
}

async fn handle_status_refresh(req: Request<Incoming>, ctx: &HttpContext) -> Result<Response<HttpBody>, hyper::Error> {
	let (_parts, bytes) = read_body(req).await?;
	let body: StatusRefreshRequest = if bytes.is_empty() {
		StatusRefreshRequest::default()
	} else {
		match parse_json(&bytes) {
			Ok(v) => v,
			Err(resp) => return Ok(resp),
		}
	};

	let platform = match body.platform.as_deref() {
		None => Platform::YouTube,
		Some(raw) => match parse_platform(raw) {
			Ok(p) => p,
			Err(resp) => return Ok(resp),
		},
	};

	// Push-based connectors report status continuously; only the polling
	// platform exposes a manual liveness check.
	if platform != Platform::YouTube {
		return Ok(error_response(
			StatusCode::BAD_REQUEST,
			"manual status refresh is only supported for youtube",
		));
	}

	let Some(live) = ctx.youtube_live.as_ref() else {
		return Ok(error_response(StatusCode::NOT_FOUND, "youtube is not configured"));
	};

	match live.check_live_now().await {
		Ok(status) => {
			// Publish the fresh result so every subscriber converges
			// without polling themselves.
			ctx.hub.publish(HubEvent::Status(status.clone())).await;
			json_ok_status(status)
		}
		Err(e) => {
			warn!(error = %e, "manual youtube liveness check failed");
			Ok(error_response(StatusCode::BAD_GATEWAY, e.to_string()))
		}
	}
}

fn json_ok_status(status: unichat_platform::PlatformStatusEvent) -> Result<Response<HttpBody>, hyper::Error> {
	#[derive(Serialize)]
	struct StatusBody {
		platform: Platform,
		live: bool,
		#[serde(skip_serializing_if = "Option::is_none")]
		stream_id: Option<String>,
	}

	Ok(json_response(
		StatusCode::OK,
		&StatusBody {
			platform: status.platform,
			live: status.live,
			stream_id: status.stream_id,
		},
	))
}

async fn handle_webhook(req: Request<Incoming>, ctx: &HttpContext) -> Result<Response<HttpBody>, hyper::Error> {
	let Some(verifier) = ctx.webhook.as_ref() else {
		// Fail closed when no secret is configured.
		return Ok(error_response(StatusCode::SERVICE_UNAVAILABLE, "webhook secret not configured"));
	};

	let (parts, bytes) = read_body(req).await?;
	let headers = parts.headers;

	let message_id = headers.get(MESSAGE_ID_HEADER).and_then(|v| v.to_str().ok()).unwrap_or("");
	let timestamp = headers
		.get(MESSAGE_TIMESTAMP_HEADER)
		.and_then(|v| v.to_str().ok())
		.unwrap_or("");
	let signature = headers
		.get(MESSAGE_SIGNATURE_HEADER)
		.and_then(|v| v.to_str().ok())
		.unwrap_or("");
	let message_type = headers.get(MESSAGE_TYPE_HEADER).and_then(|v| v.to_str().ok()).unwrap_or("");

	metrics::counter!("unichat_webhook_requests_total").increment(1);

	if message_id.is_empty() || timestamp.is_empty() || signature.is_empty() {
		metrics::counter!("unichat_webhook_rejected_total").increment(1);
		return Ok(error_response(StatusCode::FORBIDDEN, "missing signature headers"));
	}

	if !verifier.verify(message_id, timestamp, &bytes, signature) {
		metrics::counter!("unichat_webhook_rejected_total").increment(1);
		return Ok(error_response(StatusCode::FORBIDDEN, "signature mismatch"));
	}

	match classify_message(message_type, &bytes) {
		Ok(WebhookMessage::Verification { challenge }) => Ok(text_response(StatusCode::OK, challenge)),
		Ok(WebhookMessage::Revocation) => {
			debug!("webhook subscription revoked upstream");
			Ok(empty_response(StatusCode::OK))
		}
		Ok(WebhookMessage::Notification {
			subscription_type,
			event,
		}) => {
			ctx.notification_sink.handle_notification(&subscription_type, &event);
			Ok(empty_response(StatusCode::NO_CONTENT))
		}
		Err(e) => Ok(error_response(StatusCode::BAD_REQUEST, e.to_string())),
	}
}

/// Cron endpoints accept the shared secret in an authorization header or a
/// `key` query parameter.
fn cron_authorized(parts: &hyper::http::request::Parts, secret: &SecretString) -> bool {
	if let Some(auth) = parts.headers.get("Authorization").and_then(|v| v.to_str().ok())
		&& let Some(token) = auth.strip_prefix("Bearer ")
		&& constant_time_eq(token.trim().as_bytes(), secret.expose().as_bytes())
	{
		return true;
	}

	if let Some(query) = parts.uri.query() {
		for pair in query.split('&') {
			if let Some(value) = pair.strip_prefix("key=")
				&& constant_time_eq(value.as_bytes(), secret.expose().as_bytes())
			{
				return true;
			}
		}
	}

	false
}

#[derive(Serialize)]
struct CronResponse {
	processed: u64,
}

async fn handle_cron_reapply(req: Request<Incoming>, ctx: &HttpContext) -> Result<Response<HttpBody>, hyper::Error> {
	let (parts, _bytes) = read_body(req).await?;

	let Some(secret) = ctx.cron_secret.as_ref() else {
		return Ok(error_response(StatusCode::SERVICE_UNAVAILABLE, "cron secret not configured"));
	};
	if !cron_authorized(&parts, secret) {
		return Ok(error_response(StatusCode::FORBIDDEN, "bad cron credentials"));
	}

	match ctx.reaper.run_sweep(SystemTime::now()).await {
		Ok(stats) => Ok(json_response(
			StatusCode::OK,
			&CronResponse {
				processed: stats.processed(),
			},
		)),
		Err(e) => {
			warn!(error = %e, "cron-triggered timeout sweep failed");
			Ok(error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
		}
	}
}

async fn handle_cron_quarantine(req: Request<Incoming>, ctx: &HttpContext) -> Result<Response<HttpBody>, hyper::Error> {
	let (parts, _bytes) = read_body(req).await?;

	let Some(secret) = ctx.cron_secret.as_ref() else {
		return Ok(error_response(StatusCode::SERVICE_UNAVAILABLE, "cron secret not configured"));
	};
	if !cron_authorized(&parts, secret) {
		return Ok(error_response(StatusCode::FORBIDDEN, "bad cron credentials"));
	}

	let cutoff = SystemTime::now() - ctx.quarantine_max_age;
	match ctx.store.purge_unlinked_accounts(cutoff).await {
		Ok(processed) => Ok(json_response(StatusCode::OK, &CronResponse { processed })),
		Err(e) => {
			warn!(error = %e, "quarantine cleanup failed");
			Ok(error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
		}
	}
}
