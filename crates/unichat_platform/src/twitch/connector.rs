#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};
use tungstenite::protocol::Message;
use unichat_domain::Platform;
use url::Url;

use super::api::TwitchApiClient;
use super::eventsub;
use crate::{
	ConnectorAuth, ConnectorControl, ConnectorControlRx, ConnectorEvent, ConnectorEventTx, ConnectorState, ChatConnector,
	SecretString, backoff_delay, new_session_id, status, status_error, validate_message,
};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub(crate) type TwitchWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub(crate) type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<TwitchWs>> + Send + Sync>;

/// Twitch EventSub connector configuration.
#[derive(Clone)]
pub struct TwitchConfig {
	pub client_id: String,
	pub access_token: SecretString,
	pub broadcaster_login: String,
	pub eventsub_ws_url: String,
	pub api_base_url: String,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	pub ws_connector: Option<WsConnector>,
}

impl TwitchConfig {
	pub fn new(client_id: impl Into<String>, access_token: SecretString, broadcaster_login: impl Into<String>) -> Self {
		Self {
			client_id: client_id.into(),
			access_token,
			broadcaster_login: broadcaster_login.into(),
			eventsub_ws_url: "wss://eventsub.wss.twitch.tv/ws".to_string(),
			api_base_url: "https://api.twitch.tv".to_string(),
			reconnect_min_delay: Duration::from_millis(500),
			reconnect_max_delay: Duration::from_secs(30),
			ws_connector: None,
		}
	}
}

/// Twitch EventSub websocket connector.
pub struct TwitchChatConnector {
	cfg: TwitchConfig,
	state: ConnectorState,
	broadcaster_id: Option<String>,
	token_user_id: Option<String>,
	last_auth_error_notice: Option<String>,
}

impl TwitchChatConnector {
	pub fn new(cfg: TwitchConfig) -> Self {
		Self {
			cfg,
			state: ConnectorState::Disconnected,
			broadcaster_id: None,
			token_user_id: None,
			last_auth_error_notice: None,
		}
	}

	fn set_state(&mut self, next: ConnectorState) {
		if self.state != next {
			debug!(platform = %Platform::Twitch, from = %self.state, to = %next, "twitch connector state");
			self.state = next;
		}
	}

	fn has_auth(&self) -> bool {
		!self.cfg.client_id.trim().is_empty() && !self.cfg.access_token.is_empty()
	}

	fn apply_auth_update(&mut self, auth: ConnectorAuth) {
		if let ConnectorAuth::BearerToken { access_token, user_id, .. } = auth {
			self.cfg.access_token = access_token;
			self.token_user_id = user_id.or(self.token_user_id.take());
			self.last_auth_error_notice = None;
		}
	}

	fn maybe_notice_auth_issue(&mut self, reason: &str, events_tx: &ConnectorEventTx) {
		if self.last_auth_error_notice.as_deref() != Some(reason) {
			self.last_auth_error_notice = Some(reason.to_string());
			warn!(platform = %Platform::Twitch, %reason, "twitch connector has no usable credentials");
			let _ = events_tx.try_send(status(Platform::Twitch, false, reason.to_string()));
		}
	}

	fn api_client(&self) -> anyhow::Result<TwitchApiClient> {
		TwitchApiClient::new(
			&self.cfg.api_base_url,
			self.cfg.client_id.clone(),
			self.cfg.access_token.expose().to_string(),
		)
	}

	async fn resolve_broadcaster_id(&mut self) -> anyhow::Result<String> {
		if let Some(id) = &self.broadcaster_id {
			return Ok(id.clone());
		}

		let login = self.cfg.broadcaster_login.clone();
		let api = self.api_client()?;
		let user = api
			.get_user_by_login(&login)
			.await?
			.with_context(|| format!("no helix user for broadcaster login={login}"))?;

		self.broadcaster_id = Some(user.id.clone());
		Ok(user.id)
	}

	async fn resolve_token_user_id(&mut self) -> anyhow::Result<String> {
		if let Some(id) = &self.token_user_id {
			return Ok(id.clone());
		}

		let api = self.api_client()?;
		let user = api.get_token_user().await?;
		self.token_user_id = Some(user.id.clone());
		Ok(user.id)
	}

	fn ws_connector(&self) -> WsConnector {
		if let Some(c) = &self.cfg.ws_connector {
			return c.clone();
		}

		Arc::new(|url: Url| {
			Box::pin(async move {
				let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
					.await
					.context("connect_async to eventsub ws")?;
				Ok(ws)
			}) as BoxFuture<'static, anyhow::Result<TwitchWs>>
		})
	}

	async fn read_until_welcome(ws: &mut TwitchWs) -> anyhow::Result<eventsub::EventSubWelcomeSession> {
		loop {
			let Some(msg) = ws.next().await else {
				return Err(anyhow::anyhow!("ws closed before welcome"));
			};
			let msg = msg.context("ws read")?;

			match msg {
				Message::Text(t) => {
					let ty = eventsub::peek_message_type(&t)?;
					if ty == "session_welcome" {
						let welcome = eventsub::parse_welcome(&t)?;
						return Ok(welcome.payload.session);
					}
				}
				Message::Ping(p) => {
					let _ = ws.send(Message::Pong(p)).await;
				}
				Message::Close(c) => {
					anyhow::bail!("ws closed before welcome: close={c:?}");
				}
				_ => {}
			}
		}
	}

	async fn run_loop(mut self, mut control_rx: ConnectorControlRx, events_tx: ConnectorEventTx) -> anyhow::Result<()> {
		let platform = Platform::Twitch;
		let connector_session_id = new_session_id();

		info!(%platform, session_id = %connector_session_id, "twitch connector starting");

		let mut reconnect_attempt: u32 = 0;

		'outer: loop {
			// Fail closed while credentials are missing: one notice, then
			// block on control messages instead of a tight retry loop.
			while !self.has_auth() {
				self.set_state(ConnectorState::Disconnected);
				self.maybe_notice_auth_issue("waiting for twitch credentials (client_id + access token)", &events_tx);

				match control_rx.recv().await {
					Some(ConnectorControl::UpdateAuth { auth }) => {
						self.apply_auth_update(auth);
					}
					Some(ConnectorControl::Shutdown) => {
						self.set_state(ConnectorState::Stopped);
						break 'outer;
					}
					None => return Ok(()),
				}
			}

			let delay = if reconnect_attempt == 0 {
				Duration::from_millis(0)
			} else {
				backoff_delay(reconnect_attempt, self.cfg.reconnect_min_delay, self.cfg.reconnect_max_delay)
			};

			if delay > Duration::from_millis(0) {
				self.set_state(ConnectorState::Reconnecting);
				debug!(%platform, ?delay, attempt = reconnect_attempt, "twitch reconnect backoff");
				tokio::select! {
					_ = sleep(delay) => {}
					cmd = control_rx.recv() => match cmd {
						Some(ConnectorControl::UpdateAuth { auth }) => self.apply_auth_update(auth),
						Some(ConnectorControl::Shutdown) | None => {
							self.set_state(ConnectorState::Stopped);
							break 'outer;
						}
					}
				}
			}

			self.set_state(ConnectorState::Connecting);

			let ws_url = match Url::parse(&self.cfg.eventsub_ws_url) {
				Ok(u) => u,
				Err(e) => {
					reconnect_attempt = reconnect_attempt.saturating_add(1);
					let _ = events_tx.try_send(status_error(platform, "invalid eventsub ws url", e));
					continue;
				}
			};

			let mut ws: TwitchWs = match (self.ws_connector())(ws_url).await {
				Ok(ws) => ws,
				Err(e) => {
					reconnect_attempt = reconnect_attempt.saturating_add(1);
					let _ = events_tx.try_send(status_error(platform, "failed to connect eventsub ws", e));
					continue;
				}
			};

			let welcome = match Self::read_until_welcome(&mut ws).await {
				Ok(w) => w,
				Err(e) => {
					reconnect_attempt = reconnect_attempt.saturating_add(1);
					let _ = events_tx.try_send(status_error(platform, "failed to read session_welcome", e));
					continue;
				}
			};

			let session_id = welcome.id.clone();
			let keepalive_timeout = Duration::from_secs(welcome.keepalive_timeout_seconds.unwrap_or(10).max(1));

			let subscribe_result: anyhow::Result<()> = async {
				let broadcaster_id = self.resolve_broadcaster_id().await?;
				let token_user_id = self.resolve_token_user_id().await?;
				let api = self.api_client()?;
				let created = api
					.create_chat_message_subscription(&session_id, &broadcaster_id, &token_user_id)
					.await?;
				if let Some(sub) = created.data.into_iter().next() {
					debug!(subscription_id = %sub.id, %broadcaster_id, "created channel.chat.message subscription");
				}
				Ok(())
			}
			.await;

			if let Err(e) = subscribe_result {
				reconnect_attempt = reconnect_attempt.saturating_add(1);
				let _ = ws.close(None).await;
				let _ = events_tx.try_send(status_error(platform, "failed to create chat subscription", e));
				continue;
			}

			reconnect_attempt = 0;
			self.set_state(ConnectorState::Connected);
			metrics::counter!("unichat_twitch_connected_total").increment(1);
			let _ = events_tx.try_send(status(
				platform,
				true,
				format!("eventsub connected (session_id={session_id})"),
			));

			let mut last_activity = Instant::now();

			loop {
				tokio::select! {
					cmd = control_rx.recv() => {
						match cmd {
							Some(ConnectorControl::UpdateAuth { auth }) => {
								self.apply_auth_update(auth);
							}
							Some(ConnectorControl::Shutdown) | None => {
								info!(%platform, "twitch connector received shutdown");
								let _ = ws.close(None).await;
								self.set_state(ConnectorState::Stopped);
								break 'outer;
							}
						}
					}

					msg = ws.next() => {
						let Some(msg) = msg else {
							let _ = events_tx.try_send(status(platform, false, "eventsub ws ended"));
							break;
						};

						let msg = match msg {
							Ok(m) => m,
							Err(e) => {
								let _ = events_tx.try_send(status_error(platform, "eventsub ws read error", e));
								break;
							}
						};

						match msg {
							Message::Text(t) => {
								last_activity = Instant::now();

								match eventsub::try_normalize_chat_message(&t) {
									Ok(Some(normalized)) => {
										if let Err(e) = validate_message(&normalized) {
											debug!(%platform, error = %e, "dropping invalid twitch chat message");
											continue;
										}

										metrics::counter!("unichat_twitch_chat_messages_total").increment(1);
										if events_tx.try_send(ConnectorEvent::Chat(Box::new(normalized))).is_err() {
											metrics::counter!("unichat_twitch_chat_dropped_total").increment(1);
										}
									}
									Ok(None) => {}
									Err(e) => {
										debug!(%platform, error = %e, "failed to parse eventsub message");
									}
								}
							}

							Message::Ping(p) => {
								last_activity = Instant::now();
								let _ = ws.send(Message::Pong(p)).await;
							}

							Message::Pong(_) => {
								last_activity = Instant::now();
							}

							Message::Close(frame) => {
								let _ = events_tx.try_send(status(platform, false, format!("eventsub ws closed: {frame:?}")));
								break;
							}

							_ => {}
						}
					}

					_ = sleep(keepalive_timeout) => {
						if last_activity.elapsed() > keepalive_timeout {
							let _ = events_tx.try_send(status(platform, false, "keepalive watchdog triggered; reconnecting"));
							let _ = ws.close(None).await;
							break;
						}
					}
				}
			}

			self.set_state(ConnectorState::Reconnecting);
			reconnect_attempt = reconnect_attempt.saturating_add(1);
		}

		let _ = events_tx.try_send(status(platform, false, "twitch connector stopped"));
		Ok(())
	}
}

#[async_trait::async_trait]
impl ChatConnector for TwitchChatConnector {
	fn platform(&self) -> Platform {
		Platform::Twitch
	}

	async fn run(self: Box<Self>, control_rx: ConnectorControlRx, events_tx: ConnectorEventTx) -> anyhow::Result<()> {
		self.run_loop(control_rx, events_tx).await
	}
}
