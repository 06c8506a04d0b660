#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use unichat_domain::Platform;
use unichat_domain::role::RoleRules;
use unichat_platform::kick::{KickChatConnector, KickCommands, KickConfig};
use unichat_platform::twitch::{TwitchChatConnector, TwitchCommands, TwitchConfig};
use unichat_platform::youtube::{YouTubeChatConnector, YouTubeCommands, YouTubeConfig, YouTubeLiveState};
use unichat_platform::{ActingCredential, ChatConnector, ChatSender, ModerationApi, SecretString};

use crate::server::connectors::{ConnectorManager, ConnectorManagerConfig};
use crate::server::dispatch::{DispatcherConfig, ModerationDispatcher};
use crate::server::feed::FeedSettings;
use crate::server::http::{HealthState, HttpContext, run_http_server};
use crate::server::hub::{EventHub, EventHubConfig};
use crate::server::reaper::{ReaperConfig, TimeoutReaper};
use crate::server::send_queue::SendQueueBuilder;
use crate::server::store::connect_store;
use crate::server::webhook::{LoggingNotificationSink, WebhookVerifier};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: unichat_server [--bind host:port]\n\
\n\
Options:\n\
\t--bind    HTTP bind address (default: 127.0.0.1:8420)\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind = "127.0.0.1:8420".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				bind = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	bind.parse::<SocketAddr>().unwrap_or_else(|e| {
		eprintln!("invalid bind address {bind}: {e}");
		usage_and_exit();
	})
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,unichat_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("unichat_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let bind_addr = parse_args();

	let config_path = crate::config::default_config_path()?;
	let cfg = crate::config::load_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded hub config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let database_url = if cfg.persistence.enabled {
		let Some(url) = cfg.persistence.database_url.as_deref() else {
			return Err(anyhow::anyhow!("persistence enabled but no database_url configured"));
		};
		Some(url)
	} else {
		warn!("persistence disabled; moderation state lives in memory only");
		None
	};
	let store = connect_store(database_url).await?;

	let hub = EventHub::new(EventHubConfig::default());

	// Connectors and the per-platform command capability tables, built once.
	let mut connectors: Vec<Box<dyn ChatConnector>> = Vec::new();
	let mut senders: Vec<(Platform, Arc<dyn ChatSender>)> = Vec::new();
	let mut apis: HashMap<Platform, Arc<dyn ModerationApi>> = HashMap::new();

	let twitch_client_id = cfg.twitch.client_id.clone().unwrap_or_default();
	let twitch_token = cfg.twitch.access_token.clone().unwrap_or_else(|| SecretString::new(""));
	let mut twitch_cfg = TwitchConfig::new(
		twitch_client_id.clone(),
		twitch_token.clone(),
		cfg.twitch.broadcaster_login.clone().unwrap_or_default(),
	);
	if let Some(ws_url) = cfg.twitch.eventsub_ws_url.clone() {
		twitch_cfg.eventsub_ws_url = ws_url;
	}
	if let Some(base) = cfg.twitch.api_base_url.clone() {
		twitch_cfg.api_base_url = base;
	}
	if let Some(min) = cfg.twitch.reconnect_min_delay {
		twitch_cfg.reconnect_min_delay = min;
	}
	if let Some(max) = cfg.twitch.reconnect_max_delay {
		twitch_cfg.reconnect_max_delay = max;
	}
	let twitch_api_base = twitch_cfg.api_base_url.clone();
	connectors.push(Box::new(TwitchChatConnector::new(twitch_cfg)));

	if let Some(broadcaster_id) = cfg.twitch.broadcaster_id.clone() {
		if twitch_client_id.trim().is_empty() || twitch_token.is_empty() {
			warn!("twitch commands disabled: client_id or access_token missing");
		} else {
			let commands = Arc::new(TwitchCommands::new(
				twitch_api_base,
				twitch_client_id,
				broadcaster_id.clone(),
				ActingCredential {
					token: twitch_token,
					platform_user_id: broadcaster_id,
				},
			));
			senders.push((Platform::Twitch, commands.clone()));
			apis.insert(Platform::Twitch, commands);
		}
	} else {
		warn!("twitch commands disabled: broadcaster_id not configured");
	}

	let kick_token = cfg.kick.access_token.clone().unwrap_or_else(|| SecretString::new(""));
	let mut kick_cfg = KickConfig::new(kick_token.clone(), cfg.kick.broadcaster_slug.clone().unwrap_or_default());
	if let Some(base) = cfg.kick.base_url.clone() {
		kick_cfg.base_url = base;
	}
	if let Some(path) = cfg.kick.webhook_path.clone() {
		kick_cfg.webhook_path = path;
	}
	if let Some(verify) = cfg.kick.webhook_verify_signatures {
		kick_cfg.verify_signatures = verify;
	}
	if let Some(path) = cfg.kick.webhook_public_key_path.clone() {
		match std::fs::read_to_string(&path) {
			Ok(pem) => kick_cfg.public_key_pem = Some(pem),
			Err(e) => warn!(error = %e, path = %path.display(), "failed to read kick webhook public key"),
		}
	}
	if let Some(bind) = cfg.kick.webhook_bind.clone() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => kick_cfg.webhook_bind = Some(addr),
			Err(e) => warn!(error = %e, bind = %bind, "kick webhook bind is invalid"),
		}
	}
	let kick_base_url = kick_cfg.base_url.clone();
	connectors.push(Box::new(KickChatConnector::new(kick_cfg)));

	if let Some(broadcaster_user_id) = cfg.kick.broadcaster_user_id {
		if kick_token.is_empty() {
			warn!("kick commands disabled: access_token missing");
		} else {
			let commands = Arc::new(KickCommands::new(
				kick_base_url,
				broadcaster_user_id,
				ActingCredential {
					token: kick_token,
					platform_user_id: broadcaster_user_id.to_string(),
				},
			));
			senders.push((Platform::Kick, commands.clone()));
			apis.insert(Platform::Kick, commands);
		}
	} else {
		warn!("kick commands disabled: broadcaster_user_id not configured");
	}

	let youtube_key = cfg.youtube.api_key.clone().unwrap_or_else(|| SecretString::new(""));
	let mut youtube_cfg = YouTubeConfig::new(youtube_key, cfg.youtube.channel_id.clone().unwrap_or_default());
	if let Some(base) = cfg.youtube.api_base_url.clone() {
		youtube_cfg.api_base_url = base;
	}
	if let Some(interval) = cfg.youtube.live_check_interval {
		youtube_cfg.live_check_interval = interval;
	}
	if let Some(ttl) = cfg.youtube.cache_ttl {
		youtube_cfg.cache_ttl = ttl;
	}
	let youtube_connector = YouTubeChatConnector::new(youtube_cfg);
	let youtube_live: YouTubeLiveState = youtube_connector.live_state();
	connectors.push(Box::new(youtube_connector));

	if let Some(oauth) = cfg.youtube.access_token.clone() {
		let commands = Arc::new(YouTubeCommands::new(
			youtube_live.clone(),
			ActingCredential {
				token: oauth,
				platform_user_id: cfg.youtube.channel_id.clone().unwrap_or_default(),
			},
		));
		senders.push((Platform::YouTube, commands.clone()));
		apis.insert(Platform::YouTube, commands);
	} else {
		warn!("youtube commands disabled: access_token not configured");
	}

	// Keep the manager alive: dropping it closes every connector's control
	// channel and stops them.
	let _connector_manager: ConnectorManager =
		ConnectorManager::start(hub.clone(), connectors, ConnectorManagerConfig::default());

	let mut queue_builder = SendQueueBuilder::new();
	for (platform, sender) in senders {
		queue_builder = queue_builder.register(platform, sender, cfg.moderation.send_min_spacing);
	}
	let send_queue = queue_builder.start();

	let rules = RoleRules::new(cfg.roles.owners.clone(), cfg.roles.admins.clone());
	if cfg.moderation.owner_user_id.is_empty() {
		warn!("moderation.owner_user_id not configured; owner credential fallback disabled");
	}

	let dispatcher = Arc::new(ModerationDispatcher::new(
		Arc::clone(&store),
		apis.clone(),
		hub.clone(),
		rules,
		DispatcherConfig {
			owner_user_id: cfg.moderation.owner_user_id.clone(),
		},
	));

	let reaper = Arc::new(TimeoutReaper::new(
		Arc::clone(&store),
		apis,
		cfg.moderation.owner_user_id.clone(),
		ReaperConfig {
			sweep_interval: cfg.moderation.reaper_sweep_interval,
			staleness: cfg.moderation.reaper_staleness,
		},
	));
	Arc::clone(&reaper).spawn();

	let mut feed_settings = FeedSettings::default();
	if let Some(interval) = cfg.server.heartbeat_interval {
		feed_settings.heartbeat_interval = interval;
	}

	let health = HealthState::new();
	let ctx = HttpContext {
		hub,
		dispatcher,
		send_queue,
		reaper,
		store,
		webhook: cfg.server.webhook_secret.clone().map(WebhookVerifier::new),
		notification_sink: Arc::new(LoggingNotificationSink),
		youtube_live: Some(youtube_live),
		cron_secret: cfg.server.cron_secret.clone(),
		quarantine_max_age: cfg.moderation.quarantine_max_age,
		feed: feed_settings,
		health: health.clone(),
	};

	health.mark_ready();
	info!(%bind_addr, "unichat server listening");

	run_http_server(bind_addr, ctx).await
}
