#![forbid(unsafe_code)]

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use unichat_domain::Platform;
use unichat_platform::{ChatConnector, ConnectorAuth, ConnectorControl, ConnectorEvent};

use crate::server::hub::{EventHub, HubEvent};

/// Connector manager configuration.
#[derive(Debug, Clone)]
pub struct ConnectorManagerConfig {
	pub control_channel_capacity: usize,
	pub events_channel_capacity: usize,
}

impl Default for ConnectorManagerConfig {
	fn default() -> Self {
		Self {
			control_channel_capacity: 64,
			events_channel_capacity: 8_192,
		}
	}
}

/// Owns the per-platform connector tasks and the forwarders that move their
/// events into the hub. The control map doubles as the capability table:
/// one entry per platform, built once at startup.
#[derive(Debug)]
pub struct ConnectorManager {
	control_by_platform: HashMap<Platform, mpsc::Sender<ConnectorControl>>,
}

impl ConnectorManager {
	/// Spawn every connector plus a forwarder task per connector.
	pub fn start(hub: EventHub, connectors: Vec<Box<dyn ChatConnector>>, cfg: ConnectorManagerConfig) -> Self {
		let mut control_by_platform: HashMap<Platform, mpsc::Sender<ConnectorControl>> = HashMap::new();

		for connector in connectors {
			let platform = connector.platform();

			let (control_tx, control_rx) = mpsc::channel::<ConnectorControl>(cfg.control_channel_capacity);
			let (events_tx, events_rx) = mpsc::channel::<ConnectorEvent>(cfg.events_channel_capacity);

			tokio::spawn(async move {
				if let Err(e) = connector.run(control_rx, events_tx).await {
					warn!(%platform, error = %e, "platform connector task exited with error");
				}
			});

			Self::spawn_forwarder(platform, events_rx, hub.clone());

			control_by_platform.insert(platform, control_tx);
		}

		Self { control_by_platform }
	}

	fn spawn_forwarder(platform: Platform, mut events_rx: mpsc::Receiver<ConnectorEvent>, hub: EventHub) {
		tokio::spawn(async move {
			while let Some(ev) = events_rx.recv().await {
				match ev {
					ConnectorEvent::Chat(msg) => {
						hub.publish(HubEvent::Chat(msg)).await;
					}
					ConnectorEvent::Status(st) => {
						metrics::counter!("unichat_connector_status_total").increment(1);
						metrics::gauge!("unichat_connector_live", "platform" => platform.as_str())
							.set(if st.live { 1.0 } else { 0.0 });
						debug!(%platform, live = st.live, detail = %st.detail, "connector status");
						hub.publish(HubEvent::Status(st)).await;
					}
				}
			}

			debug!(%platform, "connector events channel closed; forwarder exiting");
		});
	}

	/// Update authentication for a specific platform connector (best-effort).
	#[allow(dead_code)]
	pub async fn update_auth(&self, platform: Platform, auth: ConnectorAuth) -> bool {
		let Some(ctrl) = self.control_by_platform.get(&platform) else {
			return false;
		};
		ctrl.send(ConnectorControl::UpdateAuth { auth }).await.is_ok()
	}

	/// Shut down every connector. Connectors stop reconnecting and publish
	/// nothing further once they observe the message.
	#[allow(dead_code)]
	pub async fn shutdown(mut self) {
		for (platform, ctrl) in self.control_by_platform.drain() {
			let _ = ctrl.send(ConnectorControl::Shutdown).await;
			info!(%platform, "sent connector shutdown");
		}
	}
}
