#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::debug;
use unichat_domain::Platform;
use unichat_platform::{ModerationEvent, NormalizedMessage, PlatformStatusEvent};

/// The hub's three logical channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HubChannel {
	Chat,
	Moderation,
	PlatformStatus,
}

impl HubChannel {
	pub const fn as_str(self) -> &'static str {
		match self {
			HubChannel::Chat => "chat",
			HubChannel::Moderation => "moderation",
			HubChannel::PlatformStatus => "platform_status",
		}
	}
}

impl fmt::Display for HubChannel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Items delivered to hub subscribers.
#[derive(Debug, Clone)]
pub enum HubEvent {
	Chat(Box<NormalizedMessage>),
	Moderation(ModerationEvent),
	Status(PlatformStatusEvent),
}

impl HubEvent {
	pub fn channel(&self) -> HubChannel {
		match self {
			HubEvent::Chat(_) => HubChannel::Chat,
			HubEvent::Moderation(_) => HubChannel::Moderation,
			HubEvent::Status(_) => HubChannel::PlatformStatus,
		}
	}
}

/// Capability to deregister a subscriber. Unsubscribing is idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Configuration for [`EventHub`].
#[derive(Debug, Clone)]
pub struct EventHubConfig {
	/// Maximum number of queued events per subscriber.
	pub subscriber_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for EventHubConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 1024,
			debug_logs: false,
		}
	}
}

/// In-process broadcast broker with independent chat, moderation and
/// platform-status channels.
///
/// Publishing never blocks on a subscriber: each subscriber has a bounded
/// queue and a full or closed queue only affects that subscriber. The status
/// channel keeps the last event per platform and hands the snapshot to new
/// subscribers as immediate synthetic events.
#[derive(Debug, Clone)]
pub struct EventHub {
	inner: Arc<Mutex<Inner>>,
	cfg: EventHubConfig,
}

#[derive(Debug, Default)]
struct Inner {
	next_subscriber_id: u64,
	channels: HashMap<HubChannel, ChannelEntry>,
	status_cache: BTreeMap<Platform, PlatformStatusEvent>,
}

#[derive(Debug, Default)]
struct ChannelEntry {
	subscribers: Vec<Subscriber>,
}

#[derive(Debug)]
struct Subscriber {
	id: SubscriberId,
	tx: mpsc::Sender<HubEvent>,
}

impl EventHub {
	pub fn new(cfg: EventHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Register a receiver on a channel.
	///
	/// Returns the unsubscribe capability and the event stream. Events
	/// published before this call are never delivered, with one exception:
	/// status subscribers immediately receive the cached last-known status
	/// per platform.
	pub async fn subscribe(&self, channel: HubChannel) -> (SubscriberId, mpsc::Receiver<HubEvent>) {
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity);

		let mut inner = self.inner.lock().await;
		inner.next_subscriber_id += 1;
		let id = SubscriberId(inner.next_subscriber_id);

		if channel == HubChannel::PlatformStatus {
			for cached in inner.status_cache.values() {
				let _ = tx.try_send(HubEvent::Status(cached.clone()));
			}
		}

		let entry = inner.channels.entry(channel).or_default();
		prune_closed_subscribers(entry);
		entry.subscribers.push(Subscriber { id, tx });

		if self.cfg.debug_logs {
			debug!(%channel, subs = entry.subscribers.len(), "event hub: subscribed");
		}

		(id, rx)
	}

	/// Deregister a subscriber. Safe to call repeatedly, or after the hub
	/// already pruned the subscriber on a failed delivery.
	pub async fn unsubscribe(&self, id: SubscriberId) {
		let mut inner = self.inner.lock().await;
		for entry in inner.channels.values_mut() {
			entry.subscribers.retain(|s| s.id != id);
		}
	}

	/// Publish an event to its channel's current subscribers.
	///
	/// Never blocks: delivery to each subscriber is an isolated `try_send`,
	/// so one slow or broken subscriber cannot stall the publisher or its
	/// siblings.
	pub async fn publish(&self, event: HubEvent) {
		let channel = event.channel();

		let mut inner = self.inner.lock().await;

		if let HubEvent::Status(st) = &event {
			inner.status_cache.insert(st.platform, st.clone());
		}

		let Some(entry) = inner.channels.get_mut(&channel) else {
			return;
		};

		prune_closed_subscribers(entry);

		let mut dropped_total: u64 = 0;

		for sub in entry.subscribers.iter() {
			match sub.tx.try_send(event.clone()) {
				Ok(()) => {}
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped_total += 1;
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		prune_closed_subscribers(entry);

		if dropped_total > 0 {
			metrics::counter!("unichat_hub_dropped_total").increment(dropped_total);
			if self.cfg.debug_logs {
				debug!(%channel, dropped = dropped_total, "event hub: dropped due to full subscriber queues");
			}
		}

		metrics::counter!("unichat_hub_published_total").increment(1);
	}

	/// Snapshot of live subscriber counts per channel.
	pub async fn subscriber_count(&self, channel: HubChannel) -> usize {
		let inner = self.inner.lock().await;
		inner
			.channels
			.get(&channel)
			.map(|entry| entry.subscribers.iter().filter(|s| !s.tx.is_closed()).count())
			.unwrap_or(0)
	}
}

fn prune_closed_subscribers(entry: &mut ChannelEntry) {
	entry.subscribers.retain(|s| !s.tx.is_closed());
}
