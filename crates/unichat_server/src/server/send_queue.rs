#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};
use unichat_domain::Platform;
use unichat_platform::ChatSender;

/// Errors surfaced to send-queue callers.
#[derive(Debug, Error)]
pub enum SendError {
	/// No sender function was registered for the platform before start.
	/// This is a configuration error, not a runtime race.
	#[error("no sender registered for platform {0}")]
	NotRegistered(Platform),

	#[error("send queue worker stopped")]
	WorkerStopped,

	#[error("platform send failed: {0}")]
	Platform(String),
}

struct OutboundItem {
	text: String,
	resp: oneshot::Sender<Result<(), SendError>>,
}

/// Registers concrete senders per platform, then starts the workers.
/// The queue only exists once every sender is installed.
pub struct SendQueueBuilder {
	queue_capacity: usize,
	senders: Vec<(Platform, Arc<dyn ChatSender>, Duration)>,
}

impl SendQueueBuilder {
	pub fn new() -> Self {
		Self {
			queue_capacity: 256,
			senders: Vec::new(),
		}
	}

	/// Install a platform sender with a minimum spacing between sends
	/// (the platform's rate limit).
	pub fn register(mut self, platform: Platform, sender: Arc<dyn ChatSender>, min_spacing: Duration) -> Self {
		self.senders.push((platform, sender, min_spacing));
		self
	}

	/// Spawn one worker per registered platform.
	pub fn start(self) -> SendQueue {
		let mut workers = HashMap::new();

		for (platform, sender, min_spacing) in self.senders {
			let (tx, rx) = mpsc::channel::<OutboundItem>(self.queue_capacity);
			tokio::spawn(run_worker(platform, sender, min_spacing, rx));
			workers.insert(platform, tx);
		}

		SendQueue { workers }
	}
}

impl Default for SendQueueBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Outbound send queue: platform-ordered delivery through a single worker
/// per platform. Sends to different platforms proceed independently.
#[derive(Clone)]
pub struct SendQueue {
	workers: HashMap<Platform, mpsc::Sender<OutboundItem>>,
}

impl SendQueue {
	/// Enqueue a message and wait for the worker's verdict.
	///
	/// A failure is reported here and nowhere else; the worker moves on to
	/// the next message regardless.
	pub async fn enqueue(&self, platform: Platform, text: String) -> Result<(), SendError> {
		let tx = self.workers.get(&platform).ok_or(SendError::NotRegistered(platform))?;

		let (resp_tx, resp_rx) = oneshot::channel();
		tx.send(OutboundItem { text, resp: resp_tx })
			.await
			.map_err(|_| SendError::WorkerStopped)?;

		resp_rx.await.map_err(|_| SendError::WorkerStopped)?
	}

	#[allow(dead_code)]
	pub fn is_registered(&self, platform: Platform) -> bool {
		self.workers.contains_key(&platform)
	}
}

async fn run_worker(
	platform: Platform,
	sender: Arc<dyn ChatSender>,
	min_spacing: Duration,
	mut rx: mpsc::Receiver<OutboundItem>,
) {
	debug!(%platform, ?min_spacing, "send queue worker started");
	let mut next_allowed = Instant::now();

	while let Some(item) = rx.recv().await {
		sleep_until(next_allowed).await;

		let result = sender.send_chat(&item.text).await;
		next_allowed = Instant::now() + min_spacing;

		match result {
			Ok(()) => {
				metrics::counter!("unichat_send_queue_sent_total", "platform" => platform.as_str()).increment(1);
				let _ = item.resp.send(Ok(()));
			}
			Err(e) => {
				metrics::counter!("unichat_send_queue_failed_total", "platform" => platform.as_str()).increment(1);
				warn!(%platform, error = %e, "outbound chat send failed");
				let _ = item.resp.send(Err(SendError::Platform(e.to_string())));
			}
		}
	}

	debug!(%platform, "send queue worker exiting");
}
