#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};
use unichat_domain::Platform;
use unichat_platform::{ActingCredential, ModerationApi};

use crate::server::store::ActionStore;

/// Reaper configuration. The staleness threshold tracks the sweep interval
/// so each sweep picks up exactly the rows the previous one stamped.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
	pub sweep_interval: Duration,
	pub staleness: Duration,
}

impl Default for ReaperConfig {
	fn default() -> Self {
		Self {
			sweep_interval: Duration::from_secs(300),
			staleness: Duration::from_secs(300),
		}
	}
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
	pub reapplied: u64,
	pub completed: u64,
	pub failed: u64,
}

impl SweepStats {
	pub fn processed(&self) -> u64 {
		self.reapplied + self.completed
	}
}

/// Periodic sweep that re-asserts still-active timeouts on platforms that
/// do not durably persist them, and retires expired ones.
pub struct TimeoutReaper {
	store: Arc<dyn ActionStore>,
	apis: HashMap<Platform, Arc<dyn ModerationApi>>,
	owner_user_id: String,
	cfg: ReaperConfig,
}

impl TimeoutReaper {
	pub fn new(
		store: Arc<dyn ActionStore>,
		apis: HashMap<Platform, Arc<dyn ModerationApi>>,
		owner_user_id: impl Into<String>,
		cfg: ReaperConfig,
	) -> Self {
		Self {
			store,
			apis,
			owner_user_id: owner_user_id.into(),
			cfg,
		}
	}

	/// Reapplication always acts under the channel owner's credential; the
	/// original actor's token may be long gone by sweep time.
	async fn owner_credential(&self, platform: Platform) -> anyhow::Result<Option<ActingCredential>> {
		let accounts = self.store.linked_accounts_for_user(&self.owner_user_id).await?;
		Ok(accounts
			.iter()
			.find(|a| a.platform == platform && !a.access_token.is_empty())
			.map(|a| ActingCredential {
				token: a.access_token.clone(),
				platform_user_id: a.platform_user_id.clone(),
			}))
	}

	/// One sweep over stale active timeouts.
	///
	/// Every row transition stands alone: expiry is checked before acting,
	/// the completed transition is guarded in the store, and a failed
	/// reapplication leaves the row stale so the next sweep retries it.
	pub async fn run_sweep(&self, now: SystemTime) -> anyhow::Result<SweepStats> {
		let threshold = now - self.cfg.staleness;
		let rows = self.store.stale_active_timeouts(threshold).await?;

		let mut stats = SweepStats::default();

		for row in rows {
			if row.expires_at <= now {
				// Expired: retire, and never touch the platform again.
				if self.store.mark_timeout_completed(row.id).await? {
					stats.completed += 1;
					debug!(id = row.id, platform = %row.platform, "timeout expired; marked completed");
				}
				continue;
			}

			let remaining = row
				.expires_at
				.duration_since(now)
				.unwrap_or(Duration::from_secs(1))
				.as_secs()
				.max(1) as u32;

			let Some(api) = self.apis.get(&row.platform) else {
				warn!(id = row.id, platform = %row.platform, "no moderation api for platform; skipping reapply");
				stats.failed += 1;
				continue;
			};

			let credential = match self.owner_credential(row.platform).await? {
				Some(c) => c,
				None => {
					warn!(id = row.id, platform = %row.platform, "no owner credential for platform; skipping reapply");
					stats.failed += 1;
					continue;
				}
			};

			match api
				.timeout_user(&credential, &row.platform_user_id, remaining, None)
				.await
			{
				Ok(()) => {
					self.store.touch_timeout_reapplied(row.id, now).await?;
					stats.reapplied += 1;
					debug!(
						id = row.id,
						platform = %row.platform,
						remaining,
						"timeout reapplied for remaining duration"
					);
				}
				Err(e) => {
					// Leave last_applied_at untouched so the next sweep retries.
					warn!(id = row.id, platform = %row.platform, error = %e, "timeout reapplication failed");
					stats.failed += 1;
				}
			}
		}

		metrics::counter!("unichat_reaper_reapplied_total").increment(stats.reapplied);
		metrics::counter!("unichat_reaper_completed_total").increment(stats.completed);
		if stats.failed > 0 {
			metrics::counter!("unichat_reaper_failed_total").increment(stats.failed);
		}

		Ok(stats)
	}

	/// Run sweeps on the configured fixed interval.
	pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(self.cfg.sweep_interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			// The first tick fires immediately; skip it so a restart does
			// not double-sweep rows the previous process just touched.
			ticker.tick().await;

			info!(interval = ?self.cfg.sweep_interval, "timeout reaper started");

			loop {
				ticker.tick().await;
				match self.run_sweep(SystemTime::now()).await {
					Ok(stats) => {
						if stats.processed() > 0 || stats.failed > 0 {
							info!(
								reapplied = stats.reapplied,
								completed = stats.completed,
								failed = stats.failed,
								"timeout sweep finished"
							);
						}
					}
					Err(e) => {
						warn!(error = %e, "timeout sweep failed");
					}
				}
			}
		})
	}
}
