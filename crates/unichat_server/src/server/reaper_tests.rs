#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::Mutex;
use unichat_domain::Platform;
use unichat_platform::{ActingCredential, ModerationApi, SecretString};

use crate::server::reaper::{ReaperConfig, TimeoutReaper};
use crate::server::store::{ActionStore, LinkedAccount, MemoryStore, TimeoutStatus};

#[derive(Debug, Clone)]
struct ReapplyCall {
	credential_user: String,
	target: String,
	duration: u32,
}

struct FakeApi {
	fail: bool,
	calls: Mutex<Vec<ReapplyCall>>,
}

impl FakeApi {
	fn new(fail: bool) -> Arc<Self> {
		Arc::new(Self {
			fail,
			calls: Mutex::new(Vec::new()),
		})
	}

	async fn calls(&self) -> Vec<ReapplyCall> {
		self.calls.lock().await.clone()
	}
}

#[async_trait::async_trait]
impl ModerationApi for FakeApi {
	async fn timeout_user(
		&self,
		credential: &ActingCredential,
		target_user_id: &str,
		duration_seconds: u32,
		_reason: Option<&str>,
	) -> anyhow::Result<()> {
		self.calls.lock().await.push(ReapplyCall {
			credential_user: credential.platform_user_id.clone(),
			target: target_user_id.to_string(),
			duration: duration_seconds,
		});
		if self.fail {
			anyhow::bail!("simulated platform failure");
		}
		Ok(())
	}

	async fn ban_user(&self, _credential: &ActingCredential, _target_user_id: &str, _reason: Option<&str>) -> anyhow::Result<()> {
		anyhow::bail!("reaper must not ban");
	}

	async fn unban_user(&self, _credential: &ActingCredential, _target_user_id: &str) -> anyhow::Result<()> {
		anyhow::bail!("reaper must not unban");
	}
}

async fn store_with_owner() -> Arc<MemoryStore> {
	let store = Arc::new(MemoryStore::new());
	store
		.insert_linked_account(&LinkedAccount {
			user_id: "owner".to_string(),
			platform: Platform::Twitch,
			platform_user_id: "100".to_string(),
			username: "channel_owner".to_string(),
			access_token: SecretString::new("owner-tok"),
			refresh_token: None,
			is_moderator: false,
			scopes: Vec::new(),
			linked_at: SystemTime::now(),
			unlinked_at: None,
		})
		.await
		.unwrap();
	store
}

fn reaper(store: Arc<MemoryStore>, api: Arc<FakeApi>) -> TimeoutReaper {
	let mut apis: HashMap<Platform, Arc<dyn ModerationApi>> = HashMap::new();
	apis.insert(Platform::Twitch, api);
	TimeoutReaper::new(
		store,
		apis,
		"owner",
		ReaperConfig {
			sweep_interval: Duration::from_secs(300),
			staleness: Duration::from_secs(300),
		},
	)
}

#[tokio::test]
async fn stale_live_timeout_is_reapplied_for_remaining_duration() {
	let store = store_with_owner().await;
	let api = FakeApi::new(false);

	let now = SystemTime::now();
	store
		.insert_active_timeout(Platform::Twitch, "500", now + Duration::from_secs(300), now - Duration::from_secs(600))
		.await
		.unwrap();

	let stats = reaper(Arc::clone(&store), api.clone()).run_sweep(now).await.unwrap();
	assert_eq!(stats.reapplied, 1);
	assert_eq!(stats.completed, 0);
	assert_eq!(stats.failed, 0);

	let calls = api.calls().await;
	assert_eq!(calls.len(), 1);
	assert_eq!(calls[0].target, "500");
	assert_eq!(calls[0].credential_user, "100");
	assert!(
		(295..=300).contains(&calls[0].duration),
		"reapply should carry the remaining duration, got {}",
		calls[0].duration
	);

	// last_applied_at was bumped, so the row is no longer stale.
	let stale = store.stale_active_timeouts(now - Duration::from_secs(300)).await.unwrap();
	assert!(stale.is_empty());
}

#[tokio::test]
async fn expired_timeout_completes_without_platform_call() {
	let store = store_with_owner().await;
	let api = FakeApi::new(false);

	let now = SystemTime::now();
	store
		.insert_active_timeout(Platform::Twitch, "500", now - Duration::from_secs(10), now - Duration::from_secs(600))
		.await
		.unwrap();

	let stats = reaper(Arc::clone(&store), api.clone()).run_sweep(now).await.unwrap();
	assert_eq!(stats.completed, 1);
	assert_eq!(stats.reapplied, 0);
	assert!(api.calls().await.is_empty(), "expired rows must not hit the platform");

	let rows = store.all_timeouts().await;
	assert_eq!(rows[0].status, TimeoutStatus::Completed);
}

#[tokio::test]
async fn fresh_rows_are_left_alone_and_sweeps_are_idempotent() {
	let store = store_with_owner().await;
	let api = FakeApi::new(false);

	let now = SystemTime::now();
	// Applied just now: below the staleness threshold.
	store
		.insert_active_timeout(Platform::Twitch, "500", now + Duration::from_secs(600), now)
		.await
		.unwrap();
	// Expired and stale: completes on the first sweep.
	store
		.insert_active_timeout(Platform::Twitch, "600", now - Duration::from_secs(5), now - Duration::from_secs(600))
		.await
		.unwrap();

	let r = reaper(Arc::clone(&store), api.clone());

	let first = r.run_sweep(now).await.unwrap();
	assert_eq!(first.completed, 1);
	assert_eq!(first.reapplied, 0);

	// Re-running after an interruption touches nothing further.
	let second = r.run_sweep(now).await.unwrap();
	assert_eq!(second.completed, 0);
	assert_eq!(second.reapplied, 0);
	assert!(api.calls().await.is_empty());
}

#[tokio::test]
async fn failed_reapplication_leaves_row_stale_for_retry() {
	let store = store_with_owner().await;
	let api = FakeApi::new(true);

	let now = SystemTime::now();
	store
		.insert_active_timeout(Platform::Twitch, "500", now + Duration::from_secs(300), now - Duration::from_secs(600))
		.await
		.unwrap();

	let stats = reaper(Arc::clone(&store), api.clone()).run_sweep(now).await.unwrap();
	assert_eq!(stats.failed, 1);
	assert_eq!(stats.reapplied, 0);

	// The row stays stale so the next sweep retries it.
	let stale = store.stale_active_timeouts(now - Duration::from_secs(300)).await.unwrap();
	assert_eq!(stale.len(), 1);
	assert_eq!(stale[0].status, TimeoutStatus::Active);
}

#[tokio::test]
async fn missing_owner_credential_skips_reapply() {
	let store = Arc::new(MemoryStore::new());
	let api = FakeApi::new(false);

	let now = SystemTime::now();
	store
		.insert_active_timeout(Platform::Twitch, "500", now + Duration::from_secs(300), now - Duration::from_secs(600))
		.await
		.unwrap();

	let stats = reaper(Arc::clone(&store), api.clone()).run_sweep(now).await.unwrap();
	assert_eq!(stats.failed, 1);
	assert!(api.calls().await.is_empty());
}
