#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::Mutex;
use tokio::time::timeout;
use unichat_domain::role::RoleRules;
use unichat_domain::{AccountKey, Platform};
use unichat_platform::{ActingCredential, ModerationApi, ModerationKind, SecretString};

use crate::server::dispatch::{DispatchError, DispatcherConfig, ModerationDispatcher};
use crate::server::hub::{EventHub, EventHubConfig, HubChannel, HubEvent};
use crate::server::store::{ActionStore, LinkedAccount, MemoryStore, TimeoutStatus};

#[derive(Debug, Clone)]
struct RecordedCall {
	kind: &'static str,
	credential_user: String,
	target: String,
	duration: Option<u32>,
}

/// Platform API stand-in that records calls and can be told to fail.
struct FakeApi {
	fail: bool,
	calls: Mutex<Vec<RecordedCall>>,
}

impl FakeApi {
	fn new(fail: bool) -> Arc<Self> {
		Arc::new(Self {
			fail,
			calls: Mutex::new(Vec::new()),
		})
	}

	async fn calls(&self) -> Vec<RecordedCall> {
		self.calls.lock().await.clone()
	}

	async fn record(&self, kind: &'static str, credential: &ActingCredential, target: &str, duration: Option<u32>) {
		self.calls.lock().await.push(RecordedCall {
			kind,
			credential_user: credential.platform_user_id.clone(),
			target: target.to_string(),
			duration,
		});
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
		self.record("timeout", credential, target_user_id, Some(duration_seconds)).await;
		if self.fail {
			anyhow::bail!("simulated platform failure");
		}
		Ok(())
	}

	async fn ban_user(&self, credential: &ActingCredential, target_user_id: &str, _reason: Option<&str>) -> anyhow::Result<()> {
		self.record("ban", credential, target_user_id, None).await;
		if self.fail {
			anyhow::bail!("simulated platform failure");
		}
		Ok(())
	}

	async fn unban_user(&self, credential: &ActingCredential, target_user_id: &str) -> anyhow::Result<()> {
		self.record("unban", credential, target_user_id, None).await;
		if self.fail {
			anyhow::bail!("simulated platform failure");
		}
		Ok(())
	}
}

fn account(user_id: &str, platform: Platform, platform_user_id: &str, username: &str, token: &str, is_mod: bool) -> LinkedAccount {
	LinkedAccount {
		user_id: user_id.to_string(),
		platform,
		platform_user_id: platform_user_id.to_string(),
		username: username.to_string(),
		access_token: SecretString::new(token),
		refresh_token: None,
		is_moderator: is_mod,
		scopes: vec!["chat:write".to_string()],
		linked_at: SystemTime::now(),
		unlinked_at: None,
	}
}

async fn seeded_store() -> Arc<MemoryStore> {
	let store = Arc::new(MemoryStore::new());

	// Channel owner, linked on twitch and kick.
	store
		.insert_linked_account(&account("owner", Platform::Twitch, "100", "channel_owner", "owner-twitch-tok", false))
		.await
		.unwrap();
	store
		.insert_linked_account(&account("owner", Platform::Kick, "200", "channel_owner", "owner-kick-tok", false))
		.await
		.unwrap();

	// A moderator with their own twitch credential but no kick account.
	store
		.insert_linked_account(&account("mod1", Platform::Twitch, "300", "moddy", "mod-twitch-tok", true))
		.await
		.unwrap();

	// A plain member.
	store
		.insert_linked_account(&account("pleb", Platform::Twitch, "400", "pleb", "", false))
		.await
		.unwrap();

	// The usual suspect, linked on two platforms.
	store
		.insert_linked_account(&account("troll", Platform::Twitch, "500", "troll", "", false))
		.await
		.unwrap();
	store
		.insert_linked_account(&account("troll", Platform::Kick, "600", "troll", "", false))
		.await
		.unwrap();

	store
}

fn rules() -> RoleRules {
	RoleRules::new(vec![AccountKey::parse("twitch:channel_owner").unwrap()], Vec::new())
}

fn dispatcher(
	store: Arc<MemoryStore>,
	apis: HashMap<Platform, Arc<dyn ModerationApi>>,
	hub: EventHub,
) -> ModerationDispatcher {
	ModerationDispatcher::new(
		store,
		apis,
		hub,
		rules(),
		DispatcherConfig {
			owner_user_id: "owner".to_string(),
		},
	)
}

#[tokio::test]
async fn protected_target_is_rejected_with_no_side_effects() {
	let store = seeded_store().await;
	let api = FakeApi::new(false);
	let mut apis: HashMap<Platform, Arc<dyn ModerationApi>> = HashMap::new();
	apis.insert(Platform::Twitch, api.clone());
	let hub = EventHub::new(EventHubConfig::default());
	let d = dispatcher(Arc::clone(&store), apis, hub);

	// "100" is the owner's twitch identity.
	let err = d.apply_ban(Platform::Twitch, "100", None, "mod1").await.unwrap_err();
	assert!(matches!(err, DispatchError::Unauthorized(_)));

	let err = d.apply_timeout(Platform::Twitch, "100", 60, None, "mod1").await.unwrap_err();
	assert!(matches!(err, DispatchError::Unauthorized(_)));

	assert!(api.calls().await.is_empty());
	assert!(store.actions().await.is_empty());
	assert!(store.all_timeouts().await.is_empty());
}

#[tokio::test]
async fn member_actor_is_rejected() {
	let store = seeded_store().await;
	let mut apis: HashMap<Platform, Arc<dyn ModerationApi>> = HashMap::new();
	apis.insert(Platform::Twitch, FakeApi::new(false));
	let hub = EventHub::new(EventHubConfig::default());
	let d = dispatcher(Arc::clone(&store), apis, hub);

	let err = d.apply_timeout(Platform::Twitch, "500", 60, None, "pleb").await.unwrap_err();
	assert!(matches!(err, DispatchError::Unauthorized(_)));
	assert!(store.actions().await.is_empty());
}

#[tokio::test]
async fn successful_timeout_persists_and_publishes() {
	let store = seeded_store().await;
	let api = FakeApi::new(false);
	let mut apis: HashMap<Platform, Arc<dyn ModerationApi>> = HashMap::new();
	apis.insert(Platform::Twitch, api.clone());
	let hub = EventHub::new(EventHubConfig::default());
	let (_sub, mut moderation_rx) = hub.subscribe(HubChannel::Moderation).await;
	let d = dispatcher(Arc::clone(&store), apis, hub);

	let before = SystemTime::now();
	let outcome = d
		.apply_timeout(Platform::Twitch, "500", 600, Some("spam".to_string()), "mod1")
		.await
		.unwrap();

	assert!(outcome.success);
	assert!(outcome.results.get(&Platform::Twitch).unwrap().ok);
	assert!(outcome.action_id.is_some());

	// The actor's own credential was used.
	let calls = api.calls().await;
	assert_eq!(calls.len(), 1);
	assert_eq!(calls[0].kind, "timeout");
	assert_eq!(calls[0].credential_user, "300");
	assert_eq!(calls[0].duration, Some(600));

	let actions = store.actions().await;
	assert_eq!(actions.len(), 1);
	assert_eq!(actions[0].kind, ModerationKind::Timeout);
	assert_eq!(actions[0].target_user_id.as_deref(), Some("troll"));

	let timeouts = store.all_timeouts().await;
	assert_eq!(timeouts.len(), 1);
	assert_eq!(timeouts[0].status, TimeoutStatus::Active);
	let expected = before + Duration::from_secs(600);
	let skew = timeouts[0]
		.expires_at
		.duration_since(expected)
		.unwrap_or_else(|e| e.duration());
	assert!(skew < Duration::from_secs(5), "expires_at should be now + duration");

	// Connected viewers see the action reflected immediately.
	let ev = timeout(Duration::from_millis(250), moderation_rx.recv())
		.await
		.expect("moderation event within timeout")
		.expect("channel open");
	match ev {
		HubEvent::Moderation(ev) => {
			assert_eq!(ev.kind, ModerationKind::Timeout);
			assert_eq!(ev.target_user_id, "500");
			assert_eq!(ev.duration_seconds, Some(600));
			assert_eq!(ev.actor_id, "mod1");
		}
		other => panic!("expected Moderation event, got: {other:?}"),
	}
}

#[tokio::test]
async fn ban_fans_out_and_reports_partial_failure() {
	let store = seeded_store().await;
	let twitch_api = FakeApi::new(false);
	let kick_api = FakeApi::new(true);
	let mut apis: HashMap<Platform, Arc<dyn ModerationApi>> = HashMap::new();
	apis.insert(Platform::Twitch, twitch_api.clone());
	apis.insert(Platform::Kick, kick_api.clone());
	let hub = EventHub::new(EventHubConfig::default());
	let d = dispatcher(Arc::clone(&store), apis, hub);

	let outcome = d
		.apply_ban(Platform::Twitch, "500", Some("bye".to_string()), "mod1")
		.await
		.unwrap();

	// One platform succeeded, one failed; the overall call still succeeds
	// and both results are surfaced.
	assert!(outcome.success);
	assert!(outcome.results.get(&Platform::Twitch).unwrap().ok);
	assert!(!outcome.results.get(&Platform::Kick).unwrap().ok);
	assert!(outcome.results.get(&Platform::Kick).unwrap().detail.is_some());

	// The kick call was attempted against the kick identity.
	let kick_calls = kick_api.calls().await;
	assert_eq!(kick_calls.len(), 1);
	assert_eq!(kick_calls[0].target, "600");

	// Only the platform that landed is recorded.
	let actions = store.actions().await;
	assert_eq!(actions.len(), 1);
	assert_eq!(actions[0].platforms, vec![Platform::Twitch]);
}

#[tokio::test]
async fn credential_falls_back_to_channel_owner() {
	let store = seeded_store().await;
	let kick_api = FakeApi::new(false);
	let mut apis: HashMap<Platform, Arc<dyn ModerationApi>> = HashMap::new();
	apis.insert(Platform::Kick, kick_api.clone());
	let hub = EventHub::new(EventHubConfig::default());
	let d = dispatcher(Arc::clone(&store), apis, hub);

	// mod1 has no kick credential; the target "999" has no record at all,
	// so the ban stays on the named platform and runs under the owner.
	let outcome = d.apply_ban(Platform::Kick, "999", None, "mod1").await.unwrap();

	assert!(outcome.success);
	let calls = kick_api.calls().await;
	assert_eq!(calls.len(), 1);
	assert_eq!(calls[0].credential_user, "200");
	assert_eq!(calls[0].target, "999");

	// The action is still recorded even without an internal target record.
	let actions = store.actions().await;
	assert_eq!(actions.len(), 1);
	assert_eq!(actions[0].target_user_id, None);
}

#[tokio::test]
async fn unconfigured_platform_is_not_found() {
	let store = seeded_store().await;
	let hub = EventHub::new(EventHubConfig::default());
	let d = dispatcher(Arc::clone(&store), HashMap::new(), hub);

	let err = d.apply_timeout(Platform::YouTube, "500", 60, None, "mod1").await.unwrap_err();
	assert!(matches!(err, DispatchError::NotFound(_)));
}

#[tokio::test]
async fn validation_happens_before_any_side_effect() {
	let store = seeded_store().await;
	let api = FakeApi::new(false);
	let mut apis: HashMap<Platform, Arc<dyn ModerationApi>> = HashMap::new();
	apis.insert(Platform::Twitch, api.clone());
	let hub = EventHub::new(EventHubConfig::default());
	let d = dispatcher(Arc::clone(&store), apis, hub);

	let err = d.apply_timeout(Platform::Twitch, "", 60, None, "mod1").await.unwrap_err();
	assert!(matches!(err, DispatchError::Validation(_)));

	let err = d.apply_timeout(Platform::Twitch, "500", 0, None, "mod1").await.unwrap_err();
	assert!(matches!(err, DispatchError::Validation(_)));

	assert!(api.calls().await.is_empty());
	assert!(store.actions().await.is_empty());
}
