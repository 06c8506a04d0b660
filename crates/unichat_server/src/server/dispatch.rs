#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use unichat_domain::Platform;
use unichat_domain::role::{AccountClaim, Role, RoleRules, resolve_role};
use unichat_platform::{ActingCredential, ModerationApi, ModerationEvent, ModerationKind};

use crate::server::hub::{EventHub, HubEvent};
use crate::server::store::{ActionStore, LinkedAccount, NewModerationAction};

/// Twitch's ceiling (two weeks); the strictest of the three platforms, so
/// it bounds every timeout uniformly.
pub const MAX_TIMEOUT_SECONDS: u32 = 1_209_600;

/// Dispatcher-level errors, mapped to HTTP statuses at the boundary.
#[derive(Debug, Error)]
pub enum DispatchError {
	#[error("unauthorized: {0}")]
	Unauthorized(String),

	#[error("invalid request: {0}")]
	Validation(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error("internal error: {0}")]
	Internal(String),
}

/// Result of one platform call within a dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct PlatformOutcome {
	pub ok: bool,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub detail: Option<String>,
}

impl PlatformOutcome {
	fn ok() -> Self {
		Self { ok: true, detail: None }
	}

	fn failed(detail: impl Into<String>) -> Self {
		Self {
			ok: false,
			detail: Some(detail.into()),
		}
	}
}

/// Per-platform result map. Overall success means at least one platform
/// succeeded; partial failure is never collapsed.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
	pub success: bool,
	pub results: BTreeMap<Platform, PlatformOutcome>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub action_id: Option<i64>,
}

impl DispatchOutcome {
	fn from_results(results: BTreeMap<Platform, PlatformOutcome>) -> Self {
		let success = results.values().any(|r| r.ok);
		Self {
			success,
			results,
			action_id: None,
		}
	}

	fn succeeded_platforms(&self) -> Vec<Platform> {
		self.results
			.iter()
			.filter(|(_, outcome)| outcome.ok)
			.map(|(platform, _)| *platform)
			.collect()
	}
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
	/// Internal user id of the channel owner; the credential fallback when
	/// an actor has no linked account on the target platform.
	pub owner_user_id: String,
}

/// Authorizes and executes moderation actions against platform APIs.
pub struct ModerationDispatcher {
	store: Arc<dyn ActionStore>,
	apis: HashMap<Platform, Arc<dyn ModerationApi>>,
	hub: EventHub,
	rules: RoleRules,
	cfg: DispatcherConfig,
}

fn claims_of(accounts: &[LinkedAccount]) -> Vec<AccountClaim> {
	accounts
		.iter()
		.map(|a| AccountClaim::new(a.platform, a.username.clone(), a.is_moderator))
		.collect()
}

impl ModerationDispatcher {
	pub fn new(
		store: Arc<dyn ActionStore>,
		apis: HashMap<Platform, Arc<dyn ModerationApi>>,
		hub: EventHub,
		rules: RoleRules,
		cfg: DispatcherConfig,
	) -> Self {
		Self {
			store,
			apis,
			hub,
			rules,
			cfg,
		}
	}

	async fn actor_context(&self, actor_id: &str) -> Result<(Role, Vec<LinkedAccount>), DispatchError> {
		if actor_id.trim().is_empty() {
			return Err(DispatchError::Validation("actor_id must be non-empty".to_string()));
		}

		let accounts = self
			.store
			.linked_accounts_for_user(actor_id)
			.await
			.map_err(|e| DispatchError::Internal(e.to_string()))?;

		let role = resolve_role(&claims_of(&accounts), &self.rules);
		Ok((role, accounts))
	}

	fn require_role(&self, role: Role, required: Role) -> Result<(), DispatchError> {
		if !role.has_permission(required) {
			return Err(DispatchError::Unauthorized(format!(
				"requires {required} or above, actor is {role}"
			)));
		}
		Ok(())
	}

	/// Protected status is re-evaluated at action time against the store
	/// and the static allow-lists, never from a cache.
	async fn ensure_not_protected(&self, target: &LinkedAccount) -> Result<(), DispatchError> {
		let accounts = self
			.store
			.linked_accounts_for_user(&target.user_id)
			.await
			.map_err(|e| DispatchError::Internal(e.to_string()))?;

		if self.rules.is_protected(&claims_of(&accounts)) {
			return Err(DispatchError::Unauthorized("target account is protected".to_string()));
		}

		Ok(())
	}

	/// Prefer the actor's own linked credential for the platform; fall back
	/// to the channel owner's. This decides whose identity the action
	/// appears under on the platform.
	async fn resolve_credential(
		&self,
		platform: Platform,
		actor_accounts: &[LinkedAccount],
	) -> Result<Option<ActingCredential>, DispatchError> {
		if let Some(own) = actor_accounts
			.iter()
			.find(|a| a.platform == platform && !a.access_token.is_empty())
		{
			return Ok(Some(ActingCredential {
				token: own.access_token.clone(),
				platform_user_id: own.platform_user_id.clone(),
			}));
		}

		let owner_accounts = self
			.store
			.linked_accounts_for_user(&self.cfg.owner_user_id)
			.await
			.map_err(|e| DispatchError::Internal(e.to_string()))?;

		Ok(owner_accounts
			.iter()
			.find(|a| a.platform == platform && !a.access_token.is_empty())
			.map(|a| ActingCredential {
				token: a.access_token.clone(),
				platform_user_id: a.platform_user_id.clone(),
			}))
	}

	async fn resolve_target(
		&self,
		platform: Platform,
		target_user_id: &str,
	) -> Result<Option<LinkedAccount>, DispatchError> {
		let target = self
			.store
			.find_account_by_platform_user(platform, target_user_id)
			.await
			.map_err(|e| DispatchError::Internal(e.to_string()))?;

		// Anonymous platform users have no record; the protected check only
		// applies when one exists.
		if let Some(account) = &target {
			self.ensure_not_protected(account).await?;
		}

		Ok(target)
	}

	async fn publish_moderation(
		&self,
		kind: ModerationKind,
		platform: Platform,
		target_user_id: &str,
		duration_seconds: Option<u64>,
		reason: Option<&str>,
		actor_id: &str,
	) {
		self.hub
			.publish(HubEvent::Moderation(ModerationEvent {
				kind,
				platform,
				target_user_id: target_user_id.to_string(),
				duration_seconds,
				reason: reason.map(|r| r.to_string()),
				actor_id: actor_id.to_string(),
				time: SystemTime::now(),
			}))
			.await;
	}

	/// Timeout a platform identity for `duration_seconds`.
	pub async fn apply_timeout(
		&self,
		platform: Platform,
		target_user_id: &str,
		duration_seconds: u32,
		reason: Option<String>,
		actor_id: &str,
	) -> Result<DispatchOutcome, DispatchError> {
		if target_user_id.trim().is_empty() {
			return Err(DispatchError::Validation("target_user_id must be non-empty".to_string()));
		}
		if duration_seconds == 0 || duration_seconds > MAX_TIMEOUT_SECONDS {
			return Err(DispatchError::Validation(format!(
				"duration_seconds must be in 1..={MAX_TIMEOUT_SECONDS}"
			)));
		}

		let (role, actor_accounts) = self.actor_context(actor_id).await?;
		self.require_role(role, Role::Moderator)?;

		let target = self.resolve_target(platform, target_user_id).await?;

		let Some(api) = self.apis.get(&platform) else {
			return Err(DispatchError::NotFound(format!("platform {platform} is not configured")));
		};

		let mut results = BTreeMap::new();

		match self.resolve_credential(platform, &actor_accounts).await? {
			None => {
				results.insert(platform, PlatformOutcome::failed("no usable credential for platform"));
			}
			Some(credential) => {
				match api
					.timeout_user(&credential, target_user_id, duration_seconds, reason.as_deref())
					.await
				{
					Ok(()) => {
						results.insert(platform, PlatformOutcome::ok());
					}
					Err(e) => {
						warn!(%platform, target = %target_user_id, error = %e, "platform timeout call failed");
						results.insert(platform, PlatformOutcome::failed(e.to_string()));
					}
				}
			}
		}

		let mut outcome = DispatchOutcome::from_results(results);
		if !outcome.success {
			return Ok(outcome);
		}

		let now = SystemTime::now();
		let action = NewModerationAction {
			kind: ModerationKind::Timeout,
			target_platform_user_id: target_user_id.to_string(),
			target_user_id: target.map(|a| a.user_id),
			actor_id: actor_id.to_string(),
			duration_seconds: Some(u64::from(duration_seconds)),
			reason: reason.clone(),
			platforms: vec![platform],
		};

		let action_id = self
			.store
			.record_action(&action, now)
			.await
			.map_err(|e| DispatchError::Internal(e.to_string()))?;

		self.store
			.insert_active_timeout(
				platform,
				target_user_id,
				now + Duration::from_secs(u64::from(duration_seconds)),
				now,
			)
			.await
			.map_err(|e| DispatchError::Internal(e.to_string()))?;

		outcome.action_id = Some(action_id);
		metrics::counter!("unichat_moderation_timeouts_total").increment(1);

		self.publish_moderation(
			ModerationKind::Timeout,
			platform,
			target_user_id,
			Some(u64::from(duration_seconds)),
			reason.as_deref(),
			actor_id,
		)
		.await;

		Ok(outcome)
	}

	/// Ban a platform identity. When the target resolves to a linked user,
	/// the ban fans out across all of that user's linked platforms and the
	/// response carries the per-platform result map.
	pub async fn apply_ban(
		&self,
		platform: Platform,
		target_user_id: &str,
		reason: Option<String>,
		actor_id: &str,
	) -> Result<DispatchOutcome, DispatchError> {
		self.apply_across_platforms(ModerationKind::Ban, platform, target_user_id, reason, actor_id)
			.await
	}

	/// Lift a ban, fanning out like [`apply_ban`].
	pub async fn apply_unban(
		&self,
		platform: Platform,
		target_user_id: &str,
		actor_id: &str,
	) -> Result<DispatchOutcome, DispatchError> {
		self.apply_across_platforms(ModerationKind::Unban, platform, target_user_id, None, actor_id)
			.await
	}

	async fn apply_across_platforms(
		&self,
		kind: ModerationKind,
		platform: Platform,
		target_user_id: &str,
		reason: Option<String>,
		actor_id: &str,
	) -> Result<DispatchOutcome, DispatchError> {
		if target_user_id.trim().is_empty() {
			return Err(DispatchError::Validation("target_user_id must be non-empty".to_string()));
		}

		let (role, actor_accounts) = self.actor_context(actor_id).await?;
		self.require_role(role, Role::Moderator)?;

		let target = self.resolve_target(platform, target_user_id).await?;

		// A linked target is actioned on every platform it is linked to;
		// an anonymous one only on the platform named in the request.
		let (internal_target_id, identities): (Option<String>, Vec<(Platform, String)>) = match &target {
			Some(account) => {
				let accounts = self
					.store
					.linked_accounts_for_user(&account.user_id)
					.await
					.map_err(|e| DispatchError::Internal(e.to_string()))?;
				let identities = accounts
					.iter()
					.map(|a| (a.platform, a.platform_user_id.clone()))
					.collect();
				(Some(account.user_id.clone()), identities)
			}
			None => (None, vec![(platform, target_user_id.to_string())]),
		};

		if !self.apis.contains_key(&platform) {
			return Err(DispatchError::NotFound(format!("platform {platform} is not configured")));
		}

		let mut results = BTreeMap::new();

		for (target_platform, platform_user_id) in &identities {
			let Some(api) = self.apis.get(target_platform) else {
				results.insert(*target_platform, PlatformOutcome::failed("platform not configured"));
				continue;
			};

			let credential = match self.resolve_credential(*target_platform, &actor_accounts).await? {
				Some(c) => c,
				None => {
					results.insert(*target_platform, PlatformOutcome::failed("no usable credential for platform"));
					continue;
				}
			};

			// Each platform call is independent; one failure never aborts
			// the rest of the fan-out.
			let call = match kind {
				ModerationKind::Ban => api.ban_user(&credential, platform_user_id, reason.as_deref()).await,
				ModerationKind::Unban => api.unban_user(&credential, platform_user_id).await,
				ModerationKind::Timeout => unreachable!("timeouts do not fan out"),
			};

			match call {
				Ok(()) => {
					results.insert(*target_platform, PlatformOutcome::ok());
				}
				Err(e) => {
					warn!(platform = %target_platform, target = %platform_user_id, error = %e, "platform {kind} call failed");
					results.insert(*target_platform, PlatformOutcome::failed(e.to_string()));
				}
			}
		}

		let mut outcome = DispatchOutcome::from_results(results);
		if !outcome.success {
			return Ok(outcome);
		}

		let now = SystemTime::now();
		let action = NewModerationAction {
			kind,
			target_platform_user_id: target_user_id.to_string(),
			target_user_id: internal_target_id,
			actor_id: actor_id.to_string(),
			duration_seconds: None,
			reason: reason.clone(),
			platforms: outcome.succeeded_platforms(),
		};

		let action_id = self
			.store
			.record_action(&action, now)
			.await
			.map_err(|e| DispatchError::Internal(e.to_string()))?;
		outcome.action_id = Some(action_id);

		metrics::counter!("unichat_moderation_actions_total", "kind" => kind.as_str()).increment(1);

		for (succeeded_platform, platform_user_id) in identities
			.iter()
			.filter(|(p, _)| outcome.results.get(p).is_some_and(|r| r.ok))
		{
			self.publish_moderation(kind, *succeeded_platform, platform_user_id, None, reason.as_deref(), actor_id)
				.await;
		}

		debug!(%kind, target = %target_user_id, success = outcome.success, "moderation dispatch complete");
		Ok(outcome)
	}
}
