#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, anyhow};
use tokio::sync::Mutex;
use unichat_domain::Platform;
use unichat_platform::{ModerationKind, SecretString};

use crate::util::time::{from_unix_secs, to_unix_secs};

/// Per (user, platform) credential record. Soft-deleted on unlink and
/// quarantined until the cleanup cron purges it.
#[derive(Debug, Clone)]
pub struct LinkedAccount {
	pub user_id: String,
	pub platform: Platform,
	pub platform_user_id: String,
	pub username: String,
	pub access_token: SecretString,
	pub refresh_token: Option<SecretString>,
	pub is_moderator: bool,
	pub scopes: Vec<String>,
	pub linked_at: SystemTime,
	pub unlinked_at: Option<SystemTime>,
}

impl LinkedAccount {
	pub fn is_active(&self) -> bool {
		self.unlinked_at.is_none()
	}
}

/// Durable record of a dispatched moderation action. Append-only.
#[derive(Debug, Clone)]
pub struct NewModerationAction {
	pub kind: ModerationKind,
	pub target_platform_user_id: String,
	/// Internal user id when the target resolved to a linked user.
	pub target_user_id: Option<String>,
	pub actor_id: String,
	pub duration_seconds: Option<u64>,
	pub reason: Option<String>,
	/// Platforms the action actually landed on.
	pub platforms: Vec<Platform>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStatus {
	Active,
	Completed,
}

/// An in-effect, time-bounded mute tracked until it naturally expires.
/// Never deleted; completed rows remain as an audit trail.
#[derive(Debug, Clone)]
pub struct ActiveTimeout {
	pub id: i64,
	pub platform: Platform,
	pub platform_user_id: String,
	pub expires_at: SystemTime,
	pub last_applied_at: SystemTime,
	pub status: TimeoutStatus,
}

/// Authority for moderation state and linked-account records.
///
/// No in-process locking is layered on top: every operation is individually
/// idempotent (status guards in the queries), which is what the reaper and
/// dispatcher rely on when they race.
#[async_trait::async_trait]
pub trait ActionStore: Send + Sync {
	async fn insert_linked_account(&self, account: &LinkedAccount) -> anyhow::Result<()>;

	/// Soft-delete. Returns whether a row transitioned.
	async fn unlink_account(&self, user_id: &str, platform: Platform, at: SystemTime) -> anyhow::Result<bool>;

	/// Active (not unlinked) accounts for a user.
	async fn linked_accounts_for_user(&self, user_id: &str) -> anyhow::Result<Vec<LinkedAccount>>;

	/// Active account matching a platform-native identity.
	async fn find_account_by_platform_user(
		&self,
		platform: Platform,
		platform_user_id: &str,
	) -> anyhow::Result<Option<LinkedAccount>>;

	async fn record_action(&self, action: &NewModerationAction, at: SystemTime) -> anyhow::Result<i64>;

	async fn insert_active_timeout(
		&self,
		platform: Platform,
		platform_user_id: &str,
		expires_at: SystemTime,
		applied_at: SystemTime,
	) -> anyhow::Result<i64>;

	/// Active timeouts whose `last_applied_at` is older than the threshold.
	async fn stale_active_timeouts(&self, last_applied_before: SystemTime) -> anyhow::Result<Vec<ActiveTimeout>>;

	/// Transition active → completed. Returns whether a row transitioned;
	/// re-running on a completed row is a no-op.
	async fn mark_timeout_completed(&self, id: i64) -> anyhow::Result<bool>;

	async fn touch_timeout_reapplied(&self, id: i64, at: SystemTime) -> anyhow::Result<()>;

	/// Purge quarantined (soft-deleted) accounts unlinked before the cutoff.
	/// Returns the number of rows removed.
	async fn purge_unlinked_accounts(&self, unlinked_before: SystemTime) -> anyhow::Result<u64>;
}

/// In-memory store used by tests and persistence-disabled deployments.
#[derive(Default)]
pub struct MemoryStore {
	inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
	accounts: Vec<LinkedAccount>,
	next_action_id: i64,
	actions: Vec<(i64, NewModerationAction, SystemTime)>,
	next_timeout_id: i64,
	timeouts: Vec<ActiveTimeout>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Recorded actions, oldest first. Test observability.
	#[allow(dead_code)]
	pub async fn actions(&self) -> Vec<NewModerationAction> {
		let inner = self.inner.lock().await;
		inner.actions.iter().map(|(_, action, _)| action.clone()).collect()
	}

	/// All timeout rows regardless of staleness. Test observability.
	#[allow(dead_code)]
	pub async fn all_timeouts(&self) -> Vec<ActiveTimeout> {
		let inner = self.inner.lock().await;
		inner.timeouts.clone()
	}
}

#[async_trait::async_trait]
impl ActionStore for MemoryStore {
	async fn insert_linked_account(&self, account: &LinkedAccount) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		let duplicate = inner
			.accounts
			.iter()
			.any(|a| a.is_active() && a.user_id == account.user_id && a.platform == account.platform);
		if duplicate && account.is_active() {
			return Err(anyhow!(
				"user {} already has an active {} account",
				account.user_id,
				account.platform
			));
		}
		inner.accounts.push(account.clone());
		Ok(())
	}

	async fn unlink_account(&self, user_id: &str, platform: Platform, at: SystemTime) -> anyhow::Result<bool> {
		let mut inner = self.inner.lock().await;
		for account in inner.accounts.iter_mut() {
			if account.is_active() && account.user_id == user_id && account.platform == platform {
				account.unlinked_at = Some(at);
				return Ok(true);
			}
		}
		Ok(false)
	}

	async fn linked_accounts_for_user(&self, user_id: &str) -> anyhow::Result<Vec<LinkedAccount>> {
		let inner = self.inner.lock().await;
		Ok(inner
			.accounts
			.iter()
			.filter(|a| a.is_active() && a.user_id == user_id)
			.cloned()
			.collect())
	}

	async fn find_account_by_platform_user(
		&self,
		platform: Platform,
		platform_user_id: &str,
	) -> anyhow::Result<Option<LinkedAccount>> {
		let inner = self.inner.lock().await;
		Ok(inner
			.accounts
			.iter()
			.find(|a| a.is_active() && a.platform == platform && a.platform_user_id == platform_user_id)
			.cloned())
	}

	async fn record_action(&self, action: &NewModerationAction, at: SystemTime) -> anyhow::Result<i64> {
		let mut inner = self.inner.lock().await;
		inner.next_action_id += 1;
		let id = inner.next_action_id;
		inner.actions.push((id, action.clone(), at));
		Ok(id)
	}

	async fn insert_active_timeout(
		&self,
		platform: Platform,
		platform_user_id: &str,
		expires_at: SystemTime,
		applied_at: SystemTime,
	) -> anyhow::Result<i64> {
		let mut inner = self.inner.lock().await;
		inner.next_timeout_id += 1;
		let id = inner.next_timeout_id;
		inner.timeouts.push(ActiveTimeout {
			id,
			platform,
			platform_user_id: platform_user_id.to_string(),
			expires_at,
			last_applied_at: applied_at,
			status: TimeoutStatus::Active,
		});
		Ok(id)
	}

	async fn stale_active_timeouts(&self, last_applied_before: SystemTime) -> anyhow::Result<Vec<ActiveTimeout>> {
		let inner = self.inner.lock().await;
		Ok(inner
			.timeouts
			.iter()
			.filter(|t| t.status == TimeoutStatus::Active && t.last_applied_at < last_applied_before)
			.cloned()
			.collect())
	}

	async fn mark_timeout_completed(&self, id: i64) -> anyhow::Result<bool> {
		let mut inner = self.inner.lock().await;
		for t in inner.timeouts.iter_mut() {
			if t.id == id && t.status == TimeoutStatus::Active {
				t.status = TimeoutStatus::Completed;
				return Ok(true);
			}
		}
		Ok(false)
	}

	async fn touch_timeout_reapplied(&self, id: i64, at: SystemTime) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		for t in inner.timeouts.iter_mut() {
			if t.id == id && t.status == TimeoutStatus::Active {
				t.last_applied_at = at;
			}
		}
		Ok(())
	}

	async fn purge_unlinked_accounts(&self, unlinked_before: SystemTime) -> anyhow::Result<u64> {
		let mut inner = self.inner.lock().await;
		let before = inner.accounts.len();
		inner
			.accounts
			.retain(|a| !matches!(a.unlinked_at, Some(at) if at < unlinked_before));
		Ok((before - inner.accounts.len()) as u64)
	}
}

/// SQL-backed store; sqlite or postgres is selected by the URL prefix.
#[derive(Clone)]
pub struct SqlStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

fn platform_from_column(value: &str) -> anyhow::Result<Platform> {
	value.parse::<Platform>().map_err(|e| anyhow!("bad platform column: {e}"))
}

fn kind_to_column(kind: ModerationKind) -> &'static str {
	kind.as_str()
}

fn scopes_to_column(scopes: &[String]) -> String {
	scopes.join(" ")
}

fn scopes_from_column(value: &str) -> Vec<String> {
	value.split_whitespace().map(|s| s.to_string()).collect()
}

fn platforms_to_column(platforms: &[Platform]) -> String {
	platforms.iter().map(|p| p.as_str()).collect::<Vec<_>>().join(",")
}

impl SqlStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}
}

type AccountRow = (
	String,         // user_id
	String,         // platform
	String,         // platform_user_id
	String,         // username
	String,         // access_token
	Option<String>, // refresh_token
	i64,            // is_moderator
	String,         // scopes
	i64,            // linked_at
	Option<i64>,    // unlinked_at
);

fn account_from_row(row: AccountRow) -> anyhow::Result<LinkedAccount> {
	let (user_id, platform, platform_user_id, username, access_token, refresh_token, is_moderator, scopes, linked_at, unlinked_at) =
		row;
	Ok(LinkedAccount {
		user_id,
		platform: platform_from_column(&platform)?,
		platform_user_id,
		username,
		access_token: SecretString::new(access_token),
		refresh_token: refresh_token.map(SecretString::new),
		is_moderator: is_moderator != 0,
		scopes: scopes_from_column(&scopes),
		linked_at: from_unix_secs(linked_at),
		unlinked_at: unlinked_at.map(from_unix_secs),
	})
}

const SELECT_ACCOUNT_COLUMNS: &str = "user_id, platform, platform_user_id, username, access_token, refresh_token, \
	is_moderator, scopes, linked_at, unlinked_at";

#[async_trait::async_trait]
impl ActionStore for SqlStore {
	async fn insert_linked_account(&self, account: &LinkedAccount) -> anyhow::Result<()> {
		let linked_at = to_unix_secs(account.linked_at);
		let unlinked_at = account.unlinked_at.map(to_unix_secs);
		let scopes = scopes_to_column(&account.scopes);

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO linked_accounts (user_id, platform, platform_user_id, username, access_token, refresh_token, \
					is_moderator, scopes, linked_at, unlinked_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
				)
				.bind(&account.user_id)
				.bind(account.platform.as_str())
				.bind(&account.platform_user_id)
				.bind(&account.username)
				.bind(account.access_token.expose())
				.bind(account.refresh_token.as_ref().map(|t| t.expose().to_string()))
				.bind(account.is_moderator as i64)
				.bind(&scopes)
				.bind(linked_at)
				.bind(unlinked_at)
				.execute(pool)
				.await
				.context("insert linked_account (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO linked_accounts (user_id, platform, platform_user_id, username, access_token, refresh_token, \
					is_moderator, scopes, linked_at, unlinked_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
				)
				.bind(&account.user_id)
				.bind(account.platform.as_str())
				.bind(&account.platform_user_id)
				.bind(&account.username)
				.bind(account.access_token.expose())
				.bind(account.refresh_token.as_ref().map(|t| t.expose().to_string()))
				.bind(account.is_moderator as i64)
				.bind(&scopes)
				.bind(linked_at)
				.bind(unlinked_at)
				.execute(pool)
				.await
				.context("insert linked_account (postgres)")?;
			}
		}

		Ok(())
	}

	async fn unlink_account(&self, user_id: &str, platform: Platform, at: SystemTime) -> anyhow::Result<bool> {
		let at = to_unix_secs(at);

		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"UPDATE linked_accounts SET unlinked_at = ? WHERE user_id = ? AND platform = ? AND unlinked_at IS NULL",
				)
				.bind(at)
				.bind(user_id)
				.bind(platform.as_str())
				.execute(pool)
				.await
				.context("unlink account (sqlite)")?
				.rows_affected()
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"UPDATE linked_accounts SET unlinked_at = $1 WHERE user_id = $2 AND platform = $3 AND unlinked_at IS NULL",
				)
				.bind(at)
				.bind(user_id)
				.bind(platform.as_str())
				.execute(pool)
				.await
				.context("unlink account (postgres)")?
				.rows_affected()
			}
		};

		Ok(affected > 0)
	}

	async fn linked_accounts_for_user(&self, user_id: &str) -> anyhow::Result<Vec<LinkedAccount>> {
		let rows: Vec<AccountRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(&format!(
				"SELECT {SELECT_ACCOUNT_COLUMNS} FROM linked_accounts WHERE user_id = ? AND unlinked_at IS NULL",
			))
			.bind(user_id)
			.fetch_all(pool)
			.await
			.context("select linked_accounts (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(&format!(
				"SELECT {SELECT_ACCOUNT_COLUMNS} FROM linked_accounts WHERE user_id = $1 AND unlinked_at IS NULL",
			))
			.bind(user_id)
			.fetch_all(pool)
			.await
			.context("select linked_accounts (postgres)")?,
		};

		rows.into_iter().map(account_from_row).collect()
	}

	async fn find_account_by_platform_user(
		&self,
		platform: Platform,
		platform_user_id: &str,
	) -> anyhow::Result<Option<LinkedAccount>> {
		let row: Option<AccountRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(&format!(
				"SELECT {SELECT_ACCOUNT_COLUMNS} FROM linked_accounts \
				WHERE platform = ? AND platform_user_id = ? AND unlinked_at IS NULL",
			))
			.bind(platform.as_str())
			.bind(platform_user_id)
			.fetch_optional(pool)
			.await
			.context("find linked_account (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(&format!(
				"SELECT {SELECT_ACCOUNT_COLUMNS} FROM linked_accounts \
				WHERE platform = $1 AND platform_user_id = $2 AND unlinked_at IS NULL",
			))
			.bind(platform.as_str())
			.bind(platform_user_id)
			.fetch_optional(pool)
			.await
			.context("find linked_account (postgres)")?,
		};

		row.map(account_from_row).transpose()
	}

	async fn record_action(&self, action: &NewModerationAction, at: SystemTime) -> anyhow::Result<i64> {
		let created_at = to_unix_secs(at);
		let platforms = platforms_to_column(&action.platforms);
		let duration = action.duration_seconds.map(|d| d as i64);

		let id = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let row: (i64,) = sqlx::query_as(
					"INSERT INTO moderation_actions (kind, target_platform_user_id, target_user_id, actor_id, \
					duration_seconds, reason, platforms, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
				)
				.bind(kind_to_column(action.kind))
				.bind(&action.target_platform_user_id)
				.bind(&action.target_user_id)
				.bind(&action.actor_id)
				.bind(duration)
				.bind(&action.reason)
				.bind(&platforms)
				.bind(created_at)
				.fetch_one(pool)
				.await
				.context("insert moderation_action (sqlite)")?;
				row.0
			}
			SqlBackend::Postgres(pool) => {
				let row: (i64,) = sqlx::query_as(
					"INSERT INTO moderation_actions (kind, target_platform_user_id, target_user_id, actor_id, \
					duration_seconds, reason, platforms, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
				)
				.bind(kind_to_column(action.kind))
				.bind(&action.target_platform_user_id)
				.bind(&action.target_user_id)
				.bind(&action.actor_id)
				.bind(duration)
				.bind(&action.reason)
				.bind(&platforms)
				.bind(created_at)
				.fetch_one(pool)
				.await
				.context("insert moderation_action (postgres)")?;
				row.0
			}
		};

		Ok(id)
	}

	async fn insert_active_timeout(
		&self,
		platform: Platform,
		platform_user_id: &str,
		expires_at: SystemTime,
		applied_at: SystemTime,
	) -> anyhow::Result<i64> {
		let expires = to_unix_secs(expires_at);
		let applied = to_unix_secs(applied_at);

		let id = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let row: (i64,) = sqlx::query_as(
					"INSERT INTO active_timeouts (platform, platform_user_id, expires_at, last_applied_at, status) \
					VALUES (?, ?, ?, ?, 'active') RETURNING id",
				)
				.bind(platform.as_str())
				.bind(platform_user_id)
				.bind(expires)
				.bind(applied)
				.fetch_one(pool)
				.await
				.context("insert active_timeout (sqlite)")?;
				row.0
			}
			SqlBackend::Postgres(pool) => {
				let row: (i64,) = sqlx::query_as(
					"INSERT INTO active_timeouts (platform, platform_user_id, expires_at, last_applied_at, status) \
					VALUES ($1, $2, $3, $4, 'active') RETURNING id",
				)
				.bind(platform.as_str())
				.bind(platform_user_id)
				.bind(expires)
				.bind(applied)
				.fetch_one(pool)
				.await
				.context("insert active_timeout (postgres)")?;
				row.0
			}
		};

		Ok(id)
	}

	async fn stale_active_timeouts(&self, last_applied_before: SystemTime) -> anyhow::Result<Vec<ActiveTimeout>> {
		let threshold = to_unix_secs(last_applied_before);

		let rows: Vec<(i64, String, String, i64, i64)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT id, platform, platform_user_id, expires_at, last_applied_at FROM active_timeouts \
				WHERE status = 'active' AND last_applied_at < ?",
			)
			.bind(threshold)
			.fetch_all(pool)
			.await
			.context("select stale timeouts (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT id, platform, platform_user_id, expires_at, last_applied_at FROM active_timeouts \
				WHERE status = 'active' AND last_applied_at < $1",
			)
			.bind(threshold)
			.fetch_all(pool)
			.await
			.context("select stale timeouts (postgres)")?,
		};

		rows.into_iter()
			.map(|(id, platform, platform_user_id, expires_at, last_applied_at)| {
				Ok(ActiveTimeout {
					id,
					platform: platform_from_column(&platform)?,
					platform_user_id,
					expires_at: from_unix_secs(expires_at),
					last_applied_at: from_unix_secs(last_applied_at),
					status: TimeoutStatus::Active,
				})
			})
			.collect()
	}

	async fn mark_timeout_completed(&self, id: i64) -> anyhow::Result<bool> {
		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("UPDATE active_timeouts SET status = 'completed' WHERE id = ? AND status = 'active'")
					.bind(id)
					.execute(pool)
					.await
					.context("complete timeout (sqlite)")?
					.rows_affected()
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("UPDATE active_timeouts SET status = 'completed' WHERE id = $1 AND status = 'active'")
					.bind(id)
					.execute(pool)
					.await
					.context("complete timeout (postgres)")?
					.rows_affected()
			}
		};

		Ok(affected > 0)
	}

	async fn touch_timeout_reapplied(&self, id: i64, at: SystemTime) -> anyhow::Result<()> {
		let at = to_unix_secs(at);

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("UPDATE active_timeouts SET last_applied_at = ? WHERE id = ? AND status = 'active'")
					.bind(at)
					.bind(id)
					.execute(pool)
					.await
					.context("touch timeout (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("UPDATE active_timeouts SET last_applied_at = $1 WHERE id = $2 AND status = 'active'")
					.bind(at)
					.bind(id)
					.execute(pool)
					.await
					.context("touch timeout (postgres)")?;
			}
		}

		Ok(())
	}

	async fn purge_unlinked_accounts(&self, unlinked_before: SystemTime) -> anyhow::Result<u64> {
		let cutoff = to_unix_secs(unlinked_before);

		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("DELETE FROM linked_accounts WHERE unlinked_at IS NOT NULL AND unlinked_at < ?")
					.bind(cutoff)
					.execute(pool)
					.await
					.context("purge unlinked accounts (sqlite)")?
					.rows_affected()
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("DELETE FROM linked_accounts WHERE unlinked_at IS NOT NULL AND unlinked_at < $1")
					.bind(cutoff)
					.execute(pool)
					.await
					.context("purge unlinked accounts (postgres)")?
					.rows_affected()
			}
		};

		Ok(affected)
	}
}

/// Connect the configured store, falling back to memory when persistence
/// is disabled.
pub async fn connect_store(database_url: Option<&str>) -> anyhow::Result<Arc<dyn ActionStore>> {
	match database_url {
		Some(url) => Ok(Arc::new(SqlStore::connect(url).await?)),
		None => Ok(Arc::new(MemoryStore::new())),
	}
}
