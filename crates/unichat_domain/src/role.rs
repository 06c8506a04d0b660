#![forbid(unsafe_code)]

//! Role resolution and the permission lattice.
//!
//! Every authorization decision in the hub goes through [`resolve_role`] and
//! [`Role::has_permission`]. Resolution is a pure function of the caller's
//! linked accounts plus the static owner/admin allow-lists; nothing here is
//! cached, so protected-status checks always see current state.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{AccountKey, ParseIdError, Platform};

/// Total-ordered role hierarchy. `Owner` is the broadcaster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	Member,
	Moderator,
	Admin,
	Owner,
}

impl Role {
	pub const fn as_str(self) -> &'static str {
		match self {
			Role::Member => "member",
			Role::Moderator => "moderator",
			Role::Admin => "admin",
			Role::Owner => "owner",
		}
	}

	const fn rank(self) -> u8 {
		match self {
			Role::Member => 0,
			Role::Moderator => 1,
			Role::Admin => 2,
			Role::Owner => 3,
		}
	}

	/// `true` when this role meets or exceeds `required`.
	pub const fn has_permission(self, required: Role) -> bool {
		self.rank() >= required.rank()
	}

	/// Whether this role may assign `target` to another account.
	///
	/// Role changes require admin-or-above; handing out the top role
	/// requires already holding it.
	pub const fn can_assign(self, target: Role) -> bool {
		if !self.has_permission(Role::Admin) {
			return false;
		}
		match target {
			Role::Owner => self.has_permission(Role::Owner),
			_ => true,
		}
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Role {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"member" => Ok(Role::Member),
			// The top role and "broadcaster" are the same rank.
			"owner" | "broadcaster" => Ok(Role::Owner),
			"admin" => Ok(Role::Admin),
			"moderator" | "mod" => Ok(Role::Moderator),
			other => Err(ParseIdError::InvalidFormat(format!("unknown role: {other}"))),
		}
	}
}

/// Static owner/admin allow-lists, loaded from configuration at startup.
#[derive(Debug, Clone, Default)]
pub struct RoleRules {
	pub owners: Vec<AccountKey>,
	pub admins: Vec<AccountKey>,
}

impl RoleRules {
	pub fn new(owners: Vec<AccountKey>, admins: Vec<AccountKey>) -> Self {
		Self { owners, admins }
	}

	/// Whether any of the given accounts is on the owner or admin list.
	pub fn is_protected(&self, claims: &[AccountClaim]) -> bool {
		claims.iter().any(|claim| {
			self.owners.iter().any(|key| key.matches(claim.platform, &claim.username))
				|| self.admins.iter().any(|key| key.matches(claim.platform, &claim.username))
		})
	}
}

/// The slice of a linked account that role resolution looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountClaim {
	pub platform: Platform,
	pub username: String,
	pub is_moderator: bool,
}

impl AccountClaim {
	pub fn new(platform: Platform, username: impl Into<String>, is_moderator: bool) -> Self {
		Self {
			platform,
			username: username.into(),
			is_moderator,
		}
	}
}

/// Compute a user's role from their linked accounts and the static
/// allow-lists. Deterministic and side-effect-free.
pub fn resolve_role(claims: &[AccountClaim], rules: &RoleRules) -> Role {
	let owner = claims
		.iter()
		.any(|claim| rules.owners.iter().any(|key| key.matches(claim.platform, &claim.username)));
	if owner {
		return Role::Owner;
	}

	let admin = claims
		.iter()
		.any(|claim| rules.admins.iter().any(|key| key.matches(claim.platform, &claim.username)));
	if admin {
		return Role::Admin;
	}

	if claims.iter().any(|claim| claim.is_moderator) {
		return Role::Moderator;
	}

	Role::Member
}

#[cfg(test)]
mod tests {
	use super::*;

	fn rules() -> RoleRules {
		RoleRules::new(
			vec![AccountKey::parse("twitch:the_owner").unwrap()],
			vec![
				AccountKey::parse("twitch:site_admin").unwrap(),
				AccountKey::parse("kick:site_admin").unwrap(),
			],
		)
	}

	#[test]
	fn hierarchy_is_total_ordered() {
		assert!(Role::Member < Role::Moderator);
		assert!(Role::Moderator < Role::Admin);
		assert!(Role::Admin < Role::Owner);
	}

	#[test]
	fn has_permission_is_rank_comparison() {
		assert!(Role::Owner.has_permission(Role::Moderator));
		assert!(Role::Moderator.has_permission(Role::Moderator));
		assert!(!Role::Member.has_permission(Role::Moderator));
		assert!(!Role::Admin.has_permission(Role::Owner));
	}

	#[test]
	fn broadcaster_parses_as_owner() {
		assert_eq!("broadcaster".parse::<Role>().unwrap(), Role::Owner);
		assert_eq!("OWNER".parse::<Role>().unwrap(), Role::Owner);
	}

	#[test]
	fn owner_list_wins_over_everything() {
		let claims = vec![
			AccountClaim::new(Platform::Kick, "whoever", true),
			AccountClaim::new(Platform::Twitch, "The_Owner", false),
		];
		assert_eq!(resolve_role(&claims, &rules()), Role::Owner);
	}

	#[test]
	fn admin_list_wins_over_moderator_flag() {
		let claims = vec![AccountClaim::new(Platform::Kick, "site_admin", true)];
		assert_eq!(resolve_role(&claims, &rules()), Role::Admin);
	}

	#[test]
	fn moderator_flag_on_any_account_grants_moderator() {
		let claims = vec![
			AccountClaim::new(Platform::Twitch, "viewer", false),
			AccountClaim::new(Platform::YouTube, "viewer", true),
		];
		assert_eq!(resolve_role(&claims, &rules()), Role::Moderator);
	}

	#[test]
	fn no_accounts_means_member() {
		assert_eq!(resolve_role(&[], &rules()), Role::Member);
		let claims = vec![AccountClaim::new(Platform::Twitch, "viewer", false)];
		assert_eq!(resolve_role(&claims, &rules()), Role::Member);
	}

	#[test]
	fn protected_covers_owners_and_admins() {
		let rules = rules();
		assert!(rules.is_protected(&[AccountClaim::new(Platform::Twitch, "the_owner", false)]));
		assert!(rules.is_protected(&[AccountClaim::new(Platform::Kick, "SITE_ADMIN", false)]));
		assert!(!rules.is_protected(&[AccountClaim::new(Platform::Twitch, "viewer", true)]));
	}

	#[test]
	fn role_assignment_rules() {
		assert!(!Role::Moderator.can_assign(Role::Moderator));
		assert!(Role::Admin.can_assign(Role::Moderator));
		assert!(Role::Admin.can_assign(Role::Admin));
		assert!(!Role::Admin.can_assign(Role::Owner));
		assert!(Role::Owner.can_assign(Role::Owner));
	}
}
