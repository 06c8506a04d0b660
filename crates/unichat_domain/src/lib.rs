#![forbid(unsafe_code)]

pub mod role;

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported chat platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
	Twitch,
	Kick,
	#[serde(rename = "youtube")]
	YouTube,
}

impl Platform {
	/// All platforms, in stable order.
	pub const ALL: [Platform; 3] = [Platform::Twitch, Platform::Kick, Platform::YouTube];

	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Platform::Twitch => "twitch",
			Platform::Kick => "kick",
			Platform::YouTube => "youtube",
		}
	}
}

impl fmt::Display for Platform {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown platform: {0}")]
	UnknownPlatform(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

impl FromStr for Platform {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"twitch" => Ok(Platform::Twitch),
			"kick" => Ok(Platform::Kick),
			"youtube" | "you_tube" | "yt" => Ok(Platform::YouTube),
			other => Err(ParseIdError::UnknownPlatform(other.to_string())),
		}
	}
}

/// A `(platform, username)` pair identifying one account on one platform.
///
/// Username comparison is case-insensitive; platform logins are not
/// case-sensitive on any of the supported platforms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountKey {
	pub platform: Platform,
	pub username: String,
}

impl AccountKey {
	pub fn new(platform: Platform, username: impl Into<String>) -> Result<Self, ParseIdError> {
		let username = username.into();
		if username.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self { platform, username })
	}

	/// Parse a `platform:username` string.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let (platform_s, username) = s
			.split_once(':')
			.ok_or_else(|| ParseIdError::InvalidFormat("expected platform:username".into()))?;

		let platform = Platform::from_str(platform_s)?;
		AccountKey::new(platform, username.to_string())
	}

	pub fn matches(&self, platform: Platform, username: &str) -> bool {
		self.platform == platform && self.username.eq_ignore_ascii_case(username.trim())
	}
}

impl fmt::Display for AccountKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.platform, self.username)
	}
}

impl FromStr for AccountKey {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		AccountKey::parse(s)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn platform_parse_and_display() {
		assert_eq!("twitch".parse::<Platform>().unwrap(), Platform::Twitch);
		assert_eq!("YT".parse::<Platform>().unwrap(), Platform::YouTube);
		assert_eq!(Platform::Kick.to_string(), "kick");
	}

	#[test]
	fn account_key_parse_roundtrip() {
		let key = AccountKey::parse("twitch:shroud").unwrap();
		assert_eq!(key.platform, Platform::Twitch);
		assert_eq!(key.username, "shroud");
		assert_eq!(key.to_string(), "twitch:shroud");
	}

	#[test]
	fn account_key_matches_case_insensitive() {
		let key = AccountKey::parse("kick:TrainWreck").unwrap();
		assert!(key.matches(Platform::Kick, "trainwreck"));
		assert!(key.matches(Platform::Kick, " TRAINWRECK "));
		assert!(!key.matches(Platform::Twitch, "trainwreck"));
	}

	#[test]
	fn rejects_empty_ids() {
		assert!("".parse::<Platform>().is_err());
		assert!(AccountKey::new(Platform::Twitch, "   ").is_err());
		assert!(AccountKey::parse("twitch").is_err());
	}
}
