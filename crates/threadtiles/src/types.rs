//! Identifiers and tags shared across threadtiles.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Capture session (and thread) identifier.
///
/// 128 random bits rendered as 32 lowercase hex chars. Doubles as the tile
/// store key, so it never contains anything but `[0-9a-f]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid session id: {0:?}")]
pub struct InvalidSessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Store key, e.g. `3f2a...` (32 hex chars).
    pub fn key(&self) -> String {
        self.0.simple().to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for SessionId {
    type Err = InvalidSessionId;

    /// Accepts the 32-char simple form only. The hyphenated form would alias
    /// the same session under a second URL.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(InvalidSessionId(s.to_string()));
        }
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| InvalidSessionId(s.to_string()))
    }
}

impl Serialize for SessionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Chat platform the capture came from. Informational only; it is passed
/// through to the analysis hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Whatsapp,
    Imessage,
    Linkedin,
    Twitter,
    Instagram,
    Discord,
    Reddit,
    Slack,
    Telegram,
    Email,
    #[default]
    #[serde(other)]
    Unknown,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::Whatsapp => "whatsapp",
            Platform::Imessage => "imessage",
            Platform::Linkedin => "linkedin",
            Platform::Twitter => "twitter",
            Platform::Instagram => "instagram",
            Platform::Discord => "discord",
            Platform::Reddit => "reddit",
            Platform::Slack => "slack",
            Platform::Telegram => "telegram",
            Platform::Email => "email",
            Platform::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_round_trips_through_display() {
        let id = SessionId::new();
        let s = id.to_string();
        assert_eq!(s.len(), 32);
        assert_eq!(s, id.key());
        assert_eq!(s.parse::<SessionId>().unwrap(), id);
    }

    #[test]
    fn test_session_id_rejects_other_shapes() {
        let id = SessionId::new();
        let hyphenated = id.0.hyphenated().to_string();
        assert!(hyphenated.parse::<SessionId>().is_err());
        assert!("../../etc/passwd".parse::<SessionId>().is_err());
        assert!("".parse::<SessionId>().is_err());
        assert!("zz".repeat(16).parse::<SessionId>().is_err());
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_platform_serde() {
        let p: Platform = serde_json::from_str("\"whatsapp\"").unwrap();
        assert_eq!(p, Platform::Whatsapp);

        let p: Platform = serde_json::from_str("\"myspace\"").unwrap();
        assert_eq!(p, Platform::Unknown);

        assert_eq!(serde_json::to_string(&Platform::Imessage).unwrap(), "\"imessage\"");
        assert_eq!(Platform::Discord.to_string(), "discord");
    }
}
