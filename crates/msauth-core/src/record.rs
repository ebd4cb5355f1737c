use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::TOKEN_EXPIRY_SKEW;
use crate::models::MinecraftProfile;

/// What a caller keeps after logging in: enough to launch the game and to
/// log in again later without the browser.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthenticationRecord {
    pub username: String,
    pub uuid: Uuid,
    /// Minecraft access token
    pub access_token: String,
    /// Microsoft refresh token; cookie logins don't get one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// When the Minecraft access token stops working
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthenticationRecord {
    /// Check if the Minecraft access token is expired or about to be
    pub fn needs_refresh(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expired_with_skew(expires_at),
            None => false,
        }
    }

    /// Key the record is stored under: the hyphenated UUID
    pub fn account_key(&self) -> String {
        self.uuid.hyphenated().to_string()
    }

    pub fn can_reauthenticate(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

impl fmt::Debug for AuthenticationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationRecord")
            .field("username", &self.username)
            .field("uuid", &self.uuid)
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Result of a completed authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authentication {
    pub record: AuthenticationRecord,
    pub profile: MinecraftProfile,
    pub xuid: Option<String>,
    pub gamertag: Option<String>,
}

/// Microsoft OAuth tokens
#[derive(Clone, PartialEq, Eq)]
pub struct MsTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl MsTokens {
    pub fn new(access_token: String, refresh_token: Option<String>, expires_in: u64) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at: expires_from_now(expires_in),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

impl fmt::Debug for MsTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsTokens")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Xbox Live user token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XblToken {
    pub token: String,
    pub uhs: String,
    pub not_after: Option<String>,
}

/// XSTS token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XstsToken {
    pub token: String,
    pub uhs: String,
    pub not_after: Option<String>,
}

impl XstsToken {
    /// `XBL3.0 x=<uhs>;<token>`, the form Minecraft Services and Xbox APIs accept
    pub fn identity_token(&self) -> String {
        format!("XBL3.0 x={};{}", self.uhs, self.token)
    }
}

/// Minecraft access token
#[derive(Clone, PartialEq, Eq)]
pub struct McToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
}

impl McToken {
    pub fn new(access_token: String, token_type: String, expires_in: u64) -> Self {
        Self {
            access_token,
            token_type,
            expires_at: expires_from_now(expires_in),
        }
    }

    /// Value for the `Authorization` header
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }

    pub fn is_expired(&self) -> bool {
        expired_with_skew(self.expires_at)
    }
}

impl fmt::Debug for McToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McToken")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

fn expires_from_now(expires_in: u64) -> DateTime<Utc> {
    let now = Utc::now();
    i64::try_from(expires_in)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn expired_with_skew(expires_at: DateTime<Utc>) -> bool {
    let skew = chrono::Duration::from_std(TOKEN_EXPIRY_SKEW).unwrap_or(chrono::Duration::seconds(300));
    Utc::now() + skew >= expires_at
}
