//! Wire types for every hop of the chain.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Microsoft OAuth token response (from both code and refresh_token grants)
#[derive(Debug, Clone, Deserialize)]
pub struct MsTokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Xbox Live user.authenticate request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XblAuthRequest {
    pub properties: XblAuthProperties,
    pub relying_party: String,
    pub token_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XblAuthProperties {
    pub auth_method: String,
    pub site_name: String,
    pub rps_ticket: String,
}

/// Response shape shared by user.authenticate and xsts.authorize
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct XboxTokenResponse {
    pub token: String,
    pub display_claims: XblDisplayClaims,
    #[serde(default)]
    pub issue_instant: Option<String>,
    #[serde(default)]
    pub not_after: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct XblDisplayClaims {
    pub xui: Vec<XblUserInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct XblUserInfo {
    pub uhs: String,
    #[serde(default)]
    pub xid: Option<String>,
    #[serde(default)]
    pub gtg: Option<String>,
}

/// XSTS authorize request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XstsAuthRequest {
    pub properties: XstsAuthProperties,
    pub relying_party: String,
    pub token_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XstsAuthProperties {
    pub sandbox_id: String,
    pub user_tokens: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optional_display_claims: Option<Vec<String>>,
}

/// XSTS error response
#[derive(Debug, Clone, Deserialize)]
pub struct XstsErrorResponse {
    #[serde(rename = "XErr")]
    pub xerr: u64,
    #[serde(default, rename = "Message")]
    pub message: Option<String>,
    #[serde(default, rename = "Redirect")]
    pub redirect: Option<String>,
}

/// Xbox profile settings response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XboxProfileResponse {
    #[serde(default)]
    pub profile_users: Vec<XboxProfileUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct XboxProfileUser {
    pub id: String,
    #[serde(default)]
    pub settings: Vec<XboxProfileSetting>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct XboxProfileSetting {
    pub id: String,
    pub value: String,
}

/// Minecraft login_with_xbox request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McLoginRequest {
    pub identity_token: String,
    pub ensure_legacy_enabled: bool,
}

/// Minecraft login_with_xbox response
#[derive(Debug, Clone, Deserialize)]
pub struct McLoginResponse {
    /// Not the player name; an opaque account identifier
    #[serde(default)]
    pub username: Option<String>,
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_in: u64,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Minecraft profile response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MinecraftProfile {
    /// UUID without dashes
    pub id: String,
    /// Player name
    pub name: String,
    #[serde(default)]
    pub skins: Vec<MinecraftSkin>,
    #[serde(default)]
    pub capes: Vec<MinecraftCape>,
}

impl MinecraftProfile {
    /// Parse the dash-less profile id into a UUID
    pub fn uuid(&self) -> crate::Result<Uuid> {
        Uuid::parse_str(&self.id).map_err(|e| {
            crate::MsAuthError::InvalidResponse(format!("Invalid profile id {:?}: {}", self.id, e))
        })
    }

    /// The skin currently applied, if any
    pub fn active_skin(&self) -> Option<&MinecraftSkin> {
        self.skins.iter().find(|s| s.state == "ACTIVE")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MinecraftSkin {
    pub id: String,
    pub state: String,
    pub url: String,
    #[serde(default)]
    pub texture_key: Option<String>,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MinecraftCape {
    pub id: String,
    pub state: String,
    pub url: String,
    #[serde(default)]
    pub alias: Option<String>,
}

/// Minecraft store entitlements
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Entitlements {
    #[serde(default)]
    pub items: Vec<Entitlement>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub key_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Entitlement {
    pub name: String,
    #[serde(default)]
    pub signature: Option<String>,
}

impl Entitlements {
    /// Whether the account owns Minecraft: Java Edition
    pub fn owns_game(&self) -> bool {
        self.items
            .iter()
            .any(|item| item.name == "game_minecraft" || item.name == "product_minecraft")
    }
}
