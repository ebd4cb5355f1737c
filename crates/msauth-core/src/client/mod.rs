//! HTTP side of the chain: one client, one file per service.

mod http;
mod microsoft;
mod minecraft;
mod sisu;
mod xbox;

use reqwest::{redirect, Client};
use tracing::{debug, instrument, warn};

use crate::config::{AuthConfig, RP_MINECRAFT};
use crate::errors::{MsAuthError, Result};
use crate::models::MinecraftProfile;
use crate::record::{Authentication, AuthenticationRecord, MsTokens};

/// Client for the Microsoft, Xbox Live and Minecraft Services endpoints
#[derive(Debug, Clone)]
pub struct AuthClient {
    config: AuthConfig,
    http: Client,
}

impl AuthClient {
    /// Create a new authentication client
    pub fn new(config: AuthConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(config.http_timeouts.connect)
            .timeout(config.http_timeouts.request)
            .user_agent(config.user_agent.as_deref().unwrap_or("msauth"))
            .redirect(redirect::Policy::none())
            .build()?;

        Ok(Self { config, http })
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Run the chain from freshly obtained Microsoft tokens:
    /// XBL -> XSTS -> Minecraft login -> profile
    #[instrument(skip(self, ms))]
    pub async fn complete_chain(&self, ms: MsTokens) -> Result<Authentication> {
        debug!("Starting Xbox Live / Minecraft chain");

        let xbl = self.xbl_authenticate(&ms.access_token).await?;
        let xsts = self.xsts_authorize(&xbl.token, RP_MINECRAFT).await?;

        let (xuid, gamertag) = match self.fetch_xuid(&xbl.token).await {
            Ok((x, g)) => (Some(x), Some(g)),
            Err(e) => {
                warn!("Failed to fetch XUID/gamertag: {}", e);
                (None, None)
            }
        };

        let (record, profile) = self
            .login_with_identity(&xsts.identity_token(), ms.refresh_token)
            .await?;

        Ok(Authentication {
            record,
            profile,
            xuid,
            gamertag,
        })
    }

    /// Shared tail of every flow once an XSTS identity token is in hand
    #[instrument(skip_all)]
    pub(crate) async fn login_with_identity(
        &self,
        identity_token: &str,
        refresh_token: Option<String>,
    ) -> Result<(AuthenticationRecord, MinecraftProfile)> {
        self.checkout_xbox_profile(identity_token).await?;

        let mc = self.mc_login(identity_token).await?;
        let authorization = mc.authorization();

        if self.config.verify_ownership {
            let entitlements = self.fetch_entitlements(&authorization).await?;
            if !entitlements.owns_game() {
                return Err(MsAuthError::GameNotOwned);
            }
        }

        let profile = self.fetch_profile(&authorization).await?;
        debug!(username = %profile.name, "Minecraft login complete");

        let record = AuthenticationRecord {
            username: profile.name.clone(),
            uuid: profile.uuid()?,
            access_token: mc.access_token,
            refresh_token,
            expires_at: Some(mc.expires_at),
        };

        Ok((record, profile))
    }
}


#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn test_complete_chain() {
        let server = MockServer::start().await;
        mount_xbox_and_minecraft(&server).await;

        let client = AuthClient::new(test_config(&server)).unwrap();
        let ms = MsTokens::new("ms-access".to_string(), Some("ms-refresh".to_string()), 3600);
        let auth = client.complete_chain(ms).await.unwrap();

        assert_eq!(auth.record.username, "Notch");
        assert_eq!(auth.record.access_token, "mc-access");
        assert_eq!(auth.record.refresh_token.as_deref(), Some("ms-refresh"));
        assert_eq!(auth.record.account_key(), "069a79f4-44e9-4726-a5be-fca90e38aaf5");
        assert_eq!(auth.xuid.as_deref(), Some("2535400000000000"));
        assert_eq!(auth.gamertag.as_deref(), Some("Gamer"));
    }

    #[tokio::test]
    async fn test_chain_rejects_unowned_game() {
        let server = MockServer::start().await;
        mount_xbox_and_minecraft(&server).await;
        Mock::given(method("GET"))
            .and(path("/entitlements/mcstore"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": [] })))
            .mount(&server)
            .await;

        let config = AuthConfig {
            verify_ownership: true,
            ..test_config(&server)
        };
        let client = AuthClient::new(config).unwrap();
        let ms = MsTokens::new("ms-access".to_string(), None, 3600);

        let result = client.complete_chain(ms).await;
        assert!(matches!(result, Err(MsAuthError::GameNotOwned)));
    }

    #[tokio::test]
    async fn test_chain_survives_missing_xuid() {
        let server = MockServer::start().await;
        // Only the Minecraft relying party is answered; the xboxlive.com lookup 404s
        Mock::given(method("POST"))
            .and(path("/user/authenticate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Token": "xbl-token",
                "DisplayClaims": { "xui": [{ "uhs": "uhs-1" }] }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/xsts/authorize"))
            .and(wiremock::matchers::body_partial_json(
                json!({ "RelyingParty": "rp://api.minecraftservices.com/" }),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Token": "xsts-token",
                "DisplayClaims": { "xui": [{ "uhs": "uhs-1" }] }
            })))
            .mount(&server)
            .await;
        mount_minecraft(&server).await;

        let client = AuthClient::new(test_config(&server)).unwrap();
        let ms = MsTokens::new("ms-access".to_string(), None, 3600);
        let auth = client.complete_chain(ms).await.unwrap();

        assert_eq!(auth.record.username, "Notch");
        assert!(auth.xuid.is_none());
        assert!(auth.gamertag.is_none());
    }
}
