use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use tracing::{debug, instrument};

use super::http::ensure_success;
use super::AuthClient;
use crate::errors::{MsAuthError, Result};
use crate::models::{Entitlements, McLoginRequest, McLoginResponse, MinecraftProfile};
use crate::record::McToken;

impl AuthClient {
    /// Login to Minecraft Services with an `XBL3.0 x=<uhs>;<token>` identity
    #[instrument(skip_all)]
    pub async fn mc_login(&self, identity_token: &str) -> Result<McToken> {
        let request = McLoginRequest {
            identity_token: identity_token.to_string(),
            ensure_legacy_enabled: true,
        };

        debug!("Logging in to Minecraft Services");
        let response = self
            .send(
                self.http
                    .post(&self.config.endpoints.mc_login)
                    .header(ACCEPT, "application/json")
                    .json(&request),
            )
            .await?;

        let mc: McLoginResponse = ensure_success(response).await?.json().await?;
        Ok(McToken::new(mc.access_token, mc.token_type, mc.expires_in))
    }

    /// Fetch the Minecraft profile; `authorization` is [`McToken::authorization`]
    #[instrument(skip_all)]
    pub async fn fetch_profile(&self, authorization: &str) -> Result<MinecraftProfile> {
        debug!("Fetching Minecraft profile");
        let response = self
            .send(
                self.http
                    .get(&self.config.endpoints.mc_profile)
                    .header(AUTHORIZATION, authorization)
                    .header(ACCEPT, "application/json"),
            )
            .await?;

        // Accounts that never bought the game have no profile
        if response.status() == StatusCode::NOT_FOUND {
            return Err(MsAuthError::MinecraftProfileNotFound);
        }

        let profile: MinecraftProfile = ensure_success(response).await?.json().await?;
        Ok(profile)
    }

    /// Fetch the store entitlements, used to verify game ownership
    #[instrument(skip_all)]
    pub async fn fetch_entitlements(&self, authorization: &str) -> Result<Entitlements> {
        debug!("Fetching Minecraft entitlements");
        let response = self
            .send(
                self.http
                    .get(&self.config.endpoints.mc_entitlements)
                    .header(AUTHORIZATION, authorization)
                    .header(ACCEPT, "application/json"),
            )
            .await?;

        Ok(ensure_success(response).await?.json().await?)
    }
}
