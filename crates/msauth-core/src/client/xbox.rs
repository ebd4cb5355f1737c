use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use tracing::{debug, instrument, warn};

use super::http::{ensure_success, http_error};
use super::AuthClient;
use crate::config::{RP_XBL, RP_XBOXLIVE, XBOX_PROFILE_SETTINGS};
use crate::errors::{MsAuthError, Result, XstsError};
use crate::models::*;
use crate::record::{XblToken, XstsToken};

impl AuthClient {
    /// Authenticate with Xbox Live.
    ///
    /// Tokens issued to Azure applications need the `d=` ticket prefix; the
    /// bare ticket is tried once if the prefixed one is rejected.
    #[instrument(skip(self, ms_access_token))]
    pub async fn xbl_authenticate(&self, ms_access_token: &str) -> Result<XblToken> {
        debug!("Authenticating with Xbox Live");
        let response = self.post_xbl(format!("d={ms_access_token}")).await?;

        let response = if response.status() == StatusCode::BAD_REQUEST {
            warn!("XBL authentication rejected, retrying without 'd=' prefix");
            let retry = self.post_xbl(ms_access_token.to_string()).await?;
            if !retry.status().is_success() {
                return Err(MsAuthError::XblBadRequest);
            }
            retry
        } else {
            ensure_success(response).await?
        };

        let xbl: XboxTokenResponse = response.json().await?;
        let uhs = first_uhs(&xbl)?;
        Ok(XblToken {
            token: xbl.token,
            uhs,
            not_after: xbl.not_after,
        })
    }

    async fn post_xbl(&self, rps_ticket: String) -> Result<reqwest::Response> {
        let request = XblAuthRequest {
            properties: XblAuthProperties {
                auth_method: "RPS".to_string(),
                site_name: "user.auth.xboxlive.com".to_string(),
                rps_ticket,
            },
            relying_party: RP_XBL.to_string(),
            token_type: "JWT".to_string(),
        };

        self.send(
            self.http
                .post(&self.config.endpoints.xbl_authenticate)
                .header(ACCEPT, "application/json")
                .json(&request),
        )
        .await
    }

    /// Authorize the Xbox Live token with XSTS for a relying party
    #[instrument(skip(self, xbl_token))]
    pub async fn xsts_authorize(&self, xbl_token: &str, relying_party: &str) -> Result<XstsToken> {
        debug!("Authorizing with XSTS");
        let response = self.post_xsts(xbl_token, relying_party, None).await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<XstsErrorResponse>(&body) {
                Ok(error_response) => XstsError::from_xerr(error_response.xerr).into(),
                Err(_) => http_error(status, &body),
            });
        }

        let xsts: XboxTokenResponse = ensure_success(response).await?.json().await?;
        let uhs = first_uhs(&xsts)?;
        Ok(XstsToken {
            token: xsts.token,
            uhs,
            not_after: xsts.not_after,
        })
    }

    /// Fetch XUID and gamertag through the xboxlive.com relying party
    #[instrument(skip(self, xbl_token))]
    pub async fn fetch_xuid(&self, xbl_token: &str) -> Result<(String, String)> {
        debug!("Fetching XUID and gamertag");
        let claims = vec!["mgt".to_string(), "mgs".to_string(), "umg".to_string()];
        let response = self.post_xsts(xbl_token, RP_XBOXLIVE, Some(claims)).await?;

        let xsts: XboxTokenResponse = ensure_success(response).await?.json().await?;
        let user_info = xsts
            .display_claims
            .xui
            .into_iter()
            .next()
            .ok_or_else(|| MsAuthError::InvalidResponse("Missing XUI claims".to_string()))?;

        let xuid = user_info
            .xid
            .ok_or_else(|| MsAuthError::InvalidResponse("Missing XUID".to_string()))?;
        let gamertag = user_info
            .gtg
            .ok_or_else(|| MsAuthError::InvalidResponse("Missing gamertag".to_string()))?;

        Ok((xuid, gamertag))
    }

    async fn post_xsts(
        &self,
        xbl_token: &str,
        relying_party: &str,
        optional_display_claims: Option<Vec<String>>,
    ) -> Result<reqwest::Response> {
        let request = XstsAuthRequest {
            properties: XstsAuthProperties {
                sandbox_id: "RETAIL".to_string(),
                user_tokens: vec![xbl_token.to_string()],
                optional_display_claims,
            },
            relying_party: relying_party.to_string(),
            token_type: "JWT".to_string(),
        };

        self.send(
            self.http
                .post(&self.config.endpoints.xsts_authorize)
                .header(ACCEPT, "application/json")
                .json(&request),
        )
        .await
    }

    /// Touch the Xbox profile with the identity token.
    ///
    /// Only a transport failure is an error: the profile service doesn't accept
    /// every relying party, so a refusal is logged and `None` returned.
    #[instrument(skip_all)]
    pub async fn checkout_xbox_profile(&self, identity_token: &str) -> Result<Option<XboxProfileUser>> {
        let request = self
            .http
            .get(&self.config.endpoints.xbox_profile)
            .query(&[("settings", XBOX_PROFILE_SETTINGS)])
            .header(AUTHORIZATION, identity_token)
            .header(ACCEPT, "application/json")
            .header("x-xbl-contract-version", "3");
        let response = self.send(request).await?;

        if !response.status().is_success() {
            debug!(status = %response.status(), "Xbox profile checkout refused");
            return Ok(None);
        }

        match response.json::<XboxProfileResponse>().await {
            Ok(profile) => Ok(profile.profile_users.into_iter().next()),
            Err(e) => {
                debug!("Unreadable Xbox profile response: {}", e);
                Ok(None)
            }
        }
    }
}

fn first_uhs(response: &XboxTokenResponse) -> Result<String> {
    response
        .display_claims
        .xui
        .first()
        .map(|xui| xui.uhs.clone())
        .ok_or_else(|| MsAuthError::InvalidResponse("Missing XUI claims".to_string()))
}
