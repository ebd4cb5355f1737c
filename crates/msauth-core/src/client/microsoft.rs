use reqwest::header::ACCEPT;
use tracing::{debug, instrument};
use url::Url;

use super::http::http_error;
use super::AuthClient;
use crate::config::OAUTH_SCOPE;
use crate::errors::{MsAuthError, Result};
use crate::models::MsTokenResponse;
use crate::record::MsTokens;

impl AuthClient {
    /// Build the URL the user signs in at
    #[instrument(skip(self, state))]
    pub fn authorize_url(&self, client_id: &str, redirect_uri: &str, state: Option<&str>) -> Result<Url> {
        let mut url = Url::parse(&self.config.endpoints.ms_authorize)?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", client_id)
                .append_pair("response_type", "code")
                .append_pair("scope", OAUTH_SCOPE)
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("prompt", "select_account");
            if let Some(state) = state {
                query.append_pair("state", state);
            }
        }

        debug!("Built authorize URL: {}", url);
        Ok(url)
    }

    /// Exchange an authorization code for Microsoft tokens
    #[instrument(skip(self, code))]
    pub async fn exchange_code(&self, client_id: &str, code: &str, redirect_uri: &str) -> Result<MsTokens> {
        debug!("Exchanging authorization code for tokens");
        self.token_grant(&[
            ("client_id", client_id),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri),
            ("scope", OAUTH_SCOPE),
        ])
        .await
    }

    /// Use a refresh token to obtain new Microsoft tokens
    #[instrument(skip(self, refresh_token))]
    pub async fn refresh_ms_token(
        &self,
        client_id: &str,
        refresh_token: &str,
        redirect_uri: &str,
    ) -> Result<MsTokens> {
        debug!("Refreshing Microsoft access token");
        self.token_grant(&[
            ("client_id", client_id),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
            ("redirect_uri", redirect_uri),
            ("scope", OAUTH_SCOPE),
        ])
        .await
    }

    async fn token_grant(&self, form: &[(&str, &str)]) -> Result<MsTokens> {
        let request = self
            .http
            .post(&self.config.endpoints.ms_token)
            .header(ACCEPT, "application/json")
            .form(form);
        let response = self.send(request).await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();

            if body.contains("invalid_grant") {
                return Err(MsAuthError::OAuthInvalidGrant);
            }
            return Err(http_error(status, &body));
        }

        let token_response: MsTokenResponse = response.json().await?;
        Ok(MsTokens::new(
            token_response.access_token,
            token_response.refresh_token,
            token_response.expires_in,
        ))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::client::test_support::test_config;

    #[test]
    fn test_authorize_url() {
        let client = AuthClient::new(Default::default()).unwrap();
        let url = client
            .authorize_url("my-client", "http://localhost:59125", Some("xyz"))
            .unwrap();

        assert_eq!(url.host_str(), Some("login.live.com"));
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("client_id".into(), "my-client".into())));
        assert!(pairs.contains(&("response_type".into(), "code".into())));
        assert!(pairs.contains(&("scope".into(), OAUTH_SCOPE.into())));
        assert!(pairs.contains(&("redirect_uri".into(), "http://localhost:59125".into())));
        assert!(pairs.contains(&("prompt".into(), "select_account".into())));
        assert!(pairs.contains(&("state".into(), "xyz".into())));
    }

    #[tokio::test]
    async fn test_exchange_code_posts_form() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth20_token.srf"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=the-code"))
            .and(body_string_contains("redirect_uri=http%3A%2F%2Flocalhost%3A59125"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "token_type": "bearer",
                "expires_in": 3600,
                "scope": "XboxLive.signin XboxLive.offline_access",
                "access_token": "ms-access",
                "refresh_token": "ms-refresh",
                "user_id": "abc"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = AuthClient::new(test_config(&server)).unwrap();
        let tokens = client
            .exchange_code("client", "the-code", "http://localhost:59125")
            .await
            .unwrap();

        assert_eq!(tokens.access_token, "ms-access");
        assert_eq!(tokens.refresh_token.as_deref(), Some("ms-refresh"));
        assert!(!tokens.is_expired());
    }

    #[tokio::test]
    async fn test_refresh_invalid_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth20_token.srf"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "The refresh token has expired."
            })))
            .mount(&server)
            .await;

        let client = AuthClient::new(test_config(&server)).unwrap();
        let result = client
            .refresh_ms_token("client", "stale", "http://localhost:59125")
            .await;

        assert!(matches!(result, Err(MsAuthError::OAuthInvalidGrant)));
    }
}
