//! Browser-based OAuth2 login: open the Microsoft sign-in page, catch the
//! redirect on a local listener, then run the Xbox Live / Minecraft chain.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::authenticator::{Authenticator, FlowState};
use crate::client::AuthClient;
use crate::config::{AuthConfig, OAuthOptions};
use crate::errors::{MsAuthError, Result};
use crate::record::{Authentication, AuthenticationRecord};
use crate::server::{Callback, PageRenderer, RedirectServer, ResponseState};

/// Authenticates through the Microsoft OAuth2 authorization-code flow
#[derive(Debug)]
pub struct OAuthAuthenticator {
    options: OAuthOptions,
    client: AuthClient,
    flow: FlowState,
}

impl OAuthAuthenticator {
    pub fn new(options: OAuthOptions, config: AuthConfig) -> Result<Self> {
        Ok(Self {
            options,
            client: AuthClient::new(config)?,
            flow: FlowState::new(),
        })
    }

    pub fn options(&self) -> &OAuthOptions {
        &self.options
    }

    pub fn client(&self) -> &AuthClient {
        &self.client
    }

    /// Redirect URI for the configured port
    pub fn redirect_url(&self) -> String {
        OAuthOptions::redirect_url(self.options.port)
    }

    /// Sign-in URL for the configured client and port
    pub fn generate_url(&self, state: Option<&str>) -> Result<Url> {
        self.client
            .authorize_url(&self.options.client_id, &self.redirect_url(), state)
    }

    async fn run_flow(&self) -> Result<Authentication> {
        let mut server = RedirectServer::bind(self.options.port).await?;
        // Port 0 binds anywhere; the redirect must name the real port
        let redirect_uri = OAuthOptions::redirect_url(server.local_port());
        let state = random_state()?;

        let url = self
            .client
            .authorize_url(&self.options.client_id, &redirect_uri, Some(&state))?;
        if let Err(e) = self.options.browser.launch(url.as_str()) {
            warn!("{}", e);
            info!("Open this URL to sign in: {}", url);
        }

        let wait = self.wait_for_redirect(&mut server, &state, &redirect_uri);
        match self.options.callback_timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| MsAuthError::CallbackTimeout)?,
            None => wait.await,
        }
    }

    async fn wait_for_redirect(
        &self,
        server: &mut RedirectServer,
        state: &str,
        redirect_uri: &str,
    ) -> Result<Authentication> {
        let page = self.options.page.as_ref();

        loop {
            let callback = server.accept().await?;

            if let Some(error) = callback.param("error") {
                let error = error.to_string();
                let description = callback.param("error_description").unwrap_or_default().to_string();
                respond(callback, ResponseState::Failure, page).await;

                if error == "access_denied" {
                    return Err(MsAuthError::UserCancelled);
                }
                return Err(MsAuthError::InvalidRedirect(format!("{error}: {description}")));
            }

            // Favicon and other stray requests
            let Some(code) = callback.param("code").map(str::to_owned) else {
                debug!(path = callback.path(), "Redirect without a code, still waiting");
                respond(callback, ResponseState::Invalid, page).await;
                continue;
            };

            if callback.param("state") != Some(state) {
                respond(callback, ResponseState::Failure, page).await;
                return Err(MsAuthError::StateMismatch);
            }

            debug!("Received authorization code");
            let result = self.exchange_and_login(&code, redirect_uri).await;
            let outcome = match result {
                Ok(_) => ResponseState::Success,
                Err(_) => ResponseState::Failure,
            };
            respond(callback, outcome, page).await;
            return result;
        }
    }

    async fn exchange_and_login(&self, code: &str, redirect_uri: &str) -> Result<Authentication> {
        let ms = self
            .client
            .exchange_code(&self.options.client_id, code, redirect_uri)
            .await?;
        self.client.complete_chain(ms).await
    }

    async fn refresh(&self, record: &AuthenticationRecord) -> Result<Authentication> {
        let refresh_token = record
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(MsAuthError::MissingRefreshToken)?;

        let ms = self
            .client
            .refresh_ms_token(&self.options.client_id, refresh_token, &self.redirect_url())
            .await?;
        let mut auth = self.client.complete_chain(ms).await?;

        // Microsoft may not rotate the refresh token
        if auth.record.refresh_token.is_none() {
            auth.record.refresh_token = Some(refresh_token.to_string());
        }
        Ok(auth)
    }
}

#[async_trait]
impl Authenticator for OAuthAuthenticator {
    #[instrument(skip(self))]
    async fn authenticate(&self) -> Result<Authentication> {
        let mut flow = self.flow.begin()?;
        let auth = flow.run(self.run_flow()).await?;
        info!(username = %auth.record.username, "Authenticated");
        Ok(auth)
    }

    #[instrument(skip_all, fields(username = %record.username))]
    async fn reauthenticate(&self, record: &AuthenticationRecord) -> Result<Authentication> {
        let mut flow = self.flow.begin()?;
        let auth = flow.run(self.refresh(record)).await?;
        info!(username = %auth.record.username, "Re-authenticated");
        Ok(auth)
    }

    fn stop(&self) {
        self.flow.stop();
    }

    fn is_authenticating(&self) -> bool {
        self.flow.is_running()
    }
}

async fn respond(callback: Callback, state: ResponseState, page: &dyn PageRenderer) {
    if let Err(e) = callback.respond(state, page).await {
        debug!("Failed to answer the browser: {}", e);
    }
}

fn random_state() -> Result<String> {
    let mut bytes = [0u8; 16];
    getrandom::fill(&mut bytes).map_err(|e| MsAuthError::Crypto(format!("RNG failure: {e}")))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::browser::BrowserLaunch;
    use crate::client::test_support::{mount_xbox_and_minecraft, test_config};

    /// Options whose "browser" hands the sign-in URL to the test
    fn capturing_options() -> (OAuthOptions, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let options = OAuthOptions::new("test-client", 0)
            .with_browser(BrowserLaunch::custom(move |url: &str| -> Result<()> {
                let _ = tx.send(url.to_string());
                Ok(())
            }))
            .with_callback_timeout(Some(Duration::from_secs(10)));
        (options, rx)
    }

    /// Pull `(redirect_uri, state)` out of a sign-in URL
    fn redirect_target(sign_in: &str) -> (String, String) {
        let url = Url::parse(sign_in).unwrap();
        let mut redirect = None;
        let mut state = None;
        for (k, v) in url.query_pairs() {
            match k.as_ref() {
                "redirect_uri" => redirect = Some(v.replace("localhost", "127.0.0.1")),
                "state" => state = Some(v.into_owned()),
                _ => {}
            }
        }
        (redirect.unwrap(), state.unwrap())
    }

    async fn mount_token_endpoint(server: &MockServer, grant: &str) {
        Mock::given(method("POST"))
            .and(path("/oauth20_token.srf"))
            .and(body_string_contains(format!("grant_type={grant}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "token_type": "bearer",
                "expires_in": 3600,
                "access_token": "ms-access",
                "refresh_token": "ms-refresh-new"
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn test_generate_url() {
        let authenticator =
            OAuthAuthenticator::new(OAuthOptions::default(), AuthConfig::default()).unwrap();
        let url = authenticator.generate_url(None).unwrap();

        assert_eq!(authenticator.redirect_url(), "http://localhost:59125");
        let query = url.query().unwrap();
        assert!(query.contains("client_id=54fd49e4-2103-4044-9603-2b028c814ec3"));
        assert!(query.contains("redirect_uri=http%3A%2F%2Flocalhost%3A59125"));
        assert!(!query.contains("state="));
    }

    #[tokio::test]
    async fn test_browser_flow() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server, "authorization_code").await;
        mount_xbox_and_minecraft(&server).await;

        let (options, mut urls) = capturing_options();
        let authenticator = Arc::new(OAuthAuthenticator::new(options, test_config(&server)).unwrap());

        let flow = {
            let authenticator = authenticator.clone();
            tokio::spawn(async move { authenticator.authenticate().await })
        };

        let (redirect, state) = redirect_target(&urls.recv().await.unwrap());
        assert!(authenticator.is_authenticating());

        // A favicon request is answered but doesn't end the flow
        let favicon = reqwest::get(format!("{redirect}/favicon.ico")).await.unwrap();
        assert!(favicon.text().await.unwrap().contains("Invalid response."));

        let landing = reqwest::get(format!("{redirect}/?code=M.C-code&state={state}"))
            .await
            .unwrap();
        assert!(landing
            .text()
            .await
            .unwrap()
            .contains("You have successfully authenticated."));

        let auth = flow.await.unwrap().unwrap();
        assert_eq!(auth.record.username, "Notch");
        assert_eq!(auth.record.refresh_token.as_deref(), Some("ms-refresh-new"));
        assert!(!authenticator.is_authenticating());
    }

    #[tokio::test]
    async fn test_access_denied_is_cancellation() {
        let server = MockServer::start().await;
        let (options, mut urls) = capturing_options();
        let authenticator = Arc::new(OAuthAuthenticator::new(options, test_config(&server)).unwrap());

        let flow = {
            let authenticator = authenticator.clone();
            tokio::spawn(async move { authenticator.authenticate().await })
        };

        let (redirect, _) = redirect_target(&urls.recv().await.unwrap());
        let landing = reqwest::get(format!(
            "{redirect}/?error=access_denied&error_description=The%20user%20declined"
        ))
        .await
        .unwrap();
        assert!(landing.text().await.unwrap().contains("Authentication failed."));

        assert!(matches!(flow.await.unwrap(), Err(MsAuthError::UserCancelled)));
    }

    #[tokio::test]
    async fn test_state_mismatch_fails() {
        let server = MockServer::start().await;
        let (options, mut urls) = capturing_options();
        let authenticator = Arc::new(OAuthAuthenticator::new(options, test_config(&server)).unwrap());

        let flow = {
            let authenticator = authenticator.clone();
            tokio::spawn(async move { authenticator.authenticate().await })
        };

        let (redirect, _) = redirect_target(&urls.recv().await.unwrap());
        reqwest::get(format!("{redirect}/?code=abc&state=forged")).await.unwrap();

        assert!(matches!(flow.await.unwrap(), Err(MsAuthError::StateMismatch)));
    }

    #[tokio::test]
    async fn test_stop_and_single_flight() {
        let server = MockServer::start().await;
        let (options, mut urls) = capturing_options();
        let authenticator = Arc::new(OAuthAuthenticator::new(options, test_config(&server)).unwrap());

        let flow = {
            let authenticator = authenticator.clone();
            tokio::spawn(async move { authenticator.authenticate().await })
        };
        urls.recv().await.unwrap();

        assert!(matches!(
            authenticator.authenticate().await,
            Err(MsAuthError::AlreadyAuthenticating)
        ));

        authenticator.stop();
        assert!(matches!(flow.await.unwrap(), Err(MsAuthError::UserCancelled)));
        assert!(!authenticator.is_authenticating());
    }

    #[tokio::test]
    async fn test_callback_timeout() {
        let server = MockServer::start().await;
        let options = OAuthOptions::new("test-client", 0)
            .with_browser(BrowserLaunch::Manual)
            .with_callback_timeout(Some(Duration::from_millis(50)));
        let authenticator = OAuthAuthenticator::new(options, test_config(&server)).unwrap();

        assert!(matches!(
            authenticator.authenticate().await,
            Err(MsAuthError::CallbackTimeout)
        ));
    }

    #[tokio::test]
    async fn test_reauthenticate() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server, "refresh_token").await;
        mount_xbox_and_minecraft(&server).await;

        let authenticator =
            OAuthAuthenticator::new(OAuthOptions::default(), test_config(&server)).unwrap();
        let record = AuthenticationRecord {
            username: "Notch".to_string(),
            uuid: uuid::Uuid::nil(),
            access_token: "old".to_string(),
            refresh_token: Some("ms-refresh-old".to_string()),
            expires_at: None,
        };

        let auth = authenticator.reauthenticate(&record).await.unwrap();
        assert_eq!(auth.record.access_token, "mc-access");
        assert_eq!(auth.record.refresh_token.as_deref(), Some("ms-refresh-new"));
    }

    #[tokio::test]
    async fn test_reauthenticate_keeps_unrotated_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth20_token.srf"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "token_type": "bearer",
                "expires_in": 3600,
                "access_token": "ms-access"
            })))
            .mount(&server)
            .await;
        mount_xbox_and_minecraft(&server).await;

        let authenticator =
            OAuthAuthenticator::new(OAuthOptions::default(), test_config(&server)).unwrap();
        let record = AuthenticationRecord {
            username: "Notch".to_string(),
            uuid: uuid::Uuid::nil(),
            access_token: "old".to_string(),
            refresh_token: Some("ms-refresh-old".to_string()),
            expires_at: None,
        };

        let auth = authenticator.reauthenticate(&record).await.unwrap();
        assert_eq!(auth.record.access_token, "mc-access");
        assert_eq!(auth.record.refresh_token.as_deref(), Some("ms-refresh-old"));
    }

    #[tokio::test]
    async fn test_reauthenticate_requires_refresh_token() {
        let authenticator =
            OAuthAuthenticator::new(OAuthOptions::default(), AuthConfig::default()).unwrap();
        let record = AuthenticationRecord {
            username: "Notch".to_string(),
            uuid: uuid::Uuid::nil(),
            access_token: "old".to_string(),
            refresh_token: None,
            expires_at: None,
        };

        assert!(matches!(
            authenticator.reauthenticate(&record).await,
            Err(MsAuthError::MissingRefreshToken)
        ));
    }
}
