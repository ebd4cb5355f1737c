//! Login from an exported browser cookie file, replaying the minecraft.net
//! web login. No Microsoft refresh token comes out of this flow, so the
//! resulting record can't be refreshed.

use std::fmt;

use async_trait::async_trait;
use tracing::{info, instrument};

use crate::authenticator::{Authenticator, FlowState};
use crate::client::AuthClient;
use crate::config::AuthConfig;
use crate::errors::{MsAuthError, Result};
use crate::record::{Authentication, AuthenticationRecord};

/// Turn a Netscape `cookies.txt` export into a `Cookie` header value.
///
/// Lines with fewer than seven tab-separated fields (comments, blanks) are skipped.
pub fn reformat_cookies(netscape: &str) -> String {
    let mut header = String::new();
    for line in netscape.lines() {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 7 {
            continue;
        }
        header.push_str(fields[5].trim());
        header.push('=');
        header.push_str(fields[6].trim());
        header.push_str("; ");
    }
    header
}

/// Authenticates with cookies exported from a browser signed in to
/// login.live.com
pub struct CookieAuthenticator {
    cookies: String,
    client: AuthClient,
    flow: FlowState,
}

impl CookieAuthenticator {
    /// `cookie_file` is the contents of a Netscape-format cookie export
    pub fn new(cookie_file: &str, config: AuthConfig) -> Result<Self> {
        Ok(Self {
            cookies: reformat_cookies(cookie_file),
            client: AuthClient::new(config)?,
            flow: FlowState::new(),
        })
    }

    async fn login(&self) -> Result<Authentication> {
        if self.cookies.is_empty() {
            return Err(MsAuthError::CookieLogin("No cookies found in the cookie file".to_string()));
        }

        let xsts = self.client.xsts_from_cookies(&self.cookies).await?;
        let (record, profile) = self
            .client
            .login_with_identity(&xsts.identity_token(), None)
            .await?;

        Ok(Authentication {
            record,
            profile,
            xuid: None,
            gamertag: None,
        })
    }
}

impl fmt::Debug for CookieAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieAuthenticator")
            .field("cookies", &"[REDACTED]")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Authenticator for CookieAuthenticator {
    #[instrument(skip(self))]
    async fn authenticate(&self) -> Result<Authentication> {
        let mut flow = self.flow.begin()?;
        let auth = flow.run(self.login()).await?;
        info!(username = %auth.record.username, "Authenticated from cookies");
        Ok(auth)
    }

    async fn reauthenticate(&self, _record: &AuthenticationRecord) -> Result<Authentication> {
        Err(MsAuthError::Unsupported(
            "Cookie logins can't be refreshed; authenticate again with a fresh cookie file".to_string(),
        ))
    }

    fn stop(&self) {
        self.flow.stop();
    }

    fn is_authenticating(&self) -> bool {
        self.flow.is_running()
    }
}
