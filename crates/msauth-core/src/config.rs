use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::browser::BrowserLaunch;
use crate::server::{PageRenderer, SimplePage};

/// Production endpoints
pub mod endpoints {
    pub const MS_AUTHORIZE: &str = "https://login.live.com/oauth20_authorize.srf";
    pub const MS_TOKEN: &str = "https://login.live.com/oauth20_token.srf";
    pub const XBL_AUTHENTICATE: &str = "https://user.auth.xboxlive.com/user/authenticate";
    pub const XSTS_AUTHORIZE: &str = "https://xsts.auth.xboxlive.com/xsts/authorize";
    pub const XBOX_PROFILE: &str = "https://profile.xboxlive.com/users/me/profile/settings";
    pub const MC_LOGIN: &str = "https://api.minecraftservices.com/authentication/login_with_xbox";
    pub const MC_PROFILE: &str = "https://api.minecraftservices.com/minecraft/profile";
    pub const MC_ENTITLEMENTS: &str = "https://api.minecraftservices.com/entitlements/mcstore";
    pub const SISU_CONNECT: &str = "https://sisu.xboxlive.com/connect/XboxLive/";
}

/// Client ID used when the caller doesn't register their own Azure app
pub const DEFAULT_CLIENT_ID: &str = "54fd49e4-2103-4044-9603-2b028c814ec3";

/// Default port for the local redirect listener
pub const DEFAULT_PORT: u16 = 59125;

/// Scope requested for both the code and refresh grants
pub const OAUTH_SCOPE: &str = "XboxLive.signin XboxLive.offline_access";

/// Relying parties
pub const RP_XBL: &str = "http://auth.xboxlive.com";
pub const RP_MINECRAFT: &str = "rp://api.minecraftservices.com/";
pub const RP_XBOXLIVE: &str = "http://xboxlive.com";

/// Profile settings requested when checking out the Xbox profile
pub const XBOX_PROFILE_SETTINGS: &str = "GameDisplayName,AppDisplayName,AppDisplayPicRaw,GameDisplayPicRaw,\
PublicGamerpic,ShowUserAsAvatar,Gamerscore,Gamertag,ModernGamertag,ModernGamertagSuffix,UniqueModernGamertag,\
AccountTier,TenureLevel,XboxOneRep,PreferredColor,Location,Bio,Watermarks,RealName,RealNameOverride,IsQuarantined";

/// Query the minecraft.net login page uses to start a SISU session
pub const SISU_QUERY: &[(&str, &str)] = &[
    ("state", "login"),
    ("cobrandId", "8058f65d-ce06-4c30-9559-473c9275a65d"),
    ("tid", "896928775"),
    ("ru", "https://www.minecraft.net/en-us/login"),
    ("aid", "1142970254"),
    ("as", "1"),
];

/// Time skew for token expiration (refresh 5 minutes early)
pub const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(300);

/// Endpoint set used by [`crate::AuthClient`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub ms_authorize: String,
    pub ms_token: String,
    pub xbl_authenticate: String,
    pub xsts_authorize: String,
    pub xbox_profile: String,
    pub mc_login: String,
    pub mc_profile: String,
    pub mc_entitlements: String,
    pub sisu_connect: String,
}

impl Endpoints {
    /// Root every endpoint under a single base URL, keeping the production paths.
    /// Mostly useful to point the client at a mock server.
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            ms_authorize: format!("{base}/oauth20_authorize.srf"),
            ms_token: format!("{base}/oauth20_token.srf"),
            xbl_authenticate: format!("{base}/user/authenticate"),
            xsts_authorize: format!("{base}/xsts/authorize"),
            xbox_profile: format!("{base}/users/me/profile/settings"),
            mc_login: format!("{base}/authentication/login_with_xbox"),
            mc_profile: format!("{base}/minecraft/profile"),
            mc_entitlements: format!("{base}/entitlements/mcstore"),
            sisu_connect: format!("{base}/connect/XboxLive/"),
        }
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            ms_authorize: endpoints::MS_AUTHORIZE.to_string(),
            ms_token: endpoints::MS_TOKEN.to_string(),
            xbl_authenticate: endpoints::XBL_AUTHENTICATE.to_string(),
            xsts_authorize: endpoints::XSTS_AUTHORIZE.to_string(),
            xbox_profile: endpoints::XBOX_PROFILE.to_string(),
            mc_login: endpoints::MC_LOGIN.to_string(),
            mc_profile: endpoints::MC_PROFILE.to_string(),
            mc_entitlements: endpoints::MC_ENTITLEMENTS.to_string(),
            sisu_connect: endpoints::SISU_CONNECT.to_string(),
        }
    }
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpTimeouts {
    pub connect: Duration,
    pub request: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            request: Duration::from_secs(30),
        }
    }
}

/// Retry policy for transient failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based), doubling each time
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// Configuration for [`crate::AuthClient`]
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub endpoints: Endpoints,

    /// HTTP client timeouts
    pub http_timeouts: HttpTimeouts,

    /// Custom user agent (optional)
    pub user_agent: Option<String>,

    pub retry: RetryPolicy,

    /// Fail with `GameNotOwned` when the entitlements don't include Minecraft
    pub verify_ownership: bool,
}

impl AuthConfig {
    /// Point every endpoint at `base` (see [`Endpoints::with_base`])
    pub fn with_base_url(base: &str) -> Self {
        Self {
            endpoints: Endpoints::with_base(base),
            ..Self::default()
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            endpoints: Endpoints::default(),
            http_timeouts: HttpTimeouts::default(),
            user_agent: Some(concat!("msauth/", env!("CARGO_PKG_VERSION")).to_string()),
            retry: RetryPolicy::default(),
            verify_ownership: false,
        }
    }
}

/// Options for the browser-based OAuth2 flow
#[derive(Clone)]
pub struct OAuthOptions {
    /// Azure application (client) ID
    pub client_id: String,

    /// Port the redirect listener binds on `localhost`
    pub port: u16,

    /// Renders the page the browser lands on after the redirect
    pub page: Arc<dyn PageRenderer>,

    pub browser: BrowserLaunch,

    /// Give up waiting for the redirect after this long; `None` waits forever
    pub callback_timeout: Option<Duration>,
}

impl OAuthOptions {
    pub fn new(client_id: impl Into<String>, port: u16) -> Self {
        Self {
            client_id: client_id.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_browser(mut self, browser: BrowserLaunch) -> Self {
        self.browser = browser;
        self
    }

    pub fn with_page(mut self, page: Arc<dyn PageRenderer>) -> Self {
        self.page = page;
        self
    }

    pub fn with_callback_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.callback_timeout = timeout;
        self
    }

    /// Redirect URI registered for the given listener port
    pub fn redirect_url(port: u16) -> String {
        format!("http://localhost:{port}")
    }
}

impl Default for OAuthOptions {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            port: DEFAULT_PORT,
            page: Arc::new(SimplePage),
            browser: BrowserLaunch::Default,
            callback_timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl fmt::Debug for OAuthOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthOptions")
            .field("client_id", &self.client_id)
            .field("port", &self.port)
            .field("browser", &self.browser)
            .field("callback_timeout", &self.callback_timeout)
            .finish_non_exhaustive()
    }
}
