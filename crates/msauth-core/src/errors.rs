use thiserror::Error;

/// Errors raised anywhere along the Microsoft -> Xbox Live -> Minecraft chain
#[derive(Error, Debug)]
pub enum MsAuthError {
    #[error("User cancelled the authentication flow")]
    UserCancelled,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP error {status}: {body_snippet}")]
    Http {
        status: reqwest::StatusCode,
        body_snippet: String,
    },

    #[error("OAuth invalid_grant - refresh token may be expired or revoked")]
    OAuthInvalidGrant,

    #[error("Xbox Live authentication failed after retry")]
    XblBadRequest,

    #[error("XSTS authorization denied: {0}")]
    XstsDenied(#[from] XstsError),

    #[error("Minecraft profile not found - user may not own Minecraft or hasn't created a profile")]
    MinecraftProfileNotFound,

    #[error("Account does not own Minecraft: Java Edition")]
    GameNotOwned,

    #[error("Invalid redirect: {0}")]
    InvalidRedirect(String),

    #[error("OAuth state mismatch - possible CSRF attack")]
    StateMismatch,

    #[error("Timed out waiting for the browser to return to the redirect listener")]
    CallbackTimeout,

    #[error("An authentication is already in progress on this authenticator")]
    AlreadyAuthenticating,

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Missing refresh token - cannot re-authenticate")]
    MissingRefreshToken,

    #[error("Could not extract credentials from cookie login: {0}")]
    CookieLogin(String),

    #[error("Failed to launch browser: {0}")]
    Browser(String),

    #[error("JSON serialization/deserialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Cryptographic failure: {0}")]
    Crypto(String),

    #[error("Stored record is corrupted or was encrypted with a different key")]
    CorruptedStore,

    #[error("The record key doesn't match this store - wrong passphrase?")]
    KeyMismatch,

    #[error("Timed out waiting for the record store lock")]
    LockTimeout,

    #[error("Keyring error: {0}")]
    Keyring(String),
}

/// XSTS-specific error codes from the `XErr` field
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XstsError {
    #[error("Account is banned from Xbox Live (XErr: 2148916227)")]
    Banned,

    #[error("Account doesn't have an Xbox account (XErr: 2148916233)")]
    NoXboxAccount,

    #[error("Xbox Live not available in this country (XErr: 2148916235)")]
    RegionNotSupported,

    #[error("Adult verification required on Xbox page (XErr: 2148916236/2148916237)")]
    AdultVerificationRequired,

    #[error("Child account requires Family (XErr: 2148916238)")]
    ChildAccountRequiresFamily,

    #[error("Unknown XSTS error code: {0}")]
    Unknown(u64),
}

impl XstsError {
    /// Map an `XErr` code from an XSTS 401 response
    pub fn from_xerr(code: u64) -> Self {
        match code {
            2148916227 => Self::Banned,
            2148916233 => Self::NoXboxAccount,
            2148916235 => Self::RegionNotSupported,
            2148916236 | 2148916237 => Self::AdultVerificationRequired,
            2148916238 => Self::ChildAccountRequiresFamily,
            code => Self::Unknown(code),
        }
    }
}

pub type Result<T> = std::result::Result<T, MsAuthError>;
