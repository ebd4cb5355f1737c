//! Microsoft account authentication for Minecraft: Java Edition
//!
//! The login is a chain of token exchanges:
//!
//! 1. Microsoft OAuth2 (authorization code, or a refresh token)
//! 2. Xbox Live user authentication
//! 3. XSTS authorization for Minecraft Services
//! 4. Minecraft Services login
//! 5. Minecraft profile (and optionally an ownership check)
//!
//! Two [`Authenticator`]s drive it: [`OAuthAuthenticator`] opens the
//! Microsoft sign-in page and catches the redirect on a local listener, and
//! [`CookieAuthenticator`] replays the minecraft.net web login with cookies
//! exported from a signed-in browser.
//!
//! # Example
//!
//! ```no_run
//! use msauth_core::{AuthConfig, Authenticator, OAuthAuthenticator, OAuthOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let authenticator = OAuthAuthenticator::new(OAuthOptions::default(), AuthConfig::default())?;
//!
//!     // Opens the browser and waits for the redirect to http://localhost:59125
//!     let auth = authenticator.authenticate().await?;
//!     println!("Logged in as {}", auth.record.username);
//!
//!     // Later, without the browser
//!     if auth.record.needs_refresh() {
//!         let _refreshed = authenticator.reauthenticate(&auth.record).await?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Keeping records
//!
//! [`RecordStore`] persists [`AuthenticationRecord`]s by account UUID.
//!
//! ```
//! use msauth_core::{AuthenticationRecord, MemoryRecordStore, RecordStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = MemoryRecordStore::new();
//! let record = AuthenticationRecord {
//!     username: "Notch".to_string(),
//!     uuid: "069a79f4-44e9-4726-a5be-fca90e38aaf5".parse()?,
//!     access_token: "token".to_string(),
//!     refresh_token: None,
//!     expires_at: None,
//! };
//!
//! store.save(&record).await?;
//! let loaded = store.load(&record.account_key()).await;
//! assert_eq!(loaded.map(|r| r.username).as_deref(), Some("Notch"));
//! # Ok(())
//! # }
//! # tokio_test::block_on(example()).unwrap();
//! ```
//!
//! [`FileRecordStore`] keeps them on disk, sealed with AES-256-GCM under a key
//! held in the OS keyring or derived from a passphrase.
//!
//! ```no_run
//! use std::sync::Arc;
//! use msauth_core::{EnvSecretProvider, FileRecordStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = FileRecordStore::open(FileRecordStore::default_dir()?, Arc::new(EnvSecretProvider::default())).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Tokens are never logged and are redacted from `Debug` output. The
//! Minecraft access token lasts about a day; the Microsoft refresh token in
//! the record is what [`Authenticator::reauthenticate`] uses to get a new one.

pub mod authenticator;
pub mod browser;
pub mod client;
pub mod config;
pub mod cookie;
pub mod crypto;
pub mod errors;
pub mod file_store;
pub mod key_manager;
pub mod models;
pub mod oauth;
pub mod record;
pub mod secret;
pub mod server;
pub mod store;

pub use authenticator::Authenticator;
pub use browser::{Browser, BrowserLaunch, BrowserOpener};
pub use client::AuthClient;
pub use config::{AuthConfig, Endpoints, HttpTimeouts, OAuthOptions, RetryPolicy};
pub use cookie::{CookieAuthenticator, reformat_cookies};
pub use errors::{MsAuthError, Result, XstsError};
pub use file_store::FileRecordStore;
pub use key_manager::{KdfParams, KeyOptions};
pub use models::{MinecraftCape, MinecraftProfile, MinecraftSkin};
pub use oauth::OAuthAuthenticator;
pub use record::{Authentication, AuthenticationRecord};
pub use secret::{EnvSecretProvider, NoSecretProvider, SecretProvider, StaticSecretProvider};
pub use server::{PageRenderer, ResponseState, SimplePage};
pub use store::{MemoryRecordStore, RecordStore};
