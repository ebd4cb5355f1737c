mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use msauth_core::{
    Authentication, AuthenticationRecord, Authenticator, CookieAuthenticator, EnvSecretProvider,
    FileRecordStore, OAuthAuthenticator, RecordStore,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::settings::Settings;

/// Log in to Minecraft: Java Edition with a Microsoft account
#[derive(Parser, Debug)]
#[command(name = "msauth", author, version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print the Minecraft access token after logging in
    #[arg(long, global = true)]
    show_token: bool,

    /// Azure application (client) ID
    #[arg(long, global = true)]
    client_id: Option<String>,

    /// Port for the local redirect listener
    #[arg(long, global = true)]
    port: Option<u16>,

    /// chrome, edge, firefox, or manual to only print the sign-in URL
    #[arg(long, global = true)]
    browser: Option<String>,

    /// Open the browser in a private window
    #[arg(long, global = true)]
    incognito: bool,

    /// Fail unless the account owns Minecraft
    #[arg(long, global = true)]
    verify_ownership: bool,

    /// Where encrypted account records are kept
    #[arg(long, global = true, env = "MSAUTH_STORE_DIR")]
    store_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in through the browser
    Login,
    /// Get a new access token for a stored account without the browser
    Refresh {
        /// UUID or username
        account: String,
    },
    /// Sign in with a Netscape-format cookie export from a signed-in browser
    Cookies { file: PathBuf },
    /// List stored accounts
    Accounts,
    /// Forget a stored account
    Logout {
        /// UUID or username
        account: String,
    },
    /// Show the effective settings
    Config {
        /// Write them, flags included, to settings.toml
        #[arg(long)]
        save: bool,
    },
}

impl Args {
    /// Flags take precedence over `settings.toml`
    fn apply(&self, mut settings: Settings) -> Settings {
        if let Some(client_id) = &self.client_id {
            settings.client_id = Some(client_id.clone());
        }
        if let Some(port) = self.port {
            settings.port = Some(port);
        }
        if let Some(browser) = &self.browser {
            settings.browser = Some(browser.clone());
        }
        if let Some(dir) = &self.store_dir {
            settings.store_dir = Some(dir.clone());
        }
        settings.incognito |= self.incognito;
        settings.verify_ownership |= self.verify_ownership;
        settings
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with_writer(std::io::stderr)
        .init();

    let settings = args.apply(Settings::load().await?);
    debug!(?settings, "Loaded settings");

    match args.command {
        Command::Login => {
            let store = open_store(&settings).await?;
            let authenticator = Arc::new(OAuthAuthenticator::new(
                settings.oauth_options()?,
                settings.auth_config(),
            )?);
            info!("Waiting for the sign-in redirect on {}", authenticator.redirect_url());
            let auth = run_until_interrupted(authenticator)
                .await
                .context("Login failed")?;
            finish(&store, auth, args.show_token).await?;
        }
        Command::Refresh { account } => {
            let store = open_store(&settings).await?;
            let record = find_account(&store, &account).await?;
            if !record.can_reauthenticate() {
                bail!("{} has no refresh token; log in again", record.username);
            }

            let authenticator = OAuthAuthenticator::new(settings.oauth_options()?, settings.auth_config())?;
            let auth = authenticator
                .reauthenticate(&record)
                .await
                .with_context(|| format!("Failed to refresh {}", record.username))?;
            finish(&store, auth, args.show_token).await?;
        }
        Command::Cookies { file } => {
            let store = open_store(&settings).await?;
            let cookies = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let authenticator = CookieAuthenticator::new(&cookies, settings.auth_config())?;
            let auth = authenticator.authenticate().await.context("Cookie login failed")?;
            finish(&store, auth, args.show_token).await?;
        }
        Command::Accounts => {
            let records = open_store(&settings).await?.load_all().await;
            if records.is_empty() {
                println!("No stored accounts");
            }
            for record in records {
                let status = if record.needs_refresh() { "expired" } else { "valid" };
                let refresh = if record.can_reauthenticate() { "" } else { ", no refresh token" };
                println!("{}  {}  ({}{})", record.uuid, record.username, status, refresh);
            }
        }
        Command::Logout { account } => {
            let store = open_store(&settings).await?;
            let record = find_account(&store, &account).await?;
            store
                .remove(&record.account_key())
                .await
                .context("Failed to remove the account")?;
            println!("Removed {} ({})", record.username, record.uuid);
        }
        Command::Config { save } => {
            let path = settings::settings_path()?;
            if save {
                settings.save_to(&path).await?;
                println!("Saved {}", path.display());
            } else {
                println!("# {}", path.display());
            }
            print!("{}", toml::to_string_pretty(&settings).context("Failed to serialize settings")?);
        }
    }

    Ok(())
}

/// Ctrl-C stops the flow so the redirect listener is released
async fn run_until_interrupted(authenticator: Arc<OAuthAuthenticator>) -> msauth_core::Result<Authentication> {
    let stopper = {
        let authenticator = authenticator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                authenticator.stop();
            }
        })
    };

    let result = authenticator.authenticate().await;
    stopper.abort();
    result
}

async fn open_store(settings: &Settings) -> anyhow::Result<FileRecordStore> {
    let store_dir = match &settings.store_dir {
        Some(dir) => dir.clone(),
        None => FileRecordStore::default_dir().context("Failed to locate the account store")?,
    };
    FileRecordStore::open(&store_dir, Arc::new(EnvSecretProvider::default()))
        .await
        .with_context(|| {
            format!(
                "Failed to open the account store at {} (without an OS keyring, set {})",
                store_dir.display(),
                msauth_core::secret::PASSPHRASE_ENV
            )
        })
}

async fn finish(store: &FileRecordStore, auth: Authentication, show_token: bool) -> anyhow::Result<()> {
    store
        .save(&auth.record)
        .await
        .context("Failed to save the account")?;

    println!("Logged in as {} ({})", auth.record.username, auth.record.uuid);
    if let Some(gamertag) = &auth.gamertag {
        println!("Xbox gamertag: {gamertag}");
    }
    if let Some(expires_at) = auth.record.expires_at {
        println!("Access token expires at {expires_at}");
    }
    if show_token {
        println!("{}", auth.record.access_token);
    }
    Ok(())
}

async fn find_account(store: &FileRecordStore, selector: &str) -> anyhow::Result<AuthenticationRecord> {
    let records = store.load_all().await;
    match select_record(&records, selector) {
        Some(record) => Ok(record.clone()),
        None => bail!("No stored account matches {selector}"),
    }
}

/// Match by UUID (hyphenated or not) or by username, ignoring case
fn select_record<'a>(records: &'a [AuthenticationRecord], selector: &str) -> Option<&'a AuthenticationRecord> {
    if let Ok(uuid) = selector.parse::<uuid::Uuid>()
        && let Some(record) = records.iter().find(|r| r.uuid == uuid)
    {
        return Some(record);
    }
    records.iter().find(|r| r.username.eq_ignore_ascii_case(selector))
}
