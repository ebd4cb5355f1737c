use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use directories::ProjectDirs;
use msauth_core::{AuthConfig, Browser, BrowserLaunch, OAuthOptions};
use serde::{Deserialize, Serialize};

const SETTINGS_FILE: &str = "settings.toml";

/// `settings.toml`; every field is optional and command-line flags win
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// `chrome`, `edge`, `firefox`, `manual` or unset for the system default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    pub incognito: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_timeout_secs: Option<u64>,
    pub verify_ownership: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_dir: Option<PathBuf>,
}

impl Settings {
    /// Load from the platform config directory; a missing file means defaults
    pub async fn load() -> anyhow::Result<Self> {
        Self::load_from(&settings_path()?).await
    }

    pub async fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };

        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub async fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create settings directory")?;
        }

        let toml = toml::to_string_pretty(self).context("Failed to serialize settings to TOML")?;
        tokio::fs::write(path, toml)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        Ok(())
    }

    pub fn browser_launch(&self) -> anyhow::Result<BrowserLaunch> {
        match self.browser.as_deref() {
            None | Some("default") => Ok(BrowserLaunch::Default),
            Some("manual") => Ok(BrowserLaunch::Manual),
            Some(name) => {
                let browser: Browser = name.parse()?;
                Ok(BrowserLaunch::Specific {
                    browser,
                    incognito: self.incognito,
                })
            }
        }
    }

    pub fn oauth_options(&self) -> anyhow::Result<OAuthOptions> {
        let mut options = OAuthOptions::default().with_browser(self.browser_launch()?);
        if let Some(client_id) = &self.client_id {
            options.client_id = client_id.clone();
        }
        if let Some(port) = self.port {
            options.port = port;
        }
        if let Some(secs) = self.callback_timeout_secs {
            // 0 waits forever
            options.callback_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        Ok(options)
    }

    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            verify_ownership: self.verify_ownership,
            ..AuthConfig::default()
        }
    }
}

pub fn settings_path() -> anyhow::Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("", "", "msauth").context("Failed to get project directories")?;
    Ok(proj_dirs.config_dir().join(SETTINGS_FILE))
}
