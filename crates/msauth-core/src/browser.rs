//! Opening the sign-in page in a browser.

use std::fmt;
use std::process::Command;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, info};

use crate::errors::{MsAuthError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Os {
    Windows,
    Mac,
    Linux,
    Other,
}

impl Os {
    fn current() -> Self {
        if cfg!(target_os = "windows") {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::Mac
        } else if cfg!(target_os = "linux") {
            Self::Linux
        } else {
            Self::Other
        }
    }
}

/// Open `url` in the system default browser
pub fn open(url: &str) -> Result<()> {
    debug!("Opening default browser");
    let mut command = match Os::current() {
        Os::Windows => {
            let mut c = Command::new("cmd");
            c.args(["/C", "start", ""]).arg(escape_for_cmd(url));
            c
        }
        Os::Mac => {
            let mut c = Command::new("open");
            c.arg(url);
            c
        }
        Os::Linux | Os::Other => {
            let mut c = Command::new("xdg-open");
            c.arg(url);
            c
        }
    };
    spawn(&mut command)
}

/// A specific browser, launched by its executable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Browser {
    Chrome,
    Edge,
    Firefox,
}

impl Browser {
    /// Open `url`, optionally in a private window. Edge is Windows-only.
    pub fn open(self, url: &str, incognito: bool) -> Result<()> {
        debug!(browser = %self, incognito, "Opening browser");
        let mut command = self.command(Os::current(), url, incognito)?;
        spawn(&mut command)
    }

    fn command(self, os: Os, url: &str, incognito: bool) -> Result<Command> {
        let command = match os {
            Os::Windows => {
                let exe = match self {
                    Self::Chrome => "chrome.exe",
                    Self::Edge => "msedge.exe",
                    Self::Firefox => "firefox.exe",
                };
                let mut c = Command::new("cmd");
                c.args(["/C", "start", "", exe]);
                if incognito {
                    c.arg(match self {
                        Self::Chrome => "--incognito",
                        Self::Edge => "-inprivate",
                        Self::Firefox => "-private-window",
                    });
                }
                c.arg(escape_for_cmd(url));
                c
            }
            Os::Mac if self != Self::Edge => {
                let app = match self {
                    Self::Firefox => "Firefox",
                    _ => "Google Chrome",
                };
                let mut c = Command::new("open");
                c.args(["-a", app]);
                if incognito {
                    c.arg("--args").arg(match self {
                        Self::Firefox => "-private-window",
                        _ => "--incognito",
                    });
                }
                c.arg(url);
                c
            }
            Os::Linux if self != Self::Edge => {
                let (exe, flag) = match self {
                    Self::Firefox => ("firefox", "--private-window"),
                    _ => ("google-chrome", "--incognito"),
                };
                let mut c = Command::new(exe);
                if incognito {
                    c.arg(flag);
                }
                c.arg(url);
                c
            }
            _ => {
                return Err(MsAuthError::Browser(format!(
                    "{self} is not supported on {os:?}"
                )));
            }
        };
        Ok(command)
    }
}

impl fmt::Display for Browser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Chrome => "chrome",
            Self::Edge => "edge",
            Self::Firefox => "firefox",
        })
    }
}

impl FromStr for Browser {
    type Err = MsAuthError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "chrome" => Ok(Self::Chrome),
            "edge" | "msedge" => Ok(Self::Edge),
            "firefox" => Ok(Self::Firefox),
            other => Err(MsAuthError::Browser(format!("Unknown browser: {other}"))),
        }
    }
}

/// Anything that can present a URL to the user
pub trait BrowserOpener: Send + Sync {
    fn open(&self, url: &str) -> Result<()>;
}

impl<F> BrowserOpener for F
where
    F: Fn(&str) -> Result<()> + Send + Sync,
{
    fn open(&self, url: &str) -> Result<()> {
        self(url)
    }
}

/// How the OAuth flow shows the sign-in page to the user
#[derive(Clone, Default)]
pub enum BrowserLaunch {
    /// System default browser
    #[default]
    Default,
    Specific {
        browser: Browser,
        incognito: bool,
    },
    Custom(Arc<dyn BrowserOpener>),
    /// Don't launch anything; the URL is only logged
    Manual,
}

impl BrowserLaunch {
    pub fn custom(opener: impl BrowserOpener + 'static) -> Self {
        Self::Custom(Arc::new(opener))
    }

    pub fn launch(&self, url: &str) -> Result<()> {
        match self {
            Self::Default => open(url),
            Self::Specific { browser, incognito } => browser.open(url, *incognito),
            Self::Custom(opener) => opener.open(url),
            Self::Manual => {
                info!("Open this URL to sign in: {}", url);
                Ok(())
            }
        }
    }
}

impl fmt::Debug for BrowserLaunch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("Default"),
            Self::Specific { browser, incognito } => f
                .debug_struct("Specific")
                .field("browser", browser)
                .field("incognito", incognito)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
            Self::Manual => f.write_str("Manual"),
        }
    }
}

fn spawn(command: &mut Command) -> Result<()> {
    command
        .spawn()
        .map(|_| ())
        .map_err(|e| MsAuthError::Browser(format!("Failed to launch {:?}: {}", command.get_program(), e)))
}

/// `&` separates commands in `cmd /C`
fn escape_for_cmd(url: &str) -> String {
    url.replace('&', "^&")
}
