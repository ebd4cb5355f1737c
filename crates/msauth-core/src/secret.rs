use async_trait::async_trait;
use zeroize::Zeroizing;

/// Environment variable [`EnvSecretProvider::default`] reads
pub const PASSPHRASE_ENV: &str = "MSAUTH_PASSPHRASE";

/// Supplies the passphrase the record key is derived from when the OS
/// keyring can't hold it
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// `None` means no passphrase is available
    async fn passphrase(&self, prompt: &str) -> Option<Zeroizing<String>>;
}

/// Keyring only; passphrase fallback always fails
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSecretProvider;

#[async_trait]
impl SecretProvider for NoSecretProvider {
    async fn passphrase(&self, _prompt: &str) -> Option<Zeroizing<String>> {
        None
    }
}

/// Fixed passphrase, mostly for tests
#[derive(Clone)]
pub struct StaticSecretProvider {
    secret: Zeroizing<String>,
}

impl StaticSecretProvider {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Zeroizing::new(secret.into()),
        }
    }
}

impl std::fmt::Debug for StaticSecretProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticSecretProvider([REDACTED])")
    }
}

#[async_trait]
impl SecretProvider for StaticSecretProvider {
    async fn passphrase(&self, _prompt: &str) -> Option<Zeroizing<String>> {
        Some(self.secret.clone())
    }
}

/// Reads the passphrase from an environment variable; empty counts as unset
#[derive(Debug, Clone)]
pub struct EnvSecretProvider {
    var: String,
}

impl EnvSecretProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvSecretProvider {
    fn default() -> Self {
        Self::new(PASSPHRASE_ENV)
    }
}

#[async_trait]
impl SecretProvider for EnvSecretProvider {
    async fn passphrase(&self, _prompt: &str) -> Option<Zeroizing<String>> {
        std::env::var(&self.var)
            .ok()
            .filter(|v| !v.is_empty())
            .map(Zeroizing::new)
    }
}
