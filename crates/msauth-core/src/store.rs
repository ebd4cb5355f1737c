use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::errors::{MsAuthError, Result};
use crate::record::AuthenticationRecord;

/// Persistence for [`AuthenticationRecord`]s, keyed by
/// [`AuthenticationRecord::account_key`]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// `None` when the account is unknown or its record can't be read
    async fn load(&self, account_key: &str) -> Option<AuthenticationRecord>;

    async fn save(&self, record: &AuthenticationRecord) -> Result<()>;

    async fn remove(&self, account_key: &str) -> Result<()>;

    async fn list_accounts(&self) -> Vec<String>;

    /// Every readable record
    async fn load_all(&self) -> Vec<AuthenticationRecord> {
        let mut records = Vec::new();
        for key in self.list_accounts().await {
            if let Some(record) = self.load(&key).await {
                records.push(record);
            }
        }
        records
    }
}

/// Process-local store
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    records: Arc<RwLock<HashMap<String, AuthenticationRecord>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> MsAuthError {
    MsAuthError::InvalidResponse("Record store lock poisoned".to_string())
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn load(&self, account_key: &str) -> Option<AuthenticationRecord> {
        self.records.read().ok()?.get(account_key).cloned()
    }

    async fn save(&self, record: &AuthenticationRecord) -> Result<()> {
        self.records
            .write()
            .map_err(poisoned)?
            .insert(record.account_key(), record.clone());
        Ok(())
    }

    async fn remove(&self, account_key: &str) -> Result<()> {
        self.records.write().map_err(poisoned)?.remove(account_key);
        Ok(())
    }

    async fn list_accounts(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .records
            .read()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use uuid::Uuid;

    use super::*;

    pub(crate) fn record(name: &str, uuid: &str) -> AuthenticationRecord {
        AuthenticationRecord {
            username: name.to_string(),
            uuid: Uuid::parse_str(uuid).unwrap(),
            access_token: format!("{name}-access"),
            refresh_token: Some(format!("{name}-refresh")),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryRecordStore::new();
        let notch = record("Notch", "069a79f444e94726a5befca90e38aaf5");
        let jeb = record("jeb_", "853c80ef3c3749fdaa49938b674adae6");

        store.save(&notch).await.unwrap();
        store.save(&jeb).await.unwrap();

        assert_eq!(store.load(&notch.account_key()).await, Some(notch.clone()));
        assert_eq!(
            store.list_accounts().await,
            vec![notch.account_key(), jeb.account_key()]
        );
        assert_eq!(store.load_all().await.len(), 2);

        store.remove(&notch.account_key()).await.unwrap();
        assert!(store.load(&notch.account_key()).await.is_none());
        assert_eq!(store.list_accounts().await, vec![jeb.account_key()]);
    }
}
