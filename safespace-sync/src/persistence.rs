//! Durable client state: the credential and the last-selected tenant hint.

use crate::config::SyncConfig;
use crate::lock;
use safespace_core::{Credential, TenantId, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Where the session layer keeps what must survive a restart.
///
/// The credential is written only by the session store. The tenant hint is
/// advisory: it seeds the first auto-selection of the next session.
pub trait ClientStore: Send + Sync {
    fn load_credential(&self) -> Result<Option<Credential>, PersistenceError>;
    fn save_credential(&self, credential: &Credential) -> Result<(), PersistenceError>;
    fn clear_credential(&self) -> Result<(), PersistenceError>;
    fn load_tenant_hint(&self) -> Result<Option<TenantId>, PersistenceError>;
    fn save_tenant_hint(&self, tenant_id: &TenantId) -> Result<(), PersistenceError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedCredential {
    credential: Credential,
    saved_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedTenantHint {
    tenant_id: TenantId,
    saved_at: Timestamp,
}

/// JSON files on local disk, one per key.
#[derive(Debug, Clone)]
pub struct FileStore {
    credential_path: PathBuf,
    tenant_hint_path: PathBuf,
}

impl FileStore {
    pub fn new(credential_path: impl Into<PathBuf>, tenant_hint_path: impl Into<PathBuf>) -> Self {
        Self {
            credential_path: credential_path.into(),
            tenant_hint_path: tenant_hint_path.into(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(&config.credential_path, &config.tenant_hint_path)
    }

    pub fn credential_path(&self) -> &Path {
        &self.credential_path
    }

    pub fn tenant_hint_path(&self) -> &Path {
        &self.tenant_hint_path
    }
}

impl ClientStore for FileStore {
    fn load_credential(&self) -> Result<Option<Credential>, PersistenceError> {
        let persisted = load_json::<PersistedCredential>(&self.credential_path)?;
        Ok(persisted
            .map(|p| p.credential)
            .filter(|credential| !credential.is_blank()))
    }

    fn save_credential(&self, credential: &Credential) -> Result<(), PersistenceError> {
        save_json(
            &self.credential_path,
            &PersistedCredential {
                credential: credential.clone(),
                saved_at: chrono::Utc::now(),
            },
        )
    }

    fn clear_credential(&self) -> Result<(), PersistenceError> {
        remove_if_exists(&self.credential_path)
    }

    fn load_tenant_hint(&self) -> Result<Option<TenantId>, PersistenceError> {
        let persisted = load_json::<PersistedTenantHint>(&self.tenant_hint_path)?;
        Ok(persisted.map(|p| p.tenant_id))
    }

    fn save_tenant_hint(&self, tenant_id: &TenantId) -> Result<(), PersistenceError> {
        save_json(
            &self.tenant_hint_path,
            &PersistedTenantHint {
                tenant_id: tenant_id.clone(),
                saved_at: chrono::Utc::now(),
            },
        )
    }
}

/// Missing file is `None`. A file that no longer parses is removed and
/// treated as missing, so a bad write never locks the user out.
fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistenceError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)?;
    match serde_json::from_str::<T>(&contents) {
        Ok(value) => Ok(Some(value)),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Discarding corrupt state file");
            remove_if_exists(path)?;
            Ok(None)
        }
    }
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_json::to_string_pretty(value)?;
    std::fs::write(path, contents)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), PersistenceError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// In-process store for tests and embedders that manage persistence themselves.
#[derive(Debug, Default)]
pub struct MemoryStore {
    credential: Mutex<Option<Credential>>,
    tenant_hint: Mutex<Option<TenantId>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            credential: Mutex::new(Some(credential)),
            tenant_hint: Mutex::new(None),
        }
    }

    pub fn with_tenant_hint(self, tenant_id: TenantId) -> Self {
        *lock(&self.tenant_hint) = Some(tenant_id);
        self
    }
}

impl ClientStore for MemoryStore {
    fn load_credential(&self) -> Result<Option<Credential>, PersistenceError> {
        Ok(lock(&self.credential).clone())
    }

    fn save_credential(&self, credential: &Credential) -> Result<(), PersistenceError> {
        *lock(&self.credential) = Some(credential.clone());
        Ok(())
    }

    fn clear_credential(&self) -> Result<(), PersistenceError> {
        *lock(&self.credential) = None;
        Ok(())
    }

    fn load_tenant_hint(&self) -> Result<Option<TenantId>, PersistenceError> {
        Ok(lock(&self.tenant_hint).clone())
    }

    fn save_tenant_hint(&self, tenant_id: &TenantId) -> Result<(), PersistenceError> {
        *lock(&self.tenant_hint) = Some(tenant_id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_store(dir: &tempfile::TempDir) -> FileStore {
        FileStore::new(
            dir.path().join("nested/credential.json"),
            dir.path().join("nested/tenant.json"),
        )
    }

    #[test]
    fn test_credential_roundtrip_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        assert!(store.load_credential().unwrap().is_none());

        store.save_credential(&Credential::new("tok-1")).unwrap();
        assert_eq!(
            store.load_credential().unwrap(),
            Some(Credential::new("tok-1"))
        );

        store.clear_credential().unwrap();
        assert!(store.load_credential().unwrap().is_none());
        // Clearing twice is not an error.
        store.clear_credential().unwrap();
    }

    #[test]
    fn test_corrupt_file_is_treated_as_absent_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        std::fs::create_dir_all(store.credential_path().parent().unwrap()).unwrap();
        std::fs::write(store.credential_path(), "{not json").unwrap();

        assert!(store.load_credential().unwrap().is_none());
        assert!(!store.credential_path().exists());
    }

    #[test]
    fn test_tenant_hint_is_independent_of_credential() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        store.save_credential(&Credential::new("tok")).unwrap();
        store.save_tenant_hint(&TenantId::from("guild-7")).unwrap();
        store.clear_credential().unwrap();
        assert_eq!(
            store.load_tenant_hint().unwrap(),
            Some(TenantId::from("guild-7"))
        );
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::with_credential(Credential::new("abc"))
            .with_tenant_hint(TenantId::from("B"));
        assert_eq!(store.load_credential().unwrap(), Some(Credential::new("abc")));
        assert_eq!(store.load_tenant_hint().unwrap(), Some(TenantId::from("B")));
        store.clear_credential().unwrap();
        assert!(store.load_credential().unwrap().is_none());
    }
}
