use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use keyring::{Entry, Error as KeyringError};

/// Service name all mcpc keychain records live under.
pub const KEYCHAIN_SERVICE: &str = "mcpc";

/// Fully qualified key for a stored secret. The username encodes everything
/// needed to find the record again: profiles are keyed by
/// `(serverUrl, profileName)`, session header maps by session name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecretKey {
    username: String,
}

impl SecretKey {
    pub fn profile_client(server_url: &str, profile_name: &str) -> Self {
        Self { username: format!("profile:{server_url}:{profile_name}:client") }
    }

    pub fn profile_tokens(server_url: &str, profile_name: &str) -> Self {
        Self { username: format!("profile:{server_url}:{profile_name}:tokens") }
    }

    pub fn session_headers(session_name: &str) -> Self {
        Self { username: format!("session:{session_name}:headers") }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

#[derive(Debug)]
pub enum SecretStoreError {
    Backend(String),
}

impl fmt::Display for SecretStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretStoreError::Backend(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for SecretStoreError {}

impl From<SecretStoreError> for crate::Error {
    fn from(err: SecretStoreError) -> Self {
        crate::Error::client(format!("keychain: {err}"))
    }
}

pub trait SecretStore: Send + Sync {
    fn set(&self, key: &SecretKey, value: &str) -> Result<(), SecretStoreError>;
    fn get(&self, key: &SecretKey) -> Result<Option<String>, SecretStoreError>;
    fn delete(&self, key: &SecretKey) -> Result<(), SecretStoreError>;
}

/// Production secret store backed by the operating system keychain.
#[derive(Clone)]
pub struct KeyringSecretStore {
    service: String,
}

impl KeyringSecretStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self { service: service.into() }
    }

    fn entry(&self, username: &str) -> Result<Entry, SecretStoreError> {
        Entry::new(&self.service, username).map_err(|err| {
            SecretStoreError::Backend(format!(
                "keyring entry for service `{}` and user `{}`: {err}",
                self.service, username
            ))
        })
    }
}

impl Default for KeyringSecretStore {
    fn default() -> Self {
        Self::new(KEYCHAIN_SERVICE)
    }
}

impl SecretStore for KeyringSecretStore {
    fn set(&self, key: &SecretKey, value: &str) -> Result<(), SecretStoreError> {
        let entry = self.entry(key.username())?;
        entry
            .set_password(value)
            .map_err(|err| SecretStoreError::Backend(err.to_string()))
    }

    fn get(&self, key: &SecretKey) -> Result<Option<String>, SecretStoreError> {
        let entry = self.entry(key.username())?;
        match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(KeyringError::NoEntry) => Ok(None),
            Err(err) => Err(SecretStoreError::Backend(err.to_string())),
        }
    }

    fn delete(&self, key: &SecretKey) -> Result<(), SecretStoreError> {
        let entry = self.entry(key.username())?;
        match entry.delete_credential() {
            Ok(()) | Err(KeyringError::NoEntry) => Ok(()),
            Err(err) => Err(SecretStoreError::Backend(err.to_string())),
        }
    }
}

/// In-memory store so tests never touch the real OS keychain.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.secrets.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SecretStore for MemorySecretStore {
    fn set(&self, key: &SecretKey, value: &str) -> Result<(), SecretStoreError> {
        let mut guard = self.secrets.lock().unwrap();
        guard.insert(key.username().to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &SecretKey) -> Result<Option<String>, SecretStoreError> {
        let guard = self.secrets.lock().unwrap();
        Ok(guard.get(key.username()).cloned())
    }

    fn delete(&self, key: &SecretKey) -> Result<(), SecretStoreError> {
        let mut guard = self.secrets.lock().unwrap();
        guard.remove(key.username());
        Ok(())
    }
}
