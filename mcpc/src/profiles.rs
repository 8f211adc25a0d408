//! OAuth profiles: metadata in `profiles.json`, secrets in the keychain.
//!
//! A profile is keyed by `(serverUrl, profileName)`. Two keychain records
//! belong to it: client info (`clientId`, optional `clientSecret`) and token
//! info (`accessToken`, `tokenType`, `expiresAt`, optional `refreshToken`,
//! optional `scope`). Neither ever lands in a JSON file.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::paths::{McpcHome, validate_profile_name};
use crate::secrets::{SecretKey, SecretStore};
use crate::store::{read_or_default, with_file_lock};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthProfile {
    pub name: String,
    pub server_url: String,
    pub auth_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_issuer: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refreshed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_subject: Option<String>,
}

impl AuthProfile {
    pub fn new(name: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server_url: server_url.into(),
            auth_type: "oauth".into(),
            oauth_issuer: None,
            scopes: Vec::new(),
            created_at: Utc::now(),
            authenticated_at: None,
            refreshed_at: None,
            user_email: None,
            user_name: None,
            user_subject: None,
        }
    }
}

/// On-disk shape: `{ "profiles": { "<serverUrl>": { "<name>": profile } } }`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: BTreeMap<String, BTreeMap<String, AuthProfile>>,
}

/// Keychain record: client registration for one profile.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

/// Keychain record: current tokens for one profile. `expires_at` is unix
/// seconds, absolute, so restarts do not stretch token lifetimes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenInfo {
    pub access_token: String,
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn profiles_path(home: &McpcHome) -> PathBuf {
    home.profiles_file()
}

/// Upsert a profile record. Saving the same profile twice yields one record.
pub fn save_auth_profile(home: &McpcHome, profile: &AuthProfile) -> Result<()> {
    validate_profile_name(&profile.name)?;
    let profile = profile.clone();
    with_file_lock(&profiles_path(home), ProfilesFile::default, move |file| {
        file.profiles
            .entry(profile.server_url.clone())
            .or_default()
            .insert(profile.name.clone(), profile);
        Ok(())
    })
}

pub fn load_auth_profile(
    home: &McpcHome,
    server_url: &str,
    name: &str,
) -> Result<Option<AuthProfile>> {
    let file: ProfilesFile = read_or_default(&profiles_path(home), ProfilesFile::default)?;
    Ok(file
        .profiles
        .get(server_url)
        .and_then(|by_name| by_name.get(name))
        .cloned())
}

pub fn list_auth_profiles(home: &McpcHome) -> Result<ProfilesFile> {
    read_or_default(&profiles_path(home), ProfilesFile::default)
}

/// Remove the profile record and both of its keychain records.
pub fn delete_auth_profile(
    home: &McpcHome,
    secrets: &dyn SecretStore,
    server_url: &str,
    name: &str,
) -> Result<bool> {
    let removed = with_file_lock(&profiles_path(home), ProfilesFile::default, |file| {
        let removed = file
            .profiles
            .get_mut(server_url)
            .and_then(|by_name| by_name.remove(name))
            .is_some();
        if let Some(by_name) = file.profiles.get(server_url)
            && by_name.is_empty()
        {
            file.profiles.remove(server_url);
        }
        Ok(removed)
    })?;
    secrets.delete(&SecretKey::profile_client(server_url, name))?;
    secrets.delete(&SecretKey::profile_tokens(server_url, name))?;
    Ok(removed)
}

/// Record the moment of a successful silent refresh.
pub fn stamp_refreshed_at(home: &McpcHome, server_url: &str, name: &str) -> Result<()> {
    with_file_lock(&profiles_path(home), ProfilesFile::default, |file| {
        if let Some(profile) = file
            .profiles
            .get_mut(server_url)
            .and_then(|by_name| by_name.get_mut(name))
        {
            profile.refreshed_at = Some(Utc::now());
        }
        Ok(())
    })
}

pub fn save_client_info(
    secrets: &dyn SecretStore,
    server_url: &str,
    name: &str,
    info: &ClientInfo,
) -> Result<()> {
    let raw = serde_json::to_string(info)
        .map_err(|e| Error::client(format!("serialize client info: {e}")))?;
    secrets.set(&SecretKey::profile_client(server_url, name), &raw)?;
    Ok(())
}

pub fn load_client_info(
    secrets: &dyn SecretStore,
    server_url: &str,
    name: &str,
) -> Result<Option<ClientInfo>> {
    let raw = secrets.get(&SecretKey::profile_client(server_url, name))?;
    raw.map(|raw| {
        serde_json::from_str(&raw).map_err(|e| Error::client(format!("parse client info: {e}")))
    })
    .transpose()
}

pub fn save_token_info(
    secrets: &dyn SecretStore,
    server_url: &str,
    name: &str,
    tokens: &TokenInfo,
) -> Result<()> {
    let raw = serde_json::to_string(tokens)
        .map_err(|e| Error::client(format!("serialize token info: {e}")))?;
    secrets.set(&SecretKey::profile_tokens(server_url, name), &raw)?;
    Ok(())
}

pub fn load_token_info(
    secrets: &dyn SecretStore,
    server_url: &str,
    name: &str,
) -> Result<Option<TokenInfo>> {
    let raw = secrets.get(&SecretKey::profile_tokens(server_url, name))?;
    raw.map(|raw| {
        serde_json::from_str(&raw).map_err(|e| Error::client(format!("parse token info: {e}")))
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::MemorySecretStore;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_home(tag: &str) -> McpcHome {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "mcpc-profiles-{tag}-{}-{stamp}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        McpcHome::from_root(dir)
    }

    #[test]
    fn save_twice_yields_one_record() {
        let home = temp_home("idem");
        let profile = AuthProfile::new("default", "https://srv.example");
        save_auth_profile(&home, &profile).unwrap();
        save_auth_profile(&home, &profile).unwrap();
        let file = list_auth_profiles(&home).unwrap();
        assert_eq!(file.profiles.len(), 1);
        assert_eq!(file.profiles["https://srv.example"].len(), 1);
    }

    #[test]
    fn invalid_profile_name_is_rejected_before_any_write() {
        let home = temp_home("badname");
        let profile = AuthProfile::new("not a name", "https://srv.example");
        assert!(save_auth_profile(&home, &profile).is_err());
        assert!(!home.profiles_file().exists());
    }

    #[test]
    fn secrets_stay_out_of_the_json_file() {
        let home = temp_home("nosecret");
        let secrets = MemorySecretStore::new();
        save_auth_profile(&home, &AuthProfile::new("default", "https://srv.example")).unwrap();
        save_client_info(
            &secrets,
            "https://srv.example",
            "default",
            &ClientInfo { client_id: "cid".into(), client_secret: Some("very-secret".into()) },
        )
        .unwrap();
        save_token_info(
            &secrets,
            "https://srv.example",
            "default",
            &TokenInfo {
                access_token: "at-123".into(),
                token_type: "Bearer".into(),
                expires_at: Some(1_700_000_000),
                refresh_token: Some("rt-456".into()),
                scope: None,
            },
        )
        .unwrap();
        let raw = std::fs::read_to_string(home.profiles_file()).unwrap();
        for secret in ["very-secret", "at-123", "rt-456"] {
            assert!(!raw.contains(secret), "{secret} leaked into profiles.json");
        }
    }

    #[test]
    fn delete_removes_record_and_keychain_entries() {
        let home = temp_home("delete");
        let secrets = MemorySecretStore::new();
        save_auth_profile(&home, &AuthProfile::new("default", "https://srv.example")).unwrap();
        save_client_info(
            &secrets,
            "https://srv.example",
            "default",
            &ClientInfo { client_id: "cid".into(), client_secret: None },
        )
        .unwrap();
        assert!(delete_auth_profile(&home, &secrets, "https://srv.example", "default").unwrap());
        assert!(secrets.is_empty());
        assert!(
            load_auth_profile(&home, "https://srv.example", "default")
                .unwrap()
                .is_none()
        );
        // Second delete is a no-op.
        assert!(!delete_auth_profile(&home, &secrets, "https://srv.example", "default").unwrap());
    }

    #[test]
    fn refreshed_at_is_stamped() {
        let home = temp_home("stamp");
        save_auth_profile(&home, &AuthProfile::new("default", "https://srv.example")).unwrap();
        stamp_refreshed_at(&home, "https://srv.example", "default").unwrap();
        let profile = load_auth_profile(&home, "https://srv.example", "default")
            .unwrap()
            .unwrap();
        assert!(profile.refreshed_at.is_some());
    }
}
