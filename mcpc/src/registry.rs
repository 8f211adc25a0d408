//! The durable session registry (`sessions.json`) and its consolidation.
//!
//! A record never stores its socket path: that is derived from the session
//! name, so there is nothing to drift out of sync. `dead` is likewise never
//! persisted; it is computed from PID liveness at read time. Sensitive header
//! values live in the keychain and only a redacted copy reaches disk.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ipc::BridgeClient;
use crate::paths::{McpcHome, validate_session_name};
use crate::secrets::{SecretKey, SecretStore};
use crate::store::{read_or_default, with_file_lock};
use crate::transport::ServerConfig;

pub const ORPHAN_LOG_MAX_AGE_DAYS: u64 = 7;

const FORCE_PING_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    /// The upstream MCP server said this session is permanently unusable.
    Expired,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub name: String,
    pub server: ServerConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionsFile {
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionRecord>,
}

/// Session state as seen by a caller right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Live,
    Dead,
    Expired,
}

#[derive(Clone, Debug)]
pub struct SessionRegistry {
    home: McpcHome,
}

impl SessionRegistry {
    pub fn new(home: McpcHome) -> Self {
        Self { home }
    }

    pub fn home(&self) -> &McpcHome {
        &self.home
    }

    fn file(&self) -> PathBuf {
        self.home.sessions_file()
    }

    pub fn load_all(&self) -> Result<BTreeMap<String, SessionRecord>> {
        let file: SessionsFile = read_or_default(&self.file(), SessionsFile::default)?;
        Ok(file.sessions)
    }

    pub fn get(&self, name: &str) -> Result<Option<SessionRecord>> {
        validate_session_name(name)?;
        Ok(self.load_all()?.remove(name))
    }

    /// Create (or replace) a session record. Real header values go to the
    /// keychain; the record keeps a redacted copy.
    pub fn create(
        &self,
        secrets: &dyn SecretStore,
        name: &str,
        server: ServerConfig,
        profile_name: Option<String>,
    ) -> Result<SessionRecord> {
        validate_session_name(name)?;
        if let Some(profile) = &profile_name {
            crate::paths::validate_profile_name(profile)?;
        }
        let server = server.validated()?;
        stash_session_headers(secrets, name, &server)?;
        let now = Utc::now();
        let record = SessionRecord {
            name: name.to_string(),
            server: server.redacted(),
            profile_name,
            pid: None,
            status: SessionStatus::Active,
            created_at: now,
            last_seen_at: now,
        };
        let stored = record.clone();
        with_file_lock(&self.file(), SessionsFile::default, move |file| {
            file.sessions.insert(stored.name.clone(), stored);
            Ok(())
        })?;
        Ok(record)
    }

    pub fn update<F>(&self, name: &str, f: F) -> Result<SessionRecord>
    where
        F: FnOnce(&mut SessionRecord),
    {
        validate_session_name(name)?;
        with_file_lock(&self.file(), SessionsFile::default, |file| {
            let record = file
                .sessions
                .get_mut(name)
                .ok_or_else(|| Error::client(format!("unknown session {name}")))?;
            f(record);
            record.last_seen_at = Utc::now();
            Ok(record.clone())
        })
    }

    /// Record the PID of a bridge that just came up, creating the record when
    /// the daemon was spawned outside the usual connect flow.
    pub fn record_bridge_start(
        &self,
        name: &str,
        server: ServerConfig,
        profile_name: Option<String>,
        pid: u32,
    ) -> Result<()> {
        validate_session_name(name)?;
        let server = server.redacted();
        with_file_lock(&self.file(), SessionsFile::default, move |file| {
            let now = Utc::now();
            file.sessions
                .entry(name.to_string())
                .and_modify(|record| {
                    record.pid = Some(pid);
                    record.status = SessionStatus::Active;
                    record.last_seen_at = now;
                })
                .or_insert_with(|| SessionRecord {
                    name: name.to_string(),
                    server,
                    profile_name,
                    pid: Some(pid),
                    status: SessionStatus::Active,
                    created_at: now,
                    last_seen_at: now,
                });
            Ok(())
        })
    }

    pub fn mark_expired(&self, name: &str) -> Result<()> {
        self.update(name, |record| record.status = SessionStatus::Expired)
            .map(|_| ())
    }

    /// Remove a session and everything that hangs off it: keychain headers,
    /// socket file.
    pub fn remove(&self, secrets: &dyn SecretStore, name: &str) -> Result<bool> {
        validate_session_name(name)?;
        let removed = with_file_lock(&self.file(), SessionsFile::default, |file| {
            Ok(file.sessions.remove(name).is_some())
        })?;
        secrets.delete(&SecretKey::session_headers(name))?;
        #[cfg(unix)]
        let _ = std::fs::remove_file(self.home.socket_path(name));
        Ok(removed)
    }

    pub fn liveness(&self, record: &SessionRecord) -> Liveness {
        if record.status == SessionStatus::Expired {
            return Liveness::Expired;
        }
        match record.pid {
            Some(pid) if is_process_alive(pid) => Liveness::Live,
            _ => Liveness::Dead,
        }
    }

    /// Sweep the registry back into line with reality: drop `expired`
    /// entries (with their sockets and keychain headers), leave dead entries
    /// in place, and unlink orphaned bridge logs. With `force`, liveness
    /// additionally requires a successful ping, not just a breathing PID.
    pub async fn consolidate(
        &self,
        secrets: &dyn SecretStore,
        force: bool,
    ) -> Result<BTreeMap<String, (SessionRecord, Liveness)>> {
        let (mut snapshot, removed) =
            with_file_lock(&self.file(), SessionsFile::default, |file| {
                let mut snapshot = BTreeMap::new();
                let mut removed = Vec::new();
                file.sessions.retain(|name, record| {
                    if record.status == SessionStatus::Expired {
                        removed.push(name.clone());
                        false
                    } else {
                        snapshot.insert(name.clone(), record.clone());
                        true
                    }
                });
                Ok((snapshot, removed))
            })?;

        for name in &removed {
            secrets.delete(&SecretKey::session_headers(name))?;
            #[cfg(unix)]
            let _ = std::fs::remove_file(self.home.socket_path(name));
        }

        let mut out = BTreeMap::new();
        for (name, record) in snapshot.iter_mut() {
            let mut liveness = self.liveness(record);
            if liveness == Liveness::Live && force {
                let alive = match BridgeClient::connect(
                    &self.home.socket_path(name),
                    None,
                    FORCE_PING_TIMEOUT,
                )
                .await
                {
                    Ok(client) => client.ping(FORCE_PING_TIMEOUT).await.is_ok(),
                    Err(_) => false,
                };
                if !alive {
                    liveness = Liveness::Dead;
                }
            }
            out.insert(name.clone(), (record.clone(), liveness));
        }

        let known: BTreeSet<String> = out.keys().cloned().collect();
        sweep_orphan_logs(&self.home, &known, ORPHAN_LOG_MAX_AGE_DAYS)?;

        Ok(out)
    }
}

/// Parse `bridge-@<name>.log` or `bridge-@<name>.log.<n>` back to `@<name>`.
fn session_of_log_file(file_name: &str) -> Option<&str> {
    let rest = file_name.strip_prefix("bridge-")?;
    if !rest.starts_with('@') {
        return None;
    }
    if let Some(name) = rest.strip_suffix(".log") {
        return Some(name);
    }
    let (stem, suffix) = rest.rsplit_once(".log.")?;
    suffix.parse::<u32>().ok()?;
    Some(stem)
}

/// Unlink rotated bridge logs whose session is gone and whose mtime is older
/// than `max_age_days`. Younger orphans are kept for post-mortems.
pub fn sweep_orphan_logs(
    home: &McpcHome,
    known_sessions: &BTreeSet<String>,
    max_age_days: u64,
) -> Result<Vec<PathBuf>> {
    let logs_dir = home.logs_dir();
    let entries = match std::fs::read_dir(&logs_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::client(format!("read {}: {e}", logs_dir.display()))),
    };
    let cutoff = std::time::SystemTime::now()
        .checked_sub(Duration::from_secs(max_age_days * 24 * 60 * 60));
    let mut removed = Vec::new();
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let file_name_str = file_name.to_string_lossy();
        let Some(session) = session_of_log_file(&file_name_str) else {
            continue;
        };
        if known_sessions.contains(session) {
            continue;
        }
        let old_enough = match (entry.metadata().and_then(|m| m.modified()), cutoff) {
            (Ok(mtime), Some(cutoff)) => mtime < cutoff,
            _ => false,
        };
        if old_enough && std::fs::remove_file(entry.path()).is_ok() {
            removed.push(entry.path());
        }
    }
    Ok(removed)
}

#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    // Signal 0 probes for existence; EPERM still means the process exists.
    let res = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if res == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
pub fn is_process_alive(_pid: u32) -> bool {
    // No signal-0 equivalent without extra dependencies; pipe probes decide.
    false
}

/// Keep the real header values in the keychain under
/// `session:<name>:headers`; callers persist only the redacted config.
fn stash_session_headers(
    secrets: &dyn SecretStore,
    name: &str,
    server: &ServerConfig,
) -> Result<()> {
    match server {
        ServerConfig::Http { headers, .. } if !headers.is_empty() => {
            let raw = serde_json::to_string(headers)
                .map_err(|e| Error::client(format!("serialize headers: {e}")))?;
            secrets.set(&SecretKey::session_headers(name), &raw)?;
            Ok(())
        }
        _ => Ok(()),
    }
}

pub fn load_session_headers(
    secrets: &dyn SecretStore,
    name: &str,
) -> Result<Option<HashMap<String, String>>> {
    let raw = secrets.get(&SecretKey::session_headers(name))?;
    raw.map(|raw| {
        serde_json::from_str(&raw)
            .map_err(|e| Error::client(format!("parse stored headers: {e}")))
    })
    .transpose()
}

pub fn save_session_headers(
    secrets: &dyn SecretStore,
    name: &str,
    headers: &HashMap<String, String>,
) -> Result<()> {
    let raw = serde_json::to_string(headers)
        .map_err(|e| Error::client(format!("serialize headers: {e}")))?;
    secrets.set(&SecretKey::session_headers(name), &raw)?;
    Ok(())
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
            "mcpc-registry-{tag}-{}-{stamp}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        McpcHome::from_root(dir)
    }

    fn http_config(headers: &[(&str, &str)]) -> ServerConfig {
        ServerConfig::Http {
            url: "https://srv.example".into(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            timeout: None,
        }
    }

    #[test]
    fn create_redacts_headers_on_disk_and_stashes_them() {
        let home = temp_home("create");
        let registry = SessionRegistry::new(home.clone());
        let secrets = MemorySecretStore::new();
        registry
            .create(
                &secrets,
                "@work",
                http_config(&[("Authorization", "Bearer real-token"), ("X-Tenant", "acme")]),
                Some("default".into()),
            )
            .unwrap();

        let raw = std::fs::read_to_string(home.sessions_file()).unwrap();
        assert!(!raw.contains("real-token"), "secret leaked into sessions.json");
        assert!(raw.contains("acme"), "non-sensitive headers stay readable");

        let stored = load_session_headers(&secrets, "@work").unwrap().unwrap();
        assert_eq!(stored["Authorization"], "Bearer real-token");
    }

    #[test]
    fn invalid_names_are_rejected_before_side_effects() {
        let home = temp_home("names");
        let registry = SessionRegistry::new(home.clone());
        let secrets = MemorySecretStore::new();
        assert!(
            registry
                .create(&secrets, "work", http_config(&[]), None)
                .is_err()
        );
        assert!(
            registry
                .create(&secrets, "@bad name", http_config(&[]), None)
                .is_err()
        );
        assert!(!home.sessions_file().exists());
        assert!(secrets.is_empty());
    }

    #[test]
    fn liveness_is_computed_not_stored() {
        let home = temp_home("liveness");
        let registry = SessionRegistry::new(home);
        let secrets = MemorySecretStore::new();
        let record = registry
            .create(&secrets, "@s", http_config(&[]), None)
            .unwrap();
        assert_eq!(registry.liveness(&record), Liveness::Dead);

        // Our own PID is alive by definition.
        let record = registry
            .update("@s", |r| r.pid = Some(std::process::id()))
            .unwrap();
        assert_eq!(registry.liveness(&record), Liveness::Live);

        registry.mark_expired("@s").unwrap();
        let record = registry.get("@s").unwrap().unwrap();
        assert_eq!(registry.liveness(&record), Liveness::Expired);

        let raw = std::fs::read_to_string(registry.file()).unwrap();
        assert!(!raw.contains("dead"), "dead must never be persisted");
    }

    #[tokio::test]
    async fn consolidate_removes_expired_and_is_a_fixed_point() {
        let home = temp_home("consolidate");
        let registry = SessionRegistry::new(home.clone());
        let secrets = MemorySecretStore::new();
        registry
            .create(&secrets, "@keep", http_config(&[]), None)
            .unwrap();
        registry
            .create(
                &secrets,
                "@gone",
                http_config(&[("Authorization", "Bearer t")]),
                None,
            )
            .unwrap();
        registry.mark_expired("@gone").unwrap();

        let first = registry.consolidate(&secrets, false).await.unwrap();
        assert!(first.contains_key("@keep"));
        assert!(!first.contains_key("@gone"));
        assert!(
            load_session_headers(&secrets, "@gone").unwrap().is_none(),
            "expired session keychain entry swept"
        );

        let second = registry.consolidate(&secrets, false).await.unwrap();
        assert_eq!(
            first.keys().collect::<Vec<_>>(),
            second.keys().collect::<Vec<_>>(),
            "consolidate is a fixed point on a quiescent registry"
        );
    }

    #[test]
    fn orphan_log_names_parse() {
        assert_eq!(session_of_log_file("bridge-@work.log"), Some("@work"));
        assert_eq!(session_of_log_file("bridge-@work.log.3"), Some("@work"));
        assert_eq!(session_of_log_file("bridge-work.log"), None);
        assert_eq!(session_of_log_file("other.log"), None);
        assert_eq!(session_of_log_file("bridge-@work.log.x"), None);
    }

    #[test]
    fn old_orphan_logs_are_unlinked_young_ones_kept() {
        let home = temp_home("orphans");
        std::fs::create_dir_all(home.logs_dir()).unwrap();
        let old = home.logs_dir().join("bridge-@gone.log");
        let young = home.logs_dir().join("bridge-@recent.log");
        let live = home.logs_dir().join("bridge-@keep.log");
        for path in [&old, &young, &live] {
            std::fs::write(path, b"log line\n").unwrap();
        }
        let ten_days_ago =
            SystemTime::now() - Duration::from_secs(10 * 24 * 60 * 60);
        let one_day_ago = SystemTime::now() - Duration::from_secs(24 * 60 * 60);
        std::fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(ten_days_ago)
            .unwrap();
        std::fs::File::options()
            .write(true)
            .open(&young)
            .unwrap()
            .set_modified(one_day_ago)
            .unwrap();

        let known: BTreeSet<String> = [String::from("@keep")].into();
        let removed = sweep_orphan_logs(&home, &known, ORPHAN_LOG_MAX_AGE_DAYS).unwrap();
        assert_eq!(removed, vec![old.clone()]);
        assert!(!old.exists());
        assert!(young.exists(), "1-day-old orphan log is retained");
        assert!(live.exists());
    }
}
