use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const HOME_DIR_ENV: &str = "MCPC_HOME_DIR";
pub const VERBOSE_ENV: &str = "MCPC_VERBOSE";
pub const JSON_ENV: &str = "MCPC_JSON";

pub const SESSIONS_FILE: &str = "sessions.json";
pub const PROFILES_FILE: &str = "profiles.json";
pub const HISTORY_FILE: &str = "history";
pub const BRIDGES_DIR: &str = "bridges";
pub const LOGS_DIR: &str = "logs";

/// Root of the mcpc state directory (`~/.mcpc` unless `MCPC_HOME_DIR` is
/// set). All file and socket paths are derived from here so that a session
/// name alone determines where its bridge lives.
#[derive(Clone, Debug)]
pub struct McpcHome {
    root: PathBuf,
}

impl McpcHome {
    pub fn resolve() -> Result<Self> {
        if let Ok(dir) = std::env::var(HOME_DIR_ENV)
            && !dir.trim().is_empty()
        {
            return Ok(Self { root: PathBuf::from(dir) });
        }
        let home = dirs::home_dir()
            .ok_or_else(|| Error::client("could not determine the user home directory"))?;
        Ok(Self { root: home.join(".mcpc") })
    }

    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sessions_file(&self) -> PathBuf {
        self.root.join(SESSIONS_FILE)
    }

    pub fn profiles_file(&self) -> PathBuf {
        self.root.join(PROFILES_FILE)
    }

    pub fn history_file(&self) -> PathBuf {
        self.root.join(HISTORY_FILE)
    }

    pub fn bridges_dir(&self) -> PathBuf {
        self.root.join(BRIDGES_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    /// IPC endpoint for a session's bridge. On unix this is a socket file
    /// under `bridges/`; on Windows a named pipe namespaced by a hash of the
    /// home directory, since pipe names are global.
    #[cfg(unix)]
    pub fn socket_path(&self, session_name: &str) -> PathBuf {
        self.bridges_dir().join(format!("{session_name}.sock"))
    }

    #[cfg(windows)]
    pub fn socket_path(&self, session_name: &str) -> PathBuf {
        let hash8 = home_hash8(&self.root);
        PathBuf::from(format!(r"\\.\pipe\mcpc-{hash8}-{session_name}"))
    }

    pub fn bridge_log_path(&self, session_name: &str) -> PathBuf {
        self.logs_dir().join(format!("bridge-{session_name}.log"))
    }

    /// Create the state directories with owner-only permissions.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [self.root.clone(), self.bridges_dir(), self.logs_dir()] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| Error::client(format!("create {}: {e}", dir.display())))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700));
            }
        }
        Ok(())
    }
}

#[cfg(windows)]
fn home_hash8(root: &Path) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(root.to_string_lossy().as_bytes());
    digest[..4].iter().map(|b| format!("{b:02x}")).collect()
}

fn is_name_word(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Session names look like `@work`: an `@` followed by 1-64 word characters.
/// Rejected before any side effect.
pub fn validate_session_name(name: &str) -> Result<()> {
    match name.strip_prefix('@') {
        Some(rest) if is_name_word(rest) => Ok(()),
        _ => Err(Error::client(format!(
            "invalid session name `{name}`: expected @ followed by 1-64 of [A-Za-z0-9_-]"
        ))),
    }
}

pub fn validate_profile_name(name: &str) -> Result<()> {
    if is_name_word(name) {
        Ok(())
    } else {
        Err(Error::client(format!(
            "invalid profile name `{name}`: expected 1-64 of [A-Za-z0-9_-]"
        )))
    }
}

/// Truthy environment flags accept `1`, `true` and `yes` case-insensitively.
pub fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| {
            let v = v.trim().to_ascii_lowercase();
            v == "1" || v == "true" || v == "yes"
        })
        .unwrap_or(false)
}

pub fn verbose_enabled() -> bool {
    env_flag(VERBOSE_ENV)
}

pub fn json_output_enabled() -> bool {
    env_flag(JSON_ENV)
}
