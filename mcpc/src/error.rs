use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the whole crate. Each kind maps to one process exit
/// code, and the kind survives a round trip through an IPC `error` payload so
/// the session client can tell a retryable transport failure from everything
/// else.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input, unknown method, invalid session/profile name, missing
    /// registry entry.
    #[error("{0}")]
    Client(String),

    /// The upstream MCP server answered a request with an error payload.
    #[error("server error {code}: {message}")]
    Server {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Sockets, pipes, frames, spawns: anything on the way to the server.
    #[error("{0}")]
    Transport(String),

    /// Credential problems. `command` is the exact command the user should
    /// run to re-authenticate.
    #[error("{message}")]
    Auth {
        message: String,
        command: Option<String>,
    },

    /// A locked store file stayed locked past the retry budget.
    #[error("{} is locked by another process", path.display())]
    Busy { path: PathBuf },
}

impl Error {
    pub fn client(message: impl Into<String>) -> Self {
        Error::Client(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport(message.into())
    }

    pub fn auth(message: impl Into<String>, command: Option<String>) -> Self {
        Error::Auth {
            message: message.into(),
            command,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Client(_) | Error::Busy { .. } => 1,
            Error::Server { .. } => 2,
            Error::Transport(_) => 3,
            Error::Auth { .. } => 4,
        }
    }

    /// Only transport failures are eligible for the session client's one-shot
    /// reconnect; every other kind propagates unchanged.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Auth { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

/// Races that show up when a bridge and its clients tear down at the same
/// time. These are expected and must not pollute shutdown logs.
pub fn is_ignorable_shutdown_error(message: &str) -> bool {
    let msg = message.to_ascii_lowercase();
    ["not connected", "broken pipe", "connection reset", "failed to send error response", "abort"]
        .iter()
        .any(|needle| msg.contains(needle))
}
