//! Session and bridge plumbing for `mcpc`, a command-line MCP client.
//!
//! A named session (`@work`) keeps one expensive MCP connection alive across
//! many short CLI invocations by delegating it to a per-session bridge
//! daemon. This crate is that machinery: the durable session registry, the
//! length-prefixed IPC protocol over the per-session socket, the bridge
//! daemon and its CLI-side supervisor, and the OAuth token manager the
//! bridge consults on every request.

pub mod bridge;
pub mod error;
pub mod history;
pub mod ipc;
pub mod logging;
pub mod manager;
pub mod oauth;
pub mod paths;
pub mod profiles;
pub mod registry;
pub mod secrets;
pub mod session;
pub mod store;
pub mod transport;

pub use error::{Error, Result};
