//! mysql-auth-proxy - User-account authentication core for a
//! MySQL/MariaDB-compatible database proxy
//!
//! This library provides the pieces a proxy needs to decide, without a
//! per-connection round trip to a backend, whether a client may connect
//! and use its requested default schema:
//! - Replicates the backends' grant tables into in-memory snapshots
//!   ([`users::UserAccountManager`])
//! - Answers account lookups with MySQL host-pattern and role-inheritance
//!   semantics ([`users::UserAccountCache`])
//! - Decodes the client handshake-response packet ([`protocol::mysql`])
//!
//! The listener, session I/O, routing and the authentication plugins that
//! verify client tokens live outside this crate; the lookup result hands
//! them the matched account entry.

#[macro_use]
mod logging;

pub mod backend;
pub mod config;
pub mod error;
pub mod protocol;
pub mod secrets;
pub mod throttle;
pub mod users;

pub use backend::{
    BackendConnector, BackendSession, BackendSettings, ConnectionSettings, QueryResult, ServerType,
    SslConfig,
};
pub use config::{load_config, load_config_from_str, Config, UserSyncConfig};
pub use error::{AuthProxyError, BackendError, ParseError, Result};
pub use protocol::mysql::{ClientInfo, ClientResponse};
pub use secrets::EncryptionKey;
pub use throttle::{LogThrottle, ThrottleConfig};
pub use users::{
    NameResolver, ReverseDnsCache, SystemResolver, UserAccountCache, UserAccountManager,
    UserDatabase, UserEntry, UserEntryKind, UserSearchResult, UserSearchSettings,
};
