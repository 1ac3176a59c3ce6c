//! Backend server descriptions and the connector seam.
//!
//! The replication engine talks to backends through the [`BackendConnector`]
//! trait so that the driver, pooling and TLS plumbing stay outside this
//! crate. Implementations provide credentials-authenticated sessions that
//! run the grant table queries and hand back string-typed result sets.

use std::time::Duration;

use async_trait::async_trait;
use zeroize::Zeroizing;

use crate::error::BackendError;

/// Kind of server behind an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerType {
    /// MariaDB server
    MariaDb,
    /// Oracle MySQL server
    MySql,
    /// Clustrix / Xpand node
    Clustrix,
}

/// Per-server TLS material for the backend connection. Opaque to this
/// crate; the connector implementation interprets it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SslConfig {
    pub cert: String,
    pub key: String,
    pub ca: String,
}

impl SslConfig {
    pub fn is_empty(&self) -> bool {
        self.cert.is_empty() && self.key.is_empty() && self.ca.is_empty()
    }
}

/// One backend server as seen by the replication engine. The orchestrator
/// owns the list and may replace it at any time.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    /// Server name used in log lines
    pub name: String,
    /// Address to connect to
    pub address: String,
    pub port: u16,
    pub server_type: ServerType,
    /// Numeric server version, e.g. 100508 for 10.5.8
    pub version_num: u64,
    /// Per-server TLS settings, if any
    pub ssl: SslConfig,
    /// Whether the server is part of the configuration
    pub active: bool,
    /// Whether the monitor currently considers the server usable
    pub usable: bool,
}

impl BackendSettings {
    /// Roles arrived in server 10.0.5; older backends have no
    /// roles_mapping table worth querying.
    pub fn supports_roles(&self) -> bool {
        self.version_num >= 100_005
    }
}

/// Connection parameters handed to the connector for one refresh pass.
#[derive(Clone)]
pub struct ConnectionSettings {
    pub username: String,
    /// Decrypted password, zeroed on drop
    pub password: Zeroizing<String>,
    /// Connect and query timeout
    pub timeout: Duration,
    /// Outbound source address, if configured
    pub local_address: Option<String>,
    /// TLS settings of the server being contacted
    pub ssl: SslConfig,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: Zeroizing::new(String::new()),
            timeout: Duration::from_secs(10),
            local_address: None,
            ssl: SslConfig::default(),
        }
    }
}

// Custom Debug so the password never reaches a log line.
impl std::fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("timeout", &self.timeout)
            .field("local_address", &self.local_address)
            .field("ssl", &self.ssl)
            .finish()
    }
}

/// A result set reduced to strings, the way the grant tables are read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { columns, rows }
    }

    /// Index of a named column. Case-sensitive, like the server's own
    /// metadata.
    pub fn col_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn rows(&self) -> impl Iterator<Item = &[String]> {
        self.rows.iter().map(|r| r.as_slice())
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Opens authenticated sessions to backend servers.
///
/// Implementations must be `Send + Sync`; the replication engine holds one
/// for its whole lifetime and calls it from its background task.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Open a session to `backend` with the given connection settings.
    async fn connect(
        &self,
        backend: &BackendSettings,
        settings: &ConnectionSettings,
    ) -> Result<Box<dyn BackendSession>, BackendError>;
}

/// An open backend session able to run queries.
#[async_trait]
pub trait BackendSession: Send {
    /// Run a query and collect the full result set.
    async fn query(&mut self, sql: &str) -> Result<QueryResult, BackendError>;
}
