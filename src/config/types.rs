//! Configuration types

use serde::Deserialize;

use crate::error::Result;
use crate::users::UserSearchSettings;

/// Root configuration structure
///
/// # Example
///
/// ```yaml
/// service_name: "read-service"
///
/// user_sync:
///   users_refresh_time: 30
///   users_refresh_interval: 0
///   auth_conn_timeout: 10
///
/// authenticator_options: "skip_authentication=false,lower_case_table_names=true"
/// ```
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Name of the owning service, used in log lines
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// User account replication settings
    #[serde(default)]
    pub user_sync: UserSyncConfig,

    /// Comma-separated authenticator options (`key=value` pairs)
    #[serde(default)]
    pub authenticator_options: String,
}

impl Config {
    /// Build the per-lookup search settings from the defaults plus the
    /// configured authenticator option string.
    pub fn search_settings(&self) -> Result<UserSearchSettings> {
        let mut settings = UserSearchSettings::default();
        super::parse_authenticator_options(&self.authenticator_options, &mut settings)?;
        Ok(settings)
    }
}

/// Settings controlling the user account replication engine.
#[derive(Debug, Clone, Deserialize)]
pub struct UserSyncConfig {
    /// Minimum seconds between refreshes; rapid refresh requests inside
    /// this interval are coalesced
    #[serde(default = "default_users_refresh_time")]
    pub users_refresh_time: u64,

    /// Maximum seconds between refreshes (0 = default of 24 hours)
    #[serde(default)]
    pub users_refresh_interval: u64,

    /// Backend connect/query timeout in seconds
    #[serde(default = "default_auth_conn_timeout")]
    pub auth_conn_timeout: u64,

    /// Outbound source address for backend connections, if set
    #[serde(default)]
    pub local_address: Option<String>,
}

impl Default for UserSyncConfig {
    fn default() -> Self {
        Self {
            users_refresh_time: default_users_refresh_time(),
            users_refresh_interval: 0,
            auth_conn_timeout: default_auth_conn_timeout(),
            local_address: None,
        }
    }
}

fn default_service_name() -> String {
    "service".to_string()
}

fn default_users_refresh_time() -> u64 {
    30
}

fn default_auth_conn_timeout() -> u64 {
    10
}
