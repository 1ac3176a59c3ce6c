//! Authenticator option string parsing.
//!
//! Services configure their authenticator with a comma-separated list of
//! `key=value` options. The options adjust how user account lookups treat
//! the client address and schema name.

use crate::error::AuthProxyError;
use crate::users::UserSearchSettings;

/// Apply a comma-separated authenticator option string on top of
/// `settings`.
///
/// Recognized options:
/// - `cache_dir`: accepted for compatibility, ignored
/// - `inject_service_user`: allow falling back to the service account
/// - `skip_authentication`: true disables host pattern matching
/// - `lower_case_table_names`: true compares schema names case-insensitively
///
/// Unknown options and malformed entries are a configuration error and
/// abort module load.
pub fn parse_authenticator_options(
    opts: &str,
    settings: &mut UserSearchSettings,
) -> Result<(), AuthProxyError> {
    for opt in opts.split(',') {
        if opt.trim().is_empty() {
            continue;
        }

        let (name, value) = match opt.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() && !value.trim().is_empty() => {
                (name.trim(), value.trim())
            }
            _ => {
                error!("Invalid authenticator option setting: {}", opt);
                return Err(AuthProxyError::Config(format!(
                    "invalid authenticator option setting: {opt}"
                )));
            }
        };

        let truth = config_truth_value(value);
        match name {
            "cache_dir" => {
                // ignored
            }
            "inject_service_user" => {
                settings.allow_service_user = truth;
            }
            "skip_authentication" => {
                settings.match_host_pattern = !truth;
            }
            "lower_case_table_names" => {
                settings.case_sensitive_db = !truth;
            }
            _ => {
                error!("Unknown authenticator option: {}", name);
                return Err(AuthProxyError::Config(format!(
                    "unknown authenticator option: {name}"
                )));
            }
        }
    }
    Ok(())
}

/// Interpret a configuration value as a boolean the way the backend does:
/// `1`, `yes`, `on` and `true` are true, anything else is false.
fn config_truth_value(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "yes" | "on" | "true"
    )
}
