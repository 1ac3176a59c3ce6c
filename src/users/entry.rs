//! User account entries and lookup settings.

use super::hostmatch;

/// One row of the account universe, as replicated from `mysql.user`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserEntry {
    /// Username; empty for the anonymous/proxy slot
    pub username: String,
    /// Hostname or IP, may have wildcards
    pub host_pattern: String,
    /// Auth plugin that validates the client token
    pub plugin: String,
    /// Hex-encoded password hash used by the native plugin
    pub password: String,
    /// Auth data used by other plugins
    pub auth_string: String,
    /// Must the client connect with SSL?
    pub ssl_required: bool,
    /// Does the user have access to all databases?
    pub global_db_priv: bool,
    /// Does the user have proxy grants?
    pub proxy_grant: bool,
    /// Is the entry a role?
    pub is_role: bool,
    /// Role assumed when none is explicitly selected, possibly empty
    pub default_role: String,
}

impl UserEntry {
    /// Ordering predicate for entry lists: true when `lhs`'s host pattern
    /// should be tried before `rhs`'s. See
    /// [`hostmatch::pattern_is_more_specific`] for the ranking.
    pub fn host_pattern_is_more_specific(lhs: &UserEntry, rhs: &UserEntry) -> bool {
        hostmatch::pattern_is_more_specific(&lhs.host_pattern, &rhs.host_pattern)
    }
}

/// Per-lookup settings controlling how [`find_user`] treats the client.
///
/// [`find_user`]: crate::users::UserAccountCache::find_user
#[derive(Debug, Clone, Copy)]
pub struct UserSearchSettings {
    /// Accept lookups for the `root` account
    pub allow_root_user: bool,
    /// Fall back to the anonymous (empty-username) slot
    pub allow_anon_user: bool,
    /// Match the client address against host patterns; false matches by
    /// username only
    pub match_host_pattern: bool,
    /// Compare schema names case-sensitively
    pub case_sensitive_db: bool,
    /// Allow falling back to the injected service account
    pub allow_service_user: bool,
}

impl Default for UserSearchSettings {
    fn default() -> Self {
        Self {
            allow_root_user: false,
            allow_anon_user: false,
            match_host_pattern: true,
            case_sensitive_db: true,
            allow_service_user: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_equality_is_field_wise() {
        let a = UserEntry {
            username: "alice".into(),
            host_pattern: "%".into(),
            global_db_priv: true,
            ..UserEntry::default()
        };
        let mut b = a.clone();
        assert_eq!(a, b);
        b.proxy_grant = true;
        assert_ne!(a, b);
    }

    #[test]
    fn test_specificity_predicate_orders_roles_first() {
        let role = UserEntry {
            username: "r1".into(),
            is_role: true,
            ..UserEntry::default()
        };
        let user = UserEntry {
            username: "r1".into(),
            host_pattern: "10.0.0.1".into(),
            ..UserEntry::default()
        };
        assert!(UserEntry::host_pattern_is_more_specific(&role, &user));
        assert!(!UserEntry::host_pattern_is_more_specific(&user, &role));
    }
}
