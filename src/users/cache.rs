//! Per-worker view of the account snapshot.
//!
//! Each network worker holds a [`UserAccountCache`]. Lookups run against
//! the snapshot the cache currently references; the replication engine
//! never blocks a lookup, it only publishes a newer snapshot for the
//! cache to pull.

use std::sync::Arc;

use super::database::UserDatabase;
use super::entry::{UserEntry, UserSearchSettings};
use super::manager::UserAccountManager;

/// Outcome classification of a user account lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserEntryKind {
    /// No entry matched the client
    UserNotFound,
    /// The service does not allow `root`
    RootAccessDenied,
    /// An anonymous entry matched but has no proxy grant
    AnonProxyAccessDenied,
    /// An entry matched but may not access the requested schema
    DbAccessDenied,
    /// An entry matched with sufficient privileges
    UserAccountOk,
}

/// Result of a user account lookup. On success the matched entry is an
/// owned copy, valid across later snapshot swaps.
#[derive(Debug, Clone)]
pub struct UserSearchResult {
    pub kind: UserEntryKind,
    pub entry: Option<UserEntry>,
}

impl UserSearchResult {
    fn found(entry: &UserEntry) -> Self {
        Self {
            kind: UserEntryKind::UserAccountOk,
            entry: Some(entry.clone()),
        }
    }

    fn denied(kind: UserEntryKind) -> Self {
        Self { kind, entry: None }
    }

    /// The matched entry, discarding the outcome classification.
    pub fn into_entry(self) -> Option<UserEntry> {
        self.entry
    }
}

/// Read-only account cache of one worker.
pub struct UserAccountCache {
    master: Arc<UserAccountManager>,
    userdb: Arc<UserDatabase>,
    generation: u64,
}

impl UserAccountCache {
    /// Create a cache view over the manager's current snapshot.
    pub fn new(master: Arc<UserAccountManager>) -> Self {
        let userdb = master.user_database();
        let generation = master.generation();
        Self {
            master,
            userdb,
            generation,
        }
    }

    /// Find the account entry the client should authenticate against.
    ///
    /// `user` and `host` are the client identity, `requested_db` the
    /// default schema from the handshake (possibly empty).
    pub fn find_user(
        &self,
        user: &str,
        host: &str,
        requested_db: &str,
        sett: &UserSearchSettings,
    ) -> UserSearchResult {
        // If "root" is not allowed, block such users immediately.
        if !sett.allow_root_user && user == "root" {
            info!(
                "Client '{}'@'{}' blocked because the service does not allow 'root' logins.",
                user, host
            );
            return UserSearchResult::denied(UserEntryKind::RootAccessDenied);
        }

        // First try to find a normal user entry. If host pattern matching
        // is disabled, match only the username.
        let found = if sett.match_host_pattern {
            self.userdb.find_entry(user, host)
        } else {
            self.userdb.find_entry_any(user)
        };

        if let Some(entry) = found {
            return if self
                .userdb
                .check_database_access(entry, requested_db, sett.case_sensitive_db)
            {
                info!(
                    "Found matching user '{}'@'{}' for client '{}'@'{}' with sufficient privileges.",
                    entry.username, entry.host_pattern, user, host
                );
                UserSearchResult::found(entry)
            } else {
                info!(
                    "Found matching user '{}'@'{}' for client '{}'@'{}' but user does not have \
                     sufficient privileges.",
                    entry.username, entry.host_pattern, user, host
                );
                UserSearchResult::denied(UserEntryKind::DbAccessDenied)
            };
        }

        if sett.allow_anon_user {
            // Try to find an anonymous entry. It has an empty username and
            // matches any client username. If host pattern matching is
            // disabled, any user from any host matches an anonymous entry.
            let found = if sett.match_host_pattern {
                self.userdb.find_entry("", host)
            } else {
                self.userdb.find_entry_any("")
            };

            if let Some(entry) = found {
                // For anonymous users, do not check database access as the
                // final effective user is not yet known. Instead require a
                // proxy grant.
                return if entry.proxy_grant {
                    info!(
                        "Found matching anonymous user ''@'{}' for client '{}'@'{}' with proxy grant.",
                        entry.host_pattern, user, host
                    );
                    UserSearchResult::found(entry)
                } else {
                    info!(
                        "Found matching anonymous user ''@'{}' for client '{}'@'{}' but user does \
                         not have proxy privileges.",
                        entry.host_pattern, user, host
                    );
                    UserSearchResult::denied(UserEntryKind::AnonProxyAccessDenied)
                };
            }
        }

        info!("Found no matching user for client '{}'@'{}'.", user, host);
        UserSearchResult::denied(UserEntryKind::UserNotFound)
    }

    /// Replace the local snapshot reference with the replication engine's
    /// current one. A pure read; never blocks a lookup in progress.
    pub fn update_from_master(&mut self) {
        self.userdb = self.master.user_database();
        self.generation = self.master.generation();
    }

    /// Has the replication engine published a newer snapshot than the one
    /// this cache holds?
    pub fn needs_update(&self) -> bool {
        self.generation != self.master.generation()
    }

    /// The snapshot this cache currently reads from.
    pub fn user_database(&self) -> &Arc<UserDatabase> {
        &self.userdb
    }
}
