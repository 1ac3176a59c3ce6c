//! The grant snapshot.
//!
//! A [`UserDatabase`] is an immutable view of the backend grant state at
//! one polling instant: all `user@host` entries, the schemas each may
//! access and the roles each has been granted. Snapshots are built by the
//! replication engine, published by pointer swap and queried concurrently
//! by worker caches.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::entry::UserEntry;
use super::hostmatch::{self, ReverseDnsCache};

/// `user@host` -> set of names, used for both schema grants and role
/// mappings.
pub type StringSetMap = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostPatternMode {
    Match,
    Skip,
}

/// All user account information of one service.
#[derive(Debug, Clone)]
pub struct UserDatabase {
    /// Username -> entries for that name, most specific host pattern
    /// first. Role entries sort to the front because their host pattern
    /// is empty.
    users: BTreeMap<String, Vec<UserEntry>>,
    /// Schemas a `user@host` may access, reduced from table and column
    /// grants to schema granularity.
    database_grants: StringSetMap,
    /// Roles granted to a `user@host`.
    roles_mapping: StringSetMap,
    dns: Arc<ReverseDnsCache>,
}

impl UserDatabase {
    pub fn new(dns: Arc<ReverseDnsCache>) -> Self {
        Self {
            users: BTreeMap::new(),
            database_grants: StringSetMap::new(),
            roles_mapping: StringSetMap::new(),
            dns,
        }
    }

    /// Insert an entry into its username's list, keeping the list ordered
    /// by host pattern specificity. Duplicate patterns insert after their
    /// equals, although these should not exist in the source data.
    pub fn add_entry(&mut self, username: &str, entry: UserEntry) {
        let entrylist = self.users.entry(username.to_string()).or_default();
        let insert_at = entrylist
            .partition_point(|e| !UserEntry::host_pattern_is_more_specific(&entry, e));
        entrylist.insert(insert_at, entry);
    }

    /// Bulk-install the schema grant and role mapping tables.
    pub fn set_dbs_and_roles(&mut self, db_grants: StringSetMap, roles_mapping: StringSetMap) {
        self.database_grants = db_grants;
        self.roles_mapping = roles_mapping;
    }

    /// Flag the entry with exactly this host pattern as holding a proxy
    /// grant. No-op if the user or the exact pattern is not present.
    pub fn add_proxy_grant(&mut self, user: &str, host: &str) {
        let entrylist = match self.users.get_mut(user) {
            Some(list) => list,
            None => return,
        };
        let needle = UserEntry {
            host_pattern: host.to_string(),
            ..UserEntry::default()
        };
        let at = entrylist
            .partition_point(|e| UserEntry::host_pattern_is_more_specific(e, &needle));
        if let Some(entry) = entrylist.get_mut(at) {
            if entry.host_pattern == host {
                entry.proxy_grant = true;
            }
        }
    }

    pub fn clear(&mut self) {
        self.users.clear();
    }

    /// Find the best matching entry for a client. The list is ordered, so
    /// the first non-role entry whose host pattern matches wins.
    pub fn find_entry(&self, username: &str, host: &str) -> Option<&UserEntry> {
        self.find_entry_impl(username, host, HostPatternMode::Match)
    }

    /// Find an entry by username only, ignoring the client address.
    pub fn find_entry_any(&self, username: &str) -> Option<&UserEntry> {
        self.find_entry_impl(username, "", HostPatternMode::Skip)
    }

    fn find_entry_impl(
        &self,
        username: &str,
        host: &str,
        mode: HostPatternMode,
    ) -> Option<&UserEntry> {
        let entrylist = self.users.get(username)?;
        entrylist.iter().find(|entry| {
            // The entry must not be a role (they have empty host patterns
            // in any case) and the pattern must match the client.
            !entry.is_role
                && (mode == HostPatternMode::Skip
                    || hostmatch::address_matches_host_pattern(
                        host,
                        &entry.host_pattern,
                        &self.dns,
                    ))
        })
    }

    /// Number of distinct usernames.
    pub fn n_usernames(&self) -> usize {
        self.users.len()
    }

    /// Number of `user@host` entries.
    pub fn n_entries(&self) -> usize {
        self.users.values().map(Vec::len).sum()
    }

    /// May the matched entry use schema `db`?
    ///
    /// Access is granted by a global privilege, by not requesting a
    /// specific schema, by a direct grant on the schema, or through the
    /// entry's default role.
    pub fn check_database_access(
        &self,
        entry: &UserEntry,
        db: &str,
        case_sensitive_db: bool,
    ) -> bool {
        let user = &entry.username;
        let host = &entry.host_pattern;
        let def_role = &entry.default_role;

        entry.global_db_priv
            || db.is_empty()
            || self.user_can_access_db(user, host, db, case_sensitive_db)
            || (!def_role.is_empty()
                && self.user_can_access_role(user, host, def_role)
                && self.role_can_access_db(def_role, db, case_sensitive_db))
    }

    fn user_can_access_db(
        &self,
        user: &str,
        host_pattern: &str,
        db: &str,
        case_sensitive_db: bool,
    ) -> bool {
        let key = format!("{user}@{host_pattern}");
        match self.database_grants.get(&key) {
            Some(allowed_dbs) if case_sensitive_db => allowed_dbs.contains(db),
            Some(allowed_dbs) => allowed_dbs
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(db)),
            None => false,
        }
    }

    fn user_can_access_role(&self, user: &str, host_pattern: &str, target_role: &str) -> bool {
        let key = format!("{user}@{host_pattern}");
        self.roles_mapping
            .get(&key)
            .map_or(false, |roles| roles.contains(target_role))
    }

    /// Can `role` access `db`, directly or through a role it has been
    /// granted? Role graphs may be cyclic, so this is a breadth-first
    /// search with a closed set rather than recursion.
    fn role_can_access_db(&self, role: &str, db: &str, case_sensitive_db: bool) -> bool {
        let role_has_global_priv = |role: &str| {
            self.users.get(role).map_or(false, |entrylist| {
                // Roles have an empty host pattern, so they are first in
                // the list.
                entrylist
                    .first()
                    .map_or(false, |entry| entry.is_role && entry.global_db_priv)
            })
        };

        let find_linked_roles = |role: &str| -> Vec<String> {
            let key = format!("{role}@");
            self.roles_mapping
                .get(&key)
                .map(|roles| roles.iter().cloned().collect())
                .unwrap_or_default()
        };

        let mut open_set = BTreeSet::new(); // roles still to be expanded
        let mut closed_set = BTreeSet::new(); // roles checked already

        open_set.insert(role.to_string());
        while let Some(current_role) = open_set.pop_first() {
            if role_has_global_priv(&current_role)
                || self.user_can_access_db(&current_role, "", db, case_sensitive_db)
            {
                return true;
            }

            // No access through the role itself; expand to its linked
            // roles.
            for linked_role in find_linked_roles(&current_role) {
                if !closed_set.contains(&linked_role) {
                    open_set.insert(linked_role);
                }
            }
            closed_set.insert(current_role);
        }
        false
    }

    /// Structural equality over the grant data. Used by the replication
    /// engine to skip publication when a poll yields an identical
    /// snapshot; the comparison is not trivially cheap but avoids copying
    /// the data into every worker cache.
    pub fn equal_contents(&self, rhs: &UserDatabase) -> bool {
        self.users == rhs.users
            && self.database_grants == rhs.database_grants
            && self.roles_mapping == rhs.roles_mapping
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::time::Duration;

    use crate::users::NameResolver;

    struct NoResolver;
    impl NameResolver for NoResolver {
        fn reverse_lookup(&self, _addr: IpAddr) -> Option<String> {
            None
        }
    }

    fn empty_db() -> UserDatabase {
        UserDatabase::new(Arc::new(ReverseDnsCache::new(
            Box::new(NoResolver),
            Duration::from_secs(300),
        )))
    }

    fn entry(username: &str, host_pattern: &str) -> UserEntry {
        UserEntry {
            username: username.into(),
            host_pattern: host_pattern.into(),
            ..UserEntry::default()
        }
    }

    #[test]
    fn test_entries_are_kept_in_specificity_order() {
        let mut db = empty_db();
        db.add_entry("bob", entry("bob", "%"));
        db.add_entry("bob", entry("bob", "10.0.0.0/255.255.255.0"));
        db.add_entry("bob", entry("bob", "10.0.0.5"));
        db.add_entry("bob", entry("bob", "db.example.com"));

        let patterns: Vec<&str> = db.users["bob"]
            .iter()
            .map(|e| e.host_pattern.as_str())
            .collect();
        assert_eq!(
            patterns,
            vec!["10.0.0.5", "10.0.0.0/255.255.255.0", "db.example.com", "%"]
        );
    }

    #[test]
    fn test_find_entry_takes_most_specific_match() {
        let mut db = empty_db();
        db.add_entry("bob", entry("bob", "%"));
        db.add_entry("bob", entry("bob", "10.0.0.5"));

        let found = db.find_entry("bob", "10.0.0.5").unwrap();
        assert_eq!(found.host_pattern, "10.0.0.5");

        let found = db.find_entry("bob", "10.0.0.6").unwrap();
        assert_eq!(found.host_pattern, "%");
    }

    #[test]
    fn test_find_entry_skips_roles() {
        let mut db = empty_db();
        let mut role = entry("dev", "");
        role.is_role = true;
        db.add_entry("dev", role);
        db.add_entry("dev", entry("dev", "%"));

        let found = db.find_entry("dev", "1.2.3.4").unwrap();
        assert!(!found.is_role);

        let found = db.find_entry_any("dev").unwrap();
        assert!(!found.is_role);
    }

    #[test]
    fn test_find_entry_any_ignores_host() {
        let mut db = empty_db();
        db.add_entry("carol", entry("carol", "10.99.99.99"));
        assert!(db.find_entry("carol", "1.2.3.4").is_none());
        assert!(db.find_entry_any("carol").is_some());
    }

    #[test]
    fn test_proxy_grant_set_on_exact_host_only() {
        let mut db = empty_db();
        db.add_entry("", entry("", "%"));
        db.add_entry("", entry("", "10.0.0.5"));

        db.add_proxy_grant("", "%");
        db.add_proxy_grant("", "10.0.0.6"); // absent, no-op
        db.add_proxy_grant("nobody", "%"); // absent user, no-op

        let entries = &db.users[""];
        let wildcard = entries.iter().find(|e| e.host_pattern == "%").unwrap();
        let literal = entries
            .iter()
            .find(|e| e.host_pattern == "10.0.0.5")
            .unwrap();
        assert!(wildcard.proxy_grant);
        assert!(!literal.proxy_grant);
    }

    #[test]
    fn test_database_access_clauses() {
        let mut db = empty_db();
        let mut global = entry("root", "%");
        global.global_db_priv = true;
        db.add_entry("root", global);
        db.add_entry("alice", entry("alice", "%"));

        let mut grants = StringSetMap::new();
        grants
            .entry("alice@%".to_string())
            .or_default()
            .insert("Sales".to_string());
        db.set_dbs_and_roles(grants, StringSetMap::new());

        let root = db.find_entry_any("root").unwrap();
        assert!(db.check_database_access(root, "anything", true));

        let alice = db.find_entry_any("alice").unwrap();
        // No schema requested.
        assert!(db.check_database_access(alice, "", true));
        // Direct grant, case-sensitive.
        assert!(db.check_database_access(alice, "Sales", true));
        assert!(!db.check_database_access(alice, "sales", true));
        // Case-insensitive compare.
        assert!(db.check_database_access(alice, "sales", false));
        // No grant at all.
        assert!(!db.check_database_access(alice, "hr", true));
    }

    #[test]
    fn test_role_transitivity() {
        let mut db = empty_db();
        let mut dave = entry("dave", "%");
        dave.default_role = "r1".into();
        db.add_entry("dave", dave);
        for role_name in ["r1", "r2"] {
            let mut role = entry(role_name, "");
            role.is_role = true;
            db.add_entry(role_name, role);
        }

        let mut grants = StringSetMap::new();
        grants
            .entry("r2@".to_string())
            .or_default()
            .insert("sales".to_string());
        let mut roles = StringSetMap::new();
        roles
            .entry("dave@%".to_string())
            .or_default()
            .insert("r1".to_string());
        roles
            .entry("r1@".to_string())
            .or_default()
            .insert("r2".to_string());
        db.set_dbs_and_roles(grants, roles);

        let dave = db.find_entry("dave", "1.2.3.4").unwrap();
        assert!(db.check_database_access(dave, "sales", true));
        assert!(!db.check_database_access(dave, "hr", true));
    }

    #[test]
    fn test_role_cycle_terminates() {
        let mut db = empty_db();
        let mut user = entry("eve", "%");
        user.default_role = "a".into();
        db.add_entry("eve", user);
        for role_name in ["a", "b"] {
            let mut role = entry(role_name, "");
            role.is_role = true;
            db.add_entry(role_name, role);
        }

        let mut roles = StringSetMap::new();
        roles
            .entry("eve@%".to_string())
            .or_default()
            .insert("a".to_string());
        roles.entry("a@".to_string()).or_default().insert("b".to_string());
        roles.entry("b@".to_string()).or_default().insert("a".to_string());
        db.set_dbs_and_roles(StringSetMap::new(), roles);

        let eve = db.find_entry("eve", "1.2.3.4").unwrap();
        // a <-> b grant nothing; the search must still terminate.
        assert!(!db.check_database_access(eve, "sales", true));
    }

    #[test]
    fn test_dangling_default_role_is_not_an_error() {
        let mut db = empty_db();
        let mut user = entry("frank", "%");
        user.default_role = "ghost".into();
        db.add_entry("frank", user);

        let mut roles = StringSetMap::new();
        roles
            .entry("frank@%".to_string())
            .or_default()
            .insert("ghost".to_string());
        db.set_dbs_and_roles(StringSetMap::new(), roles);

        let frank = db.find_entry("frank", "1.2.3.4").unwrap();
        assert!(!db.check_database_access(frank, "sales", true));
    }

    #[test]
    fn test_equal_contents() {
        let mut a = empty_db();
        a.add_entry("bob", entry("bob", "%"));
        let mut b = empty_db();
        b.add_entry("bob", entry("bob", "%"));

        assert!(a.equal_contents(&a));
        assert!(a.equal_contents(&b));
        assert!(b.equal_contents(&a));

        b.add_proxy_grant("bob", "%");
        assert!(!a.equal_contents(&b));

        let mut grants = StringSetMap::new();
        grants
            .entry("bob@%".to_string())
            .or_default()
            .insert("sales".to_string());
        a.set_dbs_and_roles(grants, StringSetMap::new());
        let mut c = empty_db();
        c.add_entry("bob", entry("bob", "%"));
        assert!(!a.equal_contents(&c));
    }

    #[test]
    fn test_counters() {
        let mut db = empty_db();
        assert_eq!(db.n_usernames(), 0);
        assert_eq!(db.n_entries(), 0);
        db.add_entry("bob", entry("bob", "%"));
        db.add_entry("bob", entry("bob", "10.0.0.5"));
        db.add_entry("alice", entry("alice", "%"));
        assert_eq!(db.n_usernames(), 2);
        assert_eq!(db.n_entries(), 3);
        db.clear();
        assert_eq!(db.n_entries(), 0);
    }
}
