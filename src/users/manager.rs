//! The user account replication engine.
//!
//! One long-lived task per service polls the backends' grant tables and
//! rebuilds the account snapshot. Workers never wait for it: a finished
//! snapshot is published by swapping an `Arc` under a short lock, and
//! caches pull the new snapshot when convenient.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use super::database::{StringSetMap, UserDatabase};
use super::entry::UserEntry;
use super::hostmatch::ReverseDnsCache;
use crate::backend::{
    BackendConnector, BackendSession, BackendSettings, ConnectionSettings, QueryResult, ServerType,
};
use crate::config::UserSyncConfig;
use crate::secrets::{self, EncryptionKey};

const ACQUIRE: Ordering = Ordering::Acquire;
const RELEASE: Ordering = Ordering::Release;

mod mariadb_queries {
    pub const USERS: &str = "SELECT * FROM mysql.user;";
    pub const DB_GRANTS: &str = "SELECT DISTINCT * FROM (\
        (SELECT a.user, a.host, a.db FROM mysql.db AS a) UNION \
        (SELECT a.user, a.host, a.db FROM mysql.tables_priv AS a) UNION \
        (SELECT a.user, a.host, a.db FROM mysql.columns_priv AS a) ) AS c;";
    pub const ROLES: &str = "SELECT a.user, a.host, a.role FROM mysql.roles_mapping AS a;";
    pub const PROXIES: &str = "SELECT DISTINCT a.user, a.host FROM mysql.proxies_priv AS a \
        WHERE a.proxied_host <> '' AND a.proxied_user <> '';";
}

mod clustrix_queries {
    pub const USERS: &str = "SELECT *, IF(a.privileges & 1048576, 'Y', 'N') AS global_priv \
        FROM system.users AS u LEFT JOIN system.user_acl AS a ON (u.username = a.role);";
    pub const DB_GRANTS: &str = "SELECT * FROM system.user_acl;";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadResult {
    Success,
    QueryFailed,
    InvalidData,
}

struct ManagerSettings {
    username: String,
    /// Stored form; possibly encrypted
    password: String,
    key: Option<EncryptionKey>,
    backends: Vec<BackendSettings>,
    sync: UserSyncConfig,
}

/// Replicates the grant tables of one service's backends into
/// [`UserDatabase`] snapshots.
pub struct UserAccountManager {
    service_name: String,
    connector: Arc<dyn BackendConnector>,
    dns: Arc<ReverseDnsCache>,

    /// Credentials, backend list and sync settings; mutated by the
    /// orchestrator, read by the updater at the top of each iteration.
    settings: Mutex<ManagerSettings>,

    /// The published snapshot and its generation counter.
    userdb: Mutex<Arc<UserDatabase>>,
    generation: AtomicU64,
    update_tx: watch::Sender<u64>,

    keep_running: AtomicBool,
    update_requested: AtomicBool,
    warn_no_servers: AtomicBool,
    notifier: Notify,
    updater: Mutex<Option<JoinHandle<()>>>,
}

impl UserAccountManager {
    /// Minimum wait between update loops. User accounts should not be
    /// changing continuously.
    const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(1);
    /// Default for scheduled updates when no interval is configured.
    const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

    pub fn new(
        service_name: impl Into<String>,
        connector: Arc<dyn BackendConnector>,
        dns: Arc<ReverseDnsCache>,
    ) -> Self {
        let empty = Arc::new(UserDatabase::new(Arc::clone(&dns)));
        let (update_tx, _) = watch::channel(0);
        Self {
            service_name: service_name.into(),
            connector,
            dns,
            settings: Mutex::new(ManagerSettings {
                username: String::new(),
                password: String::new(),
                key: None,
                backends: Vec::new(),
                sync: UserSyncConfig::default(),
            }),
            userdb: Mutex::new(empty),
            generation: AtomicU64::new(0),
            update_tx,
            keep_running: AtomicBool::new(false),
            update_requested: AtomicBool::new(false),
            warn_no_servers: AtomicBool::new(true),
            notifier: Notify::new(),
            updater: Mutex::new(None),
        }
    }

    /// Set the credentials used to log into backends. The password may be
    /// in the encrypted stored form.
    pub fn set_credentials(&self, username: impl Into<String>, password: impl Into<String>) {
        let mut settings = self.settings.lock().unwrap();
        settings.username = username.into();
        settings.password = password.into();
    }

    /// Install the key that decrypts the stored password.
    pub fn set_encryption_key(&self, key: EncryptionKey) {
        self.settings.lock().unwrap().key = Some(key);
    }

    /// Replace the backend list. Takes effect on the next refresh.
    pub fn set_backends(&self, backends: Vec<BackendSettings>) {
        self.settings.lock().unwrap().backends = backends;
    }

    pub fn set_sync_settings(&self, sync: UserSyncConfig) {
        self.settings.lock().unwrap().sync = sync;
    }

    /// Start the updater task. An update is requested immediately.
    pub fn start(self: &Arc<Self>) {
        let mut updater = self.updater.lock().unwrap();
        assert!(updater.is_none(), "updater task already running");
        self.keep_running.store(true, RELEASE);
        self.update_user_accounts();
        let this = Arc::clone(self);
        *updater = Some(tokio::spawn(async move { this.updater_task().await }));
    }

    /// Stop the updater task and wait for it to finish. An in-progress
    /// backend query completes or times out first.
    pub async fn stop(&self) {
        self.keep_running.store(false, RELEASE);
        self.notifier.notify_waiters();
        let handle = self.updater.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Request a user account refresh. Requests arriving faster than
    /// `users_refresh_time` are coalesced.
    pub fn update_user_accounts(&self) {
        self.update_requested.store(true, RELEASE);
        self.notifier.notify_waiters();
    }

    /// The current published snapshot.
    pub fn user_database(&self) -> Arc<UserDatabase> {
        Arc::clone(&self.userdb.lock().unwrap())
    }

    /// Generation counter of the published snapshot. Starts at zero and
    /// increments on every publication.
    pub fn generation(&self) -> u64 {
        self.generation.load(ACQUIRE)
    }

    /// Subscribe to snapshot publications. The channel carries the
    /// generation counter.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.update_tx.subscribe()
    }

    /// The reverse-DNS cache shared with the snapshots.
    pub fn dns_cache(&self) -> &Arc<ReverseDnsCache> {
        &self.dns
    }

    async fn updater_task(&self) {
        // In the beginning, don't wait long before the first try: the
        // monitor may not have found usable backends yet.
        let mut last_update = Instant::now();
        let mut updates: u64 = 0;

        while self.keep_running.load(ACQUIRE) {
            // The update schedule is controlled by several factors:
            // 1) until the first success, retry on a short hardcoded
            //    interval;
            // 2) refresh requests from the owning service, which can come
            //    at any rate;
            // 3) users_refresh_time, the minimum time between refreshes,
            //    which coalesces rapid requests;
            // 4) users_refresh_interval, the maximum time between
            //    refreshes.
            let (min_refresh, max_refresh) = {
                let settings = self.settings.lock().unwrap();
                (
                    settings.sync.users_refresh_time,
                    settings.sync.users_refresh_interval,
                )
            };

            let mut next_scheduled_update = last_update;
            if updates == 0 {
                next_scheduled_update += Self::DEFAULT_MIN_INTERVAL;
            } else if max_refresh > 0 {
                next_scheduled_update += Duration::from_secs(max_refresh);
            } else {
                next_scheduled_update += Self::DEFAULT_MAX_INTERVAL;
            }

            let mut next_possible_update = last_update;
            if min_refresh > 0 && updates > 0 {
                next_possible_update += Duration::from_secs(min_refresh);
            } else {
                next_possible_update += Self::DEFAULT_MIN_INTERVAL;
            }

            // Wait until "next_possible_update", or until the task should
            // stop.
            self.wait_until(next_possible_update, || {
                !self.keep_running.load(ACQUIRE)
            })
            .await;

            // Wait until "next_scheduled_update", or until an update is
            // requested or the task should stop.
            self.wait_until(next_scheduled_update, || {
                !self.keep_running.load(ACQUIRE)
                    || self.update_requested.load(ACQUIRE)
                    || updates == 0
            })
            .await;

            if self.keep_running.load(ACQUIRE) && self.load_users().await {
                updates += 1;
                self.warn_no_servers.store(true, RELEASE);
            }

            self.update_requested.store(false, RELEASE);
            last_update = Instant::now();
        }
    }

    /// Sleep until `deadline`, waking early whenever the notifier fires
    /// and `wake` holds.
    async fn wait_until<F: Fn() -> bool>(&self, deadline: Instant, wake: F) {
        let deadline = tokio::time::Instant::from_std(deadline);
        loop {
            // Register for notifications before checking the predicate so
            // a notification arriving in between is not lost.
            let notified = self.notifier.notified();
            if wake() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return,
                _ = notified => {}
            }
        }
    }

    /// Run one refresh pass over the backends. Returns true if a snapshot
    /// was built successfully (published or identical to the current one).
    async fn load_users(&self) -> bool {
        // Copy all settings under the lock, then work on the copies.
        let (mut conn_settings, backends) = {
            let settings = self.settings.lock().unwrap();
            let conn = ConnectionSettings {
                username: settings.username.clone(),
                password: secrets::decrypt_password(settings.key.as_ref(), &settings.password),
                timeout: Duration::from_secs(settings.sync.auth_conn_timeout),
                local_address: settings.sync.local_address.clone(),
                ssl: Default::default(),
            };
            (conn, settings.backends.clone())
        };

        let mut found_valid_server = false;
        let mut load_result = LoadResult::QueryFailed;

        for srv in &backends {
            if load_result != LoadResult::QueryFailed {
                break;
            }
            if !(srv.active && srv.usable) {
                continue;
            }
            found_valid_server = true;
            conn_settings.ssl = srv.ssl.clone();

            let mut session = match self.connector.connect(srv, &conn_settings).await {
                Ok(session) => session,
                Err(e) => {
                    error!("Could not connect to '{}'. {}", srv.name, e);
                    continue;
                }
            };

            let mut temp_userdb = UserDatabase::new(Arc::clone(&self.dns));
            load_result = match srv.server_type {
                ServerType::MariaDb | ServerType::MySql => {
                    self.load_users_mariadb(session.as_mut(), srv, &mut temp_userdb)
                        .await
                }
                ServerType::Clustrix => {
                    self.load_users_clustrix(session.as_mut(), srv, &mut temp_userdb)
                        .await
                }
            };

            match load_result {
                LoadResult::Success => {
                    // The comparison is not trivially cheap with many user
                    // entries, but it avoids pointless cache updates which
                    // would copy all the data several times over.
                    let current = self.user_database();
                    if temp_userdb.equal_contents(&current) {
                        info!(
                            "Read {} user@host entries from '{}' for service '{}'. The data was \
                             identical to existing user data.",
                            temp_userdb.n_entries(),
                            srv.name,
                            self.service_name
                        );
                    } else {
                        let n_entries = temp_userdb.n_entries();
                        {
                            let mut userdb = self.userdb.lock().unwrap();
                            *userdb = Arc::new(temp_userdb);
                        }
                        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                        let _ = self.update_tx.send(generation);
                        info!(
                            "Read {} user@host entries from '{}' for service '{}'.",
                            n_entries, srv.name, self.service_name
                        );
                    }
                }
                LoadResult::QueryFailed => {
                    error!(
                        "Failed to query server '{}' for user account info.",
                        srv.name
                    );
                }
                LoadResult::InvalidData => {
                    error!(
                        "Received invalid data from '{}' when querying user accounts.",
                        srv.name
                    );
                }
            }
        }

        if !found_valid_server && self.warn_no_servers.swap(false, Ordering::AcqRel) {
            error!(
                "No valid servers from which to query user accounts for service '{}'.",
                self.service_name
            );
        }
        load_result == LoadResult::Success
    }

    async fn load_users_mariadb(
        &self,
        session: &mut dyn BackendSession,
        srv: &BackendSettings,
        output: &mut UserDatabase,
    ) -> LoadResult {
        // Roles were added in server 10.0.5, default roles in 10.1.1.
        // Reading roles_mapping on 10.0.5 is not strictly required as the
        // roles won't be used, but diagnostics may print it.
        let role_support = srv.supports_roles();

        // All queries must succeed on the same backend; results are never
        // mixed across servers.
        let users_res = match session.query(mariadb_queries::USERS).await {
            Ok(res) => res,
            Err(e) => {
                debug!("User query on '{}' failed: {}", srv.name, e);
                return LoadResult::QueryFailed;
            }
        };
        let dbs_res = match session.query(mariadb_queries::DB_GRANTS).await {
            Ok(res) => res,
            Err(e) => {
                debug!("Grant query on '{}' failed: {}", srv.name, e);
                return LoadResult::QueryFailed;
            }
        };
        let proxies_res = match session.query(mariadb_queries::PROXIES).await {
            Ok(res) => res,
            Err(e) => {
                debug!("Proxy grant query on '{}' failed: {}", srv.name, e);
                return LoadResult::QueryFailed;
            }
        };
        let roles_res = if role_support {
            match session.query(mariadb_queries::ROLES).await {
                Ok(res) => Some(res),
                Err(e) => {
                    debug!("Role query on '{}' failed: {}", srv.name, e);
                    return LoadResult::QueryFailed;
                }
            }
        } else {
            None
        };

        if !read_users_mariadb(&users_res, output) {
            return LoadResult::InvalidData;
        }
        read_dbs_and_roles(&dbs_res, roles_res.as_ref(), output);
        read_proxy_grants(&proxies_res, output);
        LoadResult::Success
    }

    async fn load_users_clustrix(
        &self,
        session: &mut dyn BackendSession,
        srv: &BackendSettings,
        output: &mut UserDatabase,
    ) -> LoadResult {
        let users_res = match session.query(clustrix_queries::USERS).await {
            Ok(res) => res,
            Err(e) => {
                debug!("User query on '{}' failed: {}", srv.name, e);
                return LoadResult::QueryFailed;
            }
        };
        let acl_res = match session.query(clustrix_queries::DB_GRANTS).await {
            Ok(res) => res,
            Err(e) => {
                debug!("ACL query on '{}' failed: {}", srv.name, e);
                return LoadResult::QueryFailed;
            }
        };
        read_users_clustrix(&users_res, &acl_res, output)
    }
}

/// Convert `mysql.user` rows into user entries. False if the result set is
/// missing required columns.
fn read_users_mariadb(users: &QueryResult, output: &mut UserDatabase) -> bool {
    let get_bool_enum = |val: &str| val == "Y" || val == "y";

    // Column indexes for the interesting fields. Depending on the backend
    // version they may not all exist.
    let required = [
        users.col_index("User"),
        users.col_index("Host"),
        users.col_index("Select_priv"),
        users.col_index("Insert_priv"),
        users.col_index("Update_priv"),
        users.col_index("Delete_priv"),
        users.col_index("ssl_type"),
        users.col_index("plugin"),
        users.col_index("Password"),
        users.col_index("authentication_string"),
    ];
    let [ind_user, ind_host, ind_sel, ind_ins, ind_upd, ind_del, ind_ssl, ind_plugin, ind_pw, ind_auth_str] =
        match required {
            [Some(a), Some(b), Some(c), Some(d), Some(e), Some(f), Some(g), Some(h), Some(i), Some(j)] => {
                [a, b, c, d, e, f, g, h, i, j]
            }
            _ => return false,
        };
    let ind_is_role = users.col_index("is_role");
    let ind_def_role = users.col_index("default_role");

    for row in users.rows() {
        let field = |ind: usize| row.get(ind).map(String::as_str).unwrap_or("");
        let username = field(ind_user);

        let mut new_entry = UserEntry {
            username: username.to_string(),
            host_pattern: field(ind_host).to_string(),
            // The user has global privileges if any of these global
            // privileges exists.
            global_db_priv: get_bool_enum(field(ind_sel))
                || get_bool_enum(field(ind_ins))
                || get_bool_enum(field(ind_upd))
                || get_bool_enum(field(ind_del)),
            // Require SSL if the entry is not empty.
            ssl_required: !field(ind_ssl).is_empty(),
            plugin: field(ind_plugin).to_string(),
            password: field(ind_pw).to_string(),
            auth_string: field(ind_auth_str).to_string(),
            ..UserEntry::default()
        };

        if let Some(ind) = ind_is_role {
            new_entry.is_role = get_bool_enum(field(ind));
        }
        if let Some(ind) = ind_def_role {
            new_entry.default_role = field(ind).to_string();
        }

        let username = new_entry.username.clone();
        output.add_entry(&username, new_entry);
    }
    true
}

/// Convert the schema grant and role mapping result sets into the
/// auxiliary maps.
fn read_dbs_and_roles(dbs: &QueryResult, roles: Option<&QueryResult>, output: &mut UserDatabase) {
    let map_builder = |grant_col_name: &str, source: &QueryResult| {
        let mut result = StringSetMap::new();
        let cols = (
            source.col_index("user"),
            source.col_index("host"),
            source.col_index(grant_col_name),
        );
        if let (Some(ind_user), Some(ind_host), Some(ind_grant)) = cols {
            for row in source.rows() {
                let field = |ind: usize| row.get(ind).map(String::as_str).unwrap_or("");
                let key = format!("{}@{}", field(ind_user), field(ind_host));
                result
                    .entry(key)
                    .or_default()
                    .insert(field(ind_grant).to_string());
            }
        }
        result
    };

    let new_db_grants = map_builder("db", dbs);
    // Old backends have no role data.
    let new_roles_mapping = roles
        .map(|roles| map_builder("role", roles))
        .unwrap_or_default();

    output.set_dbs_and_roles(new_db_grants, new_roles_mapping);
}

/// Flag entries named by `mysql.proxies_priv` rows as proxy-granting.
fn read_proxy_grants(proxies: &QueryResult, output: &mut UserDatabase) {
    if proxies.row_count() == 0 {
        return;
    }
    if let (Some(ind_user), Some(ind_host)) =
        (proxies.col_index("user"), proxies.col_index("host"))
    {
        for row in proxies.rows() {
            let field = |ind: usize| row.get(ind).map(String::as_str).unwrap_or("");
            output.add_proxy_grant(field(ind_user), field(ind_host));
        }
    }
}

/// Convert joined `system.users`/`system.user_acl` rows into user entries.
fn read_users_clustrix(
    users: &QueryResult,
    _acl: &QueryResult,
    output: &mut UserDatabase,
) -> LoadResult {
    let cols = (
        users.col_index("username"),
        users.col_index("host"),
        users.col_index("password"),
        users.col_index("plugin"),
        users.col_index("global_priv"),
    );
    let (ind_user, ind_host, ind_pw, ind_plugin, ind_priv) = match cols {
        (Some(a), Some(b), Some(c), Some(d), Some(e)) => (a, b, c, d, e),
        _ => return LoadResult::InvalidData,
    };

    for row in users.rows() {
        let field = |ind: usize| row.get(ind).map(String::as_str).unwrap_or("");
        let new_entry = UserEntry {
            username: field(ind_user).to_string(),
            host_pattern: field(ind_host).to_string(),
            password: field(ind_pw).to_string(),
            plugin: field(ind_plugin).to_string(),
            global_db_priv: field(ind_priv) == "Y",
            ..UserEntry::default()
        };
        let username = new_entry.username.clone();
        output.add_entry(&username, new_entry);
    }
    // TODO: read schema-level privileges from system.user_acl.
    LoadResult::Success
}
