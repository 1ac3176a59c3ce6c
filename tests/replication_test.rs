//! Integration tests for the user account replication engine: snapshot
//! publication, identical-data skips, backend failover and failure
//! handling.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, timeout};

use mysql_auth_proxy::{
    BackendConnector, BackendError, BackendSession, BackendSettings, ConnectionSettings,
    NameResolver, QueryResult, ReverseDnsCache, ServerType, SslConfig, UserAccountManager,
    UserSyncConfig,
};

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
/// Long enough for at least one further refresh pass with the default
/// 1 s initial interval.
const REFRESH_GRACE: Duration = Duration::from_secs(3);

struct NoResolver;

impl NameResolver for NoResolver {
    fn reverse_lookup(&self, _addr: IpAddr) -> Option<String> {
        None
    }
}

/// Behavior of one mock backend server.
#[derive(Clone)]
enum Behavior {
    ConnectFail,
    Serve(MockData),
}

#[derive(Clone, Default)]
struct MockData {
    users: QueryResult,
    grants: QueryResult,
    roles: QueryResult,
    proxies: QueryResult,
}

/// Scriptable connector: per-server behavior plus connect counters.
#[derive(Default)]
struct MockConnector {
    behaviors: Mutex<HashMap<String, Behavior>>,
    connect_attempts: Mutex<Vec<String>>,
}

impl MockConnector {
    fn set_behavior(&self, server: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(server.to_string(), behavior);
    }

    fn connect_attempts(&self) -> Vec<String> {
        self.connect_attempts.lock().unwrap().clone()
    }
}

struct MockSession {
    data: MockData,
}

#[async_trait]
impl BackendConnector for MockConnector {
    async fn connect(
        &self,
        backend: &BackendSettings,
        _settings: &ConnectionSettings,
    ) -> Result<Box<dyn BackendSession>, BackendError> {
        self.connect_attempts
            .lock()
            .unwrap()
            .push(backend.name.clone());
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&backend.name)
            .cloned()
            .unwrap_or(Behavior::ConnectFail);
        match behavior {
            Behavior::ConnectFail => Err(BackendError::ConnectFailed {
                server: backend.name.clone(),
                reason: "connection refused".into(),
            }),
            Behavior::Serve(data) => Ok(Box::new(MockSession { data })),
        }
    }
}

#[async_trait]
impl BackendSession for MockSession {
    async fn query(&mut self, sql: &str) -> Result<QueryResult, BackendError> {
        let result = if sql.contains("roles_mapping") {
            &self.data.roles
        } else if sql.contains("proxies_priv") {
            &self.data.proxies
        } else if sql.contains("mysql.user") || sql.contains("system.users") {
            &self.data.users
        } else {
            &self.data.grants
        };
        Ok(result.clone())
    }
}

fn user_columns() -> Vec<String> {
    [
        "User",
        "Host",
        "Select_priv",
        "Insert_priv",
        "Update_priv",
        "Delete_priv",
        "ssl_type",
        "plugin",
        "Password",
        "authentication_string",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn user_row(user: &str, host: &str) -> Vec<String> {
    vec![
        user.into(),
        host.into(),
        "Y".into(),
        "N".into(),
        "N".into(),
        "N".into(),
        String::new(),
        "mysql_native_password".into(),
        "*HASH".into(),
        String::new(),
    ]
}

fn mock_data(usernames: &[&str]) -> MockData {
    MockData {
        users: QueryResult::new(
            user_columns(),
            usernames.iter().map(|u| user_row(u, "%")).collect(),
        ),
        grants: QueryResult::new(
            vec!["user".into(), "host".into(), "db".into()],
            Vec::new(),
        ),
        roles: QueryResult::new(
            vec!["user".into(), "host".into(), "role".into()],
            Vec::new(),
        ),
        proxies: QueryResult::new(vec!["user".into(), "host".into()], Vec::new()),
    }
}

/// Users result missing the Password column: structurally invalid.
fn invalid_data() -> MockData {
    let mut data = mock_data(&["alice"]);
    let mut columns = user_columns();
    columns.retain(|c| c != "Password");
    data.users = QueryResult::new(
        columns,
        vec![user_row("alice", "%")[..9].to_vec()],
    );
    data
}

fn backend(name: &str, usable: bool) -> BackendSettings {
    BackendSettings {
        name: name.into(),
        address: "127.0.0.1".into(),
        port: 3306,
        server_type: ServerType::MariaDb,
        version_num: 100_508,
        ssl: SslConfig::default(),
        active: true,
        usable,
    }
}

fn new_manager(connector: Arc<MockConnector>) -> Arc<UserAccountManager> {
    let dns = Arc::new(ReverseDnsCache::new(
        Box::new(NoResolver),
        Duration::from_secs(300),
    ));
    let manager = Arc::new(UserAccountManager::new("test-service", connector, dns));
    manager.set_credentials("maxuser", "maxpwd");
    // Refresh requests should be served on the shortest allowed cadence.
    manager.set_sync_settings(UserSyncConfig {
        users_refresh_time: 0,
        ..UserSyncConfig::default()
    });
    manager
}

async fn await_publish(manager: &UserAccountManager) {
    let mut rx = manager.subscribe();
    timeout(PUBLISH_TIMEOUT, rx.changed())
        .await
        .expect("snapshot was not published in time")
        .expect("manager dropped the publish channel");
}

#[tokio::test]
async fn publishes_snapshot_and_skips_identical_data() {
    let connector = Arc::new(MockConnector::default());
    connector.set_behavior("server1", Behavior::Serve(mock_data(&["alice", "bob"])));

    let manager = new_manager(Arc::clone(&connector));
    manager.set_backends(vec![backend("server1", true)]);
    manager.start();
    await_publish(&manager).await;

    assert_eq!(manager.generation(), 1);
    let db = manager.user_database();
    assert_eq!(db.n_usernames(), 2);
    assert!(db.find_entry("alice", "10.0.0.1").is_some());

    // A further refresh returning identical data publishes nothing.
    manager.update_user_accounts();
    sleep(REFRESH_GRACE).await;
    assert_eq!(manager.generation(), 1);
    assert!(Arc::ptr_eq(&db, &manager.user_database()));

    // Changed data is published with a bumped generation.
    connector.set_behavior(
        "server1",
        Behavior::Serve(mock_data(&["alice", "bob", "carol"])),
    );
    let mut rx = manager.subscribe();
    manager.update_user_accounts();
    timeout(PUBLISH_TIMEOUT, rx.changed())
        .await
        .expect("changed data was not published")
        .unwrap();
    assert_eq!(manager.generation(), 2);
    assert_eq!(manager.user_database().n_usernames(), 3);

    manager.stop().await;
}

#[tokio::test]
async fn fails_over_to_next_backend_on_connect_error() {
    let connector = Arc::new(MockConnector::default());
    connector.set_behavior("server1", Behavior::ConnectFail);
    connector.set_behavior("server2", Behavior::Serve(mock_data(&["alice"])));

    let manager = new_manager(Arc::clone(&connector));
    manager.set_backends(vec![backend("server1", true), backend("server2", true)]);
    manager.start();
    await_publish(&manager).await;

    let attempts = connector.connect_attempts();
    assert_eq!(attempts[..2], ["server1".to_string(), "server2".to_string()]);
    assert!(manager.user_database().find_entry_any("alice").is_some());

    manager.stop().await;
}

#[tokio::test]
async fn invalid_data_keeps_old_snapshot_and_stops_the_pass() {
    let connector = Arc::new(MockConnector::default());
    connector.set_behavior("server1", Behavior::Serve(mock_data(&["alice"])));
    connector.set_behavior("server2", Behavior::Serve(mock_data(&["intruder"])));

    let manager = new_manager(Arc::clone(&connector));
    manager.set_backends(vec![backend("server1", true), backend("server2", true)]);
    manager.start();
    await_publish(&manager).await;
    assert_eq!(manager.generation(), 1);

    // server1 starts returning structurally invalid data. The pass must
    // not move on to server2; the old snapshot stays published.
    connector.set_behavior("server1", Behavior::Serve(invalid_data()));
    let before = connector.connect_attempts().len();
    manager.update_user_accounts();
    sleep(REFRESH_GRACE).await;

    assert_eq!(manager.generation(), 1);
    assert!(manager.user_database().find_entry_any("alice").is_some());
    assert!(manager.user_database().find_entry_any("intruder").is_none());
    let attempts = connector.connect_attempts();
    assert!(attempts.len() > before);
    assert!(!attempts[before..].contains(&"server2".to_string()));

    manager.stop().await;
}

#[tokio::test]
async fn skips_inactive_and_unusable_backends() {
    let connector = Arc::new(MockConnector::default());
    connector.set_behavior("down", Behavior::Serve(mock_data(&["alice"])));
    connector.set_behavior("up", Behavior::Serve(mock_data(&["bob"])));

    let manager = new_manager(Arc::clone(&connector));
    manager.set_backends(vec![backend("down", false), backend("up", true)]);
    manager.start();
    await_publish(&manager).await;

    let attempts = connector.connect_attempts();
    assert!(!attempts.contains(&"down".to_string()));
    assert!(manager.user_database().find_entry_any("bob").is_some());

    manager.stop().await;
}

#[tokio::test]
async fn recovers_after_no_usable_backends() {
    let connector = Arc::new(MockConnector::default());
    connector.set_behavior("server1", Behavior::Serve(mock_data(&["alice"])));

    let manager = new_manager(Arc::clone(&connector));
    // No usable backend at startup: nothing can be loaded.
    manager.set_backends(vec![backend("server1", false)]);
    manager.start();
    sleep(REFRESH_GRACE).await;
    assert_eq!(manager.generation(), 0);
    assert!(connector.connect_attempts().is_empty());

    // The monitor brings the server up; the engine keeps retrying until
    // the first success.
    let mut rx = manager.subscribe();
    manager.set_backends(vec![backend("server1", true)]);
    timeout(PUBLISH_TIMEOUT, rx.changed())
        .await
        .expect("snapshot was not published after recovery")
        .unwrap();
    assert_eq!(manager.generation(), 1);

    manager.stop().await;
}

#[tokio::test]
async fn clustrix_backend_loads_without_role_queries() {
    let connector = Arc::new(MockConnector::default());
    let data = MockData {
        users: QueryResult::new(
            vec![
                "username".into(),
                "host".into(),
                "password".into(),
                "plugin".into(),
                "global_priv".into(),
            ],
            vec![vec![
                "admin".into(),
                "%".into(),
                "*HASH".into(),
                String::new(),
                "Y".into(),
            ]],
        ),
        ..MockData::default()
    };
    connector.set_behavior("node1", Behavior::Serve(data));

    let manager = new_manager(Arc::clone(&connector));
    let mut node = backend("node1", true);
    node.server_type = ServerType::Clustrix;
    manager.set_backends(vec![node]);
    manager.start();
    await_publish(&manager).await;

    let db = manager.user_database();
    let admin = db.find_entry_any("admin").unwrap();
    assert!(admin.global_db_priv);

    manager.stop().await;
}

#[tokio::test]
async fn stop_terminates_the_updater() {
    let connector = Arc::new(MockConnector::default());
    connector.set_behavior("server1", Behavior::Serve(mock_data(&["alice"])));

    let manager = new_manager(Arc::clone(&connector));
    manager.set_backends(vec![backend("server1", true)]);
    manager.start();
    await_publish(&manager).await;
    manager.stop().await;

    // A request after stop is a no-op: no task is left to serve it.
    let before = connector.connect_attempts().len();
    manager.update_user_accounts();
    sleep(REFRESH_GRACE).await;
    assert_eq!(connector.connect_attempts().len(), before);
}
