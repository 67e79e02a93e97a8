//! In-memory fakes for the data store, host network, and operator
//!
//! Every fake writes to a shared [`Journal`] so tests can assert on the
//! order of side effects across nodes.

use crate::config::NodeConfig;
use crate::discovery::Pair;
use crate::error::{Result, RoleSwapError};
use crate::network::HostNetwork;
use crate::node::{DataStore, LinkStatus, Node, READ_ONLY_CONFIG_KEY, ReplicationStatus, Role};
use crate::operator::Operator;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const MUTATING: &[&str] = &[
    "set_config",
    "remove_vip",
    "add_vip",
    "announce_vip",
    "detach",
    "shutdown",
];

/// Ordered record of calls made against the fakes
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    fn record(&self, entry: String) {
        self.entries.lock().unwrap().push(entry);
    }

    /// Every recorded call
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    /// Calls of the given kinds, in order
    pub fn ordered(&self, kinds: &[&str]) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| kinds.iter().any(|k| *k == kind(e)))
            .collect()
    }

    /// Calls that change node or network state
    pub fn mutations(&self) -> Vec<String> {
        self.ordered(MUTATING)
    }

    /// Number of calls of one kind
    pub fn count(&self, of: &str) -> usize {
        self.entries().iter().filter(|e| kind(e) == of).count()
    }
}

fn kind(entry: &str) -> &str {
    entry.split_whitespace().next().unwrap_or_default()
}

/// Mutable state behind one fake node
#[derive(Debug, Clone)]
pub struct FakeNodeState {
    pub role: Role,
    pub link_status: LinkStatus,
    pub read_only: bool,
    pub unreachable: bool,
    pub version: String,
    /// Observation windows that still see traffic
    pub busy_windows: u32,
    /// Published timestamps are shifted back by this much
    pub publish_lag_secs: f64,
    pub drop_publishes: bool,
    pub fail_config_set: bool,
    pub shut_down: bool,
}

impl FakeNodeState {
    fn primary() -> Self {
        Self {
            role: Role::Primary,
            link_status: LinkStatus::NotApplicable,
            read_only: false,
            unreachable: false,
            version: "7.2.4".to_string(),
            busy_windows: 0,
            publish_lag_secs: 0.0,
            drop_publishes: false,
            fail_config_set: false,
            shut_down: false,
        }
    }

    fn replica() -> Self {
        Self {
            role: Role::Replica,
            link_status: LinkStatus::Up,
            read_only: true,
            ..Self::primary()
        }
    }
}

/// Fake data store; clones share state
#[derive(Debug, Clone)]
pub struct FakeStore {
    host: String,
    state: Arc<Mutex<FakeNodeState>>,
    bus: broadcast::Sender<(String, String)>,
    journal: Journal,
}

impl FakeStore {
    fn new(
        host: &str,
        state: FakeNodeState,
        bus: broadcast::Sender<(String, String)>,
        journal: Journal,
    ) -> Self {
        Self {
            host: host.to_string(),
            state: Arc::new(Mutex::new(state)),
            bus,
            journal,
        }
    }

    /// Change node state in place
    pub fn update(&self, f: impl FnOnce(&mut FakeNodeState)) {
        f(&mut *self.state.lock().unwrap());
    }

    /// Snapshot of node state
    pub fn state(&self) -> FakeNodeState {
        self.state.lock().unwrap().clone()
    }

    fn reachable(&self) -> Result<FakeNodeState> {
        let state = self.state();
        if state.unreachable {
            return Err(RoleSwapError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("{} is unreachable", self.host),
            )));
        }
        Ok(state)
    }

    fn record(&self, entry: impl AsRef<str>) {
        self.journal.record(format!("{} {}", entry.as_ref(), self.host));
    }
}

#[async_trait]
impl DataStore for FakeStore {
    async fn replication_status(&self) -> Result<ReplicationStatus> {
        let state = self.reachable()?;
        Ok(ReplicationStatus {
            role: state.role,
            link_status: state.link_status,
        })
    }

    async fn read_only(&self) -> Result<bool> {
        Ok(self.reachable()?.read_only)
    }

    async fn get_config(&self, key: &str) -> Result<Option<String>> {
        let state = self.reachable()?;
        Ok((key == READ_ONLY_CONFIG_KEY)
            .then(|| if state.read_only { "yes" } else { "no" }.to_string()))
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let state = self.reachable()?;
        self.journal
            .record(format!("set_config {} {} {}", self.host, key, value));
        if state.fail_config_set {
            return Err(RoleSwapError::config("CONFIG SET rejected"));
        }
        if key == READ_ONLY_CONFIG_KEY {
            self.update(|s| s.read_only = value == "yes");
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let state = self.reachable()?;
        self.record("publish");
        if state.drop_publishes {
            return Ok(());
        }
        let shifted = payload
            .parse::<f64>()
            .map(|sent| format!("{:.6}", sent - state.publish_lag_secs))
            .unwrap_or_else(|_| payload.to_string());
        // No subscriber is not an error
        let _ = self.bus.send((channel.to_string(), shifted));
        Ok(())
    }

    async fn subscribe_once(&self, channel: &str, wait: Duration) -> Result<Option<String>> {
        self.reachable()?;
        self.record("subscribe");
        let mut rx = self.bus.subscribe();
        let first = async {
            loop {
                match rx.recv().await {
                    Ok((c, payload)) if c == channel => return Some(payload),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };
        Ok(tokio::time::timeout(wait, first).await.ok().flatten())
    }

    async fn observe_commands(&self, wait: Duration) -> Result<Option<String>> {
        let state = self.reachable()?;
        self.record("observe");
        if state.busy_windows > 0 {
            self.update(|s| s.busy_windows -= 1);
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(Some("\"SET\" \"session:1\" \"x\"".to_string()));
        }
        tokio::time::sleep(wait).await;
        Ok(None)
    }

    async fn detach_from_primary(&self) -> Result<()> {
        self.reachable()?;
        self.record("detach");
        self.update(|s| {
            s.role = Role::Primary;
            s.link_status = LinkStatus::NotApplicable;
        });
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.reachable()?;
        self.record("shutdown");
        self.update(|s| {
            s.shut_down = true;
            s.unreachable = true;
        });
        Ok(())
    }

    async fn server_version(&self) -> Result<String> {
        Ok(self.reachable()?.version)
    }
}

#[derive(Debug)]
struct NetworkState {
    owners: BTreeSet<String>,
    tools: HashMap<String, Option<String>>,
    fail_remove: bool,
    fail_add: bool,
    fail_announce: bool,
}

/// Fake floating IP control; clones share state
#[derive(Debug, Clone)]
pub struct FakeNetwork {
    hosts: [String; 2],
    state: Arc<Mutex<NetworkState>>,
    journal: Journal,
}

impl FakeNetwork {
    fn new(hosts: [&str; 2], owner: &str, journal: Journal) -> Self {
        let tools = hosts
            .iter()
            .map(|h| (h.to_string(), Some("/usr/bin/arping".to_string())))
            .collect();
        Self {
            hosts: hosts.map(str::to_string),
            state: Arc::new(Mutex::new(NetworkState {
                owners: BTreeSet::from([owner.to_string()]),
                tools,
                fail_remove: false,
                fail_add: false,
                fail_announce: false,
            })),
            journal,
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut NetworkState) -> T) -> T {
        f(&mut *self.state.lock().unwrap())
    }

    /// Hosts currently holding the floating IP
    pub fn owners(&self) -> Vec<String> {
        self.with(|s| s.owners.iter().cloned().collect())
    }

    /// Make `host` the only owner, or nobody
    pub fn set_owner(&self, host: Option<&str>) {
        self.with(|s| s.owners = host.map(str::to_string).into_iter().collect());
    }

    /// Both hosts claim the floating IP
    pub fn set_both_own(&self, both: bool) {
        let hosts = self.hosts.clone();
        self.with(|s| {
            if both {
                s.owners.extend(hosts);
            }
        });
    }

    /// Announce tool path on `host`
    pub fn set_tool(&self, host: &str, tool: Option<&str>) {
        self.with(|s| {
            s.tools.insert(host.to_string(), tool.map(str::to_string));
        });
    }

    pub fn fail_remove(&self, fail: bool) {
        self.with(|s| s.fail_remove = fail);
    }

    pub fn fail_add(&self, fail: bool) {
        self.with(|s| s.fail_add = fail);
    }

    pub fn fail_announce(&self, fail: bool) {
        self.with(|s| s.fail_announce = fail);
    }
}

#[async_trait]
impl HostNetwork for FakeNetwork {
    async fn vip_owned_by(&self, host: &str) -> Result<bool> {
        Ok(self.with(|s| s.owners.contains(host)))
    }

    async fn add_vip(&self, host: &str) -> Result<bool> {
        self.journal.record(format!("add_vip {}", host));
        Ok(self.with(|s| !s.fail_add && s.owners.insert(host.to_string())))
    }

    async fn remove_vip(&self, host: &str) -> Result<bool> {
        self.journal.record(format!("remove_vip {}", host));
        Ok(self.with(|s| !s.fail_remove && s.owners.remove(host)))
    }

    async fn announce_vip(&self, host: &str) -> Result<bool> {
        self.journal.record(format!("announce_vip {}", host));
        Ok(self.with(|s| !s.fail_announce))
    }

    async fn announce_tool(&self, host: &str) -> Result<Option<String>> {
        Ok(self.with(|s| s.tools.get(host).cloned().flatten()))
    }

    async fn short_hostname(&self, host: &str) -> Result<Option<String>> {
        Ok(host.split('.').next().map(|h| format!("{}-box", h)))
    }
}

/// Operator with a canned answer
#[derive(Debug, Clone)]
pub struct FakeOperator {
    answer: bool,
    questions: Arc<Mutex<Vec<String>>>,
    interrupt: Option<CancellationToken>,
}

impl FakeOperator {
    pub fn answering(answer: bool) -> Self {
        Self {
            answer,
            questions: Arc::default(),
            interrupt: None,
        }
    }

    /// Fire `token` while the question is open, as Ctrl-C at the prompt would
    pub fn interrupted_by(mut self, token: CancellationToken) -> Self {
        self.interrupt = Some(token);
        self
    }

    /// Questions asked so far
    pub fn questions(&self) -> Vec<String> {
        self.questions.lock().unwrap().clone()
    }
}

impl Operator for FakeOperator {
    fn confirm(&self, question: &str) -> Result<bool> {
        self.questions.lock().unwrap().push(question.to_string());
        if let Some(token) = &self.interrupt {
            token.cancel();
        }
        Ok(self.answer)
    }
}

/// A primary on `redis-a` holding the floating IP and a healthy replica on `redis-b`
pub struct FakeCluster {
    pub primary: FakeStore,
    pub replica: FakeStore,
    pub network: FakeNetwork,
    pub journal: Journal,
}

impl FakeCluster {
    pub fn healthy() -> Self {
        let journal = Journal::default();
        let (bus, _) = broadcast::channel(16);
        Self {
            primary: FakeStore::new("redis-a", FakeNodeState::primary(), bus.clone(), journal.clone()),
            replica: FakeStore::new("redis-b", FakeNodeState::replica(), bus, journal.clone()),
            network: FakeNetwork::new(["redis-a", "redis-b"], "redis-a", journal.clone()),
            journal,
        }
    }

    /// Nodes in configuration order
    pub fn nodes(&self) -> [Node; 2] {
        [
            Node::new(NodeConfig::new("redis-a", 6379), Arc::new(self.primary.clone())),
            Node::new(NodeConfig::new("redis-b", 6379), Arc::new(self.replica.clone())),
        ]
    }

    /// Nodes already resolved into their slots
    pub fn pair(&self) -> Pair {
        let [primary, replica] = self.nodes();
        Pair { primary, replica }
    }
}
