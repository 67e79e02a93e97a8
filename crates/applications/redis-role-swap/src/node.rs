//! Node handles
//!
//! A [`Node`] pairs the configured identity of one Redis instance with the
//! [`DataStore`] capability used to talk to it. Role attributes are derived
//! on every call; nothing is cached between probes.

use crate::config::NodeConfig;
use crate::error::Result;
use crate::network::HostNetwork;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Config key that gates writes on a replica
pub const READ_ONLY_CONFIG_KEY: &str = "slave-read-only";

/// Role of a node in the pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Accepts writes and owns the floating IP
    Primary,
    /// Follows the primary
    Replica,
}

impl Role {
    /// Lowercase label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Replica => "replica",
        }
    }

    /// Parse the `role:` field of `INFO replication`
    pub fn from_info(s: &str) -> Option<Self> {
        match s {
            "master" => Some(Self::Primary),
            "slave" | "replica" => Some(Self::Replica),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Link state between a replica and its primary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    /// Initial sync completed and the link is established
    Up,
    /// Link is down or still syncing
    Down,
    /// Node is not a replica
    NotApplicable,
}

/// Replication status as reported by the node itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationStatus {
    /// Self-reported replication role
    pub role: Role,
    /// Link status to the primary
    pub link_status: LinkStatus,
}

impl ReplicationStatus {
    /// Parse the body of `INFO replication`
    pub fn from_info(info: &str) -> Option<Self> {
        let mut role = None;
        let mut link_status = LinkStatus::NotApplicable;

        for line in info.lines() {
            let Some((key, value)) = line.trim().split_once(':') else {
                continue;
            };
            match key {
                "role" => role = Role::from_info(value.trim()),
                "master_link_status" => {
                    link_status = if value.trim() == "up" {
                        LinkStatus::Up
                    } else {
                        LinkStatus::Down
                    };
                }
                _ => {}
            }
        }

        let role = role?;
        if role == Role::Replica && link_status == LinkStatus::NotApplicable {
            link_status = LinkStatus::Down;
        }
        Some(Self { role, link_status })
    }
}

/// Capabilities of one data-store endpoint.
///
/// Every call opens whatever connection it needs and releases it before
/// returning, so subscriptions and monitor sessions never outlive the call.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Self-reported replication role and link status
    async fn replication_status(&self) -> Result<ReplicationStatus>;

    /// Whether writes are currently refused by this node
    async fn read_only(&self) -> Result<bool>;

    /// Read a server setting
    async fn get_config(&self, key: &str) -> Result<Option<String>>;

    /// Change a server setting
    async fn set_config(&self, key: &str, value: &str) -> Result<()>;

    /// Publish a message
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe and return the first message, or `None` after `wait`
    async fn subscribe_once(&self, channel: &str, wait: Duration) -> Result<Option<String>>;

    /// Watch the command stream and return the first command seen, or
    /// `None` if nothing arrived within `wait`
    async fn observe_commands(&self, wait: Duration) -> Result<Option<String>>;

    /// Stop replicating and become a standalone primary
    async fn detach_from_primary(&self) -> Result<()>;

    /// Shut the server process down
    async fn shutdown(&self) -> Result<()>;

    /// Server version string
    async fn server_version(&self) -> Result<String>;
}

/// One Redis instance of the pair
#[derive(Clone)]
pub struct Node {
    config: NodeConfig,
    store: Arc<dyn DataStore>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .finish()
    }
}

impl Node {
    /// Create a node from its config and data-store handle
    pub fn new(config: NodeConfig, store: Arc<dyn DataStore>) -> Self {
        Self { config, store }
    }

    /// Host used for network operations
    pub fn host(&self) -> &str {
        &self.config.host
    }

    /// `host:port`
    pub fn name(&self) -> String {
        self.config.display_name()
    }

    /// Data-store capability
    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    /// Role from the node's own replication report
    pub async fn replication_role(&self) -> Result<Role> {
        Ok(self.store.replication_status().await?.role)
    }

    /// Role from floating IP ownership
    pub async fn vip_role(&self, network: &dyn HostNetwork) -> Result<Role> {
        if network.vip_owned_by(self.host()).await? {
            Ok(Role::Primary)
        } else {
            Ok(Role::Replica)
        }
    }

    /// Write-gate state
    pub async fn read_only(&self) -> Result<bool> {
        self.store.read_only().await
    }

    /// Path to the announce tool on this host
    pub async fn announce_tool_path(&self, network: &dyn HostNetwork) -> Result<Option<String>> {
        network.announce_tool(self.host()).await
    }
}

/// Effective role rule
pub fn combine_roles(replication: Role, vip: Role) -> Role {
    if replication == Role::Primary && vip == Role::Primary {
        Role::Primary
    } else {
        Role::Replica
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_replica_info() {
        let info = "# Replication\r\nrole:slave\r\nmaster_host:10.0.0.1\r\nmaster_link_status:up\r\n";
        let status = ReplicationStatus::from_info(info).unwrap();

        assert_eq!(status.role, Role::Replica);
        assert_eq!(status.link_status, LinkStatus::Up);
    }

    #[test]
    fn test_parse_replica_link_down() {
        let info = "role:slave\nmaster_link_status:down\n";
        let status = ReplicationStatus::from_info(info).unwrap();
        assert_eq!(status.link_status, LinkStatus::Down);
    }

    #[test]
    fn test_replica_without_link_field_is_down() {
        let status = ReplicationStatus::from_info("role:slave\n").unwrap();
        assert_eq!(status.link_status, LinkStatus::Down);
    }

    #[test]
    fn test_parse_primary_info() {
        let info = "# Replication\nrole:master\nconnected_slaves:1\n";
        let status = ReplicationStatus::from_info(info).unwrap();

        assert_eq!(status.role, Role::Primary);
        assert_eq!(status.link_status, LinkStatus::NotApplicable);
    }

    #[test]
    fn test_parse_info_without_role() {
        assert!(ReplicationStatus::from_info("connected_slaves:0\n").is_none());
    }

    #[test]
    fn test_effective_role_requires_both_signals() {
        assert_eq!(combine_roles(Role::Primary, Role::Primary), Role::Primary);
        assert_eq!(combine_roles(Role::Primary, Role::Replica), Role::Replica);
        assert_eq!(combine_roles(Role::Replica, Role::Primary), Role::Replica);
        assert_eq!(combine_roles(Role::Replica, Role::Replica), Role::Replica);
    }
}
