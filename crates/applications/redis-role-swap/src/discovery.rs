//! Topology discovery
//!
//! Resolves the two configured nodes into a `(primary, replica)` pair.
//!
//! ## How It Works
//!
//! 1. Each node reports its replication role (`INFO replication`)
//! 2. The network layer reports whether the node holds the floating IP
//! 3. A node is the primary only if both signals say so
//! 4. Exactly one primary and one replica must come out, anything else is
//!    a configuration error
//!
//! Discovery never mutates anything and can be repeated at will.

use crate::error::{Result, RoleSwapError};
use crate::network::HostNetwork;
use crate::node::{Node, Role, combine_roles};
use serde::Serialize;
use std::fmt;
use tracing::info;

/// The two nodes, resolved into their slots
#[derive(Debug, Clone)]
pub struct Pair {
    /// Current primary (becomes the replica)
    pub primary: Node,
    /// Current replica (becomes the primary)
    pub replica: Node,
}

/// What discovery learned about one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeReport {
    /// `host:port`
    pub name: String,
    /// Short hostname reported by the machine, when it could be fetched
    pub hostname: Option<String>,
    /// Self-reported replication role
    pub replication_role: Role,
    /// Role according to floating IP ownership
    pub vip_role: Role,
    /// Role both signals agree on
    pub effective_role: Role,
    /// Server version
    pub version: String,
    /// Write-gate state
    pub read_only: bool,
    /// Announce tool on that host
    pub announce_tool: Option<String>,
}

impl fmt::Display for NodeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = capitalize(self.effective_role.as_str());
        match &self.hostname {
            Some(hostname) => writeln!(f, "{}: {} ({})", role, hostname, self.name)?,
            None => writeln!(f, "{}: {}", role, self.name)?,
        }
        writeln!(f, "  Replication role: {}", self.replication_role)?;
        writeln!(f, "  Floating IP role: {}", self.vip_role)?;
        writeln!(f, "  Redis version:    {}", self.version)?;
        writeln!(f, "  Read-only:        {}", self.read_only)?;
        write!(
            f,
            "  Arping path:      {}",
            self.announce_tool.as_deref().unwrap_or("not found")
        )
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Probe all attributes of one node, mapping any failure to a discovery error
pub async fn inspect(node: &Node, network: &dyn HostNetwork) -> Result<NodeReport> {
    let name = node.name();
    let fail = |e: RoleSwapError| RoleSwapError::discovery(&name, e);

    let replication_role = node.replication_role().await.map_err(fail)?;
    let vip_role = node.vip_role(network).await.map_err(fail)?;
    let version = node.store().server_version().await.map_err(fail)?;
    let read_only = node.read_only().await.map_err(fail)?;
    let announce_tool = node.announce_tool_path(network).await.map_err(fail)?;

    // Cosmetic, never fails discovery
    let hostname = network.short_hostname(node.host()).await.ok().flatten();

    Ok(NodeReport {
        name: name.clone(),
        hostname,
        replication_role,
        vip_role,
        effective_role: combine_roles(replication_role, vip_role),
        version,
        read_only,
        announce_tool,
    })
}

/// Classify two effective roles into primary/replica slot indices
pub fn classify(roles: [Role; 2]) -> Result<(usize, usize)> {
    match roles {
        [Role::Primary, Role::Replica] => Ok((0, 1)),
        [Role::Replica, Role::Primary] => Ok((1, 0)),
        [Role::Primary, Role::Primary] => Err(RoleSwapError::AmbiguousTopology {
            duplicated: Role::Primary.as_str(),
            missing: Role::Replica.as_str(),
        }),
        [Role::Replica, Role::Replica] => Err(RoleSwapError::AmbiguousTopology {
            duplicated: Role::Replica.as_str(),
            missing: Role::Primary.as_str(),
        }),
    }
}

/// Resolve two nodes into a validated pair
pub async fn discover(nodes: [Node; 2], network: &dyn HostNetwork) -> Result<(Pair, Vec<NodeReport>)> {
    info!(
        first = %nodes[0].name(),
        second = %nodes[1].name(),
        "Discovering topology"
    );

    let mut reports = Vec::with_capacity(2);
    for node in &nodes {
        let report = inspect(node, network).await?;
        info!(
            node = %report.name,
            replication_role = %report.replication_role,
            vip_role = %report.vip_role,
            effective_role = %report.effective_role,
            version = %report.version,
            read_only = report.read_only,
            announce_tool = ?report.announce_tool,
            "Inspected node"
        );
        reports.push(report);
    }

    let (primary_idx, _) = classify([reports[0].effective_role, reports[1].effective_role])?;

    if primary_idx == 1 {
        reports.swap(0, 1);
    }

    let [first, second] = nodes;
    let (primary, replica) = if primary_idx == 0 {
        (first, second)
    } else {
        (second, first)
    };

    info!(primary = %primary.name(), replica = %replica.name(), "Topology resolved");

    Ok((Pair { primary, replica }, reports))
}
