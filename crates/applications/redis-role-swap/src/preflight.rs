//! Preflight checks
//!
//! Nothing is mutated before the pair passes these checks:
//! - the primary accepts writes
//! - the replica refuses writes
//! - both hosts have an `arping` binary for the gratuitous announcement

use crate::discovery::Pair;
use crate::error::{Result, RoleSwapError};
use crate::network::HostNetwork;
use std::fmt;
use tracing::{error, info};

/// A violated preflight clause
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreflightViolation {
    /// The primary is refusing writes
    PrimaryReadOnly,
    /// The replica accepts writes
    ReplicaWritable,
    /// No announce tool on the primary host
    PrimaryAnnounceToolMissing,
    /// No announce tool on the replica host
    ReplicaAnnounceToolMissing,
}

impl fmt::Display for PreflightViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::PrimaryReadOnly => "primary is read-only (expected writable)",
            Self::ReplicaWritable => "replica is writable (expected read-only)",
            Self::PrimaryAnnounceToolMissing => "cannot find the arping binary on the primary",
            Self::ReplicaAnnounceToolMissing => "cannot find the arping binary on the replica",
        };
        f.write_str(msg)
    }
}

/// Observed facts the preflight invariant is evaluated on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightFacts {
    /// Primary write-gate state
    pub primary_read_only: bool,
    /// Replica write-gate state
    pub replica_read_only: bool,
    /// Announce tool on the primary host
    pub primary_announce_tool: Option<String>,
    /// Announce tool on the replica host
    pub replica_announce_tool: Option<String>,
}

impl PreflightFacts {
    /// Gather facts from the live pair
    pub async fn gather(pair: &Pair, network: &dyn HostNetwork) -> Result<Self> {
        Ok(Self {
            primary_read_only: pair.primary.read_only().await?,
            replica_read_only: pair.replica.read_only().await?,
            primary_announce_tool: pair.primary.announce_tool_path(network).await?,
            replica_announce_tool: pair.replica.announce_tool_path(network).await?,
        })
    }

    /// Every violated clause, in check order
    pub fn violations(&self) -> Vec<PreflightViolation> {
        let mut violations = Vec::new();
        if self.primary_read_only {
            violations.push(PreflightViolation::PrimaryReadOnly);
        }
        if !self.replica_read_only {
            violations.push(PreflightViolation::ReplicaWritable);
        }
        if self.primary_announce_tool.is_none() {
            violations.push(PreflightViolation::PrimaryAnnounceToolMissing);
        }
        if self.replica_announce_tool.is_none() {
            violations.push(PreflightViolation::ReplicaAnnounceToolMissing);
        }
        violations
    }

    /// `Ok` if the invariant holds, otherwise the first violated clause
    pub fn check(&self) -> Result<()> {
        match self.violations().first() {
            None => Ok(()),
            Some(first) => Err(RoleSwapError::PreflightFailed(*first)),
        }
    }
}

/// Run the preflight checks against the live pair
pub async fn run_preflight(pair: &Pair, network: &dyn HostNetwork) -> Result<()> {
    let facts = PreflightFacts::gather(pair, network).await?;
    let violations = facts.violations();

    if violations.is_empty() {
        info!(
            primary = %pair.primary.name(),
            replica = %pair.replica.name(),
            "Preflight checks passed"
        );
    } else {
        for violation in &violations {
            error!(violation = %violation, "Preflight check failed");
        }
    }

    facts.check()
}
