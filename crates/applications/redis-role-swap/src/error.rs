//! Error types for the role swap

use std::time::Duration;
use thiserror::Error;

use crate::preflight::PreflightViolation;
use crate::state::{Event, FailoverState};

/// Role swap result type
pub type Result<T> = std::result::Result<T, RoleSwapError>;

/// Process exit codes, one per failure category.
pub mod exit_code {
    /// Full success, or a successful `--check` run
    pub const SUCCESS: i32 = 0;
    /// Bad configuration file, ambiguous topology or discovery failure
    pub const CONFIG: i32 = 1;
    /// Preflight invariant violated
    pub const PREFLIGHT: i32 = 2;
    /// Operator answered no at the confirmation prompt
    pub const DECLINED: i32 = 3;
    /// Replica not caught up at the initial lag probe
    pub const REPLICATION_NOT_READY: i32 = 4;
    /// Removing or adding the floating IP failed
    pub const VIP: i32 = 5;
    /// Any other failure after the floating IP left the old primary
    pub const POST_COMMIT: i32 = 6;
}

/// Errors that can occur while swapping roles
#[derive(Error, Debug)]
pub enum RoleSwapError {
    /// Redis client error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML configuration could not be parsed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Both nodes claim the same effective role
    #[error("Ambiguous topology: both nodes look to have the {duplicated} role, no {missing} available")]
    AmbiguousTopology {
        /// The role reported by both nodes
        duplicated: &'static str,
        /// The role nobody reported
        missing: &'static str,
    },

    /// A probe failed while resolving a node's role
    #[error("Discovery failed on {node}: {reason}")]
    Discovery {
        /// Node display name
        node: String,
        /// Underlying failure
        reason: String,
    },

    /// Preflight invariant violated
    #[error("Preflight failed: {0}")]
    PreflightFailed(PreflightViolation),

    /// Replica is not caught up with the primary
    #[error("Replication is not up to date, or the replica is not running. Please catch up before changing roles")]
    ReplicationNotReady,

    /// Operator declined the swap
    #[error("Operator declined the role swap")]
    Declined,

    /// Could not release the floating IP from the old primary
    #[error("Failed to remove floating IP from {host}")]
    VipRemoveFailed {
        /// Old primary host
        host: String,
    },

    /// Could not claim the floating IP on the new primary
    #[error("Failed to add floating IP to {host}; the floating IP is now unclaimed")]
    VipAddFailed {
        /// New primary host
        host: String,
    },

    /// A step after the commit point failed; earlier steps stand
    #[error("Step {state} failed after the floating IP was released: {reason}")]
    PostCommit {
        /// The state whose entry action failed
        state: FailoverState,
        /// Underlying failure
        reason: String,
    },

    /// Event not declared for the current state
    #[error("Event {event:?} is not accepted in state {state}")]
    InvalidTransition {
        /// Current state, left unchanged
        state: FailoverState,
        /// Rejected event
        event: Event,
    },

    /// Timeout
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Run was interrupted by the operator; after the commit point it is
    /// reported inside [`RoleSwapError::PostCommit`]
    #[error("Cancelled")]
    Cancelled,

    /// Remote command could not be executed
    #[error("Remote execution error: {0}")]
    RemoteExec(String),
}

impl RoleSwapError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a discovery error for a node
    pub fn discovery(node: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Discovery {
            node: node.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a remote execution error
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::RemoteExec(msg.into())
    }

    /// Exit code the process should terminate with for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_)
            | Self::Yaml(_)
            | Self::AmbiguousTopology { .. }
            | Self::Discovery { .. } => exit_code::CONFIG,
            Self::PreflightFailed(_) => exit_code::PREFLIGHT,
            Self::Declined | Self::Cancelled => exit_code::DECLINED,
            Self::ReplicationNotReady => exit_code::REPLICATION_NOT_READY,
            Self::VipRemoveFailed { .. } | Self::VipAddFailed { .. } => exit_code::VIP,
            Self::PostCommit { .. } | Self::Timeout(_) => exit_code::POST_COMMIT,
            // Raised outside the state machine, i.e. before any mutation
            Self::Redis(_) | Self::Io(_) | Self::RemoteExec(_) | Self::InvalidTransition { .. } => {
                exit_code::CONFIG
            }
        }
    }
}
