//! Role swap state machine
//!
//! States are explicit and enumerable, transitions are a pure function of
//! `(state, event)`, and every state names the entry action the orchestrator
//! must run before any event is delivered.
//!
//! ```text
//! Unknown ─► ConfigOk ─► ClusterReady ─► Switching ─► SettingPrimaryReadonly
//!   │           │             │             │                 │
//!   ▼           ▼             ▼             ▼                 ▼
//! ConfigFailed  ReplicationNotReady  Aborted  VipFailed  SettingReplicaWritable
//!                                                             │
//!                                     VipAddFailed ◄─ AddingVipToReplica
//!                                                             │
//!                                                  Announcing ─► VerifyingQuiescence
//!                                                                        │
//!                                   Done ◄─ ShuttingDownOldPrimary ◄─ Promoting
//! ```

use crate::error::{Result, RoleSwapError};
use serde::Serialize;
use std::fmt;

/// Every state of a role swap run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverState {
    /// Initial state
    Unknown,
    /// Preflight failed (terminal)
    ConfigFailed,
    /// Preflight passed
    ConfigOk,
    /// Replica not caught up (terminal)
    ReplicationNotReady,
    /// Ready for the operator's go-ahead
    ClusterReady,
    /// Operator declined (terminal)
    Aborted,
    /// Releasing the floating IP from the old primary
    Switching,
    /// Floating IP could not be released (terminal)
    VipFailed,
    /// Gating writes on the old primary
    SettingPrimaryReadonly,
    /// Opening writes on the replica
    SettingReplicaWritable,
    /// Claiming the floating IP on the replica host
    AddingVipToReplica,
    /// Floating IP could not be claimed (terminal, floating IP unowned)
    VipAddFailed,
    /// Gratuitous ARP from the replica host
    Announcing,
    /// Waiting for quiescence and catch-up
    VerifyingQuiescence,
    /// Detaching the replica from the old primary
    Promoting,
    /// Stopping the old primary
    ShuttingDownOldPrimary,
    /// Swap complete (terminal)
    Done,
}

/// Events produced by entry actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    /// Preflight failed
    BadConfig,
    /// Preflight passed
    GoodConfig,
    /// Lag probe not caught up
    NotReady,
    /// Lag probe caught up
    Ready,
    /// Operator said no
    Declined,
    /// Operator said yes
    Confirmed,
    /// `ip addr del` failed
    VipRemoveFailed,
    /// `ip addr del` succeeded
    VipRemoved,
    /// Old primary is read-only
    PrimaryReadonlySet,
    /// Replica is writable
    ReplicaWritableSet,
    /// `ip addr add` failed
    VipAddFailed,
    /// `ip addr add` succeeded
    VipAdded,
    /// Announcement sent
    Announced,
    /// Old primary quiet and replica caught up
    Verified,
    /// Replica detached and standalone
    Promoted,
    /// Old primary stopped
    OldPrimaryShutDown,
}

/// Entry action the orchestrator performs on entering a state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Run the preflight checker
    RunPreflight,
    /// Run the lag probe
    ProbeLag,
    /// Ask the operator
    RequestConfirmation,
    /// Remove the floating IP from the old primary
    RemoveVip,
    /// Set the old primary read-only
    SetPrimaryReadonly,
    /// Clear read-only on the replica
    SetReplicaWritable,
    /// Add the floating IP to the replica host
    AddVip,
    /// Gratuitous ARP from the replica host
    Announce,
    /// Run the quiescence verifier
    VerifyQuiescence,
    /// Detach the replica from the old primary
    Promote,
    /// Shut the old primary down
    ShutdownOldPrimary,
}

impl FailoverState {
    /// Entry action, `None` for terminal states
    pub fn entry_action(self) -> Option<Action> {
        use FailoverState::*;
        match self {
            Unknown => Some(Action::RunPreflight),
            ConfigOk => Some(Action::ProbeLag),
            ClusterReady => Some(Action::RequestConfirmation),
            Switching => Some(Action::RemoveVip),
            SettingPrimaryReadonly => Some(Action::SetPrimaryReadonly),
            SettingReplicaWritable => Some(Action::SetReplicaWritable),
            AddingVipToReplica => Some(Action::AddVip),
            Announcing => Some(Action::Announce),
            VerifyingQuiescence => Some(Action::VerifyQuiescence),
            Promoting => Some(Action::Promote),
            ShuttingDownOldPrimary => Some(Action::ShutdownOldPrimary),
            ConfigFailed | ReplicationNotReady | Aborted | VipFailed | VipAddFailed | Done => None,
        }
    }

    /// No outgoing transitions
    pub fn is_terminal(self) -> bool {
        self.entry_action().is_none()
    }

    /// Whether the floating IP has already left the old primary
    pub fn is_committed(self) -> bool {
        use FailoverState::*;
        matches!(
            self,
            SettingPrimaryReadonly
                | SettingReplicaWritable
                | AddingVipToReplica
                | VipAddFailed
                | Announcing
                | VerifyingQuiescence
                | Promoting
                | ShuttingDownOldPrimary
                | Done
        )
    }

    /// Events this state accepts
    pub fn accepted_events(self) -> &'static [Event] {
        use FailoverState::*;
        match self {
            Unknown => &[Event::BadConfig, Event::GoodConfig],
            ConfigOk => &[Event::NotReady, Event::Ready],
            ClusterReady => &[Event::Declined, Event::Confirmed],
            Switching => &[Event::VipRemoveFailed, Event::VipRemoved],
            SettingPrimaryReadonly => &[Event::PrimaryReadonlySet],
            SettingReplicaWritable => &[Event::ReplicaWritableSet],
            AddingVipToReplica => &[Event::VipAddFailed, Event::VipAdded],
            Announcing => &[Event::Announced],
            VerifyingQuiescence => &[Event::Verified],
            Promoting => &[Event::Promoted],
            ShuttingDownOldPrimary => &[Event::OldPrimaryShutDown],
            ConfigFailed | ReplicationNotReady | Aborted | VipFailed | VipAddFailed | Done => &[],
        }
    }

    /// snake_case label
    pub fn as_str(self) -> &'static str {
        use FailoverState::*;
        match self {
            Unknown => "unknown",
            ConfigFailed => "config_failed",
            ConfigOk => "config_ok",
            ReplicationNotReady => "replication_not_ready",
            ClusterReady => "cluster_ready",
            Aborted => "aborted",
            Switching => "switching",
            VipFailed => "vip_failed",
            SettingPrimaryReadonly => "setting_primary_readonly",
            SettingReplicaWritable => "setting_replica_writable",
            AddingVipToReplica => "adding_vip_to_replica",
            VipAddFailed => "vip_add_failed",
            Announcing => "announcing",
            VerifyingQuiescence => "verifying_quiescence",
            Promoting => "promoting",
            ShuttingDownOldPrimary => "shutting_down_old_primary",
            Done => "done",
        }
    }
}

impl fmt::Display for FailoverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Next state for `event` in `state`, or an error leaving `state` as it was
pub fn transition(state: FailoverState, event: Event) -> Result<FailoverState> {
    use FailoverState as S;
    let next = match (state, event) {
        (S::Unknown, Event::BadConfig) => S::ConfigFailed,
        (S::Unknown, Event::GoodConfig) => S::ConfigOk,
        (S::ConfigOk, Event::NotReady) => S::ReplicationNotReady,
        (S::ConfigOk, Event::Ready) => S::ClusterReady,
        (S::ClusterReady, Event::Declined) => S::Aborted,
        (S::ClusterReady, Event::Confirmed) => S::Switching,
        (S::Switching, Event::VipRemoveFailed) => S::VipFailed,
        (S::Switching, Event::VipRemoved) => S::SettingPrimaryReadonly,
        (S::SettingPrimaryReadonly, Event::PrimaryReadonlySet) => S::SettingReplicaWritable,
        (S::SettingReplicaWritable, Event::ReplicaWritableSet) => S::AddingVipToReplica,
        (S::AddingVipToReplica, Event::VipAddFailed) => S::VipAddFailed,
        (S::AddingVipToReplica, Event::VipAdded) => S::Announcing,
        (S::Announcing, Event::Announced) => S::VerifyingQuiescence,
        (S::VerifyingQuiescence, Event::Verified) => S::Promoting,
        (S::Promoting, Event::Promoted) => S::ShuttingDownOldPrimary,
        (S::ShuttingDownOldPrimary, Event::OldPrimaryShutDown) => S::Done,
        _ => return Err(RoleSwapError::InvalidTransition { state, event }),
    };
    Ok(next)
}

/// Owner of the current state; only moves through [`transition`]
#[derive(Debug)]
pub struct StateMachine {
    state: FailoverState,
    history: Vec<FailoverState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Start in [`FailoverState::Unknown`]
    pub fn new() -> Self {
        Self {
            state: FailoverState::Unknown,
            history: vec![FailoverState::Unknown],
        }
    }

    /// Current state
    pub fn state(&self) -> FailoverState {
        self.state
    }

    /// Every state entered so far, in order
    pub fn history(&self) -> &[FailoverState] {
        &self.history
    }

    /// Deliver an event; the state is unchanged on error
    pub fn fire(&mut self, event: Event) -> Result<FailoverState> {
        let next = transition(self.state, event)?;
        self.state = next;
        self.history.push(next);
        Ok(next)
    }
}
