//! Role swap orchestration
//!
//! Drives the state machine in [`crate::state`] against a discovered pair:
//!
//! ```text
//! Preflight ─► Lag probe ─► Operator confirmation
//!     │
//!     ├── 1. Remove floating IP from old primary   (commit point)
//!     ├── 2. CONFIG SET slave-read-only yes on old primary
//!     ├── 3. CONFIG SET slave-read-only no on replica
//!     ├── 4. Add floating IP to replica host
//!     ├── 5. Gratuitous ARP from replica host
//!     ├── 6. Wait for quiescence and catch-up
//!     ├── 7. SLAVEOF NO ONE on replica
//!     └── 8. SHUTDOWN old primary
//! ```
//!
//! ## Key Design Decisions
//!
//! - **Remove before add**: the floating IP is released before any write
//!   gate flips, so two nodes never accept writes through it at once
//! - **Single gate**: the operator is asked exactly once, before any mutation
//! - **Forward only**: after the commit point failures are reported, never
//!   compensated

use crate::config::{ClusterConfig, Timings};
use crate::discovery::Pair;
use crate::error::{Result, RoleSwapError, exit_code};
use crate::lag::{LagProbe, LagSample};
use crate::network::HostNetwork;
use crate::node::READ_ONLY_CONFIG_KEY;
use crate::operator::Operator;
use crate::preflight::run_preflight;
use crate::quiescence::{QuiescenceReport, QuiescenceVerifier};
use crate::state::{Action, Event, FailoverState, StateMachine};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Question put to the operator at the confirmation gate
pub const CONFIRMATION_QUESTION: &str = "You ready to switch the roles";

/// Shown right before the confirmation prompt
pub const LUA_WARNING: &str =
    "Before you switch the primary, make sure all Lua scripts are loaded on the replica!";

/// Configuration for the failover manager
#[derive(Debug, Clone, Default)]
pub struct FailoverConfig {
    /// Stop before the confirmation prompt
    pub check_only: bool,

    /// Probe and retry timings
    pub timings: Timings,

    /// Upper bound for quiescence verification
    pub verify_deadline: Option<Duration>,
}

impl FailoverConfig {
    /// Take timings and deadline from the cluster config
    pub fn from_cluster(cluster: &ClusterConfig) -> Self {
        Self {
            check_only: false,
            timings: cluster.timings,
            verify_deadline: cluster.verify_deadline,
        }
    }

    /// Set check-only mode
    pub fn with_check_only(mut self, check_only: bool) -> Self {
        self.check_only = check_only;
        self
    }

    /// Set timings
    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Set verification deadline
    pub fn with_verify_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.verify_deadline = deadline;
        self
    }
}

/// Result of a role swap run
#[derive(Debug, Clone, Serialize)]
pub struct FailoverResult {
    /// Whether the run reached its goal (full swap, or check-only pass)
    pub success: bool,

    /// Run stopped before the confirmation prompt
    pub check_only: bool,

    /// State the run ended in
    pub final_state: FailoverState,

    /// Every state entered, in order
    pub states: Vec<FailoverState>,

    /// Primary before the swap
    pub old_primary: String,

    /// Replica before the swap
    pub new_primary: String,

    /// Lag measured before asking the operator
    pub initial_lag: Option<LagSample>,

    /// Outcome of quiescence verification
    pub quiescence: Option<QuiescenceReport>,

    /// Total run time in seconds
    pub total_time_secs: f64,

    /// Error message if failed
    pub error: Option<String>,

    /// Process exit code for this outcome
    pub exit_code: i32,
}

/// Drives one role swap
pub struct FailoverManager {
    config: FailoverConfig,
    pair: Pair,
    network: Arc<dyn HostNetwork>,
    operator: Arc<dyn Operator>,
    cancel: CancellationToken,
    machine: StateMachine,
    failure: Option<RoleSwapError>,
    initial_lag: Option<LagSample>,
    quiescence: Option<QuiescenceReport>,
}

impl FailoverManager {
    /// Create a manager for a discovered pair
    pub fn new(
        config: FailoverConfig,
        pair: Pair,
        network: Arc<dyn HostNetwork>,
        operator: Arc<dyn Operator>,
    ) -> Self {
        Self {
            config,
            pair,
            network,
            operator,
            cancel: CancellationToken::new(),
            machine: StateMachine::new(),
            failure: None,
            initial_lag: None,
            quiescence: None,
        }
    }

    /// Stop before the commit point, or abort verification after it, when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Current state
    pub fn state(&self) -> FailoverState {
        self.machine.state()
    }

    /// Run until a terminal state, a failed step, or the check-only stop
    pub async fn run(&mut self) -> FailoverResult {
        let start = Instant::now();
        let mut checked_only = false;
        let mut step_error = None;

        info!(
            primary = %self.pair.primary.name(),
            replica = %self.pair.replica.name(),
            check_only = self.config.check_only,
            "Starting role swap"
        );

        while let Some(action) = self.machine.state().entry_action() {
            let state = self.machine.state();

            if action == Action::RequestConfirmation && self.config.check_only {
                info!("Check-only run, stopping before confirmation");
                checked_only = true;
                break;
            }

            // Once committed, only the verifier observes the token
            if !state.is_committed() && self.cancel.is_cancelled() {
                warn!(state = %state, "Interrupted before the floating IP was released, stopping");
                step_error = Some(RoleSwapError::Cancelled);
                break;
            }

            info!(state = %state, action = ?action, "Entering state");
            let event = match self.perform(action).await {
                Ok(event) => event,
                Err(e) => {
                    let e = if state.is_committed() {
                        RoleSwapError::PostCommit {
                            state,
                            reason: e.to_string(),
                        }
                    } else {
                        e
                    };
                    error!(state = %state, error = %e, "Step failed");
                    step_error = Some(e);
                    break;
                }
            };

            if let Err(e) = self.machine.fire(event) {
                error!(error = %e, "Rejected transition");
                step_error = Some(e);
                break;
            }
        }

        let final_state = self.machine.state();
        let error = step_error.or_else(|| self.failure.take());
        let success = error.is_none() && (checked_only || final_state == FailoverState::Done);
        let exit_code = error.as_ref().map_or(exit_code::SUCCESS, RoleSwapError::exit_code);
        let total_time_secs = start.elapsed().as_secs_f64();

        if success {
            info!(final_state = %final_state, total_time_secs, "Role swap finished");
        } else {
            error!(
                final_state = %final_state,
                exit_code,
                committed = final_state.is_committed(),
                "Role swap failed"
            );
        }

        FailoverResult {
            success,
            check_only: checked_only,
            final_state,
            states: self.machine.history().to_vec(),
            old_primary: self.pair.primary.name(),
            new_primary: self.pair.replica.name(),
            initial_lag: self.initial_lag,
            quiescence: self.quiescence.clone(),
            total_time_secs,
            error: error.map(|e| e.to_string()),
            exit_code,
        }
    }

    /// Run one entry action and translate its outcome into an event
    async fn perform(&mut self, action: Action) -> Result<Event> {
        let primary = self.pair.primary.clone();
        let replica = self.pair.replica.clone();

        match action {
            Action::RunPreflight => match run_preflight(&self.pair, self.network.as_ref()).await {
                Ok(()) => Ok(Event::GoodConfig),
                Err(e @ RoleSwapError::PreflightFailed(_)) => {
                    self.failure = Some(e);
                    Ok(Event::BadConfig)
                }
                Err(e) => Err(e),
            },

            Action::ProbeLag => {
                let probe = LagProbe::from_timings(&self.config.timings);
                let sample = probe.probe(&replica, &primary).await;
                self.initial_lag = Some(sample);
                if probe.is_caught_up(&sample) {
                    info!(lag = %sample, "Replication is ready");
                    Ok(Event::Ready)
                } else {
                    self.failure = Some(RoleSwapError::ReplicationNotReady);
                    Ok(Event::NotReady)
                }
            }

            Action::RequestConfirmation => {
                warn!("{}", LUA_WARNING);
                let operator = self.operator.clone();
                let confirmed =
                    tokio::task::spawn_blocking(move || operator.confirm(CONFIRMATION_QUESTION))
                        .await
                        .map_err(|e| RoleSwapError::Io(std::io::Error::other(e)))??;
                if confirmed {
                    info!("Operator confirmed, switching roles");
                    Ok(Event::Confirmed)
                } else {
                    self.failure = Some(RoleSwapError::Declined);
                    Ok(Event::Declined)
                }
            }

            Action::RemoveVip => match self.network.remove_vip(primary.host()).await {
                Ok(true) => {
                    info!(host = %primary.host(), "Removed floating IP, no one can reach the old primary through it");
                    Ok(Event::VipRemoved)
                }
                outcome => {
                    if let Err(e) = outcome {
                        error!(host = %primary.host(), error = %e, "Cannot run floating IP removal");
                    }
                    self.failure = Some(RoleSwapError::VipRemoveFailed {
                        host: primary.host().to_string(),
                    });
                    Ok(Event::VipRemoveFailed)
                }
            },

            Action::SetPrimaryReadonly => {
                // A primary stays writable regardless; this takes effect once it is demoted
                primary.store().set_config(READ_ONLY_CONFIG_KEY, "yes").await?;
                info!(node = %primary.name(), "Set old primary read-only");
                Ok(Event::PrimaryReadonlySet)
            }

            Action::SetReplicaWritable => {
                replica.store().set_config(READ_ONLY_CONFIG_KEY, "no").await?;
                info!(node = %replica.name(), "Set replica writable");
                Ok(Event::ReplicaWritableSet)
            }

            Action::AddVip => match self.network.add_vip(replica.host()).await {
                Ok(true) => {
                    info!(host = %replica.host(), "Added floating IP to new primary");
                    Ok(Event::VipAdded)
                }
                outcome => {
                    if let Err(e) = outcome {
                        error!(host = %replica.host(), error = %e, "Cannot run floating IP add");
                    }
                    self.failure = Some(RoleSwapError::VipAddFailed {
                        host: replica.host().to_string(),
                    });
                    Ok(Event::VipAddFailed)
                }
            },

            Action::Announce => {
                match self.network.announce_vip(replica.host()).await {
                    Ok(true) => info!(host = %replica.host(), "Announced floating IP"),
                    Ok(false) => warn!(host = %replica.host(), "Floating IP announcement failed"),
                    Err(e) => warn!(host = %replica.host(), error = %e, "Cannot announce floating IP"),
                }
                Ok(Event::Announced)
            }

            Action::VerifyQuiescence => {
                let verifier = QuiescenceVerifier::new(&self.config.timings)
                    .with_deadline(self.config.verify_deadline)
                    .with_cancellation(self.cancel.clone());
                let report = verifier.verify(&primary, &replica).await?;
                self.quiescence = Some(report);
                Ok(Event::Verified)
            }

            Action::Promote => {
                replica.store().detach_from_primary().await?;
                info!(node = %replica.name(), "Promoted replica to primary");
                Ok(Event::Promoted)
            }

            Action::ShutdownOldPrimary => {
                primary.store().shutdown().await?;
                info!(node = %primary.name(), "Shut down old primary");
                Ok(Event::OldPrimaryShutDown)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{LinkStatus, Role};
    use crate::testing::{FakeCluster, FakeOperator};

    fn manager(cluster: &FakeCluster, operator: FakeOperator, config: FailoverConfig) -> FailoverManager {
        FailoverManager::new(
            config,
            cluster.pair(),
            Arc::new(cluster.network.clone()),
            Arc::new(operator),
        )
    }

    #[test]
    fn test_failover_config_builder() {
        let timings = Timings {
            retry_backoff_ms: 250,
            ..Timings::default()
        };
        let config = FailoverConfig::default()
            .with_check_only(true)
            .with_timings(timings)
            .with_verify_deadline(Some(Duration::from_secs(60)));

        assert!(config.check_only);
        assert_eq!(config.verify_deadline, Some(Duration::from_secs(60)));
        assert_eq!(config.timings.retry_backoff(), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_swaps_roles_in_order() {
        let cluster = FakeCluster::healthy();
        cluster.primary.update(|s| s.publish_lag_secs = 0.3);
        let operator = FakeOperator::answering(true);

        let mut mgr = manager(&cluster, operator.clone(), FailoverConfig::default());
        let result = mgr.run().await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.final_state, FailoverState::Done);
        assert_eq!(result.exit_code, exit_code::SUCCESS);
        assert!((0.3..1.0).contains(&result.initial_lag.and_then(|l| l.secs()).unwrap()));
        assert_eq!(operator.questions(), vec![CONFIRMATION_QUESTION.to_string()]);

        assert_eq!(
            cluster.journal.ordered(&[
                "remove_vip",
                "set_config",
                "add_vip",
                "announce_vip",
                "observe",
                "detach",
                "shutdown",
            ]),
            vec![
                "remove_vip redis-a",
                "set_config redis-a slave-read-only yes",
                "set_config redis-b slave-read-only no",
                "add_vip redis-b",
                "announce_vip redis-b",
                "observe redis-a",
                "detach redis-b",
                "shutdown redis-a",
            ]
        );

        assert_eq!(cluster.network.owners(), vec!["redis-b".to_string()]);
        assert!(cluster.primary.state().shut_down);
        assert_eq!(cluster.replica.state().role, Role::Primary);
        assert!(!cluster.replica.state().read_only);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_only_primary_fails_preflight_without_mutation() {
        let cluster = FakeCluster::healthy();
        cluster.primary.update(|s| s.read_only = true);
        let operator = FakeOperator::answering(true);

        let result = manager(&cluster, operator.clone(), FailoverConfig::default()).run().await;

        assert!(!result.success);
        assert_eq!(result.final_state, FailoverState::ConfigFailed);
        assert_eq!(result.exit_code, exit_code::PREFLIGHT);
        assert!(result.error.unwrap().contains("primary is read-only"));
        assert!(cluster.journal.mutations().is_empty());
        assert!(operator.questions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_down_is_replication_not_ready() {
        let cluster = FakeCluster::healthy();
        cluster.replica.update(|s| s.link_status = LinkStatus::Down);

        let result = manager(&cluster, FakeOperator::answering(true), FailoverConfig::default())
            .run()
            .await;

        assert_eq!(result.initial_lag, Some(LagSample::NotReady));
        assert_eq!(
            result.states,
            vec![
                FailoverState::Unknown,
                FailoverState::ConfigOk,
                FailoverState::ReplicationNotReady
            ]
        );
        assert_eq!(result.exit_code, exit_code::REPLICATION_NOT_READY);
        assert_eq!(cluster.journal.count("publish"), 0);
        assert!(cluster.journal.mutations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_operator_decline_aborts_without_mutation() {
        let cluster = FakeCluster::healthy();
        let operator = FakeOperator::answering(false);

        let result = manager(&cluster, operator.clone(), FailoverConfig::default()).run().await;

        assert_eq!(result.final_state, FailoverState::Aborted);
        assert_eq!(result.exit_code, exit_code::DECLINED);
        assert_eq!(operator.questions().len(), 1);
        assert!(cluster.journal.mutations().is_empty());
        assert_eq!(cluster.network.owners(), vec!["redis-a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_only_stops_before_prompt() {
        let cluster = FakeCluster::healthy();
        let operator = FakeOperator::answering(true);
        let config = FailoverConfig::default().with_check_only(true);

        let result = manager(&cluster, operator.clone(), config).run().await;

        assert!(result.success);
        assert!(result.check_only);
        assert_eq!(result.final_state, FailoverState::ClusterReady);
        assert_eq!(result.exit_code, exit_code::SUCCESS);
        assert!(operator.questions().is_empty());
        assert!(cluster.journal.mutations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_vip_remove_failure_stops_before_commit() {
        let cluster = FakeCluster::healthy();
        cluster.network.fail_remove(true);

        let result = manager(&cluster, FakeOperator::answering(true), FailoverConfig::default())
            .run()
            .await;

        assert_eq!(result.final_state, FailoverState::VipFailed);
        assert_eq!(result.exit_code, exit_code::VIP);
        assert_eq!(cluster.journal.mutations(), vec!["remove_vip redis-a"]);
        assert!(!cluster.primary.state().read_only);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vip_add_failure_is_not_compensated() {
        let cluster = FakeCluster::healthy();
        cluster.network.fail_add(true);

        let result = manager(&cluster, FakeOperator::answering(true), FailoverConfig::default())
            .run()
            .await;

        assert_eq!(result.final_state, FailoverState::VipAddFailed);
        assert_eq!(result.exit_code, exit_code::VIP);
        assert!(cluster.network.owners().is_empty());
        // Earlier steps stand
        assert_eq!(cluster.replica.state().role, Role::Replica);
        assert_eq!(cluster.journal.count("detach"), 0);
        assert_eq!(cluster.journal.count("shutdown"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_commit_step_error_names_state() {
        let cluster = FakeCluster::healthy();
        cluster.replica.update(|s| s.fail_config_set = true);

        let result = manager(&cluster, FakeOperator::answering(true), FailoverConfig::default())
            .run()
            .await;

        assert_eq!(result.final_state, FailoverState::SettingReplicaWritable);
        assert_eq!(result.exit_code, exit_code::POST_COMMIT);
        assert!(result.error.unwrap().contains("setting_replica_writable"));
        assert_eq!(cluster.journal.count("add_vip"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_announce_failure_is_not_fatal() {
        let cluster = FakeCluster::healthy();
        cluster.network.fail_announce(true);

        let result = manager(&cluster, FakeOperator::answering(true), FailoverConfig::default())
            .run()
            .await;

        assert_eq!(result.final_state, FailoverState::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_deadline_is_post_commit_failure() {
        let cluster = FakeCluster::healthy();
        cluster.primary.update(|s| s.busy_windows = u32::MAX);
        let config = FailoverConfig::default().with_verify_deadline(Some(Duration::from_secs(20)));

        let result = manager(&cluster, FakeOperator::answering(true), config).run().await;

        assert_eq!(result.final_state, FailoverState::VerifyingQuiescence);
        assert_eq!(result.exit_code, exit_code::POST_COMMIT);
        assert_eq!(cluster.journal.count("detach"), 0);
        assert!(!cluster.primary.state().shut_down);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_switching_leaves_pair_untouched() {
        let cluster = FakeCluster::healthy();
        let operator = FakeOperator::answering(true);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = manager(&cluster, operator.clone(), FailoverConfig::default())
            .with_cancellation(cancel)
            .run()
            .await;

        assert!(!result.success);
        assert_eq!(result.final_state, FailoverState::Unknown);
        assert_eq!(result.exit_code, exit_code::DECLINED);
        assert!(operator.questions().is_empty());
        assert!(cluster.journal.mutations().is_empty());
        assert_eq!(cluster.network.owners(), vec!["redis-a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_at_prompt_wins_over_confirmation() {
        let cluster = FakeCluster::healthy();
        let cancel = CancellationToken::new();
        let operator = FakeOperator::answering(true).interrupted_by(cancel.clone());

        let result = manager(&cluster, operator.clone(), FailoverConfig::default())
            .with_cancellation(cancel)
            .run()
            .await;

        assert_eq!(operator.questions().len(), 1);
        assert_eq!(result.final_state, FailoverState::Switching);
        assert_eq!(result.exit_code, exit_code::DECLINED);
        assert_eq!(result.error.as_deref(), Some("Cancelled"));
        assert!(cluster.journal.mutations().is_empty());
        assert_eq!(cluster.network.owners(), vec!["redis-a".to_string()]);
        assert!(!cluster.replica.state().shut_down);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_commit_is_post_commit_failure() {
        let cluster = FakeCluster::healthy();
        cluster.primary.update(|s| s.busy_windows = u32::MAX);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let mut mgr = manager(&cluster, FakeOperator::answering(true), FailoverConfig::default())
            .with_cancellation(cancel);
        let interrupt = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            trigger.cancel();
        };
        let (result, ()) = tokio::join!(mgr.run(), interrupt);

        assert_eq!(result.final_state, FailoverState::VerifyingQuiescence);
        assert_eq!(result.exit_code, exit_code::POST_COMMIT);
        assert_eq!(cluster.journal.count("add_vip"), 1);
        assert_eq!(cluster.journal.count("detach"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_serialization() {
        let cluster = FakeCluster::healthy();
        let result = manager(&cluster, FakeOperator::answering(false), FailoverConfig::default())
            .run()
            .await;

        let json = tokio_test::assert_ok!(serde_json::to_string(&result));
        assert!(json.contains("\"final_state\":\"aborted\""));
        assert!(json.contains("\"exit_code\":3"));
    }
}
