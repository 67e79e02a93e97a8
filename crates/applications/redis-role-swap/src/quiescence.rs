//! Quiescence verification
//!
//! Runs after the floating IP has moved and before the irreversible steps.
//! Two conditions must hold, in order:
//!
//! 1. The old primary receives no command for a continuous observation
//!    window (a fresh `MONITOR` session per attempt)
//! 2. The lag probe reports the replica caught up
//!
//! Both loops retry on a fixed backoff with no attempt cap. A deadline and a
//! cancellation token bound the whole verification from the outside.

use crate::config::Timings;
use crate::error::{Result, RoleSwapError};
use crate::lag::{LagProbe, LagSample};
use crate::node::Node;
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What it took to reach quiescence
#[derive(Debug, Clone, Serialize)]
pub struct QuiescenceReport {
    /// Observation windows in which the old primary was still busy
    pub busy_windows: u32,
    /// Lag probes that were not caught up
    pub lagging_probes: u32,
    /// The caught-up sample that ended verification
    pub final_lag: LagSample,
}

/// Waits for the old primary to go quiet and the replica to catch up
#[derive(Debug, Clone)]
pub struct QuiescenceVerifier {
    probe: LagProbe,
    observe_window: Duration,
    retry_backoff: Duration,
    deadline: Option<Duration>,
    cancel: CancellationToken,
}

impl QuiescenceVerifier {
    /// Create a verifier from configured timings
    pub fn new(timings: &Timings) -> Self {
        Self {
            probe: LagProbe::from_timings(timings),
            observe_window: timings.observe_window(),
            retry_backoff: timings.retry_backoff(),
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Give up after `deadline` (unbounded when `None`)
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Abort when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Block until both conditions hold, the deadline passes, or the token fires
    pub async fn verify(&self, old_primary: &Node, replica: &Node) -> Result<QuiescenceReport> {
        info!(
            old_primary = %old_primary.name(),
            replica = %replica.name(),
            deadline = ?self.deadline,
            "Verifying before shutting down old primary"
        );

        let bounded = async {
            match self.deadline {
                Some(deadline) => {
                    match tokio::time::timeout(deadline, self.run(old_primary, replica)).await {
                        Ok(result) => result,
                        Err(_) => Err(RoleSwapError::Timeout(deadline)),
                    }
                }
                None => self.run(old_primary, replica).await,
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => {
                warn!("Verification cancelled");
                Err(RoleSwapError::Cancelled)
            }
            result = bounded => result,
        }
    }

    async fn run(&self, old_primary: &Node, replica: &Node) -> Result<QuiescenceReport> {
        let busy_windows = self.wait_for_quiet(old_primary).await?;
        let (lagging_probes, final_lag) = self.wait_for_catch_up(replica, old_primary).await;

        info!(busy_windows, lagging_probes, lag = %final_lag, "Replication is ok");
        Ok(QuiescenceReport {
            busy_windows,
            lagging_probes,
            final_lag,
        })
    }

    async fn wait_for_quiet(&self, old_primary: &Node) -> Result<u32> {
        let mut busy_windows = 0;
        loop {
            match old_primary.store().observe_commands(self.observe_window).await? {
                None => {
                    info!(
                        node = %old_primary.name(),
                        window = ?self.observe_window,
                        "Old primary is no longer receiving queries"
                    );
                    return Ok(busy_windows);
                }
                Some(command) => {
                    busy_windows += 1;
                    warn!(
                        node = %old_primary.name(),
                        command = %command,
                        attempt = busy_windows,
                        "Old primary is still receiving queries, checking again"
                    );
                    tokio::time::sleep(self.retry_backoff).await;
                }
            }
        }
    }

    async fn wait_for_catch_up(&self, replica: &Node, primary: &Node) -> (u32, LagSample) {
        let mut lagging = 0;
        loop {
            let sample = self.probe.probe(replica, primary).await;
            if self.probe.is_caught_up(&sample) {
                return (lagging, sample);
            }
            lagging += 1;
            warn!(lag = %sample, attempt = lagging, "Replication lags, checking again");
            tokio::time::sleep(self.retry_backoff).await;
        }
    }
}
