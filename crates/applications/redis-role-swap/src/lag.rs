//! Replication lag probe
//!
//! Measures replica freshness with a timestamped pub/sub round trip instead
//! of trusting the node's self-reported offset:
//!
//! ```text
//! caller ──► replica link up? ── no ──► NotReady
//!              │ yes
//!              ├── spawn: sleep(delay) → PUBLISH REPLICATION <now> on primary
//!              └── SUBSCRIBE REPLICATION on replica, bounded
//!                    ├── message → lag = now - embedded timestamp
//!                    └── bound expired → NotReady
//! join publisher ──► return
//! ```
//!
//! PUBLISH is propagated through the replication stream, so a message that
//! reaches a subscriber on the replica has travelled the same path as data.

use crate::config::Timings;
use crate::node::{LinkStatus, Node};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Reserved channel for lag probes
pub const REPLICATION_CHANNEL: &str = "REPLICATION";

/// Outcome of one probe
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum LagSample {
    /// Measured lag in seconds; negative when the clocks disagree
    Lag(f64),
    /// Link down, nothing received in time, or the probe could not run
    NotReady,
}

impl LagSample {
    /// Lag in seconds, if one was measured
    pub fn secs(&self) -> Option<f64> {
        match self {
            Self::Lag(secs) => Some(*secs),
            Self::NotReady => None,
        }
    }

    /// Caught up means a measured lag strictly below `threshold_secs`
    pub fn is_caught_up(&self, threshold_secs: f64) -> bool {
        matches!(self, Self::Lag(secs) if *secs < threshold_secs)
    }
}

impl fmt::Display for LagSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lag(secs) => write!(f, "{:.3}s", secs),
            Self::NotReady => f.write_str("not ready"),
        }
    }
}

/// Encode a wall-clock instant as fractional epoch seconds
pub fn timestamp_payload(at: DateTime<Utc>) -> String {
    format!("{:.6}", epoch_secs(at))
}

fn epoch_secs(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

/// Lag between an embedded timestamp and the receive instant
pub fn lag_from_payload(payload: &str, received_at: DateTime<Utc>) -> Option<f64> {
    let sent: f64 = payload.trim().parse().ok()?;
    sent.is_finite().then(|| epoch_secs(received_at) - sent)
}

/// Bounded lag probe
#[derive(Debug, Clone, Copy)]
pub struct LagProbe {
    publish_delay: Duration,
    receive_bound: Duration,
    threshold_secs: f64,
}

impl Default for LagProbe {
    fn default() -> Self {
        Self::from_timings(&Timings::default())
    }
}

impl LagProbe {
    /// Create a probe from configured timings
    pub fn from_timings(timings: &Timings) -> Self {
        Self {
            publish_delay: timings.publish_delay(),
            receive_bound: timings.receive_bound(),
            threshold_secs: timings.caught_up_threshold_secs(),
        }
    }

    /// Whether `sample` counts as caught up for this probe
    pub fn is_caught_up(&self, sample: &LagSample) -> bool {
        sample.is_caught_up(self.threshold_secs)
    }

    /// Measure how far `replica` trails `primary`
    pub async fn probe(&self, replica: &Node, primary: &Node) -> LagSample {
        let status = match replica.store().replication_status().await {
            Ok(status) => status,
            Err(e) => {
                warn!(replica = %replica.name(), error = %e, "Cannot read replication status");
                return LagSample::NotReady;
            }
        };

        if status.link_status != LinkStatus::Up {
            info!(
                replica = %replica.name(),
                link_status = ?status.link_status,
                "Replica link to primary is not up"
            );
            return LagSample::NotReady;
        }

        let publisher = primary.store().clone();
        let delay = self.publish_delay;
        let publish = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let payload = timestamp_payload(Utc::now());
            publisher.publish(REPLICATION_CHANNEL, &payload).await
        });

        let received = replica
            .store()
            .subscribe_once(REPLICATION_CHANNEL, self.receive_bound)
            .await;
        let received_at = Utc::now();

        if !publish.is_finished() {
            publish.abort();
        }
        match publish.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(primary = %primary.name(), error = %e, "Lag probe publish failed"),
            Err(e) if e.is_cancelled() => debug!("Lag probe publish cancelled"),
            Err(e) => warn!(error = %e, "Lag probe publish task failed"),
        }

        let sample = match received {
            Ok(Some(payload)) => match lag_from_payload(&payload, received_at) {
                Some(lag) => LagSample::Lag(lag),
                None => {
                    warn!(payload = %payload, "Unparseable lag probe payload");
                    LagSample::NotReady
                }
            },
            Ok(None) => LagSample::NotReady,
            Err(e) => {
                warn!(replica = %replica.name(), error = %e, "Lag probe subscribe failed");
                LagSample::NotReady
            }
        };

        if let LagSample::Lag(secs) = sample {
            if secs < 0.0 {
                warn!(lag_secs = secs, "Negative lag, clocks on the two hosts disagree");
            }
        }
        info!(replica = %replica.name(), sample = %sample, "Replication lag probed");
        sample
    }
}
