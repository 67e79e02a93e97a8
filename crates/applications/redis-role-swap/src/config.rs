//! Cluster configuration
//!
//! Loaded once from the YAML file given on the command line and then passed
//! around as an immutable value.

use crate::error::{Result, RoleSwapError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default Redis port
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// Connection details for one Redis instance
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeConfig {
    /// Hostname or address, also used as the SSH target
    pub host: String,

    /// Redis port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Redis password
    #[serde(default)]
    pub auth: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_REDIS_PORT
}

impl NodeConfig {
    /// Create a node config without authentication
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            auth: None,
        }
    }

    /// `host:port` label used in logs and reports
    pub fn display_name(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Timing knobs for the lag probe and quiescence verifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Delay before the primary publishes its timestamp
    pub publish_delay_ms: u64,

    /// How long the replica waits for the timestamp
    pub receive_bound_ms: u64,

    /// Lag must be strictly below this to count as caught up
    pub caught_up_threshold_ms: u64,

    /// Continuous window without commands that counts as quiesced
    pub observe_window_ms: u64,

    /// Sleep between verifier retries
    pub retry_backoff_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            publish_delay_ms: 1000,
            receive_bound_ms: 2000,
            caught_up_threshold_ms: 1000,
            observe_window_ms: 3000,
            retry_backoff_ms: 1000,
        }
    }
}

impl Timings {
    /// Publish delay as a duration
    pub fn publish_delay(&self) -> Duration {
        Duration::from_millis(self.publish_delay_ms)
    }

    /// Receive bound as a duration
    pub fn receive_bound(&self) -> Duration {
        Duration::from_millis(self.receive_bound_ms)
    }

    /// Caught-up threshold in seconds
    pub fn caught_up_threshold_secs(&self) -> f64 {
        self.caught_up_threshold_ms as f64 / 1000.0
    }

    /// Observation window as a duration
    pub fn observe_window(&self) -> Duration {
        Duration::from_millis(self.observe_window_ms)
    }

    /// Retry backoff as a duration
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Raw on-disk layout, validated into [`ClusterConfig`]
#[derive(Debug, Deserialize)]
struct RawClusterConfig {
    floating_ip: Option<String>,
    floating_ip_cidr: Option<String>,
    #[serde(default = "default_interface")]
    interface: String,
    ssh_user: Option<String>,
    #[serde(alias = "ssh_identity_file")]
    ssh_identify_file: Option<PathBuf>,
    instance_one: Option<NodeConfig>,
    instance_two: Option<NodeConfig>,
    verify_deadline_secs: Option<u64>,
    #[serde(default)]
    timings: Timings,
}

fn default_interface() -> String {
    "eth0".to_string()
}

/// Validated cluster configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Floating IP address clients connect to
    pub floating_ip: String,

    /// Prefix length, normalised to the `/NN` form
    pub floating_ip_cidr: String,

    /// Network interface carrying the floating IP
    pub interface: String,

    /// SSH login for remote hosts (current user when absent)
    pub ssh_user: Option<String>,

    /// SSH identity file
    pub ssh_identity_file: Option<PathBuf>,

    /// The two Redis instances, in configuration order
    pub nodes: [NodeConfig; 2],

    /// Upper bound for the quiescence verifier (unbounded when absent)
    pub verify_deadline: Option<Duration>,

    /// Probe and retry timings
    pub timings: Timings,
}

impl ClusterConfig {
    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            RoleSwapError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    /// Parse and validate YAML text
    pub fn from_yaml(text: &str) -> Result<Self> {
        let raw: RawClusterConfig = serde_yaml::from_str(text)?;

        let (floating_ip, cidr) = match (raw.floating_ip, raw.floating_ip_cidr) {
            (Some(ip), Some(cidr)) if !ip.trim().is_empty() && !cidr.trim().is_empty() => {
                (ip.trim().to_string(), cidr)
            }
            _ => {
                return Err(RoleSwapError::config(
                    "cluster config is missing floating ip information",
                ));
            }
        };

        let instance_one = raw
            .instance_one
            .ok_or_else(|| RoleSwapError::config("instance_one is missing"))?;
        let instance_two = raw
            .instance_two
            .ok_or_else(|| RoleSwapError::config("instance_two is missing"))?;

        if instance_one == instance_two {
            return Err(RoleSwapError::config(
                "instance_one and instance_two point at the same Redis",
            ));
        }

        Ok(Self {
            floating_ip,
            floating_ip_cidr: normalize_cidr(&cidr)?,
            interface: raw.interface,
            ssh_user: raw.ssh_user,
            ssh_identity_file: raw.ssh_identify_file,
            nodes: [instance_one, instance_two],
            verify_deadline: raw.verify_deadline_secs.map(Duration::from_secs),
            timings: raw.timings,
        })
    }

    /// Floating IP with prefix, as given to `ip addr`
    pub fn vip_with_prefix(&self) -> String {
        format!("{}{}", self.floating_ip, self.floating_ip_cidr)
    }
}

/// Accept `24` or `/24`, reject anything that is not a valid prefix length
fn normalize_cidr(cidr: &str) -> Result<String> {
    let bits = cidr.trim().trim_start_matches('/');
    match bits.parse::<u8>() {
        Ok(n) if n <= 128 => Ok(format!("/{}", n)),
        _ => Err(RoleSwapError::config(format!(
            "floating_ip_cidr '{}' is not a prefix length",
            cidr
        ))),
    }
}
