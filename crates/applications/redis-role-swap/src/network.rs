//! Floating IP operations
//!
//! Query, claim and release the floating IP on a given host, and send the
//! gratuitous ARP announcement after it moves.

use crate::config::ClusterConfig;
use crate::error::Result;
use crate::remote::ShellExecutor;
use async_trait::async_trait;
use tracing::{info, warn};

/// Locations probed for `arping`, in order
pub const ARPING_CANDIDATES: [&str; 2] = ["/sbin/arping", "/usr/bin/arping"];

/// Number of unsolicited ARP packets sent after the VIP moves
const ANNOUNCE_COUNT: u32 = 4;

/// Host-level network capabilities used by the role swap.
///
/// The boolean results mirror command exit status: `Ok(false)` means the
/// command ran and failed, `Err` means it could not be run at all.
#[async_trait]
pub trait HostNetwork: Send + Sync {
    /// Whether `host` currently has the floating IP configured
    async fn vip_owned_by(&self, host: &str) -> Result<bool>;

    /// Configure the floating IP on `host`
    async fn add_vip(&self, host: &str) -> Result<bool>;

    /// Remove the floating IP from `host`
    async fn remove_vip(&self, host: &str) -> Result<bool>;

    /// Broadcast a gratuitous ARP for the floating IP from `host`
    async fn announce_vip(&self, host: &str) -> Result<bool>;

    /// Resolved path of the announce tool on `host`
    async fn announce_tool(&self, host: &str) -> Result<Option<String>>;

    /// Short hostname the machine behind `host` reports for itself
    async fn short_hostname(&self, host: &str) -> Result<Option<String>>;
}

/// [`HostNetwork`] backed by `ip addr` and `arping` through a shell
pub struct IpNetwork {
    shell: ShellExecutor,
    vip_with_prefix: String,
    floating_ip: String,
    interface: String,
}

impl IpNetwork {
    /// Create from the cluster config and a shell executor
    pub fn new(config: &ClusterConfig, shell: ShellExecutor) -> Self {
        Self {
            shell,
            vip_with_prefix: config.vip_with_prefix(),
            floating_ip: config.floating_ip.clone(),
            interface: config.interface.clone(),
        }
    }

    fn query_script(&self) -> String {
        // Whole-word fixed string, so 10.0.0.1/24 does not match 110.0.0.1/24
        format!("sudo /sbin/ip addr | grep -wF {}", self.vip_with_prefix)
    }

    fn add_script(&self) -> String {
        format!(
            "sudo /sbin/ip addr add {} dev {}",
            self.vip_with_prefix, self.interface
        )
    }

    fn remove_script(&self) -> String {
        format!(
            "sudo /sbin/ip addr del {} dev {}",
            self.vip_with_prefix, self.interface
        )
    }

    fn announce_script(&self, tool: &str) -> String {
        format!(
            "sudo {} -U -c {} -I {} {}",
            tool, ANNOUNCE_COUNT, self.interface, self.floating_ip
        )
    }
}

#[async_trait]
impl HostNetwork for IpNetwork {
    async fn vip_owned_by(&self, host: &str) -> Result<bool> {
        let result = self.shell.run_command(host, &self.query_script()).await?;
        Ok(result.is_success())
    }

    async fn add_vip(&self, host: &str) -> Result<bool> {
        let result = self.shell.run_command(host, &self.add_script()).await?;
        if !result.is_success() {
            warn!(host = %result.host, stderr = %result.stderr.trim(), "ip addr add failed");
        }
        Ok(result.is_success())
    }

    async fn remove_vip(&self, host: &str) -> Result<bool> {
        let result = self.shell.run_command(host, &self.remove_script()).await?;
        if !result.is_success() {
            warn!(host = %result.host, stderr = %result.stderr.trim(), "ip addr del failed");
        }
        Ok(result.is_success())
    }

    async fn announce_vip(&self, host: &str) -> Result<bool> {
        let Some(tool) = self.announce_tool(host).await? else {
            warn!(host = %host, "No arping binary found, cannot announce");
            return Ok(false);
        };
        let result = self
            .shell
            .run_command(host, &self.announce_script(&tool))
            .await?;
        Ok(result.is_success())
    }

    async fn announce_tool(&self, host: &str) -> Result<Option<String>> {
        for candidate in ARPING_CANDIDATES {
            let script = format!("sudo {} -V 2> /dev/null", candidate);
            if self.shell.run_command(host, &script).await?.is_success() {
                info!(host = %host, path = %candidate, "Found arping");
                return Ok(Some(candidate.to_string()));
            }
        }
        Ok(None)
    }

    async fn short_hostname(&self, host: &str) -> Result<Option<String>> {
        let result = self.shell.run_command(host, "hostname -s").await?;
        let name = result.stdout.trim();
        Ok((result.is_success() && !name.is_empty()).then(|| name.to_string()))
    }
}
