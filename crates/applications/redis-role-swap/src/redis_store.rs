//! Redis-backed [`DataStore`]
//!
//! Each call uses its own connection: commands go over a multiplexed
//! connection, pub/sub and `MONITOR` get dedicated ones that are dropped as
//! soon as the call returns.

use crate::config::NodeConfig;
use crate::error::{Result, RoleSwapError};
use crate::node::{DataStore, READ_ONLY_CONFIG_KEY, ReplicationStatus, Role};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{Client, IntoConnectionInfo};
use std::time::Duration;
use tracing::{debug, info};

/// [`DataStore`] talking to a real Redis server
pub struct RedisStore {
    client: Client,
    name: String,
}

impl RedisStore {
    /// Create a client for the configured instance (no connection is made yet)
    pub fn open(config: &NodeConfig) -> Result<Self> {
        let host = if config.host.contains(':') {
            format!("[{}]", config.host)
        } else {
            config.host.clone()
        };
        let mut info = format!("redis://{}:{}/", host, config.port).into_connection_info()?;
        info.redis.password = config.auth.clone();

        Ok(Self {
            client: Client::open(info)?,
            name: config.display_name(),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn info(&self, section: &str) -> Result<String> {
        let mut conn = self.connection().await?;
        let info: String = redis::cmd("INFO").arg(section).query_async(&mut conn).await?;
        Ok(info)
    }

    /// Subscribe on a dedicated connection and wait for the first message
    async fn first_message(&self, channel: &str) -> Result<redis::Msg> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let message = std::pin::pin!(pubsub.on_message()).next().await;
        message.ok_or_else(|| {
            RoleSwapError::remote(format!("subscription on {} closed", self.name))
        })
    }

    /// Start `MONITOR` on a dedicated connection and wait for the first command
    async fn first_command(&self) -> Result<String> {
        let mut monitor = self.client.get_async_monitor().await?;
        monitor.monitor().await?;
        let mut stream = std::pin::pin!(monitor.on_message::<String>());
        while let Some(line) = stream.next().await {
            if line != "OK" {
                return Ok(line);
            }
        }
        Err(RoleSwapError::remote(format!(
            "monitor session on {} closed",
            self.name
        )))
    }
}

#[async_trait]
impl DataStore for RedisStore {
    async fn replication_status(&self) -> Result<ReplicationStatus> {
        let info = self.info("replication").await?;
        ReplicationStatus::from_info(&info).ok_or_else(|| {
            RoleSwapError::discovery(&self.name, "INFO replication has no role field")
        })
    }

    async fn read_only(&self) -> Result<bool> {
        // A primary accepts writes whatever slave-read-only says
        if self.replication_status().await?.role != Role::Replica {
            return Ok(false);
        }
        let value = self.get_config(READ_ONLY_CONFIG_KEY).await?;
        Ok(value.as_deref() == Some("yes"))
    }

    async fn get_config(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let pair: Vec<String> = redis::cmd("CONFIG")
            .arg("GET")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(pair.into_iter().nth(1))
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("CONFIG")
            .arg("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        info!(node = %self.name, key = %key, value = %value, "CONFIG SET");
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        debug!(node = %self.name, channel = %channel, receivers, "Published");
        Ok(())
    }

    async fn subscribe_once(&self, channel: &str, wait: Duration) -> Result<Option<String>> {
        match tokio::time::timeout(wait, self.first_message(channel)).await {
            Err(_) => Ok(None),
            Ok(message) => Ok(Some(message?.get_payload::<String>()?)),
        }
    }

    async fn observe_commands(&self, wait: Duration) -> Result<Option<String>> {
        match tokio::time::timeout(wait, self.first_command()).await {
            Err(_) => Ok(None),
            Ok(command) => command.map(Some),
        }
    }

    async fn detach_from_primary(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("SLAVEOF")
            .arg("NO")
            .arg("ONE")
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let reply: redis::RedisResult<()> = redis::cmd("SHUTDOWN").query_async(&mut conn).await;
        match reply {
            Ok(()) => Ok(()),
            // The server closes the connection instead of replying
            Err(e) if e.is_connection_dropped() || e.is_io_error() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn server_version(&self) -> Result<String> {
        let info = self.info("server").await?;
        Ok(parse_version(&info).unwrap_or_else(|| "unknown".to_string()))
    }
}

fn parse_version(info: &str) -> Option<String> {
    info.lines()
        .find_map(|line| line.trim().strip_prefix("redis_version:"))
        .map(str::to_string)
}
