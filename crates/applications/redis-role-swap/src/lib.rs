//! # Redis Role Swap
//!
//! Controlled switchover of a Redis primary/replica pair that sits behind a
//! single floating IP.
//!
//! ## Architecture
//!
//! ```text
//! redis-role-swap (Rust)
//! ├── Discovery          INFO replication + floating IP ownership
//! ├── Preflight          read-only flags, announce tool on both hosts
//! ├── Lag probe          timestamped PUBLISH through replication
//! ├── Failover manager   state machine, one confirmation gate
//! └── Adapters
//!     ├── DataStore      redis client (RedisStore)
//!     └── HostNetwork    ip/arping over ssh (IpNetwork)
//! ```
//!
//! ## Role Swap
//!
//! 1. **Release**: remove the floating IP from the old primary
//! 2. **Flip gates**: old primary read-only, replica writable
//! 3. **Claim**: add the floating IP on the replica host and announce it
//! 4. **Verify**: old primary quiet, replica caught up
//! 5. **Finish**: promote the replica, shut the old primary down
//!
//! Nothing is rolled back. See [`failover`] and [`state`] for details.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod discovery;
pub mod error;
pub mod failover;
pub mod lag;
pub mod network;
pub mod node;
pub mod operator;
pub mod preflight;
pub mod quiescence;
pub mod redis_store;
pub mod remote;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

// Orchestration
pub use failover::{FailoverConfig, FailoverManager, FailoverResult};
pub use state::{Action, Event, FailoverState, StateMachine};

// Topology
pub use discovery::{NodeReport, Pair, discover};
pub use node::{DataStore, Node, Role};

// Adapters
pub use network::{HostNetwork, IpNetwork};
pub use operator::{ConsoleOperator, Operator};
pub use redis_store::RedisStore;
pub use remote::ShellExecutor;

// Configuration and errors
pub use config::{ClusterConfig, NodeConfig, Timings};
pub use error::{Result, RoleSwapError};
