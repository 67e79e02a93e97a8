//! redis-role-swap - controlled Redis primary/replica switchover
//!
//! ## Usage
//!
//! ```bash
//! # Inspect the pair and run every check, change nothing
//! redis-role-swap -c cluster.yml --check
//!
//! # Swap roles (asks once before touching anything)
//! redis-role-swap -c cluster.yml
//! ```

use clap::Parser;
use redis_role_swap::{
    ClusterConfig, ConsoleOperator, DataStore, FailoverConfig, FailoverManager, IpNetwork, Node,
    RedisStore, RoleSwapError, ShellExecutor, discover, error::exit_code,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Swap the roles of a Redis primary/replica pair behind a floating IP
#[derive(Parser)]
#[command(name = "redis-role-swap", version)]
#[command(about = "Controlled Redis primary/replica role swap", long_about = None)]
struct Cli {
    /// Cluster configuration file (YAML)
    #[arg(short, long)]
    config: PathBuf,

    /// Run discovery, preflight and the lag probe, then stop
    #[arg(long)]
    check: bool,

    /// Print the run result as JSON
    #[arg(long)]
    report_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "redis_role_swap=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let code = match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Role swap did not start");
            eprintln!("{}", e);
            e.exit_code()
        }
    };

    if code != exit_code::SUCCESS {
        std::process::exit(code);
    }
    Ok(())
}

/// Everything up to the orchestrator; errors here are configuration or topology errors
async fn run(cli: &Cli) -> Result<i32, RoleSwapError> {
    let cluster = ClusterConfig::load(&cli.config)?;
    info!(
        config = %cli.config.display(),
        floating_ip = %cluster.vip_with_prefix(),
        interface = %cluster.interface,
        "Loaded cluster config"
    );

    let shell =
        ShellExecutor::new(cluster.ssh_user.clone(), cluster.ssh_identity_file.clone()).await;
    let network = Arc::new(IpNetwork::new(&cluster, shell));

    let [one, two] = &cluster.nodes;
    let nodes = [open_node(one)?, open_node(two)?];

    let (pair, reports) = discover(nodes, network.as_ref()).await?;
    for report in &reports {
        println!("{}", report);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            on_signal.cancel();
        }
    });

    let config = FailoverConfig::from_cluster(&cluster).with_check_only(cli.check);
    let mut manager = FailoverManager::new(
        config,
        pair,
        network,
        Arc::new(ConsoleOperator::stdio()),
    )
    .with_cancellation(cancel);

    let result = manager.run().await;

    if cli.report_json {
        match serde_json::to_string_pretty(&result) {
            Ok(json) => println!("{}", json),
            Err(e) => warn!(error = %e, "Cannot serialize result"),
        }
    }

    match (&result.error, result.check_only) {
        (Some(e), _) => eprintln!("{}", e),
        (None, true) => println!("All checks passed, no changes made"),
        (None, false) => println!(
            "Roles switched: {} is now the primary, {} is shut down",
            result.new_primary, result.old_primary
        ),
    }

    Ok(result.exit_code)
}

fn open_node(config: &redis_role_swap::NodeConfig) -> Result<Node, RoleSwapError> {
    let store: Arc<dyn DataStore> = Arc::new(RedisStore::open(config)?);
    Ok(Node::new(config.clone(), store))
}
