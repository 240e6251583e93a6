use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dyna::config::RuntimeConfig;
use dyna::dispatch::ActionDispatcher;
use dyna::reconcile::{FanoutReconciler, RehydrationReconciler};
use dyna::registry::AgentRegistry;
use dyna::store::Stores;
use dyna::tools::ToolRegistry;

#[derive(Parser, Debug)]
#[command(name = "dyna", about = "Concurrent looping-agent runtime")]
struct Args {
    /// Action queue poll interval in seconds.
    #[arg(long, env = "DYNA_POLL_INTERVAL_SECS")]
    poll_interval: Option<f64>,

    /// Default agent loop interval in seconds.
    #[arg(long, env = "DYNA_LOOP_INTERVAL_SECS")]
    loop_interval: Option<f64>,

    /// Emit logs as JSON.
    #[arg(long, env = "DYNA_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = RuntimeConfig::from_env();
    if let Some(secs) = args.poll_interval.filter(|s| *s >= 0.0) {
        config.poll_interval = std::time::Duration::from_secs_f64(secs);
    }
    if let Some(secs) = args.loop_interval.filter(|s| *s >= 0.0) {
        config.loop_interval = std::time::Duration::from_secs_f64(secs);
    }

    let stores = Stores::in_memory();
    let tools = Arc::new(ToolRegistry::with_builtins());
    let registry = Arc::new(AgentRegistry::new(
        stores.clone(),
        tools.clone(),
        config.clone(),
    ));

    let dispatcher = ActionDispatcher::new(
        stores.actions.clone(),
        registry.clone(),
        config.poll_interval,
    );
    tokio::spawn(async move { dispatcher.run().await });

    let fanout = FanoutReconciler::new(
        stores.messages.clone(),
        stores.conversations.clone(),
        stores.actions.clone(),
        config.fanout_interval,
        config.dedup_capacity,
    );
    tokio::spawn(fanout.run());

    let rehydrator = RehydrationReconciler::new(
        stores.conversations.clone(),
        stores.state.clone(),
        stores.actions.clone(),
        registry.clone(),
        &config,
    );
    tokio::spawn(rehydrator.run());

    info!(tools = ?tools.names(), "runtime started, waiting for actions");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, stopping agents");
    registry.shutdown().await;
    Ok(())
}
