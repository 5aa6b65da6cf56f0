//! # ZMON Worker Binary
//!
//! Entry point for one worker process. Collects plugins, starts the
//! flow-control reactor and runs the requested flow against the configured
//! broker queue until interrupted.
//!
//! ## Usage
//!
//! ```bash
//! # defaults: simple_queue_processor on zmon:queue:default
//! zmon-worker
//!
//! # custom queue and configuration
//! zmon-worker --config worker.toml --queue zmon:queue:snmp
//!
//! # debug logging
//! zmon-worker --log-level debug
//! ```
//!
//! ## Exit codes
//!
//! - `0`: graceful shutdown on a user signal
//! - `1`: unknown flow name
//! - `2`: unexpected fatal error (plugin collection failures included)

use std::sync::Arc;

use clap::Parser;

use zmon_worker::builtins;
use zmon_worker::config::WorkerConfig;
use zmon_worker::consumer::BrokerConsumer;
use zmon_worker::eventlog::EventLog;
use zmon_worker::executor::TaskExecutor;
use zmon_worker::reactor::{self, FlowControlReactor, ReactorConfig};
use zmon_worker::rpc_client::XmlRpcClient;
use zmon_worker::tasks;
use zmon_worker_sdk::{init_plugin_manager, CollectOptions};

/// Flows this binary knows how to run.
const KNOWN_FLOWS: &[&str] = &["simple_queue_processor"];

/// Command line arguments for the worker process.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Flow to run
    #[arg(long, default_value = "simple_queue_processor")]
    flow: String,

    /// Broker queue to drain; overrides the configuration file
    #[arg(short, long)]
    queue: Option<String>,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let exit_code = run().await;
    std::process::exit(exit_code);
}

async fn run() -> i32 {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    let mut config = match WorkerConfig::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid worker configuration");
            return 2;
        }
    };
    if let Some(queue) = &args.queue {
        config.broker.queue = queue.clone();
    }

    if !KNOWN_FLOWS.contains(&args.flow.as_str()) {
        tracing::error!(flow = %args.flow, "bad flow name");
        return 1;
    }

    proctitle::set_title(format!("zmon-worker {} {}", args.flow, config.broker.queue));
    tracing::info!(
        pid = std::process::id(),
        flow = %args.flow,
        queue = %config.broker.queue,
        "starting worker"
    );

    // one-shot plugin collection; failures here are fatal to the process
    let registry = init_plugin_manager(builtins::build_registry());
    if let Err(e) = registry.collect(CollectOptions {
        load_builtins: true,
        load_env: true,
        additional_dirs: config.plugins.additional_dirs.clone(),
        global_config: config.plugins.global_config.clone(),
    }) {
        tracing::error!(error = %e, "plugin collection failed");
        return 2;
    }

    let rpc = Arc::new(XmlRpcClient::new(config.rpc_server.endpoint()));
    let flow_reactor = reactor::install(Arc::new(FlowControlReactor::new(
        std::process::id(),
        rpc,
        ReactorConfig::default(),
    )));
    flow_reactor.start();

    let eventlog = Arc::new(EventLog::new(&config.eventlog));
    let mut executor = TaskExecutor::new();
    tasks::register_builtin_handlers(&mut executor, registry, eventlog);

    let mut consumer = BrokerConsumer::new(config, Arc::new(executor), Arc::clone(&flow_reactor));
    let result = tokio::select! {
        result = consumer.run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("caught user signal to stop consumer, finishing");
            Ok(())
        }
    };

    flow_reactor.stop();
    match result {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "worker terminated unexpectedly");
            2
        }
    }
}
