use std::future::pending;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use log::{info, warn};

use consul_tools::config::{env_flag, ConsulConfig, SyncConfig, SYNC_SYSLOG_ENV};
use consul_tools::kv::consul::ConsulClient;
use consul_tools::logging;
use consul_tools::sync::{SyncEngine, SyncPair};

const EXIT_USAGE: i32 = 1;

#[derive(Parser, Debug)]
#[command(
    name = "consul-sync",
    version,
    about = "Mirror Consul KV prefixes into the local datacenter"
)]
struct Args {
    /// Prefix to mirror: `path@dc`, or `dest=source[@dc]`
    #[arg(value_name = "SPEC")]
    specs: Vec<String>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            process::exit(if err.use_stderr() { EXIT_USAGE } else { 0 });
        }
    };
    if let Err(err) = run(args) {
        eprintln!("error: {err:#}");
        process::exit(EXIT_USAGE);
    }
}

fn run(args: Args) -> Result<()> {
    logging::init("consul-sync", args.verbose, env_flag(SYNC_SYSLOG_ENV))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    if args.specs.is_empty() {
        if logging::stderr_is_terminal() {
            eprint!("{}", Args::command().render_help());
            process::exit(EXIT_USAGE);
        }
        warn!("No sync specs given, idling");
        runtime.block_on(pending::<()>());
    }

    let pairs = args
        .specs
        .iter()
        .map(|spec| {
            spec.parse::<SyncPair>()
                .with_context(|| format!("Invalid sync spec {spec:?}"))
        })
        .collect::<Result<Vec<_>>>()?;
    if pairs.iter().all(SyncPair::is_identity) {
        warn!("Every spec copies a prefix onto itself, idling");
        runtime.block_on(pending::<()>());
    }

    let consul = ConsulConfig::from_env();
    let client = ConsulClient::new(&consul).context("Failed to configure Consul client")?;
    info!("Syncing {} prefixes via {}", pairs.len(), consul.address);

    let engine = SyncEngine::new(Arc::new(client), pairs, SyncConfig::default());
    runtime.block_on(engine.run());
    anyhow::bail!("all sync watchers stopped")
}
