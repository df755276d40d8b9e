use std::ffi::OsString;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use consul_tools::config::{env_flag, ConsulConfig, LockConfig, LOCK_DEBUG_ENV};
use consul_tools::kv::consul::ConsulClient;
use consul_tools::lock::{CommandSpec, LockRunner};
use consul_tools::logging;

const EXIT_USAGE: i32 = 1;

#[derive(Parser, Debug)]
#[command(
    name = "consul-lock",
    version,
    about = "Run a command while holding a lock in Consul",
    long_about = "Acquires a session-backed lock on LOCK_PATH, runs PROGRAM while the lock \
                  is held and stops it if the lock is lost. Exits with the program's exit code."
)]
struct Args {
    /// KV path of the lock
    lock_path: String,

    /// Program to run while the lock is held
    program: OsString,

    /// Arguments for the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<OsString>,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            process::exit(if err.use_stderr() { EXIT_USAGE } else { 0 });
        }
    };
    match run(args) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            process::exit(EXIT_USAGE);
        }
    }
}

fn run(args: Args) -> Result<i32> {
    logging::init("consul-lock", env_flag(LOCK_DEBUG_ENV), false)?;

    let consul = ConsulConfig::from_env();
    let client = ConsulClient::new(&consul).context("Failed to configure Consul client")?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    let command = CommandSpec::new(args.program, args.args);
    info!(
        "Locking {} on {} to run {}",
        args.lock_path,
        consul.address,
        command.display_name()
    );
    let runner = LockRunner::new(Arc::new(client), args.lock_path, command, LockConfig::default());
    Ok(runtime.block_on(runner.run()))
}
