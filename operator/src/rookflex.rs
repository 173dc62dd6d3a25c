//! Flexvolume driver invoked by the kubelet. Forwards each call to the node agent over the
//! socket installed next to the binary and prints the result as JSON on stdout.
use std::{path::PathBuf, process::ExitCode, time::Duration};

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::{debug, error};

use rook_operator::{
    flexvolume::{
        plugin::{DriverCommand, DriverStatus, Plugin, SystemMounter},
        rpc::RpcClient,
        UNIX_SOCKET_NAME,
    },
    utils::exec::ProcessExecutor,
};

/// Upper bound on any mount tool the driver runs.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: DriverCommand,
}

fn driver_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("failed to locate driver binary")?;
    exe.parent()
        .map(PathBuf::from)
        .context("driver binary has no parent directory")
}

async fn run(command: DriverCommand) -> Result<DriverStatus> {
    let dir = driver_dir()?;
    if command == DriverCommand::Init {
        return Ok(Plugin::<RpcClient, SystemMounter<ProcessExecutor>>::init(&dir));
    }
    let client = RpcClient::connect(dir.join(UNIX_SOCKET_NAME)).await?;
    let mounter = SystemMounter::new(ProcessExecutor, COMMAND_TIMEOUT);
    let plugin = Plugin::new(client, mounter, dir);
    Ok(plugin.run(command).await)
}

fn emit(status: &DriverStatus) -> ExitCode {
    match serde_json::to_string(status) {
        Ok(out) => println!("{out}"),
        Err(err) => error!(%err, "failed to encode driver status"),
    }
    ExitCode::from(status.exit_code() as u8)
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries the driver result only.
    if let Err(err) = rook_common::telemetry::init_stderr() {
        eprintln!("failed to initialize logging: {err:#}");
    }
    let args = match Cli::try_parse() {
        Ok(args) => args,
        Err(err) => {
            debug!(%err, "unsupported driver call");
            return emit(&DriverStatus::not_supported());
        }
    };
    debug!(command = ?args.command, "driver call");
    match run(args.command).await {
        Ok(status) => emit(&status),
        Err(err) => emit(&DriverStatus::failure(format!("Rook: {err:#}"))),
    }
}
