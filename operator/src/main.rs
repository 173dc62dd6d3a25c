//! Operator for Ceph clusters and the per node flexvolume agent.
#![deny(missing_docs)]
use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use rook_common::telemetry::{self, LogFormat};
use tracing::info;

use rook_operator::agent::{self, AgentOpts};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Endpoint traces are exported to, no export when unset.
    #[arg(long, env = "OPERATOR_OTLP_ENDPOINT", global = true)]
    otlp_endpoint: Option<String>,

    /// Format of the log lines.
    #[arg(long, env = "OPERATOR_LOG_FORMAT", value_enum, default_value_t, global = true)]
    log_format: LogFormat,
}

/// Available Subcommands
#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile CephCluster resources
    Operator(OperatorOpts),
    /// Serve the flexvolume driver on this node
    Agent(AgentOpts),
}

/// Options of the cluster operator.
#[derive(Args, Debug)]
struct OperatorOpts {
    /// Namespace of the operator and its config map.
    #[arg(long, env = "POD_NAMESPACE", default_value = "rook-ceph")]
    namespace: String,

    /// Directory holding the generated ceph.conf and keyrings of every cluster.
    #[arg(long, env = "ROOK_CONFIG_DIR", default_value = "/var/lib/rook")]
    config_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    telemetry::init(args.otlp_endpoint.clone(), args.log_format).await?;

    info!(?args.command, ?args.otlp_endpoint, "starting");
    let res = match args.command {
        Command::Operator(opts) => rook_operator::cluster::run(opts.namespace, opts.config_dir).await,
        Command::Agent(opts) => agent::run(opts).await,
    };
    // Flush traces before shutdown
    telemetry::shutdown();
    res
}
