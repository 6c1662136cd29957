use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use ethermesh_core::constants::{CONTROL_UDP_PORT, DEFAULT_UDP_PORT};
use ethermesh_node::{Node, NodeOptions, TerminationReason};

#[derive(Parser)]
#[command(name = "ethermesh-node", about = "ethermesh peer-to-peer virtual Ethernet node")]
struct Cli {
    /// Node home directory (identity, auth token, peer database, log)
    #[arg(short = 'd', long, default_value = "/var/lib/ethermesh")]
    home: PathBuf,

    /// First overlay UDP port to try
    #[arg(short, long, default_value_t = DEFAULT_UDP_PORT)]
    port: u16,

    /// Loopback control channel port
    #[arg(long, default_value_t = CONTROL_UDP_PORT)]
    control_port: u16,

    /// Log to stdout instead of <home>/node.log
    #[arg(long)]
    stdout_log: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut options = NodeOptions::for_home(cli.home);
    options.overlay_port = cli.port;
    options.control_port = cli.control_port;
    options.log_to_stdout = cli.stdout_log;
    let node = Node::with_options(options);

    // Terminate cleanly on SIGINT.
    let interrupted = node.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received SIGINT, shutting down");
        interrupted.terminate();
    });

    // And on SIGTERM (sent by service managers).
    #[cfg(unix)]
    {
        let terminated = node.clone();
        tokio::spawn(async move {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            sigterm.recv().await;
            tracing::info!("received SIGTERM, shutting down");
            terminated.terminate();
        });
    }

    match node.run().await {
        TerminationReason::Normal => ExitCode::SUCCESS,
        reason => {
            if let Some(message) = node.reason_for_termination() {
                eprintln!("ethermesh-node: {message}");
            }
            tracing::error!("node stopped: {reason:?}");
            ExitCode::FAILURE
        }
    }
}
