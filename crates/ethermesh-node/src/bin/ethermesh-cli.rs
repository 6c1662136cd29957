//! Companion CLI: sends one control command to a running node and prints
//! the result lines it gets back.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use tokio::sync::mpsc;

use clap::Parser;

use ethermesh_core::constants::CONTROL_UDP_PORT;
use ethermesh_node::LocalClient;

/// Stop waiting this long after the last received line.
const QUIET_PERIOD: Duration = Duration::from_millis(500);

/// Give up entirely after this long with no response at all.
const OVERALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "ethermesh-cli", about = "Control a running ethermesh node")]
struct Cli {
    /// Node home directory containing authtoken.secret
    #[arg(short = 'd', long, default_value = "/var/lib/ethermesh")]
    home: PathBuf,

    /// Read the auth token from this file instead of <home>/authtoken.secret
    #[arg(long)]
    token_file: Option<PathBuf>,

    /// Control channel port of the node
    #[arg(long, default_value_t = CONTROL_UDP_PORT)]
    control_port: u16,

    /// Command and arguments, e.g. `info`, `listpeers`, `join <nwid>`
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let token_path = cli
        .token_file
        .unwrap_or_else(|| cli.home.join("authtoken.secret"));
    let auth_token = match std::fs::read_to_string(&token_path) {
        Ok(token) => token,
        Err(e) => {
            eprintln!("ethermesh-cli: cannot read {}: {e}", token_path.display());
            return ExitCode::FAILURE;
        }
    };

    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<(u32, String)>();
    let client = match LocalClient::new(
        &auth_token,
        cli.control_port,
        Box::new(move |conversation_id, line| {
            let _ = line_tx.send((conversation_id, line.to_string()));
        }),
    )
    .await
    {
        Ok(client) => client,
        Err(e) => {
            eprintln!("ethermesh-cli: {e}");
            return ExitCode::FAILURE;
        }
    };

    let command = cli.command.join(" ");
    let conversation_id = client.send(&command).await;
    if conversation_id == 0 {
        eprintln!("ethermesh-cli: failed to send command");
        client.close().await;
        return ExitCode::FAILURE;
    }

    // Result lines arrive asynchronously; stop after a quiet period.
    let mut got_any = false;
    let mut wait = OVERALL_TIMEOUT;
    while let Ok(Some((conv, line))) = tokio::time::timeout(wait, line_rx.recv()).await {
        if conv != conversation_id {
            continue;
        }
        println!("{line}");
        got_any = true;
        wait = QUIET_PERIOD;
    }

    client.close().await;
    if got_any {
        ExitCode::SUCCESS
    } else {
        eprintln!("ethermesh-cli: no response (is the node running?)");
        ExitCode::FAILURE
    }
}
