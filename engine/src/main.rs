use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use pulse_core::JsonRunStore;
use pulse_observability::{canonical_logs_dir_from_root, init_process_logging};
use pulse_server::{serve, AppState};

mod demo;

use demo::DemoPipeline;

#[derive(Parser, Debug)]
#[command(name = "pulse-engine")]
#[command(about = "Headless PulseWatch analysis backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 8000)]
        port: u16,
        #[arg(long, env = "PULSE_STATE_DIR")]
        state_dir: Option<String>,
        #[arg(long, default_value_t = 14)]
        log_retention_days: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
            log_retention_days,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, log_info) = init_process_logging(&logs_dir, log_retention_days)?;
            info!("engine logging initialized: {:?}", log_info);

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;

            let store = Arc::new(JsonRunStore::new(&state_dir)?);
            let pipeline = Arc::new(DemoPipeline::new(&state_dir));
            let state = AppState::new(store, pipeline);

            info!("starting pulse-engine on http://{addr}");
            info!("state dir: {}", state_dir.display());
            serve(addr, state).await?;
        }
    }

    Ok(())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".pulsewatch")
}
