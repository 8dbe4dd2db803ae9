//! meshd: the gpumesh daemon.
//!
//! # Usage
//!
//! ```text
//! meshd simulate --workers w1=4000,w2=8000,w3=8000 --kill w2
//! meshd elect --member a=8000 --member b=16000
//! meshd config init --peer-id w1 --room-id lab --gpu-memory-mb 24000 > meshd.toml
//! meshd config check meshd.toml
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use gpumesh_core::MeshConfig;
use meshd::simulate::{self, SimulationOptions};

#[derive(Parser)]
#[command(name = "meshd", about = "gpumesh worker mesh daemon", version)]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run a room in-process and report the elected admin.
    Simulate {
        /// Workers as id=gpu_memory_mb, comma separated.
        #[arg(long, value_delimiter = ',', default_value = "w1=4000,w2=8000,w3=8000")]
        workers: Vec<String>,

        /// Kill this worker once the room has formed.
        #[arg(long)]
        kill: Option<String>,

        /// Longest wait for the room to converge, in milliseconds.
        #[arg(long, default_value = "5000")]
        settle_ms: u64,

        #[arg(long, default_value = "sim")]
        room_id: String,
    },
    /// Run the admin election over a member list.
    Elect {
        /// A member as id=gpu_memory_mb. Repeatable.
        #[arg(long = "member", required = true)]
        members: Vec<String>,
    },
    /// Create or validate meshd.toml.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print a scaffold config to stdout.
    Init {
        #[arg(long)]
        peer_id: String,
        #[arg(long)]
        room_id: String,
        #[arg(long)]
        gpu_memory_mb: u64,
    },
    /// Parse and validate a config file.
    Check { path: PathBuf },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,meshd=debug,gpumesh=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Simulate {
            workers,
            kill,
            settle_ms,
            room_id,
        } => {
            let workers = workers
                .iter()
                .map(|w| simulate::parse_member(w))
                .collect::<anyhow::Result<Vec<_>>>()?;
            run_simulate(room_id, workers, kill, Duration::from_millis(settle_ms)).await
        }
        Command::Elect { members } => {
            let members = members
                .iter()
                .map(|m| simulate::parse_member(m))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let admin = simulate::elect(&members).context("no members to elect from")?;
            println!("{admin}");
            Ok(())
        }
        Command::Config { action } => run_config(action),
    }
}

async fn run_simulate(
    room_id: String,
    workers: Vec<(String, u64)>,
    kill: Option<String>,
    settle: Duration,
) -> anyhow::Result<()> {
    info!(%room_id, workers = workers.len(), "starting simulation");
    let report = simulate::run_simulation(SimulationOptions {
        room_id,
        workers,
        kill,
        settle,
    })
    .await?;

    println!("members: {}", report.members.join(", "));
    println!("admin:   {}", report.admin);
    if let Some(admin) = &report.after_kill {
        println!("survivors: {}", report.survivors.join(", "));
        println!("re-elected admin: {admin}");
    }
    Ok(())
}

fn run_config(action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init {
            peer_id,
            room_id,
            gpu_memory_mb,
        } => {
            let config = MeshConfig::scaffold(&peer_id, &room_id, gpu_memory_mb);
            print!("{}", config.to_toml_string()?);
        }
        ConfigAction::Check { path } => {
            let config = MeshConfig::from_file(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            println!(
                "ok: peer {} in room {} ({} MB GPU)",
                config.worker.peer_id, config.worker.room_id, config.worker.gpu_memory_mb
            );
        }
    }
    Ok(())
}
