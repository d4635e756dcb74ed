use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tallybook_app::{commands, init_tracing, AppState, CommandError};
use tallybook_core::AppConfig;

#[derive(Parser)]
#[command(name = "tallybook")]
#[command(about = "Tallybook encrypted storage maintenance")]
struct Cli {
    /// Private storage directory (overrides config and TALLYBOOK_DATA_DIR)
    #[arg(long = "data-dir")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show secret, bootstrap and migration state
    Status,
    /// Open the database, migrating a legacy file if present
    Open,
    /// Discard an unusable database secret and start over
    Reset {
        #[arg(long)]
        confirm: bool,
    },
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, CommandError> {
    serde_json::to_value(value)
        .map_err(|e| CommandError::new("SERIALIZATION_ERROR", format!("Serialization error: {e}")))
}

async fn run(cli: Cli) -> Result<serde_json::Value, CommandError> {
    let mut config = AppConfig::load_with_env()?;
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = Some(dir);
    }
    let state = AppState::from_config(&config)?;

    match cli.cmd {
        Command::Status => to_json(&commands::storage_status(&state).await?),
        Command::Open => to_json(&commands::open_database(&state).await?),
        Command::Reset { confirm } => to_json(&commands::reset_secret(&state, confirm).await?),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    tracing::debug!("Starting tallybook v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    match run(cli).await {
        Ok(output) => println!("{}", serde_json::to_string_pretty(&output)?),
        Err(err) => {
            eprintln!("{}", serde_json::to_string_pretty(&err)?);
            if err.reset_required() {
                eprintln!("Run `tallybook reset --confirm` to start over with a new secret.");
            }
            std::process::exit(1);
        }
    }
    Ok(())
}
