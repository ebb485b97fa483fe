use clap::{Parser, Subcommand};
use recordsync_core::Config;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "recordsync", version, about = "Inspect and maintain record sync metadata")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ledger counts and unresolved relationships
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List synced entities
    Ledger {
        /// Only entities in this state (new, changed, deleted, synced)
        #[arg(long)]
        state: Option<recordsync_core::ChangeState>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List relationships waiting for their targets
    Pending {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Purge old tombstones and applied relationships
    Cleanup {
        /// Override the configured retention window
        #[arg(long)]
        retention_days: Option<u32>,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Config::load_or_default().logging.level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    let result = match cli.command {
        Commands::Status { json } => commands::status::run(json),
        Commands::Ledger { state, json } => commands::ledger::run(state, json),
        Commands::Pending { json } => commands::pending::run(json),
        Commands::Cleanup { retention_days } => commands::cleanup::run(retention_days),
        Commands::Config { action } => commands::config::run(action),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
