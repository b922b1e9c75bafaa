use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "horus-cli", version, about = "Horus Attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Device registry and connectivity
    Device {
        #[command(subcommand)]
        action: commands::device::DeviceAction,
    },
    /// Pull users and punches from devices
    Sync {
        #[command(subcommand)]
        action: commands::sync::SyncAction,
    },
    /// Stored punch logs
    Logs {
        #[command(subcommand)]
        action: commands::logs::LogsAction,
    },
    /// Daily attendance summaries
    Summary {
        #[command(subcommand)]
        action: commands::summary::SummaryAction,
    },
    /// Holiday calendar
    Holiday {
        #[command(subcommand)]
        action: commands::holiday::HolidayAction,
    },
    /// Configuration and attendance rules
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
}

#[tokio::main]
async fn main() {
    horus_core::logging::init();
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Device { action } => commands::device::run(action).await,
        Commands::Sync { action } => commands::sync::run(action).await,
        Commands::Logs { action } => commands::logs::run(action).await,
        Commands::Summary { action } => commands::summary::run(action).await,
        Commands::Holiday { action } => commands::holiday::run(action).await,
        Commands::Config { action } => commands::config::run(action).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
