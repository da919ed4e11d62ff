use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "kioskboot",
    version,
    about = "Start a kiosk's backends and UI server in order"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Use a specific config file
    #[arg(short = 'f', long = "file", global = true)]
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start every service and keep them running until Ctrl+C
    Start {
        /// Mirror service output to the terminal
        #[arg(long)]
        follow: bool,
    },
    /// Stop the running instance
    Stop,
    /// Show what the running instance published
    Ps {
        /// Print the raw state as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the launch order and port plan without starting anything
    Plan {
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check the install for missing files and runtimes
    Doctor,
    /// Validate the configuration file
    Validate,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}
