use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "arena-monitor",
    about = "Host a coding-assistant shell and hand arena-fight requests to the fight server",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the monitored shell session
    Run {
        /// Shell to host instead of the configured one
        #[arg(long)]
        shell: Option<String>,

        /// Fight server URL override
        #[arg(long)]
        server: Option<String>,
    },

    /// Show the effective configuration
    Config {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Classify each line of a captured transcript
    Classify {
        /// Transcript file (raw terminal output)
        file: PathBuf,
    },

    /// Run the context sanitizer over a captured buffer
    Sanitize {
        file: PathBuf,

        /// Keep at most this many trailing characters
        #[arg(long)]
        max_chars: Option<usize>,
    },
}
