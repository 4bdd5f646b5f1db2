use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "retrovue", about = "RetroVue Core — linear television control plane")]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, global = true, default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the configuration file and its schedule plans
    Validate,

    /// Resolve one broadcast day's lineup and print it as JSON
    Resolve {
        /// Channel slug
        channel: String,

        /// Broadcast date (YYYY-MM-DD); defaults to today
        #[arg(long)]
        date: Option<String>,

        /// Write the lineup to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}
