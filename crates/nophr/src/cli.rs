use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// A personal Nostr gateway serving Gopher, Gemini and Finger.
#[derive(Debug, Parser)]
#[command(name = "nophr", version, about, long_about = None)]
pub struct Opts {
    /// Path to the configuration file
    #[arg(long, short, env = "NOPHR_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Option<OptsCmd>,
}

#[derive(Debug, Subcommand)]
pub enum OptsCmd {
    /// Print an example configuration file to stdout
    Init,
}
