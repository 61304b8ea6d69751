use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keel")]
#[command(author, version, about = "VPN tunnel session manager", long_about = None)]
pub struct Cli {
    /// Settings file (.toml or .json)
    #[arg(short, long, global = true, default_value = "keel.toml")]
    pub config: PathBuf,

    /// Log format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Plain)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Plain,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// List servers from the configured directory
    Servers,

    /// Connect and stay connected until Ctrl-C
    Connect(ConnectArgs),

    /// Show recorded sessions
    History,
}

#[derive(clap::Args)]
pub struct ConnectArgs {
    /// Server id (default: recommended server)
    pub server_id: Option<String>,
}
