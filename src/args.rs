use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "adpolicyd")]
#[command(version)]
#[command(about = "Active Directory policy daemon", long_about = None)]
pub(crate) struct Cli {
    /// Daemon settings file. Can also be set via ADPOLICY_CONFIG env var.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Listening socket (overrides the settings file and ADPOLICY_SOCKET)
    #[arg(short, long)]
    pub socket: Option<PathBuf>,

    /// Idle seconds before exiting, 0 to never exit on idle
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
