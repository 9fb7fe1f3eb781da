pub mod daemon_path;
pub mod process;
pub mod report;

use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use process::{restart_server, stop_servers};
use report::{
    BreakdownCommand, process_breakdown_command, process_permissions_command,
    process_stats_command,
};
use tracing::level_filters::LevelFilter;

use crate::{
    daemon::{
        fallback::FocusChange,
        focus::{FOCUS_FILE, FocusSignal, write_focus},
        start_daemon,
    },
    utils::{
        dir::create_application_default_path,
        logging::{CLI_PREFIX, enable_logging},
    },
};

#[derive(Parser, Debug)]
#[command(name = "Worktally", version, long_about = None)]
#[command(about = "Estimates active and idle work time from desktop signals", long_about = None)]
struct Args {
    #[command(subcommand)]
    commands: Commands,
    #[arg(long, help = "Enable logging")]
    log: bool,
}

const DIR_HELP: &str =
    "Application directory. By default tries to save into $XDG_STATE_HOME or $HOME/.local/state";

#[derive(Subcommand, Debug)]
#[command(version, about, long_about = None)]
enum Commands {
    #[command(about = "Starts a daemon for the application")]
    Init {
        #[arg(long, help = DIR_HELP)]
        dir: Option<PathBuf>,
    },
    #[command(
        about = "Run the monitor directly in current console. Used for debugging and for platforms without a daemon"
    )]
    Serve {
        #[arg(long, help = DIR_HELP)]
        dir: Option<PathBuf>,
    },
    #[command(about = "Stop currently running daemon.")]
    Stop {},
    #[command(about = "Check which activity signals this machine allows reading")]
    Permissions {
        #[arg(long, help = DIR_HELP)]
        dir: Option<PathBuf>,
    },
    #[command(about = "Display today's activity statistics")]
    Stats {
        #[arg(long, help = DIR_HELP)]
        dir: Option<PathBuf>,
    },
    #[command(
        about = "Report a focus change of the host window. Drives the estimate when no signal source is usable"
    )]
    Focus {
        #[arg(value_enum)]
        change: FocusChange,
        #[arg(long, help = DIR_HELP)]
        dir: Option<PathBuf>,
    },
    #[command(about = "Display the activity timeline of a day in 10 minute segments")]
    Breakdown {
        #[command(flatten)]
        command: BreakdownCommand,
        #[arg(long, help = DIR_HELP)]
        dir: Option<PathBuf>,
    },
}

impl Commands {
    fn dir(&self) -> Option<PathBuf> {
        match self {
            Commands::Init { dir }
            | Commands::Serve { dir }
            | Commands::Permissions { dir }
            | Commands::Stats { dir }
            | Commands::Focus { dir, .. }
            | Commands::Breakdown { dir, .. } => dir.clone(),
            Commands::Stop {} => None,
        }
    }
}

pub async fn run_cli() -> Result<()> {
    let args = Args::parse();

    let dir = args
        .commands
        .dir()
        .map_or_else(create_application_default_path, Ok)?;

    let logging_level = if args.log {
        Some(LevelFilter::TRACE)
    } else {
        None
    };
    enable_logging(CLI_PREFIX, &dir, logging_level, args.log)?;

    match args.commands {
        Commands::Init { dir: explicit } => restart_server(explicit.as_deref()),
        Commands::Stop {} => {
            let stopped = stop_servers()?;
            println!("Stopped {stopped} processes");
            Ok(())
        }
        Commands::Serve { .. } => start_daemon(dir).await,
        Commands::Permissions { .. } => process_permissions_command(&dir).await,
        Commands::Stats { .. } => process_stats_command(&dir).await,
        Commands::Breakdown { command, .. } => process_breakdown_command(command, &dir).await,
        Commands::Focus { change, .. } => {
            let signal = FocusSignal {
                change,
                at: Utc::now(),
            };
            tokio::fs::create_dir_all(&dir).await?;
            write_focus(&dir.join(FOCUS_FILE), &signal).await
        }
    }
}
