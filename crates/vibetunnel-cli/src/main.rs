//! vt — VibeTunnel terminal forwarder and session management CLI

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::error;

#[derive(Parser)]
#[command(name = "vt")]
#[command(author, version, about = "VibeTunnel - forward terminal sessions to remote clients", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log verbosity (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    verbosity: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command inside a recorded, remotely controllable session
    Fwd {
        /// Use this session id instead of generating one
        #[arg(long)]
        session_id: Option<String>,

        /// Terminal title handling (none, filter, static)
        #[arg(long)]
        title_mode: Option<String>,

        /// Update the title/name of an existing session and exit
        #[arg(long)]
        update_title: Option<String>,

        /// Write logs to this file instead of stderr
        #[arg(long)]
        log_file: Option<std::path::PathBuf>,

        /// The command to run
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// List sessions under the control root
    List {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Kill a session (SIGTERM with escalation by default)
    Kill {
        /// Session id
        id: String,

        /// Signal name or number (e.g. TERM, SIGKILL, 9)
        #[arg(short, long)]
        signal: Option<String>,
    },

    /// Rename a session
    Rename {
        /// Session id
        id: String,

        /// New name; uniquified with " (2)", " (3)", … on collision
        name: String,
    },

    /// Remove exited session directories
    Cleanup {
        /// Remove one specific session directory
        id: Option<String>,

        /// Also remove sessions recorded by older builds
        #[arg(long)]
        old_versions: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The forwarder may log to a file; it initializes its own subscriber.
    let fwd_log_file = matches!(
        &cli.command,
        Commands::Fwd { log_file: Some(_), .. }
    );
    if !fwd_log_file {
        init_logging(cli.verbosity.as_deref(), None);
    }

    let result: Result<i32> = match cli.command {
        Commands::Fwd {
            session_id,
            title_mode,
            update_title,
            log_file,
            command,
        } => {
            if let Some(path) = &log_file {
                init_logging(cli.verbosity.as_deref(), Some(path));
            }
            commands::fwd::execute(commands::fwd::FwdOptions {
                session_id,
                title_mode,
                update_title,
                command,
            })
            .await
        }
        Commands::List { json } => commands::list::execute(json).await.map(|()| 0),
        Commands::Kill { id, signal } => {
            commands::kill::execute(&id, signal.as_deref()).await.map(|()| 0)
        }
        Commands::Rename { id, name } => {
            commands::rename::execute(&id, &name).await.map(|()| 0)
        }
        Commands::Cleanup { id, old_versions } => {
            commands::cleanup::execute(id.as_deref(), old_versions)
                .await
                .map(|()| 0)
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("command failed: {e}");
            eprintln!("{} {}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn init_logging(verbosity: Option<&str>, log_file: Option<&std::path::Path>) {
    let filter = verbosity
        .map(str::to_string)
        .or_else(vibetunnel_core::config::log_level_from_env)
        .unwrap_or_else(|| "info".to_string());

    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or(std::path::Path::new("."));
            let file = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "vt.log".to_string());
            let appender = tracing_appender::rolling::never(dir, file);
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(appender)
                .with_ansi(false)
                .with_target(false)
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        None => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
    }
}
