use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use llima_box::config::Config;
use llima_box::{cli, ssh, ui};

#[derive(Parser)]
#[command(
    name = "llima-box",
    version,
    about = "Isolated per-project development environments inside a single Lima VM",
    long_about = "llima-box creates isolated environments using a Lima VM and Linux\n\
                  mount namespaces. Each project gets its own guest user and a\n\
                  persistent namespace with the project directory bind-mounted at\n\
                  /workspace, while all environments share one VM."
)]
struct Cli {
    /// Path to config file (TOML).
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enter an isolated environment shell.
    ///
    /// Creates the environment on first use. A command after `--` runs
    /// inside the environment instead of an interactive shell.
    Shell {
        /// Project path (default: current directory).
        path: Option<PathBuf>,
        /// Command to run inside the environment (default: bash).
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// List all environments.
    List,
    /// Delete an environment.
    Delete {
        /// Project path (default: current directory).
        path: Option<PathBuf>,
        /// Delete without confirmation.
        #[arg(long, short)]
        force: bool,
    },
    /// Delete all environments.
    DeleteAll {
        /// Delete without confirmation.
        #[arg(long, short)]
        force: bool,
    },
    /// Show VM discovery state.
    #[command(hide = true)]
    DebugVm,
    /// Show the generated environment name for a path.
    #[command(hide = true)]
    DebugName {
        /// Project path (default: current directory).
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Cli::parse();

    let config = match Config::load_or_default(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            ui::error(&format!("{e:#}"));
            std::process::exit(1);
        }
    };

    // Ctrl-C aborts in-flight remote commands through the shared token.
    // Interactive sessions run the terminal in raw mode, where the key
    // reaches the guest directly instead of raising a signal here.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let result: Result<i32> = match args.command {
        Commands::Shell { path, command } => cli::run_shell(&config, &cancel, path, command)
            .await
            .map(|status| status as i32),
        Commands::List => cli::run_list(&config, &cancel).await.map(|_| 0),
        Commands::Delete { path, force } => cli::run_delete(&config, &cancel, path, force)
            .await
            .map(|_| 0),
        Commands::DeleteAll { force } => cli::run_delete_all(&config, &cancel, force)
            .await
            .map(|_| 0),
        Commands::DebugVm => cli::run_debug_vm(&config).await.map(|_| 0),
        Commands::DebugName { path } => cli::run_debug_name(path).map(|_| 0),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) if e.is::<ssh::Cancelled>() => {
            ui::warning("Cancelled");
            std::process::exit(130);
        }
        Err(e) => {
            ui::error(&format!("{e:#}"));
            std::process::exit(1);
        }
    }
}
