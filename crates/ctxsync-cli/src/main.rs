//! ctxsync CLI - Command-line interface for ctxsync
//!
//! Runs the sync server and offers small clients for watching a project
//! and inspecting a running server.

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

const DEFAULT_URL: &str = "ws://127.0.0.1:8765";

#[derive(Parser)]
#[command(name = "ctxsync")]
#[command(author = "ctxsync Contributors")]
#[command(version)]
#[command(about = "Real-time project context sync over WebSockets", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config to .ctxsync/config.json
    Init {
        /// Path to initialize (defaults to current directory)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Start the sync server
    Serve {
        /// Config file (defaults to .ctxsync/config.json, then the user config dir)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Address to bind, overriding the config
        #[arg(long, env = "CTXSYNC_ADDR")]
        addr: Option<SocketAddr>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Headless mode: bind to 0.0.0.0 for remote access (WSL/Docker/Server)
        #[arg(long)]
        headless: bool,

        /// Directory of the persistent project store
        #[arg(long, env = "CTXSYNC_STORE")]
        store: Option<PathBuf>,
    },

    /// Follow live updates for a project
    Watch {
        /// Project to follow
        project: String,

        /// Server URL
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,

        /// User id to connect as
        #[arg(long)]
        user: Option<String>,

        /// Replay changes newer than this id
        #[arg(long, default_value = "0")]
        since: u64,
    },

    /// Show connection and dispatcher statistics of a running server
    Stats {
        /// Server URL
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let result = match cli.command {
        Commands::Init { path } => commands::init(&path),
        Commands::Serve {
            config,
            addr,
            port,
            headless,
            store,
        } => {
            commands::serve(commands::ServeOptions {
                config,
                addr,
                port,
                headless,
                store,
            })
            .await
        }
        Commands::Watch {
            project,
            url,
            user,
            since,
        } => commands::watch(&project, &url, user.as_deref(), since).await,
        Commands::Stats { url } => commands::stats(&url).await,
    };

    if let Err(e) = result {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}
