//! Kryzbu Command-Line Client
//!
//! Stores files on a Kryzbu server. Credentials are recorded locally with
//! `kryzbu register`; the server key and session key are fetched on first
//! use and cached in the data directory.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

/// Kryzbu - secure file storage client
#[derive(Parser)]
#[command(name = "kryzbu")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Data directory path
    #[arg(short, long, default_value = "~/.kryzbu")]
    data_dir: String,

    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:60606")]
    server: SocketAddr,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload files
    Upload {
        /// Local files to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Download files into the download folder
    Download {
        /// Names of stored files
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Delete stored files
    Remove {
        /// Names of stored files
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// List stored files
    List,

    /// Log in again and replace the cached session key
    Login,

    /// Save credentials for a user the server operator registered
    Register {
        /// User name
        username: String,
    },

    /// Forget the cached server key and session key
    FlushKey,

    /// Set where downloads are written
    SetDownloadFolder {
        /// Target directory
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Expand data directory
    let data_dir = PathBuf::from(shellexpand::tilde(&cli.data_dir).to_string());
    let app = commands::App::new(data_dir, cli.server)?;

    match cli.command {
        Commands::Upload { files } => {
            app.upload(&files).await?;
        }
        Commands::Download { names } => {
            app.download(&names).await?;
        }
        Commands::Remove { names } => {
            app.remove(&names).await?;
        }
        Commands::List => {
            app.list().await?;
        }
        Commands::Login => {
            app.login().await?;
        }
        Commands::Register { username } => {
            app.register(&username)?;
        }
        Commands::FlushKey => {
            app.flush_key()?;
        }
        Commands::SetDownloadFolder { dir } => {
            app.set_download_folder(&dir)?;
        }
    }

    Ok(())
}
