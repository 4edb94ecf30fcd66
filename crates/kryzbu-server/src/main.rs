//! Kryzbu storage server
//!
//! Serves registered users' files over the Kryzbu protocol and hosts the
//! operator commands for user administration and audit log checks.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use kryzbu_core::{Server, ServerConfig, ServerContext};

/// Kryzbu - secure file storage server
#[derive(Parser)]
#[command(name = "kryzbu-server")]
#[command(author, version, about)]
struct Args {
    /// Data directory holding files, logs, keys and the database
    #[arg(short, long, default_value = kryzbu_core::config::DEFAULT_DATA_DIR)]
    data_dir: String,

    /// Listen address
    #[arg(short, long, default_value = "127.0.0.1:60606")]
    listen: SocketAddr,

    /// Drop connections that stay silent this many seconds
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve clients (default)
    Run,

    /// Register a user
    AddUser {
        /// User name
        name: String,

        /// Password; prompted for when omitted
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Delete a user. Their stored files stay on disk.
    DeleteUser {
        /// User name
        name: String,
    },

    /// Check the audit log against its integrity tag
    VerifyLog,

    /// Print the file index
    ListFiles,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = ServerConfig {
        listen_addr: args.listen,
        data_dir: shellexpand::tilde(&args.data_dir).to_string().into(),
        idle_timeout: args.idle_timeout.map(Duration::from_secs),
        ..ServerConfig::default()
    };

    let ctx = ServerContext::open(config)
        .await
        .context("Failed to initialize server data directory")?;

    match args.command.unwrap_or(Commands::Run) {
        Commands::Run => run(ctx).await,
        Commands::AddUser { name, password } => add_user(&ctx, &name, password).await,
        Commands::DeleteUser { name } => delete_user(&ctx, &name).await,
        Commands::VerifyLog => verify_log(&ctx).await,
        Commands::ListFiles => list_files(&ctx).await,
    }
}

async fn run(ctx: ServerContext) -> Result<()> {
    if !ctx.audit.verify(ctx.audit.file_name()).await? {
        tracing::warn!(log = %ctx.audit.path().display(), "Audit log failed verification");
    }

    let server = Server::bind(Arc::new(ctx)).await?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

async fn add_user(ctx: &ServerContext, name: &str, password: Option<String>) -> Result<()> {
    let password = match password {
        Some(password) => password,
        None => {
            let password = rpassword::prompt_password(format!("Password for {}: ", name))
                .context("Failed to read password")?;
            let confirm = rpassword::prompt_password("Confirm password: ")
                .context("Failed to read password")?;
            if password != confirm {
                bail!("Passwords do not match");
            }
            password
        }
    };

    ctx.accounts
        .register(name, &password)
        .await
        .with_context(|| format!("Failed to register {}", name))?;
    println!("User {} registered.", name);
    Ok(())
}

async fn delete_user(ctx: &ServerContext, name: &str) -> Result<()> {
    if !ctx.accounts.unregister(name).await? {
        bail!("No such user: {}", name);
    }
    println!("User {} deleted.", name);
    Ok(())
}

async fn verify_log(ctx: &ServerContext) -> Result<()> {
    let name = ctx.audit.file_name();
    if ctx.audit.verify(name).await? {
        println!("{}: OK", name);
        Ok(())
    } else {
        bail!("{}: integrity check FAILED", name)
    }
}

async fn list_files(ctx: &ServerContext) -> Result<()> {
    let files = ctx.index.all().await?;
    if files.is_empty() {
        println!("No files indexed.");
        return Ok(());
    }

    println!("NAME\tOWNER\tUPLOADED\tDOWNLOADS");
    for file in files {
        println!("{}", file);
    }
    Ok(())
}
