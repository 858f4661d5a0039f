// crates/server/src/main.rs
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scribe_core::config::Settings;

/// Multi-project engineering activity ledger server.
#[derive(Debug, Parser)]
#[command(name = "scribe-server", version, about)]
struct Args {
    /// Repository root the ledger operates in.
    #[arg(long, default_value = ".")]
    repo_root: PathBuf,

    /// Listen port.
    #[arg(long, default_value_t = 47851)]
    port: u16,

    /// Bind address.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let repo_root = args
        .repo_root
        .canonicalize()
        .with_context(|| format!("repo root {} not accessible", args.repo_root.display()))?;

    let settings = Settings::load(&repo_root);
    info!(
        repo_root = %repo_root.display(),
        db = %settings.db_path.display(),
        "starting scribe-server"
    );

    let (router, _state) = scribe_server::create_app(settings).await?;

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "listening");
    axum::serve(listener, router).await?;
    Ok(())
}
