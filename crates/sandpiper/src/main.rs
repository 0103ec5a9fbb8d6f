use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sandpiper_sftp::{Config, SftpServer, User};

#[derive(Parser)]
#[command(name = "sandpiper")]
#[command(about = "Multi-tenant SFTP server with local and S3 backends", long_about = None)]
#[command(version)]
struct Cli {
    /// Server configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// User database file
    #[arg(short, long, default_value = "users.json")]
    users: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sandpiper=info,sandpiper_sftp=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let users: HashMap<String, User> = serde_json::from_str(
        &std::fs::read_to_string(&cli.users)
            .with_context(|| format!("reading {}", cli.users.display()))?,
    )
    .with_context(|| format!("parsing {}", cli.users.display()))?;

    let server = SftpServer::new(config);
    for user in users.into_values() {
        server.add_user(user).await;
    }
    info!("user database loaded");

    server.run().await.context("server terminated")?;
    Ok(())
}
