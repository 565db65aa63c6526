use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use dotenvy::dotenv;

use murmur_relay::config::DEFAULT_CONFIG_PATH;
use murmur_relay::{Authenticator, InMemoryDirectory, RelayConfig, RelayServer, SeedFile, TokenAuthority};

#[derive(Parser)]
#[command(name = "murmur-relay", version, about = "Real-time chat delivery relay")]
struct Cli {
    /// Path to JSON config file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH, value_name = "FILE")]
    config: PathBuf,
    /// Address to bind, overrides the config file
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,
    /// RocksDB directory, overrides the config file
    #[arg(long, value_name = "DIR")]
    storage: Option<PathBuf>,
    /// JSON file with users and conversations to load at startup
    #[arg(long, value_name = "FILE")]
    seed: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    env_logger::init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Relay terminated: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = RelayConfig::load(&cli.config)?;
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(storage) = cli.storage {
        config.storage_path = Some(storage);
    }

    let directory = Arc::new(InMemoryDirectory::new());
    let authority = Arc::new(TokenAuthority::new(config.token_ttl()));

    if let Some(seed_path) = &cli.seed {
        let users = SeedFile::load(seed_path)?.apply(&directory)?;
        for user in users {
            let token = authority.issue_token(user.id);
            log::info!("{} <{}> id={} token={token}", user.display_name, user.email, user.id);
        }
    } else {
        log::warn!("No seed file given; the directory is empty and every handshake will fail");
    }

    let server = RelayServer::new(config, directory, authority)?;
    server.run().await?;
    Ok(())
}
