//! `olaf-server` binary: parse config, init logging, run the server.

use clap::Parser;
use olaf_overlay::config::ServerConfig;
use olaf_overlay::crypto::KeyPair;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::parse();
    let keys = KeyPair::generate()?;

    olaf_overlay::server::run(config, keys).await?;
    Ok(())
}
