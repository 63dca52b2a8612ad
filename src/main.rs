use log::*;
use spoons::{config::PoolConfig, Result, WarmPool};
use tokio::signal::unix::{signal, SignalKind};

const CONFIG_ENV: &str = "SPOONS_CONFIG";

fn load_config() -> Result<PoolConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok());
    match path {
        Some(path) => {
            info!("loading config from {path}");
            PoolConfig::from_file(path)
        }
        None => {
            info!("no config given, using defaults");
            Ok(PoolConfig::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = load_config()?;
    let pool = WarmPool::bootstrap(&config).await?;
    info!(
        "pool of {} ready on {} ({:?})",
        pool.target_size(),
        pool.shared().endpoint(),
        pool.shared().role()
    );

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = terminate.recv() => (),
    }

    info!("shutting down");
    pool.shutdown().await
}
