//! visiond - object detection service
//!
//! This daemon:
//! 1. Loads the service config and every enabled model
//! 2. Serves the analysis API
//! 3. Stops cleanly on Ctrl-C

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use waste_vision::{
    api::{ApiConfig, ApiServer},
    config::ServiceConfig,
    DetectionDispatcher, ImageCodec,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (TOML or JSON).
    #[arg(long, env = "VISION_CONFIG")]
    config: Option<PathBuf>,
    /// Listen address, overrides the config file.
    #[arg(long)]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = ServiceConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.addr = addr;
    }

    let registry = config.build_registry()?;
    log::info!(
        "models ready: {} (default {})",
        registry.list().join(", "),
        config.default_model
    );
    let dispatcher = Arc::new(DetectionDispatcher::new(
        Arc::new(registry),
        ImageCodec::new(config.crop_quality),
    ));

    let api_handle = ApiServer::new(ApiConfig::from(&config), dispatcher).spawn()?;
    log::info!("visiond running on {}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("visiond waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
