// src/main.rs
use std::path::Path;
use std::sync::atomic::Ordering;

use etude_core::config::ENV_PREFIX;
use etude_core::logging::init_logging_with_level;
use etude_core::{Config, EngineConfig, SocketEngine};
use tracing::{info, warn};

mod logic;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_CONF: &str = "etude.conf";

fn load_config() -> Result<Config, Box<dyn std::error::Error>> {
    let path = std::env::var("ETUDE_CONF").unwrap_or_else(|_| DEFAULT_CONF.to_string());
    let mut config = if Path::new(&path).exists() {
        Config::load(&path)?
    } else {
        Config::new()
    };
    config.apply_env_overrides(ENV_PREFIX);
    Ok(config)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let config = load_config()?;
    let engine_config = EngineConfig::from_config(&config)?;
    init_logging_with_level(&engine_config.log_level);

    if config.get_bool("Sock_PinEventLoop", false) {
        match core_affinity::get_core_ids().and_then(|ids| ids.into_iter().next()) {
            Some(id) if core_affinity::set_for_current(id) => info!(cpu = id.id, "event loop pinned"),
            _ => warn!("could not pin the event loop to a CPU"),
        }
    }

    let mut engine = SocketEngine::new(engine_config, logic::dispatcher());
    engine.initialize()?;
    engine.initialize_subprocess()?;
    info!(ports = ?engine.local_ports(), "etude-server listening");

    let stop = engine.stop_handle();
    ctrlc::set_handler(move || {
        stop.store(true, Ordering::Release);
    })?;

    engine.run()?;
    info!("etude-server shut down");
    Ok(())
}
