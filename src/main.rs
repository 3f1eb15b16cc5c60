mod config;
mod control;
mod db;
mod relay;

use anyhow::Result;
use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;

use control::ControlLoop;
use db::Db;
use relay::{Channel, RelayBoard};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let mut cfg = config::load(&config_path)?;
    if let Ok(url) = env::var("DB_URL") {
        cfg.db_url = url;
    }

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.db_url).await?;
    db.migrate().await?;

    // ── Relay board (forced OFF at construction) ────────────────────
    let channel_to_gpio = [
        (Channel::Light, cfg.pins.light),
        (Channel::Fan, cfg.pins.fan),
        (Channel::Pump, cfg.pins.pump),
    ];
    let relays = RelayBoard::new(&channel_to_gpio, cfg.relay_active_low)?;

    info!(
        db_url = %cfg.db_url,
        cycle_sec = cfg.cycle_sec,
        light_pin = cfg.pins.light,
        fan_pin = cfg.pins.fan,
        pump_pin = cfg.pins.pump,
        "garden control starting"
    );

    // Runs until SIGINT (exit 0) or an unrecoverable relay error (exit 1,
    // after a best-effort all-OFF).
    ControlLoop::new(db, relays, &cfg).run().await
}
