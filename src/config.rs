//! TOML runtime-config loading and validation: database url, loop cadence,
//! averaging window, and the relay pin assignments. The file is optional —
//! every field has a default matching the original wiring.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_url: String,
    /// Seconds between control cycles.
    pub cycle_sec: u64,
    /// Trailing window for sensor averaging, in minutes.
    pub avg_window_min: i64,
    /// Upper bound on a single store read before it counts as unavailable.
    pub store_timeout_sec: u64,
    pub relay_active_low: bool,
    pub pins: Pins,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Pins {
    pub light: u8,
    pub fan: u8,
    pub pump: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_url: "sqlite:garden.db?mode=rwc".to_string(),
            cycle_sec: 60,
            avg_window_min: 10,
            store_timeout_sec: 5,
            relay_active_low: false,
            pins: Pins::default(),
        }
    }
}

impl Default for Pins {
    fn default() -> Self {
        // BCM pins of the original relay wiring.
        Self {
            light: 17,
            fan: 18,
            pump: 23,
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[u8] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all entries. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.db_url.trim().is_empty() {
            errors.push("db_url is empty".to_string());
        }
        if self.cycle_sec == 0 {
            errors.push("cycle_sec must be positive".to_string());
        }
        if self.avg_window_min <= 0 {
            errors.push(format!(
                "avg_window_min must be positive, got {}",
                self.avg_window_min
            ));
        }
        if self.store_timeout_sec == 0 {
            errors.push("store_timeout_sec must be positive".to_string());
        } else if self.store_timeout_sec >= self.cycle_sec && self.cycle_sec > 0 {
            errors.push(format!(
                "store_timeout_sec ({}) must be shorter than cycle_sec ({})",
                self.store_timeout_sec, self.cycle_sec
            ));
        }

        let mut seen_pins: HashSet<u8> = HashSet::new();
        for (name, pin) in [
            ("light", self.pins.light),
            ("fan", self.pins.fan),
            ("pump", self.pins.pump),
        ] {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "pins.{name}: {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen_pins.insert(pin) {
                errors.push(format!(
                    "pins.{name}: gpio {pin} is already used by another relay"
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file is not an
/// error — the defaults describe the original single-enclosure wiring.
pub fn load(path: &str) -> Result<Config> {
    let config = match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str::<Config>(&contents)
            .with_context(|| format!("failed to parse config: {path}"))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path, "no config file found — using defaults");
            Config::default()
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read config: {path}"));
        }
    };

    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
