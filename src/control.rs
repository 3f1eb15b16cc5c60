//! Environmental control decision engine: once per cadence the loop averages
//! recent sensor history, evaluates the light schedule, the pump hysteresis
//! state machine, and the fan thresholds, then drives each relay only when
//! its decision changed.
//!
//! ## Pump state machine
//!
//! ```text
//! Off ──[moisture < min]──▶ Running ──[pump_duration elapsed]──▶ Off
//!  ▲                           │
//!  └──[moisture unavailable, or relay ON with no recorded start]──┘
//! ```
//!
//! Both recovery edges resolve toward OFF: the loop never waters on missing
//! data, and never trusts a running pump it cannot account for.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Timelike;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::{AveragedWindow, Db};
use crate::relay::{Channel, RelayBoard};

// ---------------------------------------------------------------------------
// Documented defaults, applied when a setting is absent or undecodable
// ---------------------------------------------------------------------------

pub const DEFAULT_TEMPERATURE_MAX: f64 = 75.0; // °F
pub const DEFAULT_HUMIDITY_MAX: f64 = 80.0; // %
pub const DEFAULT_CO2_MAX: f64 = 1500.0; // ppm
pub const DEFAULT_MOISTURE_MIN: f64 = 30.0; // %
pub const DEFAULT_PUMP_DURATION_SEC: f64 = 60.0;
pub const DEFAULT_LIGHT_ON: &str = "06:00";
pub const DEFAULT_LIGHT_OFF: &str = "20:00";

const DEFAULT_LIGHT_ON_MIN: u16 = 6 * 60;
const DEFAULT_LIGHT_OFF_MIN: u16 = 20 * 60;

// ---------------------------------------------------------------------------
// Light schedule
// ---------------------------------------------------------------------------

/// Parse a strict "HH:MM" string into minutes since midnight.
pub fn parse_hhmm(s: &str) -> Option<u16> {
    let (h, m) = s.trim().split_once(':')?;
    let h: u16 = h.parse().ok()?;
    let m: u16 = m.parse().ok()?;
    if h < 24 && m < 60 {
        Some(h * 60 + m)
    } else {
        None
    }
}

/// Schedule comparison in minutes since midnight, boundaries inclusive on
/// both ends. `on_time > off_time` means the lit interval wraps midnight
/// (e.g. 20:00 to 06:00).
pub fn should_light_be_on(now: u16, on_time: u16, off_time: u16) -> bool {
    if on_time <= off_time {
        on_time <= now && now <= off_time
    } else {
        now >= on_time || now <= off_time
    }
}

// ---------------------------------------------------------------------------
// Fan thresholds
// ---------------------------------------------------------------------------

/// Which threshold comparison asked for ventilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanTrigger {
    Temperature,
    Humidity,
    Co2,
}

impl FanTrigger {
    pub fn name(self) -> &'static str {
        match self {
            FanTrigger::Temperature => "temperature",
            FanTrigger::Humidity => "humidity",
            FanTrigger::Co2 => "co2",
        }
    }
}

/// Fan is on iff any averaged quantity exceeds its max. An empty window
/// means OFF — ventilation never runs on absent data.
pub fn should_fan_be_on(
    avg: &AveragedWindow,
    temp_max: f64,
    humidity_max: f64,
    co2_max: f64,
) -> (bool, Vec<FanTrigger>) {
    if !avg.has_samples() {
        return (false, Vec::new());
    }

    let mut triggers = Vec::new();
    if avg.temperature.is_some_and(|t| t > temp_max) {
        triggers.push(FanTrigger::Temperature);
    }
    if avg.humidity.is_some_and(|h| h > humidity_max) {
        triggers.push(FanTrigger::Humidity);
    }
    if avg.co2.is_some_and(|c| c > co2_max) {
        triggers.push(FanTrigger::Co2);
    }

    (!triggers.is_empty(), triggers)
}

// ---------------------------------------------------------------------------
// Pump state machine
// ---------------------------------------------------------------------------

/// Duration-based hysteresis for the water pump. `started_at` is recorded
/// only when this state machine itself turned the pump on; a relay that
/// reports ON without a recorded start is desynchronized hardware and is
/// always stopped.
pub struct PumpController {
    started_at: Option<Instant>,
}

impl PumpController {
    pub fn new() -> Self {
        Self { started_at: None }
    }

    /// One evaluation per cycle. `pump_is_running` is the physical relay
    /// state read at the top of the cycle, before any write.
    pub fn evaluate(
        &mut self,
        avg_moisture: Option<f64>,
        pump_is_running: bool,
        moisture_min: f64,
        pump_duration: Duration,
        now: Instant,
    ) -> bool {
        let Some(moisture) = avg_moisture else {
            // Never water on missing data; drop any in-flight run.
            if self.started_at.take().is_some() {
                warn!("moisture unavailable while pump running — forcing off");
            } else {
                debug!("no moisture readings available, keeping pump off");
            }
            return false;
        };

        if pump_is_running {
            let Some(started_at) = self.started_at else {
                warn!("pump is running but no start time recorded, turning off");
                return false;
            };

            let elapsed = now.saturating_duration_since(started_at);
            if elapsed >= pump_duration {
                info!(elapsed_sec = elapsed.as_secs(), "pump timer expired");
                self.started_at = None;
                return false;
            }
            true
        } else if moisture < moisture_min {
            info!(
                moisture = format!("{moisture:.1}"),
                min = moisture_min,
                duration_sec = pump_duration.as_secs(),
                "starting pump: moisture below minimum"
            );
            self.started_at = Some(now);
            true
        } else {
            false
        }
    }
}

impl Default for PumpController {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Control loop
// ---------------------------------------------------------------------------

pub struct ControlLoop {
    db: Db,
    relays: RelayBoard,
    pump: PumpController,
    cycle: Duration,
    avg_window_min: i64,
    store_timeout: Duration,
}

impl ControlLoop {
    pub fn new(db: Db, relays: RelayBoard, cfg: &Config) -> Self {
        Self {
            db,
            relays,
            pump: PumpController::new(),
            cycle: Duration::from_secs(cfg.cycle_sec),
            avg_window_min: cfg.avg_window_min,
            store_timeout: Duration::from_secs(cfg.store_timeout_sec),
        }
    }

    /// Run until a termination signal or an unrecoverable relay error. All
    /// relays are forced OFF before the first cycle and again on the way
    /// out, whichever way the loop ends.
    pub async fn run(mut self) -> Result<()> {
        self.relays.all_off().context("startup all-off failed")?;

        info!(
            cycle_sec = self.cycle.as_secs(),
            window_min = self.avg_window_min,
            "control loop started"
        );

        let mut ticker = tokio::time::interval(self.cycle);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Pinned once so a signal arriving mid-cycle is still observed at
        // the top of the next select, never lost.
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("termination signal received — shutting down");
                    break Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!("control cycle failed: {e:#}");
                        break Err(e);
                    }
                }
            }
        };

        if let Err(e) = self.relays.all_off() {
            error!("shutdown all-off failed: {e:#}");
        } else {
            info!("all relays off, control loop stopped");
        }
        result
    }

    /// One decision cycle: average, evaluate light / pump / fan, write each
    /// relay on change. `Err` only for relay write failures — store trouble
    /// degrades to the fail-safe decision instead.
    pub(crate) async fn run_cycle(&mut self) -> Result<()> {
        debug!("running control systems check");

        let avg = match timeout(
            self.store_timeout,
            self.db.average_since(self.avg_window_min),
        )
        .await
        {
            Ok(Ok(avg)) => avg,
            Ok(Err(e)) => {
                warn!("average query failed: {e:#} — treating window as empty");
                AveragedWindow::empty()
            }
            Err(_) => {
                warn!(
                    timeout_sec = self.store_timeout.as_secs(),
                    "average query timed out — treating window as empty"
                );
                AveragedWindow::empty()
            }
        };

        let light_on = self.light_decision().await;
        self.apply(Channel::Light, light_on, "schedule")?;

        // Read the physical pump state before this cycle writes anything.
        let pump_is_running = self.relays.get(Channel::Pump);
        let pump_on = self.pump_decision(&avg, pump_is_running).await;
        self.apply(Channel::Pump, pump_on, "moisture")?;

        let (fan_on, triggers) = self.fan_decision(&avg).await;
        let fan_reason = if triggers.is_empty() {
            "thresholds".to_string()
        } else {
            triggers
                .iter()
                .map(|t| t.name())
                .collect::<Vec<_>>()
                .join(", ")
        };
        self.apply(Channel::Fan, fan_on, &fan_reason)?;

        Ok(())
    }

    /// Write-on-change: a relay is driven only when the decision differs
    /// from its last-known state, and the transition is logged.
    fn apply(&mut self, channel: Channel, desired: bool, reason: &str) -> Result<()> {
        let current = self.relays.get(channel);
        if current == desired {
            return Ok(());
        }

        self.relays
            .set(channel, desired)
            .with_context(|| format!("failed to drive {} relay", channel.name()))?;

        info!(
            channel = channel.name(),
            from = current,
            to = desired,
            reason,
            "relay state changed"
        );
        Ok(())
    }

    // ── Per-controller decisions ─────────────────────────────────

    async fn light_decision(&self) -> bool {
        let on_raw = self.schedule_setting("on_time", DEFAULT_LIGHT_ON).await;
        let off_raw = self.schedule_setting("off_time", DEFAULT_LIGHT_OFF).await;

        let on_time = parse_hhmm(&on_raw).unwrap_or_else(|| {
            warn!(value = %on_raw, "unparseable light.on_time — using default");
            DEFAULT_LIGHT_ON_MIN
        });
        let off_time = parse_hhmm(&off_raw).unwrap_or_else(|| {
            warn!(value = %off_raw, "unparseable light.off_time — using default");
            DEFAULT_LIGHT_OFF_MIN
        });

        let local = chrono::Local::now().time();
        let now = (local.hour() * 60 + local.minute()) as u16;

        let result = should_light_be_on(now, on_time, off_time);
        debug!(
            now = now,
            on_time,
            off_time,
            on = result,
            "light schedule decision"
        );
        result
    }

    async fn pump_decision(&mut self, avg: &AveragedWindow, pump_is_running: bool) -> bool {
        let min = self.threshold("moisture", "min", DEFAULT_MOISTURE_MIN).await;
        let duration_sec = self
            .threshold("moisture", "pump_duration", DEFAULT_PUMP_DURATION_SEC)
            .await;

        let (Some(min), Some(duration_sec)) = (min, duration_sec) else {
            // Settings store unreachable — same fail-safe as missing data.
            return self.pump.evaluate(
                None,
                pump_is_running,
                DEFAULT_MOISTURE_MIN,
                Duration::from_secs_f64(DEFAULT_PUMP_DURATION_SEC),
                Instant::now(),
            );
        };

        self.pump.evaluate(
            avg.moisture,
            pump_is_running,
            min,
            Duration::from_secs_f64(duration_sec.max(0.0)),
            Instant::now(),
        )
    }

    async fn fan_decision(&self, avg: &AveragedWindow) -> (bool, Vec<FanTrigger>) {
        if !avg.has_samples() {
            debug!("no readings available, keeping fan off");
            return (false, Vec::new());
        }

        let temp_max = self
            .threshold("temperature", "max", DEFAULT_TEMPERATURE_MAX)
            .await;
        let humidity_max = self.threshold("humidity", "max", DEFAULT_HUMIDITY_MAX).await;
        let co2_max = self.threshold("co2", "max", DEFAULT_CO2_MAX).await;

        let (Some(temp_max), Some(humidity_max), Some(co2_max)) =
            (temp_max, humidity_max, co2_max)
        else {
            return (false, Vec::new());
        };

        should_fan_be_on(avg, temp_max, humidity_max, co2_max)
    }

    // ── Bounded settings reads ───────────────────────────────────

    /// Numeric threshold with a bounded read. `None` means the store was
    /// unreachable this cycle; the affected decision falls back to OFF.
    async fn threshold(&self, category: &str, key: &str, default: f64) -> Option<f64> {
        match timeout(
            self.store_timeout,
            self.db.setting_number(category, key, default),
        )
        .await
        {
            Ok(Ok(v)) => Some(v),
            Ok(Err(e)) => {
                warn!(category, key, "threshold read failed: {e:#}");
                None
            }
            Err(_) => {
                warn!(category, key, "threshold read timed out");
                None
            }
        }
    }

    /// Schedule string with a bounded read; store trouble falls back to the
    /// documented default so the light decision stays well-defined.
    async fn schedule_setting(&self, key: &str, default: &str) -> String {
        match timeout(self.store_timeout, self.db.setting_text("light", key, default)).await {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                warn!(key, "light schedule read failed: {e:#} — using default");
                default.to_string()
            }
            Err(_) => {
                warn!(key, "light schedule read timed out — using default");
                default.to_string()
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
