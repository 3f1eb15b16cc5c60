//! Relay control for the light, fan, and pump channels. The `gpio` feature
//! gates the real rppal driver; without it, a mock board tracks state in
//! memory and records every write (the loop tests assert on that history).

use anyhow::Result;

#[cfg(feature = "gpio")]
use anyhow::Context;
#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};
#[cfg(feature = "gpio")]
use std::collections::HashMap;

/// The three actuator channels. The enclosure has exactly one of each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Light,
    Fan,
    Pump,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Light, Channel::Fan, Channel::Pump];

    pub fn name(self) -> &'static str {
        match self {
            Channel::Light => "light",
            Channel::Fan => "fan",
            Channel::Pump => "pump",
        }
    }
}

// ---------------------------------------------------------------------------
// Real relay board (production — requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct RelayBoard {
    pins: HashMap<Channel, OutputPin>,
    active_low: bool, // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl RelayBoard {
    pub fn new(channel_to_gpio: &[(Channel, u8)], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new().context("failed to open gpio device")?;
        let mut pins = HashMap::new();

        for (channel, pin_num) in channel_to_gpio {
            let mut pin = gpio
                .get(*pin_num)
                .with_context(|| format!("failed to claim gpio {pin_num} for {}", channel.name()))?
                .into_output();

            // Fail-safe: ensure "OFF" at startup
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }

            pins.insert(*channel, pin);
        }

        Ok(Self { pins, active_low })
    }

    /// Last driven state of a channel, read back from the pin level.
    pub fn get(&self, channel: Channel) -> bool {
        match self.pins.get(&channel) {
            Some(pin) => pin.is_set_high() != self.active_low,
            None => false,
        }
    }

    pub fn set(&mut self, channel: Channel, on: bool) -> Result<()> {
        let pin = self
            .pins
            .get_mut(&channel)
            .with_context(|| format!("no gpio pin claimed for {}", channel.name()))?;

        // active-low relay: LOW = ON, HIGH = OFF
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        Ok(())
    }

    pub fn all_off(&mut self) -> Result<()> {
        for channel in Channel::ALL {
            self.set(channel, false)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (development — no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct RelayBoard {
    light: bool,
    fan: bool,
    pump: bool,
    /// Every write issued, in order. Lets tests verify the loop only writes
    /// on change.
    pub(crate) history: Vec<(Channel, bool)>,
    #[cfg(test)]
    pub(crate) fail_writes: bool,
}

#[cfg(not(feature = "gpio"))]
impl RelayBoard {
    pub fn new(channel_to_gpio: &[(Channel, u8)], _active_low: bool) -> Result<Self> {
        for (channel, pin_num) in channel_to_gpio {
            tracing::debug!(
                channel = channel.name(),
                gpio = *pin_num,
                "mock relay registered (not wired)"
            );
        }
        Ok(Self {
            light: false,
            fan: false,
            pump: false,
            history: Vec::new(),
            #[cfg(test)]
            fail_writes: false,
        })
    }

    pub fn get(&self, channel: Channel) -> bool {
        match channel {
            Channel::Light => self.light,
            Channel::Fan => self.fan,
            Channel::Pump => self.pump,
        }
    }

    pub fn set(&mut self, channel: Channel, on: bool) -> Result<()> {
        #[cfg(test)]
        if self.fail_writes {
            anyhow::bail!("injected relay write failure");
        }

        match channel {
            Channel::Light => self.light = on,
            Channel::Fan => self.fan = on,
            Channel::Pump => self.pump = on,
        }
        self.history.push((channel, on));
        tracing::debug!(channel = channel.name(), on, "mock relay set");
        Ok(())
    }

    pub fn all_off(&mut self) -> Result<()> {
        for channel in Channel::ALL {
            self.set(channel, false)?;
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const PINS: [(Channel, u8); 3] = [
        (Channel::Light, 17),
        (Channel::Fan, 18),
        (Channel::Pump, 23),
    ];

    #[test]
    fn board_starts_all_off() {
        let board = RelayBoard::new(&PINS, false).unwrap();
        for channel in Channel::ALL {
            assert!(!board.get(channel));
        }
    }

    #[test]
    fn set_on_then_read_back() {
        let mut board = RelayBoard::new(&PINS, false).unwrap();
        board.set(Channel::Fan, true).unwrap();
        assert!(board.get(Channel::Fan));
        assert!(!board.get(Channel::Light));
        assert!(!board.get(Channel::Pump));
    }

    #[test]
    fn set_off_after_on() {
        let mut board = RelayBoard::new(&PINS, false).unwrap();
        board.set(Channel::Pump, true).unwrap();
        board.set(Channel::Pump, false).unwrap();
        assert!(!board.get(Channel::Pump));
    }

    #[test]
    fn all_off_resets_everything() {
        let mut board = RelayBoard::new(&PINS, false).unwrap();
        board.set(Channel::Light, true).unwrap();
        board.set(Channel::Fan, true).unwrap();
        board.all_off().unwrap();
        for channel in Channel::ALL {
            assert!(!board.get(channel));
        }
    }

    #[test]
    fn history_records_writes_in_order() {
        let mut board = RelayBoard::new(&PINS, false).unwrap();
        board.set(Channel::Light, true).unwrap();
        board.set(Channel::Light, false).unwrap();
        assert_eq!(
            board.history,
            vec![(Channel::Light, true), (Channel::Light, false)]
        );
    }

    #[test]
    fn injected_failure_surfaces_as_error() {
        let mut board = RelayBoard::new(&PINS, false).unwrap();
        board.fail_writes = true;
        assert!(board.set(Channel::Fan, true).is_err());
    }

    #[test]
    fn channel_names() {
        assert_eq!(Channel::Light.name(), "light");
        assert_eq!(Channel::Fan.name(), "fan");
        assert_eq!(Channel::Pump.name(), "pump");
    }
}
