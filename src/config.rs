//! Hardware configuration for the controller cards and serial link.
//!
//! All card addresses, logic-cell numbers, preset numbers, and timing
//! constants live here and are injected into [`crate::session::DeviceSession`]
//! and [`crate::programmer::SequenceProgrammer`] at construction. Nothing in
//! the engine reads these from a global.
//!
//! Configuration is layered with `figment`: built-in defaults, then an
//! optional TOML profile, then `SPIM_DAQ_*` environment overrides.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Per-command and polling timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    /// How long a single serial command may wait for its acknowledgement.
    pub command_timeout_ms: u64,
    /// Drain-loop polling interval while the frame buffer is empty.
    pub poll_interval_ms: u64,
    /// Extra time past a volume's nominal duration before the drain loop
    /// declares the volume lost.
    pub drain_grace_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            command_timeout_ms: 500,
            poll_interval_ms: 1,
            drain_grace_ms: 5_000,
        }
    }
}

impl TimeoutSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

/// Serial link settings for the controller hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
        }
    }
}

/// Preset numbers on the logic card.
///
/// A preset is a factory-defined bundle of cell settings selectable with a
/// single `CCA X=<n>` command. The programmer never branches on these values
/// directly; it builds a preset plan from them (see
/// [`crate::programmer::PresetPlan`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicPresets {
    /// Base topology selected before custom cells are written.
    pub template: u8,
    /// "Cell high" preset that commits (arms) the programmed cells.
    pub armed: u8,
    /// Final routing preset exposing the armed program to the trigger lines.
    pub routing: u8,
    /// Single fixed preset used when no custom cells are requested.
    pub simple: u8,
    /// Laser preset for live/snap viewing.
    pub live: u8,
    /// Laser preset for the idle state.
    pub idle: u8,
}

impl Default for LogicPresets {
    fn default() -> Self {
        Self {
            template: 14,
            armed: 3,
            routing: 11,
            simple: 5,
            live: 30,
            idle: 0,
        }
    }
}

/// Static constants for the scanner and logic cards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Backplane address of the scanner (timing) card.
    pub scanner_card: u8,
    /// Backplane address of the programmable logic (trigger) card.
    pub logic_card: u8,

    /// Logic cell driving the camera trigger pulse.
    pub camera_cell: u8,
    /// Logic cell driving the laser gate pulse.
    pub laser_cell: u8,
    /// Cell programmed constantly high for the global shutter.
    pub always_on_cell: u8,
    /// Pointer address of the shutter output connector (BNC3).
    pub shutter_output_addr: u8,
    /// Input address of the backplane trigger TTL line.
    pub trigger_ttl_addr: u8,
    /// Input address of the logic card's 4 kHz clock.
    pub clock_addr: u8,
    /// Clock pulses per millisecond; converts durations to one-shot counts.
    pub pulses_per_ms: f64,

    pub presets: LogicPresets,
    pub serial: SerialSettings,
    pub timeouts: TimeoutSettings,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            scanner_card: 3,
            logic_card: 6,
            camera_cell: 11,
            laser_cell: 10,
            always_on_cell: 12,
            shutter_output_addr: 35,
            trigger_ttl_addr: 41,
            clock_addr: 192,
            pulses_per_ms: 4.0,
            presets: LogicPresets::default(),
            serial: SerialSettings::default(),
            timeouts: TimeoutSettings::default(),
        }
    }
}

impl HardwareConfig {
    /// Load configuration: defaults, then `path` (if it exists), then
    /// `SPIM_DAQ_*` environment variables.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SPIM_DAQ_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic checks that parsing alone cannot catch.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scanner_card == self.logic_card {
            anyhow::bail!(
                "scanner and logic cards share backplane address {}",
                self.scanner_card
            );
        }
        if self.pulses_per_ms <= 0.0 {
            anyhow::bail!("pulses_per_ms must be positive");
        }
        let cells = [self.camera_cell, self.laser_cell, self.always_on_cell];
        for cell in cells {
            if !(1..=16).contains(&cell) {
                anyhow::bail!("logic cell {} outside 1..=16", cell);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        HardwareConfig::default().validate().unwrap();
    }

    #[test]
    fn loads_toml_profile_over_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "logic_card = 7\n[timeouts]\ncommand_timeout_ms = 250\npoll_interval_ms = 2"
        )
        .unwrap();

        let config = HardwareConfig::load(file.path()).unwrap();
        assert_eq!(config.logic_card, 7);
        assert_eq!(config.timeouts.command_timeout(), Duration::from_millis(250));
        // Untouched fields keep their defaults.
        assert_eq!(config.scanner_card, 3);
        assert_eq!(config.presets.armed, 3);
    }

    #[test]
    fn missing_profile_falls_back_to_defaults() {
        let config = HardwareConfig::load("/nonexistent/profile.toml").unwrap();
        assert_eq!(config.logic_card, 6);
    }

    #[test]
    fn rejects_card_address_collision() {
        let config = HardwareConfig {
            scanner_card: 6,
            logic_card: 6,
            ..HardwareConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
