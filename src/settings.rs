//! Acquisition settings.
//!
//! Settings are plain serde structs loaded with figment from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `AIOUSB_` (e.g. `AIOUSB_SCAN_COUNT=500`)
//!
//! # Example
//! ```no_run
//! use daq_driver_aiousb::AcquisitionSettings;
//!
//! # fn main() -> daq_driver_aiousb::Result<()> {
//! let settings = AcquisitionSettings::load_from("config/aiousb.toml")?;
//! println!("{} scans of {} channels", settings.scan_count, settings.channel_count);
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::config_block::AD_MAX_CHANNELS;
use crate::error::{AiousbError, Result};

/// Default settings file, relative to the working directory.
pub const DEFAULT_SETTINGS_PATH: &str = "config/aiousb.toml";

/// What the acquisition ring buffer holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionMode {
    /// Raw ADC counts, every oversample kept
    #[default]
    Raw,
    /// Averaged voltages, one per channel per scan
    Voltage,
}

/// Geometry and pacing of one continuous acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Scans to acquire before the worker stops on its own
    #[serde(default = "default_scan_count")]
    pub scan_count: usize,
    /// Channels per scan
    #[serde(default = "default_channel_count")]
    pub channel_count: usize,
    /// First channel of the scan
    #[serde(default)]
    pub start_channel: usize,
    /// Extra samples per channel per scan (0-255)
    #[serde(default)]
    pub oversample: u8,
    /// Gain code applied to every channel group (0-7)
    #[serde(default)]
    pub gain_code: u8,
    /// Differential input on every channel group
    #[serde(default)]
    pub differential: bool,
    /// Raw counts or volts
    #[serde(default)]
    pub mode: AcquisitionMode,
    /// Scan clock in Hz
    #[serde(default = "default_clock_hz")]
    pub clock_hz: u32,
    /// Transport timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Pace scans with the on-board counters
    #[serde(default = "default_counter_control")]
    pub counter_control: bool,
    /// Drop the first scan of the stream
    #[serde(default)]
    pub discard_first_sample: bool,
    /// Bytes requested per bulk read
    #[serde(default = "default_transfer_size")]
    pub transfer_size: usize,
    /// Use the simulated transport
    #[serde(default)]
    pub mock: bool,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default value functions
fn default_scan_count() -> usize {
    1000
}

fn default_channel_count() -> usize {
    16
}

fn default_clock_hz() -> u32 {
    100_000
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_counter_control() -> bool {
    true
}

fn default_transfer_size() -> usize {
    64 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            scan_count: default_scan_count(),
            channel_count: default_channel_count(),
            start_channel: 0,
            oversample: 0,
            gain_code: 0,
            differential: false,
            mode: AcquisitionMode::default(),
            clock_hz: default_clock_hz(),
            timeout_ms: default_timeout_ms(),
            counter_control: default_counter_control(),
            discard_first_sample: false,
            transfer_size: default_transfer_size(),
            mock: false,
            log_level: default_log_level(),
        }
    }
}

impl AcquisitionSettings {
    /// Start building settings from the defaults.
    pub fn builder() -> AcquisitionSettingsBuilder {
        AcquisitionSettingsBuilder::default()
    }

    /// Load from [`DEFAULT_SETTINGS_PATH`] and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_SETTINGS_PATH)
    }

    /// Load from a TOML file, then apply `AIOUSB_*` environment overrides.
    ///
    /// A missing file leaves the defaults in place. The result is validated.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("AIOUSB_"))
            .extract()
            .map_err(|e| AiousbError::InvalidConfig {
                message: e.to_string(),
            })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Write the settings as TOML.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| AiousbError::InvalidConfig {
            message: e.to_string(),
        })?;
        std::fs::write(path.as_ref(), text).map_err(|e| AiousbError::InvalidConfig {
            message: format!("writing {}: {e}", path.as_ref().display()),
        })
    }

    /// Check ranges and cross-field consistency.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(AiousbError::InvalidConfig { message });

        if self.scan_count == 0 {
            return invalid("scan_count must be greater than 0".to_string());
        }
        if self.channel_count == 0 {
            return invalid("channel_count must be greater than 0".to_string());
        }
        if self.start_channel + self.channel_count > AD_MAX_CHANNELS {
            return invalid(format!(
                "channels {}..{} exceed the {AD_MAX_CHANNELS}-channel scan limit",
                self.start_channel,
                self.start_channel + self.channel_count
            ));
        }
        if self.gain_code > 7 {
            return invalid(format!("gain_code {} must be 0-7", self.gain_code));
        }
        if self.clock_hz == 0 {
            return invalid("clock_hz must be greater than 0".to_string());
        }
        if self.timeout_ms == 0 {
            return invalid("timeout_ms must be greater than 0".to_string());
        }
        if self.transfer_size < 2 {
            return invalid(format!(
                "transfer_size {} cannot hold one sample",
                self.transfer_size
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }

        Ok(())
    }

    /// Raw counts making up one scan.
    pub fn counts_per_scan(&self) -> usize {
        self.channel_count * (usize::from(self.oversample) + 1)
    }

    /// Transport timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Builder for [`AcquisitionSettings`].
#[derive(Debug, Clone, Default)]
pub struct AcquisitionSettingsBuilder {
    settings: AcquisitionSettings,
}

impl AcquisitionSettingsBuilder {
    /// Scans to acquire.
    pub fn scan_count(mut self, scans: usize) -> Self {
        self.settings.scan_count = scans;
        self
    }

    /// Channels per scan.
    pub fn channel_count(mut self, channels: usize) -> Self {
        self.settings.channel_count = channels;
        self
    }

    /// First channel of the scan.
    pub fn start_channel(mut self, channel: usize) -> Self {
        self.settings.start_channel = channel;
        self
    }

    /// Extra samples per channel per scan.
    pub fn oversample(mut self, oversample: u8) -> Self {
        self.settings.oversample = oversample;
        self
    }

    /// Gain code for every channel group.
    pub fn gain_code(mut self, code: u8) -> Self {
        self.settings.gain_code = code;
        self
    }

    /// Differential input for every channel group.
    pub fn differential(mut self, differential: bool) -> Self {
        self.settings.differential = differential;
        self
    }

    /// Raw counts or volts.
    pub fn mode(mut self, mode: AcquisitionMode) -> Self {
        self.settings.mode = mode;
        self
    }

    /// Scan clock in Hz.
    pub fn clock_hz(mut self, hz: u32) -> Self {
        self.settings.clock_hz = hz;
        self
    }

    /// Transport timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.settings.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Pace scans with the on-board counters.
    pub fn counter_control(mut self, enabled: bool) -> Self {
        self.settings.counter_control = enabled;
        self
    }

    /// Drop the first scan of the stream.
    pub fn discard_first_sample(mut self, discard: bool) -> Self {
        self.settings.discard_first_sample = discard;
        self
    }

    /// Bytes requested per bulk read.
    pub fn transfer_size(mut self, bytes: usize) -> Self {
        self.settings.transfer_size = bytes;
        self
    }

    /// Use the simulated transport.
    pub fn mock(mut self, mock: bool) -> Self {
        self.settings.mock = mock;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<AcquisitionSettings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let settings = AcquisitionSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.clock_hz, 100_000);
        assert_eq!(settings.timeout(), Duration::from_millis(1000));
    }

    #[test]
    fn test_builder_rejects_bad_geometry() {
        assert!(AcquisitionSettings::builder().scan_count(0).build().is_err());
        assert!(AcquisitionSettings::builder()
            .start_channel(120)
            .channel_count(16)
            .build()
            .is_err());
        assert!(AcquisitionSettings::builder().gain_code(8).build().is_err());
        assert!(AcquisitionSettings::builder().clock_hz(0).build().is_err());

        let settings = AcquisitionSettings::builder()
            .channel_count(4)
            .oversample(3)
            .build()
            .unwrap();
        assert_eq!(settings.counts_per_scan(), 16);
    }

    #[test]
    #[serial]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "scan_count = 250\nchannel_count = 8\noversample = 2\nmode = \"voltage\"\nclock_hz = 5000"
        )
        .unwrap();

        let settings = AcquisitionSettings::load_from(file.path()).unwrap();
        assert_eq!(settings.scan_count, 250);
        assert_eq!(settings.channel_count, 8);
        assert_eq!(settings.oversample, 2);
        assert_eq!(settings.mode, AcquisitionMode::Voltage);
        assert_eq!(settings.clock_hz, 5000);
        assert_eq!(settings.timeout_ms, 1000);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "scan_count = 250").unwrap();

        std::env::set_var("AIOUSB_SCAN_COUNT", "42");
        let result = AcquisitionSettings::load_from(file.path());
        std::env::remove_var("AIOUSB_SCAN_COUNT");

        assert_eq!(result.unwrap().scan_count, 42);
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AcquisitionSettings::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings, AcquisitionSettings::default());
    }

    #[test]
    #[serial]
    fn test_invalid_file_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "channel_count = 0").unwrap();
        assert!(matches!(
            AcquisitionSettings::load_from(file.path()),
            Err(AiousbError::InvalidConfig { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aiousb.toml");
        let settings = AcquisitionSettings::builder()
            .scan_count(10)
            .mode(AcquisitionMode::Voltage)
            .build()
            .unwrap();
        settings.save(&path).unwrap();
        assert_eq!(AcquisitionSettings::load_from(&path).unwrap(), settings);
    }
}
