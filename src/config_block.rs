//! ADC configuration register block.
//!
//! The ADC keeps its configuration in a small on-device register file. The
//! host mirrors it in an [`AdcConfigBlock`] and writes it back with a vendor
//! control transfer before every acquisition.
//!
//! # Wire layout
//!
//! ```text
//!  byte  0..=15  gain/differential byte per channel group
//!                  bits 0-2 gain code, bit 3 differential, bits 4-7 zero
//!  byte  16      calibration mode
//!  byte  17      trigger / counter flags (mask 0x1F)
//!  byte  18      start/end channel nibble pair
//!                  non-MUX: bits 0-3 start, bits 4-7 end
//!                  MUX:     bits 0-3 start low, bits 4-7 end low
//!  byte  19      oversample count
//!  byte  20      MUX only: bits 0-3 start high, bits 4-7 end high
//! ```
//!
//! Non-MUX boards use a 20-byte block, MUX boards a 21-byte block.

use std::fmt;
use std::time::Duration;

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::converter::GainRange;
use crate::device::{DeviceGeometry, DeviceIndex};
use crate::error::{AiousbError, Result};
use crate::transport::{
    Transport, AUR_ADC_GET_CONFIG, AUR_ADC_SET_CONFIG, USB_READ_FROM_DEVICE, USB_WRITE_TO_DEVICE,
};

/// First gain-code register.
pub const AD_CONFIG_GAIN_CODE: usize = 0;
/// Number of gain-code registers (channel groups).
pub const AD_NUM_GAIN_CODE_REGISTERS: usize = 16;
/// Calibration mode register.
pub const AD_CONFIG_CAL_MODE: usize = 16;
/// Trigger and counter control register.
pub const AD_CONFIG_TRIG_COUNT: usize = 17;
/// Start/end channel register.
pub const AD_CONFIG_START_END: usize = 18;
/// Oversample register.
pub const AD_CONFIG_OVERSAMPLE: usize = 19;
/// Start/end channel extension register on MUX boards.
pub const AD_CONFIG_MUX_START_END: usize = 20;

/// Register block length for non-MUX boards.
pub const AD_CONFIG_REGISTERS: usize = 20;
/// Register block length for MUX boards.
pub const AD_MUX_CONFIG_REGISTERS: usize = 21;
/// Largest register block any board uses.
pub const AD_MAX_CONFIG_REGISTERS: usize = 21;
/// Highest channel count addressable by the scan registers.
pub const AD_MAX_CHANNELS: usize = 128;

/// Gain code bits within a gain register.
pub const AD_GAIN_CODE_MASK: u8 = 0x07;
/// Differential mode bit within a gain register.
pub const AD_DIFFERENTIAL_MODE: u8 = 0x08;

const REGISTER_STORAGE: usize = AD_MAX_CONFIG_REGISTERS + 1;
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Input range selected by a channel group's gain register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum GainCode {
    /// 0 to +10 V
    #[default]
    Unipolar10V = 0,
    /// -10 to +10 V
    Bipolar10V = 1,
    /// 0 to +5 V
    Unipolar5V = 2,
    /// -5 to +5 V
    Bipolar5V = 3,
    /// 0 to +2 V
    Unipolar2V = 4,
    /// -2 to +2 V
    Bipolar2V = 5,
    /// 0 to +1 V
    Unipolar1V = 6,
    /// -1 to +1 V
    Bipolar1V = 7,
}

impl GainCode {
    /// All gain codes in register order.
    pub const ALL: [GainCode; 8] = [
        Self::Unipolar10V,
        Self::Bipolar10V,
        Self::Unipolar5V,
        Self::Bipolar5V,
        Self::Unipolar2V,
        Self::Bipolar2V,
        Self::Unipolar1V,
        Self::Bipolar1V,
    ];

    /// Decode the low three bits of a gain register.
    pub fn from_bits(bits: u8) -> Self {
        Self::ALL[usize::from(bits & AD_GAIN_CODE_MASK)]
    }

    /// Voltage range this code selects.
    pub fn range(self) -> GainRange {
        let (min, span) = match self {
            Self::Unipolar10V => (0.0, 10.0),
            Self::Bipolar10V => (-10.0, 20.0),
            Self::Unipolar5V => (0.0, 5.0),
            Self::Bipolar5V => (-5.0, 10.0),
            Self::Unipolar2V => (0.0, 2.0),
            Self::Bipolar2V => (-2.0, 4.0),
            Self::Unipolar1V => (0.0, 1.0),
            Self::Bipolar1V => (-1.0, 2.0),
        };
        GainRange::new(min, min + span)
    }
}

impl TryFrom<u8> for GainCode {
    type Error = AiousbError;

    fn try_from(code: u8) -> Result<Self> {
        Self::ALL
            .get(usize::from(code))
            .copied()
            .ok_or_else(|| AiousbError::invalid_parameter(format!("gain code {code} out of range")))
    }
}

/// Calibration source routed into the ADC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CalMode {
    /// Measure the selected input channels
    #[default]
    Normal = 0,
    /// Measure ground
    Ground = 1,
    /// Measure the internal reference
    Reference = 3,
    /// Measure ground in bipolar mode
    BipolarGround = 5,
}

impl TryFrom<u8> for CalMode {
    type Error = AiousbError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Ground),
            3 => Ok(Self::Reference),
            5 => Ok(Self::BipolarGround),
            other => Err(AiousbError::invalid_parameter(format!(
                "calibration mode {other} is not one of 0, 1, 3, 5"
            ))),
        }
    }
}

bitflags! {
    /// Trigger and counter control bits (register 17).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TriggerMode: u8 {
        /// Start conversions from counter 2
        const TIMER = 0x01;
        /// Start conversions from the external trigger input
        const EXTERNAL = 0x02;
        /// One trigger starts a whole scan
        const SCAN = 0x04;
        /// External trigger fires on the falling edge
        const FALLING_EDGE = 0x08;
        /// Counter 0 is clocked externally
        const CTR0_EXT = 0x10;
    }
}

impl TriggerMode {
    /// Bits the trigger register may carry.
    pub const VALID_MASK: u8 = 0x1F;
}

/// Multiplexer geometry copied from the owning device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MuxGeometry {
    /// Channels sharing one gain register
    pub channels_per_group: usize,
    /// Channels reachable through the multiplexer
    pub mux_channel_count: usize,
    /// Whether the geometry came from a device
    pub defined: bool,
}

/// Host-side mirror of the ADC register block.
#[derive(Clone, PartialEq, Eq)]
pub struct AdcConfigBlock {
    size: usize,
    registers: [u8; REGISTER_STORAGE],
    device: Option<DeviceIndex>,
    testing: bool,
    timeout: Duration,
    mux: MuxGeometry,
}

impl Default for AdcConfigBlock {
    fn default() -> Self {
        Self {
            size: 0,
            registers: [0; REGISTER_STORAGE],
            device: None,
            testing: false,
            timeout: DEFAULT_TIMEOUT,
            mux: MuxGeometry::default(),
        }
    }
}

impl fmt::Debug for AdcConfigBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdcConfigBlock")
            .field("size", &self.size)
            .field("registers", &format_args!("{:02x?}", self.as_bytes()))
            .field("device", &self.device)
            .field("testing", &self.testing)
            .field("mux", &self.mux)
            .finish()
    }
}

impl AdcConfigBlock {
    /// Block sized and shaped for `geometry`, registers zeroed.
    pub fn from_device(geometry: &DeviceGeometry) -> Self {
        let mut block = Self::default();
        block.initialize_from_device(geometry);
        block
    }

    /// Parse a register snapshot read from a device.
    ///
    /// The snapshot is corrected in place with [`verify_and_correct`](Self::verify_and_correct).
    pub fn from_bytes(bytes: &[u8], geometry: &DeviceGeometry) -> Result<Self> {
        if bytes.len() != AD_CONFIG_REGISTERS && bytes.len() != AD_MUX_CONFIG_REGISTERS {
            return Err(AiousbError::invalid_parameter(format!(
                "register block must be {AD_CONFIG_REGISTERS} or {AD_MUX_CONFIG_REGISTERS} bytes, got {}",
                bytes.len()
            )));
        }
        let mut block = Self::from_device(geometry);
        block.size = bytes.len();
        block.registers[..bytes.len()].copy_from_slice(bytes);
        block.verify_and_correct(geometry);
        Ok(block)
    }

    /// Reset to the shape of `geometry` with every register cleared.
    pub fn initialize_from_device(&mut self, geometry: &DeviceGeometry) {
        self.size = geometry.config_bytes;
        self.registers = [0; REGISTER_STORAGE];
        self.mux = MuxGeometry {
            channels_per_group: geometry.channels_per_group,
            mux_channel_count: geometry.mux_channels,
            defined: true,
        };
        self.timeout = geometry.timeout;
    }

    /// Deep copy of `source`. The source must be at least a full non-MUX block.
    pub fn copy_from(&mut self, source: &AdcConfigBlock) -> Result<()> {
        if source.size < AD_CONFIG_REGISTERS {
            return Err(AiousbError::invalid_parameter(format!(
                "source block holds {} registers, need at least {AD_CONFIG_REGISTERS}",
                source.size
            )));
        }
        self.clone_from(source);
        Ok(())
    }

    /// Register block length in bytes (0 when uninitialized).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this is the 21-byte MUX layout.
    pub fn is_mux(&self) -> bool {
        self.size == AD_MUX_CONFIG_REGISTERS
    }

    /// Multiplexer geometry.
    pub fn mux(&self) -> MuxGeometry {
        self.mux
    }

    /// Owning device, if any.
    pub fn device(&self) -> Option<DeviceIndex> {
        self.device
    }

    /// Record the owning device.
    pub fn set_device(&mut self, device: Option<DeviceIndex>) {
        self.device = device;
    }

    /// Whether device transfers are suppressed.
    pub fn is_testing(&self) -> bool {
        self.testing
    }

    /// Suppress (or re-enable) device transfers for this block.
    pub fn set_testing(&mut self, testing: bool) {
        self.testing = testing;
    }

    /// Communication timeout for transfers made with this block.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Set the communication timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// The registers as sent on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.registers[..self.size.min(REGISTER_STORAGE)]
    }

    /// Raw register value, or `None` past the end of the block.
    pub fn register(&self, index: usize) -> Option<u8> {
        self.as_bytes().get(index).copied()
    }

    // ---------------------------------------------------------------------
    // Gain and differential mode
    // ---------------------------------------------------------------------

    fn ensure_initialized(&self) -> Result<()> {
        if self.size == 0 {
            return Err(AiousbError::InvalidData {
                message: "register block is uninitialized (size 0)".to_string(),
            });
        }
        Ok(())
    }

    /// Gain register index serving `channel`.
    fn gain_register(&self, channel: usize) -> Result<usize> {
        self.ensure_initialized()?;
        if self.mux.channels_per_group == 0 {
            return Err(AiousbError::InvalidDeviceSetting {
                message: "device reports zero channels per group".to_string(),
            });
        }
        let limit = AD_MAX_CHANNELS.min(self.mux.mux_channel_count);
        if channel >= limit {
            return Err(AiousbError::invalid_parameter(format!(
                "channel {channel} outside 0..{limit}"
            )));
        }
        let register = AD_CONFIG_GAIN_CODE + channel / self.mux.channels_per_group;
        if register >= AD_CONFIG_GAIN_CODE + AD_NUM_GAIN_CODE_REGISTERS {
            return Err(AiousbError::invalid_parameter(format!(
                "channel {channel} maps past the gain registers"
            )));
        }
        Ok(register)
    }

    /// Set the gain code of the group containing `channel`, keeping its
    /// differential bit.
    pub fn set_gain_code(&mut self, channel: usize, code: u8) -> Result<()> {
        self.ensure_initialized()?;
        let code = GainCode::try_from(code)?;
        let register = self.gain_register(channel)?;
        let value = &mut self.registers[register];
        *value = (*value & !AD_GAIN_CODE_MASK) | code as u8;
        Ok(())
    }

    /// Gain code of the group containing `channel`.
    ///
    /// Channels outside the MUX range, or an unusable block, report the
    /// default gain code instead of an error.
    pub fn gain_code(&self, channel: usize) -> GainCode {
        match self.gain_register(channel) {
            Ok(register) => GainCode::from_bits(self.registers[register]),
            Err(_) => GainCode::default(),
        }
    }

    /// Enable or disable differential input for the group containing `channel`.
    pub fn set_differential_mode(&mut self, channel: usize, differential: bool) -> Result<()> {
        let register = self.gain_register(channel)?;
        if differential {
            self.registers[register] |= AD_DIFFERENTIAL_MODE;
        } else {
            self.registers[register] &= !AD_DIFFERENTIAL_MODE;
        }
        Ok(())
    }

    /// Whether the group containing `channel` is differential.
    pub fn is_differential(&self, channel: usize) -> bool {
        self.gain_register(channel)
            .map(|register| self.registers[register] & AD_DIFFERENTIAL_MODE != 0)
            .unwrap_or(false)
    }

    /// Program every gain register with the same code and differential bit.
    pub fn set_all_gain_codes_and_diff_mode(&mut self, code: u8, differential: bool) -> Result<()> {
        self.ensure_initialized()?;
        let mut value = GainCode::try_from(code)? as u8;
        if differential {
            value |= AD_DIFFERENTIAL_MODE;
        }
        let gains = AD_CONFIG_GAIN_CODE..AD_CONFIG_GAIN_CODE + AD_NUM_GAIN_CODE_REGISTERS;
        self.registers[gains].fill(value);
        Ok(())
    }

    /// Input range of each channel in `start..start + count`.
    pub fn channel_ranges(&self, start: usize, count: usize) -> Vec<GainRange> {
        (start..start + count)
            .map(|channel| self.gain_code(channel).range())
            .collect()
    }

    // ---------------------------------------------------------------------
    // Calibration, trigger, oversample
    // ---------------------------------------------------------------------

    /// Route a calibration source into the ADC.
    pub fn set_cal_mode(&mut self, mode: CalMode) -> Result<()> {
        self.ensure_initialized()?;
        self.registers[AD_CONFIG_CAL_MODE] = mode as u8;
        Ok(())
    }

    /// Decode the calibration register.
    pub fn cal_mode(&self) -> Result<CalMode> {
        self.ensure_initialized()?;
        let raw = self.registers[AD_CONFIG_CAL_MODE];
        CalMode::try_from(raw).map_err(|_| AiousbError::InvalidData {
            message: format!("calibration register holds invalid mode {raw}"),
        })
    }

    /// Write the trigger register. Bits outside [`TriggerMode::VALID_MASK`]
    /// are rejected.
    pub fn set_trigger_mode(&mut self, bits: u8) -> Result<()> {
        self.ensure_initialized()?;
        if bits & !TriggerMode::VALID_MASK != 0 {
            return Err(AiousbError::invalid_parameter(format!(
                "trigger mode {bits:#04x} has bits outside {:#04x}",
                TriggerMode::VALID_MASK
            )));
        }
        self.registers[AD_CONFIG_TRIG_COUNT] = bits;
        Ok(())
    }

    /// Decode the trigger register.
    pub fn trigger_mode(&self) -> TriggerMode {
        TriggerMode::from_bits_truncate(self.registers[AD_CONFIG_TRIG_COUNT])
    }

    /// Extra samples taken per channel per scan.
    pub fn set_oversample(&mut self, oversample: u8) -> Result<()> {
        self.ensure_initialized()?;
        self.registers[AD_CONFIG_OVERSAMPLE] = oversample;
        Ok(())
    }

    /// Extra samples taken per channel per scan.
    pub fn oversample(&self) -> u8 {
        self.registers[AD_CONFIG_OVERSAMPLE]
    }

    // ---------------------------------------------------------------------
    // Scan range
    // ---------------------------------------------------------------------

    /// Set the first channel of a scan.
    ///
    /// Non-MUX blocks keep only the low nibble.
    pub fn set_start_channel(&mut self, channel: u8) -> Result<()> {
        self.ensure_initialized()?;
        let reg = &mut self.registers;
        if self.size == AD_MUX_CONFIG_REGISTERS {
            reg[AD_CONFIG_MUX_START_END] = (reg[AD_CONFIG_MUX_START_END] & 0xF0) | (channel >> 4);
        }
        reg[AD_CONFIG_START_END] = (reg[AD_CONFIG_START_END] & 0xF0) | (channel & 0x0F);
        Ok(())
    }

    /// Set the last channel of a scan.
    ///
    /// Non-MUX blocks keep only the low nibble.
    pub fn set_end_channel(&mut self, channel: u8) -> Result<()> {
        self.ensure_initialized()?;
        let reg = &mut self.registers;
        if self.size == AD_MUX_CONFIG_REGISTERS {
            reg[AD_CONFIG_MUX_START_END] = (channel & 0xF0) | (reg[AD_CONFIG_MUX_START_END] & 0x0F);
        }
        reg[AD_CONFIG_START_END] = (channel << 4) | (reg[AD_CONFIG_START_END] & 0x0F);
        Ok(())
    }

    /// First channel of a scan.
    pub fn start_channel(&self) -> u8 {
        let low = self.registers[AD_CONFIG_START_END] & 0x0F;
        if self.size == AD_MUX_CONFIG_REGISTERS {
            ((self.registers[AD_CONFIG_MUX_START_END] & 0x0F) << 4) | low
        } else {
            low
        }
    }

    /// Last channel of a scan.
    pub fn end_channel(&self) -> u8 {
        let low = self.registers[AD_CONFIG_START_END] >> 4;
        if self.size == AD_MUX_CONFIG_REGISTERS {
            (self.registers[AD_CONFIG_MUX_START_END] & 0xF0) | low
        } else {
            low
        }
    }

    /// Program the scan to cover `start..=end`.
    ///
    /// An out-of-range request leaves the registers untouched and still
    /// returns `Ok`; callers validate the range themselves.
    pub fn set_scan_range(&mut self, start: u32, end: u32) -> Result<()> {
        self.ensure_initialized()?;
        let end_limit = self.mux.mux_channel_count as u32;
        if end >= AD_MAX_CHANNELS as u32 || end > end_limit || start > end {
            debug!(start, end, mux_channels = end_limit, "Ignoring invalid scan range");
            return Ok(());
        }
        // Both values are below AD_MAX_CHANNELS here.
        self.set_end_channel(end as u8)?;
        self.set_start_channel(start as u8)
    }

    // ---------------------------------------------------------------------
    // Device boundary
    // ---------------------------------------------------------------------

    /// Replace anything a device could not have meant with safe defaults.
    ///
    /// Run after reading a block back from hardware. Never fails.
    pub fn verify_and_correct(&mut self, geometry: &DeviceGeometry) {
        if self.size == 0 {
            self.initialize_from_device(geometry);
        }

        let valid_gain_bits = AD_GAIN_CODE_MASK | AD_DIFFERENTIAL_MODE;
        for register in AD_CONFIG_GAIN_CODE..AD_CONFIG_GAIN_CODE + AD_NUM_GAIN_CODE_REGISTERS {
            if self.registers[register] & !valid_gain_bits != 0 {
                warn!(register, value = self.registers[register], "Correcting gain register");
                self.registers[register] = GainCode::default() as u8;
            }
        }

        if CalMode::try_from(self.registers[AD_CONFIG_CAL_MODE]).is_err() {
            warn!(value = self.registers[AD_CONFIG_CAL_MODE], "Correcting calibration mode");
            self.registers[AD_CONFIG_CAL_MODE] = CalMode::Normal as u8;
        }

        if self.registers[AD_CONFIG_TRIG_COUNT] & !TriggerMode::VALID_MASK != 0 {
            warn!(value = self.registers[AD_CONFIG_TRIG_COUNT], "Clearing trigger register");
            self.registers[AD_CONFIG_TRIG_COUNT] = 0;
        }

        let channels = geometry.mux_channels;
        let end = usize::from(self.end_channel());
        if channels > 0 && (end >= channels || self.start_channel() > self.end_channel()) {
            warn!(
                start = self.start_channel(),
                end = self.end_channel(),
                "Resetting scan range to full device span"
            );
            let full_end = (channels - 1).min(AD_MAX_CHANNELS - 1) as u32;
            // The block is initialized at this point, so this cannot fail.
            let _ = self.set_scan_range(0, full_end);
        }
    }

    /// Read the block back from the device and correct it.
    pub fn read_from_device(transport: &dyn Transport, geometry: &DeviceGeometry) -> Result<Self> {
        let mut buf = vec![0u8; geometry.config_bytes];
        let transferred = transport.control_transfer(
            USB_READ_FROM_DEVICE,
            AUR_ADC_GET_CONFIG,
            0,
            0,
            &mut buf,
            geometry.timeout,
        )?;
        if transferred != buf.len() {
            return Err(AiousbError::InvalidData {
                message: format!(
                    "short register read: {transferred} of {} bytes",
                    buf.len()
                ),
            });
        }
        let block = Self::from_bytes(&buf, geometry)?;
        debug!(registers = ?block.as_bytes(), "Read ADC config block");
        Ok(block)
    }

    /// Write the block to the device. Blocks in testing mode skip the transfer.
    pub fn write_to_device(&self, transport: &dyn Transport) -> Result<()> {
        self.ensure_initialized()?;
        if self.testing {
            debug!("Testing mode: skipping ADC config write");
            return Ok(());
        }
        let mut buf = self.as_bytes().to_vec();
        let transferred = transport.control_transfer(
            USB_WRITE_TO_DEVICE,
            AUR_ADC_SET_CONFIG,
            0,
            0,
            &mut buf,
            self.timeout,
        )?;
        if transferred != buf.len() {
            return Err(AiousbError::InvalidData {
                message: format!(
                    "short register write: {transferred} of {} bytes",
                    buf.len()
                ),
            });
        }
        debug!(registers = ?self.as_bytes(), "Wrote ADC config block");
        Ok(())
    }
}
