//! Software-triggered single scans.
//!
//! An immediate scan samples the stored register block's channel range once,
//! outside any continuous acquisition. The board holds at most
//! [`DEVICE_SAMPLE_BUFFER`] samples per scan, so the oversample register is
//! clamped for the duration of the read. Whenever the scan needs different
//! registers, the stored block is written back afterwards.
//!
//! ```
//! use std::sync::Arc;
//! use daq_driver_aiousb::{DeviceGeometry, DeviceRecord, DeviceTable, MockSignal, MockTransport};
//!
//! # fn main() -> daq_driver_aiousb::Result<()> {
//! let devices = DeviceTable::new();
//! let mock = Arc::new(MockTransport::new(MockSignal::Constant(32768)));
//! let index = devices.insert(DeviceRecord::new(DeviceGeometry::non_mux(16), mock))?;
//!
//! let mut block = devices.config_block(index)?;
//! block.set_all_gain_codes_and_diff_mode(1, false)?;
//! block.set_scan_range(0, 3)?;
//! devices.set_config_block(index, &block)?;
//!
//! let volts = devices.read_scan_volts(index)?;
//! assert_eq!(&volts[..4], &[0.0; 4]);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use bytes::Buf;
use tracing::debug;

use crate::config_block::{AdcConfigBlock, CalMode, TriggerMode};
use crate::converter::{CountsConverter, GainRange};
use crate::device::{DeviceIndex, DeviceTable};
use crate::error::{AiousbError, Result};
use crate::transport::{
    Transport, AUR_ADC_IMMEDIATE, AUR_START_ACQUIRING_BLOCK, USB_BULK_READ_ENDPOINT,
    USB_READ_FROM_DEVICE, USB_WRITE_TO_DEVICE,
};

/// Samples the board can buffer for one immediate scan.
pub const DEVICE_SAMPLE_BUFFER: usize = 1024;

/// Oversample register limit plus the primary sample.
const MAX_SAMPLES_PER_CHANNEL: usize = 256;

/// Register block and sample layout for one immediate scan.
#[derive(Debug, Clone)]
struct ScanPlan {
    block: AdcConfigBlock,
    start: usize,
    channels: usize,
    samples_per_channel: usize,
    discard_first: bool,
}

impl ScanPlan {
    fn new(stored: &AdcConfigBlock, discard_first: bool, only: Option<u8>) -> Result<Self> {
        let mut block = stored.clone();
        let cal_mode = block.cal_mode()?;
        if let Some(channel) = only {
            block.set_scan_range(u32::from(channel), u32::from(channel))?;
        }

        let start = block.start_channel();
        let end = block.end_channel();
        if start > end {
            return Err(AiousbError::InvalidData {
                message: format!("scan range {start}..={end} is empty"),
            });
        }
        let mut channels = usize::from(end - start) + 1;
        let mut oversample = usize::from(block.oversample());
        let mut discard_first = discard_first;

        // Calibration sources return a single sample per scan
        if matches!(cal_mode, CalMode::Ground | CalMode::Reference) {
            if channels > 1 {
                block.set_end_channel(start)?;
                channels = 1;
            }
            oversample = 0;
            discard_first = false;
        }

        let trigger = block
            .trigger_mode()
            .union(TriggerMode::SCAN)
            .difference(TriggerMode::TIMER | TriggerMode::EXTERNAL);
        block.set_trigger_mode(trigger.bits())?;

        let mut samples_per_channel =
            (1 + oversample + usize::from(discard_first)).min(MAX_SAMPLES_PER_CHANNEL);
        if channels * samples_per_channel > DEVICE_SAMPLE_BUFFER {
            samples_per_channel = DEVICE_SAMPLE_BUFFER / channels;
        }
        // samples_per_channel is within 1..=256 here
        block.set_oversample((samples_per_channel - 1) as u8)?;

        Ok(Self {
            block,
            start: usize::from(start),
            channels,
            samples_per_channel,
            discard_first: discard_first && samples_per_channel > 1,
        })
    }

    fn total_samples(&self) -> usize {
        self.channels * self.samples_per_channel
    }

    fn ranges(&self) -> Vec<GainRange> {
        self.block.channel_ranges(self.start, self.channels)
    }

    /// Trigger the scan, read it back and average each channel.
    fn acquire(&self, transport: &dyn Transport) -> Result<Vec<u16>> {
        let timeout = self.block.timeout();
        let samples = self.total_samples();
        transport.control_transfer(
            USB_WRITE_TO_DEVICE,
            AUR_START_ACQUIRING_BLOCK,
            (samples >> 16) as u16,
            (samples & 0xFFFF) as u16,
            &mut [],
            timeout,
        )?;

        let mut ack = [0u8; 2];
        let acked = transport.control_transfer(
            USB_READ_FROM_DEVICE,
            AUR_ADC_IMMEDIATE,
            0,
            0,
            &mut ack,
            timeout,
        )?;
        if acked != ack.len() {
            return Err(AiousbError::InvalidData {
                message: format!("immediate trigger returned {acked} of {} bytes", ack.len()),
            });
        }

        let mut raw = vec![0u8; samples * CountsConverter::UNIT_SIZE];
        let mut filled = 0;
        while filled < raw.len() {
            let n = transport.bulk_read(USB_BULK_READ_ENDPOINT, &mut raw[filled..], timeout)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled != raw.len() {
            return Err(AiousbError::InvalidData {
                message: format!("short scan: {filled} of {} bytes", raw.len()),
            });
        }

        Ok(self.average(&raw))
    }

    /// Round-to-nearest average of each channel's samples.
    fn average(&self, mut raw: &[u8]) -> Vec<u16> {
        let skip = usize::from(self.discard_first);
        let kept = (self.samples_per_channel - skip) as u64;
        let mut counts = Vec::with_capacity(self.channels);
        for _ in 0..self.channels {
            raw.advance(skip * CountsConverter::UNIT_SIZE);
            let mut sum = 0u64;
            for _ in 0..kept {
                sum += u64::from(raw.get_u16_le());
            }
            // Average of u16 values always fits back into u16.
            counts.push(((sum + kept / 2) / kept) as u16);
        }
        counts
    }
}

/// Averaged counts for a contiguous channel range.
#[derive(Debug)]
struct ScanReading {
    start: usize,
    counts: Vec<u16>,
    ranges: Vec<GainRange>,
}

impl ScanReading {
    fn volts(&self) -> Result<Vec<f64>> {
        let converter = CountsConverter::new(self.counts.len(), 0, self.ranges.clone());
        let mut volts = Vec::new();
        if converter.convert_block(&self.counts, &mut volts) == 0 && !self.counts.is_empty() {
            return Err(AiousbError::NotEnoughMemory {
                message: format!("voltage table for {} channels", self.counts.len()),
            });
        }
        Ok(volts)
    }
}

impl DeviceTable {
    /// Take one immediate scan and return an averaged count per channel.
    ///
    /// The result has one entry per MUX channel. Channels outside the block's
    /// scan range read 0.
    pub fn read_scan_counts(&self, index: DeviceIndex) -> Result<Vec<u16>> {
        let (reading, width) = self.scan_full_width(index)?;
        let mut counts = vec![0u16; width];
        counts[reading.start..reading.start + reading.counts.len()]
            .copy_from_slice(&reading.counts);
        Ok(counts)
    }

    /// Take one immediate scan and return volts per channel.
    ///
    /// The result has one entry per MUX channel. Channels outside the block's
    /// scan range read 0.0.
    pub fn read_scan_volts(&self, index: DeviceIndex) -> Result<Vec<f64>> {
        let (reading, width) = self.scan_full_width(index)?;
        let mut volts = vec![0.0f64; width];
        volts[reading.start..reading.start + reading.counts.len()]
            .copy_from_slice(&reading.volts()?);
        Ok(volts)
    }

    /// Read a single channel, narrowing the scan range to it for one scan.
    pub fn read_channel_volts(&self, index: DeviceIndex, channel: usize) -> Result<f64> {
        let mux_channels = self.lookup(index)?.mux_channels;
        let narrowed = u8::try_from(channel)
            .ok()
            .filter(|_| channel < mux_channels)
            .ok_or_else(|| {
                AiousbError::invalid_parameter(format!(
                    "channel {channel} is outside the board's {mux_channels} channels"
                ))
            })?;
        let reading = self.immediate_scan(index, Some(narrowed))?;
        reading
            .volts()?
            .first()
            .copied()
            .ok_or_else(|| AiousbError::InvalidData {
                message: format!("no reading for channel {channel}"),
            })
    }

    fn scan_full_width(&self, index: DeviceIndex) -> Result<(ScanReading, usize)> {
        let mux_channels = self.lookup(index)?.mux_channels;
        let reading = self.immediate_scan(index, None)?;
        let width = mux_channels.max(reading.start + reading.counts.len());
        Ok((reading, width))
    }

    fn immediate_scan(&self, index: DeviceIndex, only: Option<u8>) -> Result<ScanReading> {
        let (stored, transport, discard_first) = self.with_record(index, |record| {
            (
                record.config().clone(),
                Arc::clone(record.transport()),
                record.discard_first_sample(),
            )
        })?;
        let plan = ScanPlan::new(&stored, discard_first, only)?;
        let changed = plan.block != stored;
        if changed {
            plan.block.write_to_device(transport.as_ref())?;
        }

        let sampled = plan.acquire(transport.as_ref());
        let restored = if changed {
            stored.write_to_device(transport.as_ref())
        } else {
            Ok(())
        };
        let counts = sampled?;
        restored?;

        debug!(
            device = %index,
            start = plan.start,
            channels = plan.channels,
            samples_per_channel = plan.samples_per_channel,
            "Immediate scan"
        );
        Ok(ScanReading {
            start: plan.start,
            counts,
            ranges: plan.ranges(),
        })
    }
}
