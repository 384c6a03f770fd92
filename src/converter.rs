//! Raw counts to volts.
//!
//! The ADC returns unsigned 16-bit counts, `oversample + 1` of them per channel
//! per scan. [`CountsConverter`] averages each channel's group (integer
//! truncation) and maps the average through that channel's [`GainRange`]:
//!
//! ```text
//! volts = (average / 65536) * (max - min) + min
//! ```

use tracing::trace;

use crate::config_block::{AdcConfigBlock, GainCode, AD_CONFIG_GAIN_CODE, AD_NUM_GAIN_CODE_REGISTERS};
use crate::fifo::{Fifo, FifoMode};

/// Full-scale count span of the 16-bit ADC.
pub const COUNTS_FULL_SCALE: f64 = 65536.0;

/// Voltage range of one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainRange {
    /// Voltage at count 0
    pub min: f64,
    /// Voltage at full scale
    pub max: f64,
}

impl GainRange {
    /// Range from `min` to `max`.
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Width of the range in volts.
    pub fn span(&self) -> f64 {
        self.max - self.min
    }

    /// Convert one averaged count.
    pub fn counts_to_volts(&self, counts: u16) -> f64 {
        (f64::from(counts) / COUNTS_FULL_SCALE) * self.span() + self.min
    }
}

/// One range per gain register, in register order.
pub fn gain_ranges_from_config(block: &AdcConfigBlock) -> Vec<GainRange> {
    (AD_CONFIG_GAIN_CODE..AD_CONFIG_GAIN_CODE + AD_NUM_GAIN_CODE_REGISTERS)
        .map(|register| {
            let bits = block.register(register).unwrap_or_default();
            GainCode::from_bits(bits).range()
        })
        .collect()
}

/// Averages oversampled counts into per-channel voltages.
#[derive(Debug, Clone)]
pub struct CountsConverter {
    channels: usize,
    oversamples: usize,
    ranges: Vec<GainRange>,
}

impl CountsConverter {
    /// Bytes per raw count.
    pub const UNIT_SIZE: usize = std::mem::size_of::<u16>();

    /// Converter for `channels` channels, each sampled `oversamples + 1` times
    /// per scan. Channel `ch` uses `ranges[ch % ranges.len()]`.
    pub fn new(channels: usize, oversamples: usize, ranges: Vec<GainRange>) -> Self {
        let ranges = if ranges.is_empty() {
            vec![GainCode::default().range()]
        } else {
            ranges
        };
        Self {
            channels: channels.max(1),
            oversamples,
            ranges,
        }
    }

    /// Number of channels per scan.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Extra samples per channel per scan.
    pub fn oversamples(&self) -> usize {
        self.oversamples
    }

    /// Raw counts making up one scan.
    pub fn counts_per_scan(&self) -> usize {
        self.channels * (self.oversamples + 1)
    }

    /// Range applied to `channel`.
    pub fn range_for(&self, channel: usize) -> GainRange {
        self.ranges[channel % self.ranges.len()]
    }

    fn convert_scan(&self, scan: &[u16], out: &mut Vec<f64>) {
        let group = self.oversamples + 1;
        for (channel, samples) in scan.chunks_exact(group).enumerate() {
            let sum: u64 = samples.iter().map(|&c| u64::from(c)).sum();
            // Average of u16 values always fits back into u16.
            let average = (sum / group as u64) as u16;
            out.push(self.range_for(channel).counts_to_volts(average));
        }
    }

    /// Convert every complete scan in `raw`, appending one voltage per
    /// channel per scan to `volts`.
    ///
    /// Returns the raw bytes consumed, or 0 if scratch space could not be
    /// reserved.
    pub fn convert_block(&self, raw: &[u16], volts: &mut Vec<f64>) -> usize {
        let per_scan = self.counts_per_scan();
        let scans = raw.len() / per_scan;
        if volts.try_reserve(scans * self.channels).is_err() {
            return 0;
        }
        for scan in raw.chunks_exact(per_scan) {
            self.convert_scan(scan, volts);
        }
        scans * per_scan * Self::UNIT_SIZE
    }

    /// Drain up to `byte_count` bytes of whole scans from `input` and push
    /// their voltages into `output`.
    ///
    /// Only as many scans as both fifos can take are moved. Returns the raw
    /// bytes consumed.
    pub fn convert_fifo_to_fifo(
        &self,
        output: &mut Fifo<f64>,
        input: &mut Fifo<u16>,
        byte_count: usize,
    ) -> usize {
        let per_scan = self.counts_per_scan();
        let scans = (byte_count / Self::UNIT_SIZE / per_scan)
            .min(input.readable_span() / per_scan)
            .min(output.writable_span() / self.channels);
        if scans == 0 {
            return 0;
        }

        let mut raw = Vec::new();
        let mut volts = Vec::new();
        if raw.try_reserve_exact(scans * per_scan).is_err()
            || volts.try_reserve_exact(scans * self.channels).is_err()
        {
            return 0;
        }
        raw.resize(scans * per_scan, 0);
        let popped = input.read(&mut raw, FifoMode::AllOrNone);
        let consumed = self.convert_block(&raw[..popped], &mut volts);
        let pushed = output.write(&volts, FifoMode::AllOrNone);
        trace!(scans, consumed, pushed, "Converted counts to volts");
        consumed
    }
}
