//! Continuous acquisition against the simulated board.
//!
//! Loads `config/aiousb.toml` (plus `AIOUSB_*` overrides), streams the
//! configured number of scans from a noisy mock signal and prints per-channel
//! statistics.
//!
//! ```bash
//! AIOUSB_SCAN_COUNT=5000 AIOUSB_MODE=voltage cargo run --example continuous_mock
//! ```

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use daq_driver_aiousb::{
    logging, AcquisitionMode, AcquisitionSettings, ContinuousBuffer, DeviceGeometry, DeviceRecord,
    DeviceTable, MockSignal, MockTransport,
};
use tracing::info;

/// Running min/max/mean for one channel.
#[derive(Debug, Clone, Copy)]
struct ChannelStats {
    min: f64,
    max: f64,
    sum: f64,
    count: u64,
}

impl Default for ChannelStats {
    fn default() -> Self {
        Self {
            min: f64::MAX,
            max: f64::MIN,
            sum: 0.0,
            count: 0,
        }
    }
}

impl ChannelStats {
    fn update(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
        self.count += 1;
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

fn main() -> Result<()> {
    let settings = AcquisitionSettings::load().context("loading acquisition settings")?;
    logging::init_from_settings(&settings)?;
    info!(?settings, "Loaded settings");
    if !settings.mock {
        bail!("this demo only drives the simulated board; set mock = true");
    }

    let devices = Arc::new(DeviceTable::new());
    let mock = MockTransport::new(MockSignal::Noise {
        center: 40_000,
        spread: 500,
    })
    .with_latency(Duration::from_micros(250));
    let device = devices.insert(DeviceRecord::new(
        DeviceGeometry::non_mux(16),
        Arc::new(mock),
    ))?;

    let buffer = ContinuousBuffer::new(Arc::clone(&devices), device, settings.clone())?;
    let channels = buffer.channel_numbers();
    let width = buffer.scan_width();
    let mut stats = vec![ChannelStats::default(); channels.len()];

    let started = Instant::now();
    buffer.start()?;

    let mut scans = 0usize;
    let mut counts = vec![0u16; width * 256];
    let mut volts = vec![0.0f64; width * 256];
    while buffer.status().is_running() || buffer.scans_available() > 0 {
        let read = match settings.mode {
            AcquisitionMode::Raw => {
                let n = buffer.read_scans_counts(&mut counts)?;
                for scan in counts[..n * width].chunks_exact(width) {
                    // First sample of each channel group
                    for (channel, group) in scan.chunks_exact(width / channels.len()).enumerate() {
                        stats[channel].update(f64::from(group[0]));
                    }
                }
                n
            }
            AcquisitionMode::Voltage => {
                let n = buffer.read_scans_volts(&mut volts)?;
                for scan in volts[..n * width].chunks_exact(width) {
                    for (channel, &value) in scan.iter().enumerate() {
                        stats[channel].update(value);
                    }
                }
                n
            }
        };
        scans += read;
        if read == 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }
    buffer.end()?;

    if buffer.exit_code() != 0 {
        bail!("acquisition failed with code {}", buffer.exit_code());
    }

    let elapsed = started.elapsed();
    println!(
        "{scans} scans in {:.3} s ({:.0} scans/s)",
        elapsed.as_secs_f64(),
        scans as f64 / elapsed.as_secs_f64()
    );
    for (channel, s) in channels.iter().zip(&stats) {
        println!(
            "ch{channel:>3}: min {:>10.4} max {:>10.4} mean {:>10.4}",
            s.min,
            s.max,
            s.mean()
        );
    }
    println!("{:?}", buffer.stats());
    Ok(())
}
