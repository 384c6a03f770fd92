//! Continuous acquisition.
//!
//! A [`ContinuousBuffer`] streams samples from one board into a host-side ring
//! buffer with a background worker thread. The caller drains the ring buffer
//! at its own pace.
//!
//! # Architecture
//!
//! ```text
//!        ┌─────────────────────┐
//!        │  Transport (bulk)   │
//!        └──────────┬──────────┘
//!                   │ little-endian u16 counts
//!        ┌──────────▼──────────┐
//!        │  worker thread      │  budget, retries, discard
//!        └──────────┬──────────┘
//!                   │ push_n
//!        ┌──────────▼──────────┐
//!        │  SampleStore        │  Raw: counts fifo
//!        │                     │  Voltage: staging fifo -> converter -> volts fifo
//!        └──────────┬──────────┘
//!                   │ pop_counts / pop_volts / read_scans_*
//!        ┌──────────▼──────────┐
//!        │  caller             │
//!        └─────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! `NotStarted → Running → Terminated → Joined`. The worker moves `Running` to
//! `Terminated` when the scan budget is reached or after more than
//! [`MAX_USB_FAILURES`] transport errors. [`ContinuousBuffer::end`] requests
//! termination, joins the worker and leaves the buffer `Joined`. Reads keep
//! working in every state so the tail of an acquisition can be drained after
//! `end()`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use daq_driver_aiousb::{
//!     ContinuousBuffer, DeviceGeometry, DeviceRecord, DeviceTable, MockSignal, MockTransport,
//! };
//!
//! # fn main() -> daq_driver_aiousb::Result<()> {
//! let devices = Arc::new(DeviceTable::new());
//! let transport = Arc::new(MockTransport::new(MockSignal::Ramp));
//! let index = devices.insert(DeviceRecord::new(DeviceGeometry::non_mux(16), transport))?;
//!
//! let buffer = ContinuousBuffer::for_counts(Arc::clone(&devices), index, 100, 4)?;
//! buffer.start()?;
//!
//! let mut scans = vec![0u16; 4 * 10];
//! while buffer.status().is_running() || buffer.scans_available() > 0 {
//!     let n = buffer.read_scans_counts(&mut scans)?;
//!     // process n scans
//! #   let _ = n;
//! }
//! buffer.end()?;
//! assert_eq!(buffer.exit_code(), 0);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Buf;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::channel_mask::ChannelMask;
use crate::clock::ClockDivisors;
use crate::config_block::{AdcConfigBlock, CalMode, TriggerMode};
use crate::converter::CountsConverter;
use crate::device::{DeviceIndex, DeviceTable};
use crate::error::{AiousbError, Result};
use crate::fifo::{Fifo, FifoMode};
use crate::settings::{AcquisitionMode, AcquisitionSettings};
use crate::transport::{
    Transport, AUR_CBUF_SETUP, AUR_GEN_ABORT_AND_CLEAR, AUR_GEN_CLEAR_FIFO,
    AUR_START_ACQUIRING_BLOCK, USB_BULK_READ_ENDPOINT, USB_WRITE_TO_DEVICE,
};

/// Bulk-read failures absorbed before the acquisition is abandoned.
pub const MAX_USB_FAILURES: u32 = 5;

/// Lifecycle of a [`ContinuousBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquisitionStatus {
    /// Constructed, worker not spawned
    #[default]
    NotStarted,
    /// Worker is reading from the device
    Running,
    /// Worker has been told to stop or has stopped
    Terminated,
    /// Worker thread has been joined
    Joined,
}

impl AcquisitionStatus {
    /// Name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NotStarted",
            Self::Running => "Running",
            Self::Terminated => "Terminated",
            Self::Joined => "Joined",
        }
    }

    /// Whether the worker is still acquiring.
    pub fn is_running(self) -> bool {
        self == Self::Running
    }
}

impl fmt::Display for AcquisitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters for one acquisition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquisitionStats {
    /// Bulk reads that returned data
    pub transfers: u64,
    /// Bytes received from the device
    pub bytes_received: u64,
    /// Raw counts accepted into the ring buffer
    pub samples_pushed: u64,
    /// Raw counts lost because the ring buffer was full
    pub samples_dropped: u64,
    /// Bulk reads that failed
    pub usb_failures: u64,
}

/// Worker-visible state guarded by the control lock.
#[derive(Debug, Default)]
struct Control {
    status: AcquisitionStatus,
    exit_code: i32,
    stats: AcquisitionStats,
}

/// Ring buffers for the active [`AcquisitionMode`].
enum SampleStore {
    Raw(Fifo<u16>),
    Voltage {
        staging: Fifo<u16>,
        volts: Fifo<f64>,
        converter: CountsConverter,
    },
}

impl SampleStore {
    fn new(settings: &AcquisitionSettings, converter: CountsConverter) -> Result<Self> {
        let counts_per_scan = settings.counts_per_scan();
        match settings.mode {
            AcquisitionMode::Raw => {
                let capacity = settings.scan_count * counts_per_scan + 1;
                Ok(Self::Raw(Fifo::new(capacity)?))
            }
            AcquisitionMode::Voltage => {
                let staging = settings.transfer_size / CountsConverter::UNIT_SIZE
                    + 2 * counts_per_scan
                    + 1;
                let volts = settings.scan_count * settings.channel_count + 1;
                Ok(Self::Voltage {
                    staging: Fifo::new(staging)?,
                    volts: Fifo::new(volts)?,
                    converter,
                })
            }
        }
    }

    /// Accept raw counts. Returns how many were taken.
    fn push(&mut self, counts: &[u16]) -> usize {
        match self {
            Self::Raw(fifo) => fifo.write(counts, FifoMode::Normal),
            Self::Voltage {
                staging,
                volts,
                converter,
            } => {
                let staged = staging.write(counts, FifoMode::Normal);
                let available = staging.readable_span() * CountsConverter::UNIT_SIZE;
                converter.convert_fifo_to_fifo(volts, staging, available);
                staged
            }
        }
    }

    fn mode(&self) -> AcquisitionMode {
        match self {
            Self::Raw(_) => AcquisitionMode::Raw,
            Self::Voltage { .. } => AcquisitionMode::Voltage,
        }
    }

    fn readable(&self) -> usize {
        match self {
            Self::Raw(fifo) => fifo.readable_span(),
            Self::Voltage { volts, .. } => volts.readable_span(),
        }
    }

    fn writable(&self) -> usize {
        match self {
            Self::Raw(fifo) => fifo.writable_span(),
            Self::Voltage { staging, .. } => staging.writable_span(),
        }
    }

    fn reset(&mut self) {
        match self {
            Self::Raw(fifo) => fifo.reset(),
            Self::Voltage { staging, volts, .. } => {
                staging.reset();
                volts.reset();
            }
        }
    }
}

/// State shared between the caller and the worker.
struct Shared {
    control: Mutex<Control>,
    store: Mutex<SampleStore>,
}

impl Shared {
    fn status(&self) -> AcquisitionStatus {
        self.control.lock().status
    }

    /// Move `Running` to `Terminated`; later states are left alone.
    fn terminate(&self, exit_code: Option<i32>) {
        let mut control = self.control.lock();
        if control.status == AcquisitionStatus::Running {
            control.status = AcquisitionStatus::Terminated;
        }
        if let Some(code) = exit_code {
            if control.exit_code == 0 {
                control.exit_code = code;
            }
        }
    }
}

/// Owned worker thread that must be joined before it is dropped.
struct WorkerHandle {
    handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    fn idle() -> Self {
        Self { handle: None }
    }

    fn is_active(&self) -> bool {
        self.handle.is_some()
    }

    fn join(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| AiousbError::WorkerPanicked),
            None => Ok(()),
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if !thread::panicking() {
            debug_assert!(
                self.handle.is_none(),
                "acquisition worker dropped without being joined"
            );
        }
    }
}

/// Immutable parameters handed to the worker.
#[derive(Debug, Clone)]
struct WorkerPlan {
    budget: usize,
    discard: usize,
    transfer_size: usize,
    timeout: Duration,
}

type Callback = Box<dyn FnMut(usize) + Send>;

/// Continuous acquisition from one device into a ring buffer.
pub struct ContinuousBuffer {
    devices: Arc<DeviceTable>,
    device: DeviceIndex,
    settings: AcquisitionSettings,
    mask: ChannelMask,
    config: AdcConfigBlock,
    shared: Arc<Shared>,
    worker: Mutex<WorkerHandle>,
}

impl fmt::Debug for ContinuousBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuousBuffer")
            .field("device", &self.device)
            .field("status", &self.status())
            .field("settings", &self.settings)
            .field("mask", &self.mask.to_bit_string())
            .finish_non_exhaustive()
    }
}

impl ContinuousBuffer {
    /// Create an acquisition on `device` described by `settings`.
    pub fn new(
        devices: Arc<DeviceTable>,
        device: DeviceIndex,
        settings: AcquisitionSettings,
    ) -> Result<Self> {
        settings.validate()?;
        let geometry = devices.lookup(device)?;
        let last_channel = settings.start_channel + settings.channel_count - 1;
        if last_channel >= geometry.mux_channels {
            return Err(AiousbError::invalid_parameter(format!(
                "channels {}..={last_channel} exceed the device's {} channels",
                settings.start_channel, geometry.mux_channels
            )));
        }

        let mut config = devices.config_block(device)?;
        configure_block(&mut config, &settings)?;

        let mask = ChannelMask::all(settings.channel_count)?;
        let ranges = config.channel_ranges(settings.start_channel, settings.channel_count);
        let converter = CountsConverter::new(
            settings.channel_count,
            usize::from(settings.oversample),
            ranges,
        );
        let store = SampleStore::new(&settings, converter)?;

        info!(
            %device,
            scans = settings.scan_count,
            channels = settings.channel_count,
            oversample = settings.oversample,
            mode = ?settings.mode,
            "Created continuous buffer"
        );

        Ok(Self {
            devices,
            device,
            settings,
            mask,
            config,
            shared: Arc::new(Shared {
                control: Mutex::new(Control::default()),
                store: Mutex::new(store),
            }),
            worker: Mutex::new(WorkerHandle::idle()),
        })
    }

    /// Raw-count acquisition of `scan_count` scans over `channel_count` channels.
    pub fn for_counts(
        devices: Arc<DeviceTable>,
        device: DeviceIndex,
        scan_count: usize,
        channel_count: usize,
    ) -> Result<Self> {
        let settings = AcquisitionSettings::builder()
            .scan_count(scan_count)
            .channel_count(channel_count)
            .build()?;
        Self::new(devices, device, settings)
    }

    /// Voltage acquisition averaging `oversample + 1` samples per channel.
    pub fn for_volts(
        devices: Arc<DeviceTable>,
        device: DeviceIndex,
        scan_count: usize,
        channel_count: usize,
        oversample: u8,
    ) -> Result<Self> {
        let settings = AcquisitionSettings::builder()
            .scan_count(scan_count)
            .channel_count(channel_count)
            .oversample(oversample)
            .mode(AcquisitionMode::Voltage)
            .build()?;
        Self::new(devices, device, settings)
    }

    /// Settings this acquisition was built with.
    pub fn settings(&self) -> &AcquisitionSettings {
        &self.settings
    }

    /// Register block sent to the device on start.
    pub fn config_block(&self) -> &AdcConfigBlock {
        &self.config
    }

    /// Channels captured by each scan, relative to the start channel.
    pub fn channel_mask(&self) -> &ChannelMask {
        &self.mask
    }

    /// Absolute channel numbers captured by each scan.
    pub fn channel_numbers(&self) -> Vec<usize> {
        self.mask
            .indices()
            .map(|index| self.settings.start_channel + index)
            .collect()
    }

    /// Device this acquisition reads from.
    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    /// Current lifecycle state.
    pub fn status(&self) -> AcquisitionStatus {
        self.shared.status()
    }

    /// Sticky error code of the worker. 0 means no error.
    pub fn exit_code(&self) -> i32 {
        self.shared.control.lock().exit_code
    }

    /// Snapshot of the acquisition counters.
    pub fn stats(&self) -> AcquisitionStats {
        self.shared.control.lock().stats.clone()
    }

    /// Start acquiring.
    pub fn start(&self) -> Result<()> {
        self.start_with_callback(|_| {})
    }

    /// Start acquiring, calling `callback` with the number of raw counts
    /// accepted after every transfer.
    ///
    /// The callback runs on the worker thread.
    pub fn start_with_callback<F>(&self, callback: F) -> Result<()>
    where
        F: FnMut(usize) + Send + 'static,
    {
        // Held until the handle is stored so `end` cannot slip in between.
        let mut worker = self.worker.lock();
        {
            let mut control = self.shared.control.lock();
            if control.status != AcquisitionStatus::NotStarted {
                return Err(AiousbError::InvalidState {
                    expected: AcquisitionStatus::NotStarted.as_str(),
                    actual: control.status.as_str(),
                });
            }
            control.status = AcquisitionStatus::Running;
        }

        let transport = match self.prepare_device() {
            Ok(transport) => transport,
            Err(e) => {
                self.release_claim();
                error!(device = %self.device, error = %e, "Device setup failed");
                return Err(e);
            }
        };

        let plan = WorkerPlan {
            budget: self.settings.scan_count * self.settings.counts_per_scan(),
            discard: if self.settings.discard_first_sample {
                self.settings.counts_per_scan()
            } else {
                0
            },
            transfer_size: self.settings.transfer_size & !1,
            timeout: self.settings.timeout(),
        };
        let shared = Arc::clone(&self.shared);
        let callback: Callback = Box::new(callback);

        let spawned = thread::Builder::new()
            .name(format!("aiousb-acq-{}", self.device))
            .spawn(move || run_worker(&shared, transport.as_ref(), &plan, callback));

        match spawned {
            Ok(handle) => {
                worker.handle = Some(handle);
                info!(
                    device = %self.device,
                    scans = self.settings.scan_count,
                    channels = self.settings.channel_count,
                    "Started continuous acquisition"
                );
                Ok(())
            }
            Err(e) => {
                self.release_claim();
                Err(AiousbError::NotEnoughMemory {
                    message: format!("failed to spawn acquisition worker: {e}"),
                })
            }
        }
    }

    /// Undo a failed start. Leaves any later transition alone.
    fn release_claim(&self) {
        let mut control = self.shared.control.lock();
        if control.status == AcquisitionStatus::Running {
            control.status = AcquisitionStatus::NotStarted;
        }
    }

    /// Write the register block, reset the device FIFO and start the clock.
    fn prepare_device(&self) -> Result<Arc<dyn Transport>> {
        let transport = self.devices.transport(self.device)?;
        let timeout = self.settings.timeout();

        self.config.write_to_device(transport.as_ref())?;
        transport.control_transfer(
            USB_WRITE_TO_DEVICE,
            AUR_GEN_CLEAR_FIFO,
            0,
            0,
            &mut [],
            timeout,
        )?;

        let mut control_data = AUR_CBUF_SETUP.to_le_bytes();
        transport.control_transfer(
            USB_WRITE_TO_DEVICE,
            AUR_START_ACQUIRING_BLOCK,
            0,
            0,
            &mut control_data,
            timeout,
        )?;

        if self.settings.counter_control {
            ClockDivisors::for_frequency(self.settings.clock_hz)?
                .load(transport.as_ref(), timeout)?;
        }
        debug!(device = %self.device, "Device prepared for acquisition");
        Ok(transport)
    }

    /// Stop acquiring and join the worker.
    ///
    /// Safe to call in any state; once `Joined` further calls do nothing.
    pub fn end(&self) -> Result<()> {
        // Lock order is worker, then control. Waits out a start in progress.
        let mut worker = self.worker.lock();
        {
            let mut control = self.shared.control.lock();
            match control.status {
                AcquisitionStatus::Joined => return Ok(()),
                AcquisitionStatus::NotStarted | AcquisitionStatus::Running => {
                    control.status = AcquisitionStatus::Terminated;
                }
                AcquisitionStatus::Terminated => {}
            }
        }

        let joined = worker.join();
        self.shared.control.lock().status = AcquisitionStatus::Joined;
        drop(worker);

        let stats = self.stats();
        info!(
            device = %self.device,
            transfers = stats.transfers,
            pushed = stats.samples_pushed,
            dropped = stats.samples_dropped,
            failures = stats.usb_failures,
            exit_code = self.exit_code(),
            "Ended continuous acquisition"
        );
        joined
    }

    // ---------------------------------------------------------------------
    // Ring buffer access
    // ---------------------------------------------------------------------

    /// Push raw counts through the active mode. Returns the counts accepted.
    pub fn push_n(&self, counts: &[u16]) -> usize {
        self.shared.store.lock().push(counts)
    }

    /// Pop raw counts (raw mode only).
    pub fn pop_counts(&self, out: &mut [u16]) -> Result<usize> {
        match &mut *self.shared.store.lock() {
            SampleStore::Raw(fifo) => Ok(fifo.read(out, FifoMode::Normal)),
            SampleStore::Voltage { .. } => Err(mode_mismatch(AcquisitionMode::Voltage)),
        }
    }

    /// Pop voltages (voltage mode only).
    pub fn pop_volts(&self, out: &mut [f64]) -> Result<usize> {
        match &mut *self.shared.store.lock() {
            SampleStore::Voltage { volts, .. } => Ok(volts.read(out, FifoMode::Normal)),
            SampleStore::Raw(_) => Err(mode_mismatch(AcquisitionMode::Raw)),
        }
    }

    /// Elements in one scan as stored in the ring buffer.
    pub fn scan_width(&self) -> usize {
        match self.settings.mode {
            AcquisitionMode::Raw => self.settings.counts_per_scan(),
            AcquisitionMode::Voltage => self.settings.channel_count,
        }
    }

    /// Read as many whole scans of counts as fit in `out`. Returns scans read.
    pub fn read_scans_counts(&self, out: &mut [u16]) -> Result<usize> {
        let width = self.scan_width();
        match &mut *self.shared.store.lock() {
            SampleStore::Raw(fifo) => {
                let scans = (out.len() / width).min(fifo.readable_span() / width);
                Ok(fifo.read(&mut out[..scans * width], FifoMode::AllOrNone) / width)
            }
            SampleStore::Voltage { .. } => Err(mode_mismatch(AcquisitionMode::Voltage)),
        }
    }

    /// Read as many whole scans of volts as fit in `out`. Returns scans read.
    pub fn read_scans_volts(&self, out: &mut [f64]) -> Result<usize> {
        let width = self.scan_width();
        match &mut *self.shared.store.lock() {
            SampleStore::Voltage { volts, .. } => {
                let scans = (out.len() / width).min(volts.readable_span() / width);
                Ok(volts.read(&mut out[..scans * width], FifoMode::AllOrNone) / width)
            }
            SampleStore::Raw(_) => Err(mode_mismatch(AcquisitionMode::Raw)),
        }
    }

    /// Whole scans waiting to be read.
    pub fn scans_available(&self) -> usize {
        self.available_read_size() / self.scan_width()
    }

    /// Elements waiting to be read.
    pub fn available_read_size(&self) -> usize {
        self.shared.store.lock().readable()
    }

    /// Raw counts the ring buffer can accept right now.
    pub fn remaining_write_size(&self) -> usize {
        self.shared.store.lock().writable()
    }

    /// Mode of the ring buffer.
    pub fn mode(&self) -> AcquisitionMode {
        self.shared.store.lock().mode()
    }

    /// Discard buffered data. Only allowed before the worker starts.
    pub fn reset(&self) -> Result<()> {
        let status = self.status();
        if status != AcquisitionStatus::NotStarted {
            return Err(AiousbError::InvalidState {
                expected: AcquisitionStatus::NotStarted.as_str(),
                actual: status.as_str(),
            });
        }
        self.shared.store.lock().reset();
        Ok(())
    }
}

impl Drop for ContinuousBuffer {
    fn drop(&mut self) {
        if self.worker.lock().is_active() {
            warn!(device = %self.device, "Continuous buffer dropped without end()");
            if let Err(e) = self.end() {
                error!("Error ending acquisition on drop: {}", e);
            }
        }
    }
}

fn mode_mismatch(actual: AcquisitionMode) -> AiousbError {
    AiousbError::invalid_parameter(format!("ring buffer holds {actual:?} samples"))
}

/// Program `block` for continuous acquisition with `settings`.
fn configure_block(block: &mut AdcConfigBlock, settings: &AcquisitionSettings) -> Result<()> {
    let start = settings.start_channel;
    let end = start + settings.channel_count - 1;

    block.set_all_gain_codes_and_diff_mode(settings.gain_code, settings.differential)?;
    block.set_cal_mode(CalMode::Normal)?;
    block.set_trigger_mode((TriggerMode::TIMER | TriggerMode::SCAN).bits())?;
    block.set_oversample(settings.oversample)?;
    block.set_timeout(settings.timeout());
    block.set_scan_range(start as u32, end as u32)?;

    // set_scan_range ignores ranges the block cannot express
    if usize::from(block.start_channel()) != start || usize::from(block.end_channel()) != end {
        return Err(AiousbError::invalid_parameter(format!(
            "scan range {start}..={end} cannot be encoded in a {}-byte block",
            block.size()
        )));
    }
    Ok(())
}

/// Append little-endian counts from `bytes` to `out`, carrying an odd byte
/// over to the next call.
fn decode_counts(carry: &mut Option<u8>, mut bytes: &[u8], out: &mut Vec<u16>) {
    if let Some(low) = carry.take() {
        match bytes.split_first() {
            Some((&high, rest)) => {
                out.push(u16::from_le_bytes([low, high]));
                bytes = rest;
            }
            None => {
                *carry = Some(low);
                return;
            }
        }
    }
    while bytes.remaining() >= 2 {
        out.push(bytes.get_u16_le());
    }
    if bytes.has_remaining() {
        *carry = Some(bytes.get_u8());
    }
}

fn run_worker(shared: &Shared, transport: &dyn Transport, plan: &WorkerPlan, mut callback: Callback) {
    debug!(budget = plan.budget, "Acquisition worker running");

    let mut usb_buf = vec![0u8; plan.transfer_size.max(2)];
    let mut counts = Vec::with_capacity(usb_buf.len() / 2 + 1);
    let mut carry = None;
    let mut received = 0usize;
    let mut discard = plan.discard;
    let mut failures = 0u32;

    while shared.status() == AcquisitionStatus::Running {
        let remaining = plan.budget - received;
        let request = usb_buf.len().min((remaining + discard) * 2).max(2);

        match transport.bulk_read(USB_BULK_READ_ENDPOINT, &mut usb_buf[..request], plan.timeout) {
            Ok(0) => thread::yield_now(),
            Ok(bytes) => {
                counts.clear();
                decode_counts(&mut carry, &usb_buf[..bytes], &mut counts);
                if discard > 0 {
                    let skipped = discard.min(counts.len());
                    counts.drain(..skipped);
                    discard -= skipped;
                }
                counts.truncate(remaining);

                let accepted = shared.store.lock().push(&counts);
                received += counts.len();
                {
                    let mut control = shared.control.lock();
                    control.stats.transfers += 1;
                    control.stats.bytes_received += bytes as u64;
                    control.stats.samples_pushed += accepted as u64;
                    control.stats.samples_dropped += (counts.len() - accepted) as u64;
                }
                trace!(bytes, accepted, received, "Bulk transfer");
                callback(accepted);

                if received >= plan.budget {
                    info!(samples = received, "Scan budget reached");
                    shared.terminate(None);
                }
            }
            Err(e) => {
                failures += 1;
                shared.control.lock().stats.usb_failures += 1;
                if failures > MAX_USB_FAILURES {
                    error!(failures, error = %e, "Bulk read failed too often, terminating");
                    shared.terminate(Some(e.code()));
                    break;
                }
                warn!(attempt = failures, error = %e, "Bulk read failed, retrying");
            }
        }
    }

    shared.terminate(None);
    if let Err(e) = transport.control_transfer(
        USB_WRITE_TO_DEVICE,
        AUR_GEN_ABORT_AND_CLEAR,
        0,
        0,
        &mut [],
        plan.timeout,
    ) {
        warn!(error = %e, "Device cleanup failed");
    }
    debug!("Acquisition worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceGeometry, DeviceRecord};
    use crate::transport::{MockSignal, MockTransport};
    use std::time::Instant;
    use tracing_test::traced_test;

    fn setup(signal: MockSignal) -> (Arc<DeviceTable>, DeviceIndex, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new(signal).with_max_transfer(64));
        let devices = Arc::new(DeviceTable::new());
        let index = devices
            .insert(DeviceRecord::new(
                DeviceGeometry::non_mux(16),
                Arc::clone(&transport) as Arc<dyn Transport>,
            ))
            .unwrap();
        (devices, index, transport)
    }

    fn wait_for_termination(buffer: &ContinuousBuffer) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while buffer.status() == AcquisitionStatus::Running {
            assert!(Instant::now() < deadline, "worker did not terminate");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_decode_counts_carries_odd_byte() {
        let mut carry = None;
        let mut out = Vec::new();
        decode_counts(&mut carry, &[0x01, 0x00, 0x02], &mut out);
        assert_eq!(out, vec![1]);
        assert_eq!(carry, Some(0x02));
        decode_counts(&mut carry, &[], &mut out);
        assert_eq!(carry, Some(0x02));
        decode_counts(&mut carry, &[0x01, 0x03, 0x00], &mut out);
        assert_eq!(out, vec![1, 0x0102, 3]);
        assert_eq!(carry, None);
    }

    #[test]
    fn test_status_names() {
        assert_eq!(AcquisitionStatus::default(), AcquisitionStatus::NotStarted);
        assert_eq!(AcquisitionStatus::Terminated.to_string(), "Terminated");
        assert!(AcquisitionStatus::Running.is_running());
    }

    #[test]
    fn test_configure_block_registers() {
        let (devices, index, _) = setup(MockSignal::Ramp);
        let settings = AcquisitionSettings::builder()
            .start_channel(2)
            .channel_count(4)
            .oversample(3)
            .gain_code(3)
            .differential(true)
            .build()
            .unwrap();
        let buffer = ContinuousBuffer::new(devices, index, settings).unwrap();
        let block = buffer.config_block();
        assert_eq!(block.start_channel(), 2);
        assert_eq!(block.end_channel(), 5);
        assert_eq!(block.oversample(), 3);
        assert_eq!(block.register(0), Some(0x0B));
        assert_eq!(block.trigger_mode(), TriggerMode::TIMER | TriggerMode::SCAN);
        assert_eq!(buffer.channel_numbers(), vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_rejects_channels_beyond_device() {
        let (devices, index, _) = setup(MockSignal::Ramp);
        let settings = AcquisitionSettings::builder()
            .start_channel(10)
            .channel_count(8)
            .build()
            .unwrap();
        assert!(matches!(
            ContinuousBuffer::new(Arc::clone(&devices), index, settings),
            Err(AiousbError::InvalidParameter { .. })
        ));
        assert!(ContinuousBuffer::for_counts(devices, DeviceIndex(9), 10, 4)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_push_and_pop_without_worker() {
        let (devices, index, _) = setup(MockSignal::Ramp);
        let buffer = ContinuousBuffer::for_counts(devices, index, 4, 2).unwrap();
        assert_eq!(buffer.remaining_write_size(), 8);
        assert_eq!(buffer.push_n(&[1, 2, 3, 4, 5]), 5);
        assert_eq!(buffer.scans_available(), 2);

        let mut scans = [0u16; 6];
        assert_eq!(buffer.read_scans_counts(&mut scans).unwrap(), 2);
        assert_eq!(&scans[..4], &[1, 2, 3, 4]);
        assert_eq!(buffer.available_read_size(), 1);
        assert!(buffer.pop_volts(&mut [0.0; 2]).is_err());

        let mut rest = [0u16; 4];
        assert_eq!(buffer.pop_counts(&mut rest).unwrap(), 1);
        assert_eq!(rest[0], 5);
    }

    #[test]
    fn test_voltage_push_converts_whole_scans() {
        let (devices, index, _) = setup(MockSignal::Ramp);
        let buffer = ContinuousBuffer::for_volts(devices, index, 10, 2, 1).unwrap();
        assert_eq!(buffer.push_n(&[32768; 6]), 6);
        // One full scan (2 channels x 2 oversamples); two counts wait in staging
        assert_eq!(buffer.scans_available(), 1);
        assert_eq!(buffer.push_n(&[32768; 2]), 2);

        let mut volts = [0.0; 4];
        assert_eq!(buffer.read_scans_volts(&mut volts).unwrap(), 2);
        assert_eq!(volts, [5.0; 4]);
        assert!(buffer.read_scans_counts(&mut [0; 4]).is_err());
    }

    #[test]
    fn test_worker_reaches_budget() {
        let (devices, index, transport) = setup(MockSignal::Ramp);
        let buffer = ContinuousBuffer::for_counts(devices, index, 50, 4).unwrap();
        buffer.start().unwrap();
        wait_for_termination(&buffer);

        assert_eq!(buffer.status(), AcquisitionStatus::Terminated);
        assert_eq!(buffer.available_read_size(), 200);
        buffer.end().unwrap();
        assert_eq!(buffer.status(), AcquisitionStatus::Joined);
        assert_eq!(buffer.exit_code(), 0);

        let mut data = vec![0u16; 200];
        assert_eq!(buffer.read_scans_counts(&mut data).unwrap(), 50);
        assert!(data.iter().enumerate().all(|(i, &c)| usize::from(c) == i));

        let requests: Vec<u8> = transport.control_log().iter().map(|r| r.request).collect();
        assert_eq!(requests.first(), Some(&crate::transport::AUR_ADC_SET_CONFIG));
        assert_eq!(requests.last(), Some(&AUR_GEN_ABORT_AND_CLEAR));
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let (devices, index, _) = setup(MockSignal::Constant(0));
        let buffer = ContinuousBuffer::for_counts(devices, index, 5, 1).unwrap();
        buffer.start().unwrap();
        assert!(matches!(
            buffer.start(),
            Err(AiousbError::InvalidState { .. })
        ));
        buffer.end().unwrap();
        assert!(buffer.start().is_err());
        assert!(buffer.end().is_ok());
    }

    #[test]
    fn test_retry_budget_sets_exit_code() {
        let (devices, index, transport) = setup(MockSignal::Ramp);
        transport.fail_all_reads(-7);
        let buffer = ContinuousBuffer::for_counts(devices, index, 10, 2).unwrap();
        buffer.start().unwrap();
        wait_for_termination(&buffer);
        buffer.end().unwrap();

        assert_eq!(transport.bulk_read_count(), u64::from(MAX_USB_FAILURES) + 1);
        assert_eq!(buffer.exit_code(), -7);
        assert_eq!(buffer.stats().usb_failures, u64::from(MAX_USB_FAILURES) + 1);
    }

    #[test]
    fn test_transient_failures_are_absorbed() {
        let (devices, index, transport) = setup(MockSignal::Ramp);
        transport.fail_next_reads(&[-1, -1, -1]);
        let buffer = ContinuousBuffer::for_counts(devices, index, 20, 2).unwrap();
        buffer.start().unwrap();
        wait_for_termination(&buffer);
        buffer.end().unwrap();

        assert_eq!(buffer.exit_code(), 0);
        assert_eq!(buffer.scans_available(), 20);
        assert_eq!(buffer.stats().usb_failures, 3);
    }

    #[test]
    fn test_discard_first_scan() {
        let (devices, index, _) = setup(MockSignal::Ramp);
        let settings = AcquisitionSettings::builder()
            .scan_count(3)
            .channel_count(2)
            .discard_first_sample(true)
            .build()
            .unwrap();
        let buffer = ContinuousBuffer::new(devices, index, settings).unwrap();
        buffer.start().unwrap();
        wait_for_termination(&buffer);
        buffer.end().unwrap();

        let mut data = [0u16; 6];
        assert_eq!(buffer.read_scans_counts(&mut data).unwrap(), 3);
        assert_eq!(data, [2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_callback_sees_every_sample() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let (devices, index, _) = setup(MockSignal::Constant(7));
        let buffer = ContinuousBuffer::for_counts(devices, index, 40, 3).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        buffer
            .start_with_callback(move |n| {
                counter.fetch_add(n, Ordering::SeqCst);
            })
            .unwrap();
        wait_for_termination(&buffer);
        buffer.end().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 120);
        assert_eq!(buffer.stats().samples_pushed, 120);
    }

    #[test]
    #[traced_test]
    fn test_lifecycle_is_logged() {
        let (devices, index, _) = setup(MockSignal::Ramp);
        let buffer = ContinuousBuffer::for_counts(devices, index, 8, 2).unwrap();
        buffer.start().unwrap();
        wait_for_termination(&buffer);
        buffer.end().unwrap();

        assert!(logs_contain("Started continuous acquisition"));
        assert!(logs_contain("Ended continuous acquisition"));
    }

    #[test]
    fn test_end_before_start() {
        let (devices, index, transport) = setup(MockSignal::Ramp);
        let buffer = ContinuousBuffer::for_counts(devices, index, 5, 1).unwrap();
        buffer.end().unwrap();
        assert_eq!(buffer.status(), AcquisitionStatus::Joined);
        assert_eq!(transport.bulk_read_count(), 0);
    }

    #[test]
    fn test_reset_only_before_start() {
        let (devices, index, _) = setup(MockSignal::Ramp);
        let buffer = ContinuousBuffer::for_counts(devices, index, 5, 1).unwrap();
        buffer.push_n(&[1, 2, 3]);
        buffer.reset().unwrap();
        assert_eq!(buffer.available_read_size(), 0);
        buffer.end().unwrap();
        assert!(buffer.reset().is_err());
    }
}
