//! USB transport seam.
//!
//! The acquisition engine never talks to libusb directly. It issues vendor
//! control transfers and bulk reads through the [`Transport`] trait, which a
//! hardware backend implements. [`MockTransport`] is a deterministic stand-in
//! that synthesizes ADC counts, records every control request, and can inject
//! bulk-read failures.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::error::{AiousbError, Result};

/// bmRequestType for host-to-device vendor requests.
pub const USB_WRITE_TO_DEVICE: u8 = 0x40;
/// bmRequestType for device-to-host vendor requests.
pub const USB_READ_FROM_DEVICE: u8 = 0xC0;
/// Bulk IN endpoint carrying ADC samples (`LIBUSB_ENDPOINT_IN | 6`).
pub const USB_BULK_READ_ENDPOINT: u8 = 0x86;

/// Vendor request: set 8254 counter mode and load it in one transfer.
pub const AUR_CTR_MODELOAD: u8 = 0x23;
/// Vendor request: clear the device FIFO.
pub const AUR_GEN_CLEAR_FIFO: u8 = 0x35;
/// Vendor request: abort the running acquisition and clear the FIFO.
pub const AUR_GEN_ABORT_AND_CLEAR: u8 = 0x38;
/// Vendor request: start a block acquisition.
pub const AUR_START_ACQUIRING_BLOCK: u8 = 0xBC;
/// Vendor request: write the ADC register block.
pub const AUR_ADC_SET_CONFIG: u8 = 0xBE;
/// Vendor request: immediate single-scan read.
pub const AUR_ADC_IMMEDIATE: u8 = 0xBF;
/// Vendor request: read back the ADC register block.
pub const AUR_ADC_GET_CONFIG: u8 = 0xD2;

/// Control data for a free-running block acquisition.
pub const AUR_CBUF_SETUP: u32 = 0x0100_0007;

/// Host side of a USB connection to one board.
///
/// Implementations own their timeout semantics; the engine only forwards the
/// device's configured timeout.
pub trait Transport: Send + Sync {
    /// Read up to `buf.len()` bytes from a bulk endpoint.
    ///
    /// `Ok(0)` means the transfer completed without data.
    fn bulk_read(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Issue a vendor control transfer. Returns the bytes moved in the data stage.
    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;
}

/// A control transfer observed by [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    /// bmRequestType
    pub request_type: u8,
    /// Vendor request code
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// Data stage contents (host-to-device only)
    pub data: Vec<u8>,
}

/// Sample pattern produced by [`MockTransport`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockSignal {
    /// Every sample carries the same count.
    Constant(u16),
    /// Counts increase by one per sample and wrap at 65536.
    Ramp,
    /// Uniform noise around a center count.
    Noise {
        /// Center count
        center: u16,
        /// Peak deviation in counts
        spread: u16,
    },
}

struct MockState {
    signal: MockSignal,
    next_count: u16,
    rng: StdRng,
    failures: VecDeque<i32>,
    fail_forever: Option<i32>,
    config_block: Vec<u8>,
    controls: Vec<ControlRecord>,
}

/// Simulated AIOUSB board.
///
/// Bulk reads return little-endian counts following the configured
/// [`MockSignal`]. The register block written with `AUR_ADC_SET_CONFIG` is
/// echoed back by `AUR_ADC_GET_CONFIG`, and `AUR_ADC_IMMEDIATE` acknowledges
/// every trigger.
pub struct MockTransport {
    state: Mutex<MockState>,
    max_transfer: usize,
    latency: Duration,
    bulk_reads: AtomicU64,
}

impl MockTransport {
    /// Create a mock producing `signal`.
    pub fn new(signal: MockSignal) -> Self {
        Self {
            state: Mutex::new(MockState {
                signal,
                next_count: 0,
                rng: StdRng::seed_from_u64(0x00A1_0B5B),
                failures: VecDeque::new(),
                fail_forever: None,
                config_block: Vec::new(),
                controls: Vec::new(),
            }),
            max_transfer: 512,
            latency: Duration::ZERO,
            bulk_reads: AtomicU64::new(0),
        }
    }

    /// Cap the bytes returned per bulk read.
    pub fn with_max_transfer(mut self, bytes: usize) -> Self {
        self.max_transfer = bytes.max(1);
        self
    }

    /// Sleep this long inside every bulk read.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next bulk reads, one per code, before producing data again.
    pub fn fail_next_reads(&self, codes: &[i32]) {
        self.state.lock().failures.extend(codes.iter().copied());
    }

    /// Fail every bulk read from now on with `code`.
    pub fn fail_all_reads(&self, code: i32) {
        self.state.lock().fail_forever = Some(code);
    }

    /// Preload the register block returned by `AUR_ADC_GET_CONFIG`.
    pub fn set_config_block(&self, bytes: &[u8]) {
        self.state.lock().config_block = bytes.to_vec();
    }

    /// Control transfers seen so far, in order.
    pub fn control_log(&self) -> Vec<ControlRecord> {
        self.state.lock().controls.clone()
    }

    /// Number of bulk reads attempted.
    pub fn bulk_read_count(&self) -> u64 {
        self.bulk_reads.load(Ordering::SeqCst)
    }

    fn next_sample(state: &mut MockState) -> u16 {
        match state.signal {
            MockSignal::Constant(count) => count,
            MockSignal::Ramp => {
                let count = state.next_count;
                state.next_count = state.next_count.wrapping_add(1);
                count
            }
            MockSignal::Noise { center, spread } => {
                let spread = i32::from(spread);
                let offset = state.rng.gen_range(-spread..=spread);
                (i32::from(center) + offset).clamp(0, i32::from(u16::MAX)) as u16
            }
        }
    }
}

impl Transport for MockTransport {
    fn bulk_read(&self, endpoint: u8, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        self.bulk_reads.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }

        let mut state = self.state.lock();
        let failure = state.failures.pop_front().or(state.fail_forever);
        if let Some(code) = failure {
            return Err(AiousbError::Transport {
                code,
                message: format!("mock bulk read failure on endpoint {endpoint:#04x}"),
            });
        }

        let len = buf.len().min(self.max_transfer) & !1;
        for pair in buf[..len].chunks_exact_mut(2) {
            let count = Self::next_sample(&mut state);
            pair.copy_from_slice(&count.to_le_bytes());
        }
        trace!(endpoint, bytes = len, "Mock bulk read");
        Ok(len)
    }

    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize> {
        let mut state = self.state.lock();
        let transferred = if request_type == USB_READ_FROM_DEVICE {
            match request {
                AUR_ADC_GET_CONFIG => {
                    let n = buf.len().min(state.config_block.len());
                    buf[..n].copy_from_slice(&state.config_block[..n]);
                    n
                }
                // Trigger acknowledgement; samples follow on the bulk endpoint
                AUR_ADC_IMMEDIATE => {
                    buf.fill(0);
                    buf.len()
                }
                _ => 0,
            }
        } else {
            if request == AUR_ADC_SET_CONFIG {
                state.config_block = buf.to_vec();
            }
            buf.len()
        };

        let data = if request_type == USB_WRITE_TO_DEVICE {
            buf.to_vec()
        } else {
            Vec::new()
        };
        state.controls.push(ControlRecord {
            request_type,
            request,
            value,
            index,
            data,
        });
        Ok(transferred)
    }
}
