//! # AIOUSB analog input driver
//!
//! Host-side core for ACCES I/O USB analog input boards: the register block
//! that configures the ADC, channel selection, and a continuous acquisition
//! engine that streams samples into a ring buffer on a background thread.
//!
//! ## Crate Structure
//!
//! - **`channel_mask`**: Fixed-width bit set of active channels.
//! - **`config_block`**: Host mirror of the 20/21-byte ADC register block
//!   (gain codes, calibration, trigger, scan range, oversample).
//! - **`device`**: Registry of attached boards and their geometry.
//! - **`transport`**: USB transfer seam plus a simulated board for tests and demos.
//! - **`fifo`**: Fixed-capacity ring buffer with truncating and all-or-none transfers.
//! - **`converter`**: Oversample averaging and counts-to-volts conversion.
//! - **`immediate`**: Software-triggered single scans on a `DeviceTable`.
//! - **`clock`**: 8254 counter divisors for the sample clock.
//! - **`continuous`**: `ContinuousBuffer`, the acquisition worker and its lifecycle.
//! - **`settings`**: Acquisition settings loaded from TOML and `AIOUSB_*` variables.
//! - **`logging`**: `tracing` subscriber setup for binaries.
//! - **`error`**: `AiousbError` and its signed status codes.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use daq_driver_aiousb::{
//!     ContinuousBuffer, DeviceGeometry, DeviceRecord, DeviceTable, MockSignal, MockTransport,
//! };
//!
//! # fn main() -> daq_driver_aiousb::Result<()> {
//! let devices = Arc::new(DeviceTable::new());
//! let mock = Arc::new(MockTransport::new(MockSignal::Constant(32768)));
//! let device = devices.insert(DeviceRecord::new(DeviceGeometry::non_mux(16), mock))?;
//!
//! let buffer = ContinuousBuffer::for_volts(devices, device, 1000, 8, 3)?;
//! buffer.start()?;
//! // ... read_scans_volts() while running ...
//! buffer.end()?;
//! # Ok(())
//! # }
//! ```

pub mod channel_mask;
pub mod clock;
pub mod config_block;
pub mod continuous;
pub mod converter;
pub mod device;
pub mod error;
pub mod fifo;
pub mod immediate;
pub mod logging;
pub mod settings;
pub mod transport;

pub use channel_mask::ChannelMask;
pub use clock::{load_counter, ClockDivisors, ROOT_CLOCK_HZ};
pub use config_block::{AdcConfigBlock, CalMode, GainCode, MuxGeometry, TriggerMode};
pub use continuous::{AcquisitionStats, AcquisitionStatus, ContinuousBuffer, MAX_USB_FAILURES};
pub use converter::{gain_ranges_from_config, CountsConverter, GainRange};
pub use device::{DeviceGeometry, DeviceIndex, DeviceRecord, DeviceTable};
pub use error::{AiousbError, Result};
pub use fifo::{Fifo, FifoMode, SharedFifo};
pub use immediate::DEVICE_SAMPLE_BUFFER;
pub use settings::{AcquisitionMode, AcquisitionSettings, AcquisitionSettingsBuilder};
pub use transport::{ControlRecord, MockSignal, MockTransport, Transport};
