//! Device records and the device table.
//!
//! A [`DeviceTable`] is an arena of [`DeviceRecord`]s addressed by stable
//! [`DeviceIndex`] values. It is shared through an `Arc` and injected into the
//! acquisition engine; nothing in this crate keeps a process-wide table.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config_block::{
    AdcConfigBlock, AD_CONFIG_REGISTERS, AD_MUX_CONFIG_REGISTERS, AD_NUM_GAIN_CODE_REGISTERS,
};
use crate::error::{AiousbError, Result};
use crate::transport::Transport;

/// Largest number of boards a table will hold.
pub const MAX_USB_DEVICES: usize = 32;

/// Stable handle to a slot in a [`DeviceTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceIndex(pub usize);

impl fmt::Display for DeviceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Analog input shape of one board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGeometry {
    /// Channels wired directly to the ADC front end
    pub adc_channels: usize,
    /// Channels reachable through the multiplexer
    pub mux_channels: usize,
    /// Channels sharing one gain register
    pub channels_per_group: usize,
    /// Register block length (20 or 21)
    pub config_bytes: usize,
    /// Communication timeout
    pub timeout: Duration,
}

impl DeviceGeometry {
    /// Board without a multiplexer: one gain register per channel.
    pub fn non_mux(channels: usize) -> Self {
        Self {
            adc_channels: channels,
            mux_channels: channels,
            channels_per_group: 1,
            config_bytes: AD_CONFIG_REGISTERS,
            timeout: Duration::from_millis(1000),
        }
    }

    /// Multiplexed board with `mux_channels` inputs sharing the 16 gain registers.
    pub fn mux(mux_channels: usize, channels_per_group: usize) -> Self {
        Self {
            adc_channels: AD_NUM_GAIN_CODE_REGISTERS,
            mux_channels,
            channels_per_group,
            config_bytes: AD_MUX_CONFIG_REGISTERS,
            timeout: Duration::from_millis(1000),
        }
    }

    /// Replace the communication timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One registered board.
#[derive(Clone)]
pub struct DeviceRecord {
    geometry: DeviceGeometry,
    config: AdcConfigBlock,
    transport: Arc<dyn Transport>,
    discard_first_sample: bool,
}

impl fmt::Debug for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRecord")
            .field("geometry", &self.geometry)
            .field("config", &self.config)
            .field("discard_first_sample", &self.discard_first_sample)
            .finish_non_exhaustive()
    }
}

impl DeviceRecord {
    /// Record with a zeroed register block shaped for `geometry`.
    pub fn new(geometry: DeviceGeometry, transport: Arc<dyn Transport>) -> Self {
        Self {
            geometry,
            config: AdcConfigBlock::from_device(&geometry),
            transport,
            discard_first_sample: false,
        }
    }

    /// Drop the first sample of each channel in immediate scans.
    pub fn with_discard_first_sample(mut self, discard: bool) -> Self {
        self.discard_first_sample = discard;
        self
    }

    /// Board geometry.
    pub fn geometry(&self) -> &DeviceGeometry {
        &self.geometry
    }

    /// The board's own register block.
    pub fn config(&self) -> &AdcConfigBlock {
        &self.config
    }

    /// Transport connected to the board.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Whether immediate scans drop each channel's first sample.
    pub fn discard_first_sample(&self) -> bool {
        self.discard_first_sample
    }
}

/// Arena of device records with its own lock.
#[derive(Debug, Default)]
pub struct DeviceTable {
    slots: RwLock<Vec<Option<DeviceRecord>>>,
}

impl DeviceTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `record` in the first free slot.
    pub fn insert(&self, mut record: DeviceRecord) -> Result<DeviceIndex> {
        let mut slots = self.slots.write();
        let position = match slots.iter().position(Option::is_none) {
            Some(free) => free,
            None if slots.len() < MAX_USB_DEVICES => {
                slots.push(None);
                slots.len() - 1
            }
            None => {
                return Err(AiousbError::InvalidDevice {
                    message: format!("device table full ({MAX_USB_DEVICES} devices)"),
                })
            }
        };

        let index = DeviceIndex(position);
        record.config.set_device(Some(index));
        info!(
            %index,
            mux_channels = record.geometry.mux_channels,
            config_bytes = record.geometry.config_bytes,
            "Registered device"
        );
        slots[position] = Some(record);
        Ok(index)
    }

    /// Drop the record at `index`, freeing the slot for reuse.
    pub fn remove(&self, index: DeviceIndex) -> Result<DeviceRecord> {
        let mut slots = self.slots.write();
        let record = slots
            .get_mut(index.0)
            .and_then(Option::take)
            .ok_or(AiousbError::DeviceNotFound { index: index.0 })?;
        debug!(%index, "Removed device");
        Ok(record)
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.read().iter().flatten().count()
    }

    /// Whether no device is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn with_record<R>(
        &self,
        index: DeviceIndex,
        f: impl FnOnce(&DeviceRecord) -> R,
    ) -> Result<R> {
        let slots = self.slots.read();
        slots
            .get(index.0)
            .and_then(Option::as_ref)
            .map(f)
            .ok_or(AiousbError::DeviceNotFound { index: index.0 })
    }

    /// Geometry of the board at `index`.
    pub fn lookup(&self, index: DeviceIndex) -> Result<DeviceGeometry> {
        self.with_record(index, |record| record.geometry)
    }

    /// Snapshot of the board's register block.
    pub fn config_block(&self, index: DeviceIndex) -> Result<AdcConfigBlock> {
        self.with_record(index, |record| record.config.clone())
    }

    /// Transport connected to the board.
    pub fn transport(&self, index: DeviceIndex) -> Result<Arc<dyn Transport>> {
        self.with_record(index, |record| Arc::clone(&record.transport))
    }

    /// Replace the board's register block.
    pub fn set_config_block(&self, index: DeviceIndex, block: &AdcConfigBlock) -> Result<()> {
        let mut slots = self.slots.write();
        let record = slots
            .get_mut(index.0)
            .and_then(Option::as_mut)
            .ok_or(AiousbError::DeviceNotFound { index: index.0 })?;
        record.config.copy_from(block)?;
        record.config.set_device(Some(index));
        Ok(())
    }

    /// Read the register block from hardware into the record and return it.
    pub fn read_config_block(&self, index: DeviceIndex) -> Result<AdcConfigBlock> {
        let (geometry, transport) =
            self.with_record(index, |record| (record.geometry, Arc::clone(&record.transport)))?;
        let mut block = AdcConfigBlock::read_from_device(transport.as_ref(), &geometry)?;
        block.set_device(Some(index));
        self.set_config_block(index, &block)?;
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockSignal, MockTransport};

    fn mock() -> Arc<dyn Transport> {
        Arc::new(MockTransport::new(MockSignal::Ramp))
    }

    #[test]
    fn test_insert_lookup_remove() {
        let table = DeviceTable::new();
        let a = table
            .insert(DeviceRecord::new(DeviceGeometry::non_mux(16), mock()))
            .unwrap();
        let b = table
            .insert(DeviceRecord::new(DeviceGeometry::mux(64, 4), mock()))
            .unwrap();
        assert_eq!((a, b), (DeviceIndex(0), DeviceIndex(1)));
        assert_eq!(table.lookup(b).unwrap().mux_channels, 64);
        assert_eq!(table.config_block(b).unwrap().device(), Some(b));

        table.remove(a).unwrap();
        assert!(table.lookup(a).unwrap_err().is_not_found());
        assert_eq!(table.len(), 1);

        // Freed slot is reused, other indices stay stable
        let c = table
            .insert(DeviceRecord::new(DeviceGeometry::non_mux(8), mock()))
            .unwrap();
        assert_eq!(c, DeviceIndex(0));
        assert_eq!(table.lookup(b).unwrap().mux_channels, 64);
    }

    #[test]
    fn test_table_capacity() {
        let table = DeviceTable::new();
        for _ in 0..MAX_USB_DEVICES {
            table
                .insert(DeviceRecord::new(DeviceGeometry::non_mux(16), mock()))
                .unwrap();
        }
        let err = table
            .insert(DeviceRecord::new(DeviceGeometry::non_mux(16), mock()))
            .unwrap_err();
        assert!(matches!(err, AiousbError::InvalidDevice { .. }));
    }

    #[test]
    fn test_read_config_block_corrects_snapshot() {
        let transport = Arc::new(MockTransport::new(MockSignal::Ramp));
        let mut snapshot = vec![0u8; 20];
        snapshot[16] = 7; // invalid calibration mode
        snapshot[18] = 0xF0; // start 0, end 15
        transport.set_config_block(&snapshot);

        let table = DeviceTable::new();
        let index = table
            .insert(DeviceRecord::new(DeviceGeometry::non_mux(16), transport))
            .unwrap();
        let block = table.read_config_block(index).unwrap();
        assert_eq!(block.register(16), Some(0));
        assert_eq!(block.end_channel(), 15);
        assert_eq!(table.config_block(index).unwrap(), block);
    }
}
