//! Channel selection bitmask.
//!
//! A [`ChannelMask`] is a fixed-size bit vector over the analog channels of a
//! board. Bits are packed into 8-bit groups with the most-significant group
//! stored first, so channel `c` lives in group `group_count - 1 - c / 8` at bit
//! `c % 8`. The ascending list of active channels is rebuilt on every mutation
//! and never goes stale.
//!
//! ```
//! use daq_driver_aiousb::ChannelMask;
//!
//! # fn main() -> daq_driver_aiousb::Result<()> {
//! let mut mask = ChannelMask::new(32)?;
//! mask.set_from_integer(1 | 2 | 8 | 128 | (1 << 30))?;
//! assert_eq!(mask.active_signals(), 5);
//! assert_eq!(mask.indices().collect::<Vec<_>>(), vec![0, 1, 3, 7, 30]);
//! # Ok(())
//! # }
//! ```

use std::fmt;

use crate::error::{AiousbError, Result};

const BITS_PER_GROUP: usize = 8;

/// Bitmask selecting a subset of analog channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMask {
    number_signals: usize,
    groups: Vec<u8>,
    active: Vec<usize>,
}

impl ChannelMask {
    /// Create an empty mask over `channel_count` channels.
    pub fn new(channel_count: usize) -> Result<Self> {
        if channel_count == 0 {
            return Err(AiousbError::invalid_parameter(
                "channel mask needs at least one channel",
            ));
        }

        let group_count = channel_count.div_ceil(BITS_PER_GROUP);
        let mut groups = Vec::new();
        let mut active = Vec::new();
        groups
            .try_reserve_exact(group_count)
            .and_then(|()| active.try_reserve_exact(channel_count + 1))
            .map_err(|e| AiousbError::NotEnoughMemory {
                message: format!("channel mask of {channel_count} channels: {e}"),
            })?;
        groups.resize(group_count, 0);

        Ok(Self {
            number_signals: channel_count,
            groups,
            active,
        })
    }

    /// Create a mask over `channel_count` channels with every channel selected.
    pub fn all(channel_count: usize) -> Result<Self> {
        let mut mask = Self::new(channel_count)?;
        for channel in 0..channel_count {
            let (group, bit) = mask.locate(channel);
            mask.groups[group] |= 1 << bit;
        }
        mask.rebuild_indices();
        Ok(mask)
    }

    /// Declared number of channels.
    pub fn number_signals(&self) -> usize {
        self.number_signals
    }

    /// Number of selected channels.
    pub fn active_signals(&self) -> usize {
        self.active.len()
    }

    /// Number of 8-bit groups backing the mask.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Load the low 32 channels from `bits`. Higher channels are cleared.
    ///
    /// The mask must span at least four groups, and `bits` may not select a
    /// channel at or above [`number_signals`](Self::number_signals).
    pub fn set_from_integer(&mut self, bits: u32) -> Result<()> {
        let needed = std::mem::size_of::<u32>();
        if self.groups.len() < needed {
            return Err(AiousbError::invalid_parameter(format!(
                "mask of {} groups cannot hold a {}-byte integer",
                self.groups.len(),
                needed
            )));
        }
        if self.number_signals < u32::BITS as usize && bits >> self.number_signals != 0 {
            return Err(AiousbError::invalid_parameter(format!(
                "bits {bits:#010x} select channels beyond the mask's {} channels",
                self.number_signals
            )));
        }

        let offset = self.groups.len() - needed;
        self.groups[..offset].fill(0);
        self.groups[offset..].copy_from_slice(&bits.to_be_bytes());
        self.rebuild_indices();
        Ok(())
    }

    /// Load the mask from a string of `'0'`/`'1'` characters.
    ///
    /// The leftmost character is the highest-numbered channel. Characters other
    /// than `'1'` clear their channel.
    pub fn set_from_bit_string(&mut self, text: &str) -> Result<()> {
        let len = text.chars().count();
        if len != self.number_signals {
            return Err(AiousbError::invalid_parameter(format!(
                "bit string has {len} characters, mask has {} channels",
                self.number_signals
            )));
        }

        self.groups.resize(len.div_ceil(BITS_PER_GROUP), 0);
        self.groups.fill(0);
        for (position, ch) in text.chars().enumerate() {
            if ch == '1' {
                let (group, bit) = self.locate(len - 1 - position);
                self.groups[group] |= 1 << bit;
            }
        }
        self.rebuild_indices();
        Ok(())
    }

    /// Render the mask as a bit string, highest channel first.
    pub fn to_bit_string(&self) -> String {
        (0..self.number_signals)
            .rev()
            .map(|channel| if self.is_active(channel) { '1' } else { '0' })
            .collect()
    }

    /// Byte at group `index` (storage order, 0 is the most significant group).
    pub fn group_at(&self, index: usize) -> Result<u8> {
        self.groups
            .get(index)
            .copied()
            .ok_or(AiousbError::InvalidIndex {
                index,
                max: self.groups.len(),
            })
    }

    /// Overwrite group `index` (storage order).
    pub fn set_group_at(&mut self, index: usize, value: u8) -> Result<()> {
        let max = self.groups.len();
        let slot = self
            .groups
            .get_mut(index)
            .ok_or(AiousbError::InvalidIndex { index, max })?;
        *slot = value;
        self.rebuild_indices();
        Ok(())
    }

    /// Whether `channel` is selected.
    pub fn is_active(&self, channel: usize) -> bool {
        if channel >= self.number_signals {
            return false;
        }
        let (group, bit) = self.locate(channel);
        self.groups[group] & (1 << bit) != 0
    }

    /// Next active channel at or after the position held in `cursor`.
    ///
    /// Start with `cursor = 0`; returns `None` once the sequence is exhausted.
    /// Resetting the cursor to 0 restarts the walk.
    pub fn next_active_index(&self, cursor: &mut usize) -> Option<usize> {
        let index = self.active.get(*cursor).copied();
        if index.is_some() {
            *cursor += 1;
        }
        index
    }

    /// Ascending iterator over the active channels.
    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.active.iter().copied()
    }

    fn locate(&self, channel: usize) -> (usize, usize) {
        let group = self.groups.len() - 1 - channel / BITS_PER_GROUP;
        (group, channel % BITS_PER_GROUP)
    }

    fn rebuild_indices(&mut self) {
        self.active.clear();
        for channel in 0..self.number_signals {
            if self.is_active(channel) {
                self.active.push(channel);
            }
        }
    }
}

impl fmt::Display for ChannelMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_bit_string())
    }
}
