//! Fixed-capacity ring buffer with truncating and all-or-none transfers.
//!
//! [`Fifo`] is a `Vec<T>` plus two cursors. All wraparound arithmetic lives in
//! this module. One slot is always left empty so that `read_pos == write_pos`
//! unambiguously means "empty"; a fifo created with capacity `n` therefore
//! holds at most `n - 1` elements.
//!
//! Sizes are counted in elements. [`FifoMode::Normal`] truncates a transfer to
//! whatever fits; [`FifoMode::AllOrNone`] moves the full request or nothing.
//!
//! [`SharedFifo`] is a standalone utility for callers that hand one fifo
//! between threads. `ContinuousBuffer` does not use it: it keeps its counts
//! and volts fifos together under a single lock of its own.

use parking_lot::Mutex;

use crate::error::{AiousbError, Result};

/// Transfer discipline for [`Fifo::write`] and [`Fifo::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FifoMode {
    /// Move as many elements as fit
    #[default]
    Normal,
    /// Move the whole request or nothing
    AllOrNone,
}

impl FifoMode {
    fn allowed(self, requested: usize, capacity: usize, span: usize) -> usize {
        match self {
            Self::Normal => requested.min(capacity).min(span),
            Self::AllOrNone if requested <= span => requested,
            Self::AllOrNone => 0,
        }
    }
}

/// Ring buffer of `capacity` slots.
#[derive(Debug, Clone)]
pub struct Fifo<T> {
    data: Vec<T>,
    read_pos: usize,
    write_pos: usize,
}

impl<T: Copy + Default> Fifo<T> {
    /// Allocate a fifo with `capacity` slots (`capacity - 1` usable).
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity < 2 {
            return Err(AiousbError::invalid_parameter(format!(
                "fifo capacity {capacity} leaves no usable slot"
            )));
        }
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)
            .map_err(|e| AiousbError::NotEnoughMemory {
                message: format!("fifo of {capacity} elements: {e}"),
            })?;
        data.resize(capacity, T::default());
        Ok(Self {
            data,
            read_pos: 0,
            write_pos: 0,
        })
    }

    /// Number of slots, including the reserved one.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Largest number of elements the fifo can hold at once.
    pub fn usable_capacity(&self) -> usize {
        self.data.len() - 1
    }

    /// Size of one element in bytes.
    pub fn element_size(&self) -> usize {
        std::mem::size_of::<T>()
    }

    /// Elements that can be written right now.
    pub fn writable_span(&self) -> usize {
        if self.write_pos < self.read_pos {
            self.read_pos - self.write_pos - 1
        } else {
            (self.capacity() - self.write_pos) + self.read_pos - 1
        }
    }

    /// Elements waiting to be read.
    pub fn readable_span(&self) -> usize {
        if self.read_pos < self.write_pos {
            self.write_pos - self.read_pos
        } else {
            ((self.capacity() - self.read_pos) + self.write_pos) % self.capacity()
        }
    }

    /// Whether nothing is waiting to be read.
    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    /// Whether no element can be written.
    pub fn is_full(&self) -> bool {
        self.writable_span() == 0
    }

    /// Append elements from `src`. Returns the number written; 0 means nothing fit.
    pub fn write(&mut self, src: &[T], mode: FifoMode) -> usize {
        let n = mode.allowed(src.len(), self.capacity(), self.writable_span());
        if n == 0 {
            return 0;
        }
        let first = n.min(self.capacity() - self.write_pos);
        self.data[self.write_pos..self.write_pos + first].copy_from_slice(&src[..first]);
        self.data[..n - first].copy_from_slice(&src[first..n]);
        self.write_pos = (self.write_pos + n) % self.capacity();
        n
    }

    /// Remove elements into `dst`. Returns the number read; 0 means nothing was available.
    pub fn read(&mut self, dst: &mut [T], mode: FifoMode) -> usize {
        let n = mode.allowed(dst.len(), self.capacity(), self.readable_span());
        if n == 0 {
            return 0;
        }
        let first = n.min(self.capacity() - self.read_pos);
        dst[..first].copy_from_slice(&self.data[self.read_pos..self.read_pos + first]);
        dst[first..n].copy_from_slice(&self.data[..n - first]);
        self.read_pos = (self.read_pos + n) % self.capacity();
        n
    }

    /// Discard `count` readable elements without copying them.
    pub fn skip(&mut self, count: usize) -> usize {
        let n = count.min(self.readable_span());
        self.read_pos = (self.read_pos + n) % self.capacity();
        n
    }

    /// Empty the fifo.
    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }
}

/// A [`Fifo`] behind a lock. Every access goes through the lock.
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
/// use daq_driver_aiousb::{FifoMode, SharedFifo};
///
/// let fifo = Arc::new(SharedFifo::<u16>::new(8).unwrap());
/// let producer = {
///     let fifo = Arc::clone(&fifo);
///     thread::spawn(move || fifo.write(&[1, 2, 3], FifoMode::AllOrNone))
/// };
/// assert_eq!(producer.join().unwrap(), 3);
///
/// // Check and drain under one lock
/// let drained = fifo.with(|f| {
///     let mut out = vec![0; f.readable_span()];
///     f.read(&mut out, FifoMode::AllOrNone);
///     out
/// });
/// assert_eq!(drained, vec![1, 2, 3]);
/// ```
#[derive(Debug)]
pub struct SharedFifo<T> {
    inner: Mutex<Fifo<T>>,
}

impl<T: Copy + Default> SharedFifo<T> {
    /// Allocate a shared fifo with `capacity` slots.
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            inner: Mutex::new(Fifo::new(capacity)?),
        })
    }

    /// Locked [`Fifo::write`].
    pub fn write(&self, src: &[T], mode: FifoMode) -> usize {
        self.inner.lock().write(src, mode)
    }

    /// Locked [`Fifo::read`].
    pub fn read(&self, dst: &mut [T], mode: FifoMode) -> usize {
        self.inner.lock().read(dst, mode)
    }

    /// Locked [`Fifo::readable_span`].
    pub fn readable_span(&self) -> usize {
        self.inner.lock().readable_span()
    }

    /// Locked [`Fifo::writable_span`].
    pub fn writable_span(&self) -> usize {
        self.inner.lock().writable_span()
    }

    /// Locked [`Fifo::reset`].
    pub fn reset(&self) {
        self.inner.lock().reset();
    }

    /// Run `f` with the fifo locked.
    pub fn with<R>(&self, f: impl FnOnce(&mut Fifo<T>) -> R) -> R {
        f(&mut self.inner.lock())
    }
}
