//! Error types for AIOUSB operations.
//!
//! Every fallible operation in this crate returns [`Result`]. Each variant maps
//! onto a negative status code through [`AiousbError::code`], which is the
//! value the acquisition worker records as its sticky exit code.

use thiserror::Error;

/// Result type alias for AIOUSB operations.
pub type Result<T> = std::result::Result<T, AiousbError>;

/// Errors that can occur when configuring or streaming from an AIOUSB device.
#[derive(Error, Debug)]
pub enum AiousbError {
    /// Out-of-range or malformed caller input
    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    /// Configuration object is not in a usable state (e.g. zero-sized register block)
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Device geometry makes the request impossible (e.g. zero channels per group)
    #[error("Invalid device setting: {message}")]
    InvalidDeviceSetting { message: String },

    /// Index outside backing storage
    #[error("Invalid index {index}: storage holds {max} entries")]
    InvalidIndex { index: usize, max: usize },

    /// Allocation could not be satisfied
    #[error("Not enough memory: {message}")]
    NotEnoughMemory { message: String },

    /// No device registered at the given table index
    #[error("Device not found at index {index}")]
    DeviceNotFound { index: usize },

    /// Device record exists but cannot serve the request
    #[error("Invalid device: {message}")]
    InvalidDevice { message: String },

    /// Status reported by the USB transport
    #[error("Transport error (code {code}): {message}")]
    Transport { code: i32, message: String },

    /// Lifecycle operation attempted from the wrong state
    #[error("Invalid acquisition state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// Settings failed validation
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// The acquisition worker thread panicked
    #[error("Acquisition worker panicked")]
    WorkerPanicked,
}

impl AiousbError {
    /// Shorthand for [`AiousbError::InvalidParameter`].
    pub(crate) fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Signed status code for this error. Always negative.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidParameter { .. } => -1,
            Self::InvalidData { .. } => -2,
            Self::InvalidDeviceSetting { .. } => -3,
            Self::InvalidIndex { .. } => -4,
            Self::NotEnoughMemory { .. } => -5,
            Self::DeviceNotFound { .. } => -6,
            Self::InvalidDevice { .. } => -7,
            // Transport codes are already signed; keep them negative.
            Self::Transport { code, .. } => {
                -(code.unsigned_abs().clamp(1, i32::MAX as u32) as i32)
            }
            Self::InvalidState { .. } => -9,
            Self::InvalidConfig { .. } => -10,
            Self::WorkerPanicked => -11,
        }
    }

    /// Check if this is a "device not found" type error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::DeviceNotFound { .. })
    }

    /// Check if this error came from the USB transport.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}
