//! Error types for the Linux backend

use thiserror::Error;

/// Linux i2c-dev and GPIO errors
#[derive(Debug, Error)]
pub enum LinuxError {
    /// Failed to open the i2c adapter
    #[error("Failed to open {path}: {source}")]
    OpenFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to bind the slave address
    #[error("Failed to set I2C slave address 0x{addr:02x}: {source}")]
    SetSlaveFailed {
        addr: u16,
        #[source]
        source: std::io::Error,
    },

    /// I2C transfer failed
    #[error("I2C transfer failed: {0}")]
    TransferFailed(#[source] std::io::Error),

    /// The adapter moved fewer bytes than requested
    #[error("Short I2C transfer: {actual} of {expected} bytes")]
    ShortTransfer { expected: usize, actual: usize },

    /// Failed to request the attention line
    #[error("Failed to request GPIO line {offset} on '{chip}': {source}")]
    LineRequestFailed {
        chip: String,
        offset: u32,
        #[source]
        source: gpiocdev::Error,
    },

    /// Failed to wait for or read an edge event
    #[error("GPIO edge event failed: {0}")]
    EdgeEventFailed(#[source] gpiocdev::Error),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Adapter not specified
    #[error("No I2C adapter specified. Use dev=/dev/i2c-N or i2cbus=N")]
    NoDevice,
}

/// Result type for Linux backend operations
pub type Result<T> = std::result::Result<T, LinuxError>;
