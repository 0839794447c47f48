//! Error types for rmi4-core
//!
//! All errors are small `Copy` values so they can be passed between the
//! event pump and the flash engine without allocation. Backends with richer
//! failure information log it and report [`Error::Transfer`] at the bus seam.

use core::fmt;

/// Register content that does not match what the protocol allows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// A mandatory function was not found in the descriptor table
    MissingFunction(u8),
    /// The flash function reports a version with no known bootloader dialect
    UnsupportedBootloader(u8),
    /// Image and device disagree on the bootloader generation
    BootloaderMismatch {
        /// Generation reported by the device
        device: u8,
        /// Generation declared by the image
        image: u8,
    },
    /// Device did not enter bootloader mode after the enable command
    NotInBootloader,
    /// The requested flash command has no encoding in the active dialect
    UnsupportedCommand,
    /// Image partition layout cannot be written over the device layout
    IncompatiblePartitionTable,
    /// A single bus transaction was larger than the bus allows
    TransferTooLarge(usize),
    /// Device reports a geometry value the engine cannot work with
    InvalidGeometry,
    /// A shared lock was poisoned by a panicking thread
    LockPoisoned,
}

/// Firmware image content errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    /// Image file could not be read
    Unreadable,
    /// Buffer is shorter than the fixed header
    TooSmall,
    /// Major header version is not one of 0x05, 0x06 or 0x10
    UnsupportedVersion(u8),
    /// A declared range does not fit in the buffer
    OutOfBounds {
        /// Start offset of the range
        offset: u32,
        /// Length of the range
        len: u32,
    },
    /// Two typed sections of the image share bytes
    Overlap,
    /// A container required by the bootloader generation is absent
    MissingContainer(u16),
    /// No firmware id was supplied by the caller nor declared by the image
    MissingFirmwareId,
}

/// Flash area checked against the device block count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeCheck {
    /// UI firmware (core code)
    UiFirmware,
    /// UI configuration (core config)
    UiConfig,
    /// Display configuration
    DisplayConfig,
    /// Bootloader configuration (global parameters)
    BootloaderConfig,
    /// Flash configuration (partition table)
    FlashConfig,
    /// Guest code
    GuestCode,
    /// Sum of all partitions
    Total,
}

/// Core error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A single bus transaction failed (reported by backends)
    Transfer,
    /// The transport exhausted its retries
    Bus {
        /// Logical register address of the failed transfer
        addr: u16,
        /// Number of attempts made
        attempts: u32,
    },
    /// Unexpected register content or device state
    Protocol(ProtocolError),
    /// Firmware image could not be used
    Image(ImageError),
    /// Flash status did not return to idle in time
    FlashTimeout {
        /// Last decoded flash status
        status: u8,
        /// Last decoded flash command
        command: u8,
    },
    /// Image partition size does not match the device block count
    SizeMismatch {
        /// Area that was checked
        area: SizeCheck,
        /// Blocks in the image
        image: u32,
        /// Blocks on the device
        device: u32,
    },
    /// An update is already running; the request was ignored
    Busy,
    /// Device has not been initialized or was torn down
    NotInitialized,
    /// The event pump thread could not be started
    PumpStart,
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<ImageError> for Error {
    fn from(e: ImageError) -> Self {
        Error::Image(e)
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingFunction(id) => write!(f, "function F{:02X} not found", id),
            Self::UnsupportedBootloader(v) => {
                write!(f, "unsupported flash function version {}", v)
            }
            Self::BootloaderMismatch { device, image } => write!(
                f,
                "bootloader mismatch: device is v{}, image is v{}",
                device, image
            ),
            Self::NotInBootloader => write!(f, "device did not enter bootloader mode"),
            Self::UnsupportedCommand => write!(f, "flash command not supported by bootloader"),
            Self::IncompatiblePartitionTable => write!(f, "incompatible partition table"),
            Self::TransferTooLarge(len) => write!(f, "transfer of {} bytes exceeds bus limit", len),
            Self::InvalidGeometry => write!(f, "invalid flash geometry"),
            Self::LockPoisoned => write!(f, "lock poisoned"),
        }
    }
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreadable => write!(f, "image file unreadable"),
            Self::TooSmall => write!(f, "image too small"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported image header version 0x{:02X}", v),
            Self::OutOfBounds { offset, len } => write!(
                f,
                "image range 0x{:08X}+0x{:X} out of bounds",
                offset, len
            ),
            Self::Overlap => write!(f, "image sections overlap"),
            Self::MissingContainer(id) => write!(f, "image is missing container {}", id),
            Self::MissingFirmwareId => write!(f, "no firmware id available"),
        }
    }
}

impl fmt::Display for SizeCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UiFirmware => "UI firmware",
            Self::UiConfig => "UI config",
            Self::DisplayConfig => "display config",
            Self::BootloaderConfig => "bootloader config",
            Self::FlashConfig => "flash config",
            Self::GuestCode => "guest code",
            Self::Total => "total block count",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transfer => write!(f, "bus transfer failed"),
            Self::Bus { addr, attempts } => write!(
                f,
                "bus error at register 0x{:04X} after {} attempts",
                addr, attempts
            ),
            Self::Protocol(e) => write!(f, "protocol error: {}", e),
            Self::Image(e) => write!(f, "image error: {}", e),
            Self::FlashTimeout { status, command } => write!(
                f,
                "flash timed out (status 0x{:02X}, command 0x{:02X})",
                status, command
            ),
            Self::SizeMismatch {
                area,
                image,
                device,
            } => write!(
                f,
                "{} size mismatch: image has {} blocks, device has {}",
                area, image, device
            ),
            Self::Busy => write!(f, "firmware update already in progress"),
            Self::NotInitialized => write!(f, "device not initialized"),
            Self::PumpStart => write!(f, "failed to start the event pump"),
        }
    }
}

impl std::error::Error for Error {}

/// Result type alias using the core Error type
pub type Result<T> = core::result::Result<T, Error>;
