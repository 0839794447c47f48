//! rmi4-linux - Linux backend for RMI4 touch controllers
//!
//! This crate connects `rmi4-core` to real hardware on Linux: the register
//! bus goes through the i2c-dev character device (`/dev/i2c-N`) and the
//! attention interrupt is read as edge events from the GPIO character
//! device (`/dev/gpiochipN`) using the gpiocdev crate.
//!
//! # Example
//!
//! ```no_run
//! use rmi4_linux::{GpioAttention, LinuxI2c, LinuxI2cConfig, AttentionLine};
//!
//! let config = LinuxI2cConfig::new("/dev/i2c-1").with_addr(0x20);
//! let bus = LinuxI2c::open(&config)?;
//! let attention = GpioAttention::open(&AttentionLine::new("/dev/gpiochip0", 17))?;
//! # let _ = (bus, attention);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Usage with rmi4ctl
//!
//! ```bash
//! # Show device information
//! rmi4ctl info -b linux-i2c:dev=/dev/i2c-1,addr=0x20
//!
//! # Print touches, interrupt on gpiochip0 line 17
//! rmi4ctl watch -b linux-i2c:i2cbus=1,irq=gpiochip0:17
//! ```
//!
//! # System Requirements
//!
//! - Linux kernel with i2c-dev (`CONFIG_I2C_CHARDEV`)
//! - Kernel 5.10+ for the GPIO v2 uAPI (v1 is used as a fallback)
//! - No kernel driver bound to the controller's address

pub mod error;
pub mod gpio;
pub mod i2c;

// Re-exports
pub use error::{LinuxError, Result};
pub use gpio::{AttentionLine, GpioAttention};
pub use i2c::{parse_options, LinuxI2c, LinuxI2cConfig};

/// An opened adapter and its attention line
pub struct LinuxBackend {
    /// Register bus
    pub bus: LinuxI2c,
    /// Attention source, when `irq=` was given
    pub attention: Option<GpioAttention>,
}

/// Open a Linux backend from bus option pairs
///
/// This is a convenience function for the CLI bus dispatch.
///
/// # Example Options
///
/// - `dev=/dev/i2c-1` or `i2cbus=1` - Required: adapter
/// - `addr=0x20` - Optional: slave address (default: 0x20)
/// - `irq=gpiochip0:17` - Optional: attention line; polled without it
pub fn open_linux_i2c(
    options: &[(&str, &str)],
) -> std::result::Result<LinuxBackend, Box<dyn std::error::Error>> {
    let config = parse_options(options)?;
    let bus = LinuxI2c::open(&config)?;
    let attention = config
        .attention
        .as_ref()
        .map(GpioAttention::open)
        .transpose()?;
    Ok(LinuxBackend { bus, attention })
}
