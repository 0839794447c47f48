//! Bus and interrupt seams
//!
//! A backend provides two things: a [`RegisterBus`] that moves bytes to and
//! from 8-bit register addresses on a fixed slave, and an [`Attention`]
//! source that blocks until the controller asserts its interrupt line.
//! Everything above this module is backend independent.

use std::time::Duration;

use crate::error::Result;

/// Largest single transfer the I2C transport allows by default
pub const DEFAULT_MAX_TRANSFER: usize = 1024;

/// Byte-oriented register bus
///
/// Implementations address a single slave device. `reg` is the 8-bit
/// register offset within the currently selected page; paging is handled
/// by [`crate::transport::RmiTransport`].
///
/// Both operations either transfer every byte or return an error. A
/// partial transfer must be reported as [`crate::Error::Transfer`].
pub trait RegisterBus {
    /// Read `buf.len()` bytes starting at register `reg`
    fn read(&mut self, reg: u8, buf: &mut [u8]) -> Result<()>;

    /// Write `data` starting at register `reg`
    fn write(&mut self, reg: u8, data: &[u8]) -> Result<()>;

    /// Maximum number of bytes in a single transfer
    fn max_transfer(&self) -> usize {
        DEFAULT_MAX_TRANSFER
    }
}

impl<T: RegisterBus + ?Sized> RegisterBus for Box<T> {
    fn read(&mut self, reg: u8, buf: &mut [u8]) -> Result<()> {
        (**self).read(reg, buf)
    }

    fn write(&mut self, reg: u8, data: &[u8]) -> Result<()> {
        (**self).write(reg, data)
    }

    fn max_transfer(&self) -> usize {
        (**self).max_transfer()
    }
}

/// Interrupt line delivery
///
/// The event pump calls [`Attention::wait`] in a loop and must call
/// [`Attention::unmask`] exactly once for every assertion it handled.
pub trait Attention {
    /// Block until the line is asserted or `timeout` elapses
    ///
    /// Returns `true` when an interrupt was delivered. The timeout lets
    /// the pump notice a stop request.
    fn wait(&mut self, timeout: Duration) -> Result<bool>;

    /// Re-arm the line after an interrupt was serviced
    fn unmask(&mut self) -> Result<()>;
}

impl<T: Attention + ?Sized> Attention for Box<T> {
    fn wait(&mut self, timeout: Duration) -> Result<bool> {
        (**self).wait(timeout)
    }

    fn unmask(&mut self) -> Result<()> {
        (**self).unmask()
    }
}

/// Attention source that polls at a fixed interval
///
/// Used when no interrupt line is wired: every call to `wait` sleeps for the
/// interval (bounded by the timeout) and reports an assertion. The pump then
/// reads the interrupt status registers, which are empty when nothing
/// happened.
#[derive(Debug, Clone)]
pub struct PolledAttention {
    interval: Duration,
}

impl PolledAttention {
    /// Create a polled source with the given interval
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Default for PolledAttention {
    fn default() -> Self {
        Self::new(Duration::from_millis(10))
    }
}

impl Attention for PolledAttention {
    fn wait(&mut self, timeout: Duration) -> Result<bool> {
        std::thread::sleep(self.interval.min(timeout));
        Ok(self.interval <= timeout)
    }

    fn unmask(&mut self) -> Result<()> {
        Ok(())
    }
}
