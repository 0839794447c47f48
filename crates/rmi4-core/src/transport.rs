//! Paged register transport
//!
//! RMI4 exposes a 16-bit register space as 256 pages of 256 registers.
//! The high byte of an address is selected by writing the page number to
//! register 0xFF; the low byte is the register offset used on the bus.
//! The transport caches the selected page, serializes every transaction
//! behind a single lock and retries failed phases with a fixed backoff.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::bus::RegisterBus;
use crate::error::{Error, ProtocolError, Result};

/// Register used for page selection
pub const PAGE_SELECT_REGISTER: u8 = 0xFF;

/// Default number of attempts per transfer phase
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 10;

/// Default delay between attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(20);

/// A 16-bit logical register address: page in the high byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterAddress(pub u16);

impl RegisterAddress {
    /// Build an address from page and offset
    pub const fn new(page: u8, offset: u8) -> Self {
        Self(((page as u16) << 8) | offset as u16)
    }

    /// Page number
    pub const fn page(self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// Register offset within the page
    pub const fn offset(self) -> u8 {
        self.0 as u8
    }
}

impl From<u16> for RegisterAddress {
    fn from(addr: u16) -> Self {
        Self(addr)
    }
}

/// Retry policy and limits for the transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Attempts per phase (page select, data transfer)
    pub attempts: u32,
    /// Sleep between attempts
    pub retry_delay: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl TransportConfig {
    /// Set the number of attempts per phase
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Set the delay between attempts
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

struct Inner {
    bus: Box<dyn RegisterBus + Send>,
    /// Selected page, `None` until the next access selects one
    page: Option<u8>,
}

/// Paged, retrying, serialized access to an RMI4 register map
pub struct RmiTransport {
    inner: Mutex<Inner>,
    config: TransportConfig,
}

impl RmiTransport {
    /// Wrap a bus with the default retry policy
    pub fn new<B>(bus: B) -> Self
    where
        B: RegisterBus + Send + 'static,
    {
        Self::with_config(bus, TransportConfig::default())
    }

    /// Wrap a bus with an explicit retry policy
    pub fn with_config<B>(bus: B, config: TransportConfig) -> Self
    where
        B: RegisterBus + Send + 'static,
    {
        Self {
            inner: Mutex::new(Inner {
                bus: Box::new(bus),
                page: None,
            }),
            config,
        }
    }

    /// Transport configuration
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Forget the cached page so the next access selects it again
    ///
    /// Required after a device reset, which returns the controller to
    /// page 0 behind our back.
    pub fn invalidate_page(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.page = None;
        Ok(())
    }

    /// Read `buf.len()` bytes starting at `addr`
    pub fn read(&self, addr: impl Into<RegisterAddress>, buf: &mut [u8]) -> Result<()> {
        let addr = addr.into();
        let mut inner = self.lock()?;
        Self::check_len(&inner, buf.len())?;
        self.select_page(&mut inner, addr)?;
        self.retry(addr, || inner.bus.read(addr.offset(), buf))
    }

    /// Read `len` bytes starting at `addr` into a new buffer
    pub fn read_vec(&self, addr: impl Into<RegisterAddress>, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }

    /// Read a single register
    pub fn read_byte(&self, addr: impl Into<RegisterAddress>) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read(addr, &mut buf)?;
        Ok(buf[0])
    }

    /// Write `data` starting at `addr`
    pub fn write(&self, addr: impl Into<RegisterAddress>, data: &[u8]) -> Result<()> {
        let addr = addr.into();
        let mut inner = self.lock()?;
        Self::check_len(&inner, data.len())?;
        self.select_page(&mut inner, addr)?;
        self.retry(addr, || inner.bus.write(addr.offset(), data))
    }

    /// Write a single register
    pub fn write_byte(&self, addr: impl Into<RegisterAddress>, value: u8) -> Result<()> {
        self.write(addr, &[value])
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Protocol(ProtocolError::LockPoisoned))
    }

    fn check_len(inner: &Inner, len: usize) -> Result<()> {
        if len > inner.bus.max_transfer() {
            return Err(Error::Protocol(ProtocolError::TransferTooLarge(len)));
        }
        Ok(())
    }

    fn select_page(&self, inner: &mut Inner, addr: RegisterAddress) -> Result<()> {
        let page = addr.page();
        if inner.page == Some(page) {
            return Ok(());
        }

        let select = RegisterAddress::new(page, PAGE_SELECT_REGISTER);
        let bus = &mut inner.bus;
        self.retry(select, || bus.write(PAGE_SELECT_REGISTER, &[page]))?;
        log::trace!("rmi4: selected page {}", page);
        inner.page = Some(page);
        Ok(())
    }

    fn retry<F>(&self, addr: RegisterAddress, mut op: F) -> Result<()>
    where
        F: FnMut() -> Result<()>,
    {
        let attempts = self.config.attempts.max(1);
        for attempt in 1..=attempts {
            match op() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::debug!(
                        "rmi4: transfer at 0x{:04X} failed ({}), attempt {}/{}",
                        addr.0,
                        e,
                        attempt,
                        attempts
                    );
                    if attempt < attempts {
                        thread::sleep(self.config.retry_delay);
                    }
                }
            }
        }

        log::warn!(
            "rmi4: giving up on register 0x{:04X} after {} attempts",
            addr.0,
            attempts
        );
        Err(Error::Bus {
            addr: addr.0,
            attempts,
        })
    }
}
