//! Register bus over the Linux i2c-dev interface
//!
//! The adapter is opened once and bound to the controller's slave address
//! with the `I2C_SLAVE` ioctl. A register read is a one-byte write of the
//! offset followed by a read; a register write sends the offset and the
//! payload in one message.

use crate::error::{LinuxError, Result};
use crate::gpio::AttentionLine;

use rmi4_core::bus::{RegisterBus, DEFAULT_MAX_TRANSFER};
use rmi4_core::error::{Error as CoreError, Result as CoreResult};

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;

/// Default 7-bit slave address of RMI4 controllers
pub const DEFAULT_ADDR: u16 = 0x20;

mod ioctl {
    use nix::ioctl_write_int_bad;

    /// `I2C_SLAVE` from `linux/i2c-dev.h`
    const I2C_SLAVE: u16 = 0x0703;

    ioctl_write_int_bad!(i2c_set_slave, I2C_SLAVE);
}

/// Configuration for opening an i2c-dev adapter
#[derive(Debug, Clone)]
pub struct LinuxI2cConfig {
    /// Adapter path (e.g., "/dev/i2c-1")
    pub device: String,
    /// 7-bit slave address
    pub addr: u16,
    /// Largest single transfer
    pub max_transfer: usize,
    /// Attention line, when one is wired
    pub attention: Option<AttentionLine>,
}

impl Default for LinuxI2cConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            addr: DEFAULT_ADDR,
            max_transfer: DEFAULT_MAX_TRANSFER,
            attention: None,
        }
    }
}

impl LinuxI2cConfig {
    /// Create a configuration for the given adapter path
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            ..Default::default()
        }
    }

    /// Set the slave address
    pub fn with_addr(mut self, addr: u16) -> Self {
        self.addr = addr;
        self
    }

    /// Set the attention line
    pub fn with_attention(mut self, line: AttentionLine) -> Self {
        self.attention = Some(line);
        self
    }
}

/// RMI4 register bus on a Linux I2C adapter
pub struct LinuxI2c {
    file: File,
    addr: u16,
    max_transfer: usize,
}

impl LinuxI2c {
    /// Open the adapter and bind the slave address
    pub fn open(config: &LinuxI2cConfig) -> Result<Self> {
        if config.device.is_empty() {
            return Err(LinuxError::NoDevice);
        }

        log::debug!("linux_i2c: Opening device {}", config.device);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config.device)
            .map_err(|e| LinuxError::OpenFailed {
                path: config.device.clone(),
                source: e,
            })?;

        let addr = config.addr;
        unsafe {
            ioctl::i2c_set_slave(file.as_raw_fd(), libc::c_int::from(addr)).map_err(|e| {
                LinuxError::SetSlaveFailed {
                    addr,
                    source: std::io::Error::from_raw_os_error(e as i32),
                }
            })?;
        }

        log::info!(
            "linux_i2c: Opened {} (addr=0x{:02x})",
            config.device,
            addr
        );

        Ok(Self {
            file,
            addr,
            max_transfer: config.max_transfer,
        })
    }

    /// Slave address in use
    pub fn addr(&self) -> u16 {
        self.addr
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        let written = self.file.write(data).map_err(LinuxError::TransferFailed)?;
        if written != data.len() {
            return Err(LinuxError::ShortTransfer {
                expected: data.len(),
                actual: written,
            });
        }
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<()> {
        let read = self.file.read(buf).map_err(LinuxError::TransferFailed)?;
        if read != buf.len() {
            return Err(LinuxError::ShortTransfer {
                expected: buf.len(),
                actual: read,
            });
        }
        Ok(())
    }
}

fn to_core(e: LinuxError) -> CoreError {
    log::debug!("linux_i2c: {}", e);
    CoreError::Transfer
}

impl RegisterBus for LinuxI2c {
    fn read(&mut self, reg: u8, buf: &mut [u8]) -> CoreResult<()> {
        self.send(&[reg]).map_err(to_core)?;
        self.receive(buf).map_err(to_core)
    }

    fn write(&mut self, reg: u8, data: &[u8]) -> CoreResult<()> {
        let mut msg = Vec::with_capacity(data.len() + 1);
        msg.push(reg);
        msg.extend_from_slice(data);
        self.send(&msg).map_err(to_core)
    }

    fn max_transfer(&self) -> usize {
        self.max_transfer
    }
}

fn parse_number(value: &str) -> Option<u32> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Parse bus options from a list of key-value pairs
///
/// Keys: `dev`, `i2cbus` (adapter number), `addr`, `max_transfer` and
/// `irq` (`gpiochipN:line`). The bus clock belongs to the adapter, so
/// `speed` is rejected.
pub fn parse_options(options: &[(&str, &str)]) -> std::result::Result<LinuxI2cConfig, String> {
    let mut config = LinuxI2cConfig::default();

    for (key, value) in options {
        match *key {
            "dev" => {
                config.device = value.to_string();
            }
            "i2cbus" => {
                let bus = parse_number(value)
                    .ok_or_else(|| format!("Invalid i2cbus value: {}", value))?;
                config.device = format!("/dev/i2c-{}", bus);
            }
            "addr" => {
                let addr = parse_number(value)
                    .filter(|a| *a <= 0x7F)
                    .ok_or_else(|| format!("Invalid addr value: {} (must be 0x00-0x7f)", value))?;
                config.addr = addr as u16;
            }
            "speed" => {
                return Err(format!(
                    "speed={} cannot be set through i2c-dev; configure clock-frequency \
                     on the adapter's device-tree node instead",
                    value
                ));
            }
            "max_transfer" => {
                config.max_transfer = parse_number(value)
                    .filter(|n| *n > 0)
                    .ok_or_else(|| format!("Invalid max_transfer value: {}", value))?
                    as usize;
            }
            "irq" => {
                config.attention = Some(AttentionLine::parse(value)?);
            }
            _ => {
                log::warn!("linux_i2c: Unknown option: {}={}", key, value);
            }
        }
    }

    if config.device.is_empty() {
        return Err("No device specified. Use dev=/dev/i2c-N or i2cbus=N".to_string());
    }

    Ok(config)
}
