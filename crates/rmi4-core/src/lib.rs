//! rmi4-core - Core library for Synaptics RMI4 touch controllers
//!
//! This crate implements everything above the raw bus: the paged register
//! transport, function discovery through the descriptor table, touch report
//! decoding for the legacy (F11) and object (F12) protocols, the firmware
//! image parser and the F34 flash engine for bootloader v5 through v8.
//!
//! Backends plug in through [`bus::RegisterBus`] and [`bus::Attention`].
//!
//! # Example
//!
//! ```ignore
//! use rmi4_core::{device::{DeviceConfig, Rmi4Device}, transport::RmiTransport};
//!
//! fn show<B: rmi4_core::bus::RegisterBus + Send + 'static>(bus: B) -> rmi4_core::Result<()> {
//!     let device = Rmi4Device::new(RmiTransport::new(bus), DeviceConfig::default());
//!     device.probe()?;
//!     let info = device.info()?;
//!     println!("{} firmware {}", info.product_id, info.firmware_id);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bus;
pub mod device;
pub mod error;
pub mod flash;
pub mod function;
pub mod image;
pub mod pdt;
pub mod pump;
pub mod topology;
pub mod touch;
pub mod transport;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
