//! CLI command implementations
//!
//! Every command except `image` works on a probed [`rmi4_core::device::Rmi4Device`];
//! `watch` additionally starts the event pump.

pub mod image;
pub mod info;
pub mod read_config;
pub mod reset;
pub mod update;
pub mod watch;
