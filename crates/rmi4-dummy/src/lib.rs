//! rmi4-dummy - Simulated RMI4 touch controller for testing
//!
//! This crate provides a register-level model of a Synaptics controller:
//! a descriptor table, device control (F01), a 2D sensor in either report
//! format (F11 or F12), optional capacitive buttons (F1A) and a flash
//! function (F34) that runs every bootloader generation from v5 to v8.
//! It implements [`RegisterBus`] and [`Attention`], so the whole stack in
//! `rmi4-core` can run against it without hardware.
//!
//! The flash function records every erase, write and read it executes,
//! which lets tests assert on the exact programming sequence.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod flash;
pub mod image;

#[cfg(test)]
mod scenarios;

pub use flash::FlashOp;

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use rmi4_core::bus::{Attention, RegisterBus};
use rmi4_core::error::{Error, Result};
use rmi4_core::function::f34::{BootloaderVersion, Dialect};
use rmi4_core::image::partition::{PartitionEntry, PartitionId, PartitionTable};
use rmi4_core::pdt::{function, PdtEntry, PDT_END, PDT_START};
use rmi4_core::touch::Contact;
use rmi4_core::transport::{RmiTransport, TransportConfig, PAGE_SELECT_REGISTER};

use flash::FlashFunction;

/// Register map of page 0
pub mod reg {
    /// F01 query base
    pub const F01_QUERY: u8 = 0x00;
    /// F01 build id, a packet register inside the query space
    pub const F01_BUILD_ID: u8 = 0x12;
    /// F01 command base
    pub const F01_COMMAND: u8 = 0x16;
    /// F01 device control
    pub const F01_CONTROL: u8 = 0x17;
    /// F01 interrupt enable
    pub const F01_INT_ENABLE: u8 = 0x18;
    /// F01 device status, followed by the interrupt status
    pub const F01_DATA: u8 = 0x19;
    /// 2D sensor query base
    pub const TOUCH_QUERY: u8 = 0x20;
    /// 2D sensor command base
    pub const TOUCH_COMMAND: u8 = 0x2F;
    /// 2D sensor control base
    pub const TOUCH_CONTROL: u8 = 0x30;
    /// 2D sensor data base
    pub const TOUCH_DATA: u8 = 0x40;
    /// F1A query base
    pub const F1A_QUERY: u8 = 0x78;
    /// F1A command base
    pub const F1A_COMMAND: u8 = 0x79;
    /// F1A control base
    pub const F1A_CONTROL: u8 = 0x7A;
    /// F1A data base
    pub const F1A_DATA: u8 = 0x7C;
    /// F34 query base
    pub const F34_QUERY: u8 = 0x80;
    /// F34 command base
    pub const F34_COMMAND: u8 = 0x8F;
    /// F34 control base, holds the config id
    pub const F34_CONTROL: u8 = 0x90;
    /// F34 data base
    pub const F34_DATA: u8 = 0xB0;
}

/// Interrupt status bits in descriptor order
pub mod irq {
    /// Flash function
    pub const F34: u8 = 1 << 0;
    /// Device control
    pub const F01: u8 = 1 << 1;
    /// 2D sensor
    pub const TOUCH: u8 = 1 << 2;
    /// Buttons
    pub const F1A: u8 = 1 << 3;
}

/// Device status after a reset, before the host configured the device
const STATUS_UNCONFIGURED: u8 = 0x80;

/// Device status while the bootloader runs
const STATUS_FLASH_PROG: u8 = 0x40;

/// Device control bit set by the host once configured
const CONTROL_CONFIGURED: u8 = 0x80;

/// Blocks reserved for the bootloader code on partitioned devices
const BOOTLOADER_BLOCKS: u16 = 4;

/// Report format of the simulated 2D sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchProtocol {
    /// F11 finger records
    Legacy,
    /// F12 object records
    Object,
}

/// Configuration for the simulated controller
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// Report format of the 2D sensor
    pub protocol: TouchProtocol,
    /// Bootloader generation of the flash function
    pub bootloader: BootloaderVersion,
    /// Finger slots (1 to 5 or 10 with the legacy format)
    pub fingers: usize,
    /// Largest X coordinate
    pub max_x: u16,
    /// Largest Y coordinate
    pub max_y: u16,
    /// Capacitive buttons, 0 for none (at most 8)
    pub buttons: usize,
    /// Product id, at most 7 characters
    pub product_id: String,
    /// Firmware id reported through the build id (24 bits)
    pub firmware_id: u32,
    /// Leading bytes of the UI config, reported as the config id
    pub config_id: Vec<u8>,
    /// Flash block size in bytes
    pub block_size: u16,
    /// Blocks per transfer on partitioned bootloaders
    pub payload_length: u16,
    /// UI firmware blocks
    pub firmware_blocks: u16,
    /// UI config blocks
    pub config_blocks: u16,
    /// Display config blocks, 0 for none
    pub display_config_blocks: u16,
    /// Guest code blocks, 0 for none
    pub guest_code_blocks: u16,
    /// Global parameter blocks on partitioned bootloaders
    pub global_parameter_blocks: u16,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            protocol: TouchProtocol::Object,
            bootloader: BootloaderVersion::V7,
            fingers: 10,
            max_x: 1079,
            max_y: 1919,
            buttons: 0,
            product_id: "S3706".into(),
            firmware_id: 2_345_678,
            config_id: vec![0, 0, 0, 1],
            block_size: 16,
            payload_length: 4,
            firmware_blocks: 8,
            config_blocks: 2,
            display_config_blocks: 1,
            guest_code_blocks: 0,
            global_parameter_blocks: 1,
        }
    }
}

impl DummyConfig {
    /// Bootloader id checked by erase and enable commands
    pub fn bootloader_id(&self) -> [u8; 2] {
        [0x02, self.bootloader.number()]
    }

    fn partition_count(&self) -> usize {
        5 + (self.display_config_blocks > 0) as usize + (self.guest_code_blocks > 0) as usize
    }

    /// Blocks holding the partition table
    pub fn flash_config_blocks(&self) -> u16 {
        (self.partition_count() * 8 + 2).div_ceil(self.block_size as usize) as u16
    }

    /// Flash layout of a partitioned bootloader
    pub fn partition_table(&self) -> PartitionTable {
        let mut layout = vec![
            (PartitionId::Bootloader, BOOTLOADER_BLOCKS),
            (PartitionId::FlashConfig, self.flash_config_blocks()),
            (PartitionId::GlobalParameters, self.global_parameter_blocks),
            (PartitionId::CoreCode, self.firmware_blocks),
            (PartitionId::CoreConfig, self.config_blocks),
        ];
        if self.display_config_blocks > 0 {
            layout.push((PartitionId::DisplayConfig, self.display_config_blocks));
        }
        if self.guest_code_blocks > 0 {
            layout.push((PartitionId::GuestCode, self.guest_code_blocks));
        }

        let mut address = 0;
        let entries = layout
            .into_iter()
            .map(|(id, length)| {
                let entry = PartitionEntry {
                    id: id as u8,
                    length,
                    address,
                    properties: 0,
                };
                address += length;
                entry
            })
            .collect();
        PartitionTable::from_entries(entries)
    }

    /// Initial UI config content: the config id followed by zeros
    fn ui_config(&self) -> Vec<u8> {
        let mut config = vec![0u8; self.config_blocks as usize * self.block_size as usize];
        let len = self.config_id.len().min(config.len());
        config[..len].copy_from_slice(&self.config_id[..len]);
        config
    }

    /// Initial content of every flash area
    fn areas(&self) -> HashMap<PartitionId, Vec<u8>> {
        let bs = self.block_size as usize;
        let mut areas = HashMap::new();
        areas.insert(PartitionId::CoreCode, vec![0xA5; self.firmware_blocks as usize * bs]);
        areas.insert(PartitionId::CoreConfig, self.ui_config());
        if self.display_config_blocks > 0 {
            areas.insert(
                PartitionId::DisplayConfig,
                vec![0xD5; self.display_config_blocks as usize * bs],
            );
        }
        if self.guest_code_blocks > 0 {
            areas.insert(PartitionId::GuestCode, vec![0x65; self.guest_code_blocks as usize * bs]);
        }
        if self.bootloader.dialect() == Dialect::Partitioned {
            let mut table = self.partition_table().encode();
            table.resize(self.flash_config_blocks() as usize * bs, 0xFF);
            areas.insert(PartitionId::FlashConfig, table);
            areas.insert(PartitionId::Bootloader, vec![0xB1; BOOTLOADER_BLOCKS as usize * bs]);
            areas.insert(
                PartitionId::GlobalParameters,
                vec![0x5A; self.global_parameter_blocks as usize * bs],
            );
        }
        areas
    }
}

/// Parse bus options from a list of key-value pairs
///
/// Keys: `protocol` (`f11` or `f12`), `bootloader` (5 to 8), `fingers`,
/// `buttons`, `fwid` and `product`.
pub fn parse_options(options: &[(&str, &str)]) -> std::result::Result<DummyConfig, String> {
    let mut config = DummyConfig::default();

    for (key, value) in options {
        match *key {
            "protocol" => {
                config.protocol = match *value {
                    "f11" | "legacy" => TouchProtocol::Legacy,
                    "f12" | "object" => TouchProtocol::Object,
                    _ => return Err(format!("Invalid protocol: {} (must be f11 or f12)", value)),
                };
            }
            "bootloader" => {
                config.bootloader = match *value {
                    "5" => BootloaderVersion::V5,
                    "6" => BootloaderVersion::V6,
                    "7" => BootloaderVersion::V7,
                    "8" => BootloaderVersion::V8,
                    _ => return Err(format!("Invalid bootloader: {} (must be 5-8)", value)),
                };
            }
            "fingers" => {
                config.fingers = value
                    .parse()
                    .ok()
                    .filter(|n| (1..=10).contains(n))
                    .ok_or_else(|| format!("Invalid fingers value: {}", value))?;
            }
            "buttons" => {
                config.buttons = value
                    .parse()
                    .ok()
                    .filter(|n| *n <= 8)
                    .ok_or_else(|| format!("Invalid buttons value: {}", value))?;
            }
            "fwid" => {
                config.firmware_id = value
                    .parse()
                    .ok()
                    .filter(|id| *id <= 0xFF_FFFF)
                    .ok_or_else(|| format!("Invalid fwid value: {}", value))?;
            }
            "product" => {
                if value.len() > 7 {
                    return Err(format!("Product id too long: {}", value));
                }
                config.product_id = value.to_string();
            }
            _ => {
                log::warn!("dummy: Unknown option: {}={}", key, value);
            }
        }
    }

    if config.protocol == TouchProtocol::Legacy && !matches!(config.fingers, 1..=5 | 10) {
        return Err(format!(
            "The f11 protocol supports 1-5 or 10 fingers, not {}",
            config.fingers
        ));
    }

    Ok(config)
}

struct State {
    config: DummyConfig,
    page: u8,
    memory: [u8; 256],
    packets: HashMap<u8, Vec<u8>>,
    flash: FlashFunction,
    bootloader_mode: bool,
    status: u8,
    control: u8,
    int_enable: u8,
    irq: u8,
    edges: u64,
    fail_next: u32,
    /// Bus read transactions served
    reads: u64,
}

impl State {
    fn new(config: DummyConfig) -> Self {
        let flash = FlashFunction::new(
            config.bootloader,
            config.block_size,
            config.bootloader_id(),
            config.areas(),
        );
        let mut state = Self {
            config,
            page: 0,
            memory: [0; 256],
            packets: HashMap::new(),
            flash,
            bootloader_mode: false,
            status: 0,
            control: 0,
            int_enable: 0,
            irq: 0,
            edges: 0,
            fail_next: 0,
            reads: 0,
        };
        state.load_device_control();
        state.load_touch();
        state.load_buttons();
        state.load_flash_query();
        state.reset();
        state
    }

    fn poke(&mut self, reg: u8, data: &[u8]) {
        let start = reg as usize;
        let end = (start + data.len()).min(self.memory.len());
        self.memory[start..end].copy_from_slice(&data[..end - start]);
    }

    fn load_device_control(&mut self) {
        let mut query = [0u8; 21];
        query[0] = rmi4_core::function::f01::MANUFACTURER_SYNAPTICS;
        let id = self.config.product_id.as_bytes();
        let len = id.len().min(7);
        query[11..11 + len].copy_from_slice(&id[..len]);
        self.poke(reg::F01_QUERY, &query);
        self.set_firmware_id(self.config.firmware_id);
    }

    fn set_firmware_id(&mut self, id: u32) {
        self.config.firmware_id = id;
        let [b0, b1, b2, _] = id.to_le_bytes();
        self.packets.insert(reg::F01_BUILD_ID, vec![b0, b1, b2]);
    }

    fn load_touch(&mut self) {
        let c = self.config.clone();
        match c.protocol {
            TouchProtocol::Legacy => {
                let code = match c.fingers {
                    n @ 1..=5 => n as u8 - 1,
                    _ => 5,
                };
                let [xl, xh] = c.max_x.to_le_bytes();
                let [yl, yh] = c.max_y.to_le_bytes();
                self.poke(reg::TOUCH_QUERY, &[0, code]);
                self.poke(reg::TOUCH_CONTROL + 6, &[xl, xh & 0x0F, yl, yh & 0x0F]);
            }
            TouchProtocol::Object => {
                let fingers = c.fingers as u8;
                let mut ctrl8 = vec![0u8; 14];
                ctrl8[..2].copy_from_slice(&c.max_x.to_le_bytes());
                ctrl8[2..4].copy_from_slice(&c.max_y.to_le_bytes());

                self.poke(reg::TOUCH_QUERY + 4, &[5]);
                self.poke(reg::TOUCH_QUERY + 7, &[3]);
                let packets = [
                    (reg::TOUCH_QUERY + 5, vec![6, 0x00, 0x01, 0x90, 0x10]),
                    (reg::TOUCH_QUERY + 6, vec![14, 0x7F, 3, 0x01, 5, 0x1F]),
                    (reg::TOUCH_QUERY + 8, vec![0, 0x02, 0x80]),
                    (reg::TOUCH_CONTROL, ctrl8),
                    (reg::TOUCH_CONTROL + 1, vec![0]),
                    (reg::TOUCH_CONTROL + 2, vec![0x05, fingers, 0, 0, 0]),
                    (reg::TOUCH_CONTROL + 3, vec![0x07]),
                ];
                self.packets.extend(packets);
            }
        }
        self.write_contacts(&[]);
    }

    fn load_buttons(&mut self) {
        if self.config.buttons > 0 {
            let count = self.config.buttons.min(8) as u8;
            self.poke(reg::F1A_QUERY, &[count - 1]);
        }
    }

    fn load_flash_query(&mut self) {
        let c = self.config.clone();
        let bl_id = c.bootloader_id();
        let [bsl, bsh] = c.block_size.to_le_bytes();
        let word = |v: u16| v.to_le_bytes();
        let q = reg::F34_QUERY;

        match c.bootloader {
            BootloaderVersion::V5 | BootloaderVersion::V6 => {
                let mut props = 0x04;
                if c.display_config_blocks > 0 {
                    props |= 0x20;
                }
                if c.guest_code_blocks > 0 {
                    props |= 0x80;
                }
                let mut counts = Vec::new();
                counts.extend(word(c.firmware_blocks));
                counts.extend(word(c.config_blocks));
                if c.display_config_blocks > 0 {
                    counts.extend(word(c.display_config_blocks));
                }
                if c.bootloader == BootloaderVersion::V5 {
                    self.poke(q, &[bl_id[0], bl_id[1], props, bsl, bsh]);
                    self.poke(q + 5, &counts);
                } else {
                    let guest = word(c.guest_code_blocks);
                    let packets = [
                        (q, bl_id.to_vec()),
                        (q + 1, vec![props]),
                        (q + 2, vec![bsl, bsh]),
                        (q + 3, counts),
                        (q + 4, vec![(c.guest_code_blocks > 0) as u8]),
                        (q + 5, guest.to_vec()),
                    ];
                    self.packets.extend(packets);
                }
            }
            BootloaderVersion::V7 | BootloaderVersion::V8 => {
                let mut support = 0u32;
                for entry in c.partition_table().entries() {
                    support |= 1 << entry.id;
                }
                let mut query = [0u8; 21];
                query[..2].copy_from_slice(&bl_id);
                query[7..9].copy_from_slice(&word(c.block_size));
                query[13..15].copy_from_slice(&word(c.flash_config_blocks()));
                query[15..17].copy_from_slice(&word(c.payload_length));
                query[17..21].copy_from_slice(&support.to_le_bytes());
                self.poke(q, &[0]);
                self.poke(q + 1, &query);
            }
        }
    }

    fn rebuild_pdt(&mut self) {
        let function_version = match self.config.bootloader {
            BootloaderVersion::V5 => 0,
            BootloaderVersion::V6 => 1,
            BootloaderVersion::V7 | BootloaderVersion::V8 => 2,
        };
        let mut entries = vec![
            PdtEntry::new(
                function::F34,
                function_version,
                1,
                [reg::F34_QUERY, reg::F34_COMMAND, reg::F34_CONTROL, reg::F34_DATA],
            ),
            PdtEntry::new(
                function::F01,
                0,
                1,
                [reg::F01_QUERY, reg::F01_COMMAND, reg::F01_CONTROL, reg::F01_DATA],
            ),
        ];
        if !self.bootloader_mode {
            let touch = match self.config.protocol {
                TouchProtocol::Legacy => function::F11,
                TouchProtocol::Object => function::F12,
            };
            entries.push(PdtEntry::new(
                touch,
                0,
                1,
                [reg::TOUCH_QUERY, reg::TOUCH_COMMAND, reg::TOUCH_CONTROL, reg::TOUCH_DATA],
            ));
            if self.config.buttons > 0 {
                entries.push(PdtEntry::new(
                    function::F1A,
                    0,
                    1,
                    [reg::F1A_QUERY, reg::F1A_COMMAND, reg::F1A_CONTROL, reg::F1A_DATA],
                ));
            }
        }

        self.memory[PDT_END as usize..PDT_START as usize + 6].fill(0);
        let mut offset = PDT_START;
        for entry in entries {
            self.poke(offset, entry.as_bytes());
            offset -= 6;
        }
    }

    fn interrupt_sources(&self) -> u8 {
        if self.bootloader_mode {
            irq::F34 | irq::F01
        } else if self.config.buttons > 0 {
            irq::F34 | irq::F01 | irq::TOUCH | irq::F1A
        } else {
            irq::F34 | irq::F01 | irq::TOUCH
        }
    }

    /// Controller reset: the bootloader keeps running while the firmware
    /// is erased
    fn reset(&mut self) {
        self.flash.reset();
        self.bootloader_mode = self.flash.in_bootloader;
        self.rebuild_pdt();
        self.status = STATUS_UNCONFIGURED;
        if self.bootloader_mode {
            self.status |= STATUS_FLASH_PROG;
        }
        self.control = 0;
        self.int_enable = self.interrupt_sources();
        self.raise(irq::F01);
    }

    /// Follow mode changes made by the flash function
    fn sync_mode(&mut self) {
        if self.flash.in_bootloader == self.bootloader_mode {
            return;
        }
        self.bootloader_mode = self.flash.in_bootloader;
        log::debug!(
            "dummy: {} bootloader mode",
            if self.bootloader_mode { "entered" } else { "left" }
        );
        self.rebuild_pdt();
        if self.bootloader_mode {
            self.status |= STATUS_FLASH_PROG;
        } else {
            self.status &= !STATUS_FLASH_PROG;
        }
    }

    fn raise(&mut self, bits: u8) {
        self.irq |= bits;
        if self.irq & self.int_enable != 0 {
            self.edges += 1;
        }
    }

    fn write_contacts(&mut self, contacts: &[Contact]) {
        let fingers = self.config.fingers;
        match self.config.protocol {
            TouchProtocol::Legacy => {
                let nregs = fingers.div_ceil(4);
                let mut data = vec![0u8; nregs + fingers * 5];
                for (i, c) in contacts.iter().take(fingers).enumerate() {
                    data[i / 4] |= 0x01 << ((i % 4) * 2);
                    let r = nregs + i * 5;
                    data[r] = (c.x >> 4) as u8;
                    data[r + 1] = (c.y >> 4) as u8;
                    data[r + 2] = ((c.y & 0x0F) as u8) << 4 | (c.x & 0x0F) as u8;
                    data[r + 3] = (c.width_y & 0x0F) << 4 | (c.width_x & 0x0F);
                    data[r + 4] = 40;
                }
                self.poke(reg::TOUCH_DATA, &data);
            }
            TouchProtocol::Object => {
                let mut records = vec![0u8; fingers * 8];
                let mut bitmap = vec![0u8; fingers.div_ceil(8)];
                for (i, c) in contacts.iter().take(fingers).enumerate() {
                    let [xl, xh] = c.x.to_le_bytes();
                    let [yl, yh] = c.y.to_le_bytes();
                    records[i * 8..i * 8 + 8]
                        .copy_from_slice(&[0x01, xl, xh, yl, yh, 40, c.width_x, c.width_y]);
                    bitmap[i / 8] |= 1 << (i % 8);
                }
                self.packets.insert(reg::TOUCH_DATA, records);
                self.packets.insert(reg::TOUCH_DATA + 1, bitmap);
            }
        }
    }

    fn read(&mut self, r: u8, buf: &mut [u8]) {
        buf.fill(0);
        if self.page != 0 {
            return;
        }
        let data_len = self.flash.data_len();
        match r {
            reg::F01_DATA => {
                let regs = [self.status, self.irq];
                copy_prefix(buf, &regs);
                if buf.len() > 1 {
                    self.irq = 0;
                }
            }
            reg::F01_CONTROL => copy_prefix(buf, &[self.control, self.int_enable]),
            reg::F01_INT_ENABLE => copy_prefix(buf, &[self.int_enable]),
            reg::F34_CONTROL => {
                if let Some(config) = self.flash.area(PartitionId::CoreConfig) {
                    copy_prefix(buf, config);
                }
            }
            r if r >= reg::F34_DATA && (r - reg::F34_DATA) < data_len as u8 => {
                self.flash.read((r - reg::F34_DATA) as u16, buf);
            }
            r => match self.packets.get(&r) {
                Some(packet) => copy_prefix(buf, packet),
                None => copy_prefix(buf, &self.memory[r as usize..]),
            },
        }
    }

    fn write(&mut self, r: u8, data: &[u8]) {
        if r == PAGE_SELECT_REGISTER {
            self.page = data[0];
            return;
        }
        if self.page != 0 {
            return;
        }
        let data_len = self.flash.data_len();
        match r {
            reg::F01_COMMAND => {
                if data[0] & 0x01 != 0 {
                    log::debug!("dummy: software reset");
                    self.reset();
                }
            }
            reg::F01_CONTROL => {
                self.control = data[0];
                if let Some(&enable) = data.get(1) {
                    self.int_enable = enable;
                }
                if self.control & CONTROL_CONFIGURED != 0 {
                    self.status &= !STATUS_UNCONFIGURED;
                }
            }
            reg::F01_INT_ENABLE => self.int_enable = data[0],
            r if r >= reg::F34_DATA && (r - reg::F34_DATA) < data_len as u8 => {
                self.flash.write((r - reg::F34_DATA) as u16, data);
                self.sync_mode();
            }
            r => {
                if let Some(packet) = self.packets.get_mut(&r) {
                    *packet = data.to_vec();
                } else {
                    self.poke(r, data);
                }
            }
        }
    }
}

fn copy_prefix(dst: &mut [u8], src: &[u8]) {
    let n = dst.len().min(src.len());
    dst[..n].copy_from_slice(&src[..n]);
}

struct Inner {
    state: Mutex<State>,
    edge: Condvar,
}

/// Simulated controller
///
/// Clones share the same device. Test code injects touches, button presses
/// and resets through the methods here while the stack under test talks to
/// it through [`RegisterBus`].
#[derive(Clone)]
pub struct DummyController {
    inner: Arc<Inner>,
}

impl DummyController {
    /// Create a controller in UI mode, freshly reset
    pub fn new(config: DummyConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::new(config)),
                edge: Condvar::new(),
            }),
        }
    }

    /// Create a controller with the default configuration
    pub fn new_default() -> Self {
        Self::new(DummyConfig::default())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn modify(&self, f: impl FnOnce(&mut State)) {
        f(&mut self.state());
        self.inner.edge.notify_all();
    }

    /// Transport without retry delays
    pub fn transport(&self) -> RmiTransport {
        RmiTransport::with_config(
            self.clone(),
            TransportConfig::default().with_retry_delay(Duration::ZERO),
        )
    }

    /// Interrupt line of this controller
    pub fn attention(&self) -> DummyAttention {
        DummyAttention {
            inner: Arc::clone(&self.inner),
            seen: self.state().edges,
        }
    }

    /// Configuration the controller was built from
    pub fn config(&self) -> DummyConfig {
        self.state().config.clone()
    }

    /// Put fingers 0..n on the sensor and lift the others
    pub fn set_contacts(&self, contacts: &[Contact]) {
        self.modify(|s| {
            s.write_contacts(contacts);
            s.raise(irq::TOUCH);
        });
    }

    /// Lift every finger
    pub fn release_all(&self) {
        self.set_contacts(&[]);
    }

    /// Set the pressed buttons as a bitmap
    pub fn press_buttons(&self, bitmap: u8) {
        self.modify(|s| {
            s.poke(reg::F1A_DATA, &[bitmap]);
            s.raise(irq::F1A);
        });
    }

    /// Reset the controller as if its watchdog fired
    pub fn trigger_reset(&self) {
        self.modify(State::reset);
    }

    /// Report a new firmware id
    pub fn set_firmware_id(&self, id: u32) {
        self.modify(|s| s.set_firmware_id(id));
    }

    /// Fail the next `count` bus transactions
    pub fn fail_next(&self, count: u32) {
        self.state().fail_next = count;
    }

    /// Bus read transactions served so far
    pub fn bus_reads(&self) -> u64 {
        self.state().reads
    }

    /// Keep flash commands with this opcode pending forever
    pub fn stall_flash(&self, opcode: Option<u8>) {
        self.state().flash.stalled = opcode;
    }

    /// Make the next v8 erase report a bad partition table
    pub fn report_bad_partition_table(&self) {
        self.state().flash.bad_table_on_erase = true;
    }

    /// Flash operations executed so far
    pub fn ops(&self) -> Vec<FlashOp> {
        self.state().flash.ops.clone()
    }

    /// Forget the recorded flash operations
    pub fn clear_ops(&self) {
        self.state().flash.ops.clear();
    }

    /// Content of a flash area
    pub fn area(&self, id: PartitionId) -> Option<Vec<u8>> {
        self.state().flash.area(id).map(<[u8]>::to_vec)
    }

    /// Replace the content of a flash area, keeping its size
    pub fn fill_area(&self, id: PartitionId, byte: u8) {
        if let Some(area) = self.state().flash.area_mut(id) {
            area.fill(byte);
        }
    }

    /// Controller runs its bootloader
    pub fn in_bootloader(&self) -> bool {
        self.state().bootloader_mode
    }

    /// Host has configured the controller since the last reset
    pub fn is_configured(&self) -> bool {
        let s = self.state();
        s.control & CONTROL_CONFIGURED != 0 && s.status & STATUS_UNCONFIGURED == 0
    }

    /// Interrupt enable register
    pub fn interrupt_enable(&self) -> u8 {
        self.state().int_enable
    }

    /// Device control register
    pub fn control(&self) -> u8 {
        self.state().control
    }
}

impl Default for DummyController {
    fn default() -> Self {
        Self::new_default()
    }
}

impl RegisterBus for DummyController {
    fn read(&mut self, reg: u8, buf: &mut [u8]) -> Result<()> {
        let mut s = self.state();
        if s.fail_next > 0 {
            s.fail_next -= 1;
            return Err(Error::Transfer);
        }
        s.reads += 1;
        s.read(reg, buf);
        Ok(())
    }

    fn write(&mut self, reg: u8, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        {
            let mut s = self.state();
            if s.fail_next > 0 {
                s.fail_next -= 1;
                return Err(Error::Transfer);
            }
            s.write(reg, data);
        }
        self.inner.edge.notify_all();
        Ok(())
    }
}

/// Interrupt line of a [`DummyController`]
///
/// Edge triggered: every assertion while the source is enabled is
/// delivered once.
pub struct DummyAttention {
    inner: Arc<Inner>,
    seen: u64,
}

impl Attention for DummyAttention {
    fn wait(&mut self, timeout: Duration) -> Result<bool> {
        let guard = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let seen = self.seen;
        let (state, _) = self
            .inner
            .edge
            .wait_timeout_while(guard, timeout, |s| s.edges == seen)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let fired = state.edges != seen;
        self.seen = state.edges;
        Ok(fired)
    }

    fn unmask(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmi4_core::topology::discover;

    #[test]
    fn test_discovery_object_sensor() {
        let dummy = DummyController::new_default();
        let topology = discover(&dummy.transport()).unwrap();
        assert_eq!(topology.max_fingers(), 10);
        assert_eq!(topology.max_x(), 1079);
        assert_eq!(topology.max_y(), 1919);
        assert_eq!(topology.info().product_id, "S3706");
        assert_eq!(topology.firmware_id(), 2_345_678);
        assert_eq!(topology.button_count(), 0);
        assert_eq!(topology.interrupt_mask(), &[0x07]);
    }

    #[test]
    fn test_discovery_legacy_sensor_with_buttons() {
        let dummy = DummyController::new(DummyConfig {
            protocol: TouchProtocol::Legacy,
            bootloader: BootloaderVersion::V6,
            fingers: 5,
            max_x: 1023,
            max_y: 767,
            buttons: 3,
            ..Default::default()
        });
        let topology = discover(&dummy.transport()).unwrap();
        assert_eq!(topology.max_fingers(), 5);
        assert_eq!(topology.max_x(), 1023);
        assert_eq!(topology.max_y(), 767);
        assert_eq!(topology.button_count(), 3);
        assert_eq!(topology.interrupt_mask(), &[0x0F]);
    }

    #[test]
    fn test_status_read_clears_interrupts() {
        let dummy = DummyController::new_default();
        let t = dummy.transport();
        dummy.set_contacts(&[Contact {
            x: 10,
            y: 20,
            width_x: 1,
            width_y: 1,
        }]);
        let data = t.read_vec(reg::F01_DATA as u16, 2).unwrap();
        assert_eq!(data[1] & irq::TOUCH, irq::TOUCH);
        let data = t.read_vec(reg::F01_DATA as u16, 2).unwrap();
        assert_eq!(data[1], 0);
    }

    #[test]
    fn test_configured_bit_clears_unconfigured_status() {
        let dummy = DummyController::new_default();
        let t = dummy.transport();
        assert_eq!(t.read_byte(reg::F01_DATA as u16).unwrap() & 0x80, 0x80);
        t.write_byte(reg::F01_CONTROL as u16, 0x80).unwrap();
        assert_eq!(t.read_byte(reg::F01_DATA as u16).unwrap() & 0x80, 0);
        assert!(dummy.is_configured());
    }

    #[test]
    fn test_attention_fires_on_enabled_sources_only() {
        let dummy = DummyController::new_default();
        let mut attention = dummy.attention();
        assert!(!attention.wait(Duration::from_millis(1)).unwrap());

        dummy.set_contacts(&[]);
        assert!(attention.wait(Duration::from_millis(100)).unwrap());
        assert!(!attention.wait(Duration::from_millis(1)).unwrap());

        dummy.modify(|s| s.int_enable = 0);
        dummy.set_contacts(&[]);
        assert!(!attention.wait(Duration::from_millis(1)).unwrap());
    }

    #[test]
    fn test_reset_restores_unconfigured_state() {
        let dummy = DummyController::new_default();
        let t = dummy.transport();
        t.write_byte(reg::F01_CONTROL as u16, 0x80).unwrap();
        dummy.trigger_reset();
        assert!(!dummy.is_configured());
        assert_eq!(dummy.control(), 0);
        assert_eq!(dummy.interrupt_enable(), 0x07);
    }

    #[test]
    fn test_partition_table_layout() {
        let config = DummyConfig::default();
        let table = config.partition_table();
        assert_eq!(table.entries().len(), 6);
        assert_eq!(config.flash_config_blocks(), 4);
        assert_eq!(table.address(PartitionId::CoreCode), 4 + 4 + 1);
        assert_eq!(table.block_counts().total, 4 + 4 + 1 + 8 + 2 + 1);
    }

    #[test]
    fn test_parse_options() {
        let config = parse_options(&[
            ("protocol", "f11"),
            ("bootloader", "6"),
            ("fingers", "5"),
            ("buttons", "2"),
            ("product", "S7300"),
        ])
        .unwrap();
        assert_eq!(config.protocol, TouchProtocol::Legacy);
        assert_eq!(config.bootloader, BootloaderVersion::V6);
        assert_eq!(config.fingers, 5);
        assert_eq!(config.buttons, 2);
        assert_eq!(config.product_id, "S7300");

        assert!(parse_options(&[("bootloader", "4")]).is_err());
        assert!(parse_options(&[("protocol", "f11"), ("fingers", "7")]).is_err());
        assert!(parse_options(&[("product", "S1234567")]).is_err());
    }
}
