//! Firmware images matching a simulated controller
//!
//! [`ImageBuilder`] produces a legacy image for v5 and v6 bootloaders and
//! a container image for v7 and v8, sized to the flash layout of a
//! [`DummyConfig`].

use rmi4_core::error::Result;
use rmi4_core::function::f34::{BootloaderVersion, Dialect};
use rmi4_core::image::container::{id, DESCRIPTOR_LEN};
use rmi4_core::image::partition::PartitionTable;
use rmi4_core::image::{FirmwareImage, IMAGE_HEADER_VERSION_10};

use crate::DummyConfig;

const CHECKSUM: u32 = 0x5EED_CAFE;

/// Builds image files for a simulated controller
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    config: DummyConfig,
    firmware_id: Option<u32>,
    config_id: Vec<u8>,
    fill: u8,
    partition_table: Option<PartitionTable>,
}

impl ImageBuilder {
    /// Image with the controller's layout, firmware id and config id
    pub fn new(config: &DummyConfig) -> Self {
        Self {
            config: config.clone(),
            firmware_id: Some(config.firmware_id),
            config_id: config.config_id.clone(),
            fill: 0x3C,
            partition_table: None,
        }
    }

    /// Declare a firmware id
    pub fn firmware_id(mut self, id: u32) -> Self {
        self.firmware_id = Some(id);
        self
    }

    /// Leave the firmware id out of the image
    pub fn without_firmware_id(mut self) -> Self {
        self.firmware_id = None;
        self
    }

    /// Leading bytes of the UI config
    pub fn config_id(mut self, config_id: &[u8]) -> Self {
        self.config_id = config_id.to_vec();
        self
    }

    /// Byte used for firmware and config payloads
    pub fn fill(mut self, byte: u8) -> Self {
        self.fill = byte;
        self
    }

    /// Carry a partition table other than the controller's
    pub fn partition_table(mut self, table: PartitionTable) -> Self {
        self.partition_table = Some(table);
        self
    }

    fn bytes(&self, blocks: u16) -> usize {
        blocks as usize * self.config.block_size as usize
    }

    /// UI firmware payload
    pub fn firmware(&self) -> Vec<u8> {
        vec![self.fill; self.bytes(self.config.firmware_blocks)]
    }

    /// UI config payload, starting with the config id
    pub fn ui_config(&self) -> Vec<u8> {
        let mut config = vec![self.fill; self.bytes(self.config.config_blocks)];
        let len = self.config_id.len().min(config.len());
        config[..len].copy_from_slice(&self.config_id[..len]);
        config
    }

    /// Display config payload
    pub fn display_config(&self) -> Vec<u8> {
        vec![self.fill ^ 0xFF; self.bytes(self.config.display_config_blocks)]
    }

    /// Raw image bytes
    pub fn build(&self) -> Vec<u8> {
        match self.config.bootloader.dialect() {
            Dialect::Legacy => self.build_legacy(),
            Dialect::Partitioned => self.build_container(),
        }
    }

    /// Parsed image
    pub fn image(&self) -> Result<FirmwareImage> {
        FirmwareImage::parse(self.build())
    }

    fn build_legacy(&self) -> Vec<u8> {
        let firmware = self.firmware();
        let config = self.ui_config();
        let display = self.display_config();

        let mut data = vec![0u8; 0x100];
        data[0..4].copy_from_slice(&CHECKSUM.to_le_bytes());
        data[7] = match self.config.bootloader {
            BootloaderVersion::V5 => 0x05,
            _ => 0x06,
        };
        data[8..12].copy_from_slice(&(firmware.len() as u32).to_le_bytes());
        data[12..16].copy_from_slice(&(config.len() as u32).to_le_bytes());
        let id = self.config.product_id.as_bytes();
        let len = id.len().min(10);
        data[0x10..0x10 + len].copy_from_slice(&id[..len]);

        if let Some(fw_id) = self.firmware_id {
            data[6] |= 0x01;
            data[0x50..0x54].copy_from_slice(&fw_id.to_le_bytes());
        }
        if !display.is_empty() {
            // display config follows the UI config
            let addr = 0x100 + firmware.len() + config.len();
            data[6] |= 0x08;
            data[0x40..0x44].copy_from_slice(&(addr as u32).to_le_bytes());
            data[0x44..0x48].copy_from_slice(&(display.len() as u32).to_le_bytes());
        }

        data.extend(firmware);
        data.extend(config);
        data.extend(display);
        data
    }

    fn build_container(&self) -> Vec<u8> {
        let mut w = ContainerWriter::new();
        let mut children = vec![
            w.container(id::CORE_CODE, &self.firmware()),
            w.container(id::CORE_CONFIG, &self.ui_config()),
        ];
        if self.config.display_config_blocks > 0 {
            children.push(w.container(id::DISPLAY_CONFIG, &self.display_config()));
        }
        if self.config.guest_code_blocks > 0 {
            let guest = vec![self.fill; self.bytes(self.config.guest_code_blocks)];
            children.push(w.container(id::GUEST_CODE, &guest));
        }

        let table = self
            .partition_table
            .clone()
            .unwrap_or_else(|| self.config.partition_table());
        let mut flash_config = table.encode();
        flash_config.resize(self.bytes(self.config.flash_config_blocks()), 0xFF);
        children.push(w.container(id::FLASH_CONFIG, &flash_config));

        let global = vec![0x11; self.bytes(self.config.global_parameter_blocks)];
        let global = w.container(id::GLOBAL_PARAMETERS, &global);
        let mut bl = vec![self.config.bootloader.number(), 0, 0, 0];
        bl.extend(ContainerWriter::pointers(&[global]));
        children.push(w.container(id::BL, &bl));

        if let Some(fw_id) = self.firmware_id {
            let mut info = vec![0u8; 8];
            info[4..8].copy_from_slice(&fw_id.to_le_bytes());
            children.push(w.container(id::GENERAL_INFORMATION, &info));
        }
        w.finish(&children)
    }
}

/// Appends containers to an image buffer
struct ContainerWriter {
    data: Vec<u8>,
}

impl ContainerWriter {
    fn new() -> Self {
        let mut data = vec![0u8; 0x20];
        data[0..4].copy_from_slice(&CHECKSUM.to_le_bytes());
        data[7] = IMAGE_HEADER_VERSION_10;
        Self { data }
    }

    fn blob(&mut self, bytes: &[u8]) -> u32 {
        let at = self.data.len() as u32;
        self.data.extend_from_slice(bytes);
        at
    }

    /// Write content and its descriptor; returns the descriptor address
    fn container(&mut self, container_id: u16, content: &[u8]) -> u32 {
        let content_at = self.blob(content);
        let mut desc = [0u8; DESCRIPTOR_LEN];
        desc[4..6].copy_from_slice(&container_id.to_le_bytes());
        desc[0x18..0x1C].copy_from_slice(&(content.len() as u32).to_le_bytes());
        desc[0x1C..0x20].copy_from_slice(&content_at.to_le_bytes());
        self.blob(&desc)
    }

    fn pointers(addrs: &[u32]) -> Vec<u8> {
        addrs.iter().flat_map(|a| a.to_le_bytes()).collect()
    }

    fn finish(mut self, children: &[u32]) -> Vec<u8> {
        let top = self.container(0, &Self::pointers(children));
        self.data[0x0C..0x10].copy_from_slice(&top.to_le_bytes());
        self.data
    }
}
