//! Container image format (header version 0x10)
//!
//! The header points at a top-level container whose content is a table of
//! 4-byte pointers to the child container descriptors. The bootloader and
//! utility containers hold nested pointer tables of their own.

use super::{le_u32, ByteRange, ImageFields, Section};
use crate::error::{ImageError, Result};

/// Size of a container descriptor
pub const DESCRIPTOR_LEN: usize = 0x20;

/// Largest number of utility parameter blocks recorded
pub const MAX_UTILITY_PARAMS: usize = 3;

mod header {
    pub const CHECKSUM: usize = 0x00;
    pub const TOP_LEVEL_CONTAINER: usize = 0x0C;
    pub const LEN: usize = 0x10;
}

mod descriptor {
    pub const CONTAINER_ID: usize = 0x04;
    pub const CONTENT_LENGTH: usize = 0x18;
    pub const CONTENT_ADDRESS: usize = 0x1C;
}

/// Container ids
#[allow(missing_docs)]
pub mod id {
    pub const UI: u16 = 1;
    pub const UI_CONFIG: u16 = 2;
    pub const BL: u16 = 3;
    pub const BL_IMAGE: u16 = 4;
    pub const BL_CONFIG: u16 = 5;
    pub const BL_LOCKDOWN_INFO: u16 = 6;
    pub const PERMANENT_CONFIG: u16 = 7;
    pub const GUEST_CODE: u16 = 8;
    pub const GENERAL_INFORMATION: u16 = 13;
    pub const DEVICE_CONFIG: u16 = 14;
    pub const FLASH_CONFIG: u16 = 15;
    pub const GUEST_SERIALIZATION: u16 = 16;
    pub const GLOBAL_PARAMETERS: u16 = 17;
    pub const CORE_CODE: u16 = 18;
    pub const CORE_CONFIG: u16 = 19;
    pub const DISPLAY_CONFIG: u16 = 20;
    pub const UTILITY: u16 = 22;
    pub const UTILITY_PARAMETER: u16 = 23;
}

/// A decoded container descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Descriptor {
    id: u16,
    content: ByteRange,
}

impl Descriptor {
    fn read(data: &[u8], addr: u32) -> Result<Self> {
        let base = addr as usize;
        ByteRange::checked(addr, DESCRIPTOR_LEN as u32, data.len())?;
        let id = u16::from_le_bytes([
            data[base + descriptor::CONTAINER_ID],
            data[base + descriptor::CONTAINER_ID + 1],
        ]);
        let len = le_u32(data, base + descriptor::CONTENT_LENGTH)?;
        let offset = le_u32(data, base + descriptor::CONTENT_ADDRESS)?;
        Ok(Self {
            id,
            content: ByteRange::checked(offset, len, data.len())?,
        })
    }

    /// Descriptor addresses held in a pointer table
    fn children(data: &[u8], table: ByteRange, skip: usize) -> Result<Vec<u32>> {
        let count = table.len as usize / 4;
        (skip..count)
            .map(|i| le_u32(data, table.offset as usize + i * 4))
            .collect()
    }
}

pub(super) fn parse(data: &[u8]) -> Result<ImageFields> {
    if data.len() < header::LEN {
        return Err(ImageError::TooSmall.into());
    }
    let mut fields = ImageFields {
        checksum: le_u32(data, header::CHECKSUM)?,
        ..Default::default()
    };

    let top = Descriptor::read(data, le_u32(data, header::TOP_LEVEL_CONTAINER)?)?;
    for addr in Descriptor::children(data, top.content, 0)? {
        let child = Descriptor::read(data, addr)?;
        let content = child.content;
        log::trace!(
            "rmi4: container {} at 0x{:08X}+0x{:X}",
            child.id,
            content.offset,
            content.len
        );
        match child.id {
            id::UI | id::CORE_CODE => fields.set(Section::UiFirmware, content),
            id::UI_CONFIG | id::CORE_CONFIG => fields.set(Section::UiConfig, content),
            id::BL => {
                fields.bl_version = *data
                    .get(content.offset as usize)
                    .ok_or(ImageError::OutOfBounds {
                        offset: content.offset,
                        len: 1,
                    })?;
                parse_bootloader(data, content, &mut fields)?;
            }
            id::UTILITY => parse_utility(data, content, &mut fields)?,
            id::GUEST_CODE => fields.set(Section::GuestCode, content),
            id::DISPLAY_CONFIG => fields.set(Section::DisplayConfig, content),
            id::PERMANENT_CONFIG | id::GUEST_SERIALIZATION => {
                fields.set(Section::PermanentConfig, content)
            }
            id::FLASH_CONFIG => fields.set(Section::FlashConfig, content),
            id::GENERAL_INFORMATION => {
                fields.firmware_id = Some(le_u32(data, content.offset as usize + 4)?);
            }
            _ => {}
        }
    }
    Ok(fields)
}

/// Bootloader container: version byte, then a pointer table
fn parse_bootloader(data: &[u8], content: ByteRange, fields: &mut ImageFields) -> Result<()> {
    for addr in Descriptor::children(data, content, 1)? {
        let child = Descriptor::read(data, addr)?;
        match child.id {
            id::BL_IMAGE => fields.set(Section::BootloaderImage, child.content),
            id::BL_CONFIG | id::GLOBAL_PARAMETERS => {
                fields.set(Section::BootloaderConfig, child.content)
            }
            id::BL_LOCKDOWN_INFO | id::DEVICE_CONFIG => fields.set(Section::Lockdown, child.content),
            _ => {}
        }
    }
    Ok(())
}

/// Utility container: a pointer table of utility parameter containers
fn parse_utility(data: &[u8], content: ByteRange, fields: &mut ImageFields) -> Result<()> {
    let children = Descriptor::children(data, content, 0)?;
    for addr in children.into_iter().take(MAX_UTILITY_PARAMS) {
        let child = Descriptor::read(data, addr)?;
        if child.id != id::UTILITY_PARAMETER || child.content.is_empty() {
            continue;
        }
        let param_id = data[child.content.offset as usize];
        fields.set(Section::UtilityParameter(param_id), child.content);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::partition::{PartitionEntry, PartitionId, PartitionTable};
    use crate::image::{FirmwareImage, ImageFormat};

    /// Minimal container image writer
    struct Builder {
        data: Vec<u8>,
    }

    impl Builder {
        fn new() -> Self {
            let mut data = vec![0u8; 0x20];
            data[7] = 0x10;
            data[0..4].copy_from_slice(&0x1234_5678u32.to_le_bytes());
            Self { data }
        }

        fn blob(&mut self, bytes: &[u8]) -> u32 {
            let at = self.data.len() as u32;
            self.data.extend_from_slice(bytes);
            at
        }

        fn container(&mut self, id: u16, content: &[u8]) -> u32 {
            let content_at = self.blob(content);
            let mut desc = [0u8; DESCRIPTOR_LEN];
            desc[4..6].copy_from_slice(&id.to_le_bytes());
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

    fn table() -> Vec<u8> {
        PartitionTable::from_entries(vec![
            PartitionEntry {
                id: PartitionId::CoreCode as u8,
                length: 2,
                address: 4,
                properties: 0,
            },
            PartitionEntry {
                id: PartitionId::CoreConfig as u8,
                length: 1,
                address: 6,
                properties: 0,
            },
        ])
        .encode()
    }

    fn v7_image(with_flash_config: bool) -> Vec<u8> {
        let mut b = Builder::new();
        let code = b.container(id::CORE_CODE, &[0xAA; 32]);
        let config = b.container(id::CORE_CONFIG, &[0xBB; 16]);
        let gp = b.container(id::GLOBAL_PARAMETERS, &[0xCC; 16]);
        let mut bl = vec![7, 0, 0, 0];
        bl.extend(Builder::pointers(&[gp]));
        let bl = b.container(id::BL, &bl);
        let mut info = vec![0u8; 8];
        info[4..8].copy_from_slice(&4321u32.to_le_bytes());
        let info = b.container(id::GENERAL_INFORMATION, &info);
        let upp = b.container(id::UTILITY_PARAMETER, &[0x05, 1, 2, 3]);
        let util = b.container(id::UTILITY, &Builder::pointers(&[upp]));
        let mut children = vec![code, config, bl, info, util];
        if with_flash_config {
            let t = table();
            children.push(b.container(id::FLASH_CONFIG, &t));
        }
        b.finish(&children)
    }

    #[test]
    fn test_container_sections() {
        let image = FirmwareImage::parse(v7_image(true)).unwrap();
        assert_eq!(image.format(), ImageFormat::Container);
        assert_eq!(image.checksum(), 0x1234_5678);
        assert_eq!(image.bl_version(), 7);
        assert_eq!(image.firmware_id(), Some(4321));
        assert_eq!(image.section(Section::UiFirmware), Some(&[0xAA; 32][..]));
        assert_eq!(image.section(Section::UiConfig), Some(&[0xBB; 16][..]));
        assert_eq!(image.section(Section::BootloaderConfig), Some(&[0xCC; 16][..]));
        assert_eq!(
            image.section(Section::UtilityParameter(5)),
            Some(&[0x05, 1, 2, 3][..])
        );

        let counts = image.block_counts();
        assert_eq!(counts.ui_firmware, 2);
        assert_eq!(counts.ui_config, 1);
        assert_eq!(counts.total, 3);
    }

    #[test]
    fn test_missing_flash_config_rejected() {
        assert_eq!(
            FirmwareImage::parse(v7_image(false)),
            Err(ImageError::MissingContainer(id::FLASH_CONFIG).into())
        );
    }

    #[test]
    fn test_dangling_pointer_rejected() {
        let mut b = Builder::new();
        let data = {
            let code = b.container(id::CORE_CODE, &[0; 4]);
            b.finish(&[code, 0xFFFF_0000])
        };
        assert!(matches!(
            FirmwareImage::parse(data),
            Err(crate::Error::Image(ImageError::OutOfBounds { .. }))
        ));
    }
}
