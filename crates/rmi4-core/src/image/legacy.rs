//! Fixed-layout image header (versions 0x05 and 0x06)

use super::{le_u32, ByteRange, ImageFields, Section, IMAGE_HEADER_VERSION_06};
use crate::error::{ImageError, Result};
use crate::function::f01::PRODUCT_ID_SIZE;

/// Start of the image area
pub const IMAGE_AREA_OFFSET: usize = 0x100;

/// Lockdown data sits right before the image area
pub const LOCKDOWN_SIZE: usize = 0x50;

mod offset {
    pub const CHECKSUM: usize = 0x00;
    pub const OPTIONS: usize = 0x06;
    pub const HEADER_VERSION: usize = 0x07;
    pub const FIRMWARE_SIZE: usize = 0x08;
    pub const CONFIG_SIZE: usize = 0x0C;
    pub const PRODUCT_ID: usize = 0x10;
    pub const BOOTLOADER_SIZE: usize = 0x24;
    pub const DSP_CFG_ADDR: usize = 0x40;
    pub const DSP_CFG_SIZE: usize = 0x44;
    pub const FIRMWARE_ID: usize = 0x50;
}

mod option {
    pub const FIRMWARE_ID: u8 = 1 << 0;
    pub const BOOTLOADER: u8 = 1 << 1;
    pub const TDDI: u8 = 1 << 3;
}

pub(super) fn parse(data: &[u8]) -> Result<ImageFields> {
    if data.len() < IMAGE_AREA_OFFSET {
        return Err(ImageError::TooSmall.into());
    }
    let size = data.len();
    let options = data[offset::OPTIONS];
    let header_version = data[offset::HEADER_VERSION];
    let has_bootloader = options & option::BOOTLOADER != 0;
    let tddi = options & option::TDDI != 0;

    let mut fields = ImageFields {
        bl_version: header_version,
        checksum: le_u32(data, offset::CHECKSUM)?,
        ..Default::default()
    };

    let mut firmware_start = IMAGE_AREA_OFFSET as u32;
    // v6 TDDI images keep the firmware at the start of the image area
    if has_bootloader && !(header_version == IMAGE_HEADER_VERSION_06 && tddi) {
        let bl_size = le_u32(data, offset::BOOTLOADER_SIZE)?;
        fields.set(
            Section::BootloaderImage,
            ByteRange::checked(IMAGE_AREA_OFFSET as u32, bl_size, size)?,
        );
        firmware_start += bl_size;
    }

    let firmware = ByteRange::checked(firmware_start, le_u32(data, offset::FIRMWARE_SIZE)?, size)?;
    if !firmware.is_empty() {
        fields.set(Section::UiFirmware, firmware);
    }

    let config = ByteRange::checked(firmware.end(), le_u32(data, offset::CONFIG_SIZE)?, size)?;
    if !config.is_empty() {
        fields.set(Section::UiConfig, config);
    }

    if has_bootloader || tddi {
        let addr = le_u32(data, offset::DSP_CFG_ADDR)?;
        let len = le_u32(data, offset::DSP_CFG_SIZE)?;
        if len > 0 {
            fields.set(Section::DisplayConfig, ByteRange::checked(addr, len, size)?);
        }
    }

    if options & option::FIRMWARE_ID != 0 {
        fields.firmware_id = Some(le_u32(data, offset::FIRMWARE_ID)?);
    }

    let id = &data[offset::PRODUCT_ID..offset::PRODUCT_ID + PRODUCT_ID_SIZE];
    let end = id.iter().position(|&b| b == 0).unwrap_or(id.len());
    fields.product_id = String::from_utf8_lossy(&id[..end]).into_owned();

    fields.set(
        Section::Lockdown,
        ByteRange::checked(
            (IMAGE_AREA_OFFSET - LOCKDOWN_SIZE) as u32,
            LOCKDOWN_SIZE as u32,
            size,
        )?,
    );

    log::debug!(
        "rmi4: legacy image v{}, firmware {} bytes, config {} bytes",
        header_version,
        firmware.len,
        config.len
    );
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::FirmwareImage;

    #[test]
    fn test_bootloader_shifts_firmware() {
        let mut data = crate::image::tests::legacy_image(0, 0);
        data[offset::OPTIONS] = option::BOOTLOADER;
        data[offset::BOOTLOADER_SIZE..offset::BOOTLOADER_SIZE + 4]
            .copy_from_slice(&16u32.to_le_bytes());
        data[offset::FIRMWARE_SIZE..offset::FIRMWARE_SIZE + 4]
            .copy_from_slice(&16u32.to_le_bytes());
        // display config after the UI config
        data[offset::DSP_CFG_ADDR..offset::DSP_CFG_ADDR + 4]
            .copy_from_slice(&0x120u32.to_le_bytes());
        data[offset::DSP_CFG_SIZE..offset::DSP_CFG_SIZE + 4]
            .copy_from_slice(&16u32.to_le_bytes());
        data[offset::CONFIG_SIZE..offset::CONFIG_SIZE + 4]
            .copy_from_slice(&0u32.to_le_bytes());

        let image = FirmwareImage::parse(data).unwrap();
        assert_eq!(
            image.range(Section::UiFirmware),
            Some(ByteRange { offset: 0x110, len: 16 })
        );
        assert_eq!(
            image.range(Section::DisplayConfig),
            Some(ByteRange { offset: 0x120, len: 16 })
        );
        assert_eq!(image.firmware_id(), None);
        assert_eq!(
            image.range(Section::Lockdown),
            Some(ByteRange { offset: 0xB0, len: 0x50 })
        );
    }

    #[test]
    fn test_tddi_bootloader_keeps_firmware_at_image_area() {
        let mut data = crate::image::tests::legacy_image(0, 0);
        data[offset::OPTIONS] = option::BOOTLOADER | option::TDDI;
        data[offset::BOOTLOADER_SIZE..offset::BOOTLOADER_SIZE + 4]
            .copy_from_slice(&16u32.to_le_bytes());

        let image = FirmwareImage::parse(data).unwrap();
        assert_eq!(
            image.range(Section::UiFirmware),
            Some(ByteRange { offset: 0x100, len: 32 })
        );
        assert_eq!(
            image.range(Section::UiConfig),
            Some(ByteRange { offset: 0x120, len: 16 })
        );
        assert_eq!(image.range(Section::BootloaderImage), None);
        assert_eq!(image.range(Section::DisplayConfig), None);
    }

    #[test]
    fn test_display_config_overlapping_firmware_rejected() {
        let mut data = crate::image::tests::legacy_image(0, 0);
        data[offset::OPTIONS] = option::TDDI;
        data[offset::DSP_CFG_ADDR..offset::DSP_CFG_ADDR + 4]
            .copy_from_slice(&0x108u32.to_le_bytes());
        data[offset::DSP_CFG_SIZE..offset::DSP_CFG_SIZE + 4]
            .copy_from_slice(&8u32.to_le_bytes());
        assert_eq!(
            FirmwareImage::parse(data),
            Err(ImageError::Overlap.into())
        );
    }
}
