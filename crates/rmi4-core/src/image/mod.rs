//! Firmware image parsing
//!
//! Three image formats are in circulation:
//!
//! - header version 0x05 and 0x06: a fixed header followed by the image
//!   area at 0x100, used with the legacy bootloaders
//! - header version 0x10: a tree of id-tagged containers, used with the
//!   partition table bootloaders
//!
//! Parsing never copies payload bytes. Every section is recorded as a
//! [`ByteRange`] into the image buffer, validated against its bounds and
//! checked for overlap with every other section.

pub mod container;
mod legacy;
pub mod partition;

use std::fmt;
use std::path::Path;

use crate::error::{ImageError, Result};
use partition::{BlockCounts, PartitionTable};

/// Offset of the major header version byte, shared by all formats
pub const HEADER_VERSION_OFFSET: usize = 7;

/// Legacy header, bootloader v5
pub const IMAGE_HEADER_VERSION_05: u8 = 0x05;
/// Legacy header, bootloader v6
pub const IMAGE_HEADER_VERSION_06: u8 = 0x06;
/// Container header
pub const IMAGE_HEADER_VERSION_10: u8 = 0x10;

/// A byte range inside the image buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteRange {
    /// Start offset
    pub offset: u32,
    /// Length in bytes
    pub len: u32,
}

impl ByteRange {
    /// Validate a range against a buffer of `size` bytes
    pub fn checked(offset: u32, len: u32, size: usize) -> Result<Self> {
        let end = offset as u64 + len as u64;
        if end > size as u64 {
            return Err(ImageError::OutOfBounds { offset, len }.into());
        }
        Ok(Self { offset, len })
    }

    /// Exclusive end offset
    pub fn end(&self) -> u32 {
        self.offset + self.len
    }

    /// True for a zero-length range
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when the two ranges share at least one byte
    pub fn overlaps(&self, other: &ByteRange) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.offset < other.end()
            && other.offset < self.end()
    }
}

/// Typed sections of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    /// UI firmware (core code)
    UiFirmware,
    /// UI configuration (core config)
    UiConfig,
    /// Display configuration
    DisplayConfig,
    /// Permanent configuration (guest serialization)
    PermanentConfig,
    /// Flash configuration (partition table)
    FlashConfig,
    /// Guest code
    GuestCode,
    /// Bootloader code
    BootloaderImage,
    /// Bootloader configuration (global parameters)
    BootloaderConfig,
    /// Lockdown data (device config)
    Lockdown,
    /// Utility parameter block
    UtilityParameter(u8),
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UiFirmware => write!(f, "ui-firmware"),
            Self::UiConfig => write!(f, "ui-config"),
            Self::DisplayConfig => write!(f, "display-config"),
            Self::PermanentConfig => write!(f, "permanent-config"),
            Self::FlashConfig => write!(f, "flash-config"),
            Self::GuestCode => write!(f, "guest-code"),
            Self::BootloaderImage => write!(f, "bootloader"),
            Self::BootloaderConfig => write!(f, "bootloader-config"),
            Self::Lockdown => write!(f, "lockdown"),
            Self::UtilityParameter(id) => write!(f, "utility-param-{}", id),
        }
    }
}

/// Format family of a parsed image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// Fixed header, version 0x05 or 0x06
    Legacy(u8),
    /// Container tree, version 0x10
    Container,
}

/// Parsed firmware image
///
/// Owns the image buffer; sections are ranges into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
    format: ImageFormat,
    bl_version: u8,
    checksum: u32,
    firmware_id: Option<u32>,
    product_id: String,
    sections: Vec<(Section, ByteRange)>,
    partition_table: Option<PartitionTable>,
}

/// Fields collected by a format parser
#[derive(Debug, Default)]
pub(crate) struct ImageFields {
    pub bl_version: u8,
    pub checksum: u32,
    pub firmware_id: Option<u32>,
    pub product_id: String,
    pub sections: Vec<(Section, ByteRange)>,
}

impl ImageFields {
    /// Record a section, replacing an earlier one of the same kind
    pub fn set(&mut self, section: Section, range: ByteRange) {
        self.sections.retain(|(s, _)| *s != section);
        self.sections.push((section, range));
    }
}

/// Read a little-endian u32 at `offset`
pub(crate) fn le_u32(data: &[u8], offset: usize) -> Result<u32> {
    data.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| {
            ImageError::OutOfBounds {
                offset: offset as u32,
                len: 4,
            }
            .into()
        })
}

/// Partition-table-aware bootloader generations
fn uses_partition_table(bl_version: u8) -> bool {
    matches!(bl_version, 7 | 8)
}

impl FirmwareImage {
    /// Parse an image buffer
    ///
    /// Fails closed: on any error no partial image is returned.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let version = *data
            .get(HEADER_VERSION_OFFSET)
            .ok_or(ImageError::TooSmall)?;

        let (format, fields) = match version {
            IMAGE_HEADER_VERSION_05 | IMAGE_HEADER_VERSION_06 => {
                (ImageFormat::Legacy(version), legacy::parse(&data)?)
            }
            IMAGE_HEADER_VERSION_10 => (ImageFormat::Container, container::parse(&data)?),
            other => {
                log::error!("rmi4: unsupported image file format (0x{:02X})", other);
                return Err(ImageError::UnsupportedVersion(other).into());
            }
        };

        for (i, (a, ra)) in fields.sections.iter().enumerate() {
            for (b, rb) in &fields.sections[i + 1..] {
                if ra.overlaps(rb) {
                    log::error!("rmi4: image sections {} and {} overlap", a, b);
                    return Err(ImageError::Overlap.into());
                }
            }
        }

        let mut image = Self {
            data,
            format,
            bl_version: fields.bl_version,
            checksum: fields.checksum,
            firmware_id: fields.firmware_id,
            product_id: fields.product_id,
            sections: fields.sections,
            partition_table: None,
        };

        if uses_partition_table(image.bl_version) {
            let raw = image
                .section(Section::FlashConfig)
                .ok_or(ImageError::MissingContainer(container::id::FLASH_CONFIG))?;
            image.partition_table = Some(PartitionTable::parse_all(raw));
        }

        log::debug!(
            "rmi4: image {:?}, bootloader v{}, checksum 0x{:08X}",
            image.format,
            image.bl_version,
            image.checksum
        );
        Ok(image)
    }

    /// Read and parse an image file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| {
            log::error!("rmi4: cannot read image {}: {}", path.display(), e);
            ImageError::Unreadable
        })?;
        Self::parse(data)
    }

    /// Whole image buffer
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Format family
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Bootloader generation the image is built for
    pub fn bl_version(&self) -> u8 {
        self.bl_version
    }

    /// Checksum from the header
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Firmware id declared by the image
    pub fn firmware_id(&self) -> Option<u32> {
        self.firmware_id
    }

    /// Product id declared by a legacy header
    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    /// All recorded sections
    pub fn sections(&self) -> &[(Section, ByteRange)] {
        &self.sections
    }

    /// Range of a section
    pub fn range(&self, section: Section) -> Option<ByteRange> {
        self.sections
            .iter()
            .find(|(s, _)| *s == section)
            .map(|(_, r)| *r)
    }

    /// Bytes of a section
    pub fn section(&self, section: Section) -> Option<&[u8]> {
        let r = self.range(section)?;
        self.data.get(r.offset as usize..r.end() as usize)
    }

    /// Bytes of a section, empty when absent
    pub fn section_or_empty(&self, section: Section) -> &[u8] {
        self.section(section).unwrap_or(&[])
    }

    /// Whether a non-empty section is present
    pub fn contains(&self, section: Section) -> bool {
        self.range(section).is_some_and(|r| !r.is_empty())
    }

    /// Partition table carried in the flash config
    pub fn partition_table(&self) -> Option<&PartitionTable> {
        self.partition_table.as_ref()
    }

    /// Block counts required by the image's partition table
    pub fn block_counts(&self) -> BlockCounts {
        self.partition_table
            .as_ref()
            .map(PartitionTable::block_counts)
            .unwrap_or_default()
    }

    /// Leading bytes of the UI config, compared against the device config id
    pub fn config_id(&self, len: usize) -> &[u8] {
        let config = self.section_or_empty(Section::UiConfig);
        &config[..len.min(config.len())]
    }
}
