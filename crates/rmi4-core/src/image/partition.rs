//! Flash partition table
//!
//! Partition-table-aware bootloaders describe their flash layout with a
//! table of 8-byte entries following a 2-byte header. The same layout is
//! stored in the flash config partition of an image.

use crate::function::f34::BootloaderVersion;

/// Size of the table header preceding the entries
pub const TABLE_HEADER_LEN: usize = 2;

/// Size of one table entry
pub const ENTRY_LEN: usize = 8;

/// Flash partitions known to the bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PartitionId {
    /// Bootloader code
    Bootloader = 0x01,
    /// Device config (lockdown)
    DeviceConfig = 0x02,
    /// Flash config (the partition table itself)
    FlashConfig = 0x03,
    /// Manufacturing block
    ManufacturingBlock = 0x04,
    /// Guest serialization (permanent config)
    GuestSerialization = 0x05,
    /// Global parameters (bootloader config)
    GlobalParameters = 0x06,
    /// Core code (UI firmware)
    CoreCode = 0x07,
    /// Core config (UI config)
    CoreConfig = 0x08,
    /// Guest code
    GuestCode = 0x09,
    /// Display config
    DisplayConfig = 0x0A,
    /// External touch AFE config
    ExternalTouchAfeConfig = 0x0B,
    /// Utility parameters
    UtilityParameter = 0x0C,
}

impl PartitionId {
    /// Decode a partition id
    pub fn from_u8(id: u8) -> Option<Self> {
        Some(match id {
            0x01 => Self::Bootloader,
            0x02 => Self::DeviceConfig,
            0x03 => Self::FlashConfig,
            0x04 => Self::ManufacturingBlock,
            0x05 => Self::GuestSerialization,
            0x06 => Self::GlobalParameters,
            0x07 => Self::CoreCode,
            0x08 => Self::CoreConfig,
            0x09 => Self::GuestCode,
            0x0A => Self::DisplayConfig,
            0x0B => Self::ExternalTouchAfeConfig,
            0x0C => Self::UtilityParameter,
            _ => return None,
        })
    }

    /// Partition counted in the total block count
    fn counted(self) -> bool {
        !matches!(self, Self::ManufacturingBlock | Self::ExternalTouchAfeConfig)
    }
}

/// One partition table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionEntry {
    /// Raw partition id (low 5 bits)
    pub id: u8,
    /// Length in blocks
    pub length: u16,
    /// Start block
    pub address: u16,
    /// Partition properties
    pub properties: u8,
}

impl PartitionEntry {
    /// Decode an 8-byte entry
    pub fn decode(raw: &[u8; ENTRY_LEN]) -> Self {
        Self {
            id: raw[0] & 0x1F,
            length: u16::from_le_bytes([raw[2], raw[3]]),
            address: u16::from_le_bytes([raw[4], raw[5]]),
            properties: raw[6],
        }
    }

    /// Encode into an 8-byte entry
    pub fn encode(&self) -> [u8; ENTRY_LEN] {
        let [ll, lh] = self.length.to_le_bytes();
        let [al, ah] = self.address.to_le_bytes();
        [self.id & 0x1F, 0, ll, lh, al, ah, self.properties, 0]
    }

    /// Typed partition id
    pub fn partition(&self) -> Option<PartitionId> {
        PartitionId::from_u8(self.id)
    }
}

/// Block counts per flash area
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockCounts {
    /// UI firmware (core code)
    pub ui_firmware: u16,
    /// UI config (core config)
    pub ui_config: u16,
    /// Display config
    pub dp_config: u16,
    /// Permanent config (guest serialization)
    pub pm_config: u16,
    /// Bootloader config (global parameters)
    pub bl_config: u16,
    /// Flash config
    pub fl_config: u16,
    /// Guest code
    pub guest_code: u16,
    /// Lockdown (device config)
    pub lockdown: u16,
    /// Bootloader image
    pub bl_image: u16,
    /// Utility parameters
    pub utility_param: u16,
    /// Sum of all counted partitions
    pub total: u32,
}

/// Decoded partition table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionTable {
    entries: Vec<PartitionEntry>,
}

impl PartitionTable {
    /// Parse `count` entries from a raw table
    ///
    /// Entries that do not fit in `raw` are ignored.
    pub fn parse(raw: &[u8], count: usize) -> Self {
        let entries = raw
            .get(TABLE_HEADER_LEN..)
            .unwrap_or(&[])
            .chunks_exact(ENTRY_LEN)
            .take(count)
            .filter_map(|chunk| chunk.try_into().ok().map(PartitionEntry::decode))
            .collect();
        Self { entries }
    }

    /// Parse every complete entry in a raw table
    pub fn parse_all(raw: &[u8]) -> Self {
        let count = raw.len().saturating_sub(TABLE_HEADER_LEN) / ENTRY_LEN;
        Self::parse(raw, count)
    }

    /// Build a table from entries
    pub fn from_entries(entries: Vec<PartitionEntry>) -> Self {
        Self { entries }
    }

    /// Encode the table with a zero header
    pub fn encode(&self) -> Vec<u8> {
        let mut raw = vec![0u8; TABLE_HEADER_LEN];
        for entry in &self.entries {
            raw.extend_from_slice(&entry.encode());
        }
        raw
    }

    /// Table entries in order
    pub fn entries(&self) -> &[PartitionEntry] {
        &self.entries
    }

    fn find(&self, id: PartitionId) -> Option<&PartitionEntry> {
        self.entries.iter().find(|e| e.partition() == Some(id))
    }

    /// Block count of a partition, 0 when absent
    pub fn blocks(&self, id: PartitionId) -> u16 {
        self.find(id).map_or(0, |e| e.length)
    }

    /// Start block of a partition, 0 when absent
    pub fn address(&self, id: PartitionId) -> u16 {
        self.find(id).map_or(0, |e| e.address)
    }

    /// Per-area block counts
    pub fn block_counts(&self) -> BlockCounts {
        let mut counts = BlockCounts::default();
        for entry in &self.entries {
            let Some(id) = entry.partition() else {
                continue;
            };
            let slot = match id {
                PartitionId::CoreCode => &mut counts.ui_firmware,
                PartitionId::CoreConfig => &mut counts.ui_config,
                PartitionId::Bootloader => &mut counts.bl_image,
                PartitionId::UtilityParameter => &mut counts.utility_param,
                PartitionId::DisplayConfig => &mut counts.dp_config,
                PartitionId::FlashConfig => &mut counts.fl_config,
                PartitionId::GuestCode => &mut counts.guest_code,
                PartitionId::GuestSerialization => &mut counts.pm_config,
                PartitionId::GlobalParameters => &mut counts.bl_config,
                PartitionId::DeviceConfig => &mut counts.lockdown,
                PartitionId::ManufacturingBlock | PartitionId::ExternalTouchAfeConfig => continue,
            };
            *slot = entry.length;
            if id.counted() {
                counts.total += entry.length as u32;
            }
        }
        counts
    }
}

/// Result of comparing the device and image partition tables
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableComparison {
    /// Fixed partitions moved; the image cannot be written
    pub incompatible: bool,
    /// Rewritable partitions moved; the table must be replaced first
    pub new_table: bool,
}

/// Compare partition placement between device and image
pub fn compare_tables(
    device: &PartitionTable,
    image: &PartitionTable,
    version: BootloaderVersion,
    has_disp_config: bool,
    has_guest_code: bool,
) -> TableComparison {
    let moved = |id| device.address(id) != image.address(id);

    let mut incompatible = [
        PartitionId::Bootloader,
        PartitionId::DeviceConfig,
        PartitionId::GlobalParameters,
        PartitionId::UtilityParameter,
    ]
    .into_iter()
    .any(moved);
    if version == BootloaderVersion::V7 && moved(PartitionId::FlashConfig) {
        incompatible = true;
    }

    let new_table = moved(PartitionId::CoreCode)
        || moved(PartitionId::CoreConfig)
        || (has_disp_config && moved(PartitionId::DisplayConfig))
        || (has_guest_code && moved(PartitionId::GuestCode));

    if incompatible {
        log::warn!("rmi4: partition tables are incompatible");
    } else if new_table {
        log::info!("rmi4: image carries a new partition table");
    }

    TableComparison {
        incompatible,
        new_table,
    }
}
