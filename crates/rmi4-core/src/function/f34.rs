//! F34: flash memory management
//!
//! Register maps of the two bootloader families. Versions 5 and 6 expose
//! fixed block count registers and a block number register. Versions 7
//! and 8 describe the flash with a partition table and address every
//! operation through a partition id register.

use std::fmt;

use bitflags::bitflags;

use crate::error::{ProtocolError, Result};
use crate::image::partition::{BlockCounts, PartitionTable};
use crate::pdt::BaseAddresses;
use crate::transport::RmiTransport;

/// Config id length on partition table bootloaders
pub const V7_CONFIG_ID_SIZE: usize = 32;

/// Config id length on legacy bootloaders
pub const V5V6_CONFIG_ID_SIZE: usize = 4;

/// Size of query registers 1-7 on partition table bootloaders
pub const V7_QUERY_1_7_LEN: usize = 21;

/// Partition support bitmap at the end of query 1-7
const V7_PARTITION_SUPPORT_BYTES: usize = 4;

/// Flash status reported when the partition table is unusable (v8)
pub const STATUS_BAD_PARTITION_TABLE: u8 = 0x0F;

/// Bootloader generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootloaderVersion {
    /// Legacy, status in the command register
    V5,
    /// Legacy, separate status register
    V6,
    /// Partition table
    V7,
    /// Partition table, reported through the v7 query
    V8,
}

/// Command encoding family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// One command register, block number addressing (v5, v6)
    Legacy,
    /// Partition id addressing with batched transfers (v7, v8)
    Partitioned,
}

impl BootloaderVersion {
    /// Map the F34 function version from the descriptor table
    pub fn from_function_version(version: u8) -> Result<Self> {
        match version {
            0 => Ok(Self::V5),
            1 => Ok(Self::V6),
            2 => Ok(Self::V7),
            other => {
                log::error!("rmi4: unrecognized F34 function version {}", other);
                Err(ProtocolError::UnsupportedBootloader(other).into())
            }
        }
    }

    /// Generation number as written in images
    pub fn number(self) -> u8 {
        match self {
            Self::V5 => 5,
            Self::V6 => 6,
            Self::V7 => 7,
            Self::V8 => 8,
        }
    }

    /// Command dialect
    pub fn dialect(self) -> Dialect {
        match self {
            Self::V5 | Self::V6 => Dialect::Legacy,
            Self::V7 | Self::V8 => Dialect::Partitioned,
        }
    }

    /// Length of the device config id
    pub fn config_id_len(self) -> usize {
        match self.dialect() {
            Dialect::Legacy => V5V6_CONFIG_ID_SIZE,
            Dialect::Partitioned => V7_CONFIG_ID_SIZE,
        }
    }
}

impl fmt::Display for BootloaderVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.number())
    }
}

/// Data register offsets relative to the F34 data base
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataOffsets {
    /// Flash status
    pub flash_status: u16,
    /// Partition id (partition table bootloaders)
    pub partition_id: u16,
    /// Block number
    pub block_number: u16,
    /// Transfer length in blocks (partition table bootloaders)
    pub transfer_length: u16,
    /// Flash command
    pub flash_cmd: u16,
    /// Block data / payload
    pub payload: u16,
}

impl DataOffsets {
    /// Layout of v7 and v8
    pub const fn partitioned() -> Self {
        Self {
            flash_status: 0,
            partition_id: 1,
            block_number: 2,
            transfer_length: 3,
            flash_cmd: 4,
            payload: 5,
        }
    }

    /// Layout of v5; command and status share the register after the block data
    pub const fn v5(block_size: u16) -> Self {
        Self {
            flash_status: 2 + block_size,
            partition_id: 0,
            block_number: 0,
            transfer_length: 0,
            flash_cmd: 2 + block_size,
            payload: 2,
        }
    }

    /// Layout of v6
    pub const fn v6() -> Self {
        Self {
            flash_status: 3,
            partition_id: 0,
            block_number: 0,
            transfer_length: 0,
            flash_cmd: 2,
            payload: 1,
        }
    }
}

/// Query register offsets of the legacy bootloaders
#[derive(Debug, Clone, Copy)]
struct LegacyQueryOffsets {
    properties: u16,
    properties_2: Option<u16>,
    block_size: u16,
    block_count: u16,
}

impl LegacyQueryOffsets {
    fn for_version(version: BootloaderVersion) -> Self {
        match version {
            BootloaderVersion::V5 => Self {
                properties: 2,
                properties_2: None,
                block_size: 3,
                block_count: 5,
            },
            _ => Self {
                properties: 1,
                properties_2: Some(4),
                block_size: 2,
                block_count: 3,
            },
        }
    }
}

bitflags! {
    /// Flash properties query of the legacy bootloaders
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FlashProperties: u8 {
        const REGMAP          = 1 << 0;
        const UNLOCKED        = 1 << 1;
        const HAS_CONFIG_ID   = 1 << 2;
        const HAS_PM_CONFIG   = 1 << 3;
        const HAS_BL_CONFIG   = 1 << 4;
        const HAS_DISP_CONFIG = 1 << 5;
        const HAS_CTRL1       = 1 << 6;
        const HAS_QUERY4      = 1 << 7;
    }
}

/// Decoded flash status and command registers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlashStatus {
    /// Device runs its bootloader
    pub in_bootloader: bool,
    /// Status code, 0 when the last command succeeded
    pub status: u8,
    /// Command still pending, 0 when idle
    pub command: u8,
}

impl FlashStatus {
    /// Decode the raw registers for a bootloader generation
    pub fn decode(version: BootloaderVersion, status: u8, command: u8) -> Self {
        let in_bootloader = status & 0x80 != 0;
        let (status, command) = match version {
            BootloaderVersion::V5 => ((status >> 4) & 0x07, command & 0x0F),
            BootloaderVersion::V6 => (status & 0x07, command & 0x3F),
            BootloaderVersion::V7 | BootloaderVersion::V8 => {
                let code = status & 0x1F;
                if code != 0 {
                    log::warn!("rmi4: flash status 0x{:02X}, command 0x{:02X}", code, command);
                }
                // 0x08 is reported while a v7 device is idle in its bootloader
                (if code == 0x08 { 0 } else { code }, command)
            }
        };
        Self {
            in_bootloader,
            status,
            command,
        }
    }

    /// Command finished without error
    pub fn is_idle(&self) -> bool {
        self.command == 0 && self.status == 0
    }
}

/// Fields of query 1-7 on partition table bootloaders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionedQuery {
    /// Bootloader id (minor, major)
    pub bootloader_id: [u8; 2],
    /// Block size in bytes
    pub block_size: u16,
    /// Length of the flash config in blocks
    pub flash_config_length: u16,
    /// Largest number of blocks per transfer
    pub payload_length: u16,
    /// Number of supported partitions
    pub partition_count: usize,
}

impl PartitionedQuery {
    /// Decode query 1-7
    pub fn decode(raw: &[u8; V7_QUERY_1_7_LEN]) -> Self {
        let word = |i: usize| u16::from_le_bytes([raw[i], raw[i + 1]]);
        let support = &raw[V7_QUERY_1_7_LEN - V7_PARTITION_SUPPORT_BYTES..];
        Self {
            bootloader_id: [raw[0], raw[1]],
            block_size: word(7),
            flash_config_length: word(13),
            payload_length: word(15),
            partition_count: support.iter().map(|b| b.count_ones() as usize).sum(),
        }
    }

    /// Size of the partition table read back from the device
    pub fn table_bytes(&self) -> usize {
        self.partition_count * 8 + 2
    }
}

/// Everything the flash engine needs to know about the device's flash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashGeometry {
    /// Bootloader generation
    pub version: BootloaderVersion,
    /// Bootloader id written with erase and enable commands
    pub bootloader_id: [u8; 2],
    /// Block size in bytes
    pub block_size: u16,
    /// Largest number of blocks per transfer (partition table bootloaders)
    pub payload_length: u16,
    /// Flash config length in blocks (partition table bootloaders)
    pub flash_config_length: u16,
    /// Data register layout
    pub offsets: DataOffsets,
    /// Block counts per area
    pub blocks: BlockCounts,
    /// Partition table read from the device
    pub partition_table: Option<PartitionTable>,
    /// Device has a display config area
    pub has_disp_config: bool,
    /// Device has a permanent config area
    pub has_pm_config: bool,
    /// Device has a bootloader config area
    pub has_bl_config: bool,
    /// Device has a guest code area
    pub has_guest_code: bool,
    /// Device has a utility parameter area
    pub has_utility_param: bool,
}

impl FlashGeometry {
    /// Geometry of a partition table bootloader
    pub fn partitioned(
        version: BootloaderVersion,
        query: &PartitionedQuery,
        table: PartitionTable,
    ) -> Self {
        let blocks = table.block_counts();
        Self {
            version,
            bootloader_id: query.bootloader_id,
            block_size: query.block_size,
            payload_length: query.payload_length,
            flash_config_length: query.flash_config_length,
            offsets: DataOffsets::partitioned(),
            has_disp_config: blocks.dp_config != 0,
            has_pm_config: blocks.pm_config != 0,
            has_bl_config: blocks.bl_config != 0,
            has_guest_code: blocks.guest_code != 0,
            has_utility_param: blocks.utility_param != 0,
            blocks,
            partition_table: Some(table),
        }
    }
}

/// F34 register accessor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct F34 {
    bases: BaseAddresses,
    version: BootloaderVersion,
}

impl F34 {
    /// Create an accessor
    pub fn new(bases: BaseAddresses, version: BootloaderVersion) -> Self {
        Self { bases, version }
    }

    /// Register bases
    pub fn bases(&self) -> &BaseAddresses {
        &self.bases
    }

    /// Bootloader generation
    pub fn version(&self) -> BootloaderVersion {
        self.version
    }

    /// Read query 0 and query 1-7 of a partition table bootloader
    ///
    /// A bootloader major revision of 8 upgrades the generation.
    pub fn read_partitioned_query(
        &mut self,
        transport: &RmiTransport,
    ) -> Result<PartitionedQuery> {
        let query0 = transport.read_byte(self.bases.query)?;
        let offset = (query0 & 0x07) as u16 + 1;
        let mut raw = [0u8; V7_QUERY_1_7_LEN];
        transport.read(self.bases.query + offset, &mut raw)?;
        let query = PartitionedQuery::decode(&raw);

        if query.bootloader_id[1] == 8 {
            self.version = BootloaderVersion::V8;
        }
        if query.block_size == 0 || query.payload_length == 0 {
            return Err(ProtocolError::InvalidGeometry.into());
        }
        log::debug!(
            "rmi4: F34 {} block size {}, payload {}, {} partitions",
            self.version,
            query.block_size,
            query.payload_length,
            query.partition_count
        );
        Ok(query)
    }

    /// Read the complete geometry of a legacy bootloader
    pub fn read_legacy_geometry(&self, transport: &RmiTransport) -> Result<FlashGeometry> {
        let base = self.bases.query;
        let q = LegacyQueryOffsets::for_version(self.version);

        let mut bootloader_id = [0u8; 2];
        transport.read(base, &mut bootloader_id)?;

        let mut word = [0u8; 2];
        transport.read(base + q.block_size, &mut word)?;
        let block_size = u16::from_le_bytes(word);
        if block_size == 0 {
            return Err(ProtocolError::InvalidGeometry.into());
        }

        let offsets = match self.version {
            BootloaderVersion::V5 => DataOffsets::v5(block_size),
            _ => DataOffsets::v6(),
        };

        let props = FlashProperties::from_bits_retain(transport.read_byte(base + q.properties)?);
        let optional = [
            props.contains(FlashProperties::HAS_PM_CONFIG),
            props.contains(FlashProperties::HAS_BL_CONFIG),
            props.contains(FlashProperties::HAS_DISP_CONFIG),
        ];
        let len = 4 + 2 * optional.iter().filter(|&&b| b).count();
        let counts = transport.read_vec(base + q.block_count, len)?;
        let mut words = counts
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]));

        let mut blocks = BlockCounts {
            ui_firmware: words.next().unwrap_or(0),
            ui_config: words.next().unwrap_or(0),
            ..Default::default()
        };
        if optional[0] {
            blocks.pm_config = words.next().unwrap_or(0);
        }
        if optional[1] {
            blocks.bl_config = words.next().unwrap_or(0);
        }
        if optional[2] {
            blocks.dp_config = words.next().unwrap_or(0);
        }

        let mut has_guest_code = false;
        if let (true, Some(props2)) = (props.contains(FlashProperties::HAS_QUERY4), q.properties_2) {
            if transport.read_byte(base + props2)? & 0x01 != 0 {
                transport.read(base + props2 + 1, &mut word)?;
                blocks.guest_code = u16::from_le_bytes(word);
                has_guest_code = true;
            }
        }

        log::debug!(
            "rmi4: F34 {} block size {}, firmware {} blocks, config {} blocks",
            self.version,
            block_size,
            blocks.ui_firmware,
            blocks.ui_config
        );

        Ok(FlashGeometry {
            version: self.version,
            bootloader_id,
            block_size,
            payload_length: 1,
            flash_config_length: 0,
            offsets,
            blocks,
            partition_table: None,
            has_disp_config: optional[2],
            has_pm_config: optional[0],
            has_bl_config: optional[1],
            has_guest_code,
            has_utility_param: false,
        })
    }

    /// Read and decode the flash status and command registers
    pub fn read_status(&self, transport: &RmiTransport, offsets: &DataOffsets) -> Result<FlashStatus> {
        let status = transport.read_byte(self.bases.data + offsets.flash_status)?;
        let command = transport.read_byte(self.bases.data + offsets.flash_cmd)?;
        Ok(FlashStatus::decode(self.version, status, command))
    }

    /// Read the device config id from the control registers
    pub fn read_config_id(&self, transport: &RmiTransport) -> Result<Vec<u8>> {
        transport.read_vec(self.bases.control, self.version.config_id_len())
    }
}
