//! Flash commands and their encodings in the two bootloader dialects

use std::fmt;

use crate::image::partition::PartitionId;

/// Configuration area addressed by config reads, writes and erases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigArea {
    /// UI (core) config
    Ui = 0,
    /// Permanent config (guest serialization)
    Permanent = 1,
    /// Bootloader config (global parameters)
    Bootloader = 2,
    /// Display config
    Display = 3,
    /// Flash config (partition table)
    Flash = 4,
    /// Utility parameters
    UtilityParameter = 5,
}

impl ConfigArea {
    /// Partition holding this area on partition table bootloaders
    pub fn partition(self) -> PartitionId {
        match self {
            Self::Ui => PartitionId::CoreConfig,
            Self::Permanent => PartitionId::GuestSerialization,
            Self::Bootloader => PartitionId::GlobalParameters,
            Self::Display => PartitionId::DisplayConfig,
            Self::Flash => PartitionId::FlashConfig,
            Self::UtilityParameter => PartitionId::UtilityParameter,
        }
    }

    /// Area selector in the high bits of the legacy block number register
    pub fn block_number_bits(self) -> u8 {
        (self as u8) << 5
    }

    /// Parse a user supplied area name
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "ui" => Self::Ui,
            "pm" | "permanent" => Self::Permanent,
            "bl" | "bootloader" => Self::Bootloader,
            "dp" | "display" => Self::Display,
            "flash" => Self::Flash,
            "upp" | "utility" => Self::UtilityParameter,
            _ => return None,
        })
    }
}

impl fmt::Display for ConfigArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ui => "UI config",
            Self::Permanent => "permanent config",
            Self::Bootloader => "bootloader config",
            Self::Display => "display config",
            Self::Flash => "flash config",
            Self::UtilityParameter => "utility parameters",
        };
        f.write_str(name)
    }
}

/// Flash operations independent of the dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashCommand {
    /// Return to idle
    Idle,
    /// Program UI firmware blocks
    WriteFirmware,
    /// Program config blocks
    WriteConfig(ConfigArea),
    /// Program lockdown blocks
    WriteLockdown,
    /// Program guest code blocks
    WriteGuestCode,
    /// Read config blocks
    ReadConfig(ConfigArea),
    /// Erase everything the dialect erases at once
    EraseAll,
    /// Erase UI firmware only
    EraseUiFirmware,
    /// Erase a config area
    EraseConfig(ConfigArea),
    /// Erase guest code
    EraseGuestCode,
    /// Enter bootloader mode
    EnableFlashProg,
}

/// Opcodes of the partition table bootloaders
mod partitioned {
    pub const ENTER_BL: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const WRITE: u8 = 0x03;
    pub const ERASE: u8 = 0x04;
    pub const ERASE_AP: u8 = 0x05;
}

/// Opcodes of the legacy bootloaders
mod legacy {
    pub const IDLE: u8 = 0x00;
    pub const WRITE_FW: u8 = 0x02;
    pub const ERASE_ALL: u8 = 0x03;
    pub const WRITE_LOCKDOWN: u8 = 0x04;
    pub const READ_CONFIG: u8 = 0x05;
    pub const WRITE_CONFIG: u8 = 0x06;
    pub const ERASE_UI_CONFIG: u8 = 0x07;
    pub const ERASE_DISP_CONFIG: u8 = 0x0A;
    pub const ERASE_GUEST_CODE: u8 = 0x0B;
    pub const WRITE_GUEST_CODE: u8 = 0x0C;
    pub const ENABLE_FLASH_PROG: u8 = 0x0F;
}

impl FlashCommand {
    /// Partition addressed by this command on partition table bootloaders
    pub fn partition(self) -> Option<PartitionId> {
        match self {
            Self::Idle => None,
            Self::WriteFirmware | Self::EraseAll | Self::EraseUiFirmware => {
                Some(PartitionId::CoreCode)
            }
            Self::WriteConfig(area) | Self::ReadConfig(area) | Self::EraseConfig(area) => {
                Some(area.partition())
            }
            Self::WriteLockdown => Some(PartitionId::DeviceConfig),
            Self::WriteGuestCode | Self::EraseGuestCode => Some(PartitionId::GuestCode),
            Self::EnableFlashProg => Some(PartitionId::Bootloader),
        }
    }

    /// Opcode on partition table bootloaders
    pub fn partitioned_opcode(self) -> Option<u8> {
        match self {
            Self::Idle => None,
            Self::WriteFirmware | Self::WriteConfig(_) | Self::WriteLockdown | Self::WriteGuestCode => {
                Some(partitioned::WRITE)
            }
            Self::ReadConfig(_) => Some(partitioned::READ),
            Self::EraseAll => Some(partitioned::ERASE_AP),
            Self::EraseUiFirmware | Self::EraseConfig(_) | Self::EraseGuestCode => {
                Some(partitioned::ERASE)
            }
            Self::EnableFlashProg => Some(partitioned::ENTER_BL),
        }
    }

    /// Erases and the enable command are written together with their
    /// partition id and the bootloader id in one transaction
    pub fn is_single_transaction(self) -> bool {
        matches!(
            self,
            Self::EraseAll
                | Self::EraseUiFirmware
                | Self::EraseConfig(_)
                | Self::EraseGuestCode
                | Self::EnableFlashProg
        )
    }

    /// Opcode on legacy bootloaders
    pub fn legacy_opcode(self) -> Option<u8> {
        match self {
            Self::Idle => Some(legacy::IDLE),
            Self::WriteFirmware => Some(legacy::WRITE_FW),
            Self::WriteConfig(_) => Some(legacy::WRITE_CONFIG),
            Self::WriteLockdown => Some(legacy::WRITE_LOCKDOWN),
            Self::WriteGuestCode => Some(legacy::WRITE_GUEST_CODE),
            Self::ReadConfig(_) => Some(legacy::READ_CONFIG),
            Self::EraseAll => Some(legacy::ERASE_ALL),
            Self::EraseConfig(ConfigArea::Ui) => Some(legacy::ERASE_UI_CONFIG),
            Self::EraseConfig(ConfigArea::Display) => Some(legacy::ERASE_DISP_CONFIG),
            Self::EraseGuestCode => Some(legacy::ERASE_GUEST_CODE),
            Self::EnableFlashProg => Some(legacy::ENABLE_FLASH_PROG),
            Self::EraseUiFirmware | Self::EraseConfig(_) => None,
        }
    }

    /// Legacy commands that must be preceded by the bootloader id
    pub fn legacy_needs_bootloader_id(self) -> bool {
        matches!(
            self,
            Self::EraseAll | Self::EraseConfig(_) | Self::EraseGuestCode | Self::EnableFlashProg
        )
    }
}
