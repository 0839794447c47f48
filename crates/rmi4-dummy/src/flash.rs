//! Simulated F34 flash function
//!
//! Keeps one byte array per partition and executes commands the moment
//! they are written, so the status registers read idle right after a
//! command unless a failure was injected.

use std::collections::HashMap;

use rmi4_core::function::f34::{BootloaderVersion, STATUS_BAD_PARTITION_TABLE};
use rmi4_core::image::partition::{PartitionId, PartitionTable};

/// Status code reported for rejected commands
pub const STATUS_ERROR: u8 = 0x03;

/// Flash operation observed by the simulator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOp {
    /// Bootloader mode entered
    EnterBootloader,
    /// Firmware erase covering several partitions at once
    EraseAll,
    /// One partition erased
    Erase(PartitionId),
    /// Consecutive blocks written to a partition
    Write {
        /// Target partition
        partition: PartitionId,
        /// Number of blocks
        blocks: usize,
    },
    /// Consecutive blocks read from a partition
    Read {
        /// Source partition
        partition: PartitionId,
        /// Number of blocks
        blocks: usize,
    },
}

mod legacy {
    pub const WRITE_FW: u8 = 0x02;
    pub const ERASE_ALL: u8 = 0x03;
    pub const WRITE_LOCKDOWN: u8 = 0x04;
    pub const READ_CONFIG: u8 = 0x05;
    pub const WRITE_CONFIG: u8 = 0x06;
    pub const ERASE_UI_CONFIG: u8 = 0x07;
    pub const ERASE_DISP_CONFIG: u8 = 0x0A;
    pub const ERASE_GUEST_CODE: u8 = 0x0B;
    pub const WRITE_GUEST_CODE: u8 = 0x0C;
    pub const ENABLE: u8 = 0x0F;
}

mod partitioned {
    pub const ENTER_BL: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const WRITE: u8 = 0x03;
    pub const ERASE: u8 = 0x04;
    pub const ERASE_AP: u8 = 0x05;
}

/// Register roles within the data space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Register {
    Status,
    Partition,
    BlockNumber,
    TransferLength,
    Command,
    Payload,
    /// v5 shares one register between status and command
    StatusCommand,
}

pub(crate) struct FlashFunction {
    version: BootloaderVersion,
    block_size: usize,
    bootloader_id: [u8; 2],
    pub(crate) in_bootloader: bool,
    pub(crate) firmware_erased: bool,
    areas: HashMap<PartitionId, Vec<u8>>,
    partition: u8,
    block_number: u16,
    area_bits: u8,
    transfer_length: u16,
    command: u8,
    status: u8,
    payload: Vec<u8>,
    pending: usize,
    read_buffer: Vec<u8>,
    pub(crate) ops: Vec<FlashOp>,
    pub(crate) stalled: Option<u8>,
    pub(crate) bad_table_on_erase: bool,
}

impl FlashFunction {
    pub(crate) fn new(
        version: BootloaderVersion,
        block_size: u16,
        bootloader_id: [u8; 2],
        areas: HashMap<PartitionId, Vec<u8>>,
    ) -> Self {
        Self {
            version,
            block_size: block_size as usize,
            bootloader_id,
            in_bootloader: false,
            firmware_erased: false,
            areas,
            partition: 0,
            block_number: 0,
            area_bits: 0,
            transfer_length: 0,
            command: 0,
            status: 0,
            payload: Vec::new(),
            pending: 0,
            read_buffer: Vec::new(),
            ops: Vec::new(),
            stalled: None,
            bad_table_on_erase: false,
        }
    }

    pub(crate) fn area(&self, id: PartitionId) -> Option<&[u8]> {
        self.areas.get(&id).map(Vec::as_slice)
    }

    pub(crate) fn area_mut(&mut self, id: PartitionId) -> Option<&mut Vec<u8>> {
        self.areas.get_mut(&id)
    }

    /// Size of the data register space
    pub(crate) fn data_len(&self) -> u16 {
        match self.version {
            BootloaderVersion::V5 => 3 + self.block_size as u16,
            BootloaderVersion::V6 => 4,
            BootloaderVersion::V7 | BootloaderVersion::V8 => 6,
        }
    }

    fn register(&self, offset: u16) -> Option<Register> {
        let bs = self.block_size as u16;
        let reg = match self.version {
            BootloaderVersion::V5 => match offset {
                0 => Register::BlockNumber,
                2 => Register::Payload,
                o if o == 2 + bs => Register::StatusCommand,
                _ => return None,
            },
            BootloaderVersion::V6 => match offset {
                0 => Register::BlockNumber,
                1 => Register::Payload,
                2 => Register::Command,
                3 => Register::Status,
                _ => return None,
            },
            BootloaderVersion::V7 | BootloaderVersion::V8 => match offset {
                0 => Register::Status,
                1 => Register::Partition,
                2 => Register::BlockNumber,
                3 => Register::TransferLength,
                4 => Register::Command,
                5 => Register::Payload,
                _ => return None,
            },
        };
        Some(reg)
    }

    fn mode_bit(&self) -> u8 {
        if self.in_bootloader {
            0x80
        } else {
            0
        }
    }

    /// Read from the data space
    pub(crate) fn read(&self, offset: u16, buf: &mut [u8]) {
        buf.fill(0);
        let Some(reg) = self.register(offset) else {
            return;
        };
        let src: Vec<u8> = match reg {
            Register::Status => vec![self.mode_bit() | self.status],
            Register::StatusCommand => vec![self.mode_bit() | (self.status & 0x07) << 4 | self.command],
            Register::Command => vec![self.command],
            Register::Partition => vec![self.partition],
            Register::BlockNumber => self.block_number.to_le_bytes().to_vec(),
            Register::TransferLength => self.transfer_length.to_le_bytes().to_vec(),
            Register::Payload => self.read_buffer.clone(),
        };
        for (dst, b) in buf.iter_mut().zip(src) {
            *dst = b;
        }
    }

    /// Write to the data space
    pub(crate) fn write(&mut self, offset: u16, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let Some(reg) = self.register(offset) else {
            log::warn!("dummy: write to unknown F34 data offset {}", offset);
            return;
        };
        let word = |d: &[u8]| u16::from_le_bytes([d[0], d.get(1).copied().unwrap_or(0)]);
        match reg {
            Register::BlockNumber if self.version.number() < 7 => {
                let hi = data.get(1).copied().unwrap_or(0);
                self.block_number = data[0] as u16 | ((hi & 0x1F) as u16) << 8;
                self.area_bits = hi >> 5;
            }
            Register::BlockNumber => self.block_number = word(data),
            Register::TransferLength => self.transfer_length = word(data),
            Register::Partition if data.len() >= 8 => {
                self.partition = data[0];
                self.block_number = word(&data[1..3]);
                self.transfer_length = word(&data[3..5]);
                self.payload = data[6..8].to_vec();
                self.execute(data[5]);
            }
            Register::Partition => self.partition = data[0],
            Register::Payload if self.pending > 0 => {
                self.payload.extend_from_slice(data);
                if self.payload.len() >= self.pending {
                    self.commit_batch();
                }
            }
            Register::Payload => self.payload = data.to_vec(),
            Register::Command | Register::StatusCommand => self.execute(data[0] & 0x3F),
            Register::Status => {}
        }
    }

    /// Return to idle after a controller reset
    pub(crate) fn reset(&mut self) {
        self.in_bootloader = self.firmware_erased;
        self.command = 0;
        self.status = 0;
        self.pending = 0;
        self.payload.clear();
        self.read_buffer.clear();
    }

    /// Record an operation, merging consecutive block transfers
    fn push_op(&mut self, op: FlashOp) {
        if let Some(last) = self.ops.last_mut() {
            match (last, op) {
                (
                    FlashOp::Write { partition: p, blocks },
                    FlashOp::Write {
                        partition,
                        blocks: more,
                    },
                )
                | (
                    FlashOp::Read { partition: p, blocks },
                    FlashOp::Read {
                        partition,
                        blocks: more,
                    },
                ) if *p == partition => {
                    *blocks += more;
                    return;
                }
                _ => {}
            }
        }
        self.ops.push(op);
    }

    fn bootloader_id_ok(&self) -> bool {
        self.payload.get(..2) == Some(&self.bootloader_id[..])
    }

    fn legacy_area(&self) -> PartitionId {
        match self.area_bits {
            0 => PartitionId::CoreConfig,
            1 => PartitionId::GuestSerialization,
            2 => PartitionId::GlobalParameters,
            3 => PartitionId::DisplayConfig,
            4 => PartitionId::FlashConfig,
            _ => PartitionId::UtilityParameter,
        }
    }

    fn erase(&mut self, id: PartitionId) -> bool {
        let Some(area) = self.areas.get_mut(&id) else {
            return false;
        };
        area.fill(0xFF);
        if id == PartitionId::CoreCode {
            self.firmware_erased = true;
        }
        true
    }

    fn write_area(&mut self, id: PartitionId, data: &[u8]) -> bool {
        let start = self.block_number as usize * self.block_size;
        let Some(area) = self.areas.get_mut(&id) else {
            return false;
        };
        let Some(dst) = area.get_mut(start..start + data.len()) else {
            return false;
        };
        dst.copy_from_slice(data);
        if id == PartitionId::CoreCode {
            self.firmware_erased = false;
        }
        if id == PartitionId::FlashConfig {
            let table = PartitionTable::parse_all(area);
            self.resize_areas(&table);
        }
        true
    }

    fn resize_areas(&mut self, table: &PartitionTable) {
        for entry in table.entries() {
            let Some(id) = entry.partition() else {
                continue;
            };
            if id == PartitionId::FlashConfig {
                continue;
            }
            let len = entry.length as usize * self.block_size;
            if let Some(area) = self.areas.get_mut(&id) {
                area.resize(len, 0xFF);
            }
        }
    }

    fn read_area(&mut self, id: PartitionId, blocks: usize) -> bool {
        let start = self.block_number as usize * self.block_size;
        let len = blocks * self.block_size;
        let Some(src) = self.areas.get(&id).and_then(|a| a.get(start..start + len)) else {
            return false;
        };
        self.read_buffer = src.to_vec();
        true
    }

    fn execute(&mut self, opcode: u8) {
        self.status = 0;
        self.command = opcode;
        if self.stalled == Some(opcode) {
            log::debug!("dummy: F34 command 0x{:02X} stalls", opcode);
            return;
        }
        let ok = match self.version {
            BootloaderVersion::V5 | BootloaderVersion::V6 => self.execute_legacy(opcode),
            BootloaderVersion::V7 | BootloaderVersion::V8 => self.execute_partitioned(opcode),
        };
        if self.pending == 0 {
            self.command = 0;
        }
        if !ok {
            log::debug!("dummy: F34 command 0x{:02X} rejected", opcode);
            self.status = STATUS_ERROR;
        }
    }

    fn execute_legacy(&mut self, opcode: u8) -> bool {
        if opcode == legacy::ENABLE {
            if !self.bootloader_id_ok() {
                return false;
            }
            self.in_bootloader = true;
            self.push_op(FlashOp::EnterBootloader);
            return true;
        }
        if opcode == legacy::READ_CONFIG {
            let id = self.legacy_area();
            let ok = self.read_area(id, 1);
            if ok {
                self.block_number += 1;
                self.push_op(FlashOp::Read {
                    partition: id,
                    blocks: 1,
                });
            }
            return ok;
        }
        if !self.in_bootloader {
            return false;
        }
        let block = self.payload.get(..self.block_size).map(<[u8]>::to_vec);
        match opcode {
            legacy::WRITE_FW => self.legacy_write(PartitionId::CoreCode, block),
            legacy::WRITE_CONFIG => self.legacy_write(self.legacy_area(), block),
            legacy::WRITE_GUEST_CODE => self.legacy_write(PartitionId::GuestCode, block),
            legacy::WRITE_LOCKDOWN => true,
            legacy::ERASE_ALL if self.bootloader_id_ok() => {
                self.erase(PartitionId::CoreCode);
                self.erase(PartitionId::CoreConfig);
                self.push_op(FlashOp::EraseAll);
                true
            }
            legacy::ERASE_UI_CONFIG if self.bootloader_id_ok() => {
                self.legacy_erase(PartitionId::CoreConfig)
            }
            legacy::ERASE_DISP_CONFIG if self.bootloader_id_ok() => {
                self.legacy_erase(PartitionId::DisplayConfig)
            }
            legacy::ERASE_GUEST_CODE if self.bootloader_id_ok() => {
                self.legacy_erase(PartitionId::GuestCode)
            }
            _ => false,
        }
    }

    fn legacy_erase(&mut self, id: PartitionId) -> bool {
        let ok = self.erase(id);
        if ok {
            self.push_op(FlashOp::Erase(id));
        }
        ok
    }

    fn legacy_write(&mut self, id: PartitionId, block: Option<Vec<u8>>) -> bool {
        let Some(block) = block else {
            return false;
        };
        if !self.write_area(id, &block) {
            return false;
        }
        self.block_number += 1;
        self.push_op(FlashOp::Write {
            partition: id,
            blocks: 1,
        });
        true
    }

    fn execute_partitioned(&mut self, opcode: u8) -> bool {
        let Some(id) = PartitionId::from_u8(self.partition) else {
            return false;
        };
        if opcode == partitioned::ENTER_BL {
            if !self.bootloader_id_ok() {
                return false;
            }
            self.in_bootloader = true;
            self.push_op(FlashOp::EnterBootloader);
            return true;
        }
        if opcode != partitioned::READ && !self.in_bootloader {
            return false;
        }
        match opcode {
            partitioned::READ => {
                let blocks = self.transfer_length as usize;
                if !self.read_area(id, blocks) {
                    return false;
                }
                self.block_number += self.transfer_length;
                self.push_op(FlashOp::Read {
                    partition: id,
                    blocks,
                });
                true
            }
            partitioned::WRITE => {
                self.pending = self.transfer_length as usize * self.block_size;
                self.payload.clear();
                self.pending > 0
            }
            partitioned::ERASE if self.bootloader_id_ok() => {
                let ok = self.erase(id);
                if ok {
                    self.push_op(FlashOp::Erase(id));
                }
                ok
            }
            partitioned::ERASE_AP if self.bootloader_id_ok() => {
                for part in [
                    PartitionId::CoreCode,
                    PartitionId::CoreConfig,
                    PartitionId::DisplayConfig,
                    PartitionId::GuestCode,
                ] {
                    self.erase(part);
                }
                self.push_op(FlashOp::EraseAll);
                if self.bad_table_on_erase && self.version == BootloaderVersion::V8 {
                    self.status = STATUS_BAD_PARTITION_TABLE;
                    self.bad_table_on_erase = false;
                }
                true
            }
            _ => false,
        }
    }

    fn commit_batch(&mut self) {
        let len = self.pending;
        self.pending = 0;
        self.command = 0;
        let data: Vec<u8> = self.payload.drain(..).take(len).collect();
        let blocks = len / self.block_size;
        let written = match PartitionId::from_u8(self.partition) {
            Some(id) if self.write_area(id, &data) => {
                self.push_op(FlashOp::Write {
                    partition: id,
                    blocks,
                });
                true
            }
            _ => false,
        };
        if written {
            self.block_number += blocks as u16;
        } else {
            self.status = STATUS_ERROR;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn areas() -> HashMap<PartitionId, Vec<u8>> {
        let mut areas = HashMap::new();
        areas.insert(PartitionId::CoreCode, vec![0; 32]);
        areas.insert(PartitionId::CoreConfig, vec![0; 16]);
        areas
    }

    #[test]
    fn test_legacy_write_requires_bootloader() {
        let mut f = FlashFunction::new(BootloaderVersion::V6, 16, [1, 6], areas());
        f.write(1, &[0xAA; 16]);
        f.write(2, &[legacy::WRITE_FW]);
        let mut status = [0];
        f.read(3, &mut status);
        assert_eq!(status[0], STATUS_ERROR);

        f.write(1, &[1, 6]);
        f.write(2, &[legacy::ENABLE]);
        f.read(3, &mut status);
        assert_eq!(status[0], 0x80);

        f.write(0, &[0, 0]);
        f.write(1, &[0xAA; 16]);
        f.write(2, &[legacy::WRITE_FW]);
        assert_eq!(&f.area(PartitionId::CoreCode).unwrap()[..16], &[0xAA; 16]);
        assert_eq!(
            f.ops,
            vec![
                FlashOp::EnterBootloader,
                FlashOp::Write {
                    partition: PartitionId::CoreCode,
                    blocks: 1
                }
            ]
        );
    }

    #[test]
    fn test_partitioned_batch_commits_when_complete() {
        let mut f = FlashFunction::new(BootloaderVersion::V7, 16, [0, 7], areas());
        f.in_bootloader = true;
        f.write(1, &[PartitionId::CoreCode as u8]);
        f.write(2, &[0, 0]);
        f.write(3, &2u16.to_le_bytes());
        f.write(4, &[partitioned::WRITE]);

        let mut cmd = [0];
        f.write(5, &[0x11; 16]);
        f.read(4, &mut cmd);
        assert_eq!(cmd[0], partitioned::WRITE);
        f.write(5, &[0x22; 16]);
        f.read(4, &mut cmd);
        assert_eq!(cmd[0], 0);

        let code = f.area(PartitionId::CoreCode).unwrap();
        assert_eq!(&code[..16], &[0x11; 16]);
        assert_eq!(&code[16..], &[0x22; 16]);
    }

    #[test]
    fn test_erase_checks_bootloader_id() {
        let mut f = FlashFunction::new(BootloaderVersion::V7, 16, [0, 7], areas());
        f.in_bootloader = true;
        f.write(1, &[PartitionId::CoreConfig as u8, 0, 0, 0, 0, partitioned::ERASE, 9, 9]);
        let mut status = [0];
        f.read(0, &mut status);
        assert_eq!(status[0] & 0x1F, STATUS_ERROR);

        f.write(1, &[PartitionId::CoreConfig as u8, 0, 0, 0, 0, partitioned::ERASE, 0, 7]);
        f.read(0, &mut status);
        assert_eq!(status[0], 0x80);
        assert!(f.area(PartitionId::CoreConfig).unwrap().iter().all(|&b| b == 0xFF));
    }
}
