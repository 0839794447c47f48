//! F34 command and block transfer primitives

use std::thread;

use super::command::{ConfigArea, FlashCommand};
use super::{FlashProgress, FlashTiming, ERASE_WAIT, MAX_WRITE_SIZE, WRITE_WAIT};
use crate::error::{Error, ProtocolError, Result};
use crate::function::f34::{
    BootloaderVersion, Dialect, FlashGeometry, FlashStatus, PartitionedQuery, F34,
};
use crate::image::partition::PartitionTable;
use crate::transport::RmiTransport;

/// Dialect-aware access to the flash function
#[derive(Debug, Clone)]
pub struct FlashController {
    f34: F34,
    geometry: FlashGeometry,
    timing: FlashTiming,
    last: FlashStatus,
}

impl FlashController {
    /// Read the flash geometry, including the partition table on v7 and v8
    pub fn probe(transport: &RmiTransport, mut f34: F34, timing: FlashTiming) -> Result<Self> {
        match f34.version().dialect() {
            Dialect::Legacy => {
                let geometry = f34.read_legacy_geometry(transport)?;
                Ok(Self {
                    f34,
                    geometry,
                    timing,
                    last: FlashStatus::default(),
                })
            }
            Dialect::Partitioned => {
                let query = f34.read_partitioned_query(transport)?;
                let mut controller = Self {
                    f34,
                    geometry: FlashGeometry::partitioned(
                        f34.version(),
                        &query,
                        PartitionTable::default(),
                    ),
                    timing,
                    last: FlashStatus::default(),
                };
                let table = controller.read_partition_table(transport, &query)?;
                controller.geometry = FlashGeometry::partitioned(f34.version(), &query, table);
                Ok(controller)
            }
        }
    }

    /// Flash geometry
    pub fn geometry(&self) -> &FlashGeometry {
        &self.geometry
    }

    /// Bootloader generation
    pub fn version(&self) -> BootloaderVersion {
        self.geometry.version
    }

    /// Register accessor
    pub fn f34(&self) -> &F34 {
        &self.f34
    }

    /// Sleep intervals
    pub fn timing(&self) -> &FlashTiming {
        &self.timing
    }

    /// Status from the most recent read
    pub fn last_status(&self) -> FlashStatus {
        self.last
    }

    /// Read and cache the flash status
    pub fn read_status(&mut self, transport: &RmiTransport) -> Result<FlashStatus> {
        self.last = self.f34.read_status(transport, &self.geometry.offsets)?;
        Ok(self.last)
    }

    /// Wait until the last command completed
    ///
    /// Sleeps one poll interval per step for `timeout + 1` steps. With
    /// `poll` the status is read every step, otherwise only on the last.
    pub fn wait_for_idle(&mut self, transport: &RmiTransport, timeout: u32, poll: bool) -> Result<()> {
        let steps = timeout + 1;
        for step in 1..=steps {
            thread::sleep(self.timing.poll_interval);
            if poll || step == steps {
                self.read_status(transport)?;
            }
            if self.last.is_idle() {
                return Ok(());
            }
        }
        log::error!(
            "rmi4: timed out waiting for idle, status 0x{:02X}, command 0x{:02X}",
            self.last.status,
            self.last.command
        );
        Err(Error::FlashTimeout {
            status: self.last.status,
            command: self.last.command,
        })
    }

    /// Issue a flash command in the device's dialect
    pub fn write_command(&mut self, transport: &RmiTransport, cmd: FlashCommand) -> Result<()> {
        let data = self.f34.bases().data;
        let off = self.geometry.offsets;
        let bl_id = self.geometry.bootloader_id;

        match self.geometry.version.dialect() {
            Dialect::Partitioned => {
                let opcode = cmd
                    .partitioned_opcode()
                    .ok_or(ProtocolError::UnsupportedCommand)?;
                self.last.command = opcode;
                log::trace!("rmi4: F34 command {:?} (0x{:02X})", cmd, opcode);
                if cmd.is_single_transaction() {
                    let partition = cmd
                        .partition()
                        .ok_or(ProtocolError::UnsupportedCommand)?;
                    let frame = [partition as u8, 0, 0, 0, 0, opcode, bl_id[0], bl_id[1]];
                    return transport.write(data + off.partition_id, &frame);
                }
                transport.write_byte(data + off.flash_cmd, opcode)
            }
            Dialect::Legacy => {
                let opcode = cmd.legacy_opcode().ok_or(ProtocolError::UnsupportedCommand)?;
                if cmd.legacy_needs_bootloader_id() {
                    transport.write(data + off.payload, &bl_id)?;
                }
                self.last.command = opcode;
                log::trace!("rmi4: F34 command {:?} (0x{:02X})", cmd, opcode);
                transport.write_byte(data + off.flash_cmd, opcode)
            }
        }
    }

    fn write_partition_id(&self, transport: &RmiTransport, cmd: FlashCommand) -> Result<()> {
        if self.geometry.version.dialect() == Dialect::Legacy {
            return Ok(());
        }
        let partition = cmd.partition().ok_or(ProtocolError::UnsupportedCommand)?;
        transport.write_byte(
            self.f34.bases().data + self.geometry.offsets.partition_id,
            partition as u8,
        )
    }

    fn start_transfer(&self, transport: &RmiTransport, cmd: FlashCommand) -> Result<()> {
        let data = self.f34.bases().data;
        let off = self.geometry.offsets;
        match self.geometry.version.dialect() {
            Dialect::Partitioned => {
                self.write_partition_id(transport, cmd)?;
                transport.write(data + off.block_number, &[0, 0])
            }
            Dialect::Legacy => {
                let area = match cmd {
                    FlashCommand::WriteConfig(area) | FlashCommand::ReadConfig(area) => {
                        area.block_number_bits()
                    }
                    _ => 0,
                };
                transport.write(data + off.block_number, &[0, area])
            }
        }
    }

    /// Largest payload write for a transfer of `transfer` blocks
    fn max_write_size(&self, transfer: usize) -> usize {
        let block_size = self.geometry.block_size as usize;
        let total = transfer * block_size;
        if MAX_WRITE_SIZE >= total {
            total
        } else if MAX_WRITE_SIZE > block_size {
            MAX_WRITE_SIZE - MAX_WRITE_SIZE % block_size
        } else {
            block_size
        }
    }

    /// Program `data` block by block with a write command
    ///
    /// A trailing partial block is not written.
    pub fn write_blocks(
        &mut self,
        transport: &RmiTransport,
        data: &[u8],
        cmd: FlashCommand,
        progress: &mut dyn FlashProgress,
    ) -> Result<()> {
        let block_size = self.geometry.block_size as usize;
        let blocks = data.len() / block_size;
        let base = self.f34.bases().data;
        let off = self.geometry.offsets;
        log::debug!("rmi4: writing {} blocks with {:?}", blocks, cmd);

        self.start_transfer(transport, cmd)?;
        match self.geometry.version.dialect() {
            Dialect::Partitioned => {
                let payload = self.geometry.payload_length as usize;
                let mut written = 0;
                while written < blocks {
                    let transfer = payload.min(blocks - written);
                    transport.write(base + off.transfer_length, &(transfer as u16).to_le_bytes())?;
                    self.write_command(transport, cmd)?;

                    let start = written * block_size;
                    let batch = &data[start..start + transfer * block_size];
                    for chunk in batch.chunks(self.max_write_size(transfer)) {
                        transport.write(base + off.payload, chunk)?;
                    }
                    self.wait_for_idle(transport, WRITE_WAIT * 10, true)?;

                    written += transfer;
                    progress.write_progress(written);
                }
            }
            Dialect::Legacy => {
                for (index, block) in data.chunks_exact(block_size).enumerate() {
                    transport.write(base + off.payload, block)?;
                    self.write_command(transport, cmd)?;
                    self.wait_for_idle(transport, WRITE_WAIT, false)?;
                    progress.write_progress(index + 1);
                }
            }
        }
        Ok(())
    }

    /// Read `count` blocks of a config area
    pub fn read_blocks(
        &mut self,
        transport: &RmiTransport,
        area: ConfigArea,
        count: u16,
    ) -> Result<Vec<u8>> {
        let block_size = self.geometry.block_size as usize;
        let base = self.f34.bases().data;
        let off = self.geometry.offsets;
        let cmd = FlashCommand::ReadConfig(area);
        let mut out = Vec::with_capacity(count as usize * block_size);
        log::debug!("rmi4: reading {} blocks of {}", count, area);

        self.start_transfer(transport, cmd)?;
        match self.geometry.version.dialect() {
            Dialect::Partitioned => {
                let payload = self.geometry.payload_length;
                let mut remaining = count;
                while remaining > 0 {
                    let transfer = payload.min(remaining);
                    transport.write(base + off.transfer_length, &transfer.to_le_bytes())?;
                    self.write_command(transport, cmd)?;
                    self.wait_for_idle(transport, WRITE_WAIT, false)?;
                    out.extend(transport.read_vec(base + off.payload, transfer as usize * block_size)?);
                    remaining -= transfer;
                }
            }
            Dialect::Legacy => {
                for _ in 0..count {
                    self.write_command(transport, cmd)?;
                    self.wait_for_idle(transport, WRITE_WAIT * 10, true)?;
                    out.extend(transport.read_vec(base + off.payload, block_size)?);
                }
            }
        }
        Ok(out)
    }

    /// Erase one config area
    pub fn erase_config(&mut self, transport: &RmiTransport, area: ConfigArea) -> Result<()> {
        log::info!("rmi4: erasing {}", area);
        self.write_command(transport, FlashCommand::EraseConfig(area))?;
        self.wait_for_idle(transport, ERASE_WAIT, false)
    }

    /// Erase the guest code area
    pub fn erase_guest_code(&mut self, transport: &RmiTransport) -> Result<()> {
        log::info!("rmi4: erasing guest code");
        self.write_command(transport, FlashCommand::EraseGuestCode)?;
        self.wait_for_idle(transport, ERASE_WAIT, false)
    }

    /// Blocks the device reserves for a config area
    pub fn area_blocks(&self, area: ConfigArea) -> u16 {
        let blocks = &self.geometry.blocks;
        match area {
            ConfigArea::Ui => blocks.ui_config,
            ConfigArea::Permanent => blocks.pm_config,
            ConfigArea::Bootloader => blocks.bl_config,
            ConfigArea::Display => blocks.dp_config,
            ConfigArea::Flash => blocks.fl_config,
            ConfigArea::UtilityParameter => blocks.utility_param,
        }
    }

    /// Device config id
    pub fn read_config_id(&self, transport: &RmiTransport) -> Result<Vec<u8>> {
        self.f34.read_config_id(transport)
    }

    fn read_partition_table(
        &mut self,
        transport: &RmiTransport,
        query: &PartitionedQuery,
    ) -> Result<PartitionTable> {
        let base = self.f34.bases().data;
        let off = self.geometry.offsets;
        let cmd = FlashCommand::ReadConfig(ConfigArea::Flash);

        self.start_transfer(transport, cmd)?;
        transport.write(
            base + off.transfer_length,
            &query.flash_config_length.to_le_bytes(),
        )?;
        self.write_command(transport, cmd)?;
        thread::sleep(self.timing.settle_delay);
        self.wait_for_idle(transport, WRITE_WAIT, true)?;

        let raw = transport.read_vec(base + off.payload, query.table_bytes())?;
        let table = PartitionTable::parse(&raw, query.partition_count);
        for entry in table.entries() {
            log::debug!(
                "rmi4: partition {:?} at block {} length {}",
                entry.partition(),
                entry.address,
                entry.length
            );
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::NoProgress;
    use crate::pdt::BaseAddresses;
    use crate::testing::MockBus;

    fn bases() -> BaseAddresses {
        BaseAddresses {
            query: 0x80,
            command: 0x8F,
            control: 0x90,
            data: 0xB0,
        }
    }

    /// v6 bootloader, 8-byte blocks, status register reading idle
    fn legacy(bus: &MockBus) -> FlashController {
        bus.packet(0x80, &[0x11, 0x22]);
        bus.packet(0x81, &[0x00]);
        bus.packet(0x82, &8u16.to_le_bytes());
        bus.packet(0x83, &[4, 0, 2, 0]);
        bus.packet(0xB1, &[0; 8]);
        bus.pin(0xB2, &[0x00]);
        let f34 = F34::new(bases(), BootloaderVersion::V6);
        FlashController::probe(&bus.transport(), f34, FlashTiming::immediate()).unwrap()
    }

    #[test]
    fn test_legacy_block_write_sequence() {
        let bus = MockBus::new();
        let mut ctrl = legacy(&bus);
        let transport = bus.transport();
        bus.clear_log();

        let data: Vec<u8> = (0..16).collect();
        ctrl.write_blocks(&transport, &data, FlashCommand::WriteConfig(ConfigArea::Display), &mut NoProgress)
            .unwrap();

        let writes = bus.writes();
        assert_eq!(writes[0], (0xB0, vec![0x00, 0x60]));
        assert_eq!(writes[1], (0xB1, (0..8).collect()));
        assert_eq!(writes[2], (0xB2, vec![0x06]));
        assert_eq!(writes[3], (0xB1, (8..16).collect()));
        assert_eq!(writes[4], (0xB2, vec![0x06]));
        assert_eq!(writes.len(), 5);
    }

    #[test]
    fn test_legacy_erase_writes_bootloader_id_first() {
        let bus = MockBus::new();
        let mut ctrl = legacy(&bus);
        let transport = bus.transport();
        bus.clear_log();

        ctrl.erase_config(&transport, ConfigArea::Ui).unwrap();
        let writes = bus.writes();
        assert_eq!(writes[0], (0xB1, vec![0x11, 0x22]));
        assert_eq!(writes[1], (0xB2, vec![0x07]));
    }

    #[test]
    fn test_wait_times_out_on_busy_status() {
        let bus = MockBus::new();
        let mut ctrl = legacy(&bus);
        let transport = bus.transport();
        bus.poke(0xB3, &[0x80 | 0x02]);

        ctrl.write_command(&transport, FlashCommand::WriteFirmware).unwrap();
        assert_eq!(
            ctrl.wait_for_idle(&transport, 3, true),
            Err(Error::FlashTimeout {
                status: 2,
                command: 0
            })
        );
        assert!(ctrl.last_status().in_bootloader);
    }

    #[test]
    fn test_unsupported_legacy_command() {
        let bus = MockBus::new();
        let mut ctrl = legacy(&bus);
        assert_eq!(
            ctrl.write_command(&bus.transport(), FlashCommand::EraseUiFirmware),
            Err(ProtocolError::UnsupportedCommand.into())
        );
    }

    #[test]
    fn test_max_write_size() {
        let bus = MockBus::new();
        let mut ctrl = legacy(&bus);
        ctrl.geometry.block_size = 16;
        assert_eq!(ctrl.max_write_size(2), 32);
        assert_eq!(ctrl.max_write_size(8), 64);
        ctrl.geometry.block_size = 24;
        assert_eq!(ctrl.max_write_size(8), 48);
        ctrl.geometry.block_size = 128;
        assert_eq!(ctrl.max_write_size(2), 128);
    }
}
