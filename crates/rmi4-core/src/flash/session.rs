//! Update sequencing
//!
//! One [`FlashSession`] drives one update from the go/no-go decision to
//! the last programmed partition. Firmware is always written before
//! configuration and every partition is erased before it is written.
//! Rediscovery after a successful update is left to the device context.

use std::thread;

use super::command::{ConfigArea, FlashCommand};
use super::controller::FlashController;
use super::{area_section, FlashArea, FlashProgress, ENABLE_WAIT, ERASE_WAIT};
use crate::error::{Error, ImageError, ProtocolError, Result, SizeCheck};
use crate::function::f01::F01;
use crate::function::f34::{BootloaderVersion, Dialect, FlashGeometry, STATUS_BAD_PARTITION_TABLE, F34};
use crate::image::partition::{compare_tables, TableComparison};
use crate::image::{FirmwareImage, Section};
use crate::topology::scan_flash_functions;
use crate::transport::RmiTransport;

/// Caller choices for an update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Program firmware and config regardless of the ids
    pub force: bool,
    /// Firmware id of the image, overriding the id the image declares
    pub firmware_id: Option<u32>,
}

impl UpdateOptions {
    /// Force a full update
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Set the expected image firmware id
    pub fn with_firmware_id(mut self, id: u32) -> Self {
        self.firmware_id = Some(id);
        self
    }
}

/// Decide what an update has to program
///
/// A forced update, a device sitting in its bootloader or a differing
/// firmware id program everything. Otherwise the config is updated only
/// when the image config id is lexicographically greater than the
/// device's.
pub fn go_nogo(
    force: bool,
    in_bootloader: bool,
    image_firmware_id: u32,
    device_firmware_id: u32,
    image_config_id: &[u8],
    device_config_id: &[u8],
) -> FlashArea {
    if force || in_bootloader || image_firmware_id != device_firmware_id {
        return FlashArea::UiFirmware;
    }
    if image_config_id > device_config_id {
        FlashArea::UiConfig
    } else {
        FlashArea::None
    }
}

/// State of one update
pub struct FlashSession<'a> {
    transport: &'a RmiTransport,
    f01: F01,
    controller: FlashController,
    image: &'a FirmwareImage,
    comparison: TableComparison,
    progress: &'a mut dyn FlashProgress,
}

impl<'a> FlashSession<'a> {
    /// Check the image against the device before touching the flash
    pub fn new(
        transport: &'a RmiTransport,
        f01: F01,
        controller: FlashController,
        image: &'a FirmwareImage,
        progress: &'a mut dyn FlashProgress,
    ) -> Result<Self> {
        let geometry = controller.geometry();
        let device = geometry.version.number();
        if image.bl_version() != device {
            log::error!(
                "rmi4: bootloader mismatch, device v{}, image v{}",
                device,
                image.bl_version()
            );
            return Err(ProtocolError::BootloaderMismatch {
                device,
                image: image.bl_version(),
            }
            .into());
        }

        let mut comparison = TableComparison::default();
        if geometry.version.dialect() == Dialect::Partitioned {
            let image_total = image.block_counts().total;
            if image_total != geometry.blocks.total {
                return Err(Error::SizeMismatch {
                    area: SizeCheck::Total,
                    image: image_total,
                    device: geometry.blocks.total,
                });
            }
            if let (Some(device_table), Some(image_table)) =
                (geometry.partition_table.as_ref(), image.partition_table())
            {
                comparison = compare_tables(
                    device_table,
                    image_table,
                    geometry.version,
                    geometry.has_disp_config,
                    geometry.has_guest_code,
                );
            }
            if comparison.incompatible {
                return Err(ProtocolError::IncompatiblePartitionTable.into());
            }
        }

        Ok(Self {
            transport,
            f01,
            controller,
            image,
            comparison,
            progress,
        })
    }

    /// Flash controller
    pub fn controller(&self) -> &FlashController {
        &self.controller
    }

    /// Partition table comparison result
    pub fn comparison(&self) -> TableComparison {
        self.comparison
    }

    /// Run the update
    ///
    /// Returns the area that was programmed. Any failure after the enable
    /// command resets the controller before the error is returned.
    pub fn start(&mut self, options: &UpdateOptions, device_firmware_id: u32) -> Result<FlashArea> {
        let status = self.controller.read_status(self.transport)?;
        if status.in_bootloader {
            log::info!("rmi4: device is in bootloader mode");
        }
        let area = self.decide(options, status.in_bootloader, device_firmware_id)?;
        match area {
            FlashArea::None => {
                log::info!("rmi4: no need to reflash");
                return Ok(area);
            }
            FlashArea::UiFirmware => log::info!("rmi4: updating UI firmware and config"),
            FlashArea::UiConfig => log::info!("rmi4: updating UI config only"),
        }

        let result = self.enter_flash_prog().and_then(|()| match area {
            FlashArea::UiFirmware => self.reflash(),
            FlashArea::UiConfig => self.update_config(),
            FlashArea::None => Ok(()),
        });
        if let Err(e) = result {
            log::error!("rmi4: update failed: {}", e);
            if let Err(reset) = self.f01.reset(self.transport, self.controller.timing().reset_delay) {
                log::error!("rmi4: reset after failed update failed: {}", reset);
            }
            return Err(e);
        }
        Ok(area)
    }

    fn decide(
        &mut self,
        options: &UpdateOptions,
        in_bootloader: bool,
        device_firmware_id: u32,
    ) -> Result<FlashArea> {
        if options.force || in_bootloader {
            return Ok(FlashArea::UiFirmware);
        }
        let image_firmware_id = options
            .firmware_id
            .or(self.image.firmware_id())
            .ok_or(ImageError::MissingFirmwareId)?;
        log::info!(
            "rmi4: device firmware id {}, image firmware id {}",
            device_firmware_id,
            image_firmware_id
        );

        let device_config_id = self.controller.read_config_id(self.transport)?;
        let image_config_id = self.image.config_id(device_config_id.len());
        Ok(go_nogo(
            false,
            false,
            image_firmware_id,
            device_firmware_id,
            image_config_id,
            &device_config_id,
        ))
    }

    /// Put the controller into bootloader mode and relearn its registers
    fn enter_flash_prog(&mut self) -> Result<()> {
        let t = self.transport;
        if self.controller.read_status(t)?.in_bootloader {
            return Ok(());
        }

        self.f01.write_interrupt_enable(t, &[])?;
        self.controller.write_command(t, FlashCommand::EnableFlashProg)?;
        self.controller.wait_for_idle(t, ENABLE_WAIT, false)?;
        if !self.controller.last_status().in_bootloader {
            log::error!("rmi4: device did not enter bootloader mode");
            return Err(ProtocolError::NotInBootloader.into());
        }

        let (f01, f34) = scan_flash_functions(t)?;
        self.f01 = F01::new(f01.bases());
        let version = BootloaderVersion::from_function_version(f34.entry.function_version())?;
        let timing = *self.controller.timing();
        self.controller = FlashController::probe(t, F34::new(f34.bases(), version), timing)?;

        self.f01.set_nosleep(t)?;
        thread::sleep(timing.settle_delay);
        log::info!("rmi4: entered bootloader mode ({})", self.controller.version());
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.controller.geometry().block_size as usize
    }

    fn image_blocks(&self, section: Section) -> u32 {
        (self.image.section_or_empty(section).len() / self.block_size()) as u32
    }

    fn check_size(&self, area: SizeCheck, section: Section, device: u16) -> Result<()> {
        let image = self.image_blocks(section);
        if image != device as u32 {
            log::error!("rmi4: {} size mismatch", area);
            return Err(Error::SizeMismatch {
                area,
                image,
                device: device as u32,
            });
        }
        Ok(())
    }

    fn write_section(&mut self, section: Section, cmd: FlashCommand) -> Result<()> {
        let image = self.image;
        let data = image.section_or_empty(section);
        self.progress.writing(section, data.len() / self.block_size());
        log::info!("rmi4: writing {}", section);
        self.controller
            .write_blocks(self.transport, data, cmd, &mut *self.progress)
    }

    fn erase_config(&mut self, area: ConfigArea) -> Result<()> {
        self.progress.erasing(area_section(area));
        self.controller.erase_config(self.transport, area)
    }

    fn erase_all(&mut self, geometry: &FlashGeometry) -> Result<()> {
        let t = self.transport;
        self.progress.erasing(Section::UiFirmware);
        if geometry.version == BootloaderVersion::V7 {
            self.controller.write_command(t, FlashCommand::EraseUiFirmware)?;
            self.controller.wait_for_idle(t, ERASE_WAIT, false)?;
            self.erase_config(ConfigArea::Ui)?;
        } else {
            self.controller.write_command(t, FlashCommand::EraseAll)?;
            match self.controller.wait_for_idle(t, ERASE_WAIT, false) {
                Err(Error::FlashTimeout {
                    status: STATUS_BAD_PARTITION_TABLE,
                    ..
                }) if geometry.version == BootloaderVersion::V8 => {
                    log::warn!("rmi4: erase reported a bad partition table, continuing");
                }
                other => other?,
            }
            if geometry.version == BootloaderVersion::V8 {
                return Ok(());
            }
        }

        if geometry.has_disp_config {
            self.erase_config(ConfigArea::Display)?;
        }
        if geometry.has_guest_code {
            self.progress.erasing(Section::GuestCode);
            self.controller.erase_guest_code(t)?;
        }
        Ok(())
    }

    fn check_flash_config(&self, geometry: &FlashGeometry) -> Result<()> {
        self.check_size(SizeCheck::FlashConfig, Section::FlashConfig, geometry.blocks.fl_config)
    }

    fn write_flash_config(&mut self, geometry: &FlashGeometry) -> Result<()> {
        self.check_flash_config(geometry)?;
        self.erase_config(ConfigArea::Flash)?;
        self.write_section(Section::FlashConfig, FlashCommand::WriteConfig(ConfigArea::Flash))?;
        self.f01
            .reset(self.transport, self.controller.timing().reset_delay)?;
        self.controller
            .wait_for_idle(self.transport, ENABLE_WAIT, false)
    }

    /// v7: replace the partition table, keeping the device's global parameters
    fn write_partition_table_v7(&mut self, geometry: &FlashGeometry) -> Result<()> {
        let t = self.transport;
        let saved = self
            .controller
            .read_blocks(t, ConfigArea::Bootloader, geometry.blocks.bl_config)?;
        self.erase_config(ConfigArea::Bootloader)?;
        self.write_flash_config(geometry)?;

        let len = (self.image_blocks(Section::BootloaderConfig) as usize * self.block_size())
            .min(saved.len());
        self.progress.writing(Section::BootloaderConfig, len / self.block_size());
        log::info!("rmi4: restoring bootloader config");
        self.controller.write_blocks(
            t,
            &saved[..len],
            FlashCommand::WriteConfig(ConfigArea::Bootloader),
            &mut *self.progress,
        )
    }

    /// v8: the flash config is written without erasing first
    fn write_partition_table_v8(&mut self, geometry: &FlashGeometry) -> Result<()> {
        self.check_flash_config(geometry)?;
        self.write_section(Section::FlashConfig, FlashCommand::WriteConfig(ConfigArea::Flash))?;
        self.controller
            .wait_for_idle(self.transport, ENABLE_WAIT, false)
    }

    /// Erase and program firmware and every config area
    fn reflash(&mut self) -> Result<()> {
        let geometry = self.controller.geometry().clone();
        let blocks = geometry.blocks;
        let with_disp = geometry.has_disp_config && self.image.contains(Section::DisplayConfig);
        let with_guest = geometry.has_guest_code && self.image.contains(Section::GuestCode);

        if !self.comparison.new_table {
            self.check_size(SizeCheck::UiFirmware, Section::UiFirmware, blocks.ui_firmware)?;
            self.check_size(SizeCheck::UiConfig, Section::UiConfig, blocks.ui_config)?;
            if with_disp {
                self.check_size(SizeCheck::DisplayConfig, Section::DisplayConfig, blocks.dp_config)?;
            }
            if with_guest {
                self.check_size(SizeCheck::GuestCode, Section::GuestCode, blocks.guest_code)?;
            }
        } else if geometry.version == BootloaderVersion::V7 {
            self.check_size(
                SizeCheck::BootloaderConfig,
                Section::BootloaderConfig,
                blocks.bl_config,
            )?;
        }

        self.erase_all(&geometry)?;

        if geometry.version == BootloaderVersion::V7 && self.comparison.new_table {
            self.write_partition_table_v7(&geometry)?;
        } else if geometry.version == BootloaderVersion::V8 {
            self.write_partition_table_v8(&geometry)?;
        }

        self.write_section(Section::UiFirmware, FlashCommand::WriteFirmware)?;
        if with_disp {
            self.write_section(
                Section::DisplayConfig,
                FlashCommand::WriteConfig(ConfigArea::Display),
            )?;
        }
        self.write_section(Section::UiConfig, FlashCommand::WriteConfig(ConfigArea::Ui))?;
        if with_guest {
            self.write_section(Section::GuestCode, FlashCommand::WriteGuestCode)?;
        }
        Ok(())
    }

    /// Erase and program the UI config only
    fn update_config(&mut self) -> Result<()> {
        let device = self.controller.geometry().blocks.ui_config;
        self.check_size(SizeCheck::UiConfig, Section::UiConfig, device)?;
        self.erase_config(ConfigArea::Ui)?;
        self.write_section(Section::UiConfig, FlashCommand::WriteConfig(ConfigArea::Ui))
    }
}
