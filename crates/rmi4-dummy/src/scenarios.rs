//! End-to-end runs of the core stack against the simulated controller

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rmi4_core::device::{DeviceConfig, Rmi4Device};
use rmi4_core::error::{Error, ImageError, ProtocolError, SizeCheck};
use rmi4_core::flash::{
    ConfigArea, FlashArea, FlashProgress, FlashTiming, NoProgress, UpdateOptions, UpdateOutcome,
};
use rmi4_core::function::f34::BootloaderVersion;
use rmi4_core::image::partition::{PartitionEntry, PartitionId, PartitionTable};
use rmi4_core::image::{FirmwareImage, Section};
use rmi4_core::touch::{Contact, TouchReport};

use crate::image::ImageBuilder;
use crate::{DummyConfig, DummyController, FlashOp, TouchProtocol};

fn device_config() -> DeviceConfig {
    DeviceConfig::default()
        .with_flash_timing(FlashTiming::immediate())
        .with_poll_interval(Duration::from_millis(10))
}

fn probed(dummy: &DummyController) -> Rmi4Device {
    let device = Rmi4Device::new(dummy.transport(), device_config());
    device.probe().unwrap();
    dummy.clear_ops();
    device
}

/// Recorded operations without the partition table reads done by every probe
fn flash_ops(dummy: &DummyController) -> Vec<FlashOp> {
    dummy
        .ops()
        .into_iter()
        .filter(|op| {
            !matches!(
                op,
                FlashOp::Read {
                    partition: PartitionId::FlashConfig,
                    ..
                }
            )
        })
        .collect()
}

fn forced() -> UpdateOptions {
    UpdateOptions::default().with_force(true)
}

fn update(device: &Rmi4Device, image: &FirmwareImage, options: &UpdateOptions) -> rmi4_core::Result<UpdateOutcome> {
    device.update(image, options, &mut NoProgress)
}

fn legacy(version: BootloaderVersion) -> DummyConfig {
    DummyConfig {
        protocol: TouchProtocol::Legacy,
        bootloader: version,
        fingers: 5,
        max_x: 1023,
        max_y: 767,
        ..Default::default()
    }
}

fn contact(x: u16, y: u16) -> Contact {
    Contact {
        x,
        y,
        width_x: 3,
        width_y: 4,
    }
}

fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn test_forced_v6_update_order() {
    let dummy = DummyController::new(legacy(BootloaderVersion::V6));
    let device = probed(&dummy);
    let builder = ImageBuilder::new(&dummy.config()).fill(0x42);
    let image = builder.image().unwrap();

    let outcome = update(&device, &image, &forced()).unwrap();
    assert_eq!(outcome, UpdateOutcome::Updated(FlashArea::UiFirmware));
    assert_eq!(
        flash_ops(&dummy),
        vec![
            FlashOp::EnterBootloader,
            FlashOp::EraseAll,
            FlashOp::Erase(PartitionId::DisplayConfig),
            FlashOp::Write {
                partition: PartitionId::CoreCode,
                blocks: 8
            },
            FlashOp::Write {
                partition: PartitionId::DisplayConfig,
                blocks: 1
            },
            FlashOp::Write {
                partition: PartitionId::CoreConfig,
                blocks: 2
            },
        ]
    );
    assert_eq!(dummy.area(PartitionId::CoreCode).unwrap(), builder.firmware());
    assert_eq!(dummy.area(PartitionId::CoreConfig).unwrap(), builder.ui_config());
    assert!(!dummy.in_bootloader());
    assert!(dummy.is_configured());
    assert_eq!(device.max_touchpoints().unwrap(), 5);
}

#[test]
fn test_forced_v5_update_without_display_config() {
    let dummy = DummyController::new(DummyConfig {
        display_config_blocks: 0,
        ..legacy(BootloaderVersion::V5)
    });
    let device = probed(&dummy);
    let image = ImageBuilder::new(&dummy.config()).image().unwrap();

    update(&device, &image, &forced()).unwrap();
    assert_eq!(
        flash_ops(&dummy),
        vec![
            FlashOp::EnterBootloader,
            FlashOp::EraseAll,
            FlashOp::Write {
                partition: PartitionId::CoreCode,
                blocks: 8
            },
            FlashOp::Write {
                partition: PartitionId::CoreConfig,
                blocks: 2
            },
        ]
    );
    assert!(!dummy.in_bootloader());
}

#[test]
fn test_matching_ids_leave_flash_untouched() {
    let dummy = DummyController::new(legacy(BootloaderVersion::V6));
    let device = probed(&dummy);
    let image = ImageBuilder::new(&dummy.config()).image().unwrap();

    let outcome = update(&device, &image, &UpdateOptions::default()).unwrap();
    assert_eq!(outcome, UpdateOutcome::UpToDate);
    assert!(dummy.ops().is_empty());
}

#[test]
fn test_newer_config_id_updates_config_only() {
    let dummy = DummyController::new(legacy(BootloaderVersion::V6));
    let device = probed(&dummy);
    let image = ImageBuilder::new(&dummy.config())
        .config_id(&[0, 0, 0, 2])
        .image()
        .unwrap();

    let outcome = update(&device, &image, &UpdateOptions::default()).unwrap();
    assert_eq!(outcome, UpdateOutcome::Updated(FlashArea::UiConfig));
    assert_eq!(
        flash_ops(&dummy),
        vec![
            FlashOp::EnterBootloader,
            FlashOp::Erase(PartitionId::CoreConfig),
            FlashOp::Write {
                partition: PartitionId::CoreConfig,
                blocks: 2
            },
        ]
    );
    assert_eq!(&dummy.area(PartitionId::CoreConfig).unwrap()[..4], &[0, 0, 0, 2]);

    // the same image is now up to date
    dummy.clear_ops();
    let outcome = update(&device, &image, &UpdateOptions::default()).unwrap();
    assert_eq!(outcome, UpdateOutcome::UpToDate);
    assert!(flash_ops(&dummy).is_empty());
}

#[test]
fn test_older_config_id_is_not_written() {
    let dummy = DummyController::new(DummyConfig {
        config_id: vec![0, 0, 0, 5],
        ..Default::default()
    });
    let device = probed(&dummy);
    let image = ImageBuilder::new(&dummy.config())
        .config_id(&[0, 0, 0, 4])
        .image()
        .unwrap();

    let outcome = update(&device, &image, &UpdateOptions::default()).unwrap();
    assert_eq!(outcome, UpdateOutcome::UpToDate);
    assert!(flash_ops(&dummy).is_empty());
}

#[test]
fn test_different_firmware_id_reflashes() {
    let dummy = DummyController::new_default();
    let device = probed(&dummy);
    let image = ImageBuilder::new(&dummy.config())
        .firmware_id(dummy.config().firmware_id + 1)
        .image()
        .unwrap();

    let outcome = update(&device, &image, &UpdateOptions::default()).unwrap();
    assert_eq!(outcome, UpdateOutcome::Updated(FlashArea::UiFirmware));
}

#[test]
fn test_caller_firmware_id_overrides_image() {
    let dummy = DummyController::new_default();
    let device = probed(&dummy);
    let image = ImageBuilder::new(&dummy.config())
        .firmware_id(1)
        .image()
        .unwrap();
    let options = UpdateOptions::default().with_firmware_id(dummy.config().firmware_id);

    let outcome = update(&device, &image, &options).unwrap();
    assert_eq!(outcome, UpdateOutcome::UpToDate);
}

#[test]
fn test_missing_firmware_id_aborts() {
    let dummy = DummyController::new_default();
    let device = probed(&dummy);
    let image = ImageBuilder::new(&dummy.config())
        .without_firmware_id()
        .image()
        .unwrap();

    let result = update(&device, &image, &UpdateOptions::default());
    assert_eq!(result, Err(ImageError::MissingFirmwareId.into()));
    assert!(flash_ops(&dummy).is_empty());

    // forcing does not need an id
    assert!(update(&device, &image, &forced()).is_ok());
}

#[test]
fn test_forced_v7_update_order() {
    let dummy = DummyController::new_default();
    let device = probed(&dummy);
    let builder = ImageBuilder::new(&dummy.config()).fill(0x99);
    let image = builder.image().unwrap();

    let outcome = update(&device, &image, &forced()).unwrap();
    assert_eq!(outcome, UpdateOutcome::Updated(FlashArea::UiFirmware));
    assert_eq!(
        flash_ops(&dummy),
        vec![
            FlashOp::EnterBootloader,
            FlashOp::Erase(PartitionId::CoreCode),
            FlashOp::Erase(PartitionId::CoreConfig),
            FlashOp::Erase(PartitionId::DisplayConfig),
            FlashOp::Write {
                partition: PartitionId::CoreCode,
                blocks: 8
            },
            FlashOp::Write {
                partition: PartitionId::DisplayConfig,
                blocks: 1
            },
            FlashOp::Write {
                partition: PartitionId::CoreConfig,
                blocks: 2
            },
        ]
    );
    assert_eq!(dummy.area(PartitionId::CoreCode).unwrap(), builder.firmware());
    assert_eq!(
        dummy.area(PartitionId::DisplayConfig).unwrap(),
        builder.display_config()
    );
    assert!(!dummy.in_bootloader());
    assert_eq!(device.max_touchpoints().unwrap(), 10);
}

#[test]
fn test_v7_config_update_uses_32_byte_config_id() {
    let dummy = DummyController::new_default();
    let device = probed(&dummy);
    let image = ImageBuilder::new(&dummy.config())
        .config_id(&[0, 0, 0, 2])
        .image()
        .unwrap();

    let outcome = update(&device, &image, &UpdateOptions::default()).unwrap();
    assert_eq!(outcome, UpdateOutcome::Updated(FlashArea::UiConfig));
    assert_eq!(
        flash_ops(&dummy),
        vec![
            FlashOp::EnterBootloader,
            FlashOp::Erase(PartitionId::CoreConfig),
            FlashOp::Write {
                partition: PartitionId::CoreConfig,
                blocks: 2
            },
        ]
    );
}

/// Device table with core code and core config swapped
fn swapped_table(config: &DummyConfig) -> PartitionTable {
    let table = config.partition_table();
    let code = table.address(PartitionId::CoreCode);
    let entries = table
        .entries()
        .iter()
        .map(|e| match e.partition() {
            Some(PartitionId::CoreConfig) => PartitionEntry { address: code, ..*e },
            Some(PartitionId::CoreCode) => PartitionEntry {
                address: code + config.config_blocks,
                ..*e
            },
            _ => *e,
        })
        .collect();
    PartitionTable::from_entries(entries)
}

#[test]
fn test_v7_new_partition_table_preserves_global_parameters() {
    let dummy = DummyController::new_default();
    let config = dummy.config();
    let device = probed(&dummy);
    let saved = dummy.area(PartitionId::GlobalParameters).unwrap();
    let table = swapped_table(&config);
    let image = ImageBuilder::new(&config)
        .partition_table(table.clone())
        .image()
        .unwrap();

    update(&device, &image, &forced()).unwrap();
    assert_eq!(
        flash_ops(&dummy),
        vec![
            FlashOp::EnterBootloader,
            FlashOp::Erase(PartitionId::CoreCode),
            FlashOp::Erase(PartitionId::CoreConfig),
            FlashOp::Erase(PartitionId::DisplayConfig),
            FlashOp::Read {
                partition: PartitionId::GlobalParameters,
                blocks: 1
            },
            FlashOp::Erase(PartitionId::GlobalParameters),
            FlashOp::Erase(PartitionId::FlashConfig),
            FlashOp::Write {
                partition: PartitionId::FlashConfig,
                blocks: 4
            },
            FlashOp::Write {
                partition: PartitionId::GlobalParameters,
                blocks: 1
            },
            FlashOp::Write {
                partition: PartitionId::CoreCode,
                blocks: 8
            },
            FlashOp::Write {
                partition: PartitionId::DisplayConfig,
                blocks: 1
            },
            FlashOp::Write {
                partition: PartitionId::CoreConfig,
                blocks: 2
            },
        ]
    );
    assert_eq!(dummy.area(PartitionId::GlobalParameters).unwrap(), saved);
    let written = PartitionTable::parse(
        &dummy.area(PartitionId::FlashConfig).unwrap(),
        table.entries().len(),
    );
    assert_eq!(written, table);
}

#[test]
fn test_moved_fixed_partition_is_incompatible() {
    let dummy = DummyController::new_default();
    let config = dummy.config();
    let device = probed(&dummy);
    let entries = config
        .partition_table()
        .entries()
        .iter()
        .map(|e| match e.partition() {
            Some(PartitionId::GlobalParameters) => PartitionEntry {
                address: e.address + 100,
                ..*e
            },
            _ => *e,
        })
        .collect();
    let image = ImageBuilder::new(&config)
        .partition_table(PartitionTable::from_entries(entries))
        .image()
        .unwrap();

    let result = update(&device, &image, &forced());
    assert_eq!(
        result,
        Err(ProtocolError::IncompatiblePartitionTable.into())
    );
    assert!(flash_ops(&dummy).is_empty());
}

#[test]
fn test_v8_tolerates_bad_partition_table_status() {
    let dummy = DummyController::new(DummyConfig {
        bootloader: BootloaderVersion::V8,
        ..Default::default()
    });
    let device = probed(&dummy);
    dummy.report_bad_partition_table();
    let image = ImageBuilder::new(&dummy.config()).image().unwrap();

    let outcome = update(&device, &image, &forced()).unwrap();
    assert_eq!(outcome, UpdateOutcome::Updated(FlashArea::UiFirmware));
    assert_eq!(
        flash_ops(&dummy),
        vec![
            FlashOp::EnterBootloader,
            FlashOp::EraseAll,
            FlashOp::Write {
                partition: PartitionId::FlashConfig,
                blocks: 4
            },
            FlashOp::Write {
                partition: PartitionId::CoreCode,
                blocks: 8
            },
            FlashOp::Write {
                partition: PartitionId::DisplayConfig,
                blocks: 1
            },
            FlashOp::Write {
                partition: PartitionId::CoreConfig,
                blocks: 2
            },
        ]
    );
    assert!(!dummy.in_bootloader());
}

#[test]
fn test_bootloader_mismatch_is_rejected() {
    let dummy = DummyController::new_default();
    let device = probed(&dummy);
    let image = ImageBuilder::new(&legacy(BootloaderVersion::V6))
        .image()
        .unwrap();

    let result = update(&device, &image, &forced());
    assert_eq!(
        result,
        Err(ProtocolError::BootloaderMismatch { device: 7, image: 6 }.into())
    );
    assert!(flash_ops(&dummy).is_empty());
}

#[test]
fn test_size_mismatch_resets_device() {
    let dummy = DummyController::new(legacy(BootloaderVersion::V6));
    let device = probed(&dummy);
    let image = ImageBuilder::new(&DummyConfig {
        firmware_blocks: 9,
        ..dummy.config()
    })
    .image()
    .unwrap();

    let result = update(&device, &image, &forced());
    assert_eq!(
        result,
        Err(Error::SizeMismatch {
            area: SizeCheck::UiFirmware,
            image: 9,
            device: 8,
        })
    );
    assert_eq!(flash_ops(&dummy), vec![FlashOp::EnterBootloader]);
    assert!(!dummy.in_bootloader());
}

#[test]
fn test_stalled_erase_times_out_and_resets() {
    let dummy = DummyController::new_default();
    let device = probed(&dummy);
    dummy.stall_flash(Some(0x04));
    let image = ImageBuilder::new(&dummy.config()).image().unwrap();

    let result = update(&device, &image, &forced());
    assert!(matches!(
        result,
        Err(Error::FlashTimeout { command: 0x04, .. })
    ));
    assert_eq!(flash_ops(&dummy), vec![FlashOp::EnterBootloader]);
    assert!(!dummy.in_bootloader());

    // the device keeps working after the failed attempt
    dummy.stall_flash(None);
    device.reinit().unwrap();
    assert!(dummy.is_configured());
}

#[test]
fn test_read_config_areas() {
    let dummy = DummyController::new_default();
    let device = probed(&dummy);
    let config = device.read_config(ConfigArea::Ui).unwrap();
    assert_eq!(config.len(), 32);
    assert_eq!(&config[..4], &[0, 0, 0, 1]);

    let global = device.read_config(ConfigArea::Bootloader).unwrap();
    assert_eq!(global, vec![0x5A; 16]);

    let dummy = DummyController::new(legacy(BootloaderVersion::V6));
    let device = probed(&dummy);
    let display = device.read_config(ConfigArea::Display).unwrap();
    assert_eq!(display, vec![0xD5; 16]);
    assert!(!dummy.in_bootloader());
}

#[test]
fn test_transport_retries_failed_transfers() {
    let dummy = DummyController::new_default();
    dummy.fail_next(3);
    let device = Rmi4Device::new(dummy.transport(), device_config());
    device.probe().unwrap();
    assert_eq!(device.info().unwrap().product_id, "S3706");
}

/// Parks the updating thread in its first erase until released
struct EraseGate {
    entered: Option<Sender<()>>,
    release: Option<Receiver<()>>,
}

impl FlashProgress for EraseGate {
    fn erasing(&mut self, _section: Section) {
        if let (Some(entered), Some(release)) = (self.entered.take(), self.release.take()) {
            let _ = entered.send(());
            let _ = release.recv();
        }
    }
    fn writing(&mut self, _section: Section, _blocks: usize) {}
    fn write_progress(&mut self, _blocks_written: usize) {}
    fn complete(&mut self, _outcome: &UpdateOutcome) {}
}

#[test]
fn test_update_in_progress_blocks_updates_and_touch_service() {
    let dummy = DummyController::new(legacy(BootloaderVersion::V6));
    let device = probed(&dummy);
    let image = ImageBuilder::new(&dummy.config()).fill(0x42).image().unwrap();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let mut gate = EraseGate {
        entered: Some(entered_tx),
        release: Some(release_rx),
    };

    thread::scope(|scope| {
        let (device, image) = (&device, &image);
        let first = scope.spawn(move || device.update(image, &forced(), &mut gate));
        entered_rx.recv().unwrap();

        let ops = flash_ops(&dummy);
        assert_eq!(ops, vec![FlashOp::EnterBootloader]);
        assert_eq!(update(device, image, &forced()), Err(Error::Busy));
        assert_eq!(flash_ops(&dummy), ops);

        dummy.set_contacts(&[contact(100, 200)]);
        let reads = dummy.bus_reads();
        let mut frames = 0;
        device
            .service_once(&mut |_: &TouchReport, _: usize| frames += 1)
            .unwrap();
        assert_eq!(frames, 0);
        assert_eq!(dummy.bus_reads(), reads);

        release_tx.send(()).unwrap();
        assert_eq!(
            first.join().unwrap(),
            Ok(UpdateOutcome::Updated(FlashArea::UiFirmware))
        );
    });

    // the rejected request was not queued behind the first one
    assert_eq!(
        flash_ops(&dummy)
            .iter()
            .filter(|op| **op == FlashOp::EnterBootloader)
            .count(),
        1
    );
}

#[test]
fn test_service_once_reports_legacy_touch_and_buttons() {
    let dummy = DummyController::new(DummyConfig {
        buttons: 3,
        ..legacy(BootloaderVersion::V6)
    });
    let device = probed(&dummy);
    let mut frames = Vec::new();

    dummy.set_contacts(&[contact(100, 200), contact(1000, 700)]);
    device
        .service_once(&mut |_: &TouchReport, touched: usize| frames.push(touched))
        .unwrap();
    assert_eq!(frames, vec![2]);
    assert_eq!(device.coords(0).unwrap(), Some((100, 200)));
    assert_eq!(device.coords(1).unwrap(), Some((1000, 700)));

    dummy.press_buttons(0b010);
    device
        .service_once(&mut |_: &TouchReport, touched: usize| frames.push(touched))
        .unwrap();
    assert!(device.button_state(1).unwrap());
    assert!(!device.button_state(0).unwrap());
}

#[test]
fn test_pump_delivers_object_reports() {
    let dummy = DummyController::new_default();
    let frames = Arc::new(Mutex::new(Vec::new()));
    let sink_frames = Arc::clone(&frames);
    let mut device = Rmi4Device::new(dummy.transport(), device_config());
    device
        .initialize(dummy.attention(), move |_: &TouchReport, touched: usize| {
            sink_frames.lock().unwrap().push(touched)
        })
        .unwrap();

    dummy.set_contacts(&[contact(10, 20), contact(30, 40), contact(50, 60)]);
    assert!(wait_for(|| frames.lock().unwrap().contains(&3)));
    assert!(device.is_contact_down(2).unwrap());
    assert_eq!(device.coords(1).unwrap(), Some((30, 40)));

    dummy.release_all();
    assert!(wait_for(|| frames.lock().unwrap().last() == Some(&0)));
    assert!(!device.is_contact_down(0).unwrap());

    device.teardown();
    assert!(!device.is_pumping());
}

#[test]
fn test_pump_reconfigures_after_spontaneous_reset() {
    let dummy = DummyController::new_default();
    let mut device = Rmi4Device::new(dummy.transport(), device_config());
    device
        .initialize(dummy.attention(), |_: &TouchReport, _: usize| {})
        .unwrap();
    assert!(dummy.is_configured());

    dummy.trigger_reset();
    assert!(wait_for(|| dummy.is_configured()));
    assert_eq!(dummy.interrupt_enable(), 0x07);
    device.teardown();
}
