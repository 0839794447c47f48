//! Info command implementation

use rmi4_core::device::Rmi4Device;
use rmi4_core::flash::FlashController;
use rmi4_core::function::FunctionKind;

/// Print the device identity and the discovered functions
pub fn run_info(device: &Rmi4Device) -> Result<(), Box<dyn std::error::Error>> {
    let topology = device.topology()?;
    let info = topology.info();

    println!("Controller:");
    println!("  Product:      {}", info.product_id);
    println!("  Manufacturer: {}", info.manufacturer_id);
    println!(
        "  Firmware id:  {} (0x{:06X})",
        info.firmware_id, info.firmware_id
    );
    println!(
        "  Sensor:       {} fingers, {}x{}",
        topology.max_fingers(),
        topology.max_x() as u32 + 1,
        topology.max_y() as u32 + 1
    );
    if topology.button_count() > 0 {
        println!("  Buttons:      {}", topology.button_count());
    }
    println!();

    println!("Functions:");
    for f in topology.functions() {
        println!(
            "  F{:02X} v{} page {}  query 0x{:04X} ctrl 0x{:04X} data 0x{:04X}  irq {}+{}  {}",
            f.number,
            f.version,
            f.page,
            f.bases.query,
            f.bases.control,
            f.bases.data,
            f.interrupt.offset,
            f.interrupt.count,
            f.name()
        );
    }
    println!();

    let flash = topology.flash()?;
    let t = device.transport();
    let controller = FlashController::probe(t, flash, device.config().flash_timing)?;
    let geometry = controller.geometry();
    let config_id = controller.read_config_id(t)?;

    println!("Flash:");
    println!("  Bootloader:   {}", geometry.version);
    println!("  Block size:   {} bytes", geometry.block_size);
    println!("  Firmware:     {} blocks", geometry.blocks.ui_firmware);
    println!("  UI config:    {} blocks", geometry.blocks.ui_config);
    if geometry.has_disp_config {
        println!("  Display cfg:  {} blocks", geometry.blocks.dp_config);
    }
    if geometry.has_guest_code {
        println!("  Guest code:   {} blocks", geometry.blocks.guest_code);
    }
    println!("  Config id:    {}", hex(&config_id));

    if let Some(table) = &geometry.partition_table {
        println!();
        println!("Partitions:");
        for entry in table.entries() {
            let name = entry
                .partition()
                .map(|p| format!("{:?}", p))
                .unwrap_or_else(|| format!("unknown 0x{:02X}", entry.id));
            println!(
                "  {:20} block {:5}  length {:5}",
                name, entry.address, entry.length
            );
        }
    }

    let interrupts = topology
        .functions()
        .iter()
        .filter(|f| !matches!(f.kind, FunctionKind::Sensor))
        .count();
    log::debug!(
        "{} functions handled, interrupt mask {}",
        interrupts,
        hex(topology.interrupt_mask())
    );

    Ok(())
}

/// Hex string without separators
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}
