//! Image command implementation

use rmi4_core::image::{FirmwareImage, ImageFormat};
use std::path::Path;

/// Show the header fields and section ranges of an image file
pub fn run_image(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let image = FirmwareImage::from_file(path)
        .map_err(|e| format!("Failed to load {}: {}", path.display(), e))?;

    println!("Image: {}", path.display());
    match image.format() {
        ImageFormat::Legacy(version) => println!("  Format:      legacy (0x{:02X})", version),
        ImageFormat::Container => println!("  Format:      container"),
    }
    println!("  Bootloader:  v{}", image.bl_version());
    println!("  Checksum:    0x{:08X}", image.checksum());
    if !image.product_id().is_empty() {
        println!("  Product:     {}", image.product_id());
    }
    match image.firmware_id() {
        Some(id) => println!("  Firmware id: {} (0x{:06X})", id, id),
        None => println!("  Firmware id: not declared"),
    }
    println!();

    println!("Sections:");
    for (section, range) in image.sections() {
        println!(
            "  {:20} 0x{:08X} - 0x{:08X} ({} bytes)",
            section.to_string(),
            range.offset,
            range.end(),
            range.len
        );
    }

    if let Some(table) = image.partition_table() {
        println!();
        println!("Partition table:");
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

    Ok(())
}
