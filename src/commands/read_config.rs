//! Read-config command implementation

use rmi4_core::device::Rmi4Device;
use rmi4_core::flash::ConfigArea;
use std::fs;
use std::path::Path;

/// Hex dump with 16 bytes per line
fn hex_dump(data: &[u8]) -> String {
    data.chunks(16)
        .enumerate()
        .map(|(i, chunk)| {
            let bytes: Vec<String> = chunk.iter().map(|b| format!("{:02X}", b)).collect();
            format!("{:06X}: {}", i * 16, bytes.join(" "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Read a config area and write it to a file or stdout
pub fn run_read_config(
    device: &Rmi4Device,
    area: ConfigArea,
    output: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let data = device.read_config(area)?;
    if data.is_empty() {
        return Err(format!("Device has no {} area", area).into());
    }

    match output {
        Some(path) => {
            fs::write(path, &data)?;
            println!(
                "Read {} bytes of {} config to {}",
                data.len(),
                area,
                path.display()
            );
        }
        None => println!("{}", hex_dump(&data)),
    }
    Ok(())
}
