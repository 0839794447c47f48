//! Reset command implementation

use rmi4_core::device::Rmi4Device;

/// Reset the controller, rediscover it and report what came back
pub fn run_reset(device: &Rmi4Device) -> Result<(), Box<dyn std::error::Error>> {
    device.reinit()?;
    let info = device.info()?;
    println!(
        "Reset complete: {} firmware id {}, {} fingers",
        info.product_id,
        info.firmware_id,
        device.max_touchpoints()?
    );
    Ok(())
}
