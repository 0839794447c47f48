//! Watch command implementation

use rmi4_core::bus::Attention;
use rmi4_core::device::Rmi4Device;
use rmi4_core::touch::TouchReport;
use std::thread;
use std::time::{Duration, Instant};

/// One line per decoded frame: finger slots that are down and pressed buttons
fn format_frame(report: &TouchReport, touched: usize) -> String {
    let mut line = format!("{} down", touched);
    for (i, slot) in report.slots().iter().enumerate() {
        if slot.touched {
            line.push_str(&format!(
                "  [{}] {},{} w{}x{}",
                i, slot.x, slot.y, slot.width_x, slot.width_y
            ));
        } else if slot.lifted {
            line.push_str(&format!("  [{}] up", i));
        }
    }
    let pressed: Vec<String> = report
        .buttons()
        .iter()
        .enumerate()
        .filter(|(_, down)| **down)
        .map(|(i, _)| i.to_string())
        .collect();
    if !pressed.is_empty() {
        line.push_str(&format!("  buttons {}", pressed.join(",")));
    }
    line
}

/// Run the event pump and print every frame
pub fn run_watch(
    device: &mut Rmi4Device,
    attention: Box<dyn Attention + Send>,
    seconds: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    device.initialize(attention, |report: &TouchReport, touched: usize| {
        println!("{}", format_frame(report, touched));
    })?;

    let info = device.info()?;
    println!(
        "Watching {} ({} fingers, {}x{}), press Ctrl-C to stop",
        info.product_id,
        device.max_touchpoints()?,
        device.width()? as u32 + 1,
        device.height()? as u32 + 1
    );

    let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
    while deadline.map_or(true, |d| Instant::now() < d) {
        if !device.is_pumping() {
            device.teardown();
            return Err("event pump stopped".into());
        }
        thread::sleep(Duration::from_millis(100));
    }

    device.teardown();
    Ok(())
}
