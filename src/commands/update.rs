//! Update command implementation

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use rmi4_core::device::Rmi4Device;
use rmi4_core::flash::{FlashArea, FlashProgress, UpdateOptions, UpdateOutcome};
use rmi4_core::image::{FirmwareImage, Section};
use std::path::Path;
use std::time::Duration;

/// Progress reporter using indicatif progress bars
struct IndicatifProgress {
    multi: MultiProgress,
    current_bar: Option<ProgressBar>,
}

impl IndicatifProgress {
    fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            current_bar: None,
        }
    }

    fn create_bar(&mut self, total: u64, section: Section) {
        self.finish();
        let pb = self.multi.add(ProgressBar::new(total));
        pb.set_style(
            ProgressStyle::default_bar()
                .template(&format!(
                    "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos}}/{{len}} blocks {}",
                    section
                ))
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        self.current_bar = Some(pb);
    }

    fn create_spinner(&mut self, message: String) {
        self.finish();
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(100));
        self.current_bar = Some(pb);
    }

    fn finish(&mut self) {
        if let Some(pb) = self.current_bar.take() {
            pb.finish();
        }
    }
}

impl FlashProgress for IndicatifProgress {
    fn erasing(&mut self, section: Section) {
        self.create_spinner(format!("Erasing {}...", section));
    }

    fn writing(&mut self, section: Section, blocks: usize) {
        self.create_bar(blocks as u64, section);
    }

    fn write_progress(&mut self, blocks_written: usize) {
        if let Some(pb) = &self.current_bar {
            pb.set_position(blocks_written as u64);
        }
    }

    fn complete(&mut self, outcome: &UpdateOutcome) {
        self.finish();
        println!("{}", describe(outcome));
    }
}

fn describe(outcome: &UpdateOutcome) -> &'static str {
    match outcome {
        UpdateOutcome::UpToDate => "Device is up to date - no changes needed",
        UpdateOutcome::Updated(FlashArea::UiFirmware) => "Firmware and config updated",
        UpdateOutcome::Updated(FlashArea::UiConfig) => "Config updated",
        UpdateOutcome::Updated(FlashArea::None) => "Nothing was written",
    }
}

/// Run the update command
pub fn run_update(
    device: &Rmi4Device,
    image_path: &Path,
    options: &UpdateOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let image = FirmwareImage::from_file(image_path)
        .map_err(|e| format!("Failed to load {}: {}", image_path.display(), e))?;

    let before = device.info()?;
    println!(
        "Device {} firmware id {}, image {} firmware id {}",
        before.product_id,
        before.firmware_id,
        image.product_id(),
        options
            .firmware_id
            .or(image.firmware_id())
            .map(|id| id.to_string())
            .unwrap_or_else(|| "unknown".into())
    );
    if !image.product_id().is_empty() && image.product_id() != before.product_id {
        log::warn!(
            "Image is built for {}, device reports {}",
            image.product_id(),
            before.product_id
        );
    }

    let mut progress = IndicatifProgress::new();
    let outcome = device.update(&image, options, &mut progress)?;

    if let UpdateOutcome::Updated(_) = outcome {
        let after = device.info()?;
        println!("Device now reports firmware id {}", after.firmware_id);
    }
    Ok(())
}
