//! Firmware update engine
//!
//! [`FlashController`] speaks the F34 register protocol of one bootloader
//! generation: status polling, command encoding and block transfers.
//! [`FlashSession`] sequences a complete update on top of it.

mod command;
mod controller;
mod session;

use std::time::Duration;

pub use command::{ConfigArea, FlashCommand};
pub use controller::FlashController;
pub use session::{go_nogo, FlashSession, UpdateOptions};

use crate::image::Section;

/// Poll budget after an enable or flash config write, in poll intervals
pub const ENABLE_WAIT: u32 = 200;

/// Poll budget after a block transfer, in poll intervals
pub const WRITE_WAIT: u32 = 3;

/// Poll budget after an erase, in poll intervals
pub const ERASE_WAIT: u32 = 1000;

/// Largest single payload write on partition table bootloaders
pub const MAX_WRITE_SIZE: usize = 64;

/// Sleep intervals used while flashing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashTiming {
    /// One poll step of the idle wait
    pub poll_interval: Duration,
    /// Pause after entering bootloader mode and before reading back config
    pub settle_delay: Duration,
    /// Pause after a software reset
    pub reset_delay: Duration,
}

impl Default for FlashTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
            settle_delay: Duration::from_millis(20),
            reset_delay: Duration::from_millis(200),
        }
    }
}

impl FlashTiming {
    /// Set the poll step
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the settle delay
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Set the reset delay
    pub fn with_reset_delay(mut self, delay: Duration) -> Self {
        self.reset_delay = delay;
        self
    }

    /// No sleeping at all, for simulated controllers
    pub fn immediate() -> Self {
        Self {
            poll_interval: Duration::ZERO,
            settle_delay: Duration::ZERO,
            reset_delay: Duration::ZERO,
        }
    }
}

/// What an update has to program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashArea {
    /// Device is up to date
    None,
    /// Firmware and every config area
    UiFirmware,
    /// UI config only
    UiConfig,
}

/// Result of a completed update request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Nothing was written
    UpToDate,
    /// The given area was programmed and the device rediscovered
    Updated(FlashArea),
}

/// Callback for progress reporting during an update
pub trait FlashProgress {
    /// Called before an erase command is issued
    fn erasing(&mut self, section: Section);

    /// Called when starting to program a section
    fn writing(&mut self, section: Section, blocks: usize);

    /// Called after each batch of blocks
    fn write_progress(&mut self, blocks_written: usize);

    /// Called when the update finished
    fn complete(&mut self, outcome: &UpdateOutcome);
}

/// A no-op progress reporter
pub struct NoProgress;

impl FlashProgress for NoProgress {
    fn erasing(&mut self, _section: Section) {}
    fn writing(&mut self, _section: Section, _blocks: usize) {}
    fn write_progress(&mut self, _blocks_written: usize) {}
    fn complete(&mut self, _outcome: &UpdateOutcome) {}
}

impl<T: FlashProgress + ?Sized> FlashProgress for &mut T {
    fn erasing(&mut self, section: Section) {
        (**self).erasing(section)
    }

    fn writing(&mut self, section: Section, blocks: usize) {
        (**self).writing(section, blocks)
    }

    fn write_progress(&mut self, blocks_written: usize) {
        (**self).write_progress(blocks_written)
    }

    fn complete(&mut self, outcome: &UpdateOutcome) {
        (**self).complete(outcome)
    }
}

/// Image section stored in a config area
pub(crate) fn area_section(area: ConfigArea) -> Section {
    match area {
        ConfigArea::Ui => Section::UiConfig,
        ConfigArea::Permanent => Section::PermanentConfig,
        ConfigArea::Bootloader => Section::BootloaderConfig,
        ConfigArea::Display => Section::DisplayConfig,
        ConfigArea::Flash => Section::FlashConfig,
        ConfigArea::UtilityParameter => Section::UtilityParameter(0),
    }
}
