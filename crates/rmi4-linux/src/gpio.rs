//! Attention line on a GPIO character device
//!
//! The controller pulls its attention output low while an interrupt is
//! pending. The line is requested active-low with edge detection on the
//! assertion, so a logical rising edge wakes the pump. Because the line is
//! level-like, [`GpioAttention::unmask`] samples it after servicing and
//! reports a pending assertion on the next wait when it is still held.

use crate::error::{LinuxError, Result};

use gpiocdev::line::{EdgeDetection, Offset, Value};
use gpiocdev::request::{Config, Request};

use rmi4_core::bus::Attention;
use rmi4_core::error::{Error as CoreError, Result as CoreResult};

use std::time::Duration;

/// GPIO chip and line offset of the attention signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionLine {
    /// Chip device path (e.g., "/dev/gpiochip0")
    pub chip: String,
    /// Line offset on the chip
    pub offset: Offset,
}

impl AttentionLine {
    /// Create a line description
    pub fn new(chip: impl Into<String>, offset: Offset) -> Self {
        Self {
            chip: chip.into(),
            offset,
        }
    }

    /// Parse `chip:line`, where chip is a path, `gpiochipN` or `N`
    pub fn parse(value: &str) -> std::result::Result<Self, String> {
        let (chip, line) = value
            .rsplit_once(':')
            .ok_or_else(|| format!("Invalid irq value: {} (expected chip:line)", value))?;
        let offset = line
            .parse()
            .map_err(|_| format!("Invalid irq line: {}", line))?;
        let chip = if chip.starts_with('/') {
            chip.to_string()
        } else if chip.starts_with("gpiochip") {
            format!("/dev/{}", chip)
        } else if chip.parse::<u32>().is_ok() {
            format!("/dev/gpiochip{}", chip)
        } else {
            return Err(format!("Invalid irq chip: {}", chip));
        };
        Ok(Self { chip, offset })
    }
}

/// Attention source backed by GPIO edge events
pub struct GpioAttention {
    request: Request,
    offset: Offset,
    pending: bool,
}

impl GpioAttention {
    /// Request the line as an active-low input with edge detection
    pub fn open(line: &AttentionLine) -> Result<Self> {
        log::debug!(
            "linux_gpio: Requesting attention line {} on {}",
            line.offset,
            line.chip
        );

        let mut config = Config::default();
        config
            .with_line(line.offset)
            .as_input()
            .as_active_low()
            .with_edge_detection(EdgeDetection::RisingEdge);

        let request = Request::from_config(config)
            .on_chip(&line.chip)
            .with_consumer("rmi4")
            .request()
            .map_err(|e| LinuxError::LineRequestFailed {
                chip: line.chip.clone(),
                offset: line.offset,
                source: e,
            })?;

        log::info!(
            "linux_gpio: Attention on {} line {}",
            line.chip,
            line.offset
        );

        let mut attention = Self {
            request,
            offset: line.offset,
            pending: false,
        };
        // an interrupt raised before the request carries no edge
        attention.pending = attention.asserted()?;
        Ok(attention)
    }

    fn asserted(&self) -> Result<bool> {
        let value = self
            .request
            .value(self.offset)
            .map_err(LinuxError::EdgeEventFailed)?;
        Ok(value == Value::Active)
    }

    fn drain(&mut self) -> Result<()> {
        while self
            .request
            .has_edge_event()
            .map_err(LinuxError::EdgeEventFailed)?
        {
            let event = self
                .request
                .read_edge_event()
                .map_err(LinuxError::EdgeEventFailed)?;
            log::trace!("linux_gpio: {:?} edge on line {}", event.kind, event.offset);
        }
        Ok(())
    }

    fn wait_edge(&mut self, timeout: Duration) -> Result<bool> {
        if self.pending {
            self.pending = false;
            self.drain()?;
            return Ok(true);
        }
        let ready = self
            .request
            .wait_edge_event(timeout)
            .map_err(LinuxError::EdgeEventFailed)?;
        if ready {
            self.drain()?;
        }
        Ok(ready)
    }
}

fn to_core(e: LinuxError) -> CoreError {
    log::warn!("linux_gpio: {}", e);
    CoreError::Transfer
}

impl Attention for GpioAttention {
    fn wait(&mut self, timeout: Duration) -> CoreResult<bool> {
        self.wait_edge(timeout).map_err(to_core)
    }

    fn unmask(&mut self) -> CoreResult<()> {
        self.pending = self.asserted().map_err(to_core)?;
        if self.pending {
            log::trace!("linux_gpio: line still asserted after service");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chip_forms() {
        assert_eq!(
            AttentionLine::parse("gpiochip1:5").unwrap(),
            AttentionLine::new("/dev/gpiochip1", 5)
        );
        assert_eq!(
            AttentionLine::parse("2:7").unwrap(),
            AttentionLine::new("/dev/gpiochip2", 7)
        );
        assert_eq!(
            AttentionLine::parse("/dev/gpiochip0:17").unwrap(),
            AttentionLine::new("/dev/gpiochip0", 17)
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(AttentionLine::parse("17").is_err());
        assert!(AttentionLine::parse("gpiochip0:x").is_err());
        assert!(AttentionLine::parse("chip:3").is_err());
    }
}
