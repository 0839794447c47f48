//! Normalized per-finger touch state
//!
//! Both 2D report formats decode into the same slot array. A slot that was
//! touched and is no longer reported goes through exactly one "lifted"
//! cycle so the host can emit an up event for it.

use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, ProtocolError, Result};

/// State of one finger slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TouchSlot {
    /// Finger is on the sensor
    pub touched: bool,
    /// Finger left the sensor in the most recent cycle
    pub lifted: bool,
    /// X position
    pub x: u16,
    /// Y position
    pub y: u16,
    /// Contact width along X
    pub width_x: u8,
    /// Contact width along Y
    pub width_y: u8,
}

/// Position sample for one finger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Contact {
    /// X position
    pub x: u16,
    /// Y position
    pub y: u16,
    /// Contact width along X
    pub width_x: u8,
    /// Contact width along Y
    pub width_y: u8,
}

/// Shared touch report guarded by the report lock
#[derive(Debug, Clone, Default)]
pub struct TouchReport {
    slots: Vec<TouchSlot>,
    /// Objects reported by the object protocol in the previous cycle
    objects_present: usize,
    /// Last reported touch count
    touch_count: usize,
    buttons: Vec<bool>,
}

impl TouchReport {
    /// Allocate `fingers` idle slots
    pub fn new(fingers: usize) -> Self {
        Self {
            slots: vec![TouchSlot::default(); fingers],
            ..Default::default()
        }
    }

    /// Allocate button state for `count` buttons
    pub fn with_buttons(mut self, count: usize) -> Self {
        self.buttons = vec![false; count];
        self
    }

    /// All slots
    pub fn slots(&self) -> &[TouchSlot] {
        &self.slots
    }

    /// One slot
    pub fn slot(&self, index: usize) -> Option<&TouchSlot> {
        self.slots.get(index)
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when no slots are allocated
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Count returned by the last decode cycle
    pub fn touch_count(&self) -> usize {
        self.touch_count
    }

    /// Button states
    pub fn buttons(&self) -> &[bool] {
        &self.buttons
    }

    /// Clear the per-cycle lift markers before a new decode cycle
    pub fn begin_cycle(&mut self) {
        for slot in &mut self.slots {
            slot.lifted = false;
        }
    }

    /// Record a finger on the sensor
    pub fn touch(&mut self, index: usize, contact: Contact) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = TouchSlot {
                touched: true,
                lifted: false,
                x: contact.x,
                y: contact.y,
                width_x: contact.width_x,
                width_y: contact.width_y,
            };
        }
    }

    /// Lift one slot if it was touched
    pub fn lift(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            if slot.touched {
                slot.touched = false;
                slot.lifted = true;
            }
        }
    }

    /// Lift every touched slot
    pub fn lift_all(&mut self) {
        for index in 0..self.slots.len() {
            self.lift(index);
        }
    }

    /// Store the count of the finished cycle
    pub fn finish_cycle(&mut self, touch_count: usize) {
        self.touch_count = touch_count;
    }

    /// Objects remembered from the previous object-protocol cycle
    pub fn objects_present(&self) -> usize {
        self.objects_present
    }

    /// Remember the number of objects processed this cycle
    pub fn set_objects_present(&mut self, count: usize) {
        self.objects_present = count;
    }

    /// Replace the button states
    pub fn set_buttons(&mut self, bitmap: &[u8]) {
        for (i, state) in self.buttons.iter_mut().enumerate() {
            *state = bitmap
                .get(i / 8)
                .map(|b| b & (1 << (i % 8)) != 0)
                .unwrap_or(false);
        }
    }
}

/// Take the report lock
pub fn lock_report(report: &Mutex<TouchReport>) -> Result<MutexGuard<'_, TouchReport>> {
    report
        .lock()
        .map_err(|_| Error::Protocol(ProtocolError::LockPoisoned))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lift_marks_only_touched() {
        let mut report = TouchReport::new(3);
        report.touch(1, Contact { x: 10, y: 20, width_x: 1, width_y: 2 });
        report.lift_all();
        assert!(!report.slots()[0].lifted);
        assert!(report.slots()[1].lifted);
        assert!(!report.slots()[1].touched);

        report.begin_cycle();
        assert!(!report.slots()[1].lifted);
    }

    #[test]
    fn test_touch_out_of_range_ignored() {
        let mut report = TouchReport::new(1);
        report.touch(5, Contact::default());
        assert!(!report.slots()[0].touched);
    }

    #[test]
    fn test_button_bitmap() {
        let mut report = TouchReport::new(0).with_buttons(10);
        report.set_buttons(&[0b0000_0101, 0b0000_0010]);
        assert_eq!(
            report.buttons(),
            &[true, false, true, false, false, false, false, false, false, true]
        );
    }
}
