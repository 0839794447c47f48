//! F11: 2D sensor, legacy report format
//!
//! Finger state is a bitmap of 2-bit codes (4 fingers per register)
//! followed by one 5-byte record per finger.

use std::sync::Mutex;

use crate::error::Result;
use crate::pdt::BaseAddresses;
use crate::touch::{lock_report, Contact, TouchReport};
use crate::transport::RmiTransport;

/// Size of query registers 0-5
const QUERY_0_5_LEN: usize = 6;

/// Control register holding the sensor extents
const CTRL_MAX_XY_OFFSET: u16 = 6;

/// Size of one finger data record
pub const FINGER_RECORD_LEN: usize = 5;

/// Widths are reported in 4 bits
pub const MAX_TOUCH_WIDTH: u8 = 15;

/// Finger status codes in the 2-bit bitmap
mod status {
    pub const PRESENT_ACCURATE: u8 = 0x01;
    pub const PRESENT_INACCURATE: u8 = 0x02;
}

/// Legacy 2D sensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct F11Sensor {
    bases: BaseAddresses,
    fingers: usize,
    max_x: u16,
    max_y: u16,
}

/// Decode the finger count field of query 1
fn fingers_from_query(code: u8) -> usize {
    match code & 0x07 {
        n @ 0..=4 => n as usize + 1,
        5 => 10,
        _ => 0,
    }
}

/// Decode one finger record
pub fn decode_finger(record: &[u8; FINGER_RECORD_LEN]) -> Contact {
    Contact {
        x: (record[0] as u16) << 4 | (record[2] & 0x0F) as u16,
        y: (record[1] as u16) << 4 | (record[2] >> 4) as u16,
        width_x: record[3] & 0x0F,
        width_y: record[3] >> 4,
    }
}

impl F11Sensor {
    /// Read finger count and sensor extents
    pub fn init(transport: &RmiTransport, bases: BaseAddresses) -> Result<Self> {
        let mut query = [0u8; QUERY_0_5_LEN];
        transport.read(bases.query, &mut query)?;
        let fingers = fingers_from_query(query[1]);

        let mut ctrl = [0u8; 4];
        transport.read(bases.control + CTRL_MAX_XY_OFFSET, &mut ctrl)?;
        let max_x = ctrl[0] as u16 | ((ctrl[1] & 0x0F) as u16) << 8;
        let max_y = ctrl[2] as u16 | ((ctrl[3] & 0x0F) as u16) << 8;

        log::debug!(
            "rmi4: F11 {} fingers, max x {}, max y {}",
            fingers,
            max_x,
            max_y
        );

        Ok(Self {
            bases,
            fingers,
            max_x,
            max_y,
        })
    }

    /// Number of finger slots
    pub fn fingers(&self) -> usize {
        self.fingers
    }

    /// Maximum X coordinate
    pub fn max_x(&self) -> u16 {
        self.max_x
    }

    /// Maximum Y coordinate
    pub fn max_y(&self) -> u16 {
        self.max_y
    }

    fn status_registers(&self) -> usize {
        self.fingers.div_ceil(4)
    }

    /// Decode one report into the shared slots
    ///
    /// Returns the number of fingers currently touching.
    pub fn report(&self, transport: &RmiTransport, report: &Mutex<TouchReport>) -> Result<usize> {
        let nregs = self.status_registers();
        let status = transport.read_vec(self.bases.data, nregs)?;

        let mut present = Vec::new();
        for finger in 0..self.fingers {
            let code = (status[finger / 4] >> ((finger % 4) * 2)) & 0x03;
            if code == status::PRESENT_ACCURATE || code == status::PRESENT_INACCURATE {
                let addr = self.bases.data + (nregs + finger * FINGER_RECORD_LEN) as u16;
                let mut record = [0u8; FINGER_RECORD_LEN];
                transport.read(addr, &mut record)?;
                present.push((finger, decode_finger(&record)));
            }
        }

        let mut report = lock_report(report)?;
        report.begin_cycle();
        let mut next = present.iter().peekable();
        for finger in 0..self.fingers {
            match next.peek() {
                Some((index, contact)) if *index == finger => {
                    log::trace!(
                        "rmi4: F11 finger {} x {} y {} wx {} wy {}",
                        finger,
                        contact.x,
                        contact.y,
                        contact.width_x,
                        contact.width_y
                    );
                    report.touch(finger, *contact);
                    next.next();
                }
                _ => report.lift(finger),
            }
        }
        if present.is_empty() {
            log::trace!("rmi4: F11 fingers left");
        }
        report.finish_cycle(present.len());
        Ok(present.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBus;

    fn bases() -> BaseAddresses {
        BaseAddresses {
            query: 0x20,
            command: 0x2F,
            control: 0x30,
            data: 0x40,
        }
    }

    fn sensor(bus: &MockBus, finger_code: u8) -> F11Sensor {
        bus.poke(0x20, &[0x00, finger_code, 0, 0, 0, 0]);
        bus.poke(0x36, &[0x80, 0x07, 0x38, 0x04]);
        F11Sensor::init(&bus.transport(), bases()).unwrap()
    }

    #[test]
    fn test_init_reads_geometry() {
        let bus = MockBus::new();
        let s = sensor(&bus, 4);
        assert_eq!(s.fingers(), 5);
        assert_eq!(s.max_x(), 0x780);
        assert_eq!(s.max_y(), 0x438);

        let bus = MockBus::new();
        assert_eq!(sensor(&bus, 5).fingers(), 10);
    }

    #[test]
    fn test_decode_finger_record() {
        let c = decode_finger(&[0x12, 0x34, 0x65, 0x3A, 0x50]);
        assert_eq!(c.x, 0x125);
        assert_eq!(c.y, 0x346);
        assert_eq!(c.width_x, 0x0A);
        assert_eq!(c.width_y, 0x03);
    }

    #[test]
    fn test_reports_only_present_fingers() {
        let bus = MockBus::new();
        let s = sensor(&bus, 4); // 5 fingers, 2 status registers
        let transport = bus.transport();
        let report = Mutex::new(TouchReport::new(s.fingers()));

        // finger 0 accurate, finger 2 inaccurate, finger 3 reserved code
        bus.poke(0x40, &[0b1110_0001, 0x00]);
        bus.poke(0x42, &[0x10, 0x20, 0x00, 0x11, 0x30]);
        bus.poke(0x42 + 10, &[0x30, 0x40, 0x00, 0x22, 0x30]);

        assert_eq!(s.report(&transport, &report).unwrap(), 2);
        let r = report.lock().unwrap();
        let touched: Vec<bool> = r.slots().iter().map(|s| s.touched).collect();
        assert_eq!(touched, vec![true, false, true, false, false]);
        assert_eq!(r.slots()[2].x, 0x300);
    }

    #[test]
    fn test_zero_bitmap_lifts_all() {
        let bus = MockBus::new();
        let s = sensor(&bus, 1);
        let transport = bus.transport();
        let report = Mutex::new(TouchReport::new(s.fingers()));

        bus.poke(0x40, &[0b0000_0101]);
        assert_eq!(s.report(&transport, &report).unwrap(), 2);

        bus.poke(0x40, &[0x00]);
        assert_eq!(s.report(&transport, &report).unwrap(), 0);
        let r = report.lock().unwrap();
        assert!(r.slots().iter().all(|s| !s.touched && s.lifted));
    }

    #[test]
    fn test_single_finger_leaving_is_lifted() {
        let bus = MockBus::new();
        let s = sensor(&bus, 1);
        let transport = bus.transport();
        let report = Mutex::new(TouchReport::new(s.fingers()));

        bus.poke(0x40, &[0b0000_0101]);
        s.report(&transport, &report).unwrap();
        bus.poke(0x40, &[0b0000_0001]);
        assert_eq!(s.report(&transport, &report).unwrap(), 1);

        let r = report.lock().unwrap();
        assert!(r.slots()[0].touched);
        assert!(r.slots()[1].lifted);
    }
}
