//! F12: 2D sensor, object report format
//!
//! All F12 registers are packet registers. Which control and data
//! registers exist is described by presence bitmaps in query 5 and
//! query 8, and the subpacket layout of each control register by the
//! structure register in query 6.

use std::sync::Mutex;

use crate::error::{ProtocolError, Result};
use crate::pdt::BaseAddresses;
use crate::touch::{lock_report, Contact, TouchReport};
use crate::transport::RmiTransport;

/// Largest query 5 (control presence) register we interpret
const QUERY_5_MAX: usize = 9;

/// Largest query 8 (data presence) register we interpret
const QUERY_8_MAX: usize = 5;

/// Query offsets relative to the query base
const QUERY_5_SIZE_OFFSET: u16 = 4;
const QUERY_5_OFFSET: u16 = 5;
const QUERY_6_OFFSET: u16 = 6;
const QUERY_8_SIZE_OFFSET: u16 = 7;
const QUERY_8_OFFSET: u16 = 8;

/// Control 8: sensor tuning, holds the coordinate extents
const CTRL_8_LEN: usize = 14;

/// Size of one object record in data 1
pub const OBJECT_RECORD_LEN: usize = 8;

/// Width limit reported by the object protocol
pub const MAX_TOUCH_WIDTH: u8 = 255;

/// Object classification in the first byte of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    /// No object in this slot
    None,
    /// Finger
    Finger,
    /// Stylus
    Stylus,
    /// Palm
    Palm,
    /// Object without a known class
    Unclassified,
    /// Finger with glove
    GlovedFinger,
    /// Other code
    Other(u8),
}

impl From<u8> for ObjectType {
    fn from(code: u8) -> Self {
        match code {
            0x00 => Self::None,
            0x01 => Self::Finger,
            0x02 => Self::Stylus,
            0x03 => Self::Palm,
            0x04 => Self::Unclassified,
            0x06 => Self::GlovedFinger,
            other => Self::Other(other),
        }
    }
}

/// One decoded object record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRecord {
    /// Object class
    pub kind: ObjectType,
    /// Position and size
    pub contact: Contact,
    /// Pressure
    pub z: u8,
}

impl ObjectRecord {
    /// Decode an 8-byte data 1 record
    pub fn decode(raw: &[u8]) -> Self {
        let b = |i: usize| raw.get(i).copied().unwrap_or(0);
        Self {
            kind: ObjectType::from(b(0)),
            contact: Contact {
                x: b(1) as u16 | (b(2) as u16) << 8,
                y: b(3) as u16 | (b(4) as u16) << 8,
                width_x: b(6),
                width_y: b(7),
            },
            z: b(5),
        }
    }

    /// Whether the object counts as a touch
    pub fn is_touch(&self) -> bool {
        matches!(self.kind, ObjectType::Finger | ObjectType::GlovedFinger)
    }
}

/// Presence bitmap as stored in query 5 and query 8
///
/// Byte 0 is a size field; register N is present when bit `N % 8` of
/// byte `1 + N / 8` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Presence(Vec<u8>);

impl Presence {
    fn is_present(&self, reg: usize) -> bool {
        self.0
            .get(1 + reg / 8)
            .is_some_and(|b| b & (1 << (reg % 8)) != 0)
    }

    /// Number of present registers in `range`
    fn count(&self, range: std::ops::Range<usize>) -> usize {
        range.filter(|&r| self.is_present(r)).count()
    }

    fn max_register(&self) -> usize {
        (self.0.len().saturating_sub(1) * 8).saturating_sub(1)
    }
}

/// Walk the query 6 structure register to learn whether subpacket `sub`
/// of control register `reg` exists
fn find_subpacket(presence: &Presence, structure: &[u8], reg: usize, sub: usize) -> Result<bool> {
    if reg > presence.max_register() || !presence.is_present(reg) {
        log::error!("rmi4: F12 control {} is not present", reg);
        return Err(ProtocolError::InvalidGeometry.into());
    }
    let at = |i: usize| structure.get(i).copied().unwrap_or(0);

    let mut s = 0;
    for r in (0..reg).filter(|&r| presence.is_present(r)) {
        // size field: one byte, or 0 followed by a 2-byte size
        if at(s) == 0 {
            s += 3;
        } else {
            s += 1;
        }
        while at(s) & 0x80 != 0 {
            s += 1;
        }
        s += 1;
        log::trace!("rmi4: F12 structure of control {} ends at {}", r, s);
    }

    s += 1;
    let byte = sub / 7;
    let bit = sub % 7;
    let mut i = 0;
    loop {
        if i == byte {
            return Ok(at(s + i) & (1 << bit) != 0);
        }
        if at(s + i) & 0x80 == 0 {
            return Ok(false);
        }
        i += 1;
    }
}

/// Object protocol 2D sensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct F12Sensor {
    bases: BaseAddresses,
    fingers: usize,
    max_x: u16,
    max_y: u16,
    data1_offset: u16,
    data15: Option<(u16, usize)>,
    report_enable: u8,
}

impl F12Sensor {
    /// Learn the register layout, finger count and extents
    pub fn init(transport: &RmiTransport, bases: BaseAddresses) -> Result<Self> {
        let size_q5 = (transport.read_byte(bases.query + QUERY_5_SIZE_OFFSET)? as usize)
            .min(QUERY_5_MAX);
        let mut q5 = vec![0u8; QUERY_5_MAX];
        transport.read(bases.query + QUERY_5_OFFSET, &mut q5[..size_q5])?;
        let ctrl = Presence(q5);

        let ctrl8_offset = ctrl.count(0..8);
        let ctrl20_offset = ctrl8_offset + ctrl.count(8..20);
        let ctrl23_offset = ctrl20_offset + ctrl.count(20..23);
        let ctrl28_offset = ctrl23_offset + ctrl.count(23..28);

        let structure = transport.read_vec(bases.query + QUERY_6_OFFSET, ctrl.0[0] as usize)?;
        let mut ctrl23_size = 2;
        for sub in 2..=4 {
            if find_subpacket(&ctrl, &structure, 23, sub)? {
                ctrl23_size += 1;
            }
        }
        let ctrl23 = transport.read_vec(bases.control + ctrl23_offset as u16, ctrl23_size)?;
        let fingers = ctrl23[1] as usize;

        let size_q8 = (transport.read_byte(bases.query + QUERY_8_SIZE_OFFSET)? as usize)
            .min(QUERY_8_MAX);
        let mut q8 = vec![0u8; QUERY_8_MAX];
        transport.read(bases.query + QUERY_8_OFFSET, &mut q8[..size_q8])?;
        let data = Presence(q8);

        let data1_offset = data.is_present(0) as u16;
        let data15 = if size_q8 >= 3 && data.is_present(15) {
            Some((data.count(0..15) as u16, fingers.div_ceil(8)))
        } else {
            None
        };

        let report_enable = transport.read_byte(bases.control + ctrl28_offset as u16)?;

        let (mut max_x, mut max_y) = (0, 0);
        if ctrl.is_present(8) {
            let mut ctrl8 = [0u8; CTRL_8_LEN];
            transport.read(bases.control + ctrl8_offset as u16, &mut ctrl8)?;
            max_x = u16::from_le_bytes([ctrl8[0], ctrl8[1]]);
            max_y = u16::from_le_bytes([ctrl8[2], ctrl8[3]]);
        }

        log::debug!(
            "rmi4: F12 {} objects, max x {}, max y {}, report enable 0x{:02X}",
            fingers,
            max_x,
            max_y,
            report_enable
        );

        Ok(Self {
            bases,
            fingers,
            max_x,
            max_y,
            data1_offset,
            data15,
            report_enable,
        })
    }

    /// Number of object slots
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

    /// Report enable bits from control 28
    pub fn report_enable(&self) -> u8 {
        self.report_enable
    }

    /// Number of records worth reading according to the data 15 bitmap
    fn objects_in_bitmap(&self, transport: &RmiTransport) -> Result<usize> {
        let Some((offset, size)) = self.data15 else {
            return Ok(self.fingers);
        };
        let bitmap = transport.read_vec(self.bases.data + offset, size)?;
        let highest = (0..self.fingers)
            .rev()
            .find(|&i| bitmap.get(i / 8).is_some_and(|b| b & (1 << (i % 8)) != 0));
        Ok(highest.map_or(0, |i| i + 1))
    }

    /// Decode one report into the shared slots
    ///
    /// Returns the number of objects currently touching.
    pub fn report(&self, transport: &RmiTransport, report: &Mutex<TouchReport>) -> Result<usize> {
        let remembered = lock_report(report)?.objects_present();
        let to_process = self
            .objects_in_bitmap(transport)?
            .max(remembered)
            .min(self.fingers);
        log::trace!("rmi4: F12 objects to process {}", to_process);

        if to_process == 0 {
            let mut report = lock_report(report)?;
            report.begin_cycle();
            report.lift_all();
            report.finish_cycle(0);
            return Ok(0);
        }

        let raw = transport.read_vec(
            self.bases.data + self.data1_offset,
            to_process * OBJECT_RECORD_LEN,
        )?;

        let mut report = lock_report(report)?;
        report.begin_cycle();
        let mut touch_count = 0;
        for (index, chunk) in raw.chunks(OBJECT_RECORD_LEN).enumerate() {
            let record = ObjectRecord::decode(chunk);
            let c = record.contact;
            match record.kind {
                ObjectType::Finger | ObjectType::GlovedFinger => {
                    log::trace!(
                        "rmi4: F12 object {} x {} y {} wx {} wy {}",
                        index,
                        c.x,
                        c.y,
                        c.width_x,
                        c.width_y
                    );
                    report.touch(index, c);
                    touch_count += 1;
                }
                ObjectType::Palm => {
                    log::debug!("rmi4: F12 palm {} at x {} y {}", index, c.x, c.y);
                    report.lift(index);
                }
                _ => report.lift(index),
            }
        }

        if touch_count == 0 {
            log::trace!("rmi4: F12 objects left");
            report.set_objects_present(0);
            report.lift_all();
        } else {
            report.set_objects_present(to_process);
        }
        report.finish_cycle(touch_count);
        Ok(touch_count)
    }
}
