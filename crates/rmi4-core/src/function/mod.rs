//! RMI4 functions
//!
//! Each discovered descriptor becomes a [`FunctionHandle`] carrying its
//! register bases, its interrupt bits and a [`FunctionKind`] holding the
//! decoded per-function state. Dispatch matches on the kind.

pub mod f01;
pub mod f11;
pub mod f12;
pub mod f1a;
pub mod f34;

use std::sync::Mutex;

use crate::error::Result;
use crate::pdt::{self, BaseAddresses};
use crate::touch::TouchReport;
use crate::transport::RmiTransport;

use f01::F01;
use f11::F11Sensor;
use f12::F12Sensor;
use f1a::F1aButtons;
use f34::F34;

/// Interrupt bits owned by a function
///
/// Sources are packed consecutively across all functions in descriptor
/// order, so a function may straddle two status registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptMask {
    /// Bit offset of the first source
    pub offset: u16,
    /// Number of sources
    pub count: u8,
}

impl InterruptMask {
    /// Mask starting at `offset` covering `count` sources
    pub const fn new(offset: u16, count: u8) -> Self {
        Self { offset, count }
    }

    fn bits(&self) -> impl Iterator<Item = usize> {
        let start = self.offset as usize;
        start..start + self.count as usize
    }

    /// Set this function's bits in a register array
    pub fn apply(&self, registers: &mut [u8]) {
        for bit in self.bits() {
            if let Some(reg) = registers.get_mut(bit / 8) {
                *reg |= 1 << (bit % 8);
            }
        }
    }

    /// Any of this function's bits set in the interrupt status
    pub fn is_pending(&self, status: &[u8]) -> bool {
        self.bits().any(|bit| {
            status
                .get(bit / 8)
                .is_some_and(|reg| reg & (1 << (bit % 8)) != 0)
        })
    }
}

/// 2D sensor report protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TouchSensor {
    /// F11 finger status bitmap
    Legacy(F11Sensor),
    /// F12 object records
    Object(F12Sensor),
}

impl TouchSensor {
    /// Number of finger slots
    pub fn fingers(&self) -> usize {
        match self {
            Self::Legacy(s) => s.fingers(),
            Self::Object(s) => s.fingers(),
        }
    }

    /// Sensor extent along X
    pub fn max_x(&self) -> u16 {
        match self {
            Self::Legacy(s) => s.max_x(),
            Self::Object(s) => s.max_x(),
        }
    }

    /// Sensor extent along Y
    pub fn max_y(&self) -> u16 {
        match self {
            Self::Legacy(s) => s.max_y(),
            Self::Object(s) => s.max_y(),
        }
    }

    /// Decode one report into the shared slots
    pub fn report(&self, transport: &RmiTransport, report: &Mutex<TouchReport>) -> Result<usize> {
        match self {
            Self::Legacy(s) => s.report(transport, report),
            Self::Object(s) => s.report(transport, report),
        }
    }
}

/// Per-function state, one variant per handled function family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionKind {
    /// F01
    DeviceControl(F01),
    /// F11 or F12
    Touch(TouchSensor),
    /// F34
    Flash(F34),
    /// F1A
    Button(F1aButtons),
    /// F54, F55 and other functions that only need to be acknowledged
    Sensor,
}

/// A discovered function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionHandle {
    /// Function number
    pub number: u8,
    /// Function version from the descriptor
    pub version: u8,
    /// Page the descriptor was found on
    pub page: u8,
    /// Absolute register bases
    pub bases: BaseAddresses,
    /// Interrupt sources
    pub interrupt: InterruptMask,
    /// Decoded state
    pub kind: FunctionKind,
}

impl FunctionHandle {
    /// Human readable function name
    pub fn name(&self) -> &'static str {
        match self.number {
            pdt::function::F01 => "device control",
            pdt::function::F11 => "2D sensor (legacy)",
            pdt::function::F12 => "2D sensor (object)",
            pdt::function::F1A => "buttons",
            pdt::function::F34 => "flash",
            pdt::function::F54 => "analog diagnostics",
            pdt::function::F55 => "sensor tuning",
            _ => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_within_register() {
        let mask = InterruptMask::new(2, 3);
        let mut regs = [0u8; 2];
        mask.apply(&mut regs);
        assert_eq!(regs, [0b0001_1100, 0]);
        assert!(mask.is_pending(&[0b0000_0100]));
        assert!(!mask.is_pending(&[0b0000_0011]));
    }

    #[test]
    fn test_mask_straddles_registers() {
        let mask = InterruptMask::new(7, 2);
        let mut regs = [0u8; 2];
        mask.apply(&mut regs);
        assert_eq!(regs, [0x80, 0x01]);
        assert!(mask.is_pending(&[0x00, 0x01]));
        assert!(!mask.is_pending(&[0x00]));
    }

    #[test]
    fn test_empty_mask_never_pending() {
        let mask = InterruptMask::new(0, 0);
        assert!(!mask.is_pending(&[0xFF]));
    }
}
