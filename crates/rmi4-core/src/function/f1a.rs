//! F1A: capacitive buttons

use std::sync::Mutex;

use crate::error::Result;
use crate::pdt::BaseAddresses;
use crate::touch::{lock_report, TouchReport};
use crate::transport::RmiTransport;

/// Capacitive button sensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct F1aButtons {
    bases: BaseAddresses,
    count: usize,
}

impl F1aButtons {
    /// Read the button count from query 0
    pub fn init(transport: &RmiTransport, bases: BaseAddresses) -> Result<Self> {
        let query = transport.read_byte(bases.query)?;
        let count = (query & 0x07) as usize + 1;
        log::debug!("rmi4: F1A {} buttons", count);
        Ok(Self { bases, count })
    }

    /// Number of buttons
    pub fn count(&self) -> usize {
        self.count
    }

    /// Read the button bitmap into the report; returns pressed buttons
    pub fn report(&self, transport: &RmiTransport, report: &Mutex<TouchReport>) -> Result<usize> {
        let bitmap = transport.read_vec(self.bases.data, self.count.div_ceil(8))?;
        let mut report = lock_report(report)?;
        report.set_buttons(&bitmap);
        let pressed = report.buttons().iter().filter(|&&b| b).count();
        log::trace!("rmi4: F1A {} buttons pressed", pressed);
        Ok(pressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBus;

    #[test]
    fn test_buttons_report() {
        let bus = MockBus::new();
        let bases = BaseAddresses {
            query: 0x78,
            command: 0x79,
            control: 0x7A,
            data: 0x7C,
        };
        bus.poke(0x78, &[0x02]);
        bus.poke(0x7C, &[0b101]);
        let transport = bus.transport();

        let f1a = F1aButtons::init(&transport, bases).unwrap();
        assert_eq!(f1a.count(), 3);

        let report = Mutex::new(TouchReport::new(0).with_buttons(f1a.count()));
        assert_eq!(f1a.report(&transport, &report).unwrap(), 2);
        assert_eq!(report.lock().unwrap().buttons(), &[true, false, true]);
    }
}
