//! Function topology discovery
//!
//! Walks the descriptor table page by page, assigns interrupt bits in
//! descriptor order, and initializes every function the core handles.

use crate::error::{ProtocolError, Result};
use crate::function::f01::{DeviceInfo, F01};
use crate::function::f11::F11Sensor;
use crate::function::f12::F12Sensor;
use crate::function::f1a::F1aButtons;
use crate::function::f34::{BootloaderVersion, F34};
use crate::function::{FunctionHandle, FunctionKind, InterruptMask, TouchSensor};
use crate::pdt::{self, function, BaseAddresses, PdtEntry, PAGES_TO_SERVICE, PDT_ENTRY_SIZE};
use crate::transport::{RegisterAddress, RmiTransport};

/// A descriptor together with the page it was found on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    /// Page number
    pub page: u8,
    /// Raw descriptor
    pub entry: PdtEntry,
}

impl Descriptor {
    /// Absolute register bases
    pub fn bases(&self) -> BaseAddresses {
        BaseAddresses::from_entry(self.page, &self.entry)
    }
}

/// Read every descriptor of one page, stopping at the first empty one
pub fn scan_page(transport: &RmiTransport, page: u8) -> Result<Vec<Descriptor>> {
    let mut found = Vec::new();
    for offset in pdt::entry_offsets() {
        let mut raw = [0u8; PDT_ENTRY_SIZE as usize];
        transport.read(RegisterAddress::new(page, offset), &mut raw)?;
        let entry = PdtEntry::from_bytes(raw);
        if entry.is_end() {
            break;
        }
        log::debug!(
            "rmi4: found F{:02X} v{} on page {}, {} interrupt sources",
            entry.function_number(),
            entry.function_version(),
            page,
            entry.interrupt_source_count()
        );
        found.push(Descriptor { page, entry });
    }
    Ok(found)
}

/// Locate F01 and F34 on page 0
///
/// Used while the controller runs its bootloader, where the register map
/// is reduced to these two functions.
pub fn scan_flash_functions(transport: &RmiTransport) -> Result<(Descriptor, Descriptor)> {
    let descriptors = scan_page(transport, 0)?;
    let find = |number| {
        descriptors
            .iter()
            .find(|d| d.entry.function_number() == number)
            .copied()
            .ok_or(ProtocolError::MissingFunction(number))
    };
    Ok((find(function::F01)?, find(function::F34)?))
}

/// Discovered functions and the values derived from them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopology {
    functions: Vec<FunctionHandle>,
    interrupt_sources: u16,
    interrupt_mask: Vec<u8>,
    info: DeviceInfo,
}

impl DeviceTopology {
    /// All handled functions in descriptor order
    pub fn functions(&self) -> &[FunctionHandle] {
        &self.functions
    }

    /// Look up a function by number
    pub fn function(&self, number: u8) -> Option<&FunctionHandle> {
        self.functions.iter().find(|f| f.number == number)
    }

    /// Device control accessor
    pub fn device_control(&self) -> Result<F01> {
        self.functions
            .iter()
            .find_map(|f| match &f.kind {
                FunctionKind::DeviceControl(f01) => Some(*f01),
                _ => None,
            })
            .ok_or_else(|| ProtocolError::MissingFunction(function::F01).into())
    }

    /// Flash accessor
    pub fn flash(&self) -> Result<F34> {
        self.functions
            .iter()
            .find_map(|f| match &f.kind {
                FunctionKind::Flash(f34) => Some(*f34),
                _ => None,
            })
            .ok_or_else(|| ProtocolError::MissingFunction(function::F34).into())
    }

    /// 2D sensor, if the device exposes one
    pub fn touch(&self) -> Option<&TouchSensor> {
        self.functions.iter().find_map(|f| match &f.kind {
            FunctionKind::Touch(sensor) => Some(sensor),
            _ => None,
        })
    }

    /// Button sensor, if the device exposes one
    pub fn buttons(&self) -> Option<&F1aButtons> {
        self.functions.iter().find_map(|f| match &f.kind {
            FunctionKind::Button(buttons) => Some(buttons),
            _ => None,
        })
    }

    /// Total interrupt sources across all descriptors
    pub fn interrupt_sources(&self) -> u16 {
        self.interrupt_sources
    }

    /// Number of interrupt status registers
    pub fn interrupt_registers(&self) -> usize {
        self.interrupt_mask.len()
    }

    /// Combined interrupt enable mask of the handled functions
    pub fn interrupt_mask(&self) -> &[u8] {
        &self.interrupt_mask
    }

    /// Product identification
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Firmware build id of the running image
    pub fn firmware_id(&self) -> u32 {
        self.info.firmware_id
    }

    /// Number of finger slots, 0 without a 2D sensor
    pub fn max_fingers(&self) -> usize {
        self.touch().map_or(0, TouchSensor::fingers)
    }

    /// Sensor extent along X
    pub fn max_x(&self) -> u16 {
        self.touch().map_or(0, TouchSensor::max_x)
    }

    /// Sensor extent along Y
    pub fn max_y(&self) -> u16 {
        self.touch().map_or(0, TouchSensor::max_y)
    }

    /// Number of buttons, 0 without a button sensor
    pub fn button_count(&self) -> usize {
        self.buttons().map_or(0, F1aButtons::count)
    }
}

/// Walk the descriptor table and initialize the handled functions
pub fn discover(transport: &RmiTransport) -> Result<DeviceTopology> {
    let mut descriptors = Vec::new();
    for page in 0..PAGES_TO_SERVICE {
        let found = scan_page(transport, page)?;
        if found.is_empty() {
            break;
        }
        descriptors.extend(found);

        let has = |n| descriptors.iter().any(|d: &Descriptor| d.entry.function_number() == n);
        if has(function::F01) && has(function::F34) {
            break;
        }
    }

    let mut interrupt_sources: u16 = 0;
    let mut pending = Vec::new();
    for d in &descriptors {
        let count = d.entry.interrupt_source_count();
        let mask = InterruptMask::new(interrupt_sources, count);
        interrupt_sources += count as u16;

        let handled = match d.entry.function_number() {
            function::F01 | function::F11 | function::F12 | function::F1A => count != 0,
            function::F34 | function::F54 | function::F55 => true,
            _ => false,
        };
        if handled {
            pending.push((*d, mask));
        }
    }

    let mut functions = Vec::with_capacity(pending.len());
    for (d, interrupt) in pending {
        let bases = d.bases();
        let number = d.entry.function_number();
        let kind = match number {
            function::F01 => FunctionKind::DeviceControl(F01::new(bases)),
            function::F11 => FunctionKind::Touch(TouchSensor::Legacy(F11Sensor::init(transport, bases)?)),
            function::F12 => FunctionKind::Touch(TouchSensor::Object(F12Sensor::init(transport, bases)?)),
            function::F1A => FunctionKind::Button(F1aButtons::init(transport, bases)?),
            function::F34 => {
                let version = BootloaderVersion::from_function_version(d.entry.function_version())?;
                FunctionKind::Flash(F34::new(bases, version))
            }
            _ => FunctionKind::Sensor,
        };
        functions.push(FunctionHandle {
            number,
            version: d.entry.function_version(),
            page: d.page,
            bases,
            interrupt,
            kind,
        });
    }

    let mut interrupt_mask = vec![0u8; (interrupt_sources as usize).div_ceil(8)];
    for f in &functions {
        f.interrupt.apply(&mut interrupt_mask);
    }

    let mut topology = DeviceTopology {
        functions,
        interrupt_sources,
        interrupt_mask,
        info: DeviceInfo::default(),
    };
    let f01 = topology.device_control()?;
    topology.flash()?;
    topology.info = f01.read_info(transport)?;

    log::info!(
        "rmi4: {} functions, {} interrupt registers, {} fingers",
        topology.functions.len(),
        topology.interrupt_registers(),
        topology.max_fingers()
    );
    Ok(topology)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBus;

    fn descriptor(bus: &MockBus, addr: u16, entry: PdtEntry) {
        bus.poke(addr, entry.as_bytes());
    }

    /// F34, F01, F11 and F1A on page 0
    fn register_map(bus: &MockBus) {
        descriptor(bus, 0x00E9, PdtEntry::new(0x34, 1, 1, [0x80, 0x8F, 0x90, 0xB0]));
        descriptor(bus, 0x00E3, PdtEntry::new(0x01, 0, 2, [0x00, 0x16, 0x17, 0x19]));
        descriptor(bus, 0x00DD, PdtEntry::new(0x11, 0, 1, [0x20, 0x2F, 0x30, 0x40]));
        descriptor(bus, 0x00D7, PdtEntry::new(0x1A, 0, 1, [0x78, 0x79, 0x7A, 0x7C]));

        // F01 query: Synaptics, product id, build id
        bus.poke(0x0000, &[1]);
        bus.poke(0x000B, b"TM2000");
        bus.poke(0x0012, &[0x10, 0x27, 0x00]);
        // F11: 5 fingers, 1023 x 767
        bus.poke(0x0020, &[0x00, 0x04]);
        bus.poke(0x0036, &[0xFF, 0x03, 0xFF, 0x02]);
        // F1A: 2 buttons
        bus.poke(0x0078, &[0x01]);
    }

    #[test]
    fn test_discover_page_zero() {
        let bus = MockBus::new();
        register_map(&bus);
        let topology = discover(&bus.transport()).unwrap();

        let numbers: Vec<u8> = topology.functions().iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![0x34, 0x01, 0x11, 0x1A]);
        assert_eq!(topology.interrupt_sources(), 5);
        assert_eq!(topology.interrupt_registers(), 1);
        assert_eq!(topology.interrupt_mask(), &[0b1_1111]);
        assert_eq!(
            topology.function(0x11).unwrap().interrupt,
            InterruptMask::new(3, 1)
        );
        assert_eq!(topology.max_fingers(), 5);
        assert_eq!(topology.max_x(), 1023);
        assert_eq!(topology.max_y(), 767);
        assert_eq!(topology.button_count(), 2);
        assert_eq!(topology.info().product_id, "TM2000");
        assert_eq!(topology.firmware_id(), 10000);
        assert_eq!(topology.flash().unwrap().version(), BootloaderVersion::V6);

        // page 1 is never visited once both mandatory functions are known
        assert!(bus.page_selects().iter().all(|&p| p == 0));
    }

    #[test]
    fn test_discover_is_idempotent() {
        let bus = MockBus::new();
        register_map(&bus);
        let transport = bus.transport();
        let first = discover(&transport).unwrap();
        let second = discover(&transport).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_discover_second_page() {
        let bus = MockBus::new();
        descriptor(&bus, 0x00E9, PdtEntry::new(0x01, 0, 1, [0x00, 0x16, 0x17, 0x19]));
        descriptor(&bus, 0x00E3, PdtEntry::new(0x54, 0, 9, [0x50, 0x51, 0x52, 0x53]));
        descriptor(&bus, 0x01E9, PdtEntry::new(0x34, 2, 1, [0x00, 0x0F, 0x10, 0x20]));
        bus.poke(0x0000, &[1]);

        let topology = discover(&bus.transport()).unwrap();
        // 3-bit count field caps F54 at 1 source
        assert_eq!(topology.interrupt_sources(), 3);
        let f34 = topology.function(0x34).unwrap();
        assert_eq!(f34.page, 1);
        assert_eq!(f34.bases.data, 0x0120);
        assert_eq!(f34.interrupt, InterruptMask::new(2, 1));
        assert_eq!(topology.flash().unwrap().version(), BootloaderVersion::V7);
        assert!(topology.touch().is_none());
    }

    #[test]
    fn test_missing_flash_function() {
        let bus = MockBus::new();
        descriptor(&bus, 0x00E9, PdtEntry::new(0x01, 0, 1, [0x00, 0x16, 0x17, 0x19]));
        assert_eq!(
            discover(&bus.transport()),
            Err(ProtocolError::MissingFunction(0x34).into())
        );
    }

    #[test]
    fn test_interrupt_registers_round_up() {
        let bus = MockBus::new();
        descriptor(&bus, 0x00E9, PdtEntry::new(0x34, 1, 7, [0x80, 0x8F, 0x90, 0xB0]));
        descriptor(&bus, 0x00E3, PdtEntry::new(0x01, 0, 2, [0x00, 0x16, 0x17, 0x19]));
        bus.poke(0x0000, &[1]);
        let topology = discover(&bus.transport()).unwrap();
        assert_eq!(topology.interrupt_sources(), 9);
        assert_eq!(topology.interrupt_registers(), 2);
        assert_eq!(topology.interrupt_mask(), &[0xFF, 0x01]);
    }

    #[test]
    fn test_scan_flash_functions() {
        let bus = MockBus::new();
        register_map(&bus);
        let (f01, f34) = scan_flash_functions(&bus.transport()).unwrap();
        assert_eq!(f01.bases().control, 0x17);
        assert_eq!(f34.bases().data, 0xB0);
    }
}
