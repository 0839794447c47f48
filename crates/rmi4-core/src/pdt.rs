//! Page Description Table entries
//!
//! Each page carries a table of 6-byte function descriptors stored from
//! offset 0xE9 downward. A descriptor with function number 0 ends the
//! table of its page.

use crate::transport::RegisterAddress;

/// Offset of the first descriptor in a page
pub const PDT_START: u8 = 0xE9;

/// Scanning stops before reaching this offset
pub const PDT_END: u8 = 0xD0;

/// Size of one descriptor
pub const PDT_ENTRY_SIZE: u8 = 6;

/// Maximum number of pages searched for descriptors
pub const PAGES_TO_SERVICE: u8 = 10;

/// RMI4 function numbers handled by this crate
pub mod function {
    /// Device control
    pub const F01: u8 = 0x01;
    /// 2D sensor, legacy report format
    pub const F11: u8 = 0x11;
    /// 2D sensor, object report format
    pub const F12: u8 = 0x12;
    /// Capacitive buttons
    pub const F1A: u8 = 0x1A;
    /// Flash memory management
    pub const F34: u8 = 0x34;
    /// Flash memory management, production test variant
    pub const F35: u8 = 0x35;
    /// Test reporting
    pub const F54: u8 = 0x54;
    /// Sensor tuning
    pub const F55: u8 = 0x55;
}

/// A decoded Page Description Table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdtEntry {
    raw: [u8; 6],
}

impl PdtEntry {
    /// Wrap the six raw descriptor bytes
    pub const fn from_bytes(raw: [u8; 6]) -> Self {
        Self { raw }
    }

    /// Raw descriptor bytes
    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.raw
    }

    /// Query register base, page relative
    pub const fn query_base(&self) -> u8 {
        self.raw[0]
    }

    /// Command register base, page relative
    pub const fn command_base(&self) -> u8 {
        self.raw[1]
    }

    /// Control register base, page relative
    pub const fn control_base(&self) -> u8 {
        self.raw[2]
    }

    /// Data register base, page relative
    pub const fn data_base(&self) -> u8 {
        self.raw[3]
    }

    /// Number of interrupt sources the function owns
    pub const fn interrupt_source_count(&self) -> u8 {
        self.raw[4] & 0x07
    }

    /// Function version
    pub const fn function_version(&self) -> u8 {
        (self.raw[4] >> 5) & 0x03
    }

    /// Function number; 0 marks the end of the table
    pub const fn function_number(&self) -> u8 {
        self.raw[5]
    }

    /// Whether this entry ends the page's table
    pub const fn is_end(&self) -> bool {
        self.raw[5] == 0
    }

    /// Build an entry from its fields
    pub const fn new(
        function_number: u8,
        version: u8,
        interrupt_sources: u8,
        bases: [u8; 4],
    ) -> Self {
        Self {
            raw: [
                bases[0],
                bases[1],
                bases[2],
                bases[3],
                (interrupt_sources & 0x07) | ((version & 0x03) << 5),
                function_number,
            ],
        }
    }
}

/// Absolute register bases of a function
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BaseAddresses {
    /// Query registers
    pub query: u16,
    /// Command registers
    pub command: u16,
    /// Control registers
    pub control: u16,
    /// Data registers
    pub data: u16,
}

impl BaseAddresses {
    /// Combine a descriptor's page-relative bases with its page number
    pub fn from_entry(page: u8, entry: &PdtEntry) -> Self {
        Self {
            query: RegisterAddress::new(page, entry.query_base()).0,
            command: RegisterAddress::new(page, entry.command_base()).0,
            control: RegisterAddress::new(page, entry.control_base()).0,
            data: RegisterAddress::new(page, entry.data_base()).0,
        }
    }
}

/// Descriptor offsets of a page, from the top of the table downward
pub fn entry_offsets() -> impl Iterator<Item = u8> {
    (PDT_END + 1..=PDT_START)
        .rev()
        .step_by(PDT_ENTRY_SIZE as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_fields() {
        let entry = PdtEntry::from_bytes([0x20, 0x21, 0x22, 0x23, 0x43, 0x34]);
        assert_eq!(entry.query_base(), 0x20);
        assert_eq!(entry.command_base(), 0x21);
        assert_eq!(entry.control_base(), 0x22);
        assert_eq!(entry.data_base(), 0x23);
        assert_eq!(entry.interrupt_source_count(), 3);
        assert_eq!(entry.function_version(), 2);
        assert_eq!(entry.function_number(), function::F34);
        assert!(!entry.is_end());
        assert_eq!(
            PdtEntry::new(0x34, 2, 3, [0x20, 0x21, 0x22, 0x23]),
            entry
        );
    }

    #[test]
    fn test_entry_offsets() {
        let offsets: Vec<u8> = entry_offsets().collect();
        assert_eq!(offsets, vec![0xE9, 0xE3, 0xDD, 0xD7, 0xD1]);
    }

    #[test]
    fn test_bases_include_page() {
        let entry = PdtEntry::new(0x12, 0, 1, [0x10, 0x20, 0x30, 0x40]);
        let bases = BaseAddresses::from_entry(2, &entry);
        assert_eq!(bases.query, 0x0210);
        assert_eq!(bases.data, 0x0240);
    }
}
