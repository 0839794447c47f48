//! F01: RMI device control
//!
//! Product identification, device status, interrupt enable and reset.

use std::thread;
use std::time::Duration;

use bitflags::bitflags;

use crate::error::Result;
use crate::pdt::BaseAddresses;
use crate::transport::RmiTransport;

/// Length of the standard query block
pub const QUERY_LEN: usize = 21;

/// Offset of the product id string in the query block
const PRODUCT_ID_OFFSET: usize = 11;

/// Length of the product id string
pub const PRODUCT_ID_SIZE: usize = 10;

/// Offset of the 3-byte build id in the query space
const BUILD_ID_OFFSET: u16 = 18;

/// Manufacturer id reported by Synaptics parts
pub const MANUFACTURER_SYNAPTICS: u8 = 1;

/// Software reset command bit
const CMD_RESET: u8 = 0x01;

/// Time the controller needs after a software reset
pub const RESET_DELAY: Duration = Duration::from_millis(200);

bitflags! {
    /// Device control register (control 0)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceControl: u8 {
        /// Sleep mode field, bit 0
        const SLEEP_MODE_0 = 1 << 0;
        /// Sleep mode field, bit 1
        const SLEEP_MODE_1 = 1 << 1;
        /// Keep the controller awake
        const NOSLEEP      = 1 << 2;
        /// Host has configured the device since the last reset
        const CONFIGURED   = 1 << 7;

        const _ = !0;
    }
}

impl DeviceControl {
    /// Sleep mode field
    pub const SLEEP_MODE: Self = Self::SLEEP_MODE_0.union(Self::SLEEP_MODE_1);
}

/// Device status register (data 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus(pub u8);

impl DeviceStatus {
    /// Status code; 0 means no error
    pub const fn code(self) -> u8 {
        self.0 & 0x0F
    }

    /// Controller is in flash programming mode
    pub const fn flash_prog(self) -> bool {
        self.0 & 0x40 != 0
    }

    /// Controller has reset and lost its configuration
    pub const fn unconfigured(self) -> bool {
        self.0 & 0x80 != 0
    }

    /// Reset that was not requested by the host
    pub const fn is_spontaneous_reset(self) -> bool {
        self.unconfigured() && !self.flash_prog()
    }
}

/// Identification read from the query block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Manufacturer id (1 for Synaptics)
    pub manufacturer_id: u8,
    /// Product properties
    pub product_props: u8,
    /// Product info bytes
    pub product_info: [u8; 2],
    /// Product id string
    pub product_id: String,
    /// Raw build id
    pub build_id: [u8; 3],
    /// Firmware id derived from the build id
    pub firmware_id: u32,
}

impl DeviceInfo {
    /// Decode the standard query block and build id
    pub fn decode(query: &[u8; QUERY_LEN], build_id: [u8; 3]) -> Self {
        let id_bytes = &query[PRODUCT_ID_OFFSET..PRODUCT_ID_OFFSET + PRODUCT_ID_SIZE];
        let end = id_bytes.iter().position(|&b| b == 0).unwrap_or(id_bytes.len());
        Self {
            manufacturer_id: query[0],
            product_props: query[1],
            product_info: [query[2], query[3]],
            product_id: String::from_utf8_lossy(&id_bytes[..end]).into_owned(),
            build_id,
            firmware_id: firmware_id_from_build_id(build_id),
        }
    }
}

/// Firmware id as the little-endian value of the 3-byte build id
pub fn firmware_id_from_build_id(build_id: [u8; 3]) -> u32 {
    build_id[0] as u32 | (build_id[1] as u32) << 8 | (build_id[2] as u32) << 16
}

/// Register accessor for F01
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct F01 {
    bases: BaseAddresses,
}

impl F01 {
    /// Create an accessor for the given register bases
    pub fn new(bases: BaseAddresses) -> Self {
        Self { bases }
    }

    /// Register bases
    pub fn bases(&self) -> &BaseAddresses {
        &self.bases
    }

    /// Read product identification
    pub fn read_info(&self, transport: &RmiTransport) -> Result<DeviceInfo> {
        let mut query = [0u8; QUERY_LEN];
        transport.read(self.bases.query, &mut query)?;
        let mut build_id = [0u8; 3];
        transport.read(self.bases.query + BUILD_ID_OFFSET, &mut build_id)?;

        let info = DeviceInfo::decode(&query, build_id);
        if info.manufacturer_id != MANUFACTURER_SYNAPTICS {
            log::error!(
                "rmi4: non-Synaptics device found, manufacturer id {}",
                info.manufacturer_id
            );
        }
        log::info!("rmi4: product id {}", info.product_id);
        log::info!("rmi4: firmware id {}", info.firmware_id);
        Ok(info)
    }

    /// Read the device status register
    pub fn read_status(&self, transport: &RmiTransport) -> Result<DeviceStatus> {
        Ok(DeviceStatus(transport.read_byte(self.bases.data)?))
    }

    /// Read device status followed by `count` interrupt status registers
    pub fn read_status_and_interrupts(
        &self,
        transport: &RmiTransport,
        count: usize,
    ) -> Result<(DeviceStatus, Vec<u8>)> {
        let data = transport.read_vec(self.bases.data, count + 1)?;
        Ok((DeviceStatus(data[0]), data[1..].to_vec()))
    }

    /// Read the device control register
    pub fn read_control(&self, transport: &RmiTransport) -> Result<DeviceControl> {
        Ok(DeviceControl::from_bits_retain(
            transport.read_byte(self.bases.control)?,
        ))
    }

    /// Write the device control register
    pub fn write_control(&self, transport: &RmiTransport, ctrl: DeviceControl) -> Result<()> {
        transport.write_byte(self.bases.control, ctrl.bits())
    }

    /// Mark the device as configured by the host
    pub fn set_configured(&self, transport: &RmiTransport) -> Result<()> {
        let ctrl = self.read_control(transport)?;
        self.write_control(transport, ctrl | DeviceControl::CONFIGURED)
    }

    /// Keep the device awake in normal operation
    pub fn set_nosleep(&self, transport: &RmiTransport) -> Result<()> {
        let mut ctrl = self.read_control(transport)?;
        ctrl.remove(DeviceControl::SLEEP_MODE);
        ctrl.insert(DeviceControl::NOSLEEP);
        self.write_control(transport, ctrl)
    }

    /// Write the interrupt enable register(s)
    ///
    /// An empty or all-zero mask disables every source.
    pub fn write_interrupt_enable(&self, transport: &RmiTransport, mask: &[u8]) -> Result<()> {
        if mask.is_empty() {
            return transport.write_byte(self.bases.control + 1, 0);
        }
        transport.write(self.bases.control + 1, mask)
    }

    /// Issue a software reset and wait for the controller to come back
    pub fn reset(&self, transport: &RmiTransport, delay: Duration) -> Result<()> {
        log::info!("rmi4: software reset");
        transport.write_byte(self.bases.command, CMD_RESET)?;
        thread::sleep(delay);
        transport.invalidate_page()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBus;

    fn bases() -> BaseAddresses {
        BaseAddresses {
            query: 0x00,
            command: 0x16,
            control: 0x17,
            data: 0x19,
        }
    }

    #[test]
    fn test_decode_info() {
        let mut query = [0u8; QUERY_LEN];
        query[0] = 1;
        query[1] = 0x02;
        query[2] = 0x11;
        query[3] = 0x22;
        query[11..17].copy_from_slice(b"TM3625");
        let info = DeviceInfo::decode(&query, [0x39, 0x30, 0x01]);
        assert_eq!(info.product_id, "TM3625");
        assert_eq!(info.product_info, [0x11, 0x22]);
        assert_eq!(info.firmware_id, 0x013039);
    }

    #[test]
    fn test_device_status_bits() {
        assert!(DeviceStatus(0x80).is_spontaneous_reset());
        assert!(!DeviceStatus(0xC0).is_spontaneous_reset());
        assert!(DeviceStatus(0x40).flash_prog());
        assert_eq!(DeviceStatus(0x83).code(), 3);
    }

    #[test]
    fn test_set_configured_preserves_bits() {
        let bus = MockBus::new();
        bus.poke(0x17, &[0x04]);
        let transport = bus.transport();
        F01::new(bases()).set_configured(&transport).unwrap();
        assert_eq!(bus.peek(0x17), 0x84);
    }

    #[test]
    fn test_set_nosleep_clears_sleep_mode() {
        let bus = MockBus::new();
        bus.poke(0x17, &[0x81]);
        let transport = bus.transport();
        F01::new(bases()).set_nosleep(&transport).unwrap();
        assert_eq!(bus.peek(0x17), 0x84);
    }

    #[test]
    fn test_interrupt_enable_disable() {
        let bus = MockBus::new();
        let transport = bus.transport();
        let f01 = F01::new(bases());
        f01.write_interrupt_enable(&transport, &[0x0F]).unwrap();
        assert_eq!(bus.peek(0x18), 0x0F);
        f01.write_interrupt_enable(&transport, &[]).unwrap();
        assert_eq!(bus.peek(0x18), 0x00);
    }
}
