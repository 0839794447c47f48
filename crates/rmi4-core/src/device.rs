//! Device context
//!
//! [`Rmi4Device`] owns everything one controller needs: the transport,
//! the discovered topology, the shared touch report and the event pump.
//! It is the only entry point a host framework uses.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use crate::bus::Attention;
use crate::error::{Error, ProtocolError, Result};
use crate::flash::{
    ConfigArea, FlashArea, FlashController, FlashProgress, FlashSession, FlashTiming, NoProgress,
    UpdateOptions, UpdateOutcome,
};
use crate::function::f01::{DeviceInfo, MANUFACTURER_SYNAPTICS};
use crate::image::FirmwareImage;
use crate::pump::{service_interrupt, EventPump, ReportSink};
use crate::topology::{discover, DeviceTopology};
use crate::touch::{lock_report, TouchReport, TouchSlot};
use crate::transport::RmiTransport;

/// Device context configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Run a firmware update during [`Rmi4Device::initialize`]
    pub update_on_startup: bool,
    /// Image used by the startup update
    pub image_path: Option<PathBuf>,
    /// Firmware id of the image, overriding the id it declares
    pub firmware_id: Option<u32>,
    /// Program the image regardless of the ids
    pub force: bool,
    /// Longest time the event pump blocks before checking for a stop request
    pub poll_interval: Duration,
    /// Sleep intervals used while flashing
    pub flash_timing: FlashTiming,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            update_on_startup: false,
            image_path: None,
            firmware_id: None,
            force: false,
            poll_interval: Duration::from_millis(100),
            flash_timing: FlashTiming::default(),
        }
    }
}

impl DeviceConfig {
    /// Update from `path` while initializing
    pub fn with_startup_update(mut self, path: impl Into<PathBuf>) -> Self {
        self.update_on_startup = true;
        self.image_path = Some(path.into());
        self
    }

    /// Set the expected image firmware id
    pub fn with_firmware_id(mut self, id: u32) -> Self {
        self.firmware_id = Some(id);
        self
    }

    /// Force updates
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Set the pump poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the flash timing
    pub fn with_flash_timing(mut self, timing: FlashTiming) -> Self {
        self.flash_timing = timing;
        self
    }

    fn update_options(&self) -> UpdateOptions {
        let mut options = UpdateOptions::default().with_force(self.force);
        options.firmware_id = self.firmware_id;
        options
    }
}

/// State shared with the pump thread
struct Shared {
    transport: RmiTransport,
    config: DeviceConfig,
    topology: Mutex<Option<DeviceTopology>>,
    report: Mutex<TouchReport>,
    /// Held for the whole duration of an update
    flash: Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| Error::Protocol(ProtocolError::LockPoisoned))
}

impl Shared {
    fn topology(&self) -> Result<DeviceTopology> {
        lock(&self.topology)?.clone().ok_or(Error::NotInitialized)
    }

    /// Discover, enable interrupts, mark configured and size the report
    ///
    /// With `strict` a failed status read is an error, otherwise it is
    /// only logged.
    fn configure(&self, strict: bool) -> Result<()> {
        let t = &self.transport;
        let topology = discover(t)?;
        let f01 = topology.device_control()?;

        let info = topology.info();
        if info.manufacturer_id != MANUFACTURER_SYNAPTICS {
            log::warn!(
                "rmi4: unexpected manufacturer id {}",
                info.manufacturer_id
            );
        }
        log::info!(
            "rmi4: product {}, firmware id {}",
            info.product_id,
            info.firmware_id
        );

        f01.write_interrupt_enable(t, topology.interrupt_mask())?;
        f01.set_configured(t)?;
        match f01.read_status(t) {
            Ok(status) if status.code() != 0 => {
                log::warn!("rmi4: device status code 0x{:X}", status.code())
            }
            Ok(_) => {}
            Err(e) if strict => return Err(e),
            Err(e) => log::warn!("rmi4: failed to read device status: {}", e),
        }

        let report = TouchReport::new(topology.max_fingers()).with_buttons(topology.button_count());
        *lock_report(&self.report)? = report;
        *lock(&self.topology)? = Some(topology);
        Ok(())
    }

    /// Reset the controller and configure it again
    fn reinit(&self) -> Result<()> {
        let f01 = self.topology()?.device_control()?;
        f01.reset(&self.transport, self.config.flash_timing.reset_delay)?;
        self.configure(false)
    }

    /// One interrupt cycle
    fn service(&self, sink: &mut dyn ReportSink) -> Result<()> {
        // an update owns the bus while it runs
        let _flash = match self.flash.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Ok(()),
            Err(TryLockError::Poisoned(_)) => return Err(ProtocolError::LockPoisoned.into()),
        };

        let dispatch = {
            let topology = lock(&self.topology)?;
            let topology = topology.as_ref().ok_or(Error::NotInitialized)?;
            service_interrupt(&self.transport, topology, &self.report)?
        };
        if dispatch.spontaneous_reset {
            log::info!("rmi4: reconfiguring after reset");
            return self.configure(false);
        }
        if let Some(touched) = dispatch.touch_count.or(dispatch.buttons) {
            let report = lock_report(&self.report)?;
            sink.report(&report, touched);
        }
        Ok(())
    }
}

/// One RMI4 touch controller
pub struct Rmi4Device {
    shared: Arc<Shared>,
    pump: Option<EventPump>,
}

impl Rmi4Device {
    /// Create a context; nothing is read from the device yet
    pub fn new(transport: RmiTransport, config: DeviceConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                topology: Mutex::new(None),
                report: Mutex::new(TouchReport::default()),
                flash: Mutex::new(()),
            }),
            pump: None,
        }
    }

    /// Register transport
    pub fn transport(&self) -> &RmiTransport {
        &self.shared.transport
    }

    /// Configuration
    pub fn config(&self) -> &DeviceConfig {
        &self.shared.config
    }

    /// Discover and configure the device without starting the pump
    pub fn probe(&self) -> Result<()> {
        self.shared.configure(true)
    }

    /// Discover the device, start the event pump and run the startup
    /// update when configured
    pub fn initialize<A, S>(&mut self, attention: A, sink: S) -> Result<()>
    where
        A: Attention + Send + 'static,
        S: ReportSink + Send + 'static,
    {
        self.probe()?;

        let shared = Arc::clone(&self.shared);
        let mut sink = sink;
        self.pump = Some(EventPump::spawn(
            attention,
            move || shared.service(&mut sink),
            self.shared.config.poll_interval,
        )?);
        log::info!("rmi4: initialized");

        if self.shared.config.update_on_startup {
            let result = match self.shared.config.image_path.clone() {
                Some(path) => self.start_firmware_update(&path, self.shared.config.firmware_id),
                None => {
                    log::warn!("rmi4: startup update requested without an image");
                    Ok(UpdateOutcome::UpToDate)
                }
            };
            if let Err(e) = result {
                log::error!("rmi4: startup update failed: {}", e);
                self.teardown();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stop the pump and release the discovered functions
    pub fn teardown(&mut self) {
        if let Some(mut pump) = self.pump.take() {
            pump.stop();
        }
        if let Ok(mut topology) = lock(&self.shared.topology) {
            *topology = None;
        }
        if let Ok(mut report) = lock_report(&self.shared.report) {
            *report = TouchReport::default();
        }
        log::info!("rmi4: torn down");
    }

    /// True while the event pump thread runs
    pub fn is_pumping(&self) -> bool {
        self.pump.as_ref().is_some_and(EventPump::is_running)
    }

    /// Copy of the current topology
    pub fn topology(&self) -> Result<DeviceTopology> {
        self.shared.topology()
    }

    /// Product identification
    pub fn info(&self) -> Result<DeviceInfo> {
        Ok(self.topology()?.info().clone())
    }

    /// Reset the controller and rediscover it
    pub fn reinit(&self) -> Result<()> {
        self.shared.reinit()
    }

    /// Handle one interrupt cycle on the calling thread
    pub fn service_once(&self, sink: &mut dyn ReportSink) -> Result<()> {
        self.shared.service(sink)
    }

    /// Load an image file and update the device with it
    ///
    /// The image is parsed before the device is touched. A request made
    /// while another update runs returns [`Error::Busy`].
    pub fn start_firmware_update(
        &self,
        path: &Path,
        firmware_id: Option<u32>,
    ) -> Result<UpdateOutcome> {
        let image = FirmwareImage::from_file(path)?;
        let mut options = self.shared.config.update_options();
        if firmware_id.is_some() {
            options.firmware_id = firmware_id;
        }
        self.update(&image, &options, &mut NoProgress)
    }

    /// Update the device with a parsed image
    ///
    /// On success the controller is reset and rediscovered, and the
    /// touch report is reallocated for the new finger count.
    pub fn update(
        &self,
        image: &FirmwareImage,
        options: &UpdateOptions,
        progress: &mut dyn FlashProgress,
    ) -> Result<UpdateOutcome> {
        let _flash = match self.shared.flash.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                log::warn!("rmi4: update already in progress, request ignored");
                return Err(Error::Busy);
            }
            Err(TryLockError::Poisoned(_)) => return Err(ProtocolError::LockPoisoned.into()),
        };

        let t = &self.shared.transport;
        let topology = self.topology()?;
        let controller =
            FlashController::probe(t, topology.flash()?, self.shared.config.flash_timing)?;
        let area = {
            let mut session = FlashSession::new(
                t,
                topology.device_control()?,
                controller,
                image,
                &mut *progress,
            )?;
            session.start(options, topology.firmware_id())?
        };

        let outcome = match area {
            FlashArea::None => UpdateOutcome::UpToDate,
            area => {
                log::info!("rmi4: update finished, rediscovering");
                self.shared.reinit()?;
                UpdateOutcome::Updated(area)
            }
        };
        progress.complete(&outcome);
        Ok(outcome)
    }

    /// Read back a config area
    pub fn read_config(&self, area: ConfigArea) -> Result<Vec<u8>> {
        let _flash = lock(&self.shared.flash)?;
        let t = &self.shared.transport;
        let topology = self.topology()?;
        let mut controller =
            FlashController::probe(t, topology.flash()?, self.shared.config.flash_timing)?;
        let blocks = controller.area_blocks(area);
        controller.read_blocks(t, area, blocks)
    }

    /// Copy of the touch report
    pub fn snapshot(&self) -> Result<TouchReport> {
        Ok(lock_report(&self.shared.report)?.clone())
    }

    fn slot(&self, index: usize) -> Result<Option<TouchSlot>> {
        Ok(lock_report(&self.shared.report)?.slot(index).copied())
    }

    /// Finger `index` is on the sensor
    pub fn is_contact_down(&self, index: usize) -> Result<bool> {
        Ok(self.slot(index)?.is_some_and(|s| s.touched))
    }

    /// Contact id reported for finger `index`
    pub fn contact_id(&self, index: usize) -> u32 {
        index as u32
    }

    /// Position of finger `index`
    pub fn coords(&self, index: usize) -> Result<Option<(u16, u16)>> {
        Ok(self.slot(index)?.map(|s| (s.x, s.y)))
    }

    /// Number of finger slots
    pub fn max_touchpoints(&self) -> Result<usize> {
        Ok(lock_report(&self.shared.report)?.len())
    }

    /// Sensor extent along X
    pub fn width(&self) -> Result<u16> {
        Ok(self.topology()?.max_x())
    }

    /// Sensor extent along Y
    pub fn height(&self) -> Result<u16> {
        Ok(self.topology()?.max_y())
    }

    /// Button `index` is pressed
    pub fn button_state(&self, index: usize) -> Result<bool> {
        Ok(lock_report(&self.shared.report)?
            .buttons()
            .get(index)
            .copied()
            .unwrap_or(false))
    }
}

impl Drop for Rmi4Device {
    fn drop(&mut self) {
        if let Some(mut pump) = self.pump.take() {
            pump.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::PolledAttention;
    use crate::pdt::PdtEntry;
    use crate::testing::MockBus;

    fn register_map(bus: &MockBus) {
        bus.poke(0x00E9, PdtEntry::new(0x34, 1, 1, [0x80, 0x8F, 0x90, 0xB0]).as_bytes());
        bus.poke(0x00E3, PdtEntry::new(0x01, 0, 1, [0x00, 0x16, 0x17, 0x19]).as_bytes());
        bus.poke(0x00DD, PdtEntry::new(0x11, 0, 1, [0x20, 0x2F, 0x30, 0x40]).as_bytes());
        bus.poke(0x00D7, PdtEntry::new(0x1A, 0, 1, [0x78, 0x79, 0x7A, 0x7C]).as_bytes());
        bus.poke(0x0000, &[1]);
        bus.poke(0x0020, &[0x00, 0x01]);
        bus.poke(0x0036, &[0xFF, 0x03, 0xFF, 0x02]);
        bus.poke(0x0078, &[0x01]);
    }

    #[test]
    fn test_probe_configures_device() {
        let bus = MockBus::new();
        register_map(&bus);
        let device = Rmi4Device::new(bus.transport(), DeviceConfig::default());
        device.probe().unwrap();

        // interrupt enable covers F34, F01, F11 and F1A
        assert_eq!(bus.peek(0x0018), 0x0F);
        assert_eq!(bus.peek(0x0017) & 0x80, 0x80);
        assert_eq!(device.max_touchpoints().unwrap(), 2);
        assert_eq!(device.width().unwrap(), 1023);
        assert_eq!(device.height().unwrap(), 767);
        assert!(!device.is_contact_down(0).unwrap());
        assert!(!device.button_state(1).unwrap());
    }

    #[test]
    fn test_accessors_before_probe() {
        let bus = MockBus::new();
        let device = Rmi4Device::new(bus.transport(), DeviceConfig::default());
        assert_eq!(device.width(), Err(Error::NotInitialized));
        assert_eq!(device.max_touchpoints().unwrap(), 0);
        assert_eq!(device.coords(0).unwrap(), None);
    }

    #[test]
    fn test_service_once_decodes_touch() {
        let bus = MockBus::new();
        register_map(&bus);
        let device = Rmi4Device::new(bus.transport(), DeviceConfig::default());
        device.probe().unwrap();

        bus.poke(0x0019, &[0x00, 0b0100]);
        bus.poke(0x0040, &[0x01, 0x12, 0x04, 0x53, 0x21, 0x00]);
        let mut frames = Vec::new();
        device
            .service_once(&mut |report: &TouchReport, touched: usize| {
                frames.push((report.slot(0).copied(), touched))
            })
            .unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].1, 1);
        assert!(device.is_contact_down(0).unwrap());
        assert_eq!(device.coords(0).unwrap(), Some((0x123, 0x045)));
        assert_eq!(device.contact_id(1), 1);
    }

    #[test]
    fn test_service_reconfigures_after_spontaneous_reset() {
        let bus = MockBus::new();
        register_map(&bus);
        let device = Rmi4Device::new(bus.transport(), DeviceConfig::default());
        device.probe().unwrap();

        // controller lost its configuration
        bus.poke(0x0017, &[0x00]);
        bus.poke(0x0018, &[0x00]);
        bus.poke(0x0019, &[0x80, 0x00]);
        let mut calls = 0;
        device
            .service_once(&mut |_: &TouchReport, _: usize| calls += 1)
            .unwrap();

        assert_eq!(calls, 0);
        assert_eq!(bus.peek(0x0017) & 0x80, 0x80);
        assert_eq!(bus.peek(0x0018), 0x0F);
    }

    #[test]
    fn test_initialize_and_teardown() {
        let bus = MockBus::new();
        register_map(&bus);
        let mut device = Rmi4Device::new(
            bus.transport(),
            DeviceConfig::default().with_poll_interval(Duration::from_millis(5)),
        );
        device
            .initialize(
                PolledAttention::new(Duration::from_millis(1)),
                |_: &TouchReport, _: usize| {},
            )
            .unwrap();
        assert!(device.is_pumping());

        device.teardown();
        assert!(!device.is_pumping());
        assert_eq!(device.topology(), Err(Error::NotInitialized));
    }

    #[test]
    fn test_update_rejects_missing_image() {
        let bus = MockBus::new();
        register_map(&bus);
        let device = Rmi4Device::new(bus.transport(), DeviceConfig::default());
        device.probe().unwrap();
        bus.clear_log();

        let result = device.start_firmware_update(Path::new("/nonexistent/image.img"), None);
        assert_eq!(result, Err(crate::error::ImageError::Unreadable.into()));
        assert!(bus.writes().is_empty());
    }
}
