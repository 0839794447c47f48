//! Event pump
//!
//! [`service_interrupt`] handles one attention assertion: it reads the
//! device status and interrupt status registers and dispatches to every
//! function whose sources are pending. [`EventPump`] runs it on a
//! dedicated thread for as long as the device is initialized.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::bus::Attention;
use crate::error::{Error, Result};
use crate::function::f01::DeviceStatus;
use crate::function::{FunctionKind, TouchSensor};
use crate::topology::DeviceTopology;
use crate::touch::TouchReport;
use crate::transport::RmiTransport;

/// Receives decoded touch frames
///
/// Called with the report lock held, so the frame is consistent.
pub trait ReportSink {
    /// A decode cycle finished with `touched` slots down
    fn report(&mut self, report: &TouchReport, touched: usize);
}

impl<F: FnMut(&TouchReport, usize)> ReportSink for F {
    fn report(&mut self, report: &TouchReport, touched: usize) {
        self(report, touched)
    }
}

/// What one interrupt cycle produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    /// Device status register
    pub status: DeviceStatus,
    /// Touch count when the 2D sensor decoded a frame
    pub touch_count: Option<usize>,
    /// Pressed buttons when the button sensor reported
    pub buttons: Option<usize>,
    /// Controller reset itself and needs to be configured again
    pub spontaneous_reset: bool,
}

/// Read the interrupt status and run the pending function handlers
///
/// Decode errors are logged and leave the cycle without data; only a
/// failure to read the status registers is returned.
pub fn service_interrupt(
    transport: &RmiTransport,
    topology: &DeviceTopology,
    report: &Mutex<TouchReport>,
) -> Result<Dispatch> {
    let f01 = topology.device_control()?;
    let (status, pending) = f01.read_status_and_interrupts(transport, topology.interrupt_registers())?;

    let mut dispatch = Dispatch {
        status,
        touch_count: None,
        buttons: None,
        spontaneous_reset: false,
    };
    if status.is_spontaneous_reset() {
        log::warn!("rmi4: spontaneous reset detected (status 0x{:02X})", status.0);
        dispatch.spontaneous_reset = true;
        return Ok(dispatch);
    }

    for function in topology.functions() {
        if !function.interrupt.is_pending(&pending) {
            continue;
        }
        match &function.kind {
            FunctionKind::DeviceControl(_) => {
                log::debug!("rmi4: device status 0x{:02X}", status.0);
            }
            FunctionKind::Touch(sensor) => match sensor.report(transport, report) {
                Ok(count) => dispatch.touch_count = Some(count),
                Err(e) => {
                    let name = match sensor {
                        TouchSensor::Legacy(_) => "F11",
                        TouchSensor::Object(_) => "F12",
                    };
                    log::warn!("rmi4: {} report failed: {}", name, e);
                }
            },
            FunctionKind::Button(buttons) => match buttons.report(transport, report) {
                Ok(pressed) => dispatch.buttons = Some(pressed),
                Err(e) => log::warn!("rmi4: F1A report failed: {}", e),
            },
            FunctionKind::Flash(_) => log::trace!("rmi4: F34 attention"),
            FunctionKind::Sensor => {
                log::trace!("rmi4: F{:02X} attention", function.number)
            }
        }
    }
    Ok(dispatch)
}

/// Background thread servicing attention assertions
pub struct EventPump {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EventPump {
    /// Spawn the pump thread
    ///
    /// `service` runs once per assertion; the line is unmasked after every
    /// call, whether it succeeded or not. `timeout` bounds how long a stop
    /// request can go unnoticed.
    pub fn spawn<A, F>(mut attention: A, mut service: F, timeout: Duration) -> Result<Self>
    where
        A: Attention + Send + 'static,
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("rmi4-pump".into())
            .spawn(move || {
                log::debug!("rmi4: event pump started");
                while !flag.load(Ordering::Relaxed) {
                    match attention.wait(timeout) {
                        Ok(true) => {}
                        Ok(false) => continue,
                        Err(e) => {
                            log::error!("rmi4: attention wait failed: {}", e);
                            break;
                        }
                    }
                    if let Err(e) = service() {
                        log::warn!("rmi4: interrupt cycle abandoned: {}", e);
                    }
                    if let Err(e) = attention.unmask() {
                        log::error!("rmi4: failed to unmask attention: {}", e);
                        break;
                    }
                }
                log::debug!("rmi4: event pump stopped");
            })
            .map_err(|e| {
                log::error!("rmi4: failed to spawn event pump: {}", e);
                Error::PumpStart
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// True while the pump thread is alive
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Ask the thread to stop and wait for it
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("rmi4: event pump panicked");
            }
        }
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::PolledAttention;
    use crate::pdt::PdtEntry;
    use crate::testing::MockBus;
    use crate::topology::discover;
    use std::sync::atomic::AtomicUsize;

    /// F34, F01 and F11 with two fingers
    fn register_map(bus: &MockBus) {
        bus.poke(0x00E9, PdtEntry::new(0x34, 1, 1, [0x80, 0x8F, 0x90, 0xB0]).as_bytes());
        bus.poke(0x00E3, PdtEntry::new(0x01, 0, 1, [0x00, 0x16, 0x17, 0x19]).as_bytes());
        bus.poke(0x00DD, PdtEntry::new(0x11, 0, 1, [0x20, 0x2F, 0x30, 0x40]).as_bytes());
        bus.poke(0x0000, &[1]);
        bus.poke(0x0020, &[0x00, 0x01]);
        bus.poke(0x0036, &[0xFF, 0x03, 0xFF, 0x02]);
    }

    #[test]
    fn test_dispatch_touch() {
        let bus = MockBus::new();
        register_map(&bus);
        let transport = bus.transport();
        let topology = discover(&transport).unwrap();
        let report = Mutex::new(TouchReport::new(topology.max_fingers()));

        // F11 owns bit 2; finger 0 present at (0x123, 0x045)
        bus.poke(0x0019, &[0x00, 0b100]);
        bus.poke(0x0040, &[0x01, 0x12, 0x04, 0x53, 0x21, 0x00]);
        let dispatch = service_interrupt(&transport, &topology, &report).unwrap();
        assert_eq!(dispatch.touch_count, Some(1));
        assert!(!dispatch.spontaneous_reset);

        let report = report.lock().unwrap();
        let slot = report.slot(0).unwrap();
        assert!(slot.touched);
        assert_eq!((slot.x, slot.y), (0x123, 0x045));
    }

    #[test]
    fn test_dispatch_skips_idle_functions() {
        let bus = MockBus::new();
        register_map(&bus);
        let transport = bus.transport();
        let topology = discover(&transport).unwrap();
        let report = Mutex::new(TouchReport::new(topology.max_fingers()));

        bus.poke(0x0019, &[0x00, 0b001]);
        bus.clear_log();
        let dispatch = service_interrupt(&transport, &topology, &report).unwrap();
        assert_eq!(dispatch.touch_count, None);
        assert_eq!(bus.reads(), vec![(0x0019, 2)]);
    }

    #[test]
    fn test_spontaneous_reset_stops_dispatch() {
        let bus = MockBus::new();
        register_map(&bus);
        let transport = bus.transport();
        let topology = discover(&transport).unwrap();
        let report = Mutex::new(TouchReport::new(topology.max_fingers()));

        bus.poke(0x0019, &[0x80, 0b100]);
        let dispatch = service_interrupt(&transport, &topology, &report).unwrap();
        assert!(dispatch.spontaneous_reset);
        assert_eq!(dispatch.touch_count, None);
    }

    #[test]
    fn test_pump_runs_service_until_stopped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut pump = EventPump::spawn(
            PolledAttention::new(Duration::from_millis(1)),
            move || {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            Duration::from_millis(5),
        )
        .unwrap();

        while calls.load(Ordering::Relaxed) < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(pump.is_running());
        pump.stop();
        assert!(!pump.is_running());
    }
}
