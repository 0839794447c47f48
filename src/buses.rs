//! Bus registration and dispatch
//!
//! A bus string names a backend and its options, e.g.
//! `linux-i2c:dev=/dev/i2c-1,addr=0x20,irq=gpiochip0:17`. Opening it yields
//! the register transport and the attention source the device context
//! needs.

use rmi4_core::bus::{Attention, PolledAttention};
use rmi4_core::transport::RmiTransport;

/// Information about a bus backend
pub struct BusInfo {
    /// Primary name (used for matching)
    pub name: &'static str,
    /// Alternative names
    pub aliases: &'static [&'static str],
    /// Short description
    pub description: &'static str,
}

/// All bus backends enabled at compile time
#[allow(unused_mut, clippy::vec_init_then_push)]
pub fn available_buses() -> Vec<BusInfo> {
    let mut buses = Vec::new();

    #[cfg(feature = "dummy")]
    buses.push(BusInfo {
        name: "dummy",
        aliases: &[],
        description: "Simulated controller (protocol=f11|f12,bootloader=5-8,fingers=N,buttons=N)",
    });

    #[cfg(all(feature = "linux-i2c", target_os = "linux"))]
    buses.push(BusInfo {
        name: "linux-i2c",
        aliases: &["linux_i2c", "i2c"],
        description: "Linux i2c-dev adapter (dev=/dev/i2c-N,addr=0x20,irq=gpiochipN:line)",
    });

    buses
}

/// Help text listing all available buses
pub fn bus_help() -> String {
    let buses = available_buses();

    if buses.is_empty() {
        return "No buses available (recompile with bus features enabled)".to_string();
    }

    let mut help = String::from("Available buses:\n");
    for b in &buses {
        help.push_str(&format!("  {:10} - {}\n", b.name, b.description));
    }
    help
}

/// Canonical name of an available bus
fn find_bus(name: &str) -> Option<&'static str> {
    available_buses()
        .into_iter()
        .find(|b| b.name == name || b.aliases.contains(&name))
        .map(|b| b.name)
}

/// Parse a bus string into name and options
///
/// Format: "name" or "name:option1=value1,option2=value2". Only the first
/// colon separates the name, so option values may contain colons.
pub fn parse_bus_string(s: &str) -> (&str, Vec<(&str, &str)>) {
    if let Some((name, opts)) = s.split_once(':') {
        let options: Vec<_> = opts
            .split(',')
            .filter_map(|opt| opt.split_once('='))
            .collect();
        (name, options)
    } else {
        (s, Vec::new())
    }
}

/// An opened bus
pub struct OpenedBus {
    /// Register transport
    pub transport: RmiTransport,
    /// Interrupt source for the event pump
    pub attention: Box<dyn Attention + Send>,
}

/// Open the bus named by a bus string
#[allow(unused_variables)]
pub fn open_bus(spec: &str) -> Result<OpenedBus, Box<dyn std::error::Error>> {
    let (name, options) = parse_bus_string(spec);

    let canonical_name = match find_bus(name) {
        Some(n) => n,
        None => return Err(unknown_bus_error(name)),
    };

    match canonical_name {
        #[cfg(feature = "dummy")]
        "dummy" => {
            let config = rmi4_dummy::parse_options(&options)
                .map_err(|e| format!("Invalid dummy parameters: {}", e))?;
            log::info!(
                "Opening simulated controller ({:?} reports, bootloader {})",
                config.protocol,
                config.bootloader
            );
            let dummy = rmi4_dummy::DummyController::new(config);
            Ok(OpenedBus {
                transport: dummy.transport(),
                attention: Box::new(dummy.attention()),
            })
        }

        #[cfg(all(feature = "linux-i2c", target_os = "linux"))]
        "linux-i2c" => {
            log::info!("Opening Linux I2C adapter...");

            let backend = rmi4_linux::open_linux_i2c(&options).map_err(|e| {
                format!(
                    "Failed to open Linux I2C bus: {}\n\
                     Make sure i2c-dev is loaded and you have read/write permissions.\n\
                     No kernel driver may be bound to the controller address.",
                    e
                )
            })?;

            let attention: Box<dyn Attention + Send> = match backend.attention {
                Some(line) => Box::new(line),
                None => {
                    log::info!("No irq= given, polling the controller");
                    Box::new(PolledAttention::default())
                }
            };
            Ok(OpenedBus {
                transport: RmiTransport::new(backend.bus),
                attention,
            })
        }

        _ => Err(unknown_bus_error(name)),
    }
}

fn unknown_bus_error(name: &str) -> Box<dyn std::error::Error> {
    let mut msg = format!("Unknown bus: {}\n\n", name);
    msg.push_str(&bus_help());
    msg.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bus_string() {
        let (name, options) =
            parse_bus_string("linux-i2c:dev=/dev/i2c-1,addr=0x20,irq=gpiochip0:17");
        assert_eq!(name, "linux-i2c");
        assert_eq!(
            options,
            vec![
                ("dev", "/dev/i2c-1"),
                ("addr", "0x20"),
                ("irq", "gpiochip0:17")
            ]
        );
        assert_eq!(parse_bus_string("dummy"), ("dummy", vec![]));
    }

    #[test]
    fn test_unknown_bus() {
        assert!(open_bus("spi:dev=/dev/spidev0.0").is_err());
    }

    #[cfg(feature = "dummy")]
    #[test]
    fn test_open_dummy() {
        let bus = open_bus("dummy:protocol=f11,bootloader=6,fingers=5").unwrap();
        let topology = rmi4_core::topology::discover(&bus.transport).unwrap();
        assert_eq!(topology.max_fingers(), 5);
        assert!(open_bus("dummy:bootloader=9").is_err());
    }
}
