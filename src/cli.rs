//! CLI argument parsing

use clap::{Parser, Subcommand, ValueEnum};
use rmi4_core::flash::ConfigArea;
use std::path::PathBuf;

/// Parse a string as a hex or decimal u32
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u32>().map_err(|e| format!("Invalid number: {}", e))
    }
}

const BUS_HELP: &str = "Bus to use, e.g. linux-i2c:dev=/dev/i2c-1,addr=0x20,irq=gpiochip0:17 \
                        or dummy:protocol=f12,bootloader=7 (falls back to `bus` in the config file)";

/// Keys accepted in the `--config` file
pub const CONFIG_KEYS: &[(&str, &str)] = &[
    ("bus", "Bus selection string used when --bus is not given"),
    ("fw_update_startup", "Update the firmware when `watch` initializes the device"),
    ("fw_img", "Firmware image for `update` and the startup update"),
    ("fw_img_id", "Firmware id of the image, hex string or integer"),
    ("force", "Program the image even when the device already runs it"),
];

#[derive(Parser)]
#[command(name = "rmi4ctl")]
#[command(author, version, about = "Synaptics RMI4 touch controller tool", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Configuration file (TOML format)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Bus selection shared across commands
#[derive(clap::Args, Debug, Clone, Default)]
pub struct BusArgs {
    #[arg(short, long, help = BUS_HELP)]
    pub bus: Option<String>,
}

/// Config areas that can be read back
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaArg {
    /// UI (core) config
    Ui,
    /// Permanent config
    Permanent,
    /// Bootloader config (global parameters)
    Bootloader,
    /// Display config
    Display,
    /// Flash config (partition table)
    Flash,
}

impl From<AreaArg> for ConfigArea {
    fn from(area: AreaArg) -> Self {
        match area {
            AreaArg::Ui => ConfigArea::Ui,
            AreaArg::Permanent => ConfigArea::Permanent,
            AreaArg::Bootloader => ConfigArea::Bootloader,
            AreaArg::Display => ConfigArea::Display,
            AreaArg::Flash => ConfigArea::Flash,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Discover the controller and show its functions
    Info {
        #[command(flatten)]
        bus: BusArgs,
    },

    /// Run the event pump and print touch reports
    Watch {
        #[command(flatten)]
        bus: BusArgs,

        /// Stop after this many seconds (runs until interrupted otherwise)
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Update the controller firmware
    Update {
        #[command(flatten)]
        bus: BusArgs,

        /// Firmware image (falls back to `fw_img` in the config file)
        #[arg(short, long)]
        image: Option<PathBuf>,

        /// Program firmware and config regardless of ids
        #[arg(short, long)]
        force: bool,

        /// Firmware id of the image, overriding the one it declares (hex or decimal)
        #[arg(long, value_parser = parse_hex_u32)]
        expect_id: Option<u32>,
    },

    /// Parse an image file and show its sections
    Image {
        /// Firmware image
        file: PathBuf,
    },

    /// Read back a config area
    ReadConfig {
        #[command(flatten)]
        bus: BusArgs,

        /// Area to read
        #[arg(short, long, value_enum, default_value = "ui")]
        area: AreaArg,

        /// Output file (hex dump to stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Reset the controller and rediscover it
    Reset {
        #[command(flatten)]
        bus: BusArgs,
    },
}
