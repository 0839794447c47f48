//! rmi4ctl - Synaptics RMI4 touch controller tool
//!
//! Discovers a controller on a register bus, prints its touch reports and
//! updates its firmware.
//!
//! # Architecture
//!
//! All protocol logic lives in `rmi4-core`. This binary only selects a bus
//! backend (see [`buses`]), builds an `Rmi4Device` from the optional config
//! file and runs one command against it:
//! - **dummy** - a simulated controller, useful for trying every command
//! - **linux-i2c** - a real controller on a Linux i2c-dev adapter

mod buses;
mod cli;
mod commands;
mod config;

use clap::Parser;
use cli::{BusArgs, Cli, Commands};
use config::FileConfig;
use rmi4_core::device::Rmi4Device;
use rmi4_core::flash::UpdateOptions;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    let file = match &cli.config {
        Some(path) => FileConfig::from_file(path).map_err(|e| {
            let keys: Vec<&str> = cli::CONFIG_KEYS.iter().map(|(key, _)| *key).collect();
            format!("{} (valid keys: {})", e, keys.join(", "))
        })?,
        None => FileConfig::default(),
    };

    let result = match cli.command {
        Commands::Info { bus } => {
            let device = open_device(&bus, &file)?;
            commands::info::run_info(&device)
        }
        Commands::Watch { bus, seconds } => {
            let opened = buses::open_bus(&bus_spec(&bus, &file)?)?;
            let mut device = Rmi4Device::new(opened.transport, file.device_config());
            commands::watch::run_watch(&mut device, opened.attention, seconds)
        }
        Commands::Update {
            bus,
            image,
            force,
            expect_id,
        } => {
            let path = image
                .or_else(|| file.fw_img.clone())
                .ok_or("No image given. Use --image or set fw_img in the config file")?;
            let mut options = UpdateOptions::default().with_force(force || file.force);
            options.firmware_id = expect_id.or(file.fw_img_id);
            let device = open_device(&bus, &file)?;
            commands::update::run_update(&device, &path, &options)
        }
        Commands::Image { file: path } => commands::image::run_image(&path),
        Commands::ReadConfig { bus, area, output } => {
            let device = open_device(&bus, &file)?;
            commands::read_config::run_read_config(&device, area.into(), output.as_deref())
        }
        Commands::Reset { bus } => {
            let device = open_device(&bus, &file)?;
            commands::reset::run_reset(&device)
        }
    };

    if let Err(e) = &result {
        log::error!("{}", e);
    }
    result
}

/// Bus string from the command line, falling back to the config file
fn bus_spec(args: &BusArgs, file: &FileConfig) -> Result<String, Box<dyn std::error::Error>> {
    args.bus
        .clone()
        .or_else(|| file.bus.clone())
        .ok_or_else(|| {
            format!(
                "No bus given. Use --bus or set bus in the config file\n\n{}",
                buses::bus_help()
            )
            .into()
        })
}

/// Open the bus and probe the controller without starting the event pump
fn open_device(args: &BusArgs, file: &FileConfig) -> Result<Rmi4Device, Box<dyn std::error::Error>> {
    let opened = buses::open_bus(&bus_spec(args, file)?)?;
    let device = Rmi4Device::new(opened.transport, file.device_config());
    device.probe()?;
    Ok(device)
}
