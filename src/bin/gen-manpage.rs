//! Man page generator for rmi4ctl
//!
//! Writes `rmi4ctl.1` with a FILES section describing the config file, plus
//! one `rmi4ctl-<command>.1` page per subcommand.
//!
//! Usage: cargo run --bin gen-manpage -- [output-dir]

use clap::CommandFactory;
use clap_mangen::roff::{bold, roman, Roff};
use clap_mangen::Man;
use std::fs;
use std::path::{Path, PathBuf};

#[path = "../cli.rs"]
#[allow(dead_code)]
mod cli;

/// FILES section listing every key of the `--config` file
fn config_section() -> Roff {
    let mut roff = Roff::new();
    roff.control("SH", ["FILES"]);
    roff.text([roman(
        "The file given with --config is TOML. Command line options take precedence over it.",
    )]);
    for (key, help) in cli::CONFIG_KEYS {
        roff.control("TP", Vec::<&str>::new());
        roff.text([bold(*key)]);
        roff.text([roman(*help)]);
    }
    roff
}

fn write_page(path: &Path, man: &Man, extra: Option<&Roff>) -> std::io::Result<()> {
    let mut buffer = Vec::new();
    man.render(&mut buffer)?;
    if let Some(roff) = extra {
        roff.to_writer(&mut buffer)?;
    }
    fs::write(path, buffer)?;
    println!("Man page generated at: {}", path.display());
    Ok(())
}

fn main() -> std::io::Result<()> {
    let output_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("man"));
    fs::create_dir_all(&output_dir)?;

    let cmd = cli::Cli::command();
    for sub in cmd.get_subcommands() {
        let name = format!("rmi4ctl-{}", sub.get_name());
        let page = Man::new(sub.clone().name(name.clone()));
        write_page(&output_dir.join(format!("{}.1", name)), &page, None)?;
    }
    write_page(
        &output_dir.join("rmi4ctl.1"),
        &Man::new(cmd),
        Some(&config_section()),
    )?;

    Ok(())
}
