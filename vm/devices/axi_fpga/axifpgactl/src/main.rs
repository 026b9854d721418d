// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A command line utility to inspect and exercise an FPGA-attached AXI
//! device from Linux user mode.

mod config;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser)]
#[clap(name = "axifpgactl", about = "Tool to inspect and exercise an AXI FPGA device")]
struct Options {
    /// Device config file path
    #[clap(short, long)]
    config: PathBuf,
    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Print the device attributes
    Info,
    /// Open the device and wait for completion interrupts
    Wait {
        /// Number of completions to wait for
        #[clap(short = 'n', long, default_value_t = 1)]
        count: u32,
    },
    /// Read a 32-bit control register
    Peek {
        /// Byte offset into the control window
        #[clap(short, long, value_parser = parse_number)]
        offset: u64,
    },
    /// Write a 32-bit control register
    Poke {
        /// Byte offset into the control window
        #[clap(short, long, value_parser = parse_number)]
        offset: u64,
        /// Value to write
        #[clap(short, long, value_parser = parse_number)]
        value: u64,
    },
}

/// Parses a decimal or `0x`-prefixed hexadecimal number.
fn parse_number(s: &str) -> Result<u64, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn main() -> anyhow::Result<()> {
    let opts = Options::parse();
    let filter = if std::env::var(EnvFilter::DEFAULT_ENV).is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::default().add_directive(LevelFilter::INFO.into())
    };
    tracing_subscriber::fmt()
        .log_internal_errors(true)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let config = config::Config::load(&opts.config).context("loading device config")?;
    run(config, opts.command)
}

#[cfg(target_os = "linux")]
fn run(config: config::Config, command: Command) -> anyhow::Result<()> {
    use axi_fpga::Device;
    use axi_fpga::linux::DevMem;
    use axi_fpga::linux::UioBacking;
    use axi_fpga::resources::Attribute;

    let backing = UioBacking::new(&config.resources.name, config.uio);
    let device = Device::new(config.resources, backing).context("invalid device resources")?;

    let control_offset = |offset: u64| -> anyhow::Result<usize> {
        let control_len = device.resources().control_len;
        if offset % 4 != 0 || offset.checked_add(4).is_none_or(|end| end > control_len) {
            anyhow::bail!("offset {offset:#x} is not an aligned register in the control window");
        }
        Ok(offset as usize)
    };

    match command {
        Command::Info => {
            for attr in Attribute::ALL {
                print!("{}: {}", attr.name(), device.attribute(attr));
            }
            println!("irq: {}", device.resources().irq);
        }
        Command::Wait { count } => {
            let session = device.open().context("opening device")?;
            tracing::info!(count, "waiting for completions");
            for i in 0..count {
                session.read().context("waiting for completion")?;
                tracing::debug!(completion = i + 1, "completion received");
                println!("completion {}", i + 1);
            }
        }
        Command::Peek { offset } => {
            let offset = control_offset(offset)?;
            let session = device.open().context("opening device")?;
            let len = device.resources().window_len() as usize;
            let window = session.mmap(&DevMem, len, 0).context("mapping device")?;
            let value = window.get().read_u32(offset);
            tracing::debug!(offset, value, "read control register");
            println!("{value:#010x}");
        }
        Command::Poke { offset, value } => {
            let offset = control_offset(offset)?;
            let value = u32::try_from(value).context("value does not fit in 32 bits")?;
            let session = device.open().context("opening device")?;
            let len = device.resources().window_len() as usize;
            let window = session.mmap(&DevMem, len, 0).context("mapping device")?;
            window.get().write_u32(offset, value);
            tracing::debug!(offset, value, "wrote control register");
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run(_config: config::Config, _command: Command) -> anyhow::Result<()> {
    anyhow::bail!("axifpgactl is only supported on Linux")
}

#[cfg(test)]
mod tests {
    use super::Command;
    use super::Options;
    use super::parse_number;
    use clap::Parser;
    use test_with_tracing::test;

    #[test]
    fn numbers() {
        assert_eq!(parse_number("16").unwrap(), 16);
        assert_eq!(parse_number("0x10").unwrap(), 16);
        assert_eq!(parse_number("0X1f").unwrap(), 31);
        parse_number("0xg").unwrap_err();
    }

    #[test]
    fn command_line() {
        let opts =
            Options::try_parse_from(["axifpgactl", "-c", "dev.json", "poke", "-o", "0x10", "-v", "7"])
                .unwrap();
        assert!(matches!(
            opts.command,
            Command::Poke {
                offset: 0x10,
                value: 7
            }
        ));
        let opts = Options::try_parse_from(["axifpgactl", "--config", "dev.json", "wait"]).unwrap();
        assert!(matches!(opts.command, Command::Wait { count: 1 }));
    }
}
