// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

// XMODEM-1k firmware transfer over a serial line
mod crc;
mod frame;
mod plan;
mod protocol;
mod sender;
mod receiver;
mod serial;

use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use log::{LevelFilter, error, info, warn};
use serialport::{DataBits, Parity, StopBits};
use simple_logger::SimpleLogger;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::time::Duration;
use serial::RealSerialPort;

#[derive(Parser)]
#[command(name = "xmodem1k")]
#[command(about = "Send firmware to a device waiting in XMODEM-1k receive mode", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyACM0 or COM1)
    #[arg(short, long, default_value = "/dev/ttyACM0")]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "115200")]
    baud: u32,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value = "8", value_name="BITS")]
    data_bits: u8,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none")]
    parity: String,

    /// Stop bits (1 or 2)
    #[arg(long, default_value = "1", value_name="BITS")]
    stop_bits: u8,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a binary image
    Send {
        /// File to send
        file: PathBuf,

        /// Prepend a flash header placing the image at this offset
        #[arg(long, value_parser = maybe_hex::<u32>, value_name = "OFFSET")]
        flash_offset: Option<u32>,

        /// Ask the receiver to skip read-back verification (needs --flash-offset)
        #[arg(long, requires = "flash_offset")]
        no_verify: bool,

        /// Wait after opening the port before looking for the ready marker
        #[arg(long, default_value = "3000", value_name = "MS")]
        settle_ms: u64,

        /// Resend a chunk this many times when the receiver answers NAK
        #[arg(long, default_value = "0")]
        retries: u32,
    },
    /// Act as the receiving device and write the image into a file
    Receive {
        /// Output file standing in for the flash
        output: PathBuf,

        /// Treat the first chunk as a flash header
        #[arg(long)]
        expect_header: bool,
    },
}

fn parse_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(format!("Invalid data bits: {}. Must be 5, 6, 7, or 8", bits)),
    }
}

fn parse_parity(parity: &str) -> Result<Parity, String> {
    match parity.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(format!("Invalid parity: {}. Must be 'none', 'odd', or 'even'", parity)),
    }
}

fn parse_stop_bits(bits: u8) -> Result<StopBits, String> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(format!("Invalid stop bits: {}. Must be 1 or 2", bits)),
    }
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.debug { LevelFilter::Debug } else { LevelFilter::Info };
    if let Err(e) = SimpleLogger::new().with_level(level).init() {
        eprintln!("Failed to set up logging: {}", e);
    }

    if let Err(e) = run(cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let data_bits = parse_data_bits(cli.data_bits)?;
    let parity = parse_parity(&cli.parity)?;
    let stop_bits = parse_stop_bits(cli.stop_bits)?;

    info!("Opening serial port: {}", cli.port);
    info!("Settings: {} baud, {:?}, {:?}, {:?}", cli.baud, data_bits, parity, stop_bits);

    let serial_port = RealSerialPort::open(&cli.port, cli.baud, data_bits, parity, stop_bits)
        .map_err(|e| format!("Failed to open serial port: {}", e))?;

    match cli.command {
        Commands::Send { file, flash_offset, no_verify, settle_ms, retries } => {
            let config = sender::SessionConfig {
                settle_delay: Duration::from_millis(settle_ms),
                max_retries: retries,
                ..Default::default()
            };
            send_file(serial_port, file, flash_offset, !no_verify, config)?;
            info!("Finished sending all chunks successfully");
        }
        Commands::Receive { output, expect_header } => {
            let config = receiver::ReceiverConfig { expect_header, ..Default::default() };
            receive_file(serial_port, output, config)?;
        }
    }
    Ok(())
}

fn send_file(
    serial_port: RealSerialPort,
    file: PathBuf,
    flash_offset: Option<u32>,
    verify: bool,
    config: sender::SessionConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    use plan::FlashHeader;
    use sender::{SenderFsm, run_session};

    let data = std::fs::read(&file)
        .map_err(|e| format!("Failed to read {}: {}", file.display(), e))?;
    info!("Sending file: {} ({} bytes)", file.display(), data.len());

    let size = u32::try_from(data.len()).map_err(|_| "Image does not fit a 32-bit flash header")?;
    let header = flash_offset.map(|offset| FlashHeader::new(offset, size, verify));
    if header.is_none() {
        warn!(
            "No flash header: the device will load the image as-is. \
             Some SoCs run it from SRAM instead of writing it to flash"
        );
    }

    let fsm = SenderFsm::for_payload(Box::new(serial_port), &data, header.as_ref(), config)?;

    match run_session(fsm) {
        Ok(report) => {
            info!("{} chunks acknowledged", report.frames);
            if report.retransmissions > 0 {
                info!("{} chunks resent after NAK", report.retransmissions);
            }
            Ok(())
        }
        Err(e) => {
            if let Some(index) = e.index() {
                error!("Transfer failed at chunk {}", index);
            }
            Err(e.into())
        }
    }
}

fn receive_file(
    serial_port: RealSerialPort,
    output: PathBuf,
    config: receiver::ReceiverConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    use receiver::{ReceiverFsm, run_receiver};

    // without a header the image lands at offset 0 and replaces the file
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(!config.expect_header)
        .open(&output)
        .map_err(|e| format!("Failed to open {}: {}", output.display(), e))?;
    info!("Receiving into: {}", output.display());

    let report = run_receiver(ReceiverFsm::new(Box::new(serial_port), Box::new(file), config))?;
    if let Some(header) = report.header {
        info!("Image placed at offset {:#x}", header.offset);
    }
    info!(
        "Received {} chunks, {} bytes written",
        report.frames, report.bytes_written
    );
    Ok(())
}
