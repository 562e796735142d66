use anyhow::{bail, Context, Result};
use serialport::{DataBits, Parity, StopBits};
use std::io::{ErrorKind, Read};

use akp_link::akp::DecodedTag;
use akp_link::{BitTimingConfig, TagParseState};

fn show(record: &DecodedTag, depth: usize) {
    let indent = "  ".repeat(depth);
    match record.data_str() {
        _ if record.is_dd() => {
            println!("{}DD, {} bytes", indent, record.data().len());
            for nested in record.nested() {
                show(&nested, depth + 1);
            }
        }
        Some(text) => println!("{}{} = {}", indent, record.tag(), text),
        None => println!("{}{} = {:02x?}", indent, record.tag(), record.data()),
    }
}

/// Print the AKP records arriving on a hardware serial port.
///
/// Usage: akp_monitor [port] [line settings, e.g. 9600-8N1]
fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let port = args.next().unwrap_or_else(|| "/dev/ttyACM0".to_string());
    let settings = args.next().unwrap_or_else(|| "9600-8N1".to_string());
    let config: BitTimingConfig = settings
        .parse()
        .with_context(|| format!("Bad line settings {:?}", settings))?;
    if config.inverting_logic() {
        bail!("Inverting logic is only available on GPIO channels");
    }

    let mut serial = serialport::new(&port, *config.baud())
        .data_bits(DataBits::Eight)
        .parity(if config.parity() {
            Parity::Even
        } else {
            Parity::None
        })
        .stop_bits(if config.second_stop_bit() {
            StopBits::Two
        } else {
            StopBits::One
        })
        .timeout(std::time::Duration::from_millis(100))
        .open()
        .with_context(|| format!("Failed to open serial port {}", port))?;
    log::info!("Listening on {}, {}", port, config);

    let mut state = TagParseState::<Vec<u8>>::new();
    let mut buf = [0; 64];
    loop {
        let len = match serial.read(&mut buf) {
            Ok(len) => len,
            Err(e) if e.kind() == ErrorKind::TimedOut => continue,
            Err(e) => return Err(e).context("Serial port read failed"),
        };
        for &byte in &buf[..len] {
            if let Some(record) = state.feed(byte) {
                show(&record, 0);
            }
        }
    }
}
