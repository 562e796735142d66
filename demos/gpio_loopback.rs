use anyhow::{Context, Result};
use std::thread;
use std::time::{Duration, Instant};

use akp_link::akp::{decode_all, write_dd, write_tag, TagName};
use akp_link::channel::{GpioUart, Options};
use akp_link::timer::MonotonicClock;
use akp_link::{BitTimingConfig, Level, MockPin, SysfsPin};

fn records() -> Result<Vec<u8>> {
    let mut inner = Vec::new();
    write_tag(&mut inner, TagName::new("TE")?, b"21.5")?;
    write_tag(&mut inner, TagName::new("PR")?, b"1013")?;

    let mut out = Vec::new();
    write_tag(&mut out, TagName::new("LA")?, b"-33000")?;
    write_tag(&mut out, TagName::new("LO")?, b"151200")?;
    write_dd(&mut out, &inner)?;
    Ok(out)
}

fn exchange(uart: &GpioUart, bytes: &[u8]) -> Vec<u8> {
    uart.send(bytes);
    let deadline = Instant::now() + uart.config().bit_period() * (bytes.len() * 40) as u32;
    while uart.available() < bytes.len() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    let mut buf = vec![0; uart.available()];
    let n = uart.receive(&mut buf);
    buf.truncate(n);
    buf
}

/// Send AKP records out of one GPIO and read them back on another.
///
/// Usage: gpio_loopback [line settings] [rx pin] [tx pin] [--polling]
/// Without pin numbers the pins are simulated in memory.
fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let polling = args.iter().any(|a| a == "--polling");
    let mut args = args.iter().filter(|a| !a.starts_with("--"));
    let config: BitTimingConfig = args
        .next()
        .map_or("1200-8N1", String::as_str)
        .parse()
        .context("Bad line settings")?;
    let options = if polling {
        Options::polling()
    } else {
        Options::default()
    };
    let pins = match (args.next(), args.next()) {
        (Some(rx), Some(tx)) => Some((
            rx.parse::<u32>().context("Bad rx pin number")?,
            tx.parse::<u32>().context("Bad tx pin number")?,
        )),
        _ => None,
    };

    let clock = MonotonicClock::new();
    let mut uart = match pins {
        Some((rx, tx)) => {
            GpioUart::start(config, SysfsPin::new(rx), SysfsPin::new(tx), clock, options)
        }
        None => {
            let line = MockPin::new(Level::High);
            GpioUart::start(config, line.clone(), line, clock, options)
        }
    }
    .context("Could not start the software UART")?;

    let sent = records()?;
    let received = exchange(&uart, &sent);
    uart.stop();

    println!("sent {} bytes, received {}", sent.len(), received.len());
    for record in decode_all(&received) {
        println!("{} {:?}", record.tag(), String::from_utf8_lossy(record.data()));
        for nested in record.nested() {
            println!("  {} {:?}", nested.tag(), String::from_utf8_lossy(nested.data()));
        }
    }
    Ok(())
}
