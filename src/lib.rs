//! A software UART on plain GPIO pins, and a streaming decoder for the
//! checksummed AKP tag records usually carried over it.
//!
//! The UART side is split in layers. [`tx::Transmitter`] bit-bangs frames
//! against a [`timer::BitTimer`], [`rx::SpanDecoder`] turns measured edge
//! spans into bytes with a scoring frame detector that tolerates jitter and
//! clock drift, and [`rx_poll::PollingReceiver`] is the simpler majority-vote
//! alternative. [`channel::GpioUart`] wires them to real pins and threads.
//!
//! The [`akp`] module is sans-io and can be used with any byte source.
//!
//! # Example
//! ```
//! use akp_link::akp::{decode_all, encode_tag, tag};
//! let bytes = encode_tag(tag(b"LA"), b"-33000").unwrap();
//! assert_eq!(decode_all(&bytes)[0].data_str(), Some("-33000"));
//! ```

pub mod akp;
pub mod channel;
mod frame;
mod nom_parser;
pub mod pin;
pub mod ring_buffer;
pub mod rx;
pub mod rx_poll;
pub mod span_queue;
pub mod timer;
pub mod tx;
pub mod types;

pub use akp::{DecodedTag, TagName, TagParseState};
pub use channel::{GpioUart, Options, RxMode};
pub use pin::{DigitalPin, MockPin, SysfsPin};
pub use ring_buffer::RingBuffer;
pub use types::{baud, BaudRate, BitSpan, BitTimingConfig, Direction, Level};

const CRC8_POLY: u8 = 0xD5;

static CRC8_TABLE: [u8; 256] = crc8_table();

const fn crc8_table() -> [u8; 256] {
    let mut table = [0; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ CRC8_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Table-driven CRC8, polynomial 0xD5, most significant bit first.
///
/// Pass the result of one call as the `seed` of the next to checksum
/// data in pieces.
pub fn crc8(bytes: &[u8], seed: u8) -> u8 {
    bytes
        .iter()
        .fold(seed, |crc, &byte| CRC8_TABLE[usize::from(crc ^ byte)])
}
