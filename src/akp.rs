//! Streaming decoder and encoder for AKP tag records.
//!
//! An ordinary record is `TAG^DATA:CC`, where `TAG` is two uppercase ASCII
//! letters, `DATA` is any run of bytes without a `:`, and `CC` is the
//! [`checksum`] of tag and data as two lowercase hex digits.
//!
//! The `DD` tag carries a binary payload instead: `DD^LLLLllll<payload>`,
//! where `LLLL` and `llll` are the payload length written twice in lowercase hex.
//! The payload is usually a concatenation of further records, see
//! [`DecodedTag::nested()`].
//!
//! Decoding is sans-io: feed one byte at a time into a [`TagParseState`] and
//! collect the records it hands back. Corrupt input never produces an error,
//! the partial record is dropped and the decoder resynchronises on the next
//! tag start.

use arrayvec::ArrayVec;
use log::{debug, trace};
use snafu::{ensure, Snafu};

use core::convert::TryInto;
use core::fmt;
use core::mem;

use crate::crc8;

/// Largest ordinary record payload the heap-backed decoder accepts.
pub const DEFAULT_MAX_DATA_LEN: usize = 4096;

/// Data capacity of [`CompactTagParseState`].
pub const FIXED_DATA_CAPACITY: usize = 31;

const INITIAL_CAPACITY: usize = 32;

/// Error type for the encoding side of this module
#[derive(Debug, Snafu, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Tag names are two uppercase ASCII letters"))]
    InvalidTagName,
    #[snafu(display("Record data must not contain ':'"))]
    ColonInData,
    #[snafu(display("Record data must not contain a tag start"))]
    TagStartInData,
    #[snafu(display("DD payload of {} bytes is too long", len))]
    PayloadTooLong { len: usize },
}

/// Two uppercase ASCII letters naming a record.
#[derive(PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub struct TagName([u8; 2]);

/// The tag of binary, length-prefixed records.
pub const DD: TagName = TagName(*b"DD");

/// Create a new [`TagName`], panics if it isn't two uppercase letters.
pub const fn tag(name: &[u8; 2]) -> TagName {
    if !(name[0].is_ascii_uppercase() && name[1].is_ascii_uppercase()) {
        panic!("Invalid tag name.")
    }
    TagName(*name)
}

impl TagName {
    /// Create a new tag name, checking that it's two uppercase ASCII letters.
    pub fn new(name: impl AsRef<[u8]>) -> Result<Self, Error> {
        let name: [u8; 2] = name
            .as_ref()
            .try_into()
            .map_err(|_| Error::InvalidTagName)?;
        ensure!(
            name.iter().all(u8::is_ascii_uppercase),
            InvalidTagNameSnafu
        );
        Ok(Self(name))
    }

    pub const fn as_bytes(&self) -> &[u8; 2] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Always ASCII, see constructors.
        core::str::from_utf8(&self.0).unwrap_or("??")
    }

    pub fn is_dd(&self) -> bool {
        *self == DD
    }
}

impl fmt::Display for TagName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for TagName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TagName({})", self.as_str())
    }
}

/// CRC8 over the tag name followed by the data.
pub fn checksum(tag: TagName, data: &[u8]) -> u8 {
    crc8(data, crc8(tag.as_bytes(), 0))
}

pub(crate) fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

/// Two uppercase letters followed by `^`.
pub(crate) fn is_tag_start(window: &[u8]) -> bool {
    matches!(window, [a, b, b'^'] if a.is_ascii_uppercase() && b.is_ascii_uppercase())
}

/// Storage for the data of the record being decoded.
pub trait TagBuffer: Default {
    /// Drop the contents, keeping any allocated storage.
    fn clear(&mut self);
    /// Append one byte. Returns `false` if the byte was dropped because the buffer is full.
    fn push_byte(&mut self, byte: u8) -> bool;
    /// Prepare for a binary payload of `len` bytes.
    /// Returns `false` if the buffer can never hold it.
    fn reserve_payload(&mut self, len: usize) -> bool;
    fn as_bytes(&self) -> &[u8];
    /// Move the contents out, leaving an empty buffer behind.
    fn take(&mut self) -> Self;
}

impl TagBuffer for Vec<u8> {
    fn clear(&mut self) {
        Vec::clear(self);
    }

    fn push_byte(&mut self, byte: u8) -> bool {
        if self.len() == self.capacity() {
            // Doubling, starting from INITIAL_CAPACITY.
            self.reserve_exact(self.capacity().max(INITIAL_CAPACITY));
        }
        self.push(byte);
        true
    }

    fn reserve_payload(&mut self, len: usize) -> bool {
        self.reserve_exact(len);
        true
    }

    fn as_bytes(&self) -> &[u8] {
        self.as_slice()
    }

    fn take(&mut self) -> Self {
        mem::replace(self, Vec::with_capacity(INITIAL_CAPACITY))
    }
}

/// Fixed storage for targets without an allocator. Excess data bytes of
/// ordinary records are silently dropped, and the checksum is verified
/// over the bytes that were kept.
impl<const N: usize> TagBuffer for ArrayVec<u8, N> {
    fn clear(&mut self) {
        ArrayVec::clear(self);
    }

    fn push_byte(&mut self, byte: u8) -> bool {
        self.try_push(byte).is_ok()
    }

    fn reserve_payload(&mut self, len: usize) -> bool {
        len <= N
    }

    fn as_bytes(&self) -> &[u8] {
        self.as_slice()
    }

    fn take(&mut self) -> Self {
        mem::take(self)
    }
}

/// A complete, checksum-verified record.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct DecodedTag<B = Vec<u8>> {
    tag: TagName,
    data: B,
}

impl<B: TagBuffer> DecodedTag<B> {
    pub fn tag(&self) -> TagName {
        self.tag
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_bytes()
    }

    /// The data as text, if it is valid UTF-8.
    pub fn data_str(&self) -> Option<&str> {
        core::str::from_utf8(self.data()).ok()
    }

    pub fn is_dd(&self) -> bool {
        self.tag.is_dd()
    }

    pub fn into_data(self) -> B {
        self.data
    }

    /// Decode the records embedded in a `DD` payload.
    /// Returns an empty list for any other tag.
    pub fn nested(&self) -> Vec<DecodedTag> {
        if self.is_dd() {
            decode_all(self.data())
        } else {
            Vec::new()
        }
    }
}

impl DecodedTag {
    pub fn new(tag: TagName, data: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            data: data.into(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Stage {
    /// Waiting for a tag start.
    Scanning,
    /// Ordinary record data, until the colon.
    Data { received: usize },
    /// Checksum digits after the colon.
    Check { first: Option<u8> },
    /// The two redundant DD length fields.
    DdLength { digits: u8, first: u16, second: u16 },
    /// Raw DD payload.
    DdPayload { len: usize, received: usize },
}

impl Stage {
    const fn in_dd(self) -> bool {
        matches!(self, Stage::DdLength { .. } | Stage::DdPayload { .. })
    }
}

/// Incremental decoder state.
///
/// ```
/// use akp_link::akp::{encode_tag, tag, TagParseState};
/// let mut stream = b"noise".to_vec();
/// stream.extend(encode_tag(tag(b"LA"), b"-33000").unwrap());
///
/// let mut state = TagParseState::<Vec<u8>>::new();
/// let records: Vec<_> = stream.iter().filter_map(|&b| state.feed(b)).collect();
/// assert_eq!(records[0].data_str(), Some("-33000"));
/// ```
#[derive(Debug, Clone)]
pub struct TagParseState<B = Vec<u8>> {
    lookback: [Option<u8>; 2],
    tag: [u8; 2],
    stage: Stage,
    data: B,
    max_data_len: usize,
}

/// Decoder with fixed storage for `N` data bytes.
pub type FixedTagParseState<const N: usize> = TagParseState<ArrayVec<u8, N>>;

/// Decoder for small targets, keeping at most [`FIXED_DATA_CAPACITY`] data bytes.
pub type CompactTagParseState = FixedTagParseState<FIXED_DATA_CAPACITY>;

impl<B: TagBuffer> Default for TagParseState<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: TagBuffer> TagParseState<B> {
    pub fn new() -> Self {
        Self {
            lookback: [None; 2],
            tag: [0; 2],
            stage: Stage::Scanning,
            data: B::default(),
            max_data_len: DEFAULT_MAX_DATA_LEN,
        }
    }

    /// Ordinary records with more data than this are dropped.
    pub fn with_max_data_len(mut self, max_data_len: usize) -> Self {
        self.max_data_len = max_data_len;
        self
    }

    /// Forget any partial record and the lookback, as if newly created.
    pub fn reset(&mut self) {
        self.lookback = [None; 2];
        self.stage = Stage::Scanning;
        self.data.clear();
    }

    /// True while no record is in progress.
    pub fn is_idle(&self) -> bool {
        self.stage == Stage::Scanning
    }

    /// Consume one byte. Returns a record when this byte completes one.
    pub fn feed(&mut self, byte: u8) -> Option<DecodedTag<B>> {
        let [before, previous] = self.lookback;
        self.lookback = [previous, Some(byte)];

        if !self.stage.in_dd() && byte == b'^' {
            if let (Some(a), Some(b)) = (before, previous) {
                if a.is_ascii_uppercase() && b.is_ascii_uppercase() {
                    self.begin([a, b]);
                    return None;
                }
            }
        }

        match self.stage {
            Stage::Scanning => None,
            Stage::Data { received } => self.data_byte(byte, received),
            Stage::Check { first } => self.check_byte(byte, first),
            Stage::DdLength {
                digits,
                first,
                second,
            } => self.length_byte(byte, digits, first, second),
            Stage::DdPayload { len, received } => {
                self.data.push_byte(byte);
                if received + 1 == len {
                    self.complete()
                } else {
                    self.stage = Stage::DdPayload {
                        len,
                        received: received + 1,
                    };
                    None
                }
            }
        }
    }

    fn begin(&mut self, tag: [u8; 2]) {
        if !self.is_idle() {
            debug!(
                "AKP: {} record interrupted by a new tag start",
                String::from_utf8_lossy(&self.tag)
            );
        }
        self.tag = tag;
        self.data.clear();
        self.stage = if &tag == DD.as_bytes() {
            Stage::DdLength {
                digits: 0,
                first: 0,
                second: 0,
            }
        } else {
            Stage::Data { received: 0 }
        };
    }

    fn data_byte(&mut self, byte: u8, received: usize) -> Option<DecodedTag<B>> {
        if byte == b':' {
            self.stage = Stage::Check { first: None };
        } else if received == self.max_data_len {
            return self.abort("no colon within the data length limit");
        } else {
            if !self.data.push_byte(byte) {
                trace!("AKP: data buffer full, byte dropped");
            }
            self.stage = Stage::Data {
                received: received + 1,
            };
        }
        None
    }

    fn check_byte(&mut self, byte: u8, first: Option<u8>) -> Option<DecodedTag<B>> {
        let nibble = match hex_nibble(byte) {
            Some(nibble) => nibble,
            None => return self.abort("checksum digit expected"),
        };
        match first {
            None => {
                self.stage = Stage::Check {
                    first: Some(nibble),
                };
                None
            }
            Some(high) => {
                let received = high << 4 | nibble;
                let expected = crc8(self.data.as_bytes(), crc8(&self.tag, 0));
                if received == expected {
                    self.complete()
                } else {
                    debug!(
                        "AKP: checksum mismatch, received {:02x}, calculated {:02x}",
                        received, expected
                    );
                    self.abort("checksum mismatch")
                }
            }
        }
    }

    fn length_byte(
        &mut self,
        byte: u8,
        digits: u8,
        first: u16,
        second: u16,
    ) -> Option<DecodedTag<B>> {
        let nibble = match hex_nibble(byte) {
            Some(nibble) => u16::from(nibble),
            None => return self.abort("length digit expected"),
        };
        let (first, second) = if digits < 4 {
            (first << 4 | nibble, second)
        } else {
            (first, second << 4 | nibble)
        };
        if digits + 1 < 8 {
            self.stage = Stage::DdLength {
                digits: digits + 1,
                first,
                second,
            };
            return None;
        }

        if first != second {
            return self.abort("DD length fields differ");
        }
        let len = usize::from(first);
        if !self.data.reserve_payload(len) {
            return self.abort("DD payload doesn't fit the buffer");
        }
        if len == 0 {
            self.complete()
        } else {
            self.stage = Stage::DdPayload { len, received: 0 };
            None
        }
    }

    fn complete(&mut self) -> Option<DecodedTag<B>> {
        self.stage = Stage::Scanning;
        let tag = TagName(self.tag);
        let data = self.data.take();
        trace!("AKP: {} record, {} bytes", tag, data.as_bytes().len());
        Some(DecodedTag { tag, data })
    }

    fn abort(&mut self, reason: &str) -> Option<DecodedTag<B>> {
        debug!(
            "AKP: {} record dropped: {}",
            String::from_utf8_lossy(&self.tag),
            reason
        );
        self.stage = Stage::Scanning;
        None
    }
}

/// Free-function form of [`TagParseState::feed()`].
pub fn feed<B: TagBuffer>(byte: u8, state: &mut TagParseState<B>) -> Option<DecodedTag<B>> {
    state.feed(byte)
}

/// Decode every record in a complete byte stream.
pub fn decode_all(bytes: &[u8]) -> Vec<DecodedTag> {
    let mut state = TagParseState::<Vec<u8>>::new();
    bytes.iter().filter_map(|&b| state.feed(b)).collect()
}

/// Parse exactly one well-formed record at the start of `bytes`.
///
/// Returns the record and the number of bytes it occupied. Unlike the
/// streaming decoder this doesn't skip leading noise.
pub fn parse_record(bytes: &[u8]) -> Option<(DecodedTag, usize)> {
    let (rest, (tag, data)) = crate::nom_parser::record(bytes).ok()?;
    Some((DecodedTag::new(tag, data), bytes.len() - rest.len()))
}

/// Append an ordinary record to `out`.
pub fn write_tag(out: &mut Vec<u8>, tag: TagName, data: &[u8]) -> Result<(), Error> {
    ensure!(!data.contains(&b':'), ColonInDataSnafu);
    ensure!(!data.windows(3).any(is_tag_start), TagStartInDataSnafu);
    ensure!(!tag.is_dd(), InvalidTagNameSnafu);
    out.extend_from_slice(tag.as_bytes());
    out.push(b'^');
    out.extend_from_slice(data);
    out.extend_from_slice(format!(":{:02x}", checksum(tag, data)).as_bytes());
    Ok(())
}

/// Append a `DD` record carrying `payload` to `out`.
pub fn write_dd(out: &mut Vec<u8>, payload: &[u8]) -> Result<(), Error> {
    let len: u16 = payload
        .len()
        .try_into()
        .map_err(|_| Error::PayloadTooLong { len: payload.len() })?;
    out.extend_from_slice(format!("DD^{:04x}{:04x}", len, len).as_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Encode an ordinary record.
///
/// ```
/// use akp_link::akp::{encode_tag, decode_all, tag};
/// let bytes = encode_tag(tag(b"LA"), b"-33000").unwrap();
/// let records = decode_all(&bytes);
/// assert_eq!(records[0].data(), b"-33000");
/// ```
pub fn encode_tag(tag: TagName, data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(data.len() + 6);
    write_tag(&mut out, tag, data)?;
    Ok(out)
}

/// Encode a `DD` record.
pub fn encode_dd(payload: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(payload.len() + 11);
    write_dd(&mut out, payload)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all<B: TagBuffer>(state: &mut TagParseState<B>, bytes: &[u8]) -> Vec<DecodedTag<B>> {
        bytes.iter().filter_map(|&b| state.feed(b)).collect()
    }

    #[test]
    fn test_tag_name() {
        assert!(TagName::new("LA").is_ok());
        assert_eq!(TagName::new("La"), Err(Error::InvalidTagName));
        assert_eq!(TagName::new("LAB"), Err(Error::InvalidTagName));
        assert_eq!(TagName::new(""), Err(Error::InvalidTagName));
        assert!(tag(b"DD").is_dd());
        assert_eq!(tag(b"XY").to_string(), "XY");
    }

    #[test]
    fn test_hex_nibble() {
        assert_eq!(hex_nibble(b'0'), Some(0));
        assert_eq!(hex_nibble(b'f'), Some(15));
        assert_eq!(hex_nibble(b'F'), None);
        assert_eq!(hex_nibble(b'g'), None);
    }

    #[test]
    fn test_single_record() {
        let bytes = encode_tag(tag(b"LA"), b"-33000").unwrap();
        let crc = checksum(tag(b"LA"), b"-33000");
        assert_eq!(bytes, format!("LA^-33000:{:02x}", crc).into_bytes());

        let mut state = TagParseState::<Vec<u8>>::new();
        let records = feed_all(&mut state, &bytes);
        assert_eq!(records, vec![DecodedTag::new(tag(b"LA"), &b"-33000"[..])]);
        assert!(state.is_idle());
    }

    #[test]
    fn test_non_hex_check_digit() {
        assert!(decode_all(b"LA^1:G0").is_empty());
        assert!(decode_all(b"LA^1:0").is_empty());
    }

    #[test]
    fn test_empty_data() {
        let bytes = encode_tag(tag(b"AB"), b"").unwrap();
        let records = decode_all(&bytes);
        assert_eq!(records.len(), 1);
        assert!(records[0].data().is_empty());
    }

    #[test]
    fn test_wrong_checksum() {
        let mut bytes = encode_tag(tag(b"LA"), b"12").unwrap();
        let last = bytes.len() - 1;
        bytes[last] = if bytes[last] == b'0' { b'1' } else { b'0' };
        assert!(decode_all(&bytes).is_empty());
    }

    #[test]
    fn test_restart_on_new_tag() {
        let mut bytes = b"LA^12".to_vec();
        bytes.extend(encode_tag(tag(b"XY"), b"7").unwrap());
        let records = decode_all(&bytes);
        assert_eq!(records, vec![DecodedTag::new(tag(b"XY"), &b"7"[..])]);
    }

    #[test]
    fn test_reset_forgets_partial_record_and_lookback() {
        let mut state = TagParseState::<Vec<u8>>::new();
        assert!(feed_all(&mut state, b"LA^-33").is_empty());
        assert!(!state.is_idle());
        state.reset();
        assert!(state.is_idle());
        // The rest of the interrupted record is now noise.
        assert!(feed_all(&mut state, b"000:b9").is_empty());

        // A tag start split across the reset isn't recognised either.
        assert!(feed_all(&mut state, b"LA").is_empty());
        state.reset();
        assert!(feed_all(&mut state, b"^-33000:b9").is_empty());
        assert!(state.is_idle());
        assert_eq!(feed_all(&mut state, b"LA^-33000:b9").len(), 1);
    }

    #[test]
    fn test_data_length_limit() {
        let data = vec![b'1'; 10];
        let bytes = encode_tag(tag(b"LA"), &data).unwrap();
        let mut state = TagParseState::<Vec<u8>>::new().with_max_data_len(9);
        assert!(feed_all(&mut state, &bytes).is_empty());
        let mut state = TagParseState::<Vec<u8>>::new().with_max_data_len(10);
        assert_eq!(feed_all(&mut state, &bytes).len(), 1);
    }

    #[test]
    fn test_dd_lengths() {
        let records = decode_all(b"DD^0000000012");
        assert_eq!(records, vec![DecodedTag::new(DD, Vec::new())]);

        assert!(decode_all(b"DD^00030004abcd").is_empty());

        let records = decode_all(b"DD^00030003abc");
        assert_eq!(records, vec![DecodedTag::new(DD, &b"abc"[..])]);
    }

    #[test]
    fn test_dd_payload_is_opaque() {
        // ':' and tag starts inside the payload don't disturb the framing.
        let payload = b"AB^:XY^";
        let bytes = encode_dd(payload).unwrap();
        let records = decode_all(&bytes);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data(), payload);
    }

    #[test]
    fn test_nested() {
        let mut inner = Vec::new();
        write_tag(&mut inner, tag(b"LA"), b"-33000").unwrap();
        write_tag(&mut inner, tag(b"LO"), b"151200").unwrap();
        let outer = encode_dd(&inner).unwrap();
        let records = decode_all(&outer);
        assert_eq!(records.len(), 1);
        let nested = records[0].nested();
        assert_eq!(nested.len(), 2);
        assert_eq!(nested[1].tag(), tag(b"LO"));
        assert_eq!(nested[1].data_str(), Some("151200"));
        assert!(nested[0].nested().is_empty());
    }

    #[test]
    fn test_fixed_buffer_truncates() {
        let data = b"0123456789";
        let kept = &data[..4];
        let mut bytes = b"LA^".to_vec();
        bytes.extend_from_slice(data);
        bytes.extend_from_slice(format!(":{:02x}", checksum(tag(b"LA"), kept)).as_bytes());

        let mut state = FixedTagParseState::<4>::new();
        let records = feed_all(&mut state, &bytes);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data(), kept);

        let mut state = FixedTagParseState::<4>::new();
        assert!(feed_all(&mut state, b"DD^00050005abcde").is_empty());
        assert!(feed_all(&mut state, b"DD^00040004abcd").len() == 1);
    }

    #[test]
    fn test_encode_errors() {
        assert_eq!(encode_tag(tag(b"LA"), b"1:2"), Err(Error::ColonInData));
        assert_eq!(encode_tag(tag(b"LA"), b"1AB^2"), Err(Error::TagStartInData));
        assert_eq!(encode_tag(DD, b"12"), Err(Error::InvalidTagName));
        assert_eq!(
            encode_dd(&vec![0; 0x1_0000]),
            Err(Error::PayloadTooLong { len: 0x1_0000 })
        );
    }

    #[test]
    fn test_parse_record() {
        let mut bytes = encode_tag(tag(b"LA"), b"-33000").unwrap();
        let len = bytes.len();
        bytes.extend_from_slice(b"rest");
        let (record, used) = parse_record(&bytes).unwrap();
        assert_eq!(used, len);
        assert_eq!(record.data(), b"-33000");

        assert!(parse_record(b"xLA^1:00").is_none());
        let dd = encode_dd(b"xyz").unwrap();
        assert_eq!(
            parse_record(&dd).map(|(r, n)| (r.into_data(), n)),
            Some((b"xyz".to_vec(), dd.len()))
        );
    }
}
