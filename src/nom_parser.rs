use nom::bytes::complete::{tag, take, take_till, take_while_m_n};
use nom::character::complete::{char, digit1, one_of};
use nom::combinator::{all_consuming, map, map_opt, map_res, opt, verify};
use nom::sequence::{pair, preceded, terminated, tuple};
use nom::IResult;

use crate::akp::{checksum, hex_nibble, is_tag_start, TagName};
use crate::types::{BaudRate, BitTimingConfig};

type Char = u8;
type Buf = [u8];

/// `<baud>-8<N|E><1|2>[-inv]`, the whole input.
pub(crate) fn line_settings(buf: &Buf) -> Option<BitTimingConfig> {
    let settings = tuple((
        map_res(map_int(digit1), |rate: u32| BaudRate::new(rate)),
        preceded(tag("-8"), one_of("NE")),
        one_of("12"),
        opt(tag("-inv")),
    ));
    let (_, (baud, parity, stop_bits, inverted)) = all_consuming(settings)(buf).ok()?;
    Some(
        BitTimingConfig::new(baud)
            .with_parity(parity == 'E')
            .with_second_stop_bit(stop_bits == '2')
            .with_inverting_logic(inverted.is_some()),
    )
}

/// One complete record at the start of `buf`: the tag name and its payload.
pub(crate) fn record(buf: &Buf) -> IResult<&Buf, (TagName, &Buf)> {
    let (buf, name) = terminated(tag_name, char('^'))(buf)?;
    if name.is_dd() {
        let (buf, payload) = dd_payload(buf)?;
        Ok((buf, (name, payload)))
    } else {
        let (buf, data) = checked_data(name, buf)?;
        Ok((buf, (name, data)))
    }
}

fn tag_name(buf: &Buf) -> IResult<&Buf, TagName> {
    map_opt(
        take_while_m_n(2, 2, |c: Char| c.is_ascii_uppercase()),
        |x: &Buf| TagName::new(x).ok(),
    )(buf)
}

fn checked_data(name: TagName, buf: &Buf) -> IResult<&Buf, &Buf> {
    let (buf, data) = verify(take_till(|c: Char| c == b':'), |x: &Buf| {
        !x.windows(3).any(is_tag_start)
    })(buf)?;
    let (buf, _) = char(':')(buf)?;
    let (buf, _) = verify(lower_hex(2), |crc: &u32| {
        u32::from(checksum(name, data)) == *crc
    })(buf)?;
    Ok((buf, data))
}

fn dd_payload(buf: &Buf) -> IResult<&Buf, &Buf> {
    let (buf, (len, _)) = verify(pair(lower_hex(4), lower_hex(4)), |(a, b): &(u32, u32)| {
        a == b
    })(buf)?;
    take(len as usize)(buf)
}

fn lower_hex<'a>(digits: usize) -> impl FnMut(&'a Buf) -> IResult<&'a Buf, u32> {
    map(
        take_while_m_n(digits, digits, |c: Char| hex_nibble(c).is_some()),
        |x: &Buf| {
            x.iter()
                .filter_map(|&c| hex_nibble(c))
                .fold(0, |acc, nibble| acc << 4 | u32::from(nibble))
        },
    )
}

fn map_int<'a, O, F>(first: F) -> impl FnMut(&'a Buf) -> IResult<&'a Buf, O>
where
    F: Fn(&'a Buf) -> IResult<&'a Buf, &'a Buf>,
    O: std::str::FromStr,
{
    let to_str = map_res(first, |u: &'a Buf| std::str::from_utf8(u));
    map_res(to_str, |s| s.parse::<O>())
}
