use std::error::Error;
use std::io::{self, Read, Write};

use akp_link::akp::DecodedTag;
use akp_link::TagParseState;

fn print_record(out: &mut impl Write, record: &DecodedTag, depth: usize) -> io::Result<()> {
    let indent = "  ".repeat(depth);
    if record.is_dd() {
        writeln!(out, "{}DD ({} bytes)", indent, record.data().len())?;
        for nested in record.nested() {
            print_record(out, &nested, depth + 1)?;
        }
    } else {
        writeln!(
            out,
            "{}{}{}",
            indent,
            record.tag(),
            String::from_utf8_lossy(record.data())
        )?;
    }
    Ok(())
}

/// Decode AKP records from stdin and print them, one per line.
fn main() -> Result<(), Box<dyn Error>> {
    let mut state = TagParseState::<Vec<u8>>::new();
    let mut stdin = io::stdin().lock();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut buf = [0; 256];
    loop {
        let len = stdin.read(&mut buf)?;
        if len == 0 {
            break;
        }
        for &byte in &buf[..len] {
            if let Some(record) = state.feed(byte) {
                print_record(&mut out, &record, 0)?;
            }
        }
        out.flush()?;
    }
    Ok(())
}
