//! Hexadecimal dumps in the style of `hexdump -C`.

pub const BYTES_PER_LINE: usize = 16;

fn printable(byte: u8) -> char {
    if byte.is_ascii_graphic() || byte == b' ' {
        char::from(byte)
    } else {
        '.'
    }
}

fn line(bytes: &[u8], offset: u64) -> String {
    let mut line = format!("{:08x} ", offset);

    for index in 0..BYTES_PER_LINE {
        if index % 8 == 0 {
            line.push(' ');
        }
        match bytes.get(index) {
            Some(byte) => line.push_str(&format!("{:02x} ", byte)),
            None => line.push_str("   "),
        }
    }

    line.push('|');
    line.extend(bytes.iter().copied().map(printable));
    line.push('|');
    line
}

/// Format `bytes` as lines of 16, with offsets starting at `base_offset`. A run of lines identical
/// to the one before it is shown as a single `*`, and the last line gives the offset past the end.
pub fn hex_dump(bytes: &[u8], base_offset: u64) -> String {
    let mut output = String::new();
    let mut previous: Option<&[u8]> = None;
    let mut squeezing = false;

    for (index, chunk) in bytes.chunks(BYTES_PER_LINE).enumerate() {
        if previous == Some(chunk) && chunk.len() == BYTES_PER_LINE {
            if !squeezing {
                output.push_str("*\n");
                squeezing = true;
            }
            continue;
        }
        squeezing = false;
        previous = Some(chunk);

        output.push_str(&line(chunk, base_offset + (index * BYTES_PER_LINE) as u64));
        output.push('\n');
    }
    output.push_str(&format!("{:08x}\n", base_offset + bytes.len() as u64));
    output
}
