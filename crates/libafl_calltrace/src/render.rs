//! Turning pointers into something a human can read.

use core::fmt::Write;

use crate::memory::MemoryReader;

/// Bytes per hexdump line
pub const HEXDUMP_WIDTH: usize = 16;

/// Reads the NUL-terminated string at `address`, `""` for a null pointer.
///
/// There is no readability probe: the address is trusted to come from a typed string
/// argument or return value of an instrumented function.
#[must_use]
pub fn read_string_from_address(memory: &dyn MemoryReader, address: u64, max_len: usize) -> String {
    if address == 0 {
        return String::new();
    }
    let bytes = memory.read_c_string(address, max_len);
    let truncated = bytes.len() == max_len;
    let mut s = escape_bytes(&bytes);
    if truncated {
        s.push_str("...");
    }
    s
}

/// Number of bytes from `address` on that can be read, at most `size`.
///
/// Probes byte by byte, stopping at the first unreadable one.
#[must_use]
pub fn readable_prefix(memory: &dyn MemoryReader, address: u64, size: usize) -> usize {
    if memory.is_readable(address, size) {
        return size;
    }
    let mut len = 0;
    while len < size && memory.is_readable(address + len as u64, 1) {
        len += 1;
    }
    len
}

/// Hexdump of `[address, address + size)`, or of its readable prefix if the whole range
/// is not readable. Never touches unreadable memory.
#[must_use]
pub fn read_buffer_hexdump_from_address(
    memory: &dyn MemoryReader,
    address: u64,
    size: usize,
) -> String {
    let len = readable_prefix(memory, address, size);
    if len < size {
        log::debug!("only {len} of {size} bytes at {address:#x} are readable");
    }
    let mut bytes = vec![0u8; len];
    memory.read_bytes(address, &mut bytes);
    hexdump(&bytes)
}

/// Classic hexdump: offset, 16 hex bytes, printable column
#[must_use]
pub fn hexdump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (line, chunk) in bytes.chunks(HEXDUMP_WIDTH).enumerate() {
        if line > 0 {
            out.push('\n');
        }
        let _ = write!(out, "{:08x}  ", line * HEXDUMP_WIDTH);
        for i in 0..HEXDUMP_WIDTH {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, "{b:02x} ");
                }
                None => out.push_str("   "),
            }
            if i == 7 {
                out.push(' ');
            }
        }
        out.push_str(" |");
        for b in chunk {
            out.push(if b.is_ascii_graphic() || *b == b' ' {
                *b as char
            } else {
                '.'
            });
        }
        out.push('|');
    }
    out
}

/// Printable rendering of raw bytes, escaping everything that is not printable ASCII
#[must_use]
pub fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for b in bytes {
        match b {
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            b'\\' => out.push_str("\\\\"),
            b'"' => out.push_str("\\\""),
            0x20..=0x7e => out.push(*b as char),
            _ => {
                let _ = write!(out, "\\x{b:02x}");
            }
        }
    }
    out
}

/// Quoted preview of up to `max` bytes of a buffer, probing readability first
#[must_use]
pub fn buffer_preview(memory: &dyn MemoryReader, address: u64, len: usize, max: usize) -> String {
    if address == 0 {
        return "NULL".to_string();
    }
    let wanted = len.min(max);
    let readable = readable_prefix(memory, address, wanted);
    let mut bytes = vec![0u8; readable];
    memory.read_bytes(address, &mut bytes);
    let mut out = format!("\"{}\"", escape_bytes(&bytes));
    if readable < wanted {
        out.push_str("<unreadable>");
    } else if len > max {
        out.push_str("...");
    }
    out
}
