//! Debug filter dumping every chunk as a hex listing.

use std::fmt::Write as _;

use tracing::info;

use crate::filter::{Filter, FilterError};

/// Log target of the dump events, so they can be routed separately.
pub const DUMP_TARGET: &str = "wstunnel::dump";

/// Bytes per line of the dump.
const DUMP_WIDTH: usize = 16;

/// Logs each chunk in both directions and forwards it untouched.
#[derive(Debug, Clone, Default)]
pub struct DumpFilter;

impl DumpFilter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Filter for DumpFilter {
    fn name(&self) -> &str {
        "dump"
    }

    fn on_outbound(&self, data: Vec<u8>) -> Result<Vec<u8>, FilterError> {
        info!(
            target: DUMP_TARGET,
            bytes = data.len(),
            "[<--] To WebSocket endpoint\n{}",
            hex_dump(&data, DUMP_WIDTH)
        );
        Ok(data)
    }

    fn on_inbound(&self, data: Vec<u8>) -> Result<Vec<u8>, FilterError> {
        info!(
            target: DUMP_TARGET,
            bytes = data.len(),
            "[-->] From WebSocket endpoint\n{}",
            hex_dump(&data, DUMP_WIDTH)
        );
        Ok(data)
    }
}

/// Formats `data` the way Wireshark does: offset, hex bytes in two halves,
/// then the printable characters.
///
/// ```
/// let dump = wstunnel::hex_dump(b"Hello World", 16);
/// assert_eq!(dump, "0000  48 65 6c 6c 6f 20 57 6f  72 6c 64                   Hello.Wo rld");
/// ```
#[must_use]
pub fn hex_dump(data: &[u8], size: usize) -> String {
    let size = size.max(2);
    let half = size / 2;

    let mut lines = Vec::with_capacity(data.len().div_ceil(size));
    for (index, line) in data.chunks(size).enumerate() {
        let (left, right) = line.split_at(line.len().min(half));
        let hexed = format!(
            "{:04x}  {}  {}",
            index * size,
            hex_bytes(left),
            hex_bytes(right)
        );
        let plain = format!("{} {}", printable(left), printable(right));
        let width = 55usize.saturating_sub(hexed.len() - plain.len());
        lines.push(format!("{hexed}   {plain:>width$}"));
    }
    lines.join("\n")
}

fn hex_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn printable(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
        .collect()
}
