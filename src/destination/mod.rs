//! Destination table: the candidate probe targets for a run.
//!
//! The table is produced upstream (see [`crate::discovery`]) and read here
//! as CSV. Only the address and depth columns matter to the engine; any
//! other columns are ignored.

use std::io::Read;
use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

/// One candidate probe target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Endpoint address.
    pub address: IpAddr,
    /// Hop count at which the endpoint answers.
    pub depth: u8,
    /// Second-to-last responding hop, when the path exposed one.
    pub secondary: Option<SecondaryHop>,
}

/// The upstream hop probed alongside an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecondaryHop {
    pub address: IpAddr,
    pub depth: u8,
}

impl Destination {
    /// Creates an endpoint-only destination.
    pub fn new(address: IpAddr, depth: u8) -> Self {
        Self {
            address,
            depth,
            secondary: None,
        }
    }

    /// Attaches a secondary hop.
    pub fn with_secondary(mut self, address: IpAddr, depth: u8) -> Self {
        self.secondary = Some(SecondaryHop { address, depth });
        self
    }
}

/// Raw CSV row. Numeric columns arrive as text because upstream writers
/// render integers with missing values as floats ("7.0").
#[derive(Debug, Deserialize)]
struct RawRow {
    dst: Option<String>,
    hop_count: Option<String>,
    #[serde(default)]
    sec_last_ip: Option<String>,
    #[serde(default)]
    sec_last_hop: Option<String>,
}

/// Load a destination table from a CSV file.
pub fn load_table(path: &Path) -> Result<Vec<Destination>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening destination table {}", path.display()))?;
    let table = read_table(file)
        .with_context(|| format!("reading destination table {}", path.display()))?;

    debug!(path = %path.display(), rows = table.len(), "loaded destination table");

    Ok(table)
}

/// Read a destination table from any CSV source.
pub fn read_table<R: Read>(reader: R) -> Result<Vec<Destination>> {
    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let mut table = Vec::new();
    let mut skipped = 0usize;

    for (idx, record) in rdr.deserialize::<RawRow>().enumerate() {
        let row = record.with_context(|| format!("decoding row {}", idx + 1))?;

        match destination_from_row(&row) {
            Some(dest) => table.push(dest),
            None => {
                skipped += 1;
                debug!(row = idx + 1, ?row, "skipping unusable destination row");
            }
        }
    }

    if skipped > 0 {
        warn!(skipped, kept = table.len(), "skipped unusable destination rows");
    }

    Ok(table)
}

fn destination_from_row(row: &RawRow) -> Option<Destination> {
    let address = parse_addr(row.dst.as_deref()?)?;
    let depth = parse_depth(row.hop_count.as_deref()?)?;

    let mut dest = Destination::new(address, depth);

    let secondary_ip = row.sec_last_ip.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let secondary_hop = row.sec_last_hop.as_deref().map(str::trim).filter(|s| !s.is_empty());
    if secondary_ip.is_none() && secondary_hop.is_none() {
        return Some(dest);
    }

    match (secondary_ip.and_then(parse_addr), secondary_hop.and_then(parse_depth)) {
        (Some(addr), Some(depth)) => dest = dest.with_secondary(addr, depth),
        _ => debug!(
            dst = %address,
            sec_last_ip = ?row.sec_last_ip,
            sec_last_hop = ?row.sec_last_hop,
            "ignoring unusable secondary hop",
        ),
    }

    Some(dest)
}

fn parse_addr(raw: &str) -> Option<IpAddr> {
    raw.trim().parse().ok()
}

/// Parses a depth written either as an integer or as an integral float.
pub(crate) fn parse_depth(raw: &str) -> Option<u8> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(v) = raw.parse::<u8>() {
        return Some(v);
    }
    let v = raw.parse::<f64>().ok()?;
    if v.fract() != 0.0 || !(0.0..=f64::from(u8::MAX)).contains(&v) {
        return None;
    }
    Some(v as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_table_with_secondary_columns() {
        let csv = "\
dst,stop_reason,hop_count,sec_last_ip,sec_last_hop
198.51.100.7,COMPLETED,9,100.64.0.1,8.0
198.51.100.8,COMPLETED,9.0,,
203.0.113.5,COMPLETED,12,100.64.0.9,11
";
        let table = read_table(csv.as_bytes()).expect("valid table");
        assert_eq!(table.len(), 3);

        assert_eq!(table[0].address, "198.51.100.7".parse::<IpAddr>().unwrap());
        assert_eq!(table[0].depth, 9);
        assert_eq!(
            table[0].secondary,
            Some(SecondaryHop {
                address: "100.64.0.1".parse().unwrap(),
                depth: 8,
            })
        );

        assert_eq!(table[1].depth, 9);
        assert!(table[1].secondary.is_none());

        assert_eq!(table[2].secondary.map(|s| s.depth), Some(11));
    }

    #[test]
    fn test_read_table_skips_unusable_rows() {
        let csv = "\
dst,hop_count
not-an-ip,5
198.51.100.7,
198.51.100.9,5.5
198.51.100.10,5
";
        let table = read_table(csv.as_bytes()).expect("valid table");
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].depth, 5);
    }

    /// Collects formatted log output for assertions.
    #[derive(Clone, Default)]
    struct LogBuffer(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_unusable_secondary_hop_is_dropped_with_debug_log() {
        let csv = "\
dst,hop_count,sec_last_ip,sec_last_hop
198.51.100.7,9,not-an-ip,8
198.51.100.8,9,100.64.0.1,nan
198.51.100.9,9,,
";
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let table = tracing::subscriber::with_default(subscriber, || {
            read_table(csv.as_bytes()).expect("valid table")
        });

        assert_eq!(table.len(), 3);
        assert!(table.iter().all(|d| d.secondary.is_none()));

        let output = String::from_utf8(logs.0.lock().expect("lock").clone()).expect("utf8");
        assert_eq!(output.matches("ignoring unusable secondary hop").count(), 2);
        assert!(output.contains("198.51.100.7"));
        assert!(output.contains("198.51.100.8"));
        assert!(!output.contains("198.51.100.9"));
    }

    #[test]
    fn test_parse_depth() {
        assert_eq!(parse_depth("7"), Some(7));
        assert_eq!(parse_depth(" 7.0 "), Some(7));
        assert_eq!(parse_depth("256"), None);
        assert_eq!(parse_depth("-1"), None);
        assert_eq!(parse_depth("nan"), None);
        assert_eq!(parse_depth(""), None);
    }
}
