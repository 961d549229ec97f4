//! Raw probe output decoding.
//!
//! scamper writes one JSON object per line. Only `trace` objects carry
//! measurements; `cycle-start`/`cycle-stop` and other bookkeeping lines are
//! ignored. Each trace becomes one [`ProbeRow`] described by its first hop.

use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that make a job's raw output unusable.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("output file {path} is missing")]
    Missing { path: PathBuf },

    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("output file {path} is empty")]
    Empty { path: PathBuf },

    #[error("{path}:{line}: malformed record: {source}")]
    Malformed {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// One trace object as written by scamper.
#[derive(Debug, Clone, Deserialize)]
pub struct TraceRecord {
    pub dst: String,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub start: Option<TraceStart>,
    #[serde(default)]
    pub hop_count: Option<u32>,
    #[serde(default)]
    pub hops: Vec<TraceHop>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TraceStart {
    #[serde(default)]
    pub sec: Option<i64>,
    #[serde(default)]
    pub ftime: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TraceHop {
    pub addr: String,
    pub probe_ttl: u32,
    #[serde(default)]
    pub rtt: Option<f64>,
}

/// One output table row. Field order is the column order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeRow {
    pub date: Option<String>,
    pub seq: u64,
    pub dst: String,
    pub stop_reason: Option<String>,
    pub start_time: Option<String>,
    pub start_sec: Option<i64>,
    pub hop_count: Option<u32>,
    pub ip_at_ttl: Option<String>,
    pub probe_ttl: Option<u32>,
    pub rtt: Option<f64>,
}

impl ProbeRow {
    pub const COLUMNS: [&'static str; 10] = [
        "date",
        "seq",
        "dst",
        "stop_reason",
        "start_time",
        "start_sec",
        "hop_count",
        "ip_at_ttl",
        "probe_ttl",
        "rtt",
    ];

    /// Build a row from a trace record. Hop columns come from the first hop.
    pub fn from_trace(seq: u64, record: TraceRecord) -> Self {
        let ftime = record.start.as_ref().and_then(|s| s.ftime.clone());
        let date = ftime
            .as_deref()
            .and_then(|f| f.split_whitespace().next())
            .map(str::to_owned);
        let first = record.hops.into_iter().next();

        Self {
            date,
            seq,
            dst: record.dst,
            stop_reason: record.stop_reason,
            start_time: ftime,
            start_sec: record.start.and_then(|s| s.sec),
            hop_count: record.hop_count,
            probe_ttl: first.as_ref().map(|h| h.probe_ttl),
            rtt: first.as_ref().and_then(|h| h.rtt),
            ip_at_ttl: first.map(|h| h.addr),
        }
    }
}

/// Converts one job's raw output into rows.
pub trait OutputParser: Send + Sync {
    fn parse(&self, path: &Path, seq: u64) -> Result<Vec<ProbeRow>, ParseError>;
}

/// Parser for scamper's JSON-lines trace output.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScamperTraceParser;

impl OutputParser for ScamperTraceParser {
    fn parse(&self, path: &Path, seq: u64) -> Result<Vec<ProbeRow>, ParseError> {
        Ok(read_trace_records(path)?
            .into_iter()
            .map(|record| ProbeRow::from_trace(seq, record))
            .collect())
    }
}

/// Read every trace record from a scamper JSON-lines file.
///
/// A file with no lines at all is an error; a file whose lines are all
/// non-trace objects yields no records.
pub fn read_trace_records(path: &Path) -> Result<Vec<TraceRecord>, ParseError> {
    let file = std::fs::File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ParseError::Missing {
            path: path.to_path_buf(),
        },
        _ => ParseError::Io {
            path: path.to_path_buf(),
            source: e,
        },
    })?;

    decode_lines(BufReader::new(file), path)
}

fn decode_lines<R: BufRead>(reader: R, path: &Path) -> Result<Vec<TraceRecord>, ParseError> {
    let mut records = Vec::new();
    let mut seen_any = false;

    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| ParseError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        seen_any = true;

        let malformed = |source| ParseError::Malformed {
            path: path.to_path_buf(),
            line: idx + 1,
            source,
        };

        let value: serde_json::Value = serde_json::from_str(line).map_err(malformed)?;
        if value.get("type").and_then(serde_json::Value::as_str) != Some("trace") {
            continue;
        }

        records.push(serde_json::from_value(value).map_err(malformed)?);
    }

    if !seen_any {
        return Err(ParseError::Empty {
            path: path.to_path_buf(),
        });
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const TRACE_LINE: &str = r#"{"type":"trace","version":"0.1","method":"icmp-echo-paris","src":"192.0.2.1","dst":"198.51.100.7","stop_reason":"GAPLIMIT","stop_data":0,"start":{"sec":1718000000,"usec":12,"ftime":"2024-06-10 06:13:20"},"hop_count":5,"attempts":1,"firsthop":5,"hops":[{"addr":"203.0.113.9","probe_ttl":5,"probe_id":1,"rtt":12.345}]}"#;
    const CYCLE_LINE: &str = r#"{"type":"cycle-start","list_name":"default","id":1,"start_time":1718000000}"#;

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).expect("create");
        f.write_all(content.as_bytes()).expect("write");
        path
    }

    #[test]
    fn test_parse_trace_line_into_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_file(
            dir.path(),
            "out.json",
            &format!("{CYCLE_LINE}\n{TRACE_LINE}\n"),
        );

        let rows = ScamperTraceParser.parse(&path, 3).expect("parse");
        assert_eq!(
            rows,
            vec![ProbeRow {
                date: Some("2024-06-10".into()),
                seq: 3,
                dst: "198.51.100.7".into(),
                stop_reason: Some("GAPLIMIT".into()),
                start_time: Some("2024-06-10 06:13:20".into()),
                start_sec: Some(1_718_000_000),
                hop_count: Some(5),
                ip_at_ttl: Some("203.0.113.9".into()),
                probe_ttl: Some(5),
                rtt: Some(12.345),
            }]
        );
    }

    #[test]
    fn test_trace_without_hops_has_empty_hop_columns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_file(
            dir.path(),
            "out.json",
            r#"{"type":"trace","dst":"198.51.100.8","stop_reason":"GAPLIMIT","start":{"sec":1,"ftime":"2024-06-10 00:00:01"},"hop_count":0}"#,
        );

        let rows = ScamperTraceParser.parse(&path, 0).expect("parse");
        assert_eq!(rows.len(), 1);
        assert!(rows[0].ip_at_ttl.is_none());
        assert!(rows[0].probe_ttl.is_none());
        assert!(rows[0].rtt.is_none());
    }

    #[test]
    fn test_only_bookkeeping_lines_yield_no_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_file(dir.path(), "out.json", CYCLE_LINE);
        assert!(ScamperTraceParser.parse(&path, 0).expect("parse").is_empty());
    }

    #[test]
    fn test_empty_missing_and_malformed_outputs_are_errors() {
        let dir = tempfile::tempdir().expect("tempdir");

        let empty = write_file(dir.path(), "empty.json", "\n");
        assert!(matches!(
            ScamperTraceParser.parse(&empty, 0),
            Err(ParseError::Empty { .. })
        ));

        let missing = dir.path().join("missing.json");
        assert!(matches!(
            ScamperTraceParser.parse(&missing, 0),
            Err(ParseError::Missing { .. })
        ));

        let bad = write_file(dir.path(), "bad.json", &format!("{TRACE_LINE}\n{{not json\n"));
        match ScamperTraceParser.parse(&bad, 0) {
            Err(ParseError::Malformed { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected malformed error, got {other:?}"),
        }
    }
}
