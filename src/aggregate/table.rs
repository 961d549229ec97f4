use std::fs::OpenOptions;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use csv::WriterBuilder;

use super::parse::ProbeRow;

/// Append-only CSV table.
///
/// The header is written on the first non-empty append unless the file
/// already existed when the table was opened.
#[derive(Debug)]
pub struct OutputTable {
    path: PathBuf,
    header_written: bool,
}

impl OutputTable {
    pub fn open(path: PathBuf) -> Self {
        let header_written = path.exists();
        Self {
            path,
            header_written,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header_written(&self) -> bool {
        self.header_written
    }

    /// Append rows and flush. Returns the number of rows written.
    pub fn append(&mut self, rows: &[ProbeRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening output table {}", self.path.display()))?;

        let mut wtr = WriterBuilder::new()
            .has_headers(false)
            .from_writer(BufWriter::new(file));

        if !self.header_written {
            wtr.write_record(ProbeRow::COLUMNS)
                .with_context(|| format!("writing header to {}", self.path.display()))?;
        }

        for row in rows {
            wtr.serialize(row)
                .with_context(|| format!("appending to {}", self.path.display()))?;
        }

        wtr.flush()
            .with_context(|| format!("flushing {}", self.path.display()))?;

        self.header_written = true;

        Ok(rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(seq: u64, dst: &str) -> ProbeRow {
        ProbeRow {
            date: Some("2024-06-10".into()),
            seq,
            dst: dst.into(),
            stop_reason: Some("COMPLETED".into()),
            start_time: Some("2024-06-10 06:13:20".into()),
            start_sec: Some(1_718_000_000),
            hop_count: Some(5),
            ip_at_ttl: None,
            probe_ttl: None,
            rtt: None,
        }
    }

    #[test]
    fn test_header_written_once_across_appends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t_endpoint.csv");
        let mut table = OutputTable::open(path.clone());
        assert!(!table.header_written());

        assert_eq!(table.append(&[]).expect("append"), 0);
        assert!(!path.exists());

        table.append(&[row(0, "198.51.100.1")]).expect("append");
        table.append(&[row(1, "198.51.100.1")]).expect("append");

        let content = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(
            lines,
            vec![
                "date,seq,dst,stop_reason,start_time,start_sec,hop_count,ip_at_ttl,probe_ttl,rtt",
                "2024-06-10,0,198.51.100.1,COMPLETED,2024-06-10 06:13:20,1718000000,5,,,",
                "2024-06-10,1,198.51.100.1,COMPLETED,2024-06-10 06:13:20,1718000000,5,,,",
            ]
        );
    }

    #[test]
    fn test_existing_file_suppresses_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t_endpoint.csv");
        {
            let mut first = OutputTable::open(path.clone());
            first.append(&[row(0, "198.51.100.1")]).expect("append");
        }

        let mut resumed = OutputTable::open(path.clone());
        assert!(resumed.header_written());
        resumed.append(&[row(1, "198.51.100.2")]).expect("append");

        let content = std::fs::read_to_string(&path).expect("read");
        assert_eq!(content.matches("date,seq,dst").count(), 1);
        assert_eq!(content.lines().count(), 3);
    }
}
