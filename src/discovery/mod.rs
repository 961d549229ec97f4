//! Destination table discovery from a full trace.
//!
//! One unrestricted trace per target yields the endpoint depth and the
//! second-to-last responding hop, which together form the destination table
//! consumed by probing runs.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::aggregate::parse::{read_trace_records, TraceRecord};
use crate::artifact::ScopedArtifact;
use crate::config::Config;
use crate::probe::{ProbeCommand, ProbeLauncher, TraceSpec};

/// One destination table row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredPath {
    pub dst: String,
    pub stop_reason: Option<String>,
    pub hop_count: Option<u32>,
    pub sec_last_ip: Option<String>,
    pub sec_last_hop: Option<u32>,
}

impl DiscoveredPath {
    /// Hops are ordered by `probe_ttl`; traces with fewer than two hops have
    /// no secondary hop.
    pub fn from_trace(mut record: TraceRecord) -> Self {
        record.hops.sort_by_key(|h| h.probe_ttl);

        let sec_last = match record.hops.len() {
            n if n >= 2 => record.hops.get(n - 2),
            _ => None,
        };

        Self {
            sec_last_ip: sec_last.map(|h| h.addr.clone()),
            sec_last_hop: sec_last.map(|h| h.probe_ttl),
            dst: record.dst,
            stop_reason: record.stop_reason,
            hop_count: record.hop_count,
        }
    }
}

/// Run one full trace over `targets` and write the derived destination
/// table to `output`. Returns the number of rows written.
pub async fn discover(
    cfg: &Config,
    launcher: Arc<dyn ProbeLauncher>,
    targets: &Path,
    output: &Path,
) -> Result<usize> {
    if !targets.is_file() {
        bail!("target list {} does not exist", targets.display());
    }

    std::fs::create_dir_all(&cfg.temp_dir)
        .with_context(|| format!("creating temp dir {}", cfg.temp_dir.display()))?;

    let raw = ScopedArtifact::reserve(&cfg.temp_dir, "discovery", "json");
    let cmd = ProbeCommand {
        output: raw.path().to_path_buf(),
        input: targets.to_path_buf(),
        packets_per_second: cfg.discovery.packets_per_second,
        spec: TraceSpec::full(cfg.probe.trace_method()?, 1, cfg.discovery.gap_limit),
    };

    info!(
        targets = %targets.display(),
        trace = %cmd.spec,
        pps = cmd.packets_per_second,
        "starting discovery trace",
    );

    let status = launcher
        .launch(&cmd)
        .context("launching discovery trace")?
        .wait()
        .await
        .context("waiting for discovery trace")?;

    if !status.success() {
        warn!(status = ?status, "discovery trace exited abnormally");
    }

    let records = read_trace_records(raw.path()).context("reading discovery output")?;
    let rows: Vec<DiscoveredPath> = records.into_iter().map(DiscoveredPath::from_trace).collect();

    write_table(output, &rows)?;
    raw.release();

    let with_secondary = rows.iter().filter(|r| r.sec_last_ip.is_some()).count();
    info!(
        rows = rows.len(),
        with_secondary,
        output = %output.display(),
        "discovery complete",
    );

    Ok(rows.len())
}

fn write_table(path: &Path, rows: &[DiscoveredPath]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("creating destination table {}", path.display()))?;

    for row in rows {
        wtr.serialize(row)
            .with_context(|| format!("writing {}", path.display()))?;
    }

    wtr.flush()
        .with_context(|| format!("flushing {}", path.display()))?;

    Ok(())
}
