//! Background aggregation of completed probe jobs.
//!
//! The worker wakes every flush interval, takes whatever the dispatcher has
//! queued, appends parsed rows to the per-target output tables and removes
//! the consumed raw files. On the finish signal it performs one last drain
//! and exits.

pub mod parse;
pub mod table;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::{CompletedJob, CompletionDrain};
use crate::grouping::TargetType;
use crate::stats::{Counter, RunStats};

pub use parse::{OutputParser, ParseError, ProbeRow, ScamperTraceParser};
pub use table::OutputTable;

/// Consumes the completion queue for the lifetime of a run.
pub struct AggregationWorker {
    drain: CompletionDrain,
    parser: Arc<dyn OutputParser>,
    endpoint: OutputTable,
    secondary: OutputTable,
    flush_interval: Duration,
    stats: Arc<RunStats>,
}

impl AggregationWorker {
    pub fn new(
        drain: CompletionDrain,
        parser: Arc<dyn OutputParser>,
        endpoint_path: PathBuf,
        secondary_path: PathBuf,
        flush_interval: Duration,
        stats: Arc<RunStats>,
    ) -> Self {
        let endpoint = OutputTable::open(endpoint_path);
        let secondary = OutputTable::open(secondary_path);

        if endpoint.header_written() || secondary.header_written() {
            info!(
                endpoint = endpoint.header_written(),
                secondary = secondary.header_written(),
                "resuming into existing output tables",
            );
        }

        Self {
            drain,
            parser,
            endpoint,
            secondary,
            flush_interval,
            stats,
        }
    }

    /// Run on the tokio runtime until `finish` fires.
    pub fn spawn(self, finish: CancellationToken, stop: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(finish, stop))
    }

    /// Flush periodically until `finish` fires, then flush what remains.
    ///
    /// Flushes run on the blocking pool; the task itself only waits. A
    /// storage failure cancels `stop` so the dispatcher winds down, and is
    /// returned to the caller.
    pub async fn run(mut self, finish: CancellationToken, stop: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = finish.cancelled() => {
                    let result = match self.off_runtime(Self::flush_remaining).await {
                        Ok((_, result)) => result,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = &result {
                        error!(error = %e, "final aggregation failed");
                    } else {
                        info!("aggregation worker stopped");
                    }
                    return result;
                }
                _ = ticker.tick() => {
                    let (worker, result) = match self.off_runtime(Self::flush).await {
                        Ok(done) => done,
                        Err(e) => {
                            error!(error = %e, "aggregation failed, stopping run");
                            stop.cancel();
                            return Err(e);
                        }
                    };
                    self = worker;

                    if let Err(e) = result {
                        error!(error = %e, "aggregation failed, stopping run");
                        stop.cancel();
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Run `op` on the blocking pool and hand the worker back.
    async fn off_runtime<T, F>(self, op: F) -> Result<(Self, Result<T>)>
    where
        T: Send + 'static,
        F: FnOnce(&mut Self) -> Result<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(move || {
            let mut worker = self;
            let result = op(&mut worker);
            (worker, result)
        })
        .await
        .context("aggregation flush panicked")
    }

    fn flush_remaining(&mut self) -> Result<()> {
        while self.flush()? > 0 {}
        Ok(())
    }

    /// Aggregate everything currently queued. Returns the number of jobs
    /// consumed.
    pub fn flush(&mut self) -> Result<usize> {
        let batch = self.drain.drain();
        if batch.is_empty() {
            return Ok(0);
        }

        let (endpoint_jobs, secondary_jobs): (Vec<&CompletedJob>, Vec<&CompletedJob>) = batch
            .iter()
            .partition(|job| job.target() == TargetType::Endpoint);

        let endpoint_rows = self.collect_rows(&endpoint_jobs);
        let written_endpoint = self
            .endpoint
            .append(&endpoint_rows)
            .context("writing endpoint table")?;
        self.stats
            .record_n(Counter::EndpointRows, written_endpoint as u64);

        let secondary_rows = self.collect_rows(&secondary_jobs);
        let written_secondary = self
            .secondary
            .append(&secondary_rows)
            .context("writing secondary-hop table")?;
        self.stats
            .record_n(Counter::SecondaryRows, written_secondary as u64);

        let jobs = batch.len();
        let mut removed = 0u64;
        for job in batch {
            if job.output.release() {
                removed += 1;
            }
        }
        self.stats.record_n(Counter::RawRemoved, removed);

        debug!(
            jobs,
            endpoint_rows = written_endpoint,
            secondary_rows = written_secondary,
            raw_removed = removed,
            "flushed batch",
        );

        Ok(jobs)
    }

    fn collect_rows(&self, jobs: &[&CompletedJob]) -> Vec<ProbeRow> {
        let mut rows = Vec::new();

        for job in jobs {
            match self.parser.parse(job.output.path(), job.seq) {
                Ok(mut parsed) => rows.append(&mut parsed),
                Err(e) => {
                    self.stats.record(Counter::ParseFailures);
                    warn!(
                        job = %job.id,
                        group = %job.key,
                        seq = job.seq,
                        status = ?job.status,
                        error = %e,
                        "skipping unusable probe output",
                    );
                }
            }
        }

        rows
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::artifact::ScopedArtifact;
    use crate::dispatch::{completion_queue, CompletionQueue, JobId};
    use crate::grouping::GroupKey;

    fn trace_line(dst: &str) -> String {
        format!(
            r#"{{"type":"trace","dst":"{dst}","stop_reason":"COMPLETED","start":{{"sec":1718000000,"ftime":"2024-06-10 06:13:20"}},"hop_count":5,"hops":[{{"addr":"{dst}","probe_ttl":5,"rtt":1.5}}]}}"#
        )
    }

    fn push_job(
        queue: &CompletionQueue,
        dir: &Path,
        id: u64,
        key: GroupKey,
        seq: u64,
        lines: &[String],
    ) -> PathBuf {
        let output = ScopedArtifact::create_with_lines(dir, "raw", "json", lines).expect("raw");
        let path = output.path().to_path_buf();
        queue
            .push(CompletedJob {
                id: JobId(id),
                key,
                seq,
                input: dir.join("input.txt"),
                output,
                status: None,
            })
            .expect("push");
        path
    }

    fn worker(drain: CompletionDrain, dir: &Path, flush: Duration) -> (AggregationWorker, Arc<RunStats>) {
        let stats = Arc::new(RunStats::new());
        let worker = AggregationWorker::new(
            drain,
            Arc::new(ScamperTraceParser),
            dir.join("out_endpoint.csv"),
            dir.join("out_sec_last.csv"),
            flush,
            Arc::clone(&stats),
        );
        (worker, stats)
    }

    const SECONDARY: GroupKey = GroupKey::Secondary {
        depth: 4,
        endpoint_depth: 5,
    };

    #[test]
    fn test_flush_splits_by_target_and_removes_raw_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (queue, drain) = completion_queue();
        let (mut worker, stats) = worker(drain, dir.path(), Duration::from_secs(10));

        let raw = vec![
            push_job(
                &queue,
                dir.path(),
                0,
                GroupKey::Endpoint { depth: 5 },
                0,
                &[trace_line("198.51.100.1"), trace_line("198.51.100.2")],
            ),
            push_job(&queue, dir.path(), 1, SECONDARY, 0, &[trace_line("198.51.100.1")]),
        ];

        assert_eq!(worker.flush().expect("flush"), 2);
        assert_eq!(worker.flush().expect("flush"), 0);

        let endpoint = std::fs::read_to_string(dir.path().join("out_endpoint.csv")).expect("read");
        assert_eq!(endpoint.lines().count(), 3);
        let secondary = std::fs::read_to_string(dir.path().join("out_sec_last.csv")).expect("read");
        assert_eq!(secondary.lines().count(), 2);

        assert!(raw.iter().all(|p| !p.exists()));
        assert_eq!(stats.total(Counter::EndpointRows), 2);
        assert_eq!(stats.total(Counter::SecondaryRows), 1);
        assert_eq!(stats.total(Counter::RawRemoved), 2);
    }

    #[test]
    fn test_malformed_output_is_skipped_and_still_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (queue, drain) = completion_queue();
        let (mut worker, stats) = worker(drain, dir.path(), Duration::from_secs(10));

        let bad = push_job(
            &queue,
            dir.path(),
            0,
            GroupKey::Endpoint { depth: 5 },
            0,
            &["{truncated".to_string()],
        );
        let empty = push_job(&queue, dir.path(), 1, GroupKey::Endpoint { depth: 5 }, 0, &[]);
        let good = push_job(
            &queue,
            dir.path(),
            2,
            GroupKey::Endpoint { depth: 5 },
            0,
            &[trace_line("198.51.100.3")],
        );

        assert_eq!(worker.flush().expect("flush"), 3);

        let endpoint = std::fs::read_to_string(dir.path().join("out_endpoint.csv")).expect("read");
        assert_eq!(endpoint.lines().count(), 2);
        assert!(endpoint.contains("198.51.100.3"));
        assert!(!bad.exists() && !empty.exists() && !good.exists());
        assert_eq!(stats.total(Counter::ParseFailures), 2);
        assert!(!dir.path().join("out_sec_last.csv").exists());
    }

    #[tokio::test]
    async fn test_finish_signal_flushes_remaining_jobs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (queue, drain) = completion_queue();
        let (worker, _stats) = worker(drain, dir.path(), Duration::from_secs(3600));

        let finish = CancellationToken::new();
        let stop = CancellationToken::new();
        let handle = worker.spawn(finish.clone(), stop.clone());

        let raw = push_job(
            &queue,
            dir.path(),
            0,
            GroupKey::Endpoint { depth: 5 },
            7,
            &[trace_line("198.51.100.1")],
        );
        finish.cancel();

        handle.await.expect("join").expect("worker result");
        let endpoint = std::fs::read_to_string(dir.path().join("out_endpoint.csv")).expect("read");
        assert!(endpoint.lines().any(|l| l.contains(",7,198.51.100.1,")));
        assert!(!raw.exists());
        assert!(!stop.is_cancelled());
    }

    #[tokio::test]
    async fn test_storage_failure_cancels_stop_token() {
        let dir = tempfile::tempdir().expect("tempdir");
        // A directory where the endpoint table should be makes appends fail.
        std::fs::create_dir(dir.path().join("out_endpoint.csv")).expect("mkdir");

        let (queue, drain) = completion_queue();
        let (worker, _stats) = worker(drain, dir.path(), Duration::from_millis(20));

        push_job(
            &queue,
            dir.path(),
            0,
            GroupKey::Endpoint { depth: 5 },
            0,
            &[trace_line("198.51.100.1")],
        );

        let finish = CancellationToken::new();
        let stop = CancellationToken::new();
        let result = worker.spawn(finish, stop.clone()).await.expect("join");

        assert!(result.is_err());
        assert!(stop.is_cancelled());
    }
}
