//! Run orchestration: grouping, materialization, dispatch, aggregation and
//! cleanup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregate::{AggregationWorker, OutputParser, ScamperTraceParser};
use crate::artifact::materialize_groups;
use crate::config::Config;
use crate::destination::Destination;
use crate::dispatch::{completion_queue, DispatchSettings, Dispatcher};
use crate::grouping::{build_groups, TargetType};
use crate::probe::ProbeLauncher;
use crate::stats::{Counter, RunStats};

/// Totals reported when a run finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub rounds: u64,
    pub interrupted: bool,
    pub groups: usize,
    pub spawned: u64,
    pub spawn_failed: u64,
    pub skipped_backpressure: u64,
    pub completed: u64,
    pub parse_failures: u64,
    pub endpoint_rows: u64,
    pub secondary_rows: u64,
}

/// A configured probing engine.
pub struct Engine {
    cfg: Config,
    launcher: Arc<dyn ProbeLauncher>,
    parser: Arc<dyn OutputParser>,
    stats: Arc<RunStats>,
}

impl Engine {
    pub fn new(cfg: Config, launcher: Arc<dyn ProbeLauncher>) -> Self {
        Self {
            cfg,
            launcher,
            parser: Arc::new(ScamperTraceParser),
            stats: Arc::new(RunStats::new()),
        }
    }

    /// Replace the raw output parser.
    pub fn with_parser(mut self, parser: Arc<dyn OutputParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn stats(&self) -> Arc<RunStats> {
        Arc::clone(&self.stats)
    }

    /// Probe `table` until the round budget is spent or `stop` fires.
    ///
    /// Configuration problems are reported before any file is created or
    /// process spawned.
    pub async fn run(&self, table: &[Destination], stop: CancellationToken) -> Result<RunSummary> {
        let started = Instant::now();

        self.cfg.validate().context("invalid configuration")?;
        let policy = self.cfg.sampling.resolve()?;

        let groups = build_groups(table, policy).context("grouping destinations")?;
        if groups.is_empty() {
            bail!("destination table produced no probe groups");
        }

        info!(
            destinations = table.len(),
            endpoint_groups = groups.endpoint.len(),
            endpoint_addresses = groups.address_count(TargetType::Endpoint),
            secondary_groups = groups.secondary.len(),
            secondary_addresses = groups.address_count(TargetType::Secondary),
            "grouped destinations",
        );

        // 1. Startup: per-run temp dir, output location, group input files.
        let run_dir = RunDir::create(&self.cfg.temp_dir)?;
        ensure_parent(&self.cfg.endpoint_output_path())?;

        let inputs = materialize_groups(&groups, run_dir.path())?;
        let settings = DispatchSettings::from_config(&self.cfg, run_dir.path().to_path_buf())?;

        // 2. Aggregation worker and stats reporter.
        let (queue, drain) = completion_queue();
        let worker = AggregationWorker::new(
            drain,
            Arc::clone(&self.parser),
            self.cfg.endpoint_output_path(),
            self.cfg.secondary_output_path(),
            self.cfg.flush_interval,
            Arc::clone(&self.stats),
        );

        let finish = CancellationToken::new();
        let worker_handle = worker.spawn(finish.clone(), stop.clone());

        let reporter_cancel = CancellationToken::new();
        let reporter = spawn_stats_reporter(
            Arc::clone(&self.stats),
            self.cfg.stats_interval,
            reporter_cancel.clone(),
        );

        // 3. Dispatch until done, then drain in-flight probes.
        let outcome = {
            let mut dispatcher = Dispatcher::new(
                settings,
                Arc::clone(&self.launcher),
                &inputs,
                queue,
                Arc::clone(&self.stats),
            );
            dispatcher.run(&stop).await
        };

        // 4. Shutdown: let the worker consume what is left, then clean up.
        finish.cancel();
        let worker_result = worker_handle.await;

        reporter_cancel.cancel();
        if let Err(e) = reporter.await {
            debug!(error = %e, "stats reporter join failed");
        }

        drop(inputs);
        drop(run_dir);

        worker_result.context("aggregation worker panicked")??;

        let summary = self.summary(outcome.rounds, outcome.interrupted, groups.len());
        info!(
            rounds = summary.rounds,
            interrupted = summary.interrupted,
            spawned = summary.spawned,
            completed = summary.completed,
            endpoint_rows = summary.endpoint_rows,
            secondary_rows = summary.secondary_rows,
            elapsed = ?started.elapsed(),
            "run finished",
        );

        Ok(summary)
    }

    fn summary(&self, rounds: u64, interrupted: bool, groups: usize) -> RunSummary {
        let s = &self.stats;
        RunSummary {
            rounds,
            interrupted,
            groups,
            spawned: s.total(Counter::Spawned),
            spawn_failed: s.total(Counter::SpawnFailed),
            skipped_backpressure: s.total(Counter::SkippedBackpressure),
            completed: s.total(Counter::Completed),
            parse_failures: s.total(Counter::ParseFailures),
            endpoint_rows: s.total(Counter::EndpointRows),
            secondary_rows: s.total(Counter::SecondaryRows),
        }
    }
}

/// Per-run scratch directory under the configured temp dir. Removed with
/// everything in it on drop.
struct RunDir {
    path: PathBuf,
}

impl RunDir {
    fn create(base: &Path) -> Result<Self> {
        let path = base.join(format!("run_{}", Uuid::new_v4().simple()));
        std::fs::create_dir_all(&path)
            .with_context(|| format!("creating run directory {}", path.display()))?;
        debug!(path = %path.display(), "created run directory");
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunDir {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed run directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove run directory"),
        }
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating output directory {}", parent.display()))?;
    }
    Ok(())
}

/// Log counter deltas every `every` until cancelled.
fn spawn_stats_reporter(
    stats: Arc<RunStats>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let snapshot = stats.snapshot();
                    if snapshot.is_empty() {
                        continue;
                    }

                    let get = |c: Counter| {
                        snapshot
                            .iter()
                            .find(|(k, _)| *k == c)
                            .map_or(0, |(_, n)| *n)
                    };

                    info!(
                        in_flight = stats.in_flight(),
                        rounds = get(Counter::Rounds),
                        spawned = get(Counter::Spawned),
                        completed = get(Counter::Completed),
                        endpoint_rows = get(Counter::EndpointRows),
                        secondary_rows = get(Counter::SecondaryRows),
                        interval = ?every,
                        "run stats",
                    );

                    for (counter, count) in &snapshot {
                        debug!(counter = %counter, count, "  by counter");
                    }
                }
            }
        }
    })
}
