//! Paced probing rounds.
//!
//! Each round launches one probe process per group without waiting on any of
//! them. Terminated processes are detected by a non-blocking check after the
//! round's pacing sleep and handed to the aggregation worker. Once the loop
//! ends (round budget spent or stop requested), every still-running process
//! is awaited so that no completed output is left behind.

pub mod job;
pub mod queue;

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifact::{GroupInput, ScopedArtifact};
use crate::config::Config;
use crate::probe::{select_source, ProbeCommand, ProbeLauncher, TraceMethod, TraceSpec};
use crate::stats::{Counter, RunStats};

pub use job::{CompletedJob, JobId, ProbeJob};
pub use queue::{completion_queue, CompletionDrain, CompletionQueue};

/// Dispatcher phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Active,
    Draining,
    Stopped,
}

/// Per-run dispatch parameters.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub probe_interval: Duration,
    /// `None` runs until stopped.
    pub rounds: Option<u64>,
    /// 0 = unbounded.
    pub max_in_flight: usize,
    pub packets_per_second: u32,
    pub method: TraceMethod,
    pub attempts: u8,
    pub sources: Vec<IpAddr>,
    pub rotate: bool,
    /// Where raw probe output is written.
    pub raw_dir: PathBuf,
}

impl DispatchSettings {
    pub fn from_config(cfg: &Config, raw_dir: PathBuf) -> Result<Self> {
        Ok(Self {
            probe_interval: cfg.probe_interval,
            rounds: (cfg.num_probes > 0).then_some(cfg.num_probes),
            max_in_flight: cfg.max_in_flight,
            packets_per_second: cfg.probe.packets_per_second,
            method: cfg.probe.trace_method()?,
            attempts: cfg.probe.attempts,
            sources: cfg.source.resolve().context("resolving source pool")?,
            rotate: cfg.source.rotate,
            raw_dir,
        })
    }
}

/// Jobs whose process has not been observed to terminate.
#[derive(Debug, Default)]
pub struct InFlightSet {
    jobs: HashMap<JobId, ProbeJob>,
}

impl InFlightSet {
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.jobs.contains_key(&id)
    }

    /// Ids of all running jobs, ascending.
    pub fn ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.jobs.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn insert(&mut self, job: ProbeJob) {
        self.jobs.insert(job.id, job);
    }

    /// Remove and return every job whose process has terminated.
    ///
    /// A job whose status cannot be queried is treated as terminated with an
    /// unknown status so it does not stay in the set forever.
    pub fn reap(&mut self) -> Vec<CompletedJob> {
        let mut finished = Vec::new();

        for (id, job) in &mut self.jobs {
            match job.try_exit() {
                Ok(Some(status)) => finished.push((*id, Some(status))),
                Ok(None) => {}
                Err(e) => {
                    warn!(job = %id, error = %e, "probe status check failed");
                    finished.push((*id, None));
                }
            }
        }

        finished
            .into_iter()
            .filter_map(|(id, status)| self.jobs.remove(&id).map(|job| job.complete(status)))
            .collect()
    }

    fn take_all(&mut self) -> Vec<ProbeJob> {
        let mut jobs: Vec<ProbeJob> = self.jobs.drain().map(|(_, job)| job).collect();
        jobs.sort_unstable_by_key(|job| job.id);
        jobs
    }
}

/// How a dispatch loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub rounds: u64,
    pub interrupted: bool,
}

/// Drives rounds over a fixed set of materialized groups.
pub struct Dispatcher<'a> {
    settings: DispatchSettings,
    launcher: Arc<dyn ProbeLauncher>,
    groups: &'a [GroupInput],
    in_flight: InFlightSet,
    queue: CompletionQueue,
    stats: Arc<RunStats>,
    next_id: u64,
    state: DispatchState,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        settings: DispatchSettings,
        launcher: Arc<dyn ProbeLauncher>,
        groups: &'a [GroupInput],
        queue: CompletionQueue,
        stats: Arc<RunStats>,
    ) -> Self {
        Self {
            settings,
            launcher,
            groups,
            in_flight: InFlightSet::default(),
            queue,
            stats,
            next_id: 0,
            state: DispatchState::Active,
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn in_flight(&self) -> &InFlightSet {
        &self.in_flight
    }

    /// Run rounds until the budget is spent or `stop` fires, then drain.
    pub async fn run(&mut self, stop: &CancellationToken) -> DispatchOutcome {
        let mut seq: u64 = 0;
        let mut interrupted = false;

        info!(
            groups = self.groups.len(),
            rounds = ?self.settings.rounds,
            interval = ?self.settings.probe_interval,
            "dispatch started",
        );

        while self.settings.rounds.map_or(true, |total| seq < total) {
            if stop.is_cancelled() {
                interrupted = true;
                break;
            }

            let deadline = Instant::now() + self.settings.probe_interval;
            self.spawn_round(seq);
            seq += 1;

            tokio::select! {
                _ = stop.cancelled() => interrupted = true,
                _ = tokio::time::sleep_until(deadline) => {}
            }

            self.reap();

            if interrupted {
                break;
            }
        }

        if interrupted {
            info!(rounds = seq, "stop requested, draining in-flight probes");
        }

        self.drain().await;

        DispatchOutcome {
            rounds: seq,
            interrupted,
        }
    }

    /// Launch one probe per group for round `seq`. Returns the number of
    /// processes started.
    ///
    /// The walk starts at a different group each round so that a full
    /// in-flight set does not skip the same groups every time.
    pub fn spawn_round(&mut self, seq: u64) -> usize {
        let groups = self.groups;
        let mut spawned = 0usize;
        let mut skipped = 0u64;

        let start = round_offset(seq, groups.len());
        let (head, tail) = groups.split_at(start);

        for group in tail.iter().chain(head) {
            if self.at_capacity() {
                skipped += 1;
                continue;
            }

            if self.spawn_job(group, seq) {
                spawned += 1;
            }
        }

        self.stats.record(Counter::Rounds);

        if skipped > 0 {
            warn!(
                seq,
                skipped,
                in_flight = self.in_flight.len(),
                max_in_flight = self.settings.max_in_flight,
                "in-flight limit reached, skipping groups this round",
            );
            self.stats.record_n(Counter::SkippedBackpressure, skipped);
        }

        self.stats.set_in_flight(self.in_flight.len());
        debug!(seq, spawned, in_flight = self.in_flight.len(), "round dispatched");

        spawned
    }

    fn at_capacity(&self) -> bool {
        self.settings.max_in_flight > 0 && self.in_flight.len() >= self.settings.max_in_flight
    }

    fn spawn_job(&mut self, group: &GroupInput, seq: u64) -> bool {
        let key = group.key;
        let prefix = format!("{}_{seq}", key.target());
        let output = ScopedArtifact::reserve(&self.settings.raw_dir, &prefix, "json");

        let source = select_source(&self.settings.sources, self.settings.rotate, key.endpoint_depth());
        let cmd = ProbeCommand {
            output: output.path().to_path_buf(),
            input: group.file.path().to_path_buf(),
            packets_per_second: self.settings.packets_per_second,
            spec: TraceSpec::hop_limited(
                self.settings.method,
                source,
                self.settings.attempts,
                key.probe_depth(),
            ),
        };

        match self.launcher.launch(&cmd) {
            Ok(child) => {
                let id = JobId(self.next_id);
                self.next_id += 1;
                self.in_flight
                    .insert(ProbeJob::new(id, key, seq, cmd.input, output, child));
                self.stats.record(Counter::Spawned);
                true
            }
            Err(e) => {
                warn!(group = %key, seq, error = %e, "failed to launch probe");
                self.stats.record(Counter::SpawnFailed);
                false
            }
        }
    }

    /// Move every terminated job to the completion queue. Returns how many
    /// were moved.
    pub fn reap(&mut self) -> usize {
        let finished = self.in_flight.reap();
        let n = finished.len();

        for job in finished {
            self.hand_off(job);
        }

        self.stats.set_in_flight(self.in_flight.len());
        n
    }

    /// Wait for every running job and queue it.
    pub async fn drain(&mut self) {
        self.state = DispatchState::Draining;

        let pending = self.in_flight.take_all();
        if !pending.is_empty() {
            info!(jobs = pending.len(), "waiting for in-flight probes");
        }

        for job in pending {
            let done = job.wait().await;
            self.hand_off(done);
        }

        self.stats.set_in_flight(0);
        self.state = DispatchState::Stopped;
    }

    fn hand_off(&self, job: CompletedJob) {
        self.stats.record(Counter::Completed);

        if !job.exited_cleanly() {
            self.stats.record(Counter::NonzeroExit);
            debug!(job = %job.id, group = %job.key, seq = job.seq, status = ?job.status, "probe exited abnormally");
        }

        if let Err(job) = self.queue.push(job) {
            warn!(job = %job.id, seq = job.seq, "aggregation worker gone, discarding probe output");
        }
    }
}

fn round_offset(seq: u64, groups: usize) -> usize {
    if groups == 0 {
        return 0;
    }
    (seq % groups as u64) as usize
}
