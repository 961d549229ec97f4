use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use tokio::process::Child;
use tracing::warn;

use crate::artifact::ScopedArtifact;
use crate::grouping::{GroupKey, TargetType};

/// Unique identity of a probe job within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// A spawned probe process and the files it reads and writes.
#[derive(Debug)]
pub struct ProbeJob {
    pub id: JobId,
    pub key: GroupKey,
    pub seq: u64,
    /// Group input file the process reads. Owned by the group, not the job.
    pub input: PathBuf,
    /// Raw output file the process writes.
    pub output: ScopedArtifact,
    child: Child,
}

impl ProbeJob {
    pub fn new(
        id: JobId,
        key: GroupKey,
        seq: u64,
        input: PathBuf,
        output: ScopedArtifact,
        child: Child,
    ) -> Self {
        Self {
            id,
            key,
            seq,
            input,
            output,
            child,
        }
    }

    /// Non-blocking termination check.
    pub fn try_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Block until the process exits.
    pub async fn wait(mut self) -> CompletedJob {
        let status = match self.child.wait().await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(job = %self.id, error = %e, "waiting for probe process failed");
                None
            }
        };
        self.complete(status)
    }

    /// Drop the process handle and keep the job's identity and output.
    pub fn complete(self, status: Option<ExitStatus>) -> CompletedJob {
        CompletedJob {
            id: self.id,
            key: self.key,
            seq: self.seq,
            input: self.input,
            output: self.output,
            status,
        }
    }
}

/// A job whose process has terminated and whose output awaits aggregation.
///
/// Consuming it (aggregating then releasing `output`) removes the raw file,
/// so a job can be aggregated at most once.
#[derive(Debug)]
pub struct CompletedJob {
    pub id: JobId,
    pub key: GroupKey,
    pub seq: u64,
    pub input: PathBuf,
    pub output: ScopedArtifact,
    /// Exit status, if it could be observed.
    pub status: Option<ExitStatus>,
}

impl CompletedJob {
    pub fn target(&self) -> TargetType {
        self.key.target()
    }

    pub fn exited_cleanly(&self) -> bool {
        self.status.is_some_and(|s| s.success())
    }
}
