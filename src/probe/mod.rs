//! Invocation of the external probing tool.
//!
//! The engine treats the tool as opaque: it builds a fixed-shape command line
//! (output format, output path, packet budget, trace specification, input
//! file) and spawns it. [`ProbeLauncher`] is the seam tests use to substitute
//! a fake tool.

use std::ffi::OsString;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Result};
use tokio::process::{Child, Command};

use crate::config::ProbeConfig;

/// Trace methods understood by the probing tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceMethod {
    IcmpParis,
    UdpParis,
    TcpAck,
    Icmp,
    Udp,
    Tcp,
}

impl TraceMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IcmpParis => "icmp-paris",
            Self::UdpParis => "udp-paris",
            Self::TcpAck => "tcp-ack",
            Self::Icmp => "icmp",
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "icmp-paris" => Some(Self::IcmpParis),
            "udp-paris" => Some(Self::UdpParis),
            "tcp-ack" => Some(Self::TcpAck),
            "icmp" => Some(Self::Icmp),
            "udp" => Some(Self::Udp),
            "tcp" => Some(Self::Tcp),
            _ => None,
        }
    }
}

/// The `-c` trace specification handed to the tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceSpec {
    pub method: TraceMethod,
    pub source: Option<IpAddr>,
    pub attempts: u8,
    pub first_hop: Option<u8>,
    pub max_hop: Option<u8>,
    pub gap_limit: Option<u8>,
}

impl TraceSpec {
    /// A probe pinned to a single hop: first and max hop both equal `depth`.
    pub fn hop_limited(method: TraceMethod, source: Option<IpAddr>, attempts: u8, depth: u8) -> Self {
        Self {
            method,
            source,
            attempts,
            first_hop: Some(depth),
            max_hop: Some(depth),
            gap_limit: None,
        }
    }

    /// A full trace that stops after `gap_limit` silent hops.
    pub fn full(method: TraceMethod, attempts: u8, gap_limit: u8) -> Self {
        Self {
            method,
            source: None,
            attempts,
            first_hop: None,
            max_hop: None,
            gap_limit: Some(gap_limit),
        }
    }
}

impl fmt::Display for TraceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trace -P {}", self.method.as_str())?;
        if let Some(source) = self.source {
            write!(f, " -S {source}")?;
        }
        write!(f, " -q {}", self.attempts)?;
        if let Some(gap) = self.gap_limit {
            write!(f, " -g {gap}")?;
        }
        if let Some(first) = self.first_hop {
            write!(f, " -f {first}")?;
        }
        if let Some(max) = self.max_hop {
            write!(f, " -m {max}")?;
        }
        Ok(())
    }
}

/// Everything needed to run the tool once.
#[derive(Debug, Clone)]
pub struct ProbeCommand {
    pub output: PathBuf,
    pub input: PathBuf,
    pub packets_per_second: u32,
    pub spec: TraceSpec,
}

impl ProbeCommand {
    /// Command-line arguments after the executable name.
    pub fn args(&self) -> Vec<OsString> {
        vec![
            "-O".into(),
            "json".into(),
            "-o".into(),
            self.output.clone().into_os_string(),
            "-p".into(),
            self.packets_per_second.to_string().into(),
            "-c".into(),
            self.spec.to_string().into(),
            self.input.clone().into_os_string(),
        ]
    }
}

/// Spawns probe processes.
pub trait ProbeLauncher: Send + Sync {
    /// Start one probe run. The returned child is polled by the dispatcher.
    fn launch(&self, cmd: &ProbeCommand) -> std::io::Result<Child>;
}

/// Launches the scamper executable.
#[derive(Debug, Clone)]
pub struct ScamperLauncher {
    binary: PathBuf,
}

impl ScamperLauncher {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// Build a launcher after checking the executable resolves.
    pub fn from_config(cfg: &ProbeConfig) -> Result<Self> {
        let binary = resolve_binary(&cfg.binary)?;
        Ok(Self::new(binary))
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

impl ProbeLauncher for ScamperLauncher {
    /// Each probe gets its own process group, so a terminal SIGINT reaches
    /// only the engine and running probes are left to finish.
    fn launch(&self, cmd: &ProbeCommand) -> std::io::Result<Child> {
        Command::new(&self.binary)
            .args(cmd.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .process_group(0)
            .kill_on_drop(false)
            .spawn()
    }
}

/// Resolve an executable: explicit paths must exist, bare names are looked
/// up on `PATH`.
pub fn resolve_binary(binary: &Path) -> Result<PathBuf> {
    if binary.components().count() > 1 || binary.is_absolute() {
        if binary.is_file() {
            return Ok(binary.to_path_buf());
        }
        bail!("probe binary {} does not exist", binary.display());
    }

    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(binary);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    bail!("probe binary {} not found on PATH", binary.display())
}

/// Pick a source address for a group. With rotation enabled the pool is
/// indexed by the group's endpoint depth.
pub fn select_source(pool: &[IpAddr], rotate: bool, endpoint_depth: u8) -> Option<IpAddr> {
    if pool.is_empty() {
        return None;
    }
    if rotate {
        pool.get(usize::from(endpoint_depth) % pool.len()).copied()
    } else {
        pool.first().copied()
    }
}
