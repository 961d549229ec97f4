use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::grouping::SamplingPolicy;
use crate::probe::TraceMethod;

/// Top-level configuration for a probing run.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Wall-clock interval between successive probing rounds. Default: 1s.
    #[serde(default = "default_probe_interval", with = "humantime_serde")]
    pub probe_interval: Duration,

    /// Number of rounds to run. 0 runs continuously until stopped.
    #[serde(default)]
    pub num_probes: u64,

    /// Output tables are written to `{output_prefix}_endpoint.csv` and
    /// `{output_prefix}_sec_last.csv`.
    #[serde(default = "default_output_prefix")]
    pub output_prefix: PathBuf,

    /// Directory holding group input files and raw probe output.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// How often the aggregation worker drains completed jobs. Default: 10s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Upper bound on concurrently running probe processes. 0 = unbounded.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// How often run statistics are logged. Default: 60s.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,

    /// Destination sub-sampling applied before grouping.
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Source address selection.
    #[serde(default)]
    pub source: SourceConfig,

    /// Probing tool invocation.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Full-trace discovery run.
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// Destination sub-sampling configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SamplingConfig {
    /// Sampling mode.
    #[serde(default)]
    pub mode: SamplingMode,

    /// Subnet prefix length used by `subnet` mode (e.g. 24).
    #[serde(default)]
    pub prefix_len: Option<u8>,

    /// Maximum destinations kept per partition.
    #[serde(default)]
    pub cap: Option<usize>,
}

/// Partitioning used when sub-sampling destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMode {
    #[default]
    None,
    Subnet,
    SecondaryAddress,
}

/// Source address pool.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceConfig {
    /// Local addresses probes may originate from. Empty lets the tool choose.
    #[serde(default)]
    pub addresses: Vec<String>,

    /// Rotate across the pool, indexed by the group's endpoint depth.
    #[serde(default)]
    pub rotate: bool,
}

/// Probing tool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Probe executable (path or name resolved on PATH). Default: "scamper".
    #[serde(default = "default_probe_binary")]
    pub binary: PathBuf,

    /// Packet budget handed to the tool. Default: 50000.
    #[serde(default = "default_packets_per_second")]
    pub packets_per_second: u32,

    /// Trace method. Default: "icmp-paris".
    #[serde(default = "default_method")]
    pub method: String,

    /// Attempts per hop. Default: 1.
    #[serde(default = "default_attempts")]
    pub attempts: u8,
}

/// Discovery (full trace) configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Packet budget for the discovery trace. Default: 200.
    #[serde(default = "default_discovery_pps")]
    pub packets_per_second: u32,

    /// Consecutive unresponsive hops before a trace gives up. Default: 15.
    #[serde(default = "default_gap_limit")]
    pub gap_limit: u8,
}

// --- Default value functions ---

fn default_probe_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_output_prefix() -> PathBuf {
    PathBuf::from("roman-hh/probe")
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("roman-hh/tmp_output")
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_max_in_flight() -> usize {
    4096
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_probe_binary() -> PathBuf {
    PathBuf::from("scamper")
}

fn default_packets_per_second() -> u32 {
    50_000
}

fn default_method() -> String {
    "icmp-paris".to_string()
}

fn default_attempts() -> u8 {
    1
}

fn default_discovery_pps() -> u32 {
    200
}

fn default_gap_limit() -> u8 {
    15
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            probe_interval: default_probe_interval(),
            num_probes: 0,
            output_prefix: default_output_prefix(),
            temp_dir: default_temp_dir(),
            flush_interval: default_flush_interval(),
            max_in_flight: default_max_in_flight(),
            stats_interval: default_stats_interval(),
            sampling: SamplingConfig::default(),
            source: SourceConfig::default(),
            probe: ProbeConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            binary: default_probe_binary(),
            packets_per_second: default_packets_per_second(),
            method: default_method(),
            attempts: default_attempts(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            packets_per_second: default_discovery_pps(),
            gap_limit: default_gap_limit(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.probe_interval.is_zero() {
            bail!("probe_interval must be positive");
        }

        if self.flush_interval.is_zero() {
            bail!("flush_interval must be positive");
        }

        if self.stats_interval.is_zero() {
            bail!("stats_interval must be positive");
        }

        if self.output_prefix.as_os_str().is_empty() {
            bail!("output_prefix is required");
        }

        if self.temp_dir.as_os_str().is_empty() {
            bail!("temp_dir is required");
        }

        self.sampling.resolve().context("invalid sampling config")?;
        self.source.resolve().context("invalid source config")?;
        self.probe.validate().context("invalid probe config")?;

        if self.discovery.packets_per_second == 0 {
            bail!("discovery.packets_per_second must be positive");
        }

        Ok(())
    }

    /// Path of the endpoint output table.
    pub fn endpoint_output_path(&self) -> PathBuf {
        with_suffix(&self.output_prefix, "_endpoint.csv")
    }

    /// Path of the secondary-hop output table.
    pub fn secondary_output_path(&self) -> PathBuf {
        with_suffix(&self.output_prefix, "_sec_last.csv")
    }
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut raw = prefix.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

impl SamplingConfig {
    /// Returns the canonical sampling policy, rejecting incomplete settings.
    pub fn resolve(&self) -> Result<SamplingPolicy> {
        match self.mode {
            SamplingMode::None => Ok(SamplingPolicy::None),
            SamplingMode::Subnet => {
                let (Some(prefix_len), Some(cap)) = (self.prefix_len, self.cap) else {
                    bail!("sampling mode 'subnet' requires both prefix_len and cap");
                };
                if prefix_len > 128 {
                    bail!("sampling prefix_len {prefix_len} is out of range");
                }
                if cap == 0 {
                    bail!("sampling cap must be positive");
                }
                Ok(SamplingPolicy::BySubnet { prefix_len, cap })
            }
            SamplingMode::SecondaryAddress => {
                let Some(cap) = self.cap else {
                    bail!("sampling mode 'secondary_address' requires cap");
                };
                if cap == 0 {
                    bail!("sampling cap must be positive");
                }
                Ok(SamplingPolicy::BySecondaryAddress { cap })
            }
        }
    }
}

impl SourceConfig {
    /// Parses the source address pool.
    pub fn resolve(&self) -> Result<Vec<IpAddr>> {
        self.addresses
            .iter()
            .map(|raw| {
                raw.trim()
                    .parse::<IpAddr>()
                    .with_context(|| format!("invalid source address: {raw}"))
            })
            .collect()
    }
}

impl ProbeConfig {
    /// Checks the invocation parameters that do not depend on the filesystem.
    pub fn validate(&self) -> Result<()> {
        if self.binary.as_os_str().is_empty() {
            bail!("probe.binary is required");
        }

        if self.packets_per_second == 0 {
            bail!("probe.packets_per_second must be positive");
        }

        if self.attempts == 0 {
            bail!("probe.attempts must be positive");
        }

        self.trace_method()?;

        Ok(())
    }

    /// Returns the parsed trace method.
    pub fn trace_method(&self) -> Result<TraceMethod> {
        TraceMethod::from_name(&self.method)
            .with_context(|| format!("unknown trace method: {}", self.method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.probe_interval, Duration::from_secs(1));
        assert_eq!(cfg.flush_interval, Duration::from_secs(10));
        assert_eq!(cfg.num_probes, 0);
        assert_eq!(cfg.max_in_flight, 4096);
        assert_eq!(cfg.probe.packets_per_second, 50_000);
        assert_eq!(cfg.probe.method, "icmp-paris");
        assert_eq!(cfg.discovery.gap_limit, 15);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
probe_interval: 2s
num_probes: 60
output_prefix: out/AS14593
flush_interval: 500ms
sampling:
  mode: subnet
  prefix_len: 24
  cap: 2
source:
  addresses: ["192.0.2.1", "192.0.2.2"]
  rotate: true
probe:
  binary: /usr/local/bin/scamper
  packets_per_second: 1000
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("valid yaml");
        assert_eq!(cfg.probe_interval, Duration::from_secs(2));
        assert_eq!(cfg.flush_interval, Duration::from_millis(500));
        assert_eq!(cfg.num_probes, 60);
        assert_eq!(cfg.sampling.mode, SamplingMode::Subnet);
        assert!(cfg.source.rotate);
        assert_eq!(cfg.source.resolve().expect("valid pool").len(), 2);
        assert_eq!(cfg.probe.packets_per_second, 1000);
        assert_eq!(cfg.probe.method, "icmp-paris");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_output_paths() {
        let cfg = Config {
            output_prefix: PathBuf::from("out/20240529/AS14593"),
            ..Default::default()
        };
        assert_eq!(
            cfg.endpoint_output_path(),
            PathBuf::from("out/20240529/AS14593_endpoint.csv")
        );
        assert_eq!(
            cfg.secondary_output_path(),
            PathBuf::from("out/20240529/AS14593_sec_last.csv")
        );
    }

    #[test]
    fn test_subnet_sampling_requires_prefix_and_cap() {
        let sampling = SamplingConfig {
            mode: SamplingMode::Subnet,
            prefix_len: Some(24),
            cap: None,
        };
        let err = sampling.resolve().unwrap_err();
        assert!(err.to_string().contains("prefix_len and cap"));

        let sampling = SamplingConfig {
            mode: SamplingMode::Subnet,
            prefix_len: None,
            cap: Some(2),
        };
        assert!(sampling.resolve().is_err());
    }

    #[test]
    fn test_secondary_sampling_requires_cap() {
        let sampling = SamplingConfig {
            mode: SamplingMode::SecondaryAddress,
            prefix_len: None,
            cap: None,
        };
        let err = sampling.resolve().unwrap_err();
        assert!(err.to_string().contains("requires cap"));

        let sampling = SamplingConfig {
            mode: SamplingMode::SecondaryAddress,
            prefix_len: None,
            cap: Some(3),
        };
        assert_eq!(
            sampling.resolve().expect("valid"),
            SamplingPolicy::BySecondaryAddress { cap: 3 }
        );
    }

    #[test]
    fn test_validation_rejects_bad_source_address() {
        let cfg = Config {
            source: SourceConfig {
                addresses: vec!["not-an-ip".to_string()],
                rotate: false,
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:#}").contains("not-an-ip"));
    }

    #[test]
    fn test_validation_rejects_unknown_method() {
        let cfg = Config {
            probe: ProbeConfig {
                method: "carrier-pigeon".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:#}").contains("carrier-pigeon"));
    }

    #[test]
    fn test_validation_rejects_zero_interval() {
        let cfg = Config {
            probe_interval: Duration::ZERO,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("probe_interval"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/hitchhiker.yaml")).unwrap_err();
        assert!(err.to_string().contains("reading config file"));
    }
}
