//! Partitioning of destinations into probe groups.
//!
//! Endpoint groups share a hop count. Secondary-hop groups share the
//! (secondary depth, endpoint depth) pair; each distinct secondary hop is
//! represented by the first destination seen behind it, so a shared hop is
//! probed once per round rather than once per destination behind it.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;

use cidr::{IpCidr, IpInet};
use thiserror::Error;

use crate::destination::{Destination, SecondaryHop};

/// Which of the two simultaneous probe classes a group or job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TargetType {
    Endpoint,
    Secondary,
}

impl TargetType {
    /// Short label used in file names and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Endpoint => "endpoint",
            Self::Secondary => "seclast",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a probe group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupKey {
    /// Endpoints answering at `depth`.
    Endpoint { depth: u8 },
    /// Secondary hops at `depth` in front of endpoints at `endpoint_depth`.
    Secondary { depth: u8, endpoint_depth: u8 },
}

impl GroupKey {
    pub fn target(&self) -> TargetType {
        match self {
            Self::Endpoint { .. } => TargetType::Endpoint,
            Self::Secondary { .. } => TargetType::Secondary,
        }
    }

    /// Hop limit the probe is sent with.
    pub fn probe_depth(&self) -> u8 {
        match *self {
            Self::Endpoint { depth } | Self::Secondary { depth, .. } => depth,
        }
    }

    /// Depth of the endpoints behind this group; drives source rotation.
    pub fn endpoint_depth(&self) -> u8 {
        match *self {
            Self::Endpoint { depth } => depth,
            Self::Secondary { endpoint_depth, .. } => endpoint_depth,
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Endpoint { depth } => write!(f, "endpoint@{depth}"),
            Self::Secondary {
                depth,
                endpoint_depth,
            } => write!(f, "seclast@{depth}/{endpoint_depth}"),
        }
    }
}

/// Addresses sharing a group key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeGroup {
    pub key: GroupKey,
    pub addresses: BTreeSet<IpAddr>,
}

/// Canonical sub-sampling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingPolicy {
    None,
    /// Keep at most `cap` destinations per `/prefix_len` subnet.
    BySubnet { prefix_len: u8, cap: usize },
    /// Keep at most `cap` destinations per secondary hop address.
    BySecondaryAddress { cap: usize },
}

/// Errors raised while partitioning a destination table.
#[derive(Error, Debug)]
pub enum GroupingError {
    #[error("prefix length /{prefix_len} is invalid for {address}")]
    InvalidPrefix { prefix_len: u8, address: IpAddr },
}

/// Probe groups for both target types.
#[derive(Debug, Default)]
pub struct Groups {
    pub endpoint: Vec<ProbeGroup>,
    pub secondary: Vec<ProbeGroup>,
}

impl Groups {
    /// Iterates endpoint groups first, then secondary-hop groups.
    pub fn iter(&self) -> impl Iterator<Item = &ProbeGroup> {
        self.endpoint.iter().chain(self.secondary.iter())
    }

    pub fn len(&self) -> usize {
        self.endpoint.len() + self.secondary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total addresses across groups of the given target type.
    pub fn address_count(&self, target: TargetType) -> usize {
        let groups = match target {
            TargetType::Endpoint => &self.endpoint,
            TargetType::Secondary => &self.secondary,
        };
        groups.iter().map(|g| g.addresses.len()).sum()
    }
}

/// Partition a destination table into probe groups.
pub fn build_groups(
    table: &[Destination],
    policy: SamplingPolicy,
) -> Result<Groups, GroupingError> {
    let sampled = sample(table, policy)?;

    let mut endpoint: BTreeMap<u8, BTreeSet<IpAddr>> = BTreeMap::new();
    for dest in &sampled {
        endpoint.entry(dest.depth).or_default().insert(dest.address);
    }

    // First destination seen behind each distinct secondary hop.
    let mut representative: HashMap<SecondaryHop, &Destination> = HashMap::new();
    let mut order: Vec<SecondaryHop> = Vec::new();
    for dest in &sampled {
        let Some(hop) = dest.secondary else {
            continue;
        };
        if let Entry::Vacant(slot) = representative.entry(hop) {
            slot.insert(dest);
            order.push(hop);
        }
    }

    let mut secondary: BTreeMap<(u8, u8), BTreeSet<IpAddr>> = BTreeMap::new();
    for hop in order {
        if let Some(dest) = representative.get(&hop) {
            secondary
                .entry((hop.depth, dest.depth))
                .or_default()
                .insert(dest.address);
        }
    }

    Ok(Groups {
        endpoint: endpoint
            .into_iter()
            .map(|(depth, addresses)| ProbeGroup {
                key: GroupKey::Endpoint { depth },
                addresses,
            })
            .collect(),
        secondary: secondary
            .into_iter()
            .map(|((depth, endpoint_depth), addresses)| ProbeGroup {
                key: GroupKey::Secondary {
                    depth,
                    endpoint_depth,
                },
                addresses,
            })
            .collect(),
    })
}

/// Apply the sampling policy, preserving table order. Duplicate addresses
/// keep their first row only.
pub fn sample(
    table: &[Destination],
    policy: SamplingPolicy,
) -> Result<Vec<&Destination>, GroupingError> {
    let mut seen = HashSet::with_capacity(table.len());
    let unique = table.iter().filter(|d| seen.insert(d.address));

    match policy {
        SamplingPolicy::None => Ok(unique.collect()),
        SamplingPolicy::BySubnet { prefix_len, cap } => {
            let mut taken: HashMap<IpCidr, usize> = HashMap::new();
            let mut out = Vec::new();
            for dest in unique {
                let subnet = subnet_of(dest.address, prefix_len)?;
                let count = taken.entry(subnet).or_insert(0);
                if *count < cap {
                    *count += 1;
                    out.push(dest);
                }
            }
            Ok(out)
        }
        SamplingPolicy::BySecondaryAddress { cap } => {
            let mut taken: HashMap<IpAddr, usize> = HashMap::new();
            let mut out = Vec::new();
            for dest in unique {
                // Rows without a secondary hop have no partition to sample from.
                let Some(hop) = dest.secondary else {
                    continue;
                };
                let count = taken.entry(hop.address).or_insert(0);
                if *count < cap {
                    *count += 1;
                    out.push(dest);
                }
            }
            Ok(out)
        }
    }
}

fn subnet_of(address: IpAddr, prefix_len: u8) -> Result<IpCidr, GroupingError> {
    IpInet::new(address, prefix_len)
        .map(|inet| inet.network())
        .map_err(|_| GroupingError::InvalidPrefix {
            prefix_len,
            address,
        })
}
