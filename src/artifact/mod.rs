//! Uniquely named temporary files whose removal is tied to ownership.
//!
//! Group input files and raw probe output both go through [`ScopedArtifact`]:
//! the name is derived from a random identifier, and the file is removed
//! either explicitly via [`ScopedArtifact::release`] or when the owner drops
//! it. Removing a file that is already gone is a no-op.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::grouping::{GroupKey, Groups};

/// An owned path under a run's temp directory.
#[derive(Debug)]
pub struct ScopedArtifact {
    path: PathBuf,
    released: bool,
}

impl ScopedArtifact {
    /// Reserve a collision-free path `{dir}/{prefix}_{uuid}.{ext}`.
    /// Nothing is created on disk.
    pub fn reserve(dir: &Path, prefix: &str, ext: &str) -> Self {
        let name = format!("{prefix}_{}.{ext}", Uuid::new_v4().simple());
        Self {
            path: dir.join(name),
            released: false,
        }
    }

    /// Create a file with the given lines, synced to disk before returning.
    pub fn create_with_lines<I, T>(dir: &Path, prefix: &str, ext: &str, lines: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: std::fmt::Display,
    {
        let artifact = Self::reserve(dir, prefix, ext);

        let file = File::create(&artifact.path)
            .with_context(|| format!("creating {}", artifact.path.display()))?;
        let mut writer = BufWriter::new(file);
        for line in lines {
            writeln!(writer, "{line}")
                .with_context(|| format!("writing {}", artifact.path.display()))?;
        }
        let file = writer
            .into_inner()
            .map_err(|e| e.into_error())
            .with_context(|| format!("flushing {}", artifact.path.display()))?;
        file.sync_all()
            .with_context(|| format!("syncing {}", artifact.path.display()))?;

        Ok(artifact)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file currently exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Remove the file now. Returns whether a file was actually removed.
    pub fn release(mut self) -> bool {
        self.remove_file()
    }

    fn remove_file(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        remove_if_present(&self.path)
    }
}

impl Drop for ScopedArtifact {
    fn drop(&mut self) {
        self.remove_file();
    }
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_present(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "file already removed");
            false
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to remove file");
            false
        }
    }
}

/// A probe group materialized as an address-list file.
#[derive(Debug)]
pub struct GroupInput {
    pub key: GroupKey,
    pub addresses: usize,
    pub file: ScopedArtifact,
}

/// Write one input file per group. Files are removed when the returned
/// inputs are dropped.
pub fn materialize_groups(groups: &Groups, dir: &Path) -> Result<Vec<GroupInput>> {
    let mut inputs = Vec::with_capacity(groups.len());

    for group in groups.iter() {
        let prefix = format!("{}_input", group.key.target());
        let file = ScopedArtifact::create_with_lines(
            dir,
            &prefix,
            "txt",
            group.addresses.iter().map(IpAddr::to_string),
        )
        .with_context(|| format!("materializing group {}", group.key))?;

        debug!(
            group = %group.key,
            addresses = group.addresses.len(),
            path = %file.path().display(),
            "materialized group input",
        );

        inputs.push(GroupInput {
            key: group.key,
            addresses: group.addresses.len(),
            file,
        });
    }

    Ok(inputs)
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashSet};

    use super::*;
    use crate::grouping::ProbeGroup;

    #[test]
    fn test_reserve_is_unique_and_lazy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = ScopedArtifact::reserve(dir.path(), "endpoint_0", "json");
        let b = ScopedArtifact::reserve(dir.path(), "endpoint_0", "json");

        assert_ne!(a.path(), b.path());
        assert!(!a.exists());
        assert!(a
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("endpoint_0_") && n.ends_with(".json")));
    }

    #[test]
    fn test_release_removes_and_tolerates_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let artifact =
            ScopedArtifact::create_with_lines(dir.path(), "x", "txt", ["a", "b"]).expect("create");
        let path = artifact.path().to_path_buf();
        assert!(path.exists());
        assert!(artifact.release());
        assert!(!path.exists());

        let missing = ScopedArtifact::reserve(dir.path(), "y", "json");
        assert!(!missing.release());
    }

    #[test]
    fn test_drop_removes_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = {
            let artifact =
                ScopedArtifact::create_with_lines(dir.path(), "x", "txt", ["a"]).expect("create");
            artifact.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_materialize_groups_writes_one_address_per_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let addresses: BTreeSet<IpAddr> = ["198.51.100.1", "198.51.100.2"]
            .iter()
            .map(|a| a.parse().expect("ip"))
            .collect();
        let groups = Groups {
            endpoint: vec![ProbeGroup {
                key: GroupKey::Endpoint { depth: 5 },
                addresses: addresses.clone(),
            }],
            secondary: vec![ProbeGroup {
                key: GroupKey::Secondary {
                    depth: 4,
                    endpoint_depth: 5,
                },
                addresses,
            }],
        };

        let inputs = materialize_groups(&groups, dir.path()).expect("materialize");
        assert_eq!(inputs.len(), 2);

        let paths: HashSet<PathBuf> = inputs.iter().map(|i| i.file.path().to_path_buf()).collect();
        assert_eq!(paths.len(), 2);

        let content = std::fs::read_to_string(inputs[0].file.path()).expect("read");
        assert_eq!(content, "198.51.100.1\n198.51.100.2\n");

        drop(inputs);
        for path in paths {
            assert!(!path.exists());
        }
    }
}
