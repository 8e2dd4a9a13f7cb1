//! Core data model: inventory records, volume keys and the stale set.
//!
//! Records are created fresh by parsing command output at the start of a
//! pass, never mutated, and dropped when the pass ends.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

// ---------------------------------------------------------------------------
// Volume key
// ---------------------------------------------------------------------------

/// Identifier shared by all three inventories, e.g. `pvc-<uuid>`.
///
/// Only produced by [`crate::convention::VolumeKeyConvention`], so two keys
/// compare equal exactly when they name the same backing volume.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct VolumeKey(pub String);

impl VolumeKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VolumeKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Inventory records
// ---------------------------------------------------------------------------

/// One iSCSI target node record registered on the host.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IscsiRecord {
    /// Full target IQN as reported by `iscsiadm`. First field so the derived
    /// ordering sorts by IQN, then portal.
    pub target_iqn: String,
    /// `host:port` (or `[v6addr]:port`) without the portal group tag.
    pub portal: String,
    /// Target portal group tag, when reported.
    pub tpgt: Option<u16>,
    /// Key derived from the IQN.
    pub volume_key: VolumeKey,
}

/// One backing volume that exists on the storage backend.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, Hash)]
pub struct VolumeRecord {
    pub volume_key: VolumeKey,
    /// Fully qualified dataset path, kept for audit logging.
    pub full_path: String,
}

/// Key of a cluster volume claim (or persistent volume) still considered live.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, Hash)]
pub struct ClaimKey {
    pub volume_key: VolumeKey,
    /// `PersistentVolumeClaim namespace/name` or `PersistentVolume name`.
    pub origin: String,
}

/// Which inventory a result or failure belongs to.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InventorySource {
    Iscsi,
    Volumes,
    Claims,
}

impl fmt::Display for InventorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Iscsi => "iscsi node",
            Self::Volumes => "zfs volumes",
            Self::Claims => "cluster claims",
        })
    }
}

// ---------------------------------------------------------------------------
// Stale set
// ---------------------------------------------------------------------------

/// Records whose volume key is backed by neither a volume nor a live claim.
///
/// Iteration order is deterministic (IQN, then portal) so logs and dry-run
/// output diff cleanly between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaleSet {
    records: BTreeSet<IscsiRecord>,
}

impl StaleSet {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IscsiRecord> {
        self.records.iter()
    }
}

impl FromIterator<IscsiRecord> for StaleSet {
    fn from_iter<T: IntoIterator<Item = IscsiRecord>>(iter: T) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a StaleSet {
    type Item = &'a IscsiRecord;
    type IntoIter = std::collections::btree_set::Iter<'a, IscsiRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
