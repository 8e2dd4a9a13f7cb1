//! Volume key derivation shared by every inventory.
//!
//! The reconciler only compares keys, so the three derivations here must
//! agree on what a key looks like: an iSCSI record, a ZFS dataset and a
//! persistent volume that refer to the same backing volume all yield the
//! same [`VolumeKey`]. Anything that cannot be mapped unambiguously is
//! rejected, and rejected iSCSI records are never eligible for deletion.

use regex::Regex;
use thiserror::Error;

use crate::error::ConfigError;
use crate::types::VolumeKey;

/// Default key shape: a Kubernetes-provisioned volume name.
pub const DEFAULT_KEY_PATTERN: &str =
    r"pvc-[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}";

/// Characters that end a prefix on a component boundary.
const BOUNDARY_CHARS: [char; 3] = [':', '.', '-'];

/// Why a raw identifier did not map to a key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyRejection {
    #[error("outside managed IQN prefix")]
    OutsidePrefix,

    #[error("outside parent dataset")]
    OutsideDataset,

    #[error("no volume key found")]
    NoKey,

    #[error("ambiguous volume key: {0:?}")]
    Ambiguous(Vec<String>),
}

/// The naming convention tying IQNs, datasets and volume names together.
#[derive(Debug, Clone)]
pub struct VolumeKeyConvention {
    iqn_prefix: String,
    dataset_root: String,
    /// Unanchored, used to search inside IQNs.
    search: Regex,
    /// Anchored, used for whole-name matches.
    exact: Regex,
}

impl VolumeKeyConvention {
    pub fn new(
        iqn_prefix: impl Into<String>,
        dataset_root: impl Into<String>,
        key_pattern: &str,
    ) -> Result<Self, ConfigError> {
        let search = Regex::new(key_pattern)
            .map_err(|e| ConfigError::invalid("VOLUME_KEY_PATTERN", e))?;
        let exact = Regex::new(&format!("^(?:{key_pattern})$"))
            .map_err(|e| ConfigError::invalid("VOLUME_KEY_PATTERN", e))?;
        Ok(Self {
            iqn_prefix: iqn_prefix.into(),
            dataset_root: dataset_root.into(),
            search,
            exact,
        })
    }

    pub fn iqn_prefix(&self) -> &str {
        &self.iqn_prefix
    }

    pub fn dataset_root(&self) -> &str {
        &self.dataset_root
    }

    fn strip_prefix<'a>(&self, iqn: &'a str) -> Option<&'a str> {
        let rest = iqn.strip_prefix(self.iqn_prefix.as_str())?;
        if self.iqn_prefix.ends_with(BOUNDARY_CHARS) || rest.starts_with(BOUNDARY_CHARS) {
            Some(rest)
        } else {
            None
        }
    }

    /// Derive the key from a target IQN.
    pub fn key_from_iqn(&self, iqn: &str) -> Result<VolumeKey, KeyRejection> {
        let rest = self.strip_prefix(iqn).ok_or(KeyRejection::OutsidePrefix)?;

        let mut found: Vec<&str> = Vec::new();
        for m in self.search.find_iter(rest) {
            // Neither `pvc-<uuid>-snap` nor `clone-pvc-<uuid>` may alias
            // `pvc-<uuid>`.
            if attached_before(&rest[..m.start()]) || attached_after(&rest[m.end()..]) {
                continue;
            }
            if !found.contains(&m.as_str()) {
                found.push(m.as_str());
            }
        }

        match found.as_slice() {
            [] => Err(KeyRejection::NoKey),
            [key] => Ok(VolumeKey((*key).to_owned())),
            many => Err(KeyRejection::Ambiguous(
                many.iter().map(|s| (*s).to_owned()).collect(),
            )),
        }
    }

    /// Derive the key from a dataset path such as `data/csi/iscsi/pvc-…`.
    pub fn key_from_dataset(&self, path: &str) -> Result<VolumeKey, KeyRejection> {
        let rest = path
            .strip_prefix(self.dataset_root.as_str())
            .and_then(|r| r.strip_prefix('/'))
            .filter(|r| !r.is_empty())
            .ok_or(KeyRejection::OutsideDataset)?;
        let leaf = rest.rsplit('/').next().unwrap_or(rest);
        self.key_from_volume_name(leaf)
    }

    /// Derive the key from a bare volume name (persistent volume name,
    /// dataset leaf).
    pub fn key_from_volume_name(&self, name: &str) -> Result<VolumeKey, KeyRejection> {
        if self.exact.is_match(name) {
            Ok(VolumeKey(name.to_owned()))
        } else {
            Err(KeyRejection::NoKey)
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// `lead` is the IQN text between the prefix and a key match. A single
/// separator right after the prefix (`knas-pvc-…`) is not part of a word.
fn attached_before(lead: &str) -> bool {
    match lead.chars().next_back() {
        None => false,
        Some('-') => lead.len() > 1,
        Some(c) => is_word_char(c),
    }
}

fn attached_after(tail: &str) -> bool {
    tail.chars().next().is_some_and(is_word_char)
}
