//! Reaper configuration.
//!
//! Built once at startup from the environment-style options and passed by
//! reference to every component; nothing reads the environment after that.
//!
//! Options:
//! - `ZFS_PARENT_DATASET`: dataset whose child volumes form the volume inventory. Required.
//! - `IQN_PREFIX`: managed iSCSI namespace. Records outside it are never touched. Required.
//! - `VOLUME_KEY_PATTERN`: regular expression describing a volume key.
//! - `DRY_RUN`: log planned deletions without executing them. Defaults to `true`.
//! - `USE_NSENTER`: run host commands inside the namespaces of `NSENTER_TARGET_PID`.
//!   Defaults to `true`.
//! - `COMMAND_TIMEOUT_SECS`: bound on every external command. Defaults to `30`.
//! - `NODE_NAME`: label used in logs, usually set through the Downward API.

use std::time::Duration;

use crate::convention::{DEFAULT_KEY_PATTERN, VolumeKeyConvention};
use crate::error::ConfigError;
use crate::runner::ExecContext;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_NSENTER_TARGET_PID: u32 = 1;

/// Validated, immutable settings for one reconciliation pass.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub convention: VolumeKeyConvention,
    pub dry_run: bool,
    pub exec_context: ExecContext,
    pub command_timeout: Duration,
    pub node_name: Option<String>,
}

/// Raw option values, before validation.
#[derive(Debug, Clone)]
pub struct RawConfig {
    pub zfs_parent_dataset: Option<String>,
    pub iqn_prefix: Option<String>,
    pub volume_key_pattern: Option<String>,
    pub dry_run: bool,
    pub use_nsenter: bool,
    pub nsenter_target_pid: u32,
    pub command_timeout_secs: u64,
    pub node_name: Option<String>,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            zfs_parent_dataset: None,
            iqn_prefix: None,
            volume_key_pattern: None,
            dry_run: true,
            use_nsenter: true,
            nsenter_target_pid: DEFAULT_NSENTER_TARGET_PID,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT.as_secs(),
            node_name: None,
        }
    }
}

impl TryFrom<RawConfig> for ReaperConfig {
    type Error = ConfigError;

    fn try_from(raw: RawConfig) -> Result<Self, Self::Error> {
        let dataset = required("ZFS_PARENT_DATASET", raw.zfs_parent_dataset)?;
        if dataset.starts_with('/') || dataset.ends_with('/') {
            return Err(ConfigError::invalid(
                "ZFS_PARENT_DATASET",
                "must not start or end with '/'",
            ));
        }
        let prefix = required("IQN_PREFIX", raw.iqn_prefix)?;
        if prefix.chars().any(char::is_whitespace) {
            return Err(ConfigError::invalid("IQN_PREFIX", "must not contain whitespace"));
        }

        let pattern = raw
            .volume_key_pattern
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_KEY_PATTERN.to_owned());
        let convention = VolumeKeyConvention::new(prefix, dataset, &pattern)?;

        if raw.command_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "COMMAND_TIMEOUT_SECS",
                "must be greater than zero",
            ));
        }
        if raw.use_nsenter && raw.nsenter_target_pid == 0 {
            return Err(ConfigError::invalid("NSENTER_TARGET_PID", "pid 0 is not a process"));
        }

        let exec_context = if raw.use_nsenter {
            ExecContext::HostNamespace {
                target_pid: raw.nsenter_target_pid,
            }
        } else {
            ExecContext::Local
        };

        Ok(Self {
            convention,
            dry_run: raw.dry_run,
            exec_context,
            command_timeout: Duration::from_secs(raw.command_timeout_secs),
            node_name: raw.node_name.filter(|n| !n.trim().is_empty()),
        })
    }
}

fn required(key: &'static str, value: Option<String>) -> Result<String, ConfigError> {
    match value.map(|v| v.trim().to_owned()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(key)),
    }
}

/// Parse an environment-style boolean.
pub fn parse_bool(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(format!("expected true/false, got {other:?}")),
    }
}
