use clap::{Parser, ValueEnum};
use libreaper::config::{DEFAULT_NSENTER_TARGET_PID, parse_bool};
use libreaper::reconciler::{EXIT_CONFIG_INVALID, EXIT_SUCCESS};
use libreaper::{ConfigError, RawConfig, ReaperConfig};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Remove iSCSI node records whose backing volume no longer exists.
///
/// Every option can also be set through the environment variable shown.
#[derive(Parser, Debug)]
#[command(name = "iscsi-reaper", author, version, about, long_about = None)]
pub struct Cli {
    /// Parent dataset of the CSI-provisioned zvols
    #[arg(long, env = "ZFS_PARENT_DATASET")]
    pub zfs_parent_dataset: Option<String>,

    /// IQN prefix of the targets this reaper manages
    #[arg(long, env = "IQN_PREFIX")]
    pub iqn_prefix: Option<String>,

    /// Regular expression describing a volume key
    #[arg(long, env = "VOLUME_KEY_PATTERN")]
    pub volume_key_pattern: Option<String>,

    /// Only log what would be deleted
    #[arg(long, env = "DRY_RUN", default_value = "true", value_parser = parse_bool, action = clap::ArgAction::Set)]
    pub dry_run: bool,

    /// Run host commands through nsenter
    #[arg(long, env = "USE_NSENTER", default_value = "true", value_parser = parse_bool, action = clap::ArgAction::Set)]
    pub use_nsenter: bool,

    /// Process whose namespaces nsenter joins
    #[arg(long, env = "NSENTER_TARGET_PID", default_value_t = DEFAULT_NSENTER_TARGET_PID)]
    pub nsenter_target_pid: u32,

    /// Timeout for each external command, in seconds
    #[arg(long, env = "COMMAND_TIMEOUT_SECS", default_value_t = 30)]
    pub command_timeout_secs: u64,

    /// Node name for log context (Downward API)
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Print the pass report as JSON on stdout
    #[arg(long)]
    pub report_json: bool,
}

impl Cli {
    pub fn raw_config(&self) -> RawConfig {
        RawConfig {
            zfs_parent_dataset: self.zfs_parent_dataset.clone(),
            iqn_prefix: self.iqn_prefix.clone(),
            volume_key_pattern: self.volume_key_pattern.clone(),
            dry_run: self.dry_run,
            use_nsenter: self.use_nsenter,
            nsenter_target_pid: self.nsenter_target_pid,
            command_timeout_secs: self.command_timeout_secs,
            node_name: self.node_name.clone(),
        }
    }

    pub fn reaper_config(&self) -> Result<ReaperConfig, ConfigError> {
        ReaperConfig::try_from(self.raw_config())
    }
}

/// Exit status for a command line clap refused. `--help` and `--version`
/// also arrive as errors but are successful invocations.
pub fn rejected_args_exit_code(err: &clap::Error) -> u8 {
    if err.exit_code() == 0 {
        EXIT_SUCCESS
    } else {
        EXIT_CONFIG_INVALID
    }
}
