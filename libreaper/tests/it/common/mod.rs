use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use libreaper::inventory::{IscsiInventory, ZfsInventory};
use libreaper::{
    ClaimKey, CommandRunner, CommandSpec, ExecContext, ExecutionError, Inventory, InventoryError,
    InventorySource, RawConfig, ReaperConfig, Reconciler, StopSignal, VolumeKey,
};
use libreaper::runner::CommandOutput;

pub const PREFIX: &str = "iqn.2024-03.lan.asgard:knas";
pub const DATASET: &str = "data/csi/iscsi";

pub fn init_logger() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn config(dry_run: bool) -> ReaperConfig {
    ReaperConfig::try_from(RawConfig {
        zfs_parent_dataset: Some(DATASET.into()),
        iqn_prefix: Some(PREFIX.into()),
        volume_key_pattern: Some("pvc-[0-9]+".into()),
        dry_run,
        use_nsenter: false,
        ..Default::default()
    })
    .expect("valid test config")
}

/// `iscsiadm -m node` output for the given keys, all on one portal.
pub fn node_listing(keys: &[&str]) -> String {
    keys.iter()
        .map(|k| format!("10.0.0.5:3260,1 {PREFIX}:{k}\n"))
        .collect()
}

/// `zfs list` output for the given keys.
pub fn zfs_listing(keys: &[&str]) -> String {
    keys.iter().map(|k| format!("{DATASET}/{k}\n")).collect()
}

enum Match {
    Exact(String),
    Contains(String),
}

impl Match {
    fn hits(&self, rendered: &str) -> bool {
        match self {
            Self::Exact(cmd) => rendered == cmd,
            Self::Contains(needle) => rendered.contains(needle.as_str()),
        }
    }
}

enum Reply {
    Exit { code: i32, stdout: String },
    Fail(ExecutionError),
}

/// Fake runner: answers by the first matching rule, records every command it
/// sees, and applies the same tolerance rules as the real runner. Unmatched
/// commands succeed with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<(Match, Reply)>>,
    calls: Mutex<Vec<String>>,
    stop_after_first_delete: Mutex<Option<StopSignal>>,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer `iscsiadm -m node` (the listing, not per-record commands).
    pub fn node_list(self: &Arc<Self>, code: i32, stdout: impl Into<String>) {
        self.push(
            Match::Exact("iscsiadm -m node".into()),
            Reply::Exit {
                code,
                stdout: stdout.into(),
            },
        );
    }

    /// Answer any command containing `needle` with an exit status.
    pub fn exit(self: &Arc<Self>, needle: &str, code: i32, stdout: impl Into<String>) {
        self.push(
            Match::Contains(needle.to_owned()),
            Reply::Exit {
                code,
                stdout: stdout.into(),
            },
        );
    }

    /// Fail any command containing `needle` before it "runs".
    pub fn fail(self: &Arc<Self>, needle: &str, error: ExecutionError) {
        self.push(Match::Contains(needle.to_owned()), Reply::Fail(error));
    }

    fn push(&self, matcher: Match, reply: Reply) {
        self.rules.lock().unwrap().push((matcher, reply));
    }

    /// Raise `stop` as soon as the first delete command runs.
    pub fn stop_after_first_delete(self: &Arc<Self>, stop: StopSignal) {
        *self.stop_after_first_delete.lock().unwrap() = Some(stop);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.ends_with("-o delete"))
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        _ctx: &ExecContext,
        spec: &CommandSpec,
    ) -> Result<CommandOutput, ExecutionError> {
        let rendered = spec.render();
        self.calls.lock().unwrap().push(rendered.clone());

        if rendered.ends_with("-o delete")
            && let Some(stop) = self.stop_after_first_delete.lock().unwrap().take()
        {
            stop.stop();
        }

        let rules = self.rules.lock().unwrap();
        let Some((_, reply)) = rules.iter().find(|(m, _)| m.hits(&rendered)) else {
            return Ok(CommandOutput::default());
        };
        match reply {
            Reply::Fail(e) => Err(e.clone()),
            Reply::Exit { code, stdout } => {
                if *code == 0 || spec.tolerated.contains(code) {
                    Ok(CommandOutput {
                        stdout: stdout.clone(),
                        stderr: String::new(),
                        code: *code,
                    })
                } else {
                    Err(ExecutionError::NonZeroExit {
                        command: rendered,
                        code: *code,
                        stderr: "scripted failure".into(),
                    })
                }
            }
        }
    }
}

/// Claims fixed at construction, or a failure.
pub struct StaticClaims(pub Result<Vec<String>, String>);

#[async_trait]
impl Inventory for StaticClaims {
    type Record = ClaimKey;

    fn source(&self) -> InventorySource {
        InventorySource::Claims
    }

    async fn list(&self) -> Result<Vec<ClaimKey>, InventoryError> {
        match &self.0 {
            Ok(keys) => Ok(keys
                .iter()
                .map(|k| ClaimKey {
                    volume_key: VolumeKey(k.clone()),
                    origin: format!("PersistentVolume {k}"),
                })
                .collect()),
            Err(reason) => Err(InventoryError::new(self.source(), reason)),
        }
    }
}

pub fn claims(keys: &[&str]) -> StaticClaims {
    StaticClaims(Ok(keys.iter().map(|k| (*k).to_owned()).collect()))
}

pub type TestReconciler = Reconciler<IscsiInventory, ZfsInventory, StaticClaims>;

/// Reconciler wired to `runner` with the real iSCSI and ZFS collectors.
pub fn reconciler(
    runner: &Arc<ScriptedRunner>,
    claims: StaticClaims,
    dry_run: bool,
) -> TestReconciler {
    let cfg = config(dry_run);
    let dyn_runner: Arc<dyn CommandRunner> = runner.clone();
    Reconciler::new(
        IscsiInventory::new(dyn_runner.clone(), cfg.exec_context, cfg.convention.clone()),
        ZfsInventory::new(dyn_runner.clone(), cfg.exec_context, cfg.convention.clone()),
        claims,
        dyn_runner,
        &cfg,
    )
}
