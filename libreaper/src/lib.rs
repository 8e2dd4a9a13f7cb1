//! # libreaper — stale iSCSI node record reconciliation
//!
//! When a CSI driver deletes a volume but fails to clean up on the node, the
//! host keeps an iSCSI node record for a target that no longer exists and
//! `iscsid` retries it forever. `libreaper` finds those records by comparing
//! three inventories and removes the ones nothing backs any more.
//!
//! One call to [`Reconciler::run`] is one bounded pass: gather, diff, delete.
//! No state survives between passes.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Records, [`VolumeKey`], [`StaleSet`]. |
//! | [`error`] | Execution, inventory, deletion and configuration errors. |
//! | [`config`] | Immutable [`ReaperConfig`] built once at startup. |
//! | [`convention`] | [`VolumeKeyConvention`]: IQN / dataset / volume name → key. |
//! | [`runner`] | [`CommandRunner`] trait and the host process implementation. |
//! | [`inventory`] | iSCSI, ZFS and Kubernetes claim collectors. |
//! | [`reconciler`] | Stale-set computation and the deletion loop. |

pub mod config;
pub mod convention;
pub mod error;
pub mod inventory;
pub mod reconciler;
pub mod runner;
pub mod types;

pub use config::{RawConfig, ReaperConfig};
pub use convention::VolumeKeyConvention;
pub use error::{ConfigError, DeletionError, ExecutionError, InventoryError, ReaperError};
pub use inventory::Inventory;
pub use reconciler::{PassReport, Reconciler, RecordOutcome, StopSignal, compute_stale_set};
pub use runner::{CommandRunner, CommandSpec, ExecContext, HostCommandRunner};
pub use types::*;
