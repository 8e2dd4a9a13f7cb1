//! Backing ZFS volumes under the configured parent dataset.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::Inventory;
use crate::convention::VolumeKeyConvention;
use crate::error::InventoryError;
use crate::runner::{CommandRunner, CommandSpec, ExecContext};
use crate::types::{InventorySource, VolumeRecord};

/// `zfs list -t volume -H -o name -r <root>`: one dataset name per line,
/// no header. A missing parent dataset exits non-zero and fails the listing.
pub fn list_volumes_command(dataset_root: &str) -> CommandSpec {
    CommandSpec::new("zfs")
        .args(["list", "-t", "volume", "-H", "-o", "name", "-r"])
        .arg(dataset_root)
}

/// Parse `zfs list -H -o name` output into volume records.
pub fn parse_volume_list(raw: &str, convention: &VolumeKeyConvention) -> Vec<VolumeRecord> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|path| match convention.key_from_dataset(path) {
            Ok(volume_key) => Some(VolumeRecord {
                volume_key,
                full_path: path.to_owned(),
            }),
            Err(reason) => {
                debug!(path, %reason, "ignoring dataset");
                None
            }
        })
        .collect()
}

/// ZFS volumes that actually exist.
pub struct ZfsInventory {
    runner: Arc<dyn CommandRunner>,
    ctx: ExecContext,
    convention: VolumeKeyConvention,
}

impl ZfsInventory {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        ctx: ExecContext,
        convention: VolumeKeyConvention,
    ) -> Self {
        Self {
            runner,
            ctx,
            convention,
        }
    }
}

#[async_trait]
impl Inventory for ZfsInventory {
    type Record = VolumeRecord;

    fn source(&self) -> InventorySource {
        InventorySource::Volumes
    }

    #[instrument(skip(self))]
    async fn list(&self) -> Result<Vec<VolumeRecord>, InventoryError> {
        let output = self
            .runner
            .run(&self.ctx, &list_volumes_command(self.convention.dataset_root()))
            .await
            .map_err(|e| InventoryError::new(self.source(), e))?;

        let volumes = parse_volume_list(&output.stdout, &self.convention);
        debug!(
            dataset = self.convention.dataset_root(),
            count = volumes.len(),
            "backing volumes"
        );
        Ok(volumes)
    }
}
