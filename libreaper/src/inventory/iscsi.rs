//! iSCSI node records registered on the host (`iscsiadm -m node`).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::Inventory;
use crate::convention::VolumeKeyConvention;
use crate::error::InventoryError;
use crate::runner::{CommandRunner, CommandSpec, ExecContext};
use crate::types::{InventorySource, IscsiRecord};

pub const ISCSIADM: &str = "iscsiadm";

/// `ISCSI_ERR_NO_OBJS_FOUND`: no matching record or session.
pub const ISCSI_ERR_NO_OBJS_FOUND: i32 = 21;

/// `iscsiadm -m node`. An empty node database exits 21, which is a valid
/// empty inventory rather than a failure.
pub fn list_nodes_command() -> CommandSpec {
    CommandSpec::new(ISCSIADM)
        .args(["-m", "node"])
        .tolerate(ISCSI_ERR_NO_OBJS_FOUND)
}

/// Remove the node record for one target/portal pair.
pub fn delete_node_command(record: &IscsiRecord) -> CommandSpec {
    CommandSpec::new(ISCSIADM)
        .args(["-m", "node", "-T"])
        .arg(record.target_iqn.as_str())
        .arg("-p")
        .arg(record.portal.as_str())
        .args(["-o", "delete"])
        .tolerate(ISCSI_ERR_NO_OBJS_FOUND)
}

/// Log out any session for one target/portal pair before deleting it.
pub fn logout_command(record: &IscsiRecord) -> CommandSpec {
    CommandSpec::new(ISCSIADM)
        .args(["-m", "node", "-T"])
        .arg(record.target_iqn.as_str())
        .arg("-p")
        .arg(record.portal.as_str())
        .arg("-u")
        .tolerate(ISCSI_ERR_NO_OBJS_FOUND)
}

/// Parse `iscsiadm -m node` output.
///
/// Each line reads `<portal>,<tpgt> <iqn>`, e.g.
/// `10.0.0.5:3260,1 iqn.2024-03.lan.asgard:knas:pvc-…`. Lines whose IQN is
/// outside the managed prefix, or that carry no unambiguous key, are dropped.
pub fn parse_node_list(raw: &str, convention: &VolumeKeyConvention) -> Vec<IscsiRecord> {
    let mut records = Vec::new();
    for line in raw.lines() {
        let mut fields = line.split_whitespace();
        let (Some(portal_field), Some(iqn)) = (fields.next(), fields.next()) else {
            if !line.trim().is_empty() {
                debug!(line, "skipping unparsable iscsiadm line");
            }
            continue;
        };

        let volume_key = match convention.key_from_iqn(iqn) {
            Ok(key) => key,
            Err(reason) => {
                debug!(iqn, %reason, "ignoring node record");
                continue;
            }
        };

        let (portal, tpgt) = match portal_field.rsplit_once(',') {
            Some((portal, tag)) => (portal, tag.parse().ok()),
            None => (portal_field, None),
        };

        records.push(IscsiRecord {
            target_iqn: iqn.to_owned(),
            portal: portal.to_owned(),
            tpgt,
            volume_key,
        });
    }
    records
}

/// Host iSCSI node database.
pub struct IscsiInventory {
    runner: Arc<dyn CommandRunner>,
    ctx: ExecContext,
    convention: VolumeKeyConvention,
}

impl IscsiInventory {
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
impl Inventory for IscsiInventory {
    type Record = IscsiRecord;

    fn source(&self) -> InventorySource {
        InventorySource::Iscsi
    }

    #[instrument(skip(self))]
    async fn list(&self) -> Result<Vec<IscsiRecord>, InventoryError> {
        let output = self
            .runner
            .run(&self.ctx, &list_nodes_command())
            .await
            .map_err(|e| InventoryError::new(self.source(), e))?;

        if output.code == ISCSI_ERR_NO_OBJS_FOUND {
            info!("no iSCSI node records registered");
            return Ok(Vec::new());
        }

        let records = parse_node_list(&output.stdout, &self.convention);
        debug!(
            prefix = self.convention.iqn_prefix(),
            count = records.len(),
            "managed node records"
        );
        Ok(records)
    }
}
