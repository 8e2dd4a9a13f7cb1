//! Volume claims the cluster still considers live.
//!
//! A claim protects its bound volume while it is `Bound` or `Pending`. A
//! persistent volume protects itself while it is `Pending`, `Available` or
//! `Bound`; once `Released` or `Failed` only the backing volume can keep the
//! iSCSI record alive. Objects with no reported phase count as live.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use tracing::{debug, instrument};

use super::Inventory;
use crate::convention::VolumeKeyConvention;
use crate::error::InventoryError;
use crate::types::{ClaimKey, InventorySource};

const LIVE_CLAIM_PHASES: [&str; 2] = ["Bound", "Pending"];
const LIVE_VOLUME_PHASES: [&str; 3] = ["Pending", "Available", "Bound"];

fn is_live(phase: Option<&str>, live: &[&str]) -> bool {
    phase.is_none_or(|p| live.contains(&p))
}

/// Reduce cluster objects to the volume keys they keep alive.
pub fn live_claim_keys(
    claims: &[PersistentVolumeClaim],
    volumes: &[PersistentVolume],
    convention: &VolumeKeyConvention,
) -> Vec<ClaimKey> {
    let mut keys = Vec::new();

    for pvc in claims {
        let phase = pvc.status.as_ref().and_then(|s| s.phase.as_deref());
        if !is_live(phase, &LIVE_CLAIM_PHASES) {
            continue;
        }
        let Some(volume_name) = pvc.spec.as_ref().and_then(|s| s.volume_name.as_deref()) else {
            continue;
        };
        let origin = format!(
            "PersistentVolumeClaim {}/{}",
            pvc.namespace().unwrap_or_default(),
            pvc.name_any()
        );
        match convention.key_from_volume_name(volume_name) {
            Ok(volume_key) => keys.push(ClaimKey { volume_key, origin }),
            Err(reason) => debug!(%origin, volume_name, %reason, "claim maps to no volume key"),
        }
    }

    for pv in volumes {
        let phase = pv.status.as_ref().and_then(|s| s.phase.as_deref());
        if !is_live(phase, &LIVE_VOLUME_PHASES) {
            continue;
        }
        let name = pv.name_any();
        if let Ok(volume_key) = convention.key_from_volume_name(&name) {
            keys.push(ClaimKey {
                volume_key,
                origin: format!("PersistentVolume {name}"),
            });
        }
    }

    keys
}

/// Claims read from the Kubernetes API.
pub struct KubeClaimInventory {
    client: Client,
    convention: VolumeKeyConvention,
}

impl KubeClaimInventory {
    pub fn new(client: Client, convention: VolumeKeyConvention) -> Self {
        Self { client, convention }
    }

    /// Connect with in-cluster credentials, falling back to the local
    /// kubeconfig.
    pub async fn connect(convention: VolumeKeyConvention) -> Result<Self, InventoryError> {
        let client = Client::try_default()
            .await
            .map_err(|e| InventoryError::new(InventorySource::Claims, e))?;
        Ok(Self::new(client, convention))
    }
}

#[async_trait]
impl Inventory for KubeClaimInventory {
    type Record = ClaimKey;

    fn source(&self) -> InventorySource {
        InventorySource::Claims
    }

    #[instrument(skip(self))]
    async fn list(&self) -> Result<Vec<ClaimKey>, InventoryError> {
        let pvc_api: Api<PersistentVolumeClaim> = Api::all(self.client.clone());
        let pv_api: Api<PersistentVolume> = Api::all(self.client.clone());
        let lp = ListParams::default();

        let (claims, volumes) = tokio::try_join!(pvc_api.list(&lp), pv_api.list(&lp))
            .map_err(|e| InventoryError::new(self.source(), e))?;

        let keys = live_claim_keys(&claims.items, &volumes.items, &self.convention);
        debug!(
            claims = claims.items.len(),
            volumes = volumes.items.len(),
            live = keys.len(),
            "cluster claims"
        );
        Ok(keys)
    }
}
