//! The three inventories a pass compares.
//!
//! Each collector pairs a pure parser (tested against captured output) with
//! a thin [`Inventory`] implementation that fetches the raw data. Collectors
//! share no state and may be gathered concurrently.

use async_trait::async_trait;

use crate::error::InventoryError;
use crate::types::InventorySource;

pub mod claims;
pub mod iscsi;
pub mod zfs;

pub use claims::KubeClaimInventory;
pub use iscsi::IscsiInventory;
pub use zfs::ZfsInventory;

/// A source of records for one side of the diff.
///
/// A failed listing must surface as an error, never as an empty list.
#[async_trait]
pub trait Inventory: Send + Sync {
    type Record: Send;

    fn source(&self) -> InventorySource;

    async fn list(&self) -> Result<Vec<Self::Record>, InventoryError>;
}
