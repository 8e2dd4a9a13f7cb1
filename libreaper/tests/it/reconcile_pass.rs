//! Full reconciliation passes driven through the public API with a scripted
//! command runner standing in for `iscsiadm` and `zfs`.

use libreaper::reconciler::{EXIT_PARTIAL, EXIT_SUCCESS};
use libreaper::{ExecutionError, InventorySource, RecordOutcome, StopSignal};

use crate::common::{
    PREFIX, ScriptedRunner, StaticClaims, claims, init_logger, node_listing, reconciler,
    zfs_listing,
};

fn delete_cmd(key: &str) -> String {
    format!("iscsiadm -m node -T {PREFIX}:{key} -p 10.0.0.5:3260 -o delete")
}

fn logout_cmd(key: &str) -> String {
    format!("iscsiadm -m node -T {PREFIX}:{key} -p 10.0.0.5:3260 -u")
}

/// Only the record without a volume or claim is deleted.
#[tokio::test]
async fn deletes_only_unbacked_record() {
    init_logger();
    let runner = ScriptedRunner::new();
    runner.node_list(0, node_listing(&["pvc-1", "pvc-2"]));
    runner.exit("zfs list", 0, zfs_listing(&["pvc-1"]));

    let report = reconciler(&runner, claims(&[]), false).run().await.unwrap();

    assert_eq!(report.stale_found, 1);
    assert_eq!(report.deleted, 1);
    assert_eq!(runner.deletes(), vec![delete_cmd("pvc-2")]);
    assert!(runner.calls().contains(&logout_cmd("pvc-2")));
    assert_eq!(report.exit_code(), EXIT_SUCCESS);
}

/// A live claim protects the record even though the volume is gone.
#[tokio::test]
async fn live_claim_protects_record() {
    init_logger();
    let runner = ScriptedRunner::new();
    runner.node_list(0, node_listing(&["pvc-3"]));
    runner.exit("zfs list", 0, "");

    let report = reconciler(&runner, claims(&["pvc-3"]), false)
        .run()
        .await
        .unwrap();

    assert_eq!(report.stale_found, 0);
    assert!(runner.deletes().is_empty());
    assert!(report.succeeded());
}

/// A failed volume listing aborts the pass before anything is deleted.
#[tokio::test]
async fn volume_inventory_failure_aborts() {
    init_logger();
    let runner = ScriptedRunner::new();
    runner.node_list(0, node_listing(&["pvc-1", "pvc-2"]));
    runner.exit("zfs list", 1, "");

    let err = reconciler(&runner, claims(&[]), false)
        .run()
        .await
        .unwrap_err();

    assert_eq!(err.inventory, InventorySource::Volumes);
    assert!(runner.deletes().is_empty());
    assert!(!runner.calls().iter().any(|c| c.ends_with(" -u")));
}

#[tokio::test]
async fn missing_zfs_binary_aborts() {
    init_logger();
    let runner = ScriptedRunner::new();
    runner.node_list(0, node_listing(&["pvc-1"]));
    runner.fail(
        "zfs list",
        ExecutionError::MissingBinary {
            program: "zfs".into(),
        },
    );

    let err = reconciler(&runner, claims(&[]), false)
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.inventory, InventorySource::Volumes);
    assert!(runner.deletes().is_empty());
}

#[tokio::test]
async fn claims_failure_aborts() {
    init_logger();
    let runner = ScriptedRunner::new();
    runner.node_list(0, node_listing(&["pvc-1"]));
    runner.exit("zfs list", 0, "");

    let err = reconciler(&runner, StaticClaims(Err("forbidden".into())), false)
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.inventory, InventorySource::Claims);
    assert!(runner.deletes().is_empty());
}

#[tokio::test]
async fn iscsi_listing_failure_aborts() {
    init_logger();
    let runner = ScriptedRunner::new();
    runner.node_list(6, "");
    runner.exit("zfs list", 0, "");

    let err = reconciler(&runner, claims(&[]), false)
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.inventory, InventorySource::Iscsi);
}

/// An empty node database (exit 21) is an empty inventory, not a failure.
#[tokio::test]
async fn empty_node_database_is_clean_pass() {
    init_logger();
    let runner = ScriptedRunner::new();
    runner.node_list(21, "");
    runner.exit("zfs list", 0, zfs_listing(&["pvc-1"]));

    let report = reconciler(&runner, claims(&[]), false)
        .run()
        .await
        .unwrap();
    assert_eq!(report.inventory.iscsi_records, 0);
    assert_eq!(report.stale_found, 0);
    assert!(report.succeeded());
}

/// Dry run issues no logout and no delete.
#[tokio::test]
async fn dry_run_never_deletes() {
    init_logger();
    let runner = ScriptedRunner::new();
    runner.node_list(0, node_listing(&["pvc-1", "pvc-2", "pvc-3"]));
    runner.exit("zfs list", 0, "");

    let report = reconciler(&runner, claims(&[]), true)
        .run()
        .await
        .unwrap();

    assert!(report.dry_run);
    assert_eq!(report.stale_found, 3);
    assert_eq!(report.planned, 3);
    assert_eq!(report.deleted, 0);
    assert_eq!(runner.calls().len(), 2, "only the two listings ran");
    assert!(report.succeeded());
}

/// One failed delete does not stop the others.
#[tokio::test]
async fn deletion_failure_is_isolated() {
    init_logger();
    let runner = ScriptedRunner::new();
    runner.node_list(0, node_listing(&["pvc-1", "pvc-2", "pvc-3"]));
    runner.exit("zfs list", 0, "");
    runner.exit(&delete_cmd("pvc-1"), 8, "");

    let report = reconciler(&runner, claims(&[]), false)
        .run()
        .await
        .unwrap();

    assert_eq!(
        runner.deletes(),
        vec![delete_cmd("pvc-1"), delete_cmd("pvc-2"), delete_cmd("pvc-3")]
    );
    assert_eq!(report.failed, 1);
    assert_eq!(report.deleted, 2);
    assert_eq!(report.exit_code(), EXIT_PARTIAL);

    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].volume_key, "pvc-1");
    assert!(matches!(
        failures[0].reason,
        ExecutionError::NonZeroExit { code: 8, .. }
    ));
    assert!(matches!(report.records[1].outcome, RecordOutcome::Deleted));
}

/// Deleting a record someone else already removed counts as success.
#[tokio::test]
async fn already_absent_is_success() {
    init_logger();
    let runner = ScriptedRunner::new();
    runner.node_list(0, node_listing(&["pvc-2"]));
    runner.exit("zfs list", 0, "");
    runner.exit(&logout_cmd("pvc-2"), 21, "");
    runner.exit(&delete_cmd("pvc-2"), 21, "");

    let report = reconciler(&runner, claims(&[]), false)
        .run()
        .await
        .unwrap();

    assert_eq!(report.not_found, 1);
    assert_eq!(report.failed, 0);
    assert!(report.succeeded());
}

/// A failed logout is logged; the delete still runs.
#[tokio::test]
async fn logout_failure_does_not_block_delete() {
    init_logger();
    let runner = ScriptedRunner::new();
    runner.node_list(0, node_listing(&["pvc-2"]));
    runner.exit("zfs list", 0, "");
    runner.exit(&logout_cmd("pvc-2"), 15, "");

    let report = reconciler(&runner, claims(&[]), false)
        .run()
        .await
        .unwrap();

    assert_eq!(runner.deletes(), vec![delete_cmd("pvc-2")]);
    assert_eq!(report.deleted, 1);
}

/// Records outside the managed prefix are invisible, whatever the other
/// inventories say.
#[tokio::test]
async fn foreign_records_are_never_touched() {
    init_logger();
    let runner = ScriptedRunner::new();
    runner.node_list(
        0,
        "10.0.0.5:3260,1 iqn.2005-10.org.freenas.ctl:pvc-7\n\
         10.0.0.5:3260,1 iqn.2024-03.lan.asgard:knas2:pvc-8\n",
    );
    runner.exit("zfs list", 0, "");

    let report = reconciler(&runner, claims(&[]), false)
        .run()
        .await
        .unwrap();

    assert_eq!(report.inventory.iscsi_records, 0);
    assert_eq!(report.stale_found, 0);
    assert!(runner.deletes().is_empty());
}

/// A clone whose name embeds another volume's key is not mistaken for that
/// volume, so it survives when the original is gone.
#[tokio::test]
async fn embedded_key_does_not_alias() {
    init_logger();
    let runner = ScriptedRunner::new();
    runner.node_list(0, node_listing(&["pvc-1", "clone-pvc-1", "pvc-1-snap"]));
    runner.exit("zfs list", 0, zfs_listing(&["clone-pvc-1", "pvc-1-snap"]));

    let report = reconciler(&runner, claims(&[]), false).run().await.unwrap();

    assert_eq!(report.inventory.iscsi_records, 1);
    assert_eq!(report.inventory.volumes, 0);
    assert_eq!(runner.deletes(), vec![delete_cmd("pvc-1")]);
}

/// No new deletion starts once a stop is requested.
#[tokio::test]
async fn stop_between_records() {
    init_logger();
    let runner = ScriptedRunner::new();
    runner.node_list(0, node_listing(&["pvc-1", "pvc-2", "pvc-3"]));
    runner.exit("zfs list", 0, "");
    let stop = StopSignal::new();
    runner.stop_after_first_delete(stop.clone());

    let report = reconciler(&runner, claims(&[]), false)
        .with_stop_signal(stop)
        .run()
        .await
        .unwrap();

    assert_eq!(runner.deletes(), vec![delete_cmd("pvc-1")]);
    assert_eq!(report.deleted, 1);
    assert_eq!(report.cancelled, 2);
    assert_eq!(report.exit_code(), EXIT_PARTIAL);
}

/// A second pass over the same snapshot finds the same records, and deletes
/// that hit "not found" the second time still succeed.
#[tokio::test]
async fn repeated_pass_is_idempotent() {
    init_logger();
    let listing = node_listing(&["pvc-1", "pvc-2"]);

    let first = ScriptedRunner::new();
    first.node_list(0, listing.clone());
    first.exit("zfs list", 0, zfs_listing(&["pvc-1"]));
    let r1 = reconciler(&first, claims(&[]), false).run().await.unwrap();

    let second = ScriptedRunner::new();
    second.node_list(0, listing);
    second.exit("zfs list", 0, zfs_listing(&["pvc-1"]));
    second.exit(&delete_cmd("pvc-2"), 21, "");
    let r2 = reconciler(&second, claims(&[]), false).run().await.unwrap();

    let keys = |r: &libreaper::PassReport| {
        r.records
            .iter()
            .map(|rec| rec.volume_key.to_string())
            .collect::<Vec<_>>()
    };
    assert_eq!(keys(&r1), keys(&r2));
    assert_eq!(r1.deleted, 1);
    assert_eq!(r2.not_found, 1);
    assert!(r2.succeeded());
}
