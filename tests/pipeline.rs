//! End-to-end runs of the replication pipeline against in-memory stores.

use checkpoint::{
    initial_watermark, LoadMode, LoadStateTracker, LoadStatus, MemoryLedger, TableLoadState,
};
use sync_core::{Column, SyncError, TableMetadata};
use tempfile::TempDir;
use watermark_sync::testing::{ts, MemoryConnector, RecordingNotifier};
use watermark_sync::{
    RunController, RunIdentity, RunOutcome, RunPhase, RunRequest, RunSettings,
};

const COLUMNS: [&str; 5] = ["order_id", "customer", "amount", "pg_load_dt", "pg_modify_dt"];

fn orders_metadata(primary_key: &[&str]) -> TableMetadata {
    TableMetadata::new(
        "stage",
        "orders",
        vec![
            Column::new("order_id", "integer"),
            Column::new("customer", "character varying"),
            Column::new("amount", "numeric"),
            Column::new("pg_load_dt", "timestamp without time zone"),
            Column::new("pg_modify_dt", "timestamp without time zone"),
        ],
        primary_key.iter().map(|k| k.to_string()).collect(),
    )
}

/// Source with `rows` orders loaded on 2024-01-01 and an empty target.
fn orders_connector(rows: usize) -> MemoryConnector {
    let connector = MemoryConnector::new();
    connector.add_source_table("orders", &COLUMNS);
    for i in 1..=rows {
        let id = i.to_string();
        let customer = format!("customer-{}", i % 97);
        connector.insert_source_row(
            "orders",
            &[
                Some(id.as_str()),
                Some(customer.as_str()),
                Some("100"),
                Some("2024-01-01 08:00:00"),
                None,
            ],
        );
    }
    connector.add_target_table(orders_metadata(&["order_id"]));
    connector
}

fn request(mode: LoadMode) -> RunRequest {
    RunRequest {
        source_table: "orders".to_string(),
        target_table: "orders".to_string(),
        mode,
        stored_procedure: None,
        recover_stale: false,
    }
}

fn settings(data_dir: &TempDir) -> RunSettings {
    RunSettings {
        data_dir: data_dir.path().to_path_buf(),
        environment: "TEST".to_string(),
        recipients: vec!["dataops@example.com".to_string()],
        ..RunSettings::default()
    }
}

async fn run_at(
    connector: &MemoryConnector,
    ledger: &MemoryLedger,
    notifier: &RecordingNotifier,
    settings: RunSettings,
    request: &RunRequest,
    started_at: &str,
) -> (RunIdentity, anyhow::Result<RunOutcome>) {
    let identity = RunIdentity::new(&request.target_table, ts(started_at));
    let mut controller = RunController::new(connector, ledger, notifier, settings);
    let result = controller.execute(request, &identity).await;
    (identity, result)
}

fn completed_state(end_time: &str) -> TableLoadState {
    TableLoadState {
        table_name: "orders".to_string(),
        load_id: "01012024000000_5406".to_string(),
        start_time: initial_watermark(),
        end_time: ts(end_time),
        status: LoadStatus::Complete,
        watermark: initial_watermark(),
    }
}

fn target_row(connector: &MemoryConnector, order_id: &str) -> Option<Vec<Option<String>>> {
    connector
        .target_rows("orders")
        .into_iter()
        .find(|row| row[0].as_deref() == Some(order_id))
}

#[tokio::test]
async fn test_initial_load_replicates_and_reconciles() {
    let dir = TempDir::new().unwrap();
    let connector = orders_connector(3);
    let ledger = MemoryLedger::new();
    let notifier = RecordingNotifier::new();

    let (identity, result) = run_at(
        &connector,
        &ledger,
        &notifier,
        settings(&dir),
        &request(LoadMode::Initial),
        "2024-01-07 10:00:00",
    )
    .await;
    let outcome = result.unwrap();

    assert_eq!(outcome.mode, LoadMode::Initial);
    assert_eq!(outcome.rows_extracted, 3);
    assert_eq!(outcome.rows_loaded, 3);
    assert_eq!(outcome.batches_committed, 1);
    assert!(outcome.reconciliation.is_balanced());
    assert_eq!(outcome.reconciliation.source_count, 3);
    assert_eq!(outcome.reconciliation.target_count, 3);

    let row = target_row(&connector, "2").unwrap();
    assert_eq!(row[1].as_deref(), Some("customer-2"));
    assert_eq!(row[3].as_deref(), Some("2024-01-01 08:00:00"));
    assert_eq!(row[4], None);

    let state = ledger.state("orders").unwrap();
    assert_eq!(state.status, LoadStatus::Complete);
    assert_eq!(state.load_id, identity.run_id);
    assert_eq!(state.watermark, initial_watermark());
    assert_eq!(state.end_time, ts("2024-01-07 10:00:00"));

    let audit = ledger.run(&identity.run_id).unwrap();
    assert_eq!(audit.table_name, "orders");
    assert_eq!(audit.status, LoadStatus::Complete);
    assert_eq!(audit.row_count, Some(3));
    assert_eq!(audit.batches_committed, 1);

    let reconciliations = ledger.reconciliations();
    assert_eq!(reconciliations.len(), 1);
    assert_eq!(reconciliations[0].diff, 0);
    assert_eq!(reconciliations[0].load_id, identity.run_id);

    assert_eq!(notifier.count(), 0);
    assert_eq!(connector.open_connections(), 0);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_delta_load_picks_up_changes_since_watermark() {
    let dir = TempDir::new().unwrap();
    let connector = orders_connector(3);
    let ledger = MemoryLedger::new();
    let notifier = RecordingNotifier::new();

    let (_, first) = run_at(
        &connector,
        &ledger,
        &notifier,
        settings(&dir),
        &request(LoadMode::Initial),
        "2024-01-07 10:00:00",
    )
    .await;
    first.unwrap();

    connector.update_source_row("orders", "order_id", "2", "customer", Some("renamed"));
    connector.update_source_row(
        "orders",
        "order_id",
        "2",
        "pg_modify_dt",
        Some("2024-01-08 09:00:00"),
    );
    connector.insert_source_row(
        "orders",
        &[
            Some("4"),
            Some("late"),
            Some("5"),
            Some("2024-01-08 09:30:00"),
            None,
        ],
    );

    let (identity, second) = run_at(
        &connector,
        &ledger,
        &notifier,
        settings(&dir),
        &request(LoadMode::Delta),
        "2024-01-08 10:00:00",
    )
    .await;
    let outcome = second.unwrap();

    assert_eq!(outcome.mode, LoadMode::Delta);
    assert_eq!(outcome.watermark, ts("2024-01-07 10:00:00"));
    assert_eq!(outcome.rows_extracted, 2);
    assert_eq!(outcome.reconciliation.target_count, 4);
    assert!(outcome.reconciliation.is_balanced());

    assert_eq!(target_row(&connector, "2").unwrap()[1].as_deref(), Some("renamed"));
    assert_eq!(target_row(&connector, "4").unwrap()[1].as_deref(), Some("late"));

    let state = ledger.state("orders").unwrap();
    assert_eq!(state.status, LoadStatus::Complete);
    assert_eq!(state.load_id, identity.run_id);
    assert_eq!(state.watermark, ts("2024-01-07 10:00:00"));
    assert_eq!(state.end_time, ts("2024-01-08 10:00:00"));
    assert_eq!(ledger.runs().len(), 2);
}

#[tokio::test]
async fn test_delta_without_state_runs_initial() {
    let dir = TempDir::new().unwrap();
    let connector = orders_connector(2);
    let ledger = MemoryLedger::new();
    let notifier = RecordingNotifier::new();

    let (_, result) = run_at(
        &connector,
        &ledger,
        &notifier,
        settings(&dir),
        &request(LoadMode::Delta),
        "2024-01-07 10:00:00",
    )
    .await;
    let outcome = result.unwrap();

    assert_eq!(outcome.mode, LoadMode::Initial);
    assert_eq!(outcome.rows_loaded, 2);
    assert_eq!(ledger.state("orders").unwrap().status, LoadStatus::Complete);
}

#[tokio::test]
async fn test_large_extract_commits_in_batches() {
    let dir = TempDir::new().unwrap();
    let connector = orders_connector(25_000);
    let ledger = MemoryLedger::new();
    let notifier = RecordingNotifier::new();

    let (identity, result) = run_at(
        &connector,
        &ledger,
        &notifier,
        settings(&dir),
        &request(LoadMode::Initial),
        "2024-01-07 10:00:00",
    )
    .await;
    let outcome = result.unwrap();

    assert_eq!(connector.commits(), vec![10_000, 10_000, 5_000]);
    assert_eq!(outcome.batches_committed, 3);
    assert_eq!(outcome.rows_loaded, 25_000);
    assert_eq!(ledger.run(&identity.run_id).unwrap().batches_committed, 3);
    assert_eq!(connector.target_rows("orders").len(), 25_000);
}

#[tokio::test]
async fn test_failed_batch_keeps_earlier_commits_and_watermark() {
    let dir = TempDir::new().unwrap();
    let connector = orders_connector(25_000);
    connector.fail_on_batch(2);
    let ledger = MemoryLedger::new();
    ledger.put_state(completed_state("2023-12-31 00:00:00"));
    let notifier = RecordingNotifier::new();

    let (identity, result) = run_at(
        &connector,
        &ledger,
        &notifier,
        settings(&dir),
        &request(LoadMode::Delta),
        "2024-01-07 10:00:00",
    )
    .await;
    let err = result.unwrap_err();
    assert!(format!("{err:#}").contains("Batch 2"));

    assert_eq!(connector.commits(), vec![10_000]);
    assert_eq!(connector.batch_attempts(), 2);
    assert_eq!(connector.target_rows("orders").len(), 10_000);

    let audit = ledger.run(&identity.run_id).unwrap();
    assert_eq!(audit.status, LoadStatus::Failed);
    assert_eq!(audit.batches_committed, 1);
    assert_eq!(audit.row_count, Some(25_000));

    let state = ledger.state("orders").unwrap();
    assert_eq!(state.status, LoadStatus::Failed);
    assert_eq!(state.next_watermark(), ts("2023-12-31 00:00:00"));

    let notices = notifier.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].table_name, "orders");
    assert_eq!(notices[0].run_id, identity.run_id);
    assert_eq!(notices[0].subject(), "TEST | Error | 07-Jan-2024 | orders");
    assert!(ledger.reconciliations().is_empty());
    assert_eq!(connector.open_connections(), 0);
}

#[tokio::test]
async fn test_retry_after_failed_delta_covers_same_window() {
    let dir = TempDir::new().unwrap();
    let connector = orders_connector(3);
    connector.set_target_unreachable(true);
    let ledger = MemoryLedger::new();
    ledger.put_state(completed_state("2023-12-31 00:00:00"));
    let notifier = RecordingNotifier::new();

    let (_, failed) = run_at(
        &connector,
        &ledger,
        &notifier,
        settings(&dir),
        &request(LoadMode::Delta),
        "2024-01-07 10:00:00",
    )
    .await;
    assert!(failed.is_err());
    assert_eq!(notifier.count(), 1);
    assert_eq!(connector.batch_attempts(), 0);

    connector.set_target_unreachable(false);
    let (_, retried) = run_at(
        &connector,
        &ledger,
        &notifier,
        settings(&dir),
        &request(LoadMode::Delta),
        "2024-01-07 11:00:00",
    )
    .await;
    let outcome = retried.unwrap();

    assert_eq!(outcome.watermark, ts("2023-12-31 00:00:00"));
    assert_eq!(outcome.rows_loaded, 3);
    assert_eq!(notifier.count(), 1);
    assert_eq!(
        ledger.state("orders").unwrap().end_time,
        ts("2024-01-07 11:00:00")
    );
}

#[tokio::test]
async fn test_unreachable_source_fails_initial_without_state() {
    let dir = TempDir::new().unwrap();
    let connector = orders_connector(3);
    connector.set_source_unreachable(true);
    let ledger = MemoryLedger::new();
    let notifier = RecordingNotifier::new();

    let (identity, result) = run_at(
        &connector,
        &ledger,
        &notifier,
        settings(&dir),
        &request(LoadMode::Initial),
        "2024-01-07 10:00:00",
    )
    .await;
    let err = result.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::Connectivity { .. })
    ));

    assert!(ledger.state("orders").is_none());
    let audit = ledger.run(&identity.run_id).unwrap();
    assert_eq!(audit.status, LoadStatus::Failed);
    assert_eq!(audit.row_count, None);
    assert_eq!(notifier.count(), 1);
    assert!(connector.target_rows("orders").is_empty());
    assert_eq!(connector.open_connections(), 0);
}

#[tokio::test]
async fn test_running_table_is_refused_and_left_alone() {
    let dir = TempDir::new().unwrap();
    let connector = orders_connector(3);
    let ledger = MemoryLedger::new();
    let running = TableLoadState {
        load_id: "01062024230000_5406".to_string(),
        status: LoadStatus::Running,
        ..completed_state("2024-01-06 23:00:00")
    };
    ledger.put_state(running.clone());
    let notifier = RecordingNotifier::new();

    let (_, result) = run_at(
        &connector,
        &ledger,
        &notifier,
        settings(&dir),
        &request(LoadMode::Delta),
        "2024-01-07 10:00:00",
    )
    .await;
    assert!(format!("{:#}", result.unwrap_err()).contains("already RUNNING"));

    assert_eq!(ledger.state("orders"), Some(running));
    assert!(ledger.runs().is_empty());
    assert_eq!(notifier.count(), 1);
    assert_eq!(connector.open_connections(), 0);
}

#[tokio::test]
async fn test_recover_stale_reuses_running_watermark() {
    let dir = TempDir::new().unwrap();
    let connector = orders_connector(3);
    let ledger = MemoryLedger::new();
    ledger.put_state(TableLoadState {
        load_id: "01062024230000_5406".to_string(),
        status: LoadStatus::Running,
        watermark: ts("2023-12-31 00:00:00"),
        ..completed_state("2024-01-06 23:00:00")
    });
    let notifier = RecordingNotifier::new();

    let mut request = request(LoadMode::Delta);
    request.recover_stale = true;
    let (_, result) = run_at(
        &connector,
        &ledger,
        &notifier,
        settings(&dir),
        &request,
        "2024-01-07 10:00:00",
    )
    .await;
    let outcome = result.unwrap();

    assert_eq!(outcome.watermark, ts("2023-12-31 00:00:00"));
    assert_eq!(outcome.rows_loaded, 3);
}

#[tokio::test]
async fn test_target_without_primary_key_fails_before_loading() {
    let dir = TempDir::new().unwrap();
    let connector = MemoryConnector::new();
    connector.add_source_table("orders", &COLUMNS);
    connector.insert_source_row(
        "orders",
        &[Some("1"), Some("a"), Some("1"), Some("2024-01-01 08:00:00"), None],
    );
    connector.add_target_table(orders_metadata(&[]));
    let ledger = MemoryLedger::new();
    let notifier = RecordingNotifier::new();

    let (_, result) = run_at(
        &connector,
        &ledger,
        &notifier,
        settings(&dir),
        &request(LoadMode::Initial),
        "2024-01-07 10:00:00",
    )
    .await;
    let err = result.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::NoPrimaryKey(table)) if table == "orders"
    ));
    assert_eq!(connector.batch_attempts(), 0);
    assert!(ledger.state("orders").is_none());
    assert_eq!(notifier.count(), 1);
}

#[tokio::test]
async fn test_invalid_table_name_is_rejected_before_any_state_change() {
    let dir = TempDir::new().unwrap();
    let connector = orders_connector(1);
    let ledger = MemoryLedger::new();
    let notifier = RecordingNotifier::new();

    let mut request = request(LoadMode::Initial);
    request.target_table = "orders; drop table x".to_string();
    let (_, result) = run_at(
        &connector,
        &ledger,
        &notifier,
        settings(&dir),
        &request,
        "2024-01-07 10:00:00",
    )
    .await;
    let err = result.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::InvalidIdentifier { .. })
    ));
    assert!(ledger.state("orders").is_none());
    assert!(ledger.runs().is_empty());
    assert_eq!(notifier.count(), 1);
}

#[tokio::test]
async fn test_stored_procedure_called_after_load() {
    let dir = TempDir::new().unwrap();
    let connector = orders_connector(2);
    let ledger = MemoryLedger::new();
    let notifier = RecordingNotifier::new();

    let mut request = request(LoadMode::Initial);
    request.stored_procedure = Some("stage.refresh_orders".to_string());
    let (_, result) = run_at(
        &connector,
        &ledger,
        &notifier,
        settings(&dir),
        &request,
        "2024-01-07 10:00:00",
    )
    .await;
    result.unwrap();

    assert_eq!(connector.procedures_called(), vec!["stage.refresh_orders"]);
}

#[tokio::test]
async fn test_malformed_values_are_defaulted_and_counted() {
    let dir = TempDir::new().unwrap();
    let connector = orders_connector(1);
    connector.insert_source_row(
        "orders",
        &[
            Some("2"),
            Some("b"),
            Some("12a"),
            Some("not a date"),
            None,
        ],
    );
    let ledger = MemoryLedger::new();
    let notifier = RecordingNotifier::new();

    let (_, result) = run_at(
        &connector,
        &ledger,
        &notifier,
        settings(&dir),
        &request(LoadMode::Initial),
        "2024-01-07 10:00:00",
    )
    .await;
    let outcome = result.unwrap();

    assert_eq!(outcome.rows_loaded, 2);
    assert_eq!(outcome.coercions.for_column("amount"), 1);
    assert_eq!(target_row(&connector, "2").unwrap()[2].as_deref(), Some("0"));
}

#[tokio::test]
async fn test_keep_staging_leaves_artifact() {
    let dir = TempDir::new().unwrap();
    let connector = orders_connector(2);
    let ledger = MemoryLedger::new();
    let notifier = RecordingNotifier::new();

    let settings = RunSettings {
        keep_staging: true,
        ..settings(&dir)
    };
    let (identity, result) = run_at(
        &connector,
        &ledger,
        &notifier,
        settings,
        &request(LoadMode::Initial),
        "2024-01-07 10:00:00",
    )
    .await;
    result.unwrap();

    let staged = dir
        .path()
        .join(format!("orders_EXTRACT_{}.csv", identity.run_id));
    let content = std::fs::read_to_string(staged).unwrap();
    assert!(content.starts_with("order_id,customer,amount,pg_load_dt,pg_modify_dt"));
    assert_eq!(content.lines().count(), 3);
}

#[tokio::test]
async fn test_audit_records_recount_not_staged_rows() {
    let dir = TempDir::new().unwrap();
    let connector = orders_connector(3);
    connector.set_source_count_drift(2);
    let ledger = MemoryLedger::new();
    let notifier = RecordingNotifier::new();

    let (identity, result) = run_at(
        &connector,
        &ledger,
        &notifier,
        settings(&dir),
        &request(LoadMode::Initial),
        "2024-01-07 10:00:00",
    )
    .await;
    let outcome = result.unwrap();

    assert_eq!(outcome.rows_extracted, 3);
    assert_eq!(outcome.rows_counted, 5);
    assert_eq!(outcome.rows_loaded, 3);
    assert_eq!(ledger.run(&identity.run_id).unwrap().row_count, Some(5));
    assert_eq!(outcome.reconciliation.diff, 2);
}

#[tokio::test]
async fn test_controller_phase_follows_outcome() {
    let dir = TempDir::new().unwrap();
    let connector = orders_connector(2);
    let ledger = MemoryLedger::new();
    let notifier = RecordingNotifier::new();

    let mut controller = RunController::new(&connector, &ledger, &notifier, settings(&dir));
    assert_eq!(controller.phase(), RunPhase::Starting);
    let identity = RunIdentity::new("orders", ts("2024-01-07 10:00:00"));
    controller
        .execute(&request(LoadMode::Initial), &identity)
        .await
        .unwrap();
    assert_eq!(controller.phase(), RunPhase::Complete);

    connector.fail_on_batch(2);
    let mut controller = RunController::new(&connector, &ledger, &notifier, settings(&dir));
    let identity = RunIdentity::new("orders", ts("2024-01-08 10:00:00"));
    let err = controller
        .execute(&request(LoadMode::Initial), &identity)
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("Batch 1"));
    assert_eq!(controller.phase(), RunPhase::Failed);
}

#[tokio::test]
async fn test_reset_turns_next_delta_into_initial() {
    let dir = TempDir::new().unwrap();
    let connector = orders_connector(2);
    let ledger = MemoryLedger::new();
    let notifier = RecordingNotifier::new();

    let (_, first) = run_at(
        &connector,
        &ledger,
        &notifier,
        settings(&dir),
        &request(LoadMode::Initial),
        "2024-01-07 10:00:00",
    )
    .await;
    first.unwrap();

    LoadStateTracker::new(&ledger)
        .reset("orders", false)
        .await
        .unwrap();
    assert!(ledger.state("orders").is_none());

    let (_, second) = run_at(
        &connector,
        &ledger,
        &notifier,
        settings(&dir),
        &request(LoadMode::Delta),
        "2024-01-08 10:00:00",
    )
    .await;
    let outcome = second.unwrap();

    assert_eq!(outcome.mode, LoadMode::Initial);
    assert_eq!(outcome.watermark, initial_watermark());
    assert_eq!(outcome.rows_extracted, 2);
}
