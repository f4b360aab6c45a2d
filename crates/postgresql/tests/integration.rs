//! Integration tests against a live PostgreSQL server.
//!
//! Skipped unless `WATERMARK_SYNC_TEST_PG` holds a libpq-style connection
//! string, e.g. `host=localhost user=postgres password=postgres dbname=postgres`.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use checkpoint::{
    AuditLedger, LoadMode, LoadRunAudit, LoadStateTracker, LoadStatus, ReconciliationRecord,
};
use sync_core::{
    ChangeColumns, LoadCondition, RowSink, RowTransformer, SourceStore, StagedRow, TargetStore,
    UpsertStatement,
};
use tokio_postgres::{Client, NoTls};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use watermark_sync_postgresql::{PostgresLedger, PostgresSource, PostgresTarget};

fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

async fn test_client() -> Result<Option<Client>> {
    let Ok(conn) = std::env::var("WATERMARK_SYNC_TEST_PG") else {
        eprintln!("WATERMARK_SYNC_TEST_PG not set, skipping");
        return Ok(None);
    };
    let (client, connection) = tokio_postgres::connect(&conn, NoTls)
        .await
        .context("Failed to connect to test PostgreSQL")?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("PostgreSQL connection error: {e}");
        }
    });
    Ok(Some(client))
}

fn at(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
}

#[derive(Default)]
struct Collect(Vec<StagedRow>);

impl RowSink for Collect {
    fn write_row(&mut self, row: &StagedRow) -> sync_core::Result<()> {
        self.0.push(row.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_extract_and_merge_roundtrip() -> Result<()> {
    init_logging();
    let Some(setup) = test_client().await? else {
        return Ok(());
    };
    setup
        .batch_execute(
            "DROP SCHEMA IF EXISTS wms_src CASCADE;
             DROP SCHEMA IF EXISTS wms_tgt CASCADE;
             CREATE SCHEMA wms_src;
             CREATE SCHEMA wms_tgt;
             CREATE TABLE wms_src.orders (
                 id bigint PRIMARY KEY,
                 note text,
                 placed_at timestamp,
                 pg_load_dt timestamp NOT NULL,
                 pg_modify_dt timestamp NOT NULL
             );
             CREATE TABLE wms_tgt.orders (
                 id bigint PRIMARY KEY,
                 note text,
                 placed_at timestamp
             );
             INSERT INTO wms_src.orders VALUES
                 (1, 'old', '2024-01-01 08:00:00', '2024-01-01 00:00:00', '2024-01-01 00:00:00'),
                 (2, 'new', '2024-01-08 09:30:00', '2024-01-08 00:00:00', '2024-01-08 00:00:00'),
                 (3, NULL, NULL, '2024-01-01 00:00:00', '2024-01-09 00:00:00');
             INSERT INTO wms_tgt.orders VALUES (3, 'stale', NULL);",
        )
        .await?;

    let mut source = PostgresSource::new(test_client().await?.unwrap(), "wms_src");
    let mut target = PostgresTarget::new(test_client().await?.unwrap(), "wms_tgt");

    let condition = LoadCondition::changed_since(at("2024-01-07 00:00:00"), ChangeColumns::default());
    let headers = source.columns("ORDERS").await?;
    let mut sink = Collect::default();
    let extracted = source.extract("orders", &condition, &mut sink).await?;
    assert_eq!(extracted, 2);
    assert_eq!(source.count("orders", &condition).await?, 2);

    let metadata = target.resolve_metadata("orders").await?;
    assert_eq!(metadata.primary_key_columns, vec!["id".to_string()]);
    let statement = UpsertStatement::generate(&metadata)?;

    let mut transformer = RowTransformer::new(&metadata, &headers);
    let rows: Vec<_> = sink.0.iter().map(|r| transformer.transform(r)).collect();
    target.execute_batch(&statement, &rows).await?;

    assert_eq!(target.count("orders").await?, 2);
    let row = setup
        .query_one("SELECT note FROM wms_tgt.orders WHERE id = 3", &[])
        .await?;
    assert_eq!(row.get::<_, Option<String>>(0), None);
    Ok(())
}

#[tokio::test]
async fn test_ledger_tracks_runs() -> Result<()> {
    init_logging();
    let Some(setup) = test_client().await? else {
        return Ok(());
    };
    setup
        .batch_execute("DROP SCHEMA IF EXISTS wms_ledger CASCADE")
        .await?;

    let ledger = PostgresLedger::new(test_client().await?.unwrap(), "wms_ledger")?;
    ledger.ensure_schema().await?;
    ledger.ensure_schema().await?;

    let tracker = LoadStateTracker::new(&ledger);
    assert_eq!(tracker.run_count("orders").await?, 0);
    let window = tracker
        .begin_run("orders", LoadMode::Initial, "0042", at("2024-01-07 10:00:00"), false)
        .await?;
    tracker.complete_run(&window).await?;

    let state = tracker.current("orders").await?.unwrap();
    assert_eq!(state.status, LoadStatus::Complete);
    assert_eq!(state.next_watermark(), at("2024-01-07 10:00:00"));

    let mut audit = LoadRunAudit::running("0042", "orders", at("2024-01-07 10:00:00"));
    ledger.open_run(&audit).await?;
    audit.batches_committed = 3;
    audit.complete(at("2024-01-07 10:01:00"), 25_000, std::time::Duration::from_secs(60));
    ledger.update_run(&audit).await?;

    ledger
        .append_reconciliation(&ReconciliationRecord::new(
            "orders",
            25_000,
            25_000,
            "0042",
            at("2024-01-07 10:01:00"),
        ))
        .await?;

    let row = setup
        .query_one(
            "SELECT status, batches_committed FROM wms_ledger.load_status WHERE load_id = '0042'",
            &[],
        )
        .await?;
    assert_eq!(row.get::<_, String>(0), "COMPLETE");
    assert_eq!(row.get::<_, i64>(1), 3);

    let never_opened = LoadRunAudit::running("0043", "orders", at("2024-01-08 10:00:00"));
    let err = ledger.update_run(&never_opened).await.unwrap_err();
    assert!(err.to_string().contains("No audit row for load 0043"));
    Ok(())
}
