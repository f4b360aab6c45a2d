//! Per-table watermark state machine.

use anyhow::{bail, Context, Result};
use chrono::{Duration, NaiveDateTime};

use crate::store::LoadStateStore;
use crate::{initial_watermark, LoadMode, LoadStatus, TableLoadState};

/// Time window claimed by a run.
///
/// Returned by [`LoadStateTracker::begin_run`] and handed back to
/// `complete_run` / `fail_run` so the tracker can finalize exactly the window
/// it opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunWindow {
    pub table_name: String,
    pub load_id: String,
    pub mode: LoadMode,
    /// Lower bound of the extraction (inclusive)
    pub watermark: NaiveDateTime,
    /// Local "now" adjusted by the timezone offset; next watermark on success
    pub capture_time: NaiveDateTime,
}

/// Drives [`TableLoadState`] rows through RUNNING → COMPLETE | FAILED.
///
/// The watermark is only advanced by [`complete_run`](Self::complete_run).
pub struct LoadStateTracker<'a, S: LoadStateStore + ?Sized> {
    store: &'a S,
    timezone_offset: Duration,
}

impl<'a, S: LoadStateStore + ?Sized> LoadStateTracker<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            timezone_offset: Duration::zero(),
        }
    }

    /// Capture times are `now - offset_hours`.
    pub fn with_timezone_offset(mut self, offset_hours: i64) -> Self {
        self.timezone_offset = Duration::hours(offset_hours);
        self
    }

    /// 0 means the table has never been loaded (or its initial load failed).
    pub async fn run_count(&self, table: &str) -> Result<u64> {
        self.store
            .count_states(table)
            .await
            .with_context(|| format!("Failed to count load state rows for {table}"))
    }

    pub async fn current(&self, table: &str) -> Result<Option<TableLoadState>> {
        self.store
            .read_state(table)
            .await
            .with_context(|| format!("Failed to read load state for {table}"))
    }

    /// Claim a window for a new run and mark the table RUNNING.
    ///
    /// A table whose row is already RUNNING is refused unless
    /// `recover_stale` is set. A delta run requires existing state.
    pub async fn begin_run(
        &self,
        table: &str,
        mode: LoadMode,
        load_id: &str,
        now: NaiveDateTime,
        recover_stale: bool,
    ) -> Result<RunWindow> {
        let capture_time = now - self.timezone_offset;
        let existing = self.current(table).await?;

        if let Some(state) = &existing {
            if state.status == LoadStatus::Running && !recover_stale {
                bail!(
                    "Table {table} is already RUNNING (load id {}); \
                     rerun with stale-run recovery if that run is dead",
                    state.load_id
                );
            }
        }

        let window = match mode {
            LoadMode::Initial => {
                if existing.is_some() {
                    tracing::warn!("Resetting existing load state for {table} before initial load");
                    self.store.delete_state(table).await?;
                }
                let sentinel = initial_watermark();
                let state = TableLoadState {
                    table_name: table.to_string(),
                    load_id: load_id.to_string(),
                    start_time: sentinel,
                    end_time: capture_time,
                    status: LoadStatus::Running,
                    watermark: sentinel,
                };
                self.store
                    .insert_state(&state)
                    .await
                    .with_context(|| format!("Failed to insert load state for {table}"))?;
                RunWindow {
                    table_name: table.to_string(),
                    load_id: load_id.to_string(),
                    mode,
                    watermark: sentinel,
                    capture_time,
                }
            }
            LoadMode::Delta => {
                let Some(prior) = existing else {
                    bail!("Delta load requested for {table} but it has no load state");
                };
                if prior.status == LoadStatus::Running {
                    tracing::warn!(
                        "Recovering stale RUNNING state for {table} left by load id {}",
                        prior.load_id
                    );
                }
                let watermark = prior.next_watermark();
                let state = TableLoadState {
                    load_id: load_id.to_string(),
                    end_time: capture_time,
                    status: LoadStatus::Running,
                    watermark,
                    ..prior
                };
                self.store
                    .update_state(&state)
                    .await
                    .with_context(|| format!("Failed to update load state for {table}"))?;
                RunWindow {
                    table_name: table.to_string(),
                    load_id: load_id.to_string(),
                    mode,
                    watermark,
                    capture_time,
                }
            }
        };

        tracing::info!(
            "Began {} run {} for {}: watermark {}, capture {}",
            window.mode,
            window.load_id,
            table,
            window.watermark,
            window.capture_time
        );
        Ok(window)
    }

    /// Mark the run COMPLETE; its capture time becomes the next watermark.
    pub async fn complete_run(&self, window: &RunWindow) -> Result<()> {
        let state = self.owned_state(window).await?;
        let state = TableLoadState {
            end_time: window.capture_time,
            status: LoadStatus::Complete,
            ..state
        };
        self.store
            .update_state(&state)
            .await
            .with_context(|| format!("Failed to complete load state for {}", window.table_name))?;
        tracing::info!(
            "Advanced watermark for {} to {}",
            window.table_name,
            window.capture_time
        );
        Ok(())
    }

    /// Roll the table back so the next run covers the same range again.
    ///
    /// Initial runs delete their row; delta runs become FAILED with
    /// `end_time` pinned to the watermark they started from.
    pub async fn fail_run(&self, window: &RunWindow) -> Result<()> {
        let table = &window.table_name;
        match window.mode {
            LoadMode::Initial => {
                self.store
                    .delete_state(table)
                    .await
                    .with_context(|| format!("Failed to delete load state for {table}"))?;
                tracing::info!("Removed load state for {table} after failed initial load");
            }
            LoadMode::Delta => {
                let state = self.owned_state(window).await?;
                let state = TableLoadState {
                    end_time: window.watermark,
                    status: LoadStatus::Failed,
                    ..state
                };
                self.store
                    .update_state(&state)
                    .await
                    .with_context(|| format!("Failed to mark load state FAILED for {table}"))?;
                tracing::info!(
                    "Marked {table} FAILED; watermark stays at {}",
                    window.watermark
                );
            }
        }
        Ok(())
    }

    /// Drop all state for a table so its next run is an initial load.
    pub async fn reset(&self, table: &str, recover_stale: bool) -> Result<()> {
        if let Some(state) = self.current(table).await? {
            if state.status == LoadStatus::Running && !recover_stale {
                bail!("Refusing to reset {table} while load id {} is RUNNING", state.load_id);
            }
            self.store.delete_state(table).await?;
        }
        Ok(())
    }

    async fn owned_state(&self, window: &RunWindow) -> Result<TableLoadState> {
        let table = &window.table_name;
        let Some(state) = self.current(table).await? else {
            bail!("Load state for {table} disappeared during load {}", window.load_id);
        };
        if state.load_id != window.load_id {
            bail!(
                "Load state for {table} belongs to load id {}, not {}",
                state.load_id,
                window.load_id
            );
        }
        Ok(state)
    }
}
