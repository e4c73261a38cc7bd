// ABOUTME: Job orchestrator sequencing validation, updates and delete syncs
// ABOUTME: Resolves filter dependencies and tracks per-run statistics

use anyhow::{bail, Context, Result};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio_postgres::Client;

use crate::config::Config;
use crate::copy::copy_full_table;
use crate::postgres;
use crate::schema::{
    apply_indices, create_table, drop_table, extract_table_columns, extract_table_indices,
    extract_table_schema, object_exists, primary_key_columns, TableColumn,
};
use crate::state::{StateStore, TableState};
use crate::updates::rewrite_infinite_dates;

/// Statistics for one completed run.
#[derive(Debug, Clone)]
pub struct RunStats {
    pub rows_written: u64,
    pub elapsed: Duration,
}

/// An active replication job. Construction resolves the filter dependency
/// order; each `run` connects, validates and syncs every configured table.
#[derive(Debug)]
pub struct Job {
    cfg: Config,
    filtered_order: Vec<String>,
}

impl Job {
    pub fn new(cfg: Config) -> Result<Job> {
        let filtered_order = filtered_validation_order(&cfg)?;
        Ok(Job {
            cfg,
            filtered_order,
        })
    }

    /// Perform a full sync pass over all configured tables.
    pub async fn run(&self) -> Result<RunStats> {
        tracing::info!(
            "Starting job with throttle at {:.2}%",
            self.cfg.throttle_percentage
        );
        tracing::info!("Changes are synced in chunks of {}", self.cfg.update_chunk_size);
        tracing::info!(
            "Deletions are synced in chunks of {}",
            self.cfg.delete_chunk_size
        );
        let start = Instant::now();

        tracing::info!("Connecting");
        let source = postgres::connect_with_retry(&self.cfg.source)
            .await
            .context("Failed to connect to source database")?;
        let target = postgres::connect_with_retry(&self.cfg.target)
            .await
            .context("Failed to connect to target database")?;

        let mut run = SyncRun {
            cfg: &self.cfg,
            state: StateStore::new(&self.cfg.state_table_name),
            source,
            target,
            primary_keys: HashMap::new(),
            columns: HashMap::new(),
            force_sync: HashSet::new(),
            updated_rows: 0,
        };

        tracing::info!("Validating tables");
        run.validate_tables(&self.filtered_order).await?;

        tracing::info!("Updating tables");
        run.update_tables(&self.filtered_order).await?;

        let elapsed = start.elapsed();
        tracing::info!("Done");
        tracing::info!("{} row(s) updated in {:?}", run.updated_rows, elapsed);
        Ok(RunStats {
            rows_written: run.updated_rows,
            elapsed,
        })
    }
}

/// Per-run state: the two connections plus everything learned during
/// validation. Dropped wholesale at the end of a run, which also rolls back
/// any in-flight target transaction on cancellation.
pub(crate) struct SyncRun<'a> {
    pub(crate) cfg: &'a Config,
    pub(crate) state: StateStore,
    pub(crate) source: Client,
    pub(crate) target: Client,
    pub(crate) primary_keys: HashMap<String, Vec<String>>,
    pub(crate) columns: HashMap<String, Vec<TableColumn>>,
    pub(crate) force_sync: HashSet<String>,
    pub(crate) updated_rows: u64,
}

impl SyncRun<'_> {
    async fn validate_tables(&mut self, filtered_order: &[String]) -> Result<()> {
        let cfg = self.cfg;
        for table in &cfg.tables {
            self.validate_table(table)
                .await
                .with_context(|| format!("validation failed for table {}", table))?;
        }
        for table in filtered_order {
            self.validate_table(table)
                .await
                .with_context(|| format!("validation failed for table {}", table))?;
            self.check_where_clause(table).await?;
        }
        Ok(())
    }

    /// Ensure the target has a table matching the source's schema and
    /// indices, and record the key and column layout for the sync passes.
    async fn validate_table(&mut self, table: &str) -> Result<()> {
        let schema = extract_table_schema(&self.source, table).await?;

        if object_exists(&self.target, table).await? {
            let target_schema = extract_table_schema(&self.target, table).await?;
            if target_schema != schema {
                if self.cfg.resync_on_schema_change {
                    tracing::info!(
                        "Schema for table {:?} has changed, marking for resync",
                        table
                    );
                    drop_table(&self.target, table).await?;
                    create_table(&self.target, table, &schema)
                        .await
                        .context("failed to create target table")?;
                    self.force_sync.insert(table.to_string());
                } else {
                    tracing::debug!(
                        "Schemas differ:\nsource: {}\ntarget: {}",
                        schema,
                        target_schema
                    );
                    bail!("schema mismatch");
                }
            }
        } else {
            create_table(&self.target, table, &schema)
                .await
                .context("failed to create target table")?;
        }

        let indices = extract_table_indices(&self.source, table).await?;
        apply_indices(&self.target, table, &indices)
            .await
            .context("failed to create indices")?;

        let Some(keys) = primary_key_columns(&indices) else {
            bail!("table {} does not have a primary key", table);
        };
        self.primary_keys.insert(table.to_string(), keys);
        let columns = extract_table_columns(&self.source, table).await?;
        self.columns.insert(table.to_string(), columns);

        Ok(())
    }

    /// The filter predicate belongs to a table's identity. A changed
    /// predicate invalidates the incremental cursor, so it either forces a
    /// resync or fails the table.
    async fn check_where_clause(&mut self, table: &str) -> Result<()> {
        let configured = self
            .cfg
            .filtered_tables
            .get(table)
            .map(|filter| filter.where_clause.clone())
            .unwrap_or_default();

        let state = self.state.get(&self.target, table).await?;
        if state.where_clause == configured {
            return Ok(());
        }
        if state.where_clause.is_empty() {
            self.state.set_where(&self.target, table, &configured).await?;
            return Ok(());
        }
        if self.cfg.resync_on_schema_change {
            tracing::info!("Filter for table {:?} has changed, marking for resync", table);
            self.force_sync.insert(table.to_string());
            return Ok(());
        }
        bail!(
            "filter predicate for table {:?} changed; enable resyncOnSchemaChange to resync",
            table
        );
    }

    async fn update_tables(&mut self, filtered_order: &[String]) -> Result<()> {
        let cfg = self.cfg;
        for table in &cfg.tables {
            self.update_table(table, "")
                .await
                .with_context(|| format!("failed to update table {}", table))?;
        }
        for table in filtered_order {
            let where_clause = cfg
                .filtered_tables
                .get(table)
                .map(|filter| filter.where_clause.as_str())
                .unwrap_or_default();
            self.update_table(table, where_clause)
                .await
                .with_context(|| format!("failed to update table {}", table))?;
            self.state
                .set_where(&self.target, table, where_clause)
                .await?;
        }
        Ok(())
    }

    async fn update_table(&mut self, table: &str, where_clause: &str) -> Result<()> {
        let primary_keys = self
            .primary_keys
            .get(table)
            .with_context(|| format!("table {} does not have a primary key", table))?
            .clone();

        if self.cfg.sync_updates {
            tracing::info!("Fetching update range for table {}", table);
            let range = self
                .get_update_range(table, where_clause)
                .await
                .context("failed to get update range")?;

            if range.full_table {
                tracing::info!("Performing full table sync for stale / empty table");
                let columns = self
                    .columns
                    .get(table)
                    .with_context(|| format!("no column info for table {}", table))?
                    .clone();
                let rewrite = |line: &[u8]| rewrite_infinite_dates(&columns, line);
                let rows =
                    copy_full_table(&self.source, &mut self.target, table, where_clause, &rewrite)
                        .await?;
                self.updated_rows += rows;
                self.state
                    .set(
                        &self.target,
                        table,
                        &TableState {
                            last_seen_xmin: range.end_xmin,
                            where_clause: where_clause.to_string(),
                        },
                    )
                    .await?;
            } else if !range.is_empty() {
                tracing::info!("Updating table {}", table);
                self.update_table_range(table, &primary_keys, &range, where_clause)
                    .await?;
            }
        }

        if self.cfg.sync_deletes {
            tracing::info!("Syncing deletions for table {}", table);
            self.sync_deleted_rows(table, where_clause)
                .await
                .with_context(|| format!("failed to sync deletions for table {}", table))?;
        }

        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unknown,
    Validating,
    Valid,
    Invalid,
}

/// Resolve the order in which filtered tables must be validated so that
/// every `uses` dependency comes first. Cycle-safe: re-entering a table
/// that is still being validated is a dependency loop.
pub(crate) fn filtered_validation_order(cfg: &Config) -> Result<Vec<String>> {
    fn visit(
        cfg: &Config,
        table: &str,
        marks: &mut HashMap<String, Mark>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        match marks.get(table).copied().unwrap_or(Mark::Unknown) {
            Mark::Validating => bail!("filter dependency loop involving table {:?}", table),
            Mark::Valid => return Ok(()),
            Mark::Invalid => bail!("filter dependency on invalid table {:?}", table),
            Mark::Unknown => {}
        }

        marks.insert(table.to_string(), Mark::Validating);
        if let Some(filter) = cfg.filtered_tables.get(table) {
            for dependency in &filter.uses {
                if let Err(e) = visit(cfg, dependency, marks, order) {
                    marks.insert(table.to_string(), Mark::Invalid);
                    return Err(e);
                }
            }
        }
        marks.insert(table.to_string(), Mark::Valid);

        if cfg.filtered_tables.contains_key(table) {
            order.push(table.to_string());
        }
        Ok(())
    }

    // Deterministic walk order; the dependency constraints still decide the
    // relative order of dependent tables.
    let mut tables: Vec<&String> = cfg.filtered_tables.keys().collect();
    tables.sort();

    let mut marks = HashMap::new();
    let mut order = Vec::new();
    for table in tables {
        visit(cfg, table, &mut marks, &mut order)?;
    }
    Ok(order)
}
