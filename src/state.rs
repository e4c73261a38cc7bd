// ABOUTME: Durable per-table replication state stored in the target database
// ABOUTME: Tracks the last seen row version and filter predicate per table

use anyhow::{Context, Result};
use tokio_postgres::Client;

/// Replication cursor for a single table.
///
/// An empty state (zero xmin, empty predicate) means the table has never
/// been synced and the next run performs a full copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableState {
    pub last_seen_xmin: u64,
    pub where_clause: String,
}

/// Accessor for the state table in the target database.
///
/// The table is created lazily; all writes are single-statement upserts and
/// therefore atomic with respect to the target. Keeping state in the target
/// means backups and restores of the target also preserve the cursors.
pub struct StateStore {
    table_name: String,
}

impl StateStore {
    pub fn new(table_name: &str) -> Self {
        StateStore {
            table_name: table_name.to_string(),
        }
    }

    async fn ensure_table(&self, target: &Client) -> Result<()> {
        let q = format!(
            "create table if not exists {} (
                table_name varchar(512) primary key,
                last_seen_xmin bigint,
                where_clause varchar
            )",
            self.table_name
        );
        target
            .execute(&q, &[])
            .await
            .context("failed to setup state table")?;
        Ok(())
    }

    /// Load the state for a table, returning empty state when no row exists.
    pub async fn get(&self, target: &Client, table: &str) -> Result<TableState> {
        self.ensure_table(target).await?;

        let q = format!(
            "select last_seen_xmin, where_clause from {} where table_name = $1",
            self.table_name
        );
        let row = target
            .query_opt(&q, &[&table])
            .await
            .context("failed to load table state")?;

        match row {
            Some(row) => Ok(TableState {
                last_seen_xmin: row.get::<_, i64>(0) as u64,
                where_clause: row.get::<_, Option<String>>(1).unwrap_or_default(),
            }),
            None => Ok(TableState::default()),
        }
    }

    /// Upsert the state for a table.
    pub async fn set(&self, target: &Client, table: &str, state: &TableState) -> Result<()> {
        self.ensure_table(target).await?;

        let q = format!(
            "insert into {} (table_name, last_seen_xmin, where_clause) values ($1, $2, $3)
             on conflict (table_name)
             do update set last_seen_xmin = $2, where_clause = $3",
            self.table_name
        );
        target
            .execute(
                &q,
                &[&table, &(state.last_seen_xmin as i64), &state.where_clause],
            )
            .await
            .context("failed to set table state")?;
        Ok(())
    }

    /// Update only the cursor, preserving the stored predicate.
    pub async fn set_xmin(&self, target: &Client, table: &str, xmin: u64) -> Result<()> {
        let mut state = self.get(target, table).await?;
        state.last_seen_xmin = xmin;
        self.set(target, table, &state).await
    }

    /// Update only the stored predicate, preserving the cursor.
    pub async fn set_where(&self, target: &Client, table: &str, where_clause: &str) -> Result<()> {
        let mut state = self.get(target, table).await?;
        state.where_clause = where_clause.to_string();
        self.set(target, table, &state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_state_means_cold_start() {
        let state = TableState::default();
        assert_eq!(state.last_seen_xmin, 0);
        assert!(state.where_clause.is_empty());
    }
}
