// ABOUTME: Delete reconciliation by recursive hash comparison of key ranges
// ABOUTME: Divides the key space until divergent leaves are small, then resyncs them

use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

use crate::copy::pipe_lines;
use crate::job::SyncRun;
use crate::keys::{KeyRange, PrimaryKey, PrimaryKeySet};
use crate::postgres::{and_where, where_prefix};
use crate::throttle::Throttle;
use crate::updates::rewrite_infinite_dates;

impl SyncRun<'_> {
    /// Walk the table's key space in chunks, comparing key hashes between
    /// source and target and re-syncing the ranges that differ. This is how
    /// rows deleted on the source disappear from the target without reading
    /// either table in full.
    pub(crate) async fn sync_deleted_rows(&mut self, table: &str, where_clause: &str) -> Result<()> {
        let primary_keys = self
            .primary_keys
            .get(table)
            .with_context(|| format!("table {} does not have a primary key", table))?
            .clone();

        let key_range =
            get_primary_key_range(&self.source, table, &primary_keys, where_clause)
                .await
                .context("failed to get primary key range")?;
        let Some(key_range) = key_range else {
            tracing::debug!("No rows in {}, nothing to reconcile", table);
            return Ok(());
        };

        let chunk_size = self.cfg.delete_chunk_size.min(key_range.count);
        if chunk_size == 0 {
            return Ok(());
        }

        let mut start_key = key_range.min;
        let mut throttle = Throttle::new("deletes", self.cfg.throttle_percentage);

        loop {
            throttle.start();
            let end_key = self
                .sync_deleted_row_range(table, &primary_keys, start_key.clone(), chunk_size, where_clause)
                .await?;

            // The offset probe returns the final key when the tail runs
            // short, so reaching the start key again means the walk is done.
            if end_key == start_key {
                break;
            }
            start_key = end_key;
            throttle.end();
            throttle.wait().await;
        }

        Ok(())
    }

    /// Compare the key hash of the closed range starting at `start_key` and
    /// spanning `chunk_size` keys. On mismatch, recurse on two halves until
    /// the range is small enough to re-sync wholesale. Returns the end key
    /// of the examined range.
    fn sync_deleted_row_range<'a>(
        &'a mut self,
        table: &'a str,
        primary_keys: &'a [String],
        start_key: PrimaryKeySet,
        chunk_size: u32,
        where_clause: &'a str,
    ) -> BoxFuture<'a, Result<PrimaryKeySet>> {
        Box::pin(async move {
            let end_key = get_key_at_offset(
                &self.source,
                table,
                primary_keys,
                &start_key,
                chunk_size,
                where_clause,
            )
            .await
            .context("failed to get key at offset")?;

            let source_hash =
                get_key_hash(&self.source, table, primary_keys, &start_key, &end_key, where_clause)
                    .await
                    .context("failed to get source key hash")?;
            let target_hash =
                get_key_hash(&self.target, table, primary_keys, &start_key, &end_key, where_clause)
                    .await
                    .context("failed to get target key hash")?;

            tracing::debug!(
                "Start key: {}, end key: {}, chunk size: {}",
                start_key,
                end_key,
                chunk_size
            );
            tracing::debug!("Source hash: {}, target hash: {}", source_hash, target_hash);

            if source_hash != target_hash {
                if chunk_size <= self.cfg.min_delete_chunk_size {
                    tracing::debug!("Updating ({} - {})", start_key, end_key);
                    self.resync_key_range(table, primary_keys, &start_key, &end_key, where_clause)
                        .await
                        .context("failed to update changed range")?;
                } else {
                    let next_chunk_size = chunk_size / 2;
                    let mid_key = self
                        .sync_deleted_row_range(
                            table,
                            primary_keys,
                            start_key.clone(),
                            next_chunk_size,
                            where_clause,
                        )
                        .await?;
                    self.sync_deleted_row_range(
                        table,
                        primary_keys,
                        mid_key,
                        next_chunk_size,
                        where_clause,
                    )
                    .await?;
                }
            }

            Ok(end_key)
        })
    }

    /// Fully re-sync one divergent leaf: within a single target transaction,
    /// delete the closed key range and stream the source's rows for that
    /// range back in. Endpoint overlap between neighboring ranges is fine
    /// because the operation is idempotent.
    async fn resync_key_range(
        &mut self,
        table: &str,
        primary_keys: &[String],
        start_key: &PrimaryKeySet,
        end_key: &PrimaryKeySet,
        where_clause: &str,
    ) -> Result<()> {
        let columns = self
            .columns
            .get(table)
            .with_context(|| format!("no column info for table {}", table))?
            .clone();

        let tx = self
            .target
            .transaction()
            .await
            .context("failed to begin target transaction")?;

        let (range_clause, params) =
            where_clause_from_key_range(primary_keys, start_key, end_key);
        tx.execute(
            &format!(
                "delete from {} where {} {}",
                table,
                range_clause,
                and_where(where_clause)
            ),
            &params,
        )
        .await
        .with_context(|| format!("failed to delete range from {}", table))?;

        // COPY takes no bind parameters, so the key bounds are inlined as
        // literals here.
        let stream = self
            .source
            .copy_out(&format!(
                "copy (select * from {} where {} {}) to stdout",
                table,
                key_range_literal(primary_keys, start_key, end_key),
                and_where(where_clause)
            ))
            .await
            .with_context(|| format!("failed to start copy from {}", table))?;
        let sink = tx
            .copy_in(&format!("copy {} from stdin", table))
            .await
            .with_context(|| format!("failed to start copy into {}", table))?;

        let rewrite = |line: &[u8]| rewrite_infinite_dates(&columns, line);
        let rows = pipe_lines(stream, sink, &rewrite).await?;

        tx.commit()
            .await
            .context("failed to commit range resync")?;
        self.updated_rows += rows;
        Ok(())
    }
}

/// The minimum key of a table and its row count under the filter predicate.
/// Returns `None` for an empty table.
pub(crate) async fn get_primary_key_range(
    client: &Client,
    table: &str,
    primary_keys: &[String],
    where_clause: &str,
) -> Result<Option<KeyRange>> {
    let q = key_range_query(table, primary_keys, where_clause);
    let row = client
        .query_opt(&q, &[])
        .await
        .with_context(|| format!("failed to load primary key range ({:?}@{})", primary_keys, table))?;

    let Some(row) = row else {
        return Ok(None);
    };

    let mut min = Vec::with_capacity(primary_keys.len());
    for i in 0..primary_keys.len() {
        min.push(row.try_get::<_, PrimaryKey>(i)?);
    }
    let count: i64 = row.get(primary_keys.len());
    let count = u32::try_from(count).context("failed to convert count to int")?;

    Ok(Some(KeyRange {
        min: PrimaryKeySet(min),
        count,
    }))
}

/// Find the key `offset` ascending positions from `start_key` inclusive, or
/// the final key if fewer rows remain. The inner query walks forward in key
/// order; the outer query flips the sort and keeps the last row.
pub(crate) async fn get_key_at_offset(
    client: &Client,
    table: &str,
    primary_keys: &[String],
    start_key: &PrimaryKeySet,
    offset: u32,
    where_clause: &str,
) -> Result<PrimaryKeySet> {
    if primary_keys.len() != start_key.len() {
        bail!("key length mismatch");
    }

    let q = key_at_offset_query(table, primary_keys, where_clause);

    let limit = offset as i64;
    let mut params: Vec<&(dyn ToSql + Sync)> = vec![&limit];
    for key in start_key.iter() {
        params.push(key);
    }

    let row = client
        .query_opt(&q, &params)
        .await
        .with_context(|| format!("key offset query failed for {}", table))?;
    let Some(row) = row else {
        bail!("unexpected empty resultset");
    };

    let mut keys = Vec::with_capacity(primary_keys.len());
    for i in 0..primary_keys.len() {
        keys.push(row.try_get::<_, PrimaryKey>(i)?);
    }
    Ok(PrimaryKeySet(keys))
}

/// Hash the ordered key list of the closed range `[start_key, end_key]`.
/// An empty range hashes to the empty string on both sides.
pub(crate) async fn get_key_hash(
    client: &Client,
    table: &str,
    primary_keys: &[String],
    start_key: &PrimaryKeySet,
    end_key: &PrimaryKeySet,
    where_clause: &str,
) -> Result<String> {
    let (range_clause, params) = where_clause_from_key_range(primary_keys, start_key, end_key);
    let q = key_hash_query(table, primary_keys, &range_clause, where_clause);

    let row = client
        .query_one(&q, &params)
        .await
        .with_context(|| format!("key hash query failed for {}", table))?;
    Ok(row.get(0))
}

fn key_range_query(table: &str, primary_keys: &[String], where_clause: &str) -> String {
    let key_list = primary_keys.join(",");
    let min_order = primary_keys
        .iter()
        .map(|key| format!("{} asc", key))
        .collect::<Vec<_>>()
        .join(",");
    let filter = where_prefix(where_clause);
    format!(
        "select {keys}, (select count(*) from {table} {filter}) as cnt
         from {table}
         {filter}
         order by {min_order}
         limit 1",
        keys = key_list,
        table = table,
        filter = filter,
        min_order = min_order,
    )
}

fn key_at_offset_query(table: &str, primary_keys: &[String], where_clause: &str) -> String {
    let key_list = primary_keys.join(",");
    // Parameters after the limit in $1 start at $2.
    let key_filter = primary_keys
        .iter()
        .enumerate()
        .map(|(i, key)| format!("{} >= ${}", key, i + 2))
        .collect::<Vec<_>>()
        .join(" and ");
    let min_order = primary_keys
        .iter()
        .map(|key| format!("{} asc", key))
        .collect::<Vec<_>>()
        .join(",");
    let max_order = primary_keys
        .iter()
        .map(|key| format!("{} desc", key))
        .collect::<Vec<_>>()
        .join(",");

    format!(
        "select {keys} from
         (
            select {keys}
            from {table}
            where {key_filter} {extra}
            order by {min_order}
            limit $1
         ) ids
         order by {max_order}
         limit 1",
        keys = key_list,
        table = table,
        key_filter = key_filter,
        extra = and_where(where_clause),
        min_order = min_order,
        max_order = max_order,
    )
}

fn key_hash_query(
    table: &str,
    primary_keys: &[String],
    range_clause: &str,
    where_clause: &str,
) -> String {
    let key_list = primary_keys.join(",");
    format!(
        "select coalesce(md5(array_agg(id)::varchar), '') as hash
         from (
            select ({keys})::varchar as id
            from {table}
            where {range} {extra}
            order by {keys}
         ) as t",
        keys = key_list,
        table = table,
        range = range_clause,
        extra = and_where(where_clause),
    )
}

/// Build a parameterised filter for the closed interval [start_key, end_key]
/// along with the parameter list. Closed intervals are used because
/// incrementing composite string-valued keys is not tractable.
pub(crate) fn where_clause_from_key_range<'a>(
    primary_keys: &[String],
    start_key: &'a PrimaryKeySet,
    end_key: &'a PrimaryKeySet,
) -> (String, Vec<&'a (dyn ToSql + Sync)>) {
    let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();

    let start_filter = start_key
        .iter()
        .enumerate()
        .map(|(i, key)| {
            params.push(key);
            format!("{} >= ${}", primary_keys[i], i + 1)
        })
        .collect::<Vec<_>>()
        .join(" and ");

    let parameter_offset = 1 + params.len();
    let end_filter = end_key
        .iter()
        .enumerate()
        .map(|(i, key)| {
            params.push(key);
            format!("{} <= ${}", primary_keys[i], i + parameter_offset)
        })
        .collect::<Vec<_>>()
        .join(" and ");

    (format!("{} and {}", start_filter, end_filter), params)
}

/// The closed interval filter with the key bounds inlined as SQL literals,
/// for queries that cannot carry bind parameters.
fn key_range_literal(
    primary_keys: &[String],
    start_key: &PrimaryKeySet,
    end_key: &PrimaryKeySet,
) -> String {
    let start_filter = start_key
        .iter()
        .enumerate()
        .map(|(i, key)| format!("{} >= {}", primary_keys[i], key.sql_literal()))
        .collect::<Vec<_>>()
        .join(" and ");
    let end_filter = end_key
        .iter()
        .enumerate()
        .map(|(i, key)| format!("{} <= {}", primary_keys[i], key.sql_literal()))
        .collect::<Vec<_>>()
        .join(" and ");
    format!("{} and {}", start_filter, end_filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(values: &[PrimaryKey]) -> PrimaryKeySet {
        PrimaryKeySet(values.to_vec())
    }

    #[test]
    fn test_where_clause_from_key_range_single() {
        let start = keys(&[PrimaryKey::Int(1)]);
        let end = keys(&[PrimaryKey::Int(100)]);
        let (clause, params) = where_clause_from_key_range(&["id".into()], &start, &end);
        assert_eq!(clause, "id >= $1 and id <= $2");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_where_clause_from_key_range_composite() {
        let start = keys(&[PrimaryKey::Int(1), PrimaryKey::Text("a".into())]);
        let end = keys(&[PrimaryKey::Int(9), PrimaryKey::Text("z".into())]);
        let (clause, params) =
            where_clause_from_key_range(&["id".into(), "zone".into()], &start, &end);
        assert_eq!(
            clause,
            "id >= $1 and zone >= $2 and id <= $3 and zone <= $4"
        );
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn test_key_range_literal_escapes_strings() {
        let start = keys(&[PrimaryKey::Text("o'brien".into())]);
        let end = keys(&[PrimaryKey::Text("smith".into())]);
        assert_eq!(
            key_range_literal(&["name".into()], &start, &end),
            "name >= 'o''brien' and name <= 'smith'"
        );
    }

    #[test]
    fn test_key_at_offset_query_parameter_numbering() {
        let q = key_at_offset_query("public.t", &["a".into(), "b".into()], "");
        assert!(q.contains("a >= $2 and b >= $3"));
        assert!(q.contains("limit $1"));
        assert!(q.contains("order by a asc,b asc"));
        assert!(q.contains("order by a desc,b desc"));
    }

    #[test]
    fn test_key_hash_query_shape() {
        let q = key_hash_query("public.t", &["id".into()], "id >= $1 and id <= $2", "v > 0");
        assert!(q.contains("coalesce(md5(array_agg(id)::varchar), '')"));
        assert!(q.contains("(id)::varchar as id"));
        assert!(q.contains("id >= $1 and id <= $2 and v > 0"));
    }

    #[test]
    fn test_key_range_query_applies_filter_to_count() {
        let q = key_range_query("public.t", &["id".into()], "v > 0");
        assert!(q.contains("(select count(*) from public.t where v > 0)"));
    }
}
