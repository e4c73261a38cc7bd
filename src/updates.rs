// ABOUTME: Incremental update engine driven by the source's xmin row versions
// ABOUTME: Pulls changed rows in version order and applies them in chunks

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::TryStreamExt;
use tokio_postgres::types::ToSql;
use tokio_postgres::Transaction;

use crate::copy::{copy_lines_into, LineBuffer};
use crate::job::SyncRun;
use crate::keys::{PrimaryKey, PrimaryKeySet};
use crate::postgres::{and_where, where_prefix};
use crate::schema::TableColumn;
use crate::throttle::Throttle;

/// Rows are deleted in batches to stay inside the bind parameter limit.
const DELETE_BATCH: usize = 1000;

/// The sentinel for "+infinity": 100 times the 32-bit Unix epoch limit.
const POSITIVE_INFINITY_SECS: i64 = i32::MAX as i64 * 100;

/// The xmin interval a single update pass covers. Empty iff the start
/// exceeds the end.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateRange {
    pub full_table: bool,
    pub start_xmin: u64,
    pub end_xmin: u64,
}

impl UpdateRange {
    pub fn is_empty(&self) -> bool {
        self.start_xmin > self.end_xmin
    }
}

/// Row count of a table, optionally under a filter predicate.
pub(crate) async fn get_table_length(
    client: &tokio_postgres::Client,
    table: &str,
    where_clause: &str,
) -> Result<u64> {
    let q = format!(
        "select count(*) from {} {}",
        table,
        where_prefix(where_clause)
    );
    let row = client
        .query_one(&q, &[])
        .await
        .with_context(|| format!("failed to count rows in {}", table))?;
    Ok(row.get::<_, i64>(0) as u64)
}

impl SyncRun<'_> {
    /// Determine what the next update pass has to do for a table: nothing,
    /// an incremental xmin interval, or a full copy for cold or badly
    /// drifted targets.
    pub(crate) async fn get_update_range(
        &self,
        table: &str,
        where_clause: &str,
    ) -> Result<UpdateRange> {
        let mut range = UpdateRange::default();

        let state = self.state.get(&self.target, table).await?;
        if self.force_sync.contains(table) || state.last_seen_xmin == 0 {
            range.full_table = true;
        } else {
            range.start_xmin = state.last_seen_xmin + 1;
        }

        let q = format!(
            "select count(*), max(xmin::text::bigint) from {} {}",
            table,
            where_prefix(where_clause)
        );
        let row = self
            .source
            .query_one(&q, &[])
            .await
            .with_context(|| format!("failed to get update range for {}", table))?;
        let source_length = row.get::<_, i64>(0) as u64;
        range.end_xmin = row.get::<_, Option<i64>>(1).unwrap_or(0) as u64;

        let target_length = get_table_length(&self.target, table, where_clause).await?;
        if (target_length as f64) < (source_length as f64) * self.cfg.full_copy_threshold {
            range.full_table = true;
        }

        Ok(range)
    }

    /// Pull rows with xmin inside the range in (xmin, key) order and apply
    /// them chunk by chunk, advancing the persisted cursor after each chunk.
    ///
    /// A row version is only checkpointed once a strictly greater version
    /// has been observed, so a chunk whose rows all share one xmin advances
    /// via the offset instead.
    pub(crate) async fn update_table_range(
        &mut self,
        table: &str,
        primary_keys: &[String],
        range: &UpdateRange,
        where_clause: &str,
    ) -> Result<()> {
        tracing::info!(
            "Updating table {} from {} to {}",
            table,
            range.start_xmin,
            range.end_xmin
        );
        let mut throttle = Throttle::new("update sync", self.cfg.throttle_percentage);

        let columns = self
            .columns
            .get(table)
            .with_context(|| format!("no column info for table {}", table))?
            .clone();
        let key_indices = key_column_indices(&columns, primary_keys)?;
        let order_clause = primary_keys
            .iter()
            .map(|key| format!("{} asc", key))
            .collect::<Vec<_>>()
            .join(",");

        let mut xmin = range.start_xmin;
        let mut offset: u64 = 0;

        while xmin <= range.end_xmin {
            throttle.start();

            let q = format!(
                "copy (
                    select xmin::text::bigint, *
                    from {table}
                    where xmin::text::bigint >= {xmin} {filter}
                    order by xmin::text::bigint asc, {order}
                    offset {offset} limit {limit}
                ) to stdout",
                table = table,
                xmin = xmin,
                filter = and_where(where_clause),
                order = order_clause,
                offset = offset,
                limit = self.cfg.update_chunk_size,
            );

            tracing::info!("Reading from source");
            let mut rows: Vec<Bytes> = Vec::new();
            let mut keys: Vec<PrimaryKeySet> = Vec::new();
            let mut last_complete_xmin = 0u64;
            {
                let stream = self
                    .source
                    .copy_out(&q)
                    .await
                    .context("query execution failure")?;
                tokio::pin!(stream);

                let mut lines = LineBuffer::new();
                while let Some(chunk) = stream.try_next().await.context("row failure")? {
                    lines.push(&chunk);
                    while let Some(line) = lines.next_line() {
                        let (row_xmin, row) = split_leading_xmin(&line)?;
                        if row_xmin == xmin {
                            offset += 1;
                        } else {
                            last_complete_xmin = xmin;
                            xmin = row_xmin;
                            offset = 1;
                        }
                        let row = rewrite_infinite_dates(&columns, row);
                        keys.push(parse_key_set(&columns, &key_indices, &row)?);
                        rows.push(Bytes::from(row));
                    }
                }
            }
            throttle.end();
            throttle.wait().await;

            if !rows.is_empty() {
                tracing::info!("Writing to target");
                self.apply_updates(table, primary_keys, &keys, &rows)
                    .await
                    .context("failed to apply updates")?;
                self.updated_rows += rows.len() as u64;
            } else {
                last_complete_xmin = xmin;
                xmin += 1;
            }

            if last_complete_xmin != 0 {
                self.state
                    .set_xmin(&self.target, table, last_complete_xmin)
                    .await?;
            }
        }

        Ok(())
    }

    /// Apply one chunk inside a single target transaction: delete the
    /// affected keys, bulk-copy the chunk, and verify the copied row count.
    /// Re-running the same chunk deletes then re-inserts identical rows, so
    /// the step is idempotent.
    async fn apply_updates(
        &mut self,
        table: &str,
        primary_keys: &[String],
        keys: &[PrimaryKeySet],
        rows: &[Bytes],
    ) -> Result<()> {
        let tx = self
            .target
            .transaction()
            .await
            .context("failed to begin target transaction")?;

        delete_keys(&tx, table, primary_keys, keys).await?;

        let copied = copy_lines_into(&tx, table, rows).await?;
        if copied != rows.len() as u64 {
            bail!("unexpected row count, {} != {}", copied, rows.len());
        }

        tx.commit()
            .await
            .context("failed to commit update chunk")?;
        Ok(())
    }
}

/// Delete rows from the target by primary key set, batched.
pub(crate) async fn delete_keys(
    tx: &Transaction<'_>,
    table: &str,
    primary_keys: &[String],
    keys: &[PrimaryKeySet],
) -> Result<()> {
    for chunk in keys.chunks(DELETE_BATCH) {
        if primary_keys.len() == 1 {
            let values: Vec<&PrimaryKey> = chunk.iter().map(|key| &key.0[0]).collect();
            let q = single_key_delete_query(table, &primary_keys[0]);
            tx.execute(&q, &[&values])
                .await
                .with_context(|| format!("failed to delete rows from {}", table))?;
        } else {
            let q = composite_key_delete_query(table, primary_keys, chunk.len());
            let params: Vec<&(dyn ToSql + Sync)> = chunk
                .iter()
                .flat_map(|key| key.iter().map(|k| k as &(dyn ToSql + Sync)))
                .collect();
            tx.execute(&q, &params)
                .await
                .with_context(|| format!("failed to delete rows from {}", table))?;
        }
    }
    Ok(())
}

fn single_key_delete_query(table: &str, primary_key: &str) -> String {
    format!("delete from {} where {} = any($1)", table, primary_key)
}

fn composite_key_delete_query(table: &str, primary_keys: &[String], rows: usize) -> String {
    let width = primary_keys.len();
    let tuples: Vec<String> = (0..rows)
        .map(|row| {
            let placeholders: Vec<String> = (0..width)
                .map(|col| format!("${}", row * width + col + 1))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();
    format!(
        "delete from {} where ({}) in ({})",
        table,
        primary_keys.join(", "),
        tuples.join(", ")
    )
}

/// Split the leading xmin field off a COPY row produced by the chunk query.
fn split_leading_xmin(line: &[u8]) -> Result<(u64, &[u8])> {
    let pos = line
        .iter()
        .position(|&b| b == b'\t')
        .context("malformed copy row: missing xmin column")?;
    let xmin = std::str::from_utf8(&line[..pos])
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .context("malformed copy row: bad xmin value")?;
    Ok((xmin, &line[pos + 1..]))
}

/// Positions of the primary key columns within the table's column order.
pub(crate) fn key_column_indices(
    columns: &[TableColumn],
    primary_keys: &[String],
) -> Result<Vec<usize>> {
    primary_keys
        .iter()
        .map(|key| {
            columns
                .iter()
                .position(|col| &col.name == key)
                .with_context(|| format!("primary key column {} not found", key))
        })
        .collect()
}

/// Decode the primary key values of a COPY row.
pub(crate) fn parse_key_set(
    columns: &[TableColumn],
    key_indices: &[usize],
    row: &[u8],
) -> Result<PrimaryKeySet> {
    let fields: Vec<&[u8]> = row.split(|&b| b == b'\t').collect();
    let mut keys = Vec::with_capacity(key_indices.len());

    for &index in key_indices {
        let column = &columns[index];
        let field = *fields
            .get(index)
            .with_context(|| format!("row has no field for key column {}", column.name))?;
        if field == b"\\N" {
            bail!("null value in primary key column {}", column.name);
        }
        let key = if column.is_integer() {
            let text = std::str::from_utf8(field).context("non-utf8 key value")?;
            PrimaryKey::Int(
                text.parse()
                    .with_context(|| format!("bad integer key value {:?}", text))?,
            )
        } else if column.is_text() {
            PrimaryKey::Text(unescape_copy_field(field)?)
        } else {
            bail!("Unhandled primary key type: {}", column.type_name);
        };
        keys.push(key);
    }

    Ok(PrimaryKeySet(keys))
}

/// Undo COPY text escaping for a single field.
fn unescape_copy_field(field: &[u8]) -> Result<String> {
    let mut out = Vec::with_capacity(field.len());
    let mut bytes = field.iter();
    while let Some(&b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'b') => out.push(8),
            Some(b'f') => out.push(12),
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b't') => out.push(b'\t'),
            Some(b'v') => out.push(11),
            Some(&other) => out.push(other),
            None => bail!("dangling escape in copy field"),
        }
    }
    String::from_utf8(out).context("non-utf8 key value")
}

/// Replace infinity markers in timestamp fields with finite sentinels:
/// positive infinity becomes 100 times the 32-bit epoch limit, negative
/// infinity becomes the epoch itself.
pub(crate) fn rewrite_infinite_dates(columns: &[TableColumn], line: &[u8]) -> Vec<u8> {
    if !columns.iter().any(|col| col.is_timestamp()) {
        return line.to_vec();
    }

    let mut fields: Vec<Vec<u8>> = line.split(|&b| b == b'\t').map(|f| f.to_vec()).collect();
    for (i, column) in columns.iter().enumerate() {
        if !column.is_timestamp() {
            continue;
        }
        let Some(field) = fields.get_mut(i) else {
            continue;
        };
        let replacement = match field.as_slice() {
            b"infinity" => Some(infinity_sentinel(column.is_timestamptz(), false)),
            b"-infinity" => Some(infinity_sentinel(column.is_timestamptz(), true)),
            _ => None,
        };
        if let Some(replacement) = replacement {
            *field = replacement.into_bytes();
        }
    }
    fields.join(&b'\t')
}

fn infinity_sentinel(with_time_zone: bool, negative: bool) -> String {
    let secs = if negative { 0 } else { POSITIVE_INFINITY_SECS };
    let sentinel =
        chrono::DateTime::from_timestamp(secs, 0).expect("sentinel timestamp in range");
    if with_time_zone {
        sentinel.format("%Y-%m-%d %H:%M:%S+00").to_string()
    } else {
        sentinel.naive_utc().format("%Y-%m-%d %H:%M:%S").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, type_name: &str) -> TableColumn {
        TableColumn {
            name: name.into(),
            type_name: type_name.into(),
        }
    }

    #[test]
    fn test_update_range_empty() {
        let range = UpdateRange {
            full_table: false,
            start_xmin: 10,
            end_xmin: 9,
        };
        assert!(range.is_empty());
        let range = UpdateRange {
            full_table: false,
            start_xmin: 10,
            end_xmin: 10,
        };
        assert!(!range.is_empty());
    }

    #[test]
    fn test_split_leading_xmin() {
        let (xmin, rest) = split_leading_xmin(b"1234\t1\thello").unwrap();
        assert_eq!(xmin, 1234);
        assert_eq!(rest, b"1\thello");
    }

    #[test]
    fn test_split_leading_xmin_rejects_garbage() {
        assert!(split_leading_xmin(b"no-tabs-here").is_err());
        assert!(split_leading_xmin(b"abc\tv").is_err());
    }

    #[test]
    fn test_single_key_delete_query() {
        assert_eq!(
            single_key_delete_query("public.t", "id"),
            "delete from public.t where id = any($1)"
        );
    }

    #[test]
    fn test_composite_key_delete_query() {
        assert_eq!(
            composite_key_delete_query("public.t", &["a".into(), "b".into()], 2),
            "delete from public.t where (a, b) in (($1, $2), ($3, $4))"
        );
    }

    #[test]
    fn test_key_column_indices() {
        let columns = vec![
            column("id", "integer"),
            column("zone", "text"),
            column("v", "text"),
        ];
        let indices = key_column_indices(&columns, &["id".into(), "zone".into()]).unwrap();
        assert_eq!(indices, vec![0, 1]);
        assert!(key_column_indices(&columns, &["missing".into()]).is_err());
    }

    #[test]
    fn test_parse_key_set_composite() {
        let columns = vec![
            column("id", "integer"),
            column("zone", "text"),
            column("v", "text"),
        ];
        let keys = parse_key_set(&columns, &[0, 1], b"42\twest\tpayload").unwrap();
        assert_eq!(
            keys,
            PrimaryKeySet(vec![PrimaryKey::Int(42), PrimaryKey::Text("west".into())])
        );
    }

    #[test]
    fn test_parse_key_set_unescapes_text() {
        let columns = vec![column("name", "text"), column("v", "text")];
        let keys = parse_key_set(&columns, &[0], b"a\\tb\tpayload").unwrap();
        assert_eq!(keys, PrimaryKeySet(vec![PrimaryKey::Text("a\tb".into())]));
    }

    #[test]
    fn test_parse_key_set_rejects_unsupported_type() {
        let columns = vec![column("id", "numeric(10,2)")];
        let err = parse_key_set(&columns, &[0], b"1.5").unwrap_err();
        assert!(err.to_string().contains("Unhandled primary key type"));
    }

    #[test]
    fn test_parse_key_set_rejects_null_key() {
        let columns = vec![column("id", "integer")];
        assert!(parse_key_set(&columns, &[0], b"\\N").is_err());
    }

    #[test]
    fn test_unescape_copy_field() {
        assert_eq!(unescape_copy_field(b"plain").unwrap(), "plain");
        assert_eq!(unescape_copy_field(b"a\\tb").unwrap(), "a\tb");
        assert_eq!(unescape_copy_field(b"a\\nb").unwrap(), "a\nb");
        assert_eq!(unescape_copy_field(b"a\\\\b").unwrap(), "a\\b");
        assert!(unescape_copy_field(b"bad\\").is_err());
    }

    #[test]
    fn test_rewrite_infinite_dates() {
        let columns = vec![
            column("id", "integer"),
            column("at", "timestamp without time zone"),
            column("note", "text"),
        ];
        let line = b"1\tinfinity\tinfinity";
        let fixed = rewrite_infinite_dates(&columns, line);
        let fields: Vec<&[u8]> = fixed.split(|&b| b == b'\t').collect();
        // The timestamp field is rewritten, the text field keeps its value.
        assert_ne!(fields[1], b"infinity");
        assert_eq!(fields[2], b"infinity");

        let rewritten = std::str::from_utf8(fields[1]).unwrap();
        chrono::NaiveDateTime::parse_from_str(rewritten, "%Y-%m-%d %H:%M:%S")
            .expect("sentinel parses as a timestamp");
    }

    #[test]
    fn test_rewrite_negative_infinity_is_epoch() {
        let columns = vec![column("at", "timestamp without time zone")];
        let fixed = rewrite_infinite_dates(&columns, b"-infinity");
        assert_eq!(fixed, b"1970-01-01 00:00:00");
    }

    #[test]
    fn test_rewrite_timestamptz_keeps_offset() {
        let columns = vec![column("at", "timestamp with time zone")];
        let fixed = rewrite_infinite_dates(&columns, b"infinity");
        assert!(fixed.ends_with(b"+00"));
    }

    #[test]
    fn test_rewrite_leaves_tables_without_timestamps_alone() {
        let columns = vec![column("id", "integer"), column("v", "text")];
        let line = b"1\tinfinity".to_vec();
        assert_eq!(rewrite_infinite_dates(&columns, &line), line);
    }
}
