// ABOUTME: Streaming COPY transport between source and target databases
// ABOUTME: Pipes COPY text rows with line buffering and progress reporting

use anyhow::{Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, TryStreamExt};
use tokio_postgres::{Client, CopyInSink, CopyOutStream, Transaction};

const SEND_BUFFER_SIZE: usize = 64 * 1024;

/// Accumulates COPY text chunks and yields complete rows.
///
/// COPY text escapes embedded tabs and newlines, so a raw `\n` byte only
/// ever appears as a row terminator and a raw `\t` only as a field
/// separator.
pub(crate) struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    pub(crate) fn new() -> Self {
        LineBuffer {
            buf: BytesMut::new(),
        }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete row, without its terminating newline.
    pub(crate) fn next_line(&mut self) -> Option<Bytes> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let line = self.buf.split_to(pos + 1);
        Some(line.freeze().slice(0..pos))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Row counter whose reporting cadence widens by decade: every 10 000 rows
/// up to 100 000, every 100 000 up to 1 000 000, every 500 000 thereafter.
pub(crate) struct CopyProgress {
    rows: u64,
    next_report: u64,
}

fn report_interval(rows: u64) -> u64 {
    if rows < 100_000 {
        10_000
    } else if rows < 1_000_000 {
        100_000
    } else {
        500_000
    }
}

impl CopyProgress {
    pub(crate) fn new() -> Self {
        CopyProgress {
            rows: 0,
            next_report: 10_000,
        }
    }

    pub(crate) fn observe_row(&mut self) {
        self.rows += 1;
        if self.rows == self.next_report {
            tracing::info!("Read {} rows", self.rows);
            self.next_report += report_interval(self.rows);
        }
    }
}

/// Pipe a COPY OUT stream into a COPY IN sink row by row, applying `rewrite`
/// to each row line. Returns the row count reported by the target.
pub(crate) async fn pipe_lines(
    stream: CopyOutStream,
    sink: CopyInSink<Bytes>,
    rewrite: &(dyn Fn(&[u8]) -> Vec<u8> + Sync),
) -> Result<u64> {
    tokio::pin!(stream);
    tokio::pin!(sink);

    let mut lines = LineBuffer::new();
    let mut progress = CopyProgress::new();
    let mut out = BytesMut::with_capacity(SEND_BUFFER_SIZE);

    while let Some(chunk) = stream.try_next().await.context("source copy failed")? {
        lines.push(&chunk);
        while let Some(line) = lines.next_line() {
            out.extend_from_slice(&rewrite(&line));
            out.put_u8(b'\n');
            progress.observe_row();
            if out.len() >= SEND_BUFFER_SIZE {
                sink.send(out.split().freeze())
                    .await
                    .context("target copy failed")?;
            }
        }
    }
    if !lines.is_empty() {
        anyhow::bail!("source copy ended mid-row");
    }
    if !out.is_empty() {
        sink.send(out.split().freeze())
            .await
            .context("target copy failed")?;
    }

    let rows = sink.finish().await.context("target copy failed")?;
    Ok(rows)
}

/// Send pre-built COPY text rows into a table within a transaction and
/// return the row count reported by the target.
pub(crate) async fn copy_lines_into(
    tx: &Transaction<'_>,
    table: &str,
    lines: &[Bytes],
) -> Result<u64> {
    let sink = tx
        .copy_in(&format!("copy {} from stdin", table))
        .await
        .with_context(|| format!("failed to start copy into {}", table))?;
    tokio::pin!(sink);

    let mut out = BytesMut::with_capacity(SEND_BUFFER_SIZE);
    for line in lines {
        out.extend_from_slice(line);
        out.put_u8(b'\n');
        if out.len() >= SEND_BUFFER_SIZE {
            sink.send(out.split().freeze())
                .await
                .with_context(|| format!("copy into {} failed", table))?;
        }
    }
    if !out.is_empty() {
        sink.send(out.split().freeze())
            .await
            .with_context(|| format!("copy into {} failed", table))?;
    }

    sink.finish()
        .await
        .with_context(|| format!("copy into {} failed", table))
}

/// Replace the target table's contents with a streaming copy of the source,
/// all within one target-side transaction.
pub async fn copy_full_table(
    source: &Client,
    target: &mut Client,
    table: &str,
    where_clause: &str,
    rewrite: &(dyn Fn(&[u8]) -> Vec<u8> + Sync),
) -> Result<u64> {
    let where_sql = if where_clause.is_empty() {
        String::new()
    } else {
        format!(" where {}", where_clause)
    };

    let tx = target
        .transaction()
        .await
        .context("failed to begin target transaction")?;

    tx.execute(&format!("delete from {}{}", table, where_sql), &[])
        .await
        .context("failed to delete old data")?;

    tracing::info!("Running streaming copy");
    let stream = source
        .copy_out(&format!(
            "copy (select * from {}{}) to stdout",
            table, where_sql
        ))
        .await
        .with_context(|| format!("failed to start copy from {}", table))?;
    let sink = tx
        .copy_in(&format!("copy {} from stdin", table))
        .await
        .with_context(|| format!("failed to start copy into {}", table))?;

    let rows = pipe_lines(stream, sink, rewrite).await?;

    tx.commit()
        .await
        .context("failed to commit full table copy")?;
    tracing::info!("Done reading, {} rows in total", rows);
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_splits_rows() {
        let mut buf = LineBuffer::new();
        buf.push(b"1\ta\n2\tb\n");
        assert_eq!(buf.next_line().as_deref(), Some(b"1\ta".as_ref()));
        assert_eq!(buf.next_line().as_deref(), Some(b"2\tb".as_ref()));
        assert_eq!(buf.next_line(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_line_buffer_handles_chunk_boundaries() {
        let mut buf = LineBuffer::new();
        buf.push(b"1\tfirst");
        assert_eq!(buf.next_line(), None);
        buf.push(b" half\n2\tsecond\n");
        assert_eq!(buf.next_line().as_deref(), Some(b"1\tfirst half".as_ref()));
        assert_eq!(buf.next_line().as_deref(), Some(b"2\tsecond".as_ref()));
        assert_eq!(buf.next_line(), None);
    }

    #[test]
    fn test_line_buffer_keeps_partial_tail() {
        let mut buf = LineBuffer::new();
        buf.push(b"1\ta\n2\tpart");
        assert_eq!(buf.next_line().as_deref(), Some(b"1\ta".as_ref()));
        assert_eq!(buf.next_line(), None);
        assert!(!buf.is_empty());
    }

    #[test]
    fn test_report_interval_decades() {
        assert_eq!(report_interval(0), 10_000);
        assert_eq!(report_interval(99_999), 10_000);
        assert_eq!(report_interval(100_000), 100_000);
        assert_eq!(report_interval(999_999), 100_000);
        assert_eq!(report_interval(1_000_000), 500_000);
        assert_eq!(report_interval(5_000_000), 500_000);
    }
}
