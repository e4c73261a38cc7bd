// ABOUTME: Source catalog introspection and target table materialization
// ABOUTME: Produces canonical DDL strings, column lists and index definitions

use anyhow::{Context, Result};
use tokio_postgres::Client;

/// Split a dotted table path into namespace and table name. A path with no
/// dot defaults to the "public" namespace. Only the first dot splits.
pub fn split_table_path(path: &str) -> (&str, &str) {
    match path.split_once('.') {
        Some((namespace, table)) => (namespace, table),
        None => ("public", path),
    }
}

/// An index on a replicated table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableIndex {
    pub name: String,
    pub is_primary: bool,
    pub columns: Vec<String>,
}

/// A column of a replicated table, in catalog ordinal order.
#[derive(Debug, Clone)]
pub struct TableColumn {
    pub name: String,
    pub type_name: String,
}

impl TableColumn {
    /// True for the integer types a primary key may use.
    pub fn is_integer(&self) -> bool {
        matches!(self.type_name.as_str(), "smallint" | "integer" | "bigint")
    }

    /// True for the string types a primary key may use.
    pub fn is_text(&self) -> bool {
        self.type_name == "text"
            || self.type_name == "name"
            || self.type_name.starts_with("character")
    }

    /// True for timestamp columns, with or without time zone.
    pub fn is_timestamp(&self) -> bool {
        self.type_name.starts_with("timestamp")
    }

    /// True for timestamp-with-time-zone columns.
    pub fn is_timestamptz(&self) -> bool {
        self.type_name.starts_with("timestamp") && self.type_name.ends_with("with time zone")
    }
}

/// Extract a canonical `create table` statement for a table, deterministic
/// in column order by catalog ordinal. Comparing these strings between the
/// source and target detects schema drift.
pub async fn extract_table_schema(conn: &Client, table_path: &str) -> Result<String> {
    let (namespace, table) = split_table_path(table_path);

    let row = conn
        .query_one(
            r#"
    select
        'create table ' || relname || '(' ||
        array_to_string(
            array_agg(
                column_name || ' ' || type || ' ' || not_null
            )
            , ','
        ) || ');'
    from
    (
        select
                n.nspname || '.' || c.relname as relname, a.attname as column_name,
                pg_catalog.format_type(a.atttypid, a.atttypmod) as type,
                case
                    when a.attnotnull
                        then 'not null'
                    else 'null'
                end
            as not_null
        from
            pg_class c,
            pg_attribute a,
            pg_type t,
            pg_catalog.pg_namespace n
        where
            c.relname = $2
            and n.nspname = $1
            and a.attnum > 0
            and a.attrelid = c.oid
            and a.atttypid = t.oid
            and n.oid = c.relnamespace
        order by a.attnum
    ) as "schema"
    group by
        relname
    "#,
            &[&namespace, &table],
        )
        .await
        .with_context(|| format!("Failed to scan schema for table {}", table_path))?;

    Ok(row.get(0))
}

/// List a table's columns in ordinal order together with their formatted
/// types. The engine uses this to locate key and timestamp columns inside
/// COPY rows.
pub async fn extract_table_columns(conn: &Client, table_path: &str) -> Result<Vec<TableColumn>> {
    let (namespace, table) = split_table_path(table_path);

    let rows = conn
        .query(
            r#"
    select
        a.attname,
        pg_catalog.format_type(a.atttypid, a.atttypmod)
    from
        pg_catalog.pg_attribute a
        join pg_catalog.pg_class c on a.attrelid = c.oid
        join pg_catalog.pg_namespace n on c.relnamespace = n.oid
    where
        n.nspname = $1
        and c.relname = $2
        and a.attnum > 0
        and not a.attisdropped
    order by
        a.attnum
    "#,
            &[&namespace, &table],
        )
        .await
        .with_context(|| format!("Failed to list columns for table {}", table_path))?;

    Ok(rows
        .iter()
        .map(|row| TableColumn {
            name: row.get(0),
            type_name: row.get(1),
        })
        .collect())
}

/// Extract the indices defined on a table, ordered by name.
pub async fn extract_table_indices(conn: &Client, table_path: &str) -> Result<Vec<TableIndex>> {
    let (namespace, table) = split_table_path(table_path);

    let rows = conn
        .query(
            r#"
    select
        i.relname as index_name,
        ix.indisprimary as is_primary,
        array_agg(a.attname)::text[] as columns
    from
        pg_class t,
        pg_class i,
        pg_index ix,
        pg_attribute a,
        pg_catalog.pg_namespace n
    where
        t.oid = ix.indrelid
        and i.oid = ix.indexrelid
        and a.attrelid = t.oid
        and a.attnum = any(ix.indkey)
        and t.relkind = 'r'
        and n.oid = t.relnamespace
        and n.nspname = $1
        and t.relname = $2
    group by
        1, 2
    order by
        1, 2
    "#,
            &[&namespace, &table],
        )
        .await
        .with_context(|| format!("Failed to list indices for table {}", table_path))?;

    Ok(rows
        .iter()
        .map(|row| TableIndex {
            name: row.get(0),
            is_primary: row.get(1),
            columns: row.get(2),
        })
        .collect())
}

/// Check whether a relation exists.
pub async fn object_exists(conn: &Client, table_path: &str) -> Result<bool> {
    let row = conn
        .query_one("select to_regclass($1) is not null", &[&table_path])
        .await
        .context("existence check failed")?;
    Ok(row.get(0))
}

/// Create a table from its canonical DDL, creating the namespace first.
pub async fn create_table(conn: &Client, table_path: &str, schema: &str) -> Result<()> {
    let (namespace, _) = split_table_path(table_path);
    conn.execute(&format!("create schema if not exists {}", namespace), &[])
        .await
        .with_context(|| format!("failed to create namespace {}", namespace))?;
    conn.execute(schema, &[])
        .await
        .with_context(|| format!("failed to create table {}", table_path))?;
    Ok(())
}

/// Drop a table ahead of a forced re-materialization.
pub async fn drop_table(conn: &Client, table_path: &str) -> Result<()> {
    conn.execute(&format!("drop table {}", table_path), &[])
        .await
        .with_context(|| format!("failed to drop table {}", table_path))?;
    Ok(())
}

fn index_ddl(table_path: &str, index: &TableIndex) -> String {
    let directive = if index.is_primary { "unique " } else { "" };
    format!(
        "create {}index concurrently if not exists {} on {} ({})",
        directive,
        index.name,
        table_path,
        index.columns.join(",")
    )
}

/// Replicate the source indices onto the target. Primary indices become
/// unique indices; the target has no primary key constraint of its own.
pub async fn apply_indices(conn: &Client, table_path: &str, indices: &[TableIndex]) -> Result<()> {
    for index in indices {
        conn.execute(&index_ddl(table_path, index), &[])
            .await
            .with_context(|| format!("failed to create index {}", index.name))?;
    }
    Ok(())
}

/// The sorted primary key column names, derived from the primary index.
pub fn primary_key_columns(indices: &[TableIndex]) -> Option<Vec<String>> {
    indices.iter().find(|ix| ix.is_primary).map(|ix| {
        let mut columns = ix.columns.clone();
        columns.sort();
        columns
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_table_path() {
        assert_eq!(split_table_path("public.users"), ("public", "users"));
        assert_eq!(split_table_path("users"), ("public", "users"));
        assert_eq!(split_table_path("a.b.c"), ("a", "b.c"));
    }

    #[test]
    fn test_index_ddl_primary_is_unique() {
        let index = TableIndex {
            name: "users_pkey".into(),
            is_primary: true,
            columns: vec!["id".into()],
        };
        assert_eq!(
            index_ddl("public.users", &index),
            "create unique index concurrently if not exists users_pkey on public.users (id)"
        );
    }

    #[test]
    fn test_index_ddl_secondary() {
        let index = TableIndex {
            name: "users_name_idx".into(),
            is_primary: false,
            columns: vec!["name".into(), "email".into()],
        };
        assert_eq!(
            index_ddl("public.users", &index),
            "create index concurrently if not exists users_name_idx on public.users (name,email)"
        );
    }

    #[test]
    fn test_primary_key_columns_sorted() {
        let indices = vec![
            TableIndex {
                name: "t_extra_idx".into(),
                is_primary: false,
                columns: vec!["v".into()],
            },
            TableIndex {
                name: "t_pkey".into(),
                is_primary: true,
                columns: vec!["zone".into(), "id".into()],
            },
        ];
        assert_eq!(
            primary_key_columns(&indices),
            Some(vec!["id".to_string(), "zone".to_string()])
        );
    }

    #[test]
    fn test_primary_key_columns_missing() {
        assert_eq!(primary_key_columns(&[]), None);
    }

    #[test]
    fn test_column_type_classification() {
        let int_col = TableColumn {
            name: "id".into(),
            type_name: "bigint".into(),
        };
        let varchar_col = TableColumn {
            name: "name".into(),
            type_name: "character varying(512)".into(),
        };
        let ts_col = TableColumn {
            name: "at".into(),
            type_name: "timestamp without time zone".into(),
        };
        let tstz_col = TableColumn {
            name: "at_tz".into(),
            type_name: "timestamp with time zone".into(),
        };
        assert!(int_col.is_integer() && !int_col.is_text());
        assert!(varchar_col.is_text() && !varchar_col.is_integer());
        assert!(ts_col.is_timestamp() && !ts_col.is_timestamptz());
        assert!(tstz_col.is_timestamp() && tstz_col.is_timestamptz());
    }
}
