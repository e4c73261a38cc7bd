// ABOUTME: Polymorphic primary key model for integer and string valued keys
// ABOUTME: Handles database binding and scanning plus SQL literal rendering

use bytes::BytesMut;
use std::cmp::Ordering;
use std::error::Error;
use std::fmt;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, ToSql, Type};

/// A single primary key value, either a 64-bit integer or a string.
///
/// Keys of any other database type are rejected during decoding; the engine
/// only walks key spaces it can order and render.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PrimaryKey {
    Int(i64),
    Text(String),
}

impl PrimaryKey {
    /// Render the key as a SQL literal for interpolation into COPY queries,
    /// which cannot carry bind parameters. String content is escaped by
    /// doubling single quotes.
    pub fn sql_literal(&self) -> String {
        match self {
            PrimaryKey::Int(v) => v.to_string(),
            PrimaryKey::Text(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryKey::Int(v) => write!(f, "{}", v),
            PrimaryKey::Text(s) => write!(f, "{}", s),
        }
    }
}

impl PartialOrd for PrimaryKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrimaryKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (PrimaryKey::Int(a), PrimaryKey::Int(b)) => a.cmp(b),
            (PrimaryKey::Text(a), PrimaryKey::Text(b)) => a.cmp(b),
            (PrimaryKey::Int(_), PrimaryKey::Text(_)) => Ordering::Less,
            (PrimaryKey::Text(_), PrimaryKey::Int(_)) => Ordering::Greater,
        }
    }
}

impl<'a> FromSql<'a> for PrimaryKey {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        match *ty {
            Type::INT2 => Ok(PrimaryKey::Int(i16::from_sql(ty, raw)? as i64)),
            Type::INT4 => Ok(PrimaryKey::Int(i32::from_sql(ty, raw)? as i64)),
            Type::INT8 => Ok(PrimaryKey::Int(i64::from_sql(ty, raw)?)),
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
                Ok(PrimaryKey::Text(String::from_sql(ty, raw)?))
            }
            _ => Err(format!("Unhandled primary key type: {}", ty).into()),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // Accept everything so unsupported key types surface as a decode
        // error naming the offending type rather than a generic mismatch.
        true
    }
}

impl ToSql for PrimaryKey {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            PrimaryKey::Int(v) => match *ty {
                Type::INT2 => i16::try_from(*v)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*v)?.to_sql(ty, out),
                Type::INT8 => v.to_sql(ty, out),
                _ => Err(format!("Unhandled primary key type: {}", ty).into()),
            },
            PrimaryKey::Text(s) => match *ty {
                Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
                    s.as_str().to_sql(ty, out)
                }
                _ => Err(format!("Unhandled primary key type: {}", ty).into()),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// The primary key values of a single row, one entry per key column.
///
/// Columns are always carried in the lexicographically sorted order of the
/// key column names, so key sets from state, hashing and range walks compare
/// consistently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKeySet(pub Vec<PrimaryKey>);

impl PrimaryKeySet {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PrimaryKey> {
        self.0.iter()
    }
}

impl fmt::Display for PrimaryKeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, key) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", key)?;
        }
        write!(f, ")")
    }
}

/// The lower bound of a table's key space and its row count, optionally
/// under a filter predicate.
#[derive(Debug, Clone)]
pub struct KeyRange {
    pub min: PrimaryKeySet,
    pub count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_key_ordering() {
        assert!(PrimaryKey::Int(1) < PrimaryKey::Int(2));
        assert_eq!(PrimaryKey::Int(5), PrimaryKey::Int(5));
    }

    #[test]
    fn test_text_key_ordering() {
        assert!(PrimaryKey::Text("a".into()) < PrimaryKey::Text("b".into()));
        assert_eq!(
            PrimaryKey::Text("x".into()),
            PrimaryKey::Text("x".into())
        );
    }

    #[test]
    fn test_sql_literal() {
        assert_eq!(PrimaryKey::Int(42).sql_literal(), "42");
        assert_eq!(PrimaryKey::Text("abc".into()).sql_literal(), "'abc'");
        assert_eq!(
            PrimaryKey::Text("o'brien".into()).sql_literal(),
            "'o''brien'"
        );
    }

    #[test]
    fn test_key_set_equality() {
        let a = PrimaryKeySet(vec![PrimaryKey::Int(1), PrimaryKey::Text("x".into())]);
        let b = PrimaryKeySet(vec![PrimaryKey::Int(1), PrimaryKey::Text("x".into())]);
        let c = PrimaryKeySet(vec![PrimaryKey::Int(1)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_key_set_display() {
        let set = PrimaryKeySet(vec![PrimaryKey::Int(7), PrimaryKey::Text("abc".into())]);
        assert_eq!(set.to_string(), "(7, abc)");
    }
}
