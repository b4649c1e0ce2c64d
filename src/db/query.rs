//! Queued SQL statements
//!
//! Writers build a list of [`Query`] values first and execute them in order
//! inside one transaction. A [`SqlParam::List`] bound to a single `?`
//! expands into `?, ?, ...` so `IN(?)` works with a slice of units.

use rusqlite::types::Value;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::WriterError;

/// A bindable statement parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlParam {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    List(Vec<SqlParam>),
}

impl SqlParam {
    fn into_value(self) -> Value {
        match self {
            SqlParam::Null => Value::Null,
            SqlParam::Integer(i) => Value::Integer(i),
            SqlParam::Real(r) => Value::Real(r),
            SqlParam::Text(s) => Value::Text(s),
            // Nested lists are flattened before binding
            SqlParam::List(_) => Value::Null,
        }
    }
}

impl From<&str> for SqlParam {
    fn from(s: &str) -> Self {
        SqlParam::Text(s.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(s: String) -> Self {
        SqlParam::Text(s)
    }
}

impl From<&String> for SqlParam {
    fn from(s: &String) -> Self {
        SqlParam::Text(s.clone())
    }
}

impl From<i64> for SqlParam {
    fn from(i: i64) -> Self {
        SqlParam::Integer(i)
    }
}

impl From<u64> for SqlParam {
    fn from(i: u64) -> Self {
        SqlParam::Integer(i as i64)
    }
}

impl From<u32> for SqlParam {
    fn from(i: u32) -> Self {
        SqlParam::Integer(i64::from(i))
    }
}

impl From<usize> for SqlParam {
    fn from(i: usize) -> Self {
        SqlParam::Integer(i as i64)
    }
}

impl From<bool> for SqlParam {
    fn from(b: bool) -> Self {
        SqlParam::Integer(i64::from(b))
    }
}

impl<T: Into<SqlParam>> From<Option<T>> for SqlParam {
    fn from(o: Option<T>) -> Self {
        o.map_or(SqlParam::Null, Into::into)
    }
}

impl From<&[String]> for SqlParam {
    fn from(items: &[String]) -> Self {
        SqlParam::List(items.iter().map(SqlParam::from).collect())
    }
}

impl From<Vec<String>> for SqlParam {
    fn from(items: Vec<String>) -> Self {
        SqlParam::List(items.into_iter().map(SqlParam::Text).collect())
    }
}

/// Build a `Vec<SqlParam>` from heterogeneous values
#[macro_export]
macro_rules! sql_params {
    () => { Vec::<$crate::db::query::SqlParam>::new() };
    ($($p:expr),+ $(,)?) => {
        vec![$($crate::db::query::SqlParam::from($p)),+]
    };
}

/// A statement with its parameters, ready to run on a connection
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl Query {
    pub fn new(sql: impl Into<String>, params: Vec<SqlParam>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// `INSERT` or `INSERT OR IGNORE` into `table`
    pub fn insert(table: &str, columns: &[&str], params: Vec<SqlParam>, ignore: bool) -> Self {
        let placeholders = vec!["?"; columns.len()].join(",");
        let sql = format!(
            "INSERT {}INTO {} ({}) VALUES ({})",
            if ignore { "OR IGNORE " } else { "" },
            table,
            columns.join(", "),
            placeholders
        );
        Self::new(sql, params)
    }

    /// Expand list parameters and return the final SQL with flat values
    pub fn expand(&self) -> Result<(String, Vec<Value>), WriterError> {
        let mut sql = String::with_capacity(self.sql.len());
        let mut values = Vec::with_capacity(self.params.len());
        let mut params = self.params.iter();

        for ch in self.sql.chars() {
            if ch != '?' {
                sql.push(ch);
                continue;
            }
            let param = params.next().ok_or_else(|| {
                WriterError::Internal(format!("not enough parameters for: {}", self.sql))
            })?;
            match param {
                SqlParam::List(items) if items.is_empty() => sql.push_str("NULL"),
                SqlParam::List(items) => {
                    sql.push_str(&vec!["?"; items.len()].join(","));
                    values.extend(items.iter().cloned().map(SqlParam::into_value));
                }
                other => {
                    sql.push('?');
                    values.push(other.clone().into_value());
                }
            }
        }

        if params.next().is_some() {
            return Err(WriterError::Internal(format!(
                "too many parameters for: {}",
                self.sql
            )));
        }
        Ok((sql, values))
    }

    /// Run the statement, returning the number of changed rows
    pub fn execute(&self, conn: &Connection) -> Result<usize, WriterError> {
        let (sql, values) = self.expand()?;
        trace!(sql = %sql, "Executing query");
        let changed = conn.execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(changed)
    }
}

/// Execute a batch of queries in order, stopping at the first failure
pub fn execute_all(conn: &Connection, queries: &[Query]) -> Result<(), WriterError> {
    for query in queries {
        query.execute(conn)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_expansion() {
        let units = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        let query = Query::new(
            "UPDATE units SET is_free=0 WHERE unit IN(?) AND level>?",
            crate::sql_params![units.as_slice(), 3u64],
        );
        let (sql, values) = query.expand().unwrap();
        assert_eq!(sql, "UPDATE units SET is_free=0 WHERE unit IN(?,?,?) AND level>?");
        assert_eq!(values.len(), 4);
        assert_eq!(values[3], Value::Integer(3));
    }

    #[test]
    fn test_empty_list_becomes_null() {
        let query = Query::new("SELECT 1 WHERE 'x' IN(?)", crate::sql_params![Vec::<String>::new()]);
        let (sql, values) = query.expand().unwrap();
        assert_eq!(sql, "SELECT 1 WHERE 'x' IN(NULL)");
        assert!(values.is_empty());
    }

    #[test]
    fn test_parameter_count_mismatch() {
        assert!(Query::new("SELECT ?, ?", crate::sql_params!["a"]).expand().is_err());
        assert!(Query::new("SELECT ?", crate::sql_params!["a", "b"]).expand().is_err());
    }

    #[test]
    fn test_insert_builder() {
        let query = Query::insert("addresses", &["address"], crate::sql_params!["ADDR"], true);
        assert_eq!(query.sql, "INSERT OR IGNORE INTO addresses (address) VALUES (?)");

        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE addresses (address TEXT PRIMARY KEY)").unwrap();
        assert_eq!(query.execute(&conn).unwrap(), 1);
        assert_eq!(query.execute(&conn).unwrap(), 0);
    }

    #[test]
    fn test_option_params() {
        let none: Option<String> = None;
        assert_eq!(SqlParam::from(none), SqlParam::Null);
        assert_eq!(SqlParam::from(Some(5u32)), SqlParam::Integer(5));
        assert_eq!(SqlParam::from(true), SqlParam::Integer(1));
    }
}
