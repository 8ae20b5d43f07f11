//! Storage engines behind the edit graph.
//!
//! [`StorageBackend`] is the narrow surface the store needs: run a
//! parameterized statement, fetch rows, run a DDL batch. SQLite is always
//! available; DuckDB is compiled in with the `duckdb` feature.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::{EnginePreference, StoreConfig};
use crate::errors::{EditGraphError, EditGraphResult};
use crate::store::schema;

/// Engine-neutral bind parameter and column value.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
}

impl SqlValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(v) => Some(*v),
            SqlValue::Real(v) => Some(*v as i64),
            SqlValue::Bool(b) => Some(i64::from(*b)),
            SqlValue::Text(s) => s.parse().ok(),
            SqlValue::Null => None,
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Real(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

pub type SqlRow = Vec<SqlValue>;

/// Minimal relational surface shared by every engine.
pub trait StorageBackend: Send + Sync {
    /// Run one statement, returning the number of affected rows.
    fn execute(&self, sql: &str, params: &[SqlValue]) -> EditGraphResult<usize>;

    /// Run one query and collect every row.
    fn query(&self, sql: &str, params: &[SqlValue]) -> EditGraphResult<Vec<SqlRow>>;

    /// Run several `;`-separated statements without parameters.
    fn execute_batch(&self, sql: &str) -> EditGraphResult<()>;

    fn engine_name(&self) -> &'static str;

    fn init_schema(&self) -> EditGraphResult<()> {
        for stmt in schema::SCHEMA_STATEMENTS {
            self.execute_batch(stmt)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

pub struct SqliteBackend {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> EditGraphResult<Self> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> EditGraphResult<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn to_sqlite(value: &SqlValue) -> rusqlite::types::Value {
    use rusqlite::types::Value;
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(v) => Value::Integer(*v),
        SqlValue::Real(v) => Value::Real(*v),
        SqlValue::Text(s) => Value::Text(s.clone()),
        SqlValue::Bool(b) => Value::Integer(i64::from(*b)),
    }
}

fn from_sqlite(value: rusqlite::types::Value) -> SqlValue {
    use rusqlite::types::Value;
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(v) => SqlValue::Integer(v),
        Value::Real(v) => SqlValue::Real(v),
        Value::Text(s) => SqlValue::Text(s),
        Value::Blob(b) => SqlValue::Text(String::from_utf8_lossy(&b).into_owned()),
    }
}

impl StorageBackend for SqliteBackend {
    fn execute(&self, sql: &str, params: &[SqlValue]) -> EditGraphResult<usize> {
        let conn = self.conn.lock();
        let bound = rusqlite::params_from_iter(params.iter().map(to_sqlite));
        Ok(conn.execute(sql, bound)?)
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> EditGraphResult<Vec<SqlRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let width = stmt.column_count();
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter().map(to_sqlite)))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(from_sqlite(row.get::<_, rusqlite::types::Value>(i)?));
            }
            out.push(values);
        }
        Ok(out)
    }

    fn execute_batch(&self, sql: &str) -> EditGraphResult<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }

    fn engine_name(&self) -> &'static str {
        "sqlite"
    }
}

// ---------------------------------------------------------------------------
// DuckDB
// ---------------------------------------------------------------------------

#[cfg(feature = "duckdb")]
pub struct DuckDbBackend {
    conn: Mutex<duckdb::Connection>,
}

#[cfg(feature = "duckdb")]
impl DuckDbBackend {
    pub fn open(path: &Path) -> EditGraphResult<Self> {
        Ok(Self {
            conn: Mutex::new(duckdb::Connection::open(path)?),
        })
    }

    pub fn open_in_memory() -> EditGraphResult<Self> {
        Ok(Self {
            conn: Mutex::new(duckdb::Connection::open_in_memory()?),
        })
    }
}

#[cfg(feature = "duckdb")]
fn to_duckdb(value: &SqlValue) -> duckdb::types::Value {
    use duckdb::types::Value;
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(v) => Value::BigInt(*v),
        SqlValue::Real(v) => Value::Double(*v),
        SqlValue::Text(s) => Value::Text(s.clone()),
        SqlValue::Bool(b) => Value::Boolean(*b),
    }
}

#[cfg(feature = "duckdb")]
fn narrow_to_i64<T>(v: T) -> EditGraphResult<i64>
where
    T: Copy + std::fmt::Display,
    i64: TryFrom<T>,
{
    i64::try_from(v)
        .map_err(|_| EditGraphError::Storage(format!("integer {v} does not fit in i64")))
}

#[cfg(feature = "duckdb")]
fn from_duckdb(value: duckdb::types::Value) -> EditGraphResult<SqlValue> {
    use duckdb::types::Value;
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Boolean(b) => SqlValue::Integer(i64::from(b)),
        Value::TinyInt(v) => SqlValue::Integer(i64::from(v)),
        Value::SmallInt(v) => SqlValue::Integer(i64::from(v)),
        Value::Int(v) => SqlValue::Integer(i64::from(v)),
        Value::BigInt(v) => SqlValue::Integer(v),
        Value::HugeInt(v) => SqlValue::Integer(narrow_to_i64(v)?),
        Value::UTinyInt(v) => SqlValue::Integer(i64::from(v)),
        Value::USmallInt(v) => SqlValue::Integer(i64::from(v)),
        Value::UInt(v) => SqlValue::Integer(i64::from(v)),
        Value::UBigInt(v) => SqlValue::Integer(narrow_to_i64(v)?),
        Value::Float(v) => SqlValue::Real(f64::from(v)),
        Value::Double(v) => SqlValue::Real(v),
        Value::Text(s) => SqlValue::Text(s),
        Value::Blob(b) => SqlValue::Text(String::from_utf8_lossy(&b).into_owned()),
        other => SqlValue::Text(format!("{other:?}")),
    })
}

#[cfg(feature = "duckdb")]
impl StorageBackend for DuckDbBackend {
    fn execute(&self, sql: &str, params: &[SqlValue]) -> EditGraphResult<usize> {
        let conn = self.conn.lock();
        let bound = duckdb::params_from_iter(params.iter().map(to_duckdb));
        Ok(conn.execute(sql, bound)?)
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> EditGraphResult<Vec<SqlRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(duckdb::params_from_iter(params.iter().map(to_duckdb)))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let width = row.as_ref().column_count();
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(from_duckdb(row.get::<_, duckdb::types::Value>(i)?)?);
            }
            out.push(values);
        }
        Ok(out)
    }

    fn execute_batch(&self, sql: &str) -> EditGraphResult<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }

    fn engine_name(&self) -> &'static str {
        "duckdb"
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

fn prepare_db_path(path: &Path) -> EditGraphResult<PathBuf> {
    let resolved = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    if let Some(parent) = resolved.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(resolved)
}

#[cfg(feature = "duckdb")]
fn open_duckdb(path: Option<&Path>) -> EditGraphResult<Box<dyn StorageBackend>> {
    let backend = match path {
        Some(p) => DuckDbBackend::open(p)?,
        None => DuckDbBackend::open_in_memory()?,
    };
    Ok(Box::new(backend))
}

#[cfg(not(feature = "duckdb"))]
fn open_duckdb(_path: Option<&Path>) -> EditGraphResult<Box<dyn StorageBackend>> {
    Err(EditGraphError::Config(
        "DuckDB engine requested but the `duckdb` feature is not enabled".to_string(),
    ))
}

fn open_sqlite(path: Option<&Path>) -> EditGraphResult<Box<dyn StorageBackend>> {
    let backend = match path {
        Some(p) => SqliteBackend::open(p)?,
        None => SqliteBackend::open_in_memory()?,
    };
    Ok(Box::new(backend))
}

/// Open the engine named by `config`, probing DuckDB first under `Auto`.
pub fn open_backend(config: &StoreConfig) -> EditGraphResult<Box<dyn StorageBackend>> {
    let path = match &config.db_path {
        Some(p) => Some(prepare_db_path(p)?),
        None => None,
    };
    let path = path.as_deref();

    let backend = match config.engine {
        EnginePreference::Sqlite => open_sqlite(path)?,
        EnginePreference::DuckDb => open_duckdb(path)?,
        EnginePreference::Auto => match open_duckdb(path) {
            Ok(backend) => backend,
            Err(e) => {
                info!("DuckDB unavailable ({e}); using SQLite");
                open_sqlite(path)?
            }
        },
    };
    debug!(
        "Opened {} store at {}",
        backend.engine_name(),
        path.map(|p| p.display().to_string())
            .unwrap_or_else(|| ":memory:".to_string())
    );
    Ok(backend)
}
