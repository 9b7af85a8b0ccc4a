//! Driver-facing traits: connection pools, pooled connections and rows

use crate::schema::TableSchema;
use crate::{Error, Result, Value};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;

/// A source of physical connections to one database server
pub trait Pool: Send + Sync + 'static {
    /// The connection type handed out by this pool
    type Conn: DriverConnection;

    /// DSN of the server behind this pool
    fn dsn(&self) -> &str;

    /// Acquire a connection from the pool
    fn acquire(&self) -> impl Future<Output = Result<Self::Conn>> + Send;

    /// Return a healthy connection
    fn release(&self, conn: Self::Conn);

    /// Drop a connection that must not be reused
    fn discard(&self, conn: Self::Conn) {
        drop(conn);
    }
}

/// Outcome of a statement that returns no rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

/// One physical connection
pub trait DriverConnection: Send + 'static {
    /// Execute a statement that returns no rows (INSERT, UPDATE, DELETE, DDL)
    fn execute(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Result<ExecOutcome>> + Send;

    /// Execute a query that returns rows
    fn fetch_all(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Result<Vec<Row>>> + Send;

    /// Load table metadata; drivers without introspection return `None`
    fn table_schema(
        &mut self,
        _name: &str,
    ) -> impl Future<Output = Result<Option<TableSchema>>> + Send {
        async { Ok(None) }
    }
}

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn to_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// A result row: column names with values, in select order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.columns.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.columns.get(index).map(|(_, v)| v)
    }

    /// First cell, used by scalar and column fetches
    pub fn first(&self) -> Option<&Value> {
        self.get_index(0)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.columns
                .iter()
                .map(|(n, v)| (n.clone(), v.to_json()))
                .collect(),
        )
    }

    /// Decode the row into a struct by column name
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.to_json())?)
    }
}

/// `Pool` implementation over sqlx's runtime-selected `Any` driver
pub mod sqlx_pool {
    use super::*;
    use sqlx::any::{AnyPoolOptions, AnyRow};
    use sqlx::pool::PoolConnection;
    use sqlx::{Any, AnyPool, Column, Row as _, TypeInfo};

    pub struct SqlxPool {
        pool: AnyPool,
        dsn: String,
    }

    impl SqlxPool {
        /// Connect a pool for `dsn` using whichever drivers are compiled in
        pub async fn connect(dsn: &str, max_connections: u32) -> Result<Self> {
            sqlx::any::install_default_drivers();
            let pool = AnyPoolOptions::new()
                .max_connections(max_connections)
                .connect(dsn)
                .await?;
            Ok(Self {
                pool,
                dsn: dsn.to_string(),
            })
        }

        pub fn connect_lazy(dsn: &str, max_connections: u32) -> Result<Self> {
            sqlx::any::install_default_drivers();
            let pool = AnyPoolOptions::new()
                .max_connections(max_connections)
                .connect_lazy(dsn)?;
            Ok(Self {
                pool,
                dsn: dsn.to_string(),
            })
        }

        pub fn from_pool(pool: AnyPool, dsn: impl Into<String>) -> Self {
            Self {
                pool,
                dsn: dsn.into(),
            }
        }
    }

    pub struct SqlxConnection(PoolConnection<Any>);

    impl Pool for SqlxPool {
        type Conn = SqlxConnection;

        fn dsn(&self) -> &str {
            &self.dsn
        }

        async fn acquire(&self) -> Result<Self::Conn> {
            Ok(SqlxConnection(self.pool.acquire().await?))
        }

        fn release(&self, conn: Self::Conn) {
            // returned to the pool on drop
            drop(conn);
        }

        fn discard(&self, conn: Self::Conn) {
            drop(conn.0.detach());
        }
    }

    fn bind_params<'q>(
        mut query: sqlx::query::Query<'q, Any, sqlx::any::AnyArguments<'q>>,
        params: &[Value],
    ) -> sqlx::query::Query<'q, Any, sqlx::any::AnyArguments<'q>> {
        for param in params {
            query = match param.clone() {
                Value::Null => query.bind(Option::<String>::None),
                Value::Bool(b) => query.bind(b),
                Value::I32(v) => query.bind(v),
                Value::I64(v) => query.bind(v),
                Value::F32(v) => query.bind(v),
                Value::F64(v) => query.bind(v),
                Value::String(s) => query.bind(s),
                Value::Bytes(b) => query.bind(b),
                Value::Json(j) => query.bind(j.to_string()),
                arr @ Value::Array(_) => query.bind(arr.to_json().to_string()),
            };
        }
        query
    }

    fn convert_row(row: &AnyRow) -> Result<Row> {
        let mut out = Row::new();
        for (i, column) in row.columns().iter().enumerate() {
            let value = match column.type_info().name() {
                "NULL" => Value::Null,
                "BOOLEAN" => Value::from(row.try_get::<Option<bool>, _>(i)?),
                "SMALLINT" => {
                    Value::from(row.try_get::<Option<i16>, _>(i)?.map(i32::from))
                }
                "INTEGER" => Value::from(row.try_get::<Option<i32>, _>(i)?),
                "BIGINT" => Value::from(row.try_get::<Option<i64>, _>(i)?),
                "REAL" => Value::from(row.try_get::<Option<f32>, _>(i)?),
                "DOUBLE" => Value::from(row.try_get::<Option<f64>, _>(i)?),
                "BLOB" => Value::from(row.try_get::<Option<Vec<u8>>, _>(i)?),
                _ => Value::from(row.try_get::<Option<String>, _>(i)?),
            };
            out.push(column.name(), value);
        }
        Ok(out)
    }

    impl DriverConnection for SqlxConnection {
        async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecOutcome> {
            let result = bind_params(sqlx::query(sql), params)
                .execute(&mut *self.0)
                .await?;
            Ok(ExecOutcome {
                rows_affected: result.rows_affected(),
                last_insert_id: result.last_insert_id(),
            })
        }

        async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
            let rows = bind_params(sqlx::query(sql), params)
                .fetch_all(&mut *self.0)
                .await?;
            rows.iter().map(convert_row).collect()
        }
    }

}

/// Recording in-memory pool for tests
#[cfg(any(test, feature = "mock"))]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// One statement seen by a mock connection
    #[derive(Debug, Clone, PartialEq)]
    pub struct Executed {
        pub dsn: String,
        pub sql: String,
        pub params: Vec<Value>,
    }

    #[derive(Debug, Default)]
    struct MockState {
        log: Vec<Executed>,
        rows: Vec<(String, Vec<Row>)>,
        failures: VecDeque<Error>,
        fail_all: Option<Error>,
        schemas: Vec<TableSchema>,
        next_insert_id: i64,
    }

    /// A pool whose connections record every statement.
    ///
    /// Clones share the same log, so a test can keep a handle while the
    /// connection owns another.
    #[derive(Debug, Clone)]
    pub struct MockPool {
        dsn: String,
        state: Arc<Mutex<MockState>>,
        fail_acquire: Arc<Mutex<bool>>,
        acquired: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
        discarded: Arc<AtomicUsize>,
    }

    impl MockPool {
        pub fn new(dsn: &str) -> Self {
            Self {
                dsn: dsn.to_string(),
                state: Arc::new(Mutex::new(MockState::default())),
                fail_acquire: Arc::new(Mutex::new(false)),
                acquired: Arc::new(AtomicUsize::new(0)),
                released: Arc::new(AtomicUsize::new(0)),
                discarded: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Make every acquire fail
        pub fn unreachable(self) -> Self {
            *self.fail_acquire.lock() = true;
            self
        }

        pub fn set_unreachable(&self, value: bool) {
            *self.fail_acquire.lock() = value;
        }

        /// Rows returned for statements containing `needle`
        pub fn with_rows(self, needle: &str, rows: Vec<Row>) -> Self {
            self.state.lock().rows.push((needle.to_string(), rows));
            self
        }

        pub fn with_schema(self, schema: TableSchema) -> Self {
            self.state.lock().schemas.push(schema);
            self
        }

        /// Fail the next statement with `err`
        pub fn fail_next(&self, err: Error) {
            self.state.lock().failures.push_back(err);
        }

        /// Fail every statement with `err` until cleared
        pub fn fail_always(&self, err: Option<Error>) {
            self.state.lock().fail_all = err;
        }

        pub fn executed(&self) -> Vec<Executed> {
            self.state.lock().log.clone()
        }

        pub fn statements(&self) -> Vec<String> {
            self.state.lock().log.iter().map(|e| e.sql.clone()).collect()
        }

        pub fn clear_log(&self) {
            self.state.lock().log.clear();
        }

        pub fn acquired(&self) -> usize {
            self.acquired.load(Ordering::SeqCst)
        }

        pub fn released(&self) -> usize {
            self.released.load(Ordering::SeqCst)
        }

        pub fn discarded(&self) -> usize {
            self.discarded.load(Ordering::SeqCst)
        }
    }

    #[derive(Debug)]
    pub struct MockConnection {
        dsn: String,
        state: Arc<Mutex<MockState>>,
    }

    impl MockConnection {
        fn record(&self, sql: &str, params: &[Value]) -> Result<()> {
            let mut state = self.state.lock();
            state.log.push(Executed {
                dsn: self.dsn.clone(),
                sql: sql.to_string(),
                params: params.to_vec(),
            });
            if let Some(err) = state.failures.pop_front() {
                return Err(err);
            }
            if let Some(err) = &state.fail_all {
                return Err(err.clone());
            }
            Ok(())
        }
    }

    impl Pool for MockPool {
        type Conn = MockConnection;

        fn dsn(&self) -> &str {
            &self.dsn
        }

        async fn acquire(&self) -> Result<Self::Conn> {
            if *self.fail_acquire.lock() {
                return Err(Error::connection_unavailable(format!(
                    "mock server {} is down",
                    self.dsn
                )));
            }
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(MockConnection {
                dsn: self.dsn.clone(),
                state: self.state.clone(),
            })
        }

        fn release(&self, conn: Self::Conn) {
            self.released.fetch_add(1, Ordering::SeqCst);
            drop(conn);
        }

        fn discard(&self, conn: Self::Conn) {
            self.discarded.fetch_add(1, Ordering::SeqCst);
            drop(conn);
        }
    }

    impl DriverConnection for MockConnection {
        async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecOutcome> {
            self.record(sql, params)?;
            let mut state = self.state.lock();
            let last_insert_id = if sql.trim_start().to_uppercase().starts_with("INSERT") {
                state.next_insert_id += 1;
                Some(state.next_insert_id)
            } else {
                None
            };
            Ok(ExecOutcome {
                rows_affected: 1,
                last_insert_id,
            })
        }

        async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
            self.record(sql, params)?;
            let state = self.state.lock();
            Ok(state
                .rows
                .iter()
                .find(|(needle, _)| sql.contains(needle.as_str()))
                .map(|(_, rows)| rows.clone())
                .unwrap_or_default())
        }

        async fn table_schema(&mut self, name: &str) -> Result<Option<TableSchema>> {
            let state = self.state.lock();
            Ok(state.schemas.iter().find(|s| s.name == name).cloned())
        }
    }
}
