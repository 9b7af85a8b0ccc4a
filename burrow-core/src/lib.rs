//! Burrow Core - SQL compilation and execution runtime
//!
//! This crate compiles `Query` models and composable conditions into
//! dialect-specific SQL, and runs the result through sessions that route
//! reads to replicas, retry failed statements and nest transactions with
//! savepoints.

pub mod builder;
pub mod cache;
pub mod command;
pub mod condition;
pub mod connection;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod expression;
pub mod operator;
pub mod params;
pub mod query;
pub mod retry;
pub mod schema;
pub mod session;
pub mod transaction;
pub mod value;

// Re-export main types
pub use builder::{ForeignKeyAction, InsertSource, QueryBuilder, UpsertUpdate};
pub use cache::{CachePolicy, MemoryCache, QueryCache};
pub use command::Command;
pub use condition::Condition;
pub use connection::{Connection, ConnectionConfig};
pub use dialect::{dialect_for, DatabaseBackend, SqlDialect};
pub use error::{DbError, Error, Result};
pub use executor::{DriverConnection, ExecOutcome, IsolationLevel, Pool, Row};
pub use expression::{Expression, Operand};
pub use operator::{Conjunction, Operator};
pub use params::{Param, Params};
pub use query::{Column, ColumnItem, JoinType, Keyed, Query, SortDirection};
pub use retry::{MaxAttemptsRetry, NoRetry, RetryAction, RetryHandler};
pub use schema::{ColumnSchema, TableSchema};
pub use session::Session;
pub use transaction::TransactionState;
pub use value::{ParamType, Value};
