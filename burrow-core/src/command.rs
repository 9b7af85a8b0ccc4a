//! Statement execution: placeholder binding, the retry loop, replica
//! routing, result caching and shared reads.

use crate::builder::{ForeignKeyAction, InsertSource, UpsertUpdate};
use crate::cache::{cache_key, CachePolicy, QueryCache};
use crate::connection::LOG_TARGET;
use crate::error::{Error, Result};
use crate::executor::{DriverConnection, ExecOutcome, Pool, Row};
use crate::expression::Operand;
use crate::params::Params;
use crate::query::Query;
use crate::retry::RetryAction;
use crate::session::Session;
use crate::value::Value;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

static READ_STATEMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(SELECT|SHOW|DESCRIBE)\b").expect("valid read pattern"));

/// Whether `sql` can be served by a replica
pub fn is_read_statement(sql: &str) -> bool {
    READ_STATEMENT.is_match(sql)
}

#[derive(Debug, Clone)]
struct Prepared {
    sql: String,
    values: Vec<Value>,
}

enum Outcome {
    Rows(Vec<Row>),
    Affected(ExecOutcome),
}

impl Outcome {
    fn into_rows(self) -> Vec<Row> {
        match self {
            Outcome::Rows(rows) => rows,
            Outcome::Affected(_) => Vec::new(),
        }
    }

    fn into_affected(self) -> ExecOutcome {
        match self {
            Outcome::Affected(outcome) => outcome,
            Outcome::Rows(rows) => ExecOutcome {
                rows_affected: rows.len() as u64,
                last_insert_id: None,
            },
        }
    }
}

/// One SQL statement bound to a session.
///
/// Placeholders are `?` (positional) and `:name`; both are rewritten into
/// the dialect's style when the command is prepared.
pub struct Command<'s, P: Pool> {
    session: &'s mut Session<P>,
    sql: String,
    params: Params,
    cache: Option<CachePolicy>,
    share: bool,
    refresh_table: Option<String>,
    prepared: Option<Prepared>,
}

impl<'s, P: Pool> Command<'s, P> {
    pub(crate) fn new(session: &'s mut Session<P>, sql: String) -> Self {
        let mut command = Self {
            session,
            sql: String::new(),
            params: Params::new(),
            cache: None,
            share: false,
            refresh_table: None,
            prepared: None,
        };
        command.set_sql(&sql);
        command
    }

    /// SQL with `{{ }}` and `[[ ]]` tokens already expanded
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Replace the statement, expanding quoting tokens.
    ///
    /// A different statement drops the prepared state, the bound params and
    /// the pending schema refresh.
    pub fn set_sql(&mut self, sql: &str) -> &mut Self {
        let quoted = self.session.connection().quote_sql(sql);
        self.replace_sql(quoted);
        self
    }

    /// Replace the statement verbatim
    pub fn set_raw_sql(&mut self, sql: &str) -> &mut Self {
        self.replace_sql(sql.to_string());
        self
    }

    fn replace_sql(&mut self, sql: String) {
        if sql != self.sql {
            self.cancel();
            self.params = Params::new();
            self.refresh_table = None;
            self.sql = sql;
        }
    }

    /// Bind a named value; the leading `:` is optional
    pub fn bind_value(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.set(name, value);
        self.prepared = None;
        self
    }

    /// Append a positional value
    pub fn bind_positional(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value);
        self.prepared = None;
        self
    }

    pub fn bind_values(mut self, params: Params) -> Self {
        self.params.extend(params);
        self.prepared = None;
        self
    }

    /// Cache read results; `None` disables caching
    pub fn cache(mut self, policy: Option<CachePolicy>) -> Self {
        self.cache = policy;
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.cache = None;
        self
    }

    /// Coalesce concurrent identical reads
    pub fn share(mut self, share: bool) -> Self {
        self.share = share;
        self
    }

    /// Drop the prepared statement; params stay bound
    pub fn cancel(&mut self) {
        self.prepared = None;
    }

    /// The statement with params inlined, for logs and error messages
    pub fn raw_sql(&self) -> String {
        if self.params.is_empty() {
            return self.sql.clone();
        }
        let qb = self.session.query_builder();
        let escapes = qb.dialect().backslash_escapes();
        self.params
            .bind_sql(&self.sql, escapes, |param, _| match &param.value {
                Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
                other => qb.literal(other),
            })
            .map(|(sql, _)| sql)
            .unwrap_or_else(|_| self.sql.clone())
    }

    /// Resolve placeholders into the dialect's style
    pub fn prepare(&mut self) -> Result<()> {
        if self.prepared.is_some() {
            return Ok(());
        }
        let dialect = self.session.connection().dialect();
        let (sql, bound) = self
            .params
            .bind_sql(&self.sql, dialect.backslash_escapes(), |_, position| {
                dialect.placeholder(position)
            })?;
        self.prepared = Some(Prepared {
            sql,
            values: bound.into_iter().map(|p| p.value).collect(),
        });
        Ok(())
    }

    fn log_query(&self, message: &str) {
        let connection = self.session.connection();
        if connection.should_log(message) {
            info!(target: LOG_TARGET, "{}\n{}", connection.short_dsn(), message);
        }
    }

    /// Decide the next step after a failed attempt
    fn retry_action(&self, err: &Error, attempt: u32) -> (RetryAction, Duration) {
        let connection = self.session.connection();
        let Some(handler) = connection.retry_handler() else {
            return (RetryAction::No, Duration::ZERO);
        };
        if err.is_compile_error() {
            return (RetryAction::No, Duration::ZERO);
        }
        if let Some(ceiling) = connection.config().max_retry_ceiling {
            if attempt >= ceiling {
                return (RetryAction::No, Duration::ZERO);
            }
        }
        match handler.handle(err, attempt) {
            // a fresh connection would silently leave the transaction
            RetryAction::Reconnect if self.session.in_transaction() => (RetryAction::No, Duration::ZERO),
            action => (action, handler.backoff(attempt)),
        }
    }

    async fn run(&mut self, raw_sql: &str, fetch: bool) -> Result<Outcome> {
        self.prepare()?;
        let Prepared { sql, values } = match &self.prepared {
            Some(prepared) => prepared.clone(),
            None => return Err(Error::invalid_call("Command was not prepared")),
        };
        let read = is_read_statement(&self.sql);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.session.conn_for(read).await {
                Ok(conn) if fetch => conn.fetch_all(&sql, &values).await.map(Outcome::Rows),
                Ok(conn) => conn.execute(&sql, &values).await.map(Outcome::Affected),
                Err(err) => Err(err),
            };
            let err = match result {
                Ok(outcome) => return Ok(outcome),
                Err(err) => self.session.connection().convert_error(err, raw_sql),
            };
            let (action, pause) = self.retry_action(&err, attempt);
            if action == RetryAction::No {
                self.prepared = None;
                return Err(err);
            }
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
            if action == RetryAction::Reconnect {
                self.session.reconnect(attempt).await?;
            } else {
                debug!(target: LOG_TARGET, "Retrying statement, attempt {}: {}", attempt, err);
            }
        }
    }

    /// Cache handle and TTL when caching applies to this command
    fn cache_info(&self) -> Option<(Arc<dyn QueryCache>, Option<Duration>)> {
        let connection = self.session.connection();
        if !connection.config().enable_query_cache {
            return None;
        }
        let policy = self.cache.as_ref()?;
        let cache = policy
            .cache
            .clone()
            .or_else(|| connection.query_cache().cloned())?;
        Some((cache, policy.ttl))
    }

    fn result_key(&self, method: &str, raw_sql: &str) -> String {
        cache_key(&["Command", method, "assoc", self.session.connection().dsn(), raw_sql])
    }

    async fn fetch_cached(&mut self, method: &str, raw_sql: &str) -> Result<Vec<Row>> {
        let cache = self.cache_info();
        let key = self.result_key(method, raw_sql);
        if let Some((cache, _)) = &cache {
            if let Some(stored) = cache.get(&key) {
                if let Ok(rows) = serde_json::from_str::<Vec<Row>>(&stored) {
                    self.log_query(&format!("{}; [Query result read from cache]", raw_sql));
                    return Ok(rows);
                }
            }
        }

        self.log_query(raw_sql);
        let result = self.run(raw_sql, true).await;
        self.session.release(false);
        let rows = result?.into_rows();

        if let Some((cache, ttl)) = cache {
            cache.set(&key, serde_json::to_string(&rows)?, ttl);
            self.log_query("Saved query result in cache");
        }
        Ok(rows)
    }

    async fn query_internal(&mut self, method: &str) -> Result<Arc<Vec<Row>>> {
        let raw_sql = self.raw_sql();
        if !self.share {
            return self.fetch_cached(method, &raw_sql).await.map(Arc::new);
        }
        let key = self.result_key(method, &raw_sql);
        let connection = self.session.connection().clone();
        connection
            .share_group()
            .run(&key, self.fetch_cached(method, &raw_sql))
            .await
    }

    fn unshare(rows: Arc<Vec<Row>>) -> Vec<Row> {
        Arc::try_unwrap(rows).unwrap_or_else(|shared| shared.as_ref().clone())
    }

    pub async fn query_all(&mut self) -> Result<Vec<Row>> {
        self.query_internal("fetchAll").await.map(Self::unshare)
    }

    pub async fn query_one(&mut self) -> Result<Option<Row>> {
        let rows = self.query_internal("fetch").await?;
        Ok(rows.first().cloned())
    }

    /// First column of the first row
    pub async fn query_scalar(&mut self) -> Result<Option<Value>> {
        let rows = self.query_internal("fetchColumn").await?;
        Ok(rows.first().and_then(Row::first).cloned())
    }

    /// First column of every row
    pub async fn query_column(&mut self) -> Result<Vec<Value>> {
        let rows = self.query_internal("fetchAllColumn").await?;
        Ok(rows
            .iter()
            .map(|row| row.first().cloned().unwrap_or(Value::Null))
            .collect())
    }

    pub async fn query_all_as<T: DeserializeOwned>(&mut self) -> Result<Vec<T>> {
        self.query_all().await?.iter().map(|row| row.decode()).collect()
    }

    pub async fn query_one_as<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.query_one().await? {
            Some(row) => Ok(Some(row.decode()?)),
            None => Ok(None),
        }
    }

    /// Run a statement that returns no rows and report the affected count.
    ///
    /// An empty statement touches no connection and returns 0.
    pub async fn execute(&mut self) -> Result<u64> {
        let raw_sql = self.raw_sql();
        self.log_query(&raw_sql);
        if self.sql.is_empty() {
            return Ok(0);
        }
        let result = self.run(&raw_sql, false).await;
        let outcome = match result {
            Ok(outcome) => outcome.into_affected(),
            Err(err) => {
                self.session.release(false);
                return Err(err);
            }
        };
        self.session.set_last_insert_id(outcome.last_insert_id);
        if let Some(table) = &self.refresh_table {
            self.session.refresh_table_schema(table);
        }
        self.session.release(false);
        Ok(outcome.rows_affected)
    }

    fn set_built(&mut self, sql: String, params: Params) -> &mut Self {
        self.set_sql(&sql);
        self.params = params;
        self
    }

    fn require_table_schema_refresh(&mut self, table: &str) -> &mut Self {
        self.refresh_table = Some(table.to_string());
        self
    }

    pub async fn insert(
        &mut self,
        table: &str,
        source: impl Into<InsertSource>,
        with_update: bool,
    ) -> Result<&mut Self> {
        let schema = self.session.table_schema(table).await?;
        let mut params = Params::new();
        let sql = self.session.query_builder().insert(
            table,
            &source.into(),
            schema.as_deref(),
            with_update,
            &mut params,
        )?;
        Ok(self.set_built(sql, params))
    }

    pub async fn update(
        &mut self,
        table: &str,
        columns: &[(String, Operand)],
        condition: impl Into<Operand>,
        params: Params,
    ) -> Result<&mut Self> {
        let schema = self.session.table_schema(table).await?;
        let mut params = params;
        let sql = self.session.query_builder().update(
            table,
            columns,
            &condition.into(),
            schema.as_deref(),
            &mut params,
        )?;
        Ok(self.set_built(sql, params))
    }

    pub fn delete(&mut self, table: &str, condition: impl Into<Operand>, params: Params) -> Result<&mut Self> {
        let mut params = params;
        let sql = self
            .session
            .query_builder()
            .delete(table, &condition.into(), &mut params)?;
        Ok(self.set_built(sql, params))
    }

    /// Insert many rows in one statement; no rows leaves the command empty
    pub async fn batch_insert(
        &mut self,
        table: &str,
        columns: &[&str],
        rows: &[Vec<Operand>],
    ) -> Result<&mut Self> {
        let schema = self.session.table_schema(table).await?;
        let mut params = Params::new();
        let sql = self.session.query_builder().batch_insert(
            table,
            columns,
            rows,
            schema.as_deref(),
            &mut params,
        )?;
        self.set_raw_sql(&sql);
        self.params = params;
        Ok(self)
    }

    pub async fn upsert(
        &mut self,
        table: &str,
        source: impl Into<InsertSource>,
        update: UpsertUpdate,
        params: Params,
    ) -> Result<&mut Self> {
        let schema = self.session.table_schema(table).await?;
        let mut params = params;
        let sql = self.session.query_builder().upsert(
            table,
            &source.into(),
            &update,
            schema.as_deref(),
            &mut params,
        )?;
        Ok(self.set_built(sql, params))
    }

    pub fn create_table(&mut self, table: &str, columns: &[(&str, &str)], options: Option<&str>) -> &mut Self {
        let sql = self.session.query_builder().create_table(table, columns, options);
        self.set_sql(&sql).require_table_schema_refresh(table)
    }

    pub fn rename_table(&mut self, table: &str, new_name: &str) -> &mut Self {
        let sql = self.session.query_builder().rename_table(table, new_name);
        self.set_sql(&sql).require_table_schema_refresh(table)
    }

    pub fn drop_table(&mut self, table: &str) -> &mut Self {
        let sql = self.session.query_builder().drop_table(table);
        self.set_sql(&sql).require_table_schema_refresh(table)
    }

    pub fn truncate_table(&mut self, table: &str) -> &mut Self {
        let sql = self.session.query_builder().truncate_table(table);
        self.set_sql(&sql)
    }

    pub fn add_column(&mut self, table: &str, column: &str, column_type: &str) -> &mut Self {
        let sql = self.session.query_builder().add_column(table, column, column_type);
        self.set_sql(&sql).require_table_schema_refresh(table)
    }

    pub fn drop_column(&mut self, table: &str, column: &str) -> &mut Self {
        let sql = self.session.query_builder().drop_column(table, column);
        self.set_sql(&sql).require_table_schema_refresh(table)
    }

    pub fn rename_column(&mut self, table: &str, old_name: &str, new_name: &str) -> &mut Self {
        let sql = self.session.query_builder().rename_column(table, old_name, new_name);
        self.set_sql(&sql).require_table_schema_refresh(table)
    }

    pub fn alter_column(&mut self, table: &str, column: &str, column_type: &str) -> Result<&mut Self> {
        let sql = self.session.query_builder().alter_column(table, column, column_type)?;
        Ok(self.set_sql(&sql).require_table_schema_refresh(table))
    }

    pub fn add_primary_key(&mut self, name: &str, table: &str, columns: &str) -> &mut Self {
        let sql = self.session.query_builder().add_primary_key(name, table, columns);
        self.set_sql(&sql).require_table_schema_refresh(table)
    }

    pub fn drop_primary_key(&mut self, name: &str, table: &str) -> &mut Self {
        let sql = self.session.query_builder().drop_primary_key(name, table);
        self.set_sql(&sql).require_table_schema_refresh(table)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_foreign_key(
        &mut self,
        name: &str,
        table: &str,
        columns: &str,
        ref_table: &str,
        ref_columns: &str,
        on_delete: Option<ForeignKeyAction>,
        on_update: Option<ForeignKeyAction>,
    ) -> &mut Self {
        let sql = self.session.query_builder().add_foreign_key(
            name,
            table,
            columns,
            ref_table,
            ref_columns,
            on_delete,
            on_update,
        );
        self.set_sql(&sql).require_table_schema_refresh(table)
    }

    pub fn drop_foreign_key(&mut self, name: &str, table: &str) -> &mut Self {
        let sql = self.session.query_builder().drop_foreign_key(name, table);
        self.set_sql(&sql).require_table_schema_refresh(table)
    }

    pub fn create_index(&mut self, name: &str, table: &str, columns: &str, unique: bool) -> &mut Self {
        let sql = self.session.query_builder().create_index(name, table, columns, unique);
        self.set_sql(&sql).require_table_schema_refresh(table)
    }

    pub fn drop_index(&mut self, name: &str, table: &str) -> &mut Self {
        let sql = self.session.query_builder().drop_index(name, table);
        self.set_sql(&sql).require_table_schema_refresh(table)
    }

    pub fn add_unique(&mut self, name: &str, table: &str, columns: &str) -> &mut Self {
        let sql = self.session.query_builder().add_unique(name, table, columns);
        self.set_sql(&sql).require_table_schema_refresh(table)
    }

    pub fn drop_unique(&mut self, name: &str, table: &str) -> &mut Self {
        let sql = self.session.query_builder().drop_unique(name, table);
        self.set_sql(&sql).require_table_schema_refresh(table)
    }

    pub fn add_check(&mut self, name: &str, table: &str, expression: &str) -> &mut Self {
        let sql = self.session.query_builder().add_check(name, table, expression);
        self.set_sql(&sql).require_table_schema_refresh(table)
    }

    pub fn drop_check(&mut self, name: &str, table: &str) -> &mut Self {
        let sql = self.session.query_builder().drop_check(name, table);
        self.set_sql(&sql).require_table_schema_refresh(table)
    }

    pub fn add_comment_on_column(&mut self, table: &str, column: &str, comment: &str) -> &mut Self {
        let sql = self.session.query_builder().add_comment_on_column(table, column, comment);
        self.set_sql(&sql).require_table_schema_refresh(table)
    }

    pub fn add_comment_on_table(&mut self, table: &str, comment: &str) -> &mut Self {
        let sql = self.session.query_builder().add_comment_on_table(table, comment);
        self.set_sql(&sql)
    }

    pub fn drop_comment_from_column(&mut self, table: &str, column: &str) -> &mut Self {
        let sql = self.session.query_builder().drop_comment_from_column(table, column);
        self.set_sql(&sql).require_table_schema_refresh(table)
    }

    pub fn drop_comment_from_table(&mut self, table: &str) -> &mut Self {
        let sql = self.session.query_builder().drop_comment_from_table(table);
        self.set_sql(&sql)
    }

    pub fn create_view(&mut self, name: &str, query: &Query) -> Result<&mut Self> {
        let sql = self.session.query_builder().create_view(name, query)?;
        Ok(self.set_raw_sql(&sql).require_table_schema_refresh(name))
    }

    pub fn drop_view(&mut self, name: &str) -> &mut Self {
        let sql = self.session.query_builder().drop_view(name);
        self.set_sql(&sql).require_table_schema_refresh(name)
    }

    pub fn reset_sequence(&mut self, table: &str, value: Option<i64>) -> Result<&mut Self> {
        let (sequence, primary_key) = match self.session.connection().schema_cache().get(table) {
            Some(schema) => (schema.sequence_name.clone(), schema.primary_key.first().cloned()),
            None => (None, None),
        };
        let sql = self.session.query_builder().reset_sequence(
            table,
            sequence.as_deref(),
            primary_key.as_deref(),
            value,
        )?;
        Ok(self.set_sql(&sql))
    }

    pub fn check_integrity(&mut self, check: bool, schema: &str, table: &str) -> Result<&mut Self> {
        let sql = self.session.query_builder().check_integrity(check, schema, table)?;
        Ok(self.set_sql(&sql))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::connection::{Connection, ConnectionConfig};
    use crate::executor::mock::MockPool;
    use crate::retry::MaxAttemptsRetry;
    use crate::{hash, list};

    fn connection(pool: &MockPool) -> Connection<MockPool> {
        Connection::new(ConnectionConfig::new(pool.dsn().to_string()), pool.clone()).unwrap()
    }

    #[test]
    fn test_read_statement_detection() {
        assert!(is_read_statement("  select * from t"));
        assert!(is_read_statement("SHOW TABLES"));
        assert!(!is_read_statement("UPDATE t SET a = 1"));
        assert!(!is_read_statement("SELECTED"));
    }

    #[tokio::test]
    async fn test_set_sql_quotes_and_resets() {
        let pool = MockPool::new("mysql://localhost/app");
        let conn = connection(&pool);
        let mut session = conn.create_session();
        let mut cmd = session
            .create_command("SELECT * FROM {{user}} WHERE [[id]] = :id")
            .bind_value("id", 5);
        assert_eq!(cmd.sql(), "SELECT * FROM `user` WHERE `id` = :id");
        assert_eq!(cmd.raw_sql(), "SELECT * FROM `user` WHERE `id` = 5");

        cmd.set_sql("SELECT * FROM {{user}} WHERE [[id]] = :id");
        assert_eq!(cmd.params().len(), 1);
        cmd.set_sql("SELECT 1");
        assert!(cmd.params().is_empty());
    }

    #[tokio::test]
    async fn test_raw_sql_literals() {
        let pool = MockPool::new("pgsql://localhost/app");
        let conn = connection(&pool);
        let mut session = conn.create_session();
        let cmd = session
            .create_command("SELECT * FROM t WHERE a = ? AND b = ? AND c = ? AND d = ?")
            .bind_positional("it's")
            .bind_positional(true)
            .bind_positional(())
            .bind_positional(1.5);
        assert_eq!(
            cmd.raw_sql(),
            "SELECT * FROM t WHERE a = 'it''s' AND b = TRUE AND c = NULL AND d = 1.5"
        );
    }

    #[tokio::test]
    async fn test_postgres_placeholders() {
        let pool = MockPool::new("pgsql://localhost/app");
        let conn = connection(&pool);
        let mut session = conn.create_session();
        session
            .create_command("UPDATE t SET a = :a WHERE id = ? AND x::text = ?")
            .bind_value(":a", "v")
            .bind_positional(1)
            .bind_positional("y")
            .execute()
            .await
            .unwrap();
        let executed = pool.executed();
        assert_eq!(executed[0].sql, "UPDATE t SET a = $1 WHERE id = $2 AND x::text = $3");
        assert_eq!(
            executed[0].params,
            vec![Value::from("v"), Value::I32(1), Value::from("y")]
        );
    }

    #[tokio::test]
    async fn test_missing_param_fails_before_execution() {
        let pool = MockPool::new("mysql://localhost/app");
        let conn = connection(&pool);
        let mut session = conn.create_session();
        let err = session
            .create_command("SELECT * FROM t WHERE a = ?")
            .query_all()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Not enough parameters bound"));
        assert!(pool.executed().is_empty());
    }

    #[tokio::test]
    async fn test_retry_attempts_then_fails() {
        let pool = MockPool::new("mysql://localhost/app");
        pool.fail_always(Some(Error::database("server has gone away")));
        let conn = Connection::builder(ConnectionConfig::new("mysql://localhost/app"))
            .primary(pool.clone())
            .retry_handler(Arc::new(MaxAttemptsRetry::new(3).with_sleep(Duration::ZERO)))
            .build()
            .unwrap();
        let mut session = conn.create_session();
        let err = session
            .create_command("UPDATE t SET a = 1")
            .execute()
            .await
            .unwrap_err();
        assert_eq!(pool.executed().len(), 3);
        assert_eq!(pool.discarded(), 2);
        assert!(err.to_string().contains("server has gone away"));
        assert!(err.to_string().contains("The SQL being executed was: UPDATE t SET a = 1"));
    }

    #[tokio::test]
    async fn test_retry_ceiling() {
        let pool = MockPool::new("mysql://localhost/app");
        pool.fail_always(Some(Error::database("deadlock")));
        let mut config = ConnectionConfig::new("mysql://localhost/app");
        config.max_retry_ceiling = Some(2);
        let conn = Connection::builder(config)
            .primary(pool.clone())
            .retry_handler(Arc::new(MaxAttemptsRetry::new(10).with_sleep(Duration::ZERO)))
            .build()
            .unwrap();
        let mut session = conn.create_session();
        assert!(session.create_command("DELETE FROM t").execute().await.is_err());
        assert_eq!(pool.executed().len(), 2);
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let pool = MockPool::new("mysql://localhost/app")
            .with_rows("FROM t", vec![Row::new().with("n", 1)]);
        pool.fail_next(Error::database("server has gone away"));
        let conn = Connection::builder(ConnectionConfig::new("mysql://localhost/app"))
            .primary(pool.clone())
            .retry_handler(Arc::new(MaxAttemptsRetry::new(3).with_sleep(Duration::ZERO)))
            .build()
            .unwrap();
        let mut session = conn.create_session();
        let rows = session.create_command("SELECT n FROM t").query_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(pool.executed().len(), 2);
    }

    #[tokio::test]
    async fn test_routing() {
        let master = MockPool::new("mysql://master/app");
        let slave = MockPool::new("mysql://replica/app");
        let conn = Connection::builder(ConnectionConfig::new("mysql://master/app"))
            .primary(master.clone())
            .slave(slave.clone())
            .build()
            .unwrap();
        let mut session = conn.create_session();
        session.create_command("SELECT * FROM t").query_all().await.unwrap();
        session.create_command("UPDATE t SET a = 1").execute().await.unwrap();
        assert_eq!(slave.statements(), vec!["SELECT * FROM t"]);
        assert_eq!(master.statements(), vec!["UPDATE t SET a = 1"]);

        session.begin_transaction(None).await.unwrap();
        session.create_command("SELECT * FROM t").query_all().await.unwrap();
        session.commit().await.unwrap();
        assert_eq!(slave.statements().len(), 1);
        assert_eq!(
            master.statements(),
            vec!["UPDATE t SET a = 1", "START TRANSACTION", "SELECT * FROM t", "COMMIT"]
        );
    }

    #[tokio::test]
    async fn test_fetch_helpers() {
        let pool = MockPool::new("mysql://localhost/app").with_rows(
            "FROM user",
            vec![
                Row::new().with("id", 1).with("name", "a"),
                Row::new().with("id", 2).with("name", "b"),
            ],
        );
        let conn = connection(&pool);
        let mut session = conn.create_session();
        let sql = "SELECT id, name FROM user";
        assert_eq!(session.create_command(sql).query_all().await.unwrap().len(), 2);
        assert_eq!(
            session.create_command(sql).query_scalar().await.unwrap(),
            Some(Value::I32(1))
        );
        assert_eq!(
            session.create_command(sql).query_column().await.unwrap(),
            vec![Value::I32(1), Value::I32(2)]
        );
        let one = session.create_command(sql).query_one().await.unwrap().unwrap();
        assert_eq!(one.get("name"), Some(&Value::from("a")));
        assert!(session
            .create_command("SELECT * FROM empty")
            .query_one()
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_query_cache() {
        let pool = MockPool::new("mysql://localhost/app")
            .with_rows("FROM user", vec![Row::new().with("id", 1)]);
        let cache = Arc::new(MemoryCache::new());
        let conn = Connection::builder(ConnectionConfig::new("mysql://localhost/app"))
            .primary(pool.clone())
            .query_cache(cache.clone())
            .build()
            .unwrap();
        let mut session = conn.create_session();
        for _ in 0..2 {
            let rows = session
                .create_command("SELECT id FROM user")
                .cache(Some(CachePolicy::new(Some(Duration::from_secs(60)))))
                .query_all()
                .await
                .unwrap();
            assert_eq!(rows[0].get("id"), Some(&Value::I32(1)));
        }
        assert_eq!(pool.executed().len(), 1);
        assert_eq!(cache.len(), 1);

        session.create_command("SELECT id FROM user").query_all().await.unwrap();
        assert_eq!(pool.executed().len(), 2);
    }

    #[tokio::test]
    async fn test_shared_read() {
        let pool = MockPool::new("mysql://localhost/app")
            .with_rows("FROM user", vec![Row::new().with("id", 1)]);
        let conn = connection(&pool);
        let mut session = conn.create_session();
        let rows = session
            .create_command("SELECT id FROM user")
            .share(true)
            .query_all()
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(conn.share_group().inflight(), 0);
    }

    #[tokio::test]
    async fn test_execute_empty_sql() {
        let pool = MockPool::new("mysql://localhost/app");
        let conn = connection(&pool);
        let mut session = conn.create_session();
        let mut cmd = session.create_command("");
        let n = cmd.batch_insert("user", &["name"], &[]).await.unwrap().execute().await.unwrap();
        assert_eq!(n, 0);
        assert!(pool.executed().is_empty());
    }

    #[tokio::test]
    async fn test_batch_insert_rows() {
        let pool = MockPool::new("mysql://localhost/app");
        let conn = connection(&pool);
        let mut session = conn.create_session();
        let rows = vec![
            vec![Operand::from("a"), Operand::from(1)],
            vec![Operand::from("b"), Operand::from(2)],
        ];
        session
            .create_command("")
            .batch_insert("user", &["name", "age"], &rows)
            .await
            .unwrap()
            .execute()
            .await
            .unwrap();
        assert_eq!(
            pool.statements(),
            vec!["INSERT INTO `user` (`name`, `age`) VALUES ('a', 1), ('b', 2)"]
        );
    }

    #[tokio::test]
    async fn test_batch_insert_trailing_backslash() {
        for (dsn, expected) in [
            (
                "pgsql://localhost/app",
                r#"INSERT INTO "t" ("path", "note") VALUES ('C:\', 'what?')"#,
            ),
            (
                "sqlite://localhost/app",
                r"INSERT INTO `t` (`path`, `note`) VALUES ('C:\', 'what?')",
            ),
        ] {
            let pool = MockPool::new(dsn);
            let conn = connection(&pool);
            let mut session = conn.create_session();
            let rows = vec![vec![Operand::from(r"C:\"), Operand::from("what?")]];
            let n = session
                .create_command("")
                .batch_insert("t", &["path", "note"], &rows)
                .await
                .unwrap()
                .execute()
                .await;
            tokio_test::assert_ok!(n);
            assert_eq!(pool.statements(), vec![expected]);
        }
    }

    #[tokio::test]
    async fn test_placeholder_after_backslash_literal() {
        let pool = MockPool::new("pgsql://localhost/app");
        let conn = connection(&pool);
        let mut session = conn.create_session();
        session
            .create_command(r"UPDATE t SET a = 1 WHERE p = 'x\' AND id = ?")
            .bind_positional(7)
            .execute()
            .await
            .unwrap();
        let executed = pool.executed();
        assert_eq!(executed[0].sql, r"UPDATE t SET a = 1 WHERE p = 'x\' AND id = $1");
        assert_eq!(executed[0].params, vec![Value::I32(7)]);

        let pool = MockPool::new("mysql://localhost/app");
        let conn = connection(&pool);
        let mut session = conn.create_session();
        session
            .create_command(r"UPDATE t SET a = 1 WHERE p = 'x\'?' AND id = ?")
            .bind_positional(7)
            .execute()
            .await
            .unwrap();
        let executed = pool.executed();
        assert_eq!(executed[0].sql, r"UPDATE t SET a = 1 WHERE p = 'x\'?' AND id = ?");
        assert_eq!(executed[0].params, vec![Value::I32(7)]);
    }

    #[tokio::test]
    async fn test_postgres_quoted_identifier_placeholder() {
        let pool = MockPool::new("pgsql://localhost/app");
        let conn = connection(&pool);
        let mut session = conn.create_session();
        session
            .create_command(r#"SELECT "odd?name" FROM t WHERE a = 'it''s' AND id = ?"#)
            .bind_positional(3)
            .execute()
            .await
            .unwrap();
        let executed = pool.executed();
        assert_eq!(
            executed[0].sql,
            r#"SELECT "odd?name" FROM t WHERE a = 'it''s' AND id = $1"#
        );
    }

    #[tokio::test]
    async fn test_insert_records_last_id() {
        let pool = MockPool::new("mysql://localhost/app");
        let conn = connection(&pool);
        let mut session = conn.create_session();
        session
            .create_command("")
            .insert("user", InsertSource::values([("name", "bob")]), false)
            .await
            .unwrap()
            .execute()
            .await
            .unwrap();
        assert_eq!(session.last_insert_id(), Some(1));
        assert_eq!(pool.statements(), vec!["INSERT INTO `user` (`name`) VALUES (?)"]);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let pool = MockPool::new("mysql://localhost/app");
        let conn = connection(&pool);
        let mut session = conn.create_session();
        session
            .create_command("")
            .update(
                "user",
                &[("status".to_string(), Operand::from(2))],
                hash! {"id" => 7},
                Params::new(),
            )
            .await
            .unwrap()
            .execute()
            .await
            .unwrap();
        session
            .create_command("")
            .delete("user", list!["<", "age", 18], Params::new())
            .unwrap()
            .execute()
            .await
            .unwrap();
        let executed = pool.executed();
        assert_eq!(executed[0].sql, "UPDATE `user` SET `status`=? WHERE `id` = ?");
        assert_eq!(executed[0].params, vec![Value::I32(2), Value::I32(7)]);
        assert_eq!(executed[1].sql, "DELETE FROM `user` WHERE `age` < ?");
    }

    #[tokio::test]
    async fn test_ddl_refreshes_schema() {
        let pool = MockPool::new("mysql://localhost/app");
        let mut config = ConnectionConfig::new("mysql://localhost/app");
        config.enable_schema_cache = true;
        let conn = Connection::new(config, pool.clone()).unwrap();
        conn.schema_cache()
            .insert("user", Arc::new(crate::schema::TableSchema::new("user")));
        let mut session = conn.create_session();
        session
            .create_command("")
            .add_column("user", "age", "integer")
            .execute()
            .await
            .unwrap();
        assert!(conn.schema_cache().get("user").is_none());
        assert_eq!(pool.statements(), vec!["ALTER TABLE `user` ADD `age` int(11)"]);
    }

    #[tokio::test]
    async fn test_connections_released_after_statement() {
        let pool = MockPool::new("mysql://localhost/app");
        let conn = connection(&pool);
        let mut session = conn.create_session();
        let affected = tokio_test::assert_ok!(session.create_command("UPDATE t SET a = 1").execute().await);
        assert_eq!(affected, 1);
        assert_eq!(pool.released(), 1);
        assert!(!session.is_open());
    }
}
