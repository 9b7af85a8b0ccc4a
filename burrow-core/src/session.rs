//! The per-task unit of work: connections checked out of a [`Connection`]'s
//! pools plus the transaction state that goes with them.

use crate::builder::QueryBuilder;
use crate::command::Command;
use crate::connection::{Connection, LOG_TARGET};
use crate::error::Result;
use crate::executor::{DriverConnection, Pool};
use crate::schema::TableSchema;
use crate::transaction::TransactionState;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::warn;

struct Held<P: Pool> {
    pool: Arc<P>,
    conn: P::Conn,
}

/// Connections and transaction state for one unit of work.
///
/// Statements issued through a session run in order on the same physical
/// connection. Dropping the session returns its connections to their pools;
/// a connection with an open transaction is discarded instead.
pub struct Session<P: Pool> {
    connection: Connection<P>,
    master: Option<Held<P>>,
    slave: Option<Held<P>>,
    /// No replica could be opened; reads go to master until release
    slave_unavailable: bool,
    enable_slaves: bool,
    last_insert_id: Option<i64>,
    pub(crate) transaction: TransactionState,
}

impl<P: Pool> Session<P> {
    pub fn new(connection: Connection<P>) -> Self {
        let enable_slaves = connection.config().enable_slaves;
        Self {
            connection,
            master: None,
            slave: None,
            slave_unavailable: false,
            enable_slaves,
            last_insert_id: None,
            transaction: TransactionState::default(),
        }
    }

    pub fn connection(&self) -> &Connection<P> {
        &self.connection
    }

    pub fn query_builder(&self) -> &QueryBuilder {
        self.connection.query_builder()
    }

    pub fn create_command(&mut self, sql: impl Into<String>) -> Command<'_, P> {
        Command::new(self, sql.into())
    }

    /// Id generated by the last INSERT executed on this session
    pub fn last_insert_id(&self) -> Option<i64> {
        self.last_insert_id
    }

    pub(crate) fn set_last_insert_id(&mut self, id: Option<i64>) {
        if id.is_some() {
            self.last_insert_id = id;
        }
    }

    /// Whether a master connection is currently checked out
    pub fn is_open(&self) -> bool {
        self.master.is_some()
    }

    pub(crate) async fn master_conn(&mut self) -> Result<&mut P::Conn> {
        self.open_master(0).await
    }

    async fn open_master(&mut self, attempt: u32) -> Result<&mut P::Conn> {
        let held = match self.master.take() {
            Some(held) => held,
            None => {
                let (pool, conn) = self.connection.open_master(attempt).await?;
                Held { pool, conn }
            }
        };
        Ok(&mut self.master.insert(held).conn)
    }

    /// Connection for a statement; reads prefer a replica outside transactions
    pub(crate) async fn conn_for(&mut self, read: bool) -> Result<&mut P::Conn> {
        if !read || self.transaction.is_active() || !self.enable_slaves || self.slave_unavailable {
            return self.master_conn().await;
        }
        let held = match self.slave.take() {
            Some(held) => held,
            None => match self.connection.open_slave().await {
                Some((pool, conn)) => Held { pool, conn },
                None => {
                    self.slave_unavailable = true;
                    return self.master_conn().await;
                }
            },
        };
        Ok(&mut self.slave.insert(held).conn)
    }

    /// Run `f` with replica reads disabled
    pub async fn use_master<T, F>(&mut self, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut Session<P>) -> BoxFuture<'a, Result<T>>,
    {
        let enabled = self.enable_slaves;
        self.enable_slaves = false;
        let result = f(self).await;
        self.enable_slaves = enabled;
        result
    }

    /// Return connections to their pools.
    ///
    /// Does nothing inside a transaction, and outside one only when
    /// `auto_release` is set or `force` is given.
    pub fn release(&mut self, force: bool) {
        if self.transaction.is_active() {
            return;
        }
        if !force && !self.connection.config().auto_release {
            return;
        }
        if let Some(held) = self.master.take() {
            held.pool.release(held.conn);
        }
        if let Some(held) = self.slave.take() {
            held.pool.release(held.conn);
        }
        self.slave_unavailable = false;
    }

    /// Drop the current connections and open a fresh master
    pub async fn reconnect(&mut self, attempt: u32) -> Result<()> {
        if let Some(held) = self.master.take() {
            held.pool.discard(held.conn);
        }
        if let Some(held) = self.slave.take() {
            held.pool.discard(held.conn);
        }
        warn!(
            target: LOG_TARGET,
            "The {} times to Reconnect DB connection: {}",
            attempt,
            self.connection.short_dsn()
        );
        self.open_master(attempt).await?;
        Ok(())
    }

    /// Discard every connection and forget any open transaction
    pub fn close(&mut self) {
        if self.master.is_some() || self.slave.is_some() {
            warn!(
                target: LOG_TARGET,
                "Closing DB connection: {}",
                self.connection.short_dsn()
            );
        }
        self.discard_master();
        if let Some(held) = self.slave.take() {
            held.pool.discard(held.conn);
        }
        self.slave_unavailable = false;
    }

    pub(crate) fn discard_master(&mut self) {
        if let Some(held) = self.master.take() {
            held.pool.discard(held.conn);
        }
        self.transaction.reset();
    }

    /// Table metadata, from the schema cache or the driver
    pub async fn table_schema(&mut self, name: &str) -> Result<Option<Arc<TableSchema>>> {
        let raw_name = self.connection.quote_sql(name).replace(['`', '"'], "");
        if let Some(schema) = self.connection.schema_cache().get(&raw_name) {
            return Ok(Some(schema));
        }
        let loaded = self.master_conn().await?.table_schema(&raw_name).await?;
        self.release(false);
        Ok(loaded.map(|schema| {
            let schema = Arc::new(schema);
            self.connection.schema_cache().insert(&raw_name, schema.clone());
            schema
        }))
    }

    /// Forget cached metadata for `name`
    pub fn refresh_table_schema(&self, name: &str) {
        let raw_name = self.connection.quote_sql(name).replace(['`', '"'], "");
        self.connection.schema_cache().refresh_table(&raw_name);
    }
}

impl<P: Pool> Drop for Session<P> {
    fn drop(&mut self) {
        if self.transaction.is_active() {
            self.close();
        } else {
            self.release(true);
        }
    }
}
