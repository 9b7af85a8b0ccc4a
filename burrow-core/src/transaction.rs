//! Nested transactions on a session, emulated with savepoints

use crate::connection::LOG_TARGET;
use crate::error::{Error, Result};
use crate::executor::{DriverConnection, IsolationLevel, Pool};
use crate::session::Session;
use futures::future::BoxFuture;
use tracing::{debug, error, info};

/// Nesting depth of the session's transaction.
///
/// Level 0 is inactive, 1 is the real transaction and each further level
/// is one open savepoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionState {
    level: u32,
    isolation: Option<IsolationLevel>,
}

impl TransactionState {
    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn is_active(&self) -> bool {
        self.level > 0
    }

    /// Isolation level requested when the outermost transaction began
    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    pub(crate) fn reset(&mut self) {
        self.level = 0;
        self.isolation = None;
    }
}

fn savepoint_name(level: u32) -> String {
    format!("LEVEL{}", level)
}

impl<P: Pool> Session<P> {
    pub fn transaction_level(&self) -> u32 {
        self.transaction.level()
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_active()
    }

    /// Run a transaction-control statement on master; a failure discards the
    /// connection and ends the transaction
    async fn control(&mut self, sql: &str) -> Result<()> {
        let conn = match self.master_conn().await {
            Ok(conn) => conn,
            Err(err) => {
                self.transaction.reset();
                return Err(err);
            }
        };
        if let Err(err) = conn.execute(sql, &[]).await {
            self.discard_master();
            return Err(self.connection().convert_error(err, sql));
        }
        Ok(())
    }

    /// Begin a transaction, or a savepoint when one is already open
    pub async fn begin_transaction(&mut self, isolation: Option<IsolationLevel>) -> Result<()> {
        let level = self.transaction.level;
        if level == 0 {
            let dialect = self.connection().dialect();
            let begin = dialect.begin_sql();
            let set_isolation = isolation
                .map(|level| dialect.isolation_level_sql(level))
                .transpose()?;
            let isolation_after_begin =
                matches!(dialect.backend(), crate::dialect::DatabaseBackend::Postgres);

            match isolation {
                Some(level) => debug!(
                    target: LOG_TARGET,
                    "Begin transaction with isolation level {}",
                    level.to_sql()
                ),
                None => debug!(target: LOG_TARGET, "Begin transaction"),
            }
            if let (Some(sql), false) = (&set_isolation, isolation_after_begin) {
                self.control(sql).await?;
            }
            self.control(begin).await?;
            if let (Some(sql), true) = (&set_isolation, isolation_after_begin) {
                self.control(sql).await?;
            }
            self.transaction.level = 1;
            self.transaction.isolation = isolation;
            return Ok(());
        }

        if !self.connection().supports_savepoint() {
            info!(
                target: LOG_TARGET,
                "Transaction not started: nested transaction not supported"
            );
            return Err(Error::unsupported(
                "Transaction not started: nested transaction not supported.",
            ));
        }
        debug!(target: LOG_TARGET, "Set savepoint {}", level);
        self.control(&format!("SAVEPOINT {}", savepoint_name(level))).await?;
        self.transaction.level += 1;
        Ok(())
    }

    /// Commit the innermost level
    pub async fn commit(&mut self) -> Result<()> {
        if !self.transaction.is_active() {
            self.release(true);
            return Err(Error::invalid_call(
                "Failed to commit transaction: transaction was inactive.",
            ));
        }
        self.transaction.level -= 1;
        let level = self.transaction.level;
        if level == 0 {
            debug!(target: LOG_TARGET, "Commit transaction");
            self.transaction.isolation = None;
            self.control("COMMIT").await?;
            self.release(true);
            return Ok(());
        }
        if self.connection().supports_savepoint() {
            debug!(target: LOG_TARGET, "Release savepoint {}", level);
            self.control(&format!("RELEASE SAVEPOINT {}", savepoint_name(level)))
                .await?;
        } else {
            info!(
                target: LOG_TARGET,
                "Transaction not committed: nested transaction not supported"
            );
        }
        Ok(())
    }

    /// Roll back the innermost level; a no-op release when inactive
    pub async fn roll_back(&mut self) -> Result<()> {
        if !self.transaction.is_active() {
            self.release(true);
            return Ok(());
        }
        self.transaction.level -= 1;
        let level = self.transaction.level;
        if level == 0 {
            debug!(target: LOG_TARGET, "Roll back transaction");
            self.transaction.isolation = None;
            self.control("ROLLBACK").await?;
            self.release(true);
            return Ok(());
        }
        if self.connection().supports_savepoint() {
            debug!(target: LOG_TARGET, "Roll back to savepoint {}", level);
            self.control(&format!("ROLLBACK TO SAVEPOINT {}", savepoint_name(level)))
                .await?;
        } else {
            info!(
                target: LOG_TARGET,
                "Transaction not rolled back: nested transaction not supported"
            );
        }
        Ok(())
    }

    /// Change the isolation level of the open transaction
    pub async fn set_isolation_level(&mut self, isolation: IsolationLevel) -> Result<()> {
        if !self.transaction.is_active() {
            self.release(true);
            return Err(Error::invalid_call(
                "Failed to set isolation level: transaction was inactive.",
            ));
        }
        debug!(
            target: LOG_TARGET,
            "Setting transaction isolation level to {}",
            isolation.to_sql()
        );
        let sql = self.connection().dialect().isolation_level_sql(isolation)?;
        self.control(&sql).await
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` succeeds and the level it ran at is still open. On
    /// error the level is rolled back and the original error returned.
    pub async fn transaction<T, F>(&mut self, isolation: Option<IsolationLevel>, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut Session<P>) -> BoxFuture<'a, Result<T>>,
    {
        self.begin_transaction(isolation).await?;
        let level = self.transaction.level;
        match f(self).await {
            Ok(value) => {
                if self.transaction.is_active() && self.transaction.level == level {
                    self.commit().await?;
                }
                Ok(value)
            }
            Err(err) => {
                self.roll_back_on_level(level).await;
                Err(err)
            }
        }
    }

    async fn roll_back_on_level(&mut self, level: u32) {
        if self.transaction.is_active() && self.transaction.level == level {
            if let Err(err) = self.roll_back().await {
                // the caller receives the original error
                error!(target: LOG_TARGET, "{}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::connection::{Connection, ConnectionConfig};
    use crate::error::Error;
    use crate::executor::mock::MockPool;
    use crate::executor::IsolationLevel;

    fn connection(dsn: &str, savepoints: bool) -> (MockPool, Connection<MockPool>) {
        let pool = MockPool::new(dsn);
        let mut config = ConnectionConfig::new(dsn);
        config.enable_savepoint = savepoints;
        (pool.clone(), Connection::new(config, pool).unwrap())
    }

    #[tokio::test]
    async fn test_nested_commit_uses_savepoints() {
        let (pool, conn) = connection("pgsql://localhost/app", true);
        let mut session = conn.create_session();
        session.begin_transaction(None).await.unwrap();
        session.begin_transaction(None).await.unwrap();
        assert_eq!(session.transaction_level(), 2);
        session.commit().await.unwrap();
        session.commit().await.unwrap();
        assert_eq!(
            pool.statements(),
            vec!["BEGIN", "SAVEPOINT LEVEL1", "RELEASE SAVEPOINT LEVEL1", "COMMIT"]
        );
        assert!(!session.in_transaction());
        assert_eq!(pool.released(), 1);
    }

    #[tokio::test]
    async fn test_nested_rollback() {
        let (pool, conn) = connection("mysql://localhost/app", true);
        let mut session = conn.create_session();
        session.begin_transaction(None).await.unwrap();
        session.begin_transaction(None).await.unwrap();
        session.roll_back().await.unwrap();
        session.roll_back().await.unwrap();
        assert_eq!(
            pool.statements(),
            vec![
                "START TRANSACTION",
                "SAVEPOINT LEVEL1",
                "ROLLBACK TO SAVEPOINT LEVEL1",
                "ROLLBACK"
            ]
        );
    }

    #[tokio::test]
    async fn test_nested_without_savepoints_fails() {
        let (_pool, conn) = connection("mysql://localhost/app", false);
        let mut session = conn.create_session();
        session.begin_transaction(None).await.unwrap();
        let err = session.begin_transaction(None).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation { .. }));
        assert!(err
            .to_string()
            .contains("Transaction not started: nested transaction not supported."));
        assert_eq!(session.transaction_level(), 1);
    }

    #[tokio::test]
    async fn test_commit_when_inactive() {
        let (_pool, conn) = connection("mysql://localhost/app", true);
        let mut session = conn.create_session();
        let err = session.commit().await.unwrap_err();
        assert!(err
            .to_string()
            .contains("Failed to commit transaction: transaction was inactive."));
        assert!(session.roll_back().await.is_ok());
    }

    #[tokio::test]
    async fn test_isolation_level_order() {
        let (pool, conn) = connection("mysql://localhost/app", true);
        let mut session = conn.create_session();
        session
            .begin_transaction(Some(IsolationLevel::ReadCommitted))
            .await
            .unwrap();
        session
            .set_isolation_level(IsolationLevel::Serializable)
            .await
            .unwrap();
        assert_eq!(
            pool.statements(),
            vec![
                "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
                "START TRANSACTION",
                "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"
            ]
        );

        let (pool, conn) = connection("pgsql://localhost/app", true);
        let mut session = conn.create_session();
        session
            .begin_transaction(Some(IsolationLevel::RepeatableRead))
            .await
            .unwrap();
        assert_eq!(
            pool.statements(),
            vec!["BEGIN", "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ"]
        );
    }

    #[tokio::test]
    async fn test_failed_commit_discards_connection() {
        let (pool, conn) = connection("mysql://localhost/app", true);
        let mut session = conn.create_session();
        session.begin_transaction(None).await.unwrap();
        pool.fail_next(Error::database("server has gone away"));
        let err = session.commit().await.unwrap_err();
        assert!(err.to_string().contains("The SQL being executed was: COMMIT"));
        assert_eq!(session.transaction_level(), 0);
        assert_eq!(pool.discarded(), 1);
    }

    #[tokio::test]
    async fn test_transaction_callback_commits() {
        let (pool, conn) = connection("mysql://localhost/app", true);
        let mut session = conn.create_session();
        let id = session
            .transaction(None, |s| {
                Box::pin(async move {
                    s.create_command("INSERT INTO t (a) VALUES (1)").execute().await?;
                    Ok::<_, Error>(s.last_insert_id())
                })
            })
            .await
            .unwrap();
        assert_eq!(id, Some(1));
        assert_eq!(
            pool.statements(),
            vec!["START TRANSACTION", "INSERT INTO t (a) VALUES (1)", "COMMIT"]
        );
    }

    #[tokio::test]
    async fn test_transaction_callback_rolls_back() {
        let (pool, conn) = connection("mysql://localhost/app", true);
        let mut session = conn.create_session();
        let result: Result<(), Error> = session
            .transaction(None, |s| {
                Box::pin(async move {
                    s.transaction(None, |inner| {
                        Box::pin(async move {
                            inner.create_command("UPDATE t SET a = 2").execute().await?;
                            Err::<(), _>(Error::invalid_call("abort"))
                        })
                    })
                    .await
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(
            pool.statements(),
            vec![
                "START TRANSACTION",
                "SAVEPOINT LEVEL1",
                "UPDATE t SET a = 2",
                "ROLLBACK TO SAVEPOINT LEVEL1",
                "ROLLBACK"
            ]
        );
        assert!(!session.in_transaction());
    }
}
