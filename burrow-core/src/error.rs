//! Error types for Burrow

use std::fmt;
use thiserror::Error;

/// Driver-level failure details carried by database errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbError {
    /// Message reported by the driver
    pub message: String,
    /// SQLSTATE (or vendor) code, when the driver reported one
    pub code: Option<String>,
    /// Interpolated SQL that was executing
    pub sql: Option<String>,
}

impl DbError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            sql: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    /// SQLSTATE class 23 covers every integrity constraint violation
    pub fn is_integrity_violation(&self) -> bool {
        match &self.code {
            Some(code) => code.starts_with("23"),
            None => self.message.contains("SQLSTATE[23"),
        }
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = &self.code {
            write!(f, "[{}] ", code)?;
        }
        write!(f, "{}", self.message)?;
        if let Some(sql) = &self.sql {
            write!(f, "\nThe SQL being executed was: {}", sql)?;
        }
        Ok(())
    }
}

/// The main error type for Burrow operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Database execution error
    #[error("Database error: {0}")]
    Database(DbError),

    /// The driver rejected a statement for violating a constraint
    #[error("Integrity constraint violation: {0}")]
    IntegrityConstraintViolation(DbError),

    /// The dialect has no syntax for the requested feature
    #[error("Unsupported operation: {message}")]
    UnsupportedOperation { message: String },

    /// Malformed builder input
    #[error("Invalid statement argument: {message}")]
    InvalidStatementArgument { message: String },

    /// No pool member could be reached
    #[error("Connection unavailable: {message}")]
    ConnectionUnavailable { message: String },

    /// An operation was called in a state that does not allow it
    #[error("Invalid call: {message}")]
    InvalidCall { message: String },

    /// Serialization error
    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

/// Convenience Result type for Burrow operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new generic database error
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database(DbError::new(message))
    }

    /// Create a new unsupported operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            message: message.into(),
        }
    }

    /// Create a new invalid statement argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidStatementArgument {
            message: message.into(),
        }
    }

    /// Create a new connection unavailable error
    pub fn connection_unavailable(message: impl Into<String>) -> Self {
        Self::ConnectionUnavailable {
            message: message.into(),
        }
    }

    /// Create a new invalid call error
    pub fn invalid_call(message: impl Into<String>) -> Self {
        Self::InvalidCall {
            message: message.into(),
        }
    }

    /// Driver details, if this error came from the database
    pub fn db_error(&self) -> Option<&DbError> {
        match self {
            Error::Database(e) | Error::IntegrityConstraintViolation(e) => Some(e),
            _ => None,
        }
    }

    /// Whether the error was raised while compiling rather than executing
    pub fn is_compile_error(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedOperation { .. } | Error::InvalidStatementArgument { .. }
        )
    }

    /// Classify a driver failure and attach the SQL that was running.
    ///
    /// Errors that already carry SQL, and errors that did not come from the
    /// database, are returned unchanged.
    pub fn with_statement(self, raw_sql: &str) -> Self {
        match self {
            Error::Database(e) if e.sql.is_none() => {
                let e = e.with_sql(raw_sql);
                if e.is_integrity_violation() {
                    Error::IntegrityConstraintViolation(e)
                } else {
                    Error::Database(e)
                }
            }
            Error::IntegrityConstraintViolation(e) if e.sql.is_none() => {
                Error::IntegrityConstraintViolation(e.with_sql(raw_sql))
            }
            other => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => {
                let mut e = DbError::new(db.message());
                if let Some(code) = db.code() {
                    e = e.with_code(code.into_owned());
                }
                Error::Database(e)
            }
            other @ (sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed) => {
                Error::connection_unavailable(other.to_string())
            }
            other => Error::database(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_error() {
        let err = Error::unsupported("generic does not support upsert statements.");
        assert!(matches!(err, Error::UnsupportedOperation { .. }));
        assert_eq!(
            err.to_string(),
            "Unsupported operation: generic does not support upsert statements."
        );
        assert!(err.is_compile_error());
    }

    #[test]
    fn test_invalid_argument_error() {
        let err = Error::invalid_argument("Operator 'NOT' requires exactly one operand.");
        assert_eq!(
            err.to_string(),
            "Invalid statement argument: Operator 'NOT' requires exactly one operand."
        );
    }

    #[test]
    fn test_with_statement_classifies_integrity_violation() {
        let err = Error::Database(DbError::new("duplicate key").with_code("23505"));
        let err = err.with_statement("INSERT INTO t VALUES (1)");
        match &err {
            Error::IntegrityConstraintViolation(e) => {
                assert_eq!(e.sql.as_deref(), Some("INSERT INTO t VALUES (1)"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(err.to_string().contains("The SQL being executed was: INSERT INTO t VALUES (1)"));
        assert!(err.to_string().contains("[23505] duplicate key"));
    }

    #[test]
    fn test_with_statement_keeps_generic_errors() {
        let err = Error::database("gone away").with_statement("SELECT 1");
        assert!(matches!(err, Error::Database(_)));
        assert_eq!(err.db_error().and_then(|e| e.sql.clone()).as_deref(), Some("SELECT 1"));

        let err = Error::invalid_call("nope").with_statement("SELECT 1");
        assert!(matches!(err, Error::InvalidCall { .. }));
    }

    #[test]
    fn test_sqlstate_in_message() {
        let e = DbError::new("SQLSTATE[23000]: Integrity constraint violation");
        assert!(e.is_integrity_violation());
        assert!(!DbError::new("timeout").is_integrity_violation());
    }
}
