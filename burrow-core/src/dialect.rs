//! Database dialects: identifier and value quoting, placeholder style,
//! type maps and the syntax differences the query builder has to know about.

use crate::builder::registry::{ExpressionBuilders, ExpressionFamily};
use crate::builder::values::{ArrayBuilder, JsonBuilder, JsonCast};
use crate::error::{Error, Result};
use crate::executor::IsolationLevel;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::fmt;
use std::sync::Arc;

/// Database backend types supported by burrow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackend {
    Generic,
    MySql,
    Postgres,
    Sqlite,
}

/// Syntax used to emit upserts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertSyntax {
    /// `INSERT ... ON DUPLICATE KEY UPDATE c=VALUES(c)`
    OnDuplicateKey,
    /// `INSERT ... ON CONFLICT (keys) DO UPDATE SET c=EXCLUDED.c`
    OnConflict,
}

/// Trait for database-specific SQL generation
pub trait SqlDialect: Send + Sync + fmt::Debug {
    fn backend(&self) -> DatabaseBackend;

    /// Driver name used in messages, e.g. `mysql`
    fn driver_name(&self) -> &str;

    /// Character wrapping quoted identifiers
    fn quote_char(&self) -> char {
        '"'
    }

    /// Quote a string literal for inlining into SQL
    fn quote_value(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    /// Whether `\` escapes the next character inside string literals
    fn backslash_escapes(&self) -> bool {
        false
    }

    /// Placeholder for the 1-based parameter `position`
    fn placeholder(&self, _position: usize) -> String {
        "?".to_string()
    }

    /// Abstract column type to physical type
    fn type_map(&self) -> &'static [(&'static str, &'static str)] {
        &[]
    }

    fn supports_savepoint(&self) -> bool {
        true
    }

    fn begin_sql(&self) -> &'static str {
        "BEGIN"
    }

    /// Statement setting the isolation level of a transaction
    fn isolation_level_sql(&self, level: IsolationLevel) -> Result<String> {
        Ok(format!("SET TRANSACTION ISOLATION LEVEL {}", level.to_sql()))
    }

    /// Suffix appended to each LIKE part
    fn like_escape_sql(&self) -> Option<&'static str> {
        None
    }

    fn upsert_syntax(&self) -> Option<UpsertSyntax> {
        None
    }

    /// Hook for dialect-specific expression builders
    fn register_builders(&self, _builders: &mut ExpressionBuilders) {}

    /// SQL resetting the auto-increment sequence of `table`
    fn reset_sequence_sql(
        &self,
        _table: &str,
        _sequence: Option<&str>,
        _primary_key: Option<&str>,
        _value: Option<i64>,
    ) -> Result<String> {
        Err(Error::unsupported(format!(
            "{} does not support resetting sequence.",
            self.driver_name()
        )))
    }

    /// SQL toggling foreign key checks
    fn check_integrity_sql(&self, _check: bool, _schema: &str, _table: &str) -> Result<String> {
        Err(Error::unsupported(format!(
            "{} does not support enabling/disabling integrity check.",
            self.driver_name()
        )))
    }

    fn quote_simple_table_name(&self, name: &str) -> String {
        let q = self.quote_char();
        if name.contains(q) {
            name.to_string()
        } else {
            format!("{q}{name}{q}")
        }
    }

    fn quote_simple_column_name(&self, name: &str) -> String {
        let q = self.quote_char();
        if name.contains(q) || name == "*" {
            name.to_string()
        } else {
            format!("{q}{name}{q}")
        }
    }

    /// Quote a possibly schema-qualified table name.
    ///
    /// Names containing `(` or `{{` are left alone.
    fn quote_table_name(&self, name: &str) -> String {
        if name.contains('(') || name.contains("{{") {
            return name.to_string();
        }
        if !name.contains('.') {
            return self.quote_simple_table_name(name);
        }
        name.split('.')
            .map(|part| self.quote_simple_table_name(part))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Quote a possibly table-prefixed column name.
    ///
    /// Names containing `(` or `[[` are left alone.
    fn quote_column_name(&self, name: &str) -> String {
        if name.contains('(') || name.contains("[[") {
            return name.to_string();
        }
        let (prefix, column) = match name.rfind('.') {
            Some(pos) => (
                format!("{}.", self.quote_table_name(&name[..pos])),
                &name[pos + 1..],
            ),
            None => (String::new(), name),
        };
        if column.contains("{{") {
            return name.to_string();
        }
        format!("{}{}", prefix, self.quote_simple_column_name(column))
    }
}

static QUOTE_SQL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\{\{(%?[\w\-\. ]+%?)\}\}|\[\[([\w\-\. ]+)\]\])").expect("valid quote pattern")
});

/// Replace `{{table}}` and `[[column]]` tokens with quoted names.
///
/// `%` inside a table token is replaced by `prefix`.
pub fn quote_sql(dialect: &dyn SqlDialect, prefix: &str, sql: &str) -> String {
    QUOTE_SQL
        .replace_all(sql, |caps: &Captures<'_>| {
            if let Some(column) = caps.get(3) {
                dialect.quote_column_name(column.as_str())
            } else {
                let table = caps.get(2).map_or("", |m| m.as_str()).replace('%', prefix);
                dialect.quote_table_name(&table)
            }
        })
        .into_owned()
}

/// Fallback dialect for drivers without specific support
#[derive(Debug, Clone)]
pub struct GenericDialect {
    driver: String,
}

impl GenericDialect {
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
        }
    }
}

impl SqlDialect for GenericDialect {
    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::Generic
    }

    fn driver_name(&self) -> &str {
        &self.driver
    }
}

#[derive(Debug, Clone, Default)]
pub struct MySqlDialect;

impl SqlDialect for MySqlDialect {
    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::MySql
    }

    fn driver_name(&self) -> &str {
        "mysql"
    }

    fn quote_char(&self) -> char {
        '`'
    }

    fn quote_value(&self, value: &str) -> String {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
    }

    fn backslash_escapes(&self) -> bool {
        true
    }

    fn type_map(&self) -> &'static [(&'static str, &'static str)] {
        &[
            ("pk", "int(11) NOT NULL AUTO_INCREMENT PRIMARY KEY"),
            ("upk", "int(10) UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY"),
            ("bigpk", "bigint(20) NOT NULL AUTO_INCREMENT PRIMARY KEY"),
            ("ubigpk", "bigint(20) UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY"),
            ("char", "char(1)"),
            ("string", "varchar(255)"),
            ("text", "text"),
            ("tinyint", "tinyint(3)"),
            ("smallint", "smallint(6)"),
            ("integer", "int(11)"),
            ("bigint", "bigint(20)"),
            ("float", "float"),
            ("double", "double"),
            ("decimal", "decimal(10,0)"),
            ("datetime", "datetime"),
            ("timestamp", "timestamp"),
            ("time", "time"),
            ("date", "date"),
            ("binary", "blob"),
            ("boolean", "tinyint(1)"),
            ("money", "decimal(19,4)"),
            ("json", "json"),
        ]
    }

    fn begin_sql(&self) -> &'static str {
        "START TRANSACTION"
    }

    fn upsert_syntax(&self) -> Option<UpsertSyntax> {
        Some(UpsertSyntax::OnDuplicateKey)
    }

    fn register_builders(&self, builders: &mut ExpressionBuilders) {
        builders.register(ExpressionFamily::Json, Arc::new(JsonBuilder::new(JsonCast::CastAs)));
    }

    fn reset_sequence_sql(
        &self,
        table: &str,
        _sequence: Option<&str>,
        _primary_key: Option<&str>,
        value: Option<i64>,
    ) -> Result<String> {
        // InnoDB raises a value below the current maximum to max + 1
        Ok(format!(
            "ALTER TABLE {} AUTO_INCREMENT={}",
            self.quote_table_name(table),
            value.unwrap_or(1)
        ))
    }

    fn check_integrity_sql(&self, check: bool, _schema: &str, _table: &str) -> Result<String> {
        Ok(format!("SET FOREIGN_KEY_CHECKS = {}", i32::from(check)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::Postgres
    }

    fn driver_name(&self) -> &str {
        "pgsql"
    }

    fn placeholder(&self, position: usize) -> String {
        format!("${}", position)
    }

    fn type_map(&self) -> &'static [(&'static str, &'static str)] {
        &[
            ("pk", "serial NOT NULL PRIMARY KEY"),
            ("upk", "serial NOT NULL PRIMARY KEY"),
            ("bigpk", "bigserial NOT NULL PRIMARY KEY"),
            ("ubigpk", "bigserial NOT NULL PRIMARY KEY"),
            ("char", "char(1)"),
            ("string", "varchar(255)"),
            ("text", "text"),
            ("tinyint", "smallint"),
            ("smallint", "smallint"),
            ("integer", "integer"),
            ("bigint", "bigint"),
            ("float", "double precision"),
            ("double", "double precision"),
            ("decimal", "numeric(10,0)"),
            ("datetime", "timestamp(0)"),
            ("timestamp", "timestamp(0)"),
            ("time", "time(0)"),
            ("date", "date"),
            ("binary", "bytea"),
            ("boolean", "boolean"),
            ("money", "numeric(19,4)"),
            ("json", "jsonb"),
        ]
    }

    fn upsert_syntax(&self) -> Option<UpsertSyntax> {
        Some(UpsertSyntax::OnConflict)
    }

    fn register_builders(&self, builders: &mut ExpressionBuilders) {
        builders.register(ExpressionFamily::Array, Arc::new(ArrayBuilder));
        builders.register(ExpressionFamily::Json, Arc::new(JsonBuilder::new(JsonCast::Suffix)));
    }

    fn reset_sequence_sql(
        &self,
        table: &str,
        sequence: Option<&str>,
        primary_key: Option<&str>,
        value: Option<i64>,
    ) -> Result<String> {
        let sequence = sequence.ok_or_else(|| {
            Error::invalid_argument(format!("There is no sequence associated with table '{}'.", table))
        })?;
        let sequence = self.quote_value(&self.quote_table_name(sequence));
        let value = match (value, primary_key) {
            (Some(v), _) => v.to_string(),
            (None, Some(pk)) => format!(
                "(SELECT COALESCE(MAX({}),0) FROM {})+1",
                self.quote_column_name(pk),
                self.quote_table_name(table)
            ),
            (None, None) => "1".to_string(),
        };
        Ok(format!("SELECT SETVAL({},{},false)", sequence, value))
    }

    fn check_integrity_sql(&self, check: bool, schema: &str, table: &str) -> Result<String> {
        let qualified = if schema.is_empty() {
            self.quote_table_name(table)
        } else {
            self.quote_table_name(&format!("{}.{}", schema, table))
        };
        let action = if check { "ENABLE" } else { "DISABLE" };
        Ok(format!("ALTER TABLE {} {} TRIGGER ALL", qualified, action))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::Sqlite
    }

    fn driver_name(&self) -> &str {
        "sqlite"
    }

    fn quote_char(&self) -> char {
        '`'
    }

    fn type_map(&self) -> &'static [(&'static str, &'static str)] {
        &[
            ("pk", "integer PRIMARY KEY AUTOINCREMENT NOT NULL"),
            ("upk", "integer UNSIGNED PRIMARY KEY AUTOINCREMENT NOT NULL"),
            ("bigpk", "integer PRIMARY KEY AUTOINCREMENT NOT NULL"),
            ("ubigpk", "integer UNSIGNED PRIMARY KEY AUTOINCREMENT NOT NULL"),
            ("char", "char(1)"),
            ("string", "varchar(255)"),
            ("text", "text"),
            ("tinyint", "tinyint"),
            ("smallint", "smallint"),
            ("integer", "integer"),
            ("bigint", "bigint"),
            ("float", "float"),
            ("double", "double"),
            ("decimal", "decimal(10,0)"),
            ("datetime", "datetime"),
            ("timestamp", "timestamp"),
            ("time", "time"),
            ("date", "date"),
            ("binary", "blob"),
            ("boolean", "boolean"),
            ("money", "decimal(19,4)"),
            ("json", "text"),
        ]
    }

    fn like_escape_sql(&self) -> Option<&'static str> {
        Some(" ESCAPE '\\'")
    }

    fn isolation_level_sql(&self, level: IsolationLevel) -> Result<String> {
        match level {
            IsolationLevel::Serializable => Ok("PRAGMA read_uncommitted = False;".to_string()),
            IsolationLevel::ReadUncommitted => Ok("PRAGMA read_uncommitted = True;".to_string()),
            _ => Err(Error::unsupported(
                "sqlite only supports transaction isolation levels READ UNCOMMITTED and SERIALIZABLE.",
            )),
        }
    }

    fn upsert_syntax(&self) -> Option<UpsertSyntax> {
        Some(UpsertSyntax::OnConflict)
    }

    fn register_builders(&self, builders: &mut ExpressionBuilders) {
        builders.register(ExpressionFamily::Json, Arc::new(JsonBuilder::new(JsonCast::None)));
    }

    fn reset_sequence_sql(
        &self,
        table: &str,
        _sequence: Option<&str>,
        _primary_key: Option<&str>,
        value: Option<i64>,
    ) -> Result<String> {
        let value = match value {
            Some(v) => format!("'{}'", v - 1),
            None => format!("(SELECT MAX(`rowid`) FROM {})", self.quote_table_name(table)),
        };
        Ok(format!(
            "UPDATE sqlite_sequence SET seq={} WHERE name={}",
            value,
            self.quote_value(table)
        ))
    }

    fn check_integrity_sql(&self, check: bool, _schema: &str, _table: &str) -> Result<String> {
        Ok(format!("PRAGMA foreign_keys={}", i32::from(check)))
    }
}

/// Pick a dialect from a DSN scheme
pub fn dialect_for(driver: &str) -> Arc<dyn SqlDialect> {
    match driver.to_ascii_lowercase().as_str() {
        "mysql" | "mariadb" => Arc::new(MySqlDialect),
        "pgsql" | "postgres" | "postgresql" => Arc::new(PostgresDialect),
        "sqlite" => Arc::new(SqliteDialect),
        other => Arc::new(GenericDialect::new(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_table_name() {
        let d = PostgresDialect;
        assert_eq!(d.quote_table_name("user"), "\"user\"");
        assert_eq!(d.quote_table_name("public.user"), "\"public\".\"user\"");
        assert_eq!(d.quote_table_name("(SELECT 1)"), "(SELECT 1)");
        assert_eq!(d.quote_table_name("{{user}}"), "{{user}}");
        assert_eq!(d.quote_table_name("\"user\""), "\"user\"");
    }

    #[test]
    fn test_quote_column_name() {
        let d = MySqlDialect;
        assert_eq!(d.quote_column_name("id"), "`id`");
        assert_eq!(d.quote_column_name("u.id"), "`u`.`id`");
        assert_eq!(d.quote_column_name("u.*"), "`u`.*");
        assert_eq!(d.quote_column_name("COUNT(*)"), "COUNT(*)");
        assert_eq!(d.quote_column_name("[[id]]"), "[[id]]");
    }

    #[test]
    fn test_quote_sql_tokens() {
        let d = MySqlDialect;
        assert_eq!(
            quote_sql(&d, "tbl_", "SELECT [[id]] FROM {{%user}} WHERE {{t}}.[[a]] = 1"),
            "SELECT `id` FROM `tbl_user` WHERE `t`.`a` = 1"
        );
    }

    #[test]
    fn test_quote_value() {
        assert_eq!(GenericDialect::new("x").quote_value("it's"), "'it''s'");
        assert_eq!(MySqlDialect.quote_value("a\\b"), "'a\\\\b'");
        assert_eq!(PostgresDialect.quote_value("C:\\"), "'C:\\'");
        assert!(MySqlDialect.backslash_escapes());
        assert!(!PostgresDialect.backslash_escapes());
        assert!(!SqliteDialect.backslash_escapes());
    }

    #[test]
    fn test_dialect_selection() {
        assert_eq!(dialect_for("MySQL").backend(), DatabaseBackend::MySql);
        assert_eq!(dialect_for("postgres").placeholder(2), "$2");
        assert_eq!(dialect_for("sqlite").like_escape_sql(), Some(" ESCAPE '\\'"));
        let generic = dialect_for("odbc");
        assert_eq!(generic.driver_name(), "odbc");
        assert!(generic.upsert_syntax().is_none());
    }

    #[test]
    fn test_generic_sequence_unsupported() {
        let err = GenericDialect::new("odbc")
            .reset_sequence_sql("t", None, None, None)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unsupported operation: odbc does not support resetting sequence."
        );
        let err = GenericDialect::new("odbc").check_integrity_sql(true, "", "t").unwrap_err();
        assert!(err.to_string().contains("enabling/disabling integrity check."));
    }

    #[test]
    fn test_isolation_level_sql() {
        assert_eq!(
            MySqlDialect.isolation_level_sql(IsolationLevel::ReadCommitted).unwrap(),
            "SET TRANSACTION ISOLATION LEVEL READ COMMITTED"
        );
        assert_eq!(
            SqliteDialect.isolation_level_sql(IsolationLevel::Serializable).unwrap(),
            "PRAGMA read_uncommitted = False;"
        );
        assert!(SqliteDialect
            .isolation_level_sql(IsolationLevel::RepeatableRead)
            .is_err());
    }
}
