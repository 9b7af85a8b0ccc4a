//! DDL statement assembly. The output is not validated against the database.

use super::QueryBuilder;
use crate::dialect::DatabaseBackend;
use crate::error::{Error, Result};
use crate::params::Params;
use crate::query::{split_columns, Query};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static TYPE_WITH_ARGS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\w+)\((.+?)\)(.*)$").expect("valid type pattern"));
static TYPE_WITH_REST: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\w+)\s+").expect("valid type pattern"));
static TYPE_ARGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(.+\)").expect("valid type pattern"));

/// Referential action of a foreign key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignKeyAction {
    Cascade,
    Restrict,
    SetNull,
    SetDefault,
    NoAction,
}

impl fmt::Display for ForeignKeyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ForeignKeyAction::Cascade => "CASCADE",
            ForeignKeyAction::Restrict => "RESTRICT",
            ForeignKeyAction::SetNull => "SET NULL",
            ForeignKeyAction::SetDefault => "SET DEFAULT",
            ForeignKeyAction::NoAction => "NO ACTION",
        })
    }
}

impl QueryBuilder {
    /// Physical type for an abstract one such as `string(64)` or `pk`.
    ///
    /// Unknown types pass through unchanged.
    pub fn column_type(&self, column_type: &str) -> String {
        let map = self.dialect().type_map();
        let lookup = |name: &str| map.iter().find(|(k, _)| *k == name).map(|(_, v)| *v);

        if let Some(mapped) = lookup(column_type) {
            return mapped.to_string();
        }
        if let Some(caps) = TYPE_WITH_ARGS.captures(column_type) {
            if let Some(mapped) = lookup(&caps[1]) {
                let args = format!("({})", &caps[2]);
                return format!("{}{}", TYPE_ARGS.replace(mapped, args.as_str()), &caps[3]);
            }
        } else if let Some(caps) = TYPE_WITH_REST.captures(column_type) {
            if let Some(mapped) = lookup(&caps[1]) {
                return format!("{}{}", mapped, &column_type[caps[1].len()..]);
            }
        }
        column_type.to_string()
    }

    fn quote_columns(&self, columns: &str) -> String {
        if columns.contains('(') {
            return columns.to_string();
        }
        split_columns(columns)
            .iter()
            .map(|c| self.quote_column_name(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `CREATE TABLE`; a column with an empty name is inlined verbatim
    pub fn create_table(&self, table: &str, columns: &[(&str, &str)], options: Option<&str>) -> String {
        let lines: Vec<String> = columns
            .iter()
            .map(|(name, definition)| {
                if name.is_empty() {
                    format!("\t{}", definition)
                } else {
                    format!("\t{} {}", self.quote_column_name(name), self.column_type(definition))
                }
            })
            .collect();
        let sql = format!(
            "CREATE TABLE {} (\n{}\n)",
            self.quote_table_name(table),
            lines.join(",\n")
        );
        match options {
            Some(options) => format!("{} {}", sql, options),
            None => sql,
        }
    }

    pub fn rename_table(&self, old_name: &str, new_name: &str) -> String {
        match self.dialect().backend() {
            DatabaseBackend::MySql | DatabaseBackend::Generic => format!(
                "RENAME TABLE {} TO {}",
                self.quote_table_name(old_name),
                self.quote_table_name(new_name)
            ),
            DatabaseBackend::Postgres | DatabaseBackend::Sqlite => format!(
                "ALTER TABLE {} RENAME TO {}",
                self.quote_table_name(old_name),
                self.quote_table_name(new_name)
            ),
        }
    }

    pub fn drop_table(&self, table: &str) -> String {
        format!("DROP TABLE {}", self.quote_table_name(table))
    }

    pub fn truncate_table(&self, table: &str) -> String {
        match self.dialect().backend() {
            DatabaseBackend::Sqlite => format!("DELETE FROM {}", self.quote_table_name(table)),
            _ => format!("TRUNCATE TABLE {}", self.quote_table_name(table)),
        }
    }

    pub fn add_column(&self, table: &str, column: &str, column_type: &str) -> String {
        format!(
            "ALTER TABLE {} ADD {} {}",
            self.quote_table_name(table),
            self.quote_column_name(column),
            self.column_type(column_type)
        )
    }

    pub fn drop_column(&self, table: &str, column: &str) -> String {
        format!(
            "ALTER TABLE {} DROP COLUMN {}",
            self.quote_table_name(table),
            self.quote_column_name(column)
        )
    }

    pub fn rename_column(&self, table: &str, old_name: &str, new_name: &str) -> String {
        format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            self.quote_table_name(table),
            self.quote_column_name(old_name),
            self.quote_column_name(new_name)
        )
    }

    pub fn alter_column(&self, table: &str, column: &str, column_type: &str) -> Result<String> {
        let table_name = self.quote_table_name(table);
        let column_name = self.quote_column_name(column);
        match self.dialect().backend() {
            DatabaseBackend::Postgres => Ok(format!(
                "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
                table_name,
                column_name,
                self.column_type(column_type)
            )),
            DatabaseBackend::Sqlite => Err(Error::unsupported(
                "sqlite does not support altering columns.",
            )),
            _ => Ok(format!(
                "ALTER TABLE {} CHANGE {} {} {}",
                table_name,
                column_name,
                column_name,
                self.column_type(column_type)
            )),
        }
    }

    pub fn add_primary_key(&self, name: &str, table: &str, columns: &str) -> String {
        format!(
            "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({})",
            self.quote_table_name(table),
            self.quote_column_name(name),
            self.quote_columns(columns)
        )
    }

    pub fn drop_primary_key(&self, name: &str, table: &str) -> String {
        self.drop_constraint(name, table)
    }

    fn drop_constraint(&self, name: &str, table: &str) -> String {
        format!(
            "ALTER TABLE {} DROP CONSTRAINT {}",
            self.quote_table_name(table),
            self.quote_column_name(name)
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_foreign_key(
        &self,
        name: &str,
        table: &str,
        columns: &str,
        ref_table: &str,
        ref_columns: &str,
        on_delete: Option<ForeignKeyAction>,
        on_update: Option<ForeignKeyAction>,
    ) -> String {
        let mut sql = format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
            self.quote_table_name(table),
            self.quote_column_name(name),
            self.quote_columns(columns),
            self.quote_table_name(ref_table),
            self.quote_columns(ref_columns)
        );
        if let Some(action) = on_delete {
            sql.push_str(&format!(" ON DELETE {}", action));
        }
        if let Some(action) = on_update {
            sql.push_str(&format!(" ON UPDATE {}", action));
        }
        sql
    }

    pub fn drop_foreign_key(&self, name: &str, table: &str) -> String {
        self.drop_constraint(name, table)
    }

    pub fn create_index(&self, name: &str, table: &str, columns: &str, unique: bool) -> String {
        format!(
            "{} {} ON {} ({})",
            if unique { "CREATE UNIQUE INDEX" } else { "CREATE INDEX" },
            self.quote_table_name(name),
            self.quote_table_name(table),
            self.quote_columns(columns)
        )
    }

    pub fn drop_index(&self, name: &str, table: &str) -> String {
        match self.dialect().backend() {
            DatabaseBackend::Postgres | DatabaseBackend::Sqlite => {
                format!("DROP INDEX {}", self.quote_table_name(name))
            }
            _ => format!(
                "DROP INDEX {} ON {}",
                self.quote_table_name(name),
                self.quote_table_name(table)
            ),
        }
    }

    pub fn add_unique(&self, name: &str, table: &str, columns: &str) -> String {
        format!(
            "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})",
            self.quote_table_name(table),
            self.quote_column_name(name),
            self.quote_columns(columns)
        )
    }

    pub fn drop_unique(&self, name: &str, table: &str) -> String {
        self.drop_constraint(name, table)
    }

    pub fn add_check(&self, name: &str, table: &str, expression: &str) -> String {
        format!(
            "ALTER TABLE {} ADD CONSTRAINT {} CHECK ({})",
            self.quote_table_name(table),
            self.quote_column_name(name),
            expression
        )
    }

    pub fn drop_check(&self, name: &str, table: &str) -> String {
        self.drop_constraint(name, table)
    }

    pub fn add_comment_on_column(&self, table: &str, column: &str, comment: &str) -> String {
        format!(
            "COMMENT ON COLUMN {}.{} IS {}",
            self.quote_table_name(table),
            self.quote_column_name(column),
            self.quote_value(comment)
        )
    }

    pub fn add_comment_on_table(&self, table: &str, comment: &str) -> String {
        format!(
            "COMMENT ON TABLE {} IS {}",
            self.quote_table_name(table),
            self.quote_value(comment)
        )
    }

    pub fn drop_comment_from_column(&self, table: &str, column: &str) -> String {
        format!(
            "COMMENT ON COLUMN {}.{} IS NULL",
            self.quote_table_name(table),
            self.quote_column_name(column)
        )
    }

    pub fn drop_comment_from_table(&self, table: &str) -> String {
        format!("COMMENT ON TABLE {} IS NULL", self.quote_table_name(table))
    }

    /// `CREATE VIEW`; subquery params are inlined as literals
    pub fn create_view(&self, name: &str, query: &Query) -> Result<String> {
        let (sql, params) = self.build(query, Params::new())?;
        let sql = self.inline_params(&sql, &params)?;
        Ok(format!("CREATE VIEW {} AS {}", self.quote_table_name(name), sql))
    }

    pub fn drop_view(&self, name: &str) -> String {
        format!("DROP VIEW {}", self.quote_table_name(name))
    }

    /// Reset the auto-increment sequence; `value` defaults to max + 1
    pub fn reset_sequence(
        &self,
        table: &str,
        sequence: Option<&str>,
        primary_key: Option<&str>,
        value: Option<i64>,
    ) -> Result<String> {
        self.dialect().reset_sequence_sql(table, sequence, primary_key, value)
    }

    pub fn check_integrity(&self, check: bool, schema: &str, table: &str) -> Result<String> {
        self.dialect().check_integrity_sql(check, schema, table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{GenericDialect, MySqlDialect, PostgresDialect, SqliteDialect};
    use crate::hash;
    use std::sync::Arc;

    fn mysql() -> QueryBuilder {
        QueryBuilder::new(Arc::new(MySqlDialect))
    }

    #[test]
    fn test_column_type_mapping() {
        let qb = mysql();
        assert_eq!(qb.column_type("pk"), "int(11) NOT NULL AUTO_INCREMENT PRIMARY KEY");
        assert_eq!(qb.column_type("string(64)"), "varchar(64)");
        assert_eq!(qb.column_type("string(64) NOT NULL"), "varchar(64) NOT NULL");
        assert_eq!(qb.column_type("integer NOT NULL"), "int(11) NOT NULL");
        assert_eq!(qb.column_type("text(10)"), "text");
        assert_eq!(qb.column_type("geometry"), "geometry");
    }

    #[test]
    fn test_create_table() {
        let sql = mysql().create_table(
            "user",
            &[("id", "pk"), ("name", "string"), ("", "UNIQUE KEY (name)")],
            Some("ENGINE=InnoDB"),
        );
        assert_eq!(
            sql,
            "CREATE TABLE `user` (\n\t`id` int(11) NOT NULL AUTO_INCREMENT PRIMARY KEY,\n\t`name` varchar(255),\n\tUNIQUE KEY (name)\n) ENGINE=InnoDB"
        );
    }

    #[test]
    fn test_table_and_column_statements() {
        let qb = mysql();
        assert_eq!(qb.rename_table("a", "b"), "RENAME TABLE `a` TO `b`");
        assert_eq!(
            QueryBuilder::new(Arc::new(PostgresDialect)).rename_table("a", "b"),
            "ALTER TABLE \"a\" RENAME TO \"b\""
        );
        assert_eq!(qb.truncate_table("a"), "TRUNCATE TABLE `a`");
        assert_eq!(
            QueryBuilder::new(Arc::new(SqliteDialect)).truncate_table("a"),
            "DELETE FROM `a`"
        );
        assert_eq!(qb.add_column("a", "c", "boolean"), "ALTER TABLE `a` ADD `c` tinyint(1)");
        assert_eq!(qb.drop_column("a", "c"), "ALTER TABLE `a` DROP COLUMN `c`");
        assert_eq!(
            qb.rename_column("a", "c", "d"),
            "ALTER TABLE `a` RENAME COLUMN `c` TO `d`"
        );
        assert_eq!(
            qb.alter_column("a", "c", "string").unwrap(),
            "ALTER TABLE `a` CHANGE `c` `c` varchar(255)"
        );
        assert!(QueryBuilder::new(Arc::new(SqliteDialect))
            .alter_column("a", "c", "string")
            .is_err());
    }

    #[test]
    fn test_constraints() {
        let qb = mysql();
        assert_eq!(
            qb.add_primary_key("pk_ab", "t", "a, b"),
            "ALTER TABLE `t` ADD CONSTRAINT `pk_ab` PRIMARY KEY (`a`, `b`)"
        );
        assert_eq!(
            qb.add_foreign_key(
                "fk",
                "order",
                "user_id",
                "user",
                "id",
                Some(ForeignKeyAction::Cascade),
                Some(ForeignKeyAction::SetNull)
            ),
            "ALTER TABLE `order` ADD CONSTRAINT `fk` FOREIGN KEY (`user_id`) REFERENCES `user` (`id`) ON DELETE CASCADE ON UPDATE SET NULL"
        );
        assert_eq!(
            qb.create_index("idx", "t", "a,b", true),
            "CREATE UNIQUE INDEX `idx` ON `t` (`a`, `b`)"
        );
        assert_eq!(qb.drop_index("idx", "t"), "DROP INDEX `idx` ON `t`");
        assert_eq!(
            QueryBuilder::new(Arc::new(PostgresDialect)).drop_index("idx", "t"),
            "DROP INDEX \"idx\""
        );
        assert_eq!(
            qb.add_unique("uq", "t", "email"),
            "ALTER TABLE `t` ADD CONSTRAINT `uq` UNIQUE (`email`)"
        );
        assert_eq!(
            qb.add_check("ck", "t", "age > 0"),
            "ALTER TABLE `t` ADD CONSTRAINT `ck` CHECK (age > 0)"
        );
        assert_eq!(qb.drop_check("ck", "t"), "ALTER TABLE `t` DROP CONSTRAINT `ck`");
    }

    #[test]
    fn test_comments() {
        let qb = QueryBuilder::new(Arc::new(PostgresDialect));
        assert_eq!(
            qb.add_comment_on_column("t", "c", "it's"),
            "COMMENT ON COLUMN \"t\".\"c\" IS 'it''s'"
        );
        assert_eq!(qb.drop_comment_from_table("t"), "COMMENT ON TABLE \"t\" IS NULL");
    }

    #[test]
    fn test_create_view_inlines_params() {
        let qb = mysql();
        let query = Query::new()
            .from("user")
            .where_(hash! {"status" => "active", "age" => 18});
        assert_eq!(
            qb.create_view("v", &query).unwrap(),
            "CREATE VIEW `v` AS SELECT * FROM `user` WHERE `status` = 'active' AND `age` = 18"
        );
        assert_eq!(qb.drop_view("v"), "DROP VIEW `v`");
    }

    #[test]
    fn test_sequence_and_integrity() {
        let qb = QueryBuilder::new(Arc::new(PostgresDialect));
        assert_eq!(
            qb.reset_sequence("user", Some("user_id_seq"), Some("id"), None).unwrap(),
            "SELECT SETVAL('\"user_id_seq\"',(SELECT COALESCE(MAX(\"id\"),0) FROM \"user\")+1,false)"
        );
        assert_eq!(
            qb.check_integrity(false, "public", "user").unwrap(),
            "ALTER TABLE \"public\".\"user\" DISABLE TRIGGER ALL"
        );
        let generic = QueryBuilder::new(Arc::new(GenericDialect::new("odbc")));
        assert!(generic.reset_sequence("t", None, None, None).is_err());
        assert!(generic.check_integrity(true, "", "t").is_err());
    }
}
