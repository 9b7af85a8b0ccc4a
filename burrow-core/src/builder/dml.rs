//! INSERT, UPDATE, DELETE, batch insert and upsert statements

use super::{QueryBuilder, SELECT_ALIAS};
use crate::dialect::UpsertSyntax;
use crate::error::{Error, Result};
use crate::expression::{Expression, Operand};
use crate::params::Params;
use crate::query::{Column, Query};
use crate::schema::{Constraint, TableSchema};
use crate::value::Value;
use std::collections::HashSet;

/// Rows for an INSERT: column/value pairs or a SELECT
#[derive(Debug, Clone)]
pub enum InsertSource {
    Values(Vec<(String, Operand)>),
    Query(Query),
}

impl InsertSource {
    pub fn values<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Operand>,
    {
        InsertSource::Values(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl From<Query> for InsertSource {
    fn from(q: Query) -> Self {
        InsertSource::Query(q)
    }
}

impl From<Vec<(String, Operand)>> for InsertSource {
    fn from(pairs: Vec<(String, Operand)>) -> Self {
        InsertSource::Values(pairs)
    }
}

/// What an upsert does with an existing row
#[derive(Debug, Clone)]
pub enum UpsertUpdate {
    /// Overwrite every inserted column outside the conflict key
    All,
    /// Keep the existing row
    Nothing,
    /// Apply these assignments
    Columns(Vec<(String, Operand)>),
}

impl QueryBuilder {
    fn typecast(&self, schema: Option<&TableSchema>, name: &str, value: &Operand) -> Result<Operand> {
        match schema.and_then(|s| s.column(name)) {
            Some(column) => column.db_typecast(value.clone()),
            None => Ok(value.clone()),
        }
    }

    fn insert_value(&self, value: &Operand, params: &mut Params) -> Result<String> {
        match value {
            Operand::Expr(e) => self.build_expression(e, params),
            other => self.bind_operand(other, params),
        }
    }

    /// Quoted target columns of an `INSERT ... SELECT`
    fn insert_select_names(&self, query: &Query) -> Result<Vec<String>> {
        let enumerated = !query.select.is_empty()
            && !query
                .select
                .iter()
                .any(|c| matches!(&c.column, Column::Name(n) if n == "*"));
        if !enumerated {
            return Err(Error::invalid_argument(
                "Expected select query object with enumerated (named) parameters",
            ));
        }
        let mut names = Vec::with_capacity(query.select.len());
        for item in &query.select {
            let name = match (&item.alias, &item.column) {
                (Some(alias), _) => alias.clone(),
                (None, Column::Name(field)) => match SELECT_ALIAS.captures(field) {
                    Some(caps) => caps[2].to_string(),
                    None => field.clone(),
                },
                (None, Column::Expr(_)) => {
                    return Err(Error::invalid_argument(
                        "Expected select query object with enumerated (named) parameters",
                    ))
                }
            };
            names.push(self.quote_column_name(&name));
        }
        Ok(names)
    }

    /// `INSERT INTO t (a, b) VALUES (?, ?)`.
    ///
    /// With `with_update` every inserted column is overwritten on a duplicate
    /// key, MySQL style.
    pub fn insert(
        &self,
        table: &str,
        source: &InsertSource,
        schema: Option<&TableSchema>,
        with_update: bool,
        params: &mut Params,
    ) -> Result<String> {
        let (names, values) = match source {
            InsertSource::Query(query) => {
                let names = self.insert_select_names(query)?;
                let sql = self.build_into(query, params)?;
                (names, format!(" {}", sql))
            }
            InsertSource::Values(pairs) if pairs.is_empty() => (Vec::new(), " DEFAULT VALUES".to_string()),
            InsertSource::Values(pairs) => {
                let mut names = Vec::with_capacity(pairs.len());
                let mut placeholders = Vec::with_capacity(pairs.len());
                for (name, value) in pairs {
                    names.push(self.quote_column_name(name));
                    let value = self.typecast(schema, name, value)?;
                    placeholders.push(self.insert_value(&value, params)?);
                }
                (names, format!(" VALUES ({})", placeholders.join(", ")))
            }
        };

        let mut sql = format!("INSERT INTO {}", self.quote_table_name(table));
        if !names.is_empty() {
            sql.push_str(&format!(" ({})", names.join(", ")));
        }
        sql.push_str(&values);
        if with_update && !names.is_empty() {
            let updates: Vec<String> = names.iter().map(|n| format!("{}=VALUES({})", n, n)).collect();
            sql.push_str(" ON DUPLICATE KEY UPDATE ");
            sql.push_str(&updates.join(", "));
        }
        Ok(sql)
    }

    fn update_sets(
        &self,
        columns: &[(String, Operand)],
        schema: Option<&TableSchema>,
        params: &mut Params,
    ) -> Result<Vec<String>> {
        let mut sets = Vec::with_capacity(columns.len());
        for (name, value) in columns {
            let value = self.typecast(schema, name, value)?;
            let placeholder = self.insert_value(&value, params)?;
            sets.push(format!("{}={}", self.quote_column_name(name), placeholder));
        }
        Ok(sets)
    }

    /// `UPDATE t SET a=?, b=? WHERE ...`
    pub fn update(
        &self,
        table: &str,
        columns: &[(String, Operand)],
        condition: &Operand,
        schema: Option<&TableSchema>,
        params: &mut Params,
    ) -> Result<String> {
        let sets = self.update_sets(columns, schema, params)?;
        let sql = format!("UPDATE {} SET {}", self.quote_table_name(table), sets.join(", "));
        let where_ = self.build_where(Some(condition), params)?;
        Ok(if where_.is_empty() {
            sql
        } else {
            format!("{} {}", sql, where_)
        })
    }

    /// `DELETE FROM t WHERE ...`
    pub fn delete(&self, table: &str, condition: &Operand, params: &mut Params) -> Result<String> {
        let sql = format!("DELETE FROM {}", self.quote_table_name(table));
        let where_ = self.build_where(Some(condition), params)?;
        Ok(if where_.is_empty() {
            sql
        } else {
            format!("{} {}", sql, where_)
        })
    }

    /// One INSERT with every row inlined as literals.
    ///
    /// Returns an empty string when there are no rows.
    pub fn batch_insert(
        &self,
        table: &str,
        columns: &[&str],
        rows: &[Vec<Operand>],
        schema: Option<&TableSchema>,
        params: &mut Params,
    ) -> Result<String> {
        if rows.is_empty() {
            return Ok(String::new());
        }
        let mut tuples = Vec::with_capacity(rows.len());
        for row in rows {
            let mut literals = Vec::with_capacity(row.len());
            for (i, value) in row.iter().enumerate() {
                let value = match columns.get(i) {
                    Some(name) => self.typecast(schema, name, value)?,
                    None => value.clone(),
                };
                literals.push(match &value {
                    Operand::Value(v) => self.literal(v),
                    Operand::Expr(e) => self.build_expression(e, params)?,
                    _ => {
                        return Err(Error::invalid_argument(
                            "Batch insert values must be scalars or expressions",
                        ))
                    }
                });
            }
            tuples.push(format!("({})", literals.join(", ")));
        }
        let names: Vec<String> = columns.iter().map(|c| self.quote_column_name(c)).collect();
        Ok(format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.quote_table_name(table),
            names.join(", "),
            tuples.join(", ")
        ))
    }

    /// Quoted column sets of the table's unique constraints covered by
    /// `insert_names`, plus the resulting update columns.
    ///
    /// Returns `(unique_names, insert_names, update_names)`; `update_names`
    /// is only computed for [`UpsertUpdate::All`].
    pub fn prepare_upsert_columns(
        &self,
        source: &InsertSource,
        update: &UpsertUpdate,
        schema: Option<&TableSchema>,
    ) -> Result<(Vec<String>, Vec<String>, Option<Vec<String>>)> {
        let insert_names = match source {
            InsertSource::Query(query) => self.insert_select_names(query)?,
            InsertSource::Values(pairs) => pairs.iter().map(|(n, _)| self.quote_column_name(n)).collect(),
        };

        let mut unique_names: Vec<String> = Vec::new();
        if let Some(table) = schema {
            let mut constraints: Vec<Vec<String>> = Vec::new();
            match &table.constraints.primary_key {
                Some(Constraint { column_names, .. }) => constraints.push(column_names.clone()),
                None if !table.primary_key.is_empty() => constraints.push(table.primary_key.clone()),
                None => {}
            }
            constraints.extend(
                table
                    .constraints
                    .indexes
                    .iter()
                    .filter(|i| i.is_unique)
                    .map(|i| i.column_names.clone()),
            );
            constraints.extend(table.constraints.uniques.iter().map(|u| u.column_names.clone()));

            let mut seen = HashSet::new();
            for columns in constraints {
                let mut key = columns.clone();
                key.sort();
                if !seen.insert(key) {
                    continue;
                }
                let quoted: Vec<String> = columns.iter().map(|c| self.quote_column_name(c)).collect();
                if quoted.iter().all(|c| insert_names.contains(c)) {
                    for c in quoted {
                        if !unique_names.contains(&c) {
                            unique_names.push(c);
                        }
                    }
                }
            }
        }

        let update_names = match update {
            UpsertUpdate::All => Some(
                insert_names
                    .iter()
                    .filter(|n| !unique_names.contains(n))
                    .cloned()
                    .collect(),
            ),
            _ => None,
        };
        Ok((unique_names, insert_names, update_names))
    }

    /// Insert, or update on a unique-key conflict.
    ///
    /// Without a covered unique constraint this is a plain insert.
    pub fn upsert(
        &self,
        table: &str,
        source: &InsertSource,
        update: &UpsertUpdate,
        schema: Option<&TableSchema>,
        params: &mut Params,
    ) -> Result<String> {
        let syntax = self.dialect().upsert_syntax().ok_or_else(|| {
            Error::unsupported(format!(
                "{} does not support upsert statements.",
                self.dialect().driver_name()
            ))
        })?;
        let (unique_names, _, update_names) = self.prepare_upsert_columns(source, update, schema)?;
        let insert_sql = self.insert(table, source, schema, false, params)?;
        if unique_names.is_empty() {
            return Ok(insert_sql);
        }

        match syntax {
            UpsertSyntax::OnDuplicateKey => {
                let columns: Vec<(String, Operand)> = match (update, update_names) {
                    (UpsertUpdate::Nothing, _) => return Ok(insert_sql),
                    (_, Some(names)) if names.is_empty() => {
                        // re-assign a key column so the statement stays a no-op update
                        let first = &unique_names[0];
                        vec![(
                            first.clone(),
                            Operand::Expr(Expression::raw(format!(
                                "{}.{}",
                                self.quote_table_name(table),
                                first
                            ))),
                        )]
                    }
                    (_, Some(names)) => names
                        .into_iter()
                        .map(|n| {
                            let value = Operand::Expr(Expression::raw(format!("VALUES({})", n)));
                            (n, value)
                        })
                        .collect(),
                    (UpsertUpdate::Columns(columns), None) => columns.clone(),
                    (_, None) => return Ok(insert_sql),
                };
                let sets = self.update_sets(&columns, schema, params)?;
                Ok(format!("{} ON DUPLICATE KEY UPDATE {}", insert_sql, sets.join(", ")))
            }
            UpsertSyntax::OnConflict => {
                let columns: Vec<(String, Operand)> = match (update, update_names) {
                    (UpsertUpdate::Nothing, _) => Vec::new(),
                    (_, Some(names)) => names
                        .into_iter()
                        .map(|n| {
                            let value = Operand::Expr(Expression::raw(format!("EXCLUDED.{}", n)));
                            (n, value)
                        })
                        .collect(),
                    (UpsertUpdate::Columns(columns), None) => columns.clone(),
                    (_, None) => Vec::new(),
                };
                if columns.is_empty() {
                    return Ok(format!("{} ON CONFLICT DO NOTHING", insert_sql));
                }
                let sets = self.update_sets(&columns, schema, params)?;
                Ok(format!(
                    "{} ON CONFLICT ({}) DO UPDATE SET {}",
                    insert_sql,
                    unique_names.join(", "),
                    sets.join(", ")
                ))
            }
        }
    }

    /// Inline bound values of `sql` as literals
    pub(crate) fn inline_params(&self, sql: &str, params: &Params) -> Result<String> {
        let escapes = self.dialect().backslash_escapes();
        let (sql, _) = params.bind_sql(sql, escapes, |param, _| self.literal(&param.value))?;
        Ok(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{GenericDialect, MySqlDialect, PostgresDialect};
    use crate::hash;
    use crate::schema::{ColumnSchema, IndexConstraint, ValueKind};
    use std::sync::Arc;

    fn user_schema() -> TableSchema {
        let mut id = ColumnSchema::new("id", crate::schema::types::PK, ValueKind::Integer);
        id.is_primary_key = true;
        let mut table = TableSchema::new("user")
            .with_column(id)
            .with_column(ColumnSchema::new("email", "string", ValueKind::String))
            .with_column(ColumnSchema::new("age", "integer", ValueKind::Integer))
            .with_column(ColumnSchema::new("name", "string", ValueKind::String));
        table.constraints.indexes.push(IndexConstraint {
            name: Some("uq_email".to_string()),
            column_names: vec!["email".to_string()],
            is_unique: true,
            is_primary: false,
        });
        table
    }

    #[test]
    fn test_insert_with_typecast() {
        let qb = QueryBuilder::new(Arc::new(MySqlDialect));
        let schema = user_schema();
        let mut params = Params::new();
        let sql = qb
            .insert(
                "user",
                &InsertSource::values([("email", Operand::from("a@b")), ("age", Operand::from("42"))]),
                Some(&schema),
                false,
                &mut params,
            )
            .unwrap();
        assert_eq!(sql, "INSERT INTO `user` (`email`, `age`) VALUES (?, ?)");
        assert_eq!(params.values(), vec![Value::from("a@b"), Value::I64(42)]);
    }

    #[test]
    fn test_insert_forms() {
        let qb = QueryBuilder::new(Arc::new(MySqlDialect));
        let mut params = Params::new();
        assert_eq!(
            qb.insert("log", &InsertSource::Values(Vec::new()), None, false, &mut params)
                .unwrap(),
            "INSERT INTO `log` DEFAULT VALUES"
        );

        let sql = qb
            .insert(
                "user",
                &InsertSource::values([("name", Operand::from("x")), ("created", Expression::raw("NOW()").into())]),
                None,
                true,
                &mut params,
            )
            .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO `user` (`name`, `created`) VALUES (?, NOW()) ON DUPLICATE KEY UPDATE `name`=VALUES(`name`), `created`=VALUES(`created`)"
        );

        let select = Query::new().select("id, name AS title").from("draft").where_(hash! {"ok" => 1});
        let sql = qb
            .insert("post", &InsertSource::Query(select), None, false, &mut params)
            .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO `post` (`id`, `title`) SELECT `id`, `name` AS `title` FROM `draft` WHERE `ok` = ?"
        );

        let err = qb
            .insert("post", &InsertSource::Query(Query::new().from("draft")), None, false, &mut params)
            .unwrap_err();
        assert!(err.to_string().contains("enumerated (named) parameters"));
    }

    #[test]
    fn test_update_and_delete() {
        let qb = QueryBuilder::new(Arc::new(PostgresDialect));
        let mut params = Params::new();
        let sql = qb
            .update(
                "user",
                &[("name".to_string(), Operand::from("bob")), ("n".to_string(), Expression::raw("n + 1").into())],
                &hash! {"id" => 7},
                None,
                &mut params,
            )
            .unwrap();
        assert_eq!(sql, "UPDATE \"user\" SET \"name\"=?, \"n\"=n + 1 WHERE \"id\" = ?");
        assert_eq!(params.values(), vec![Value::from("bob"), Value::I32(7)]);

        assert_eq!(
            qb.delete("user", &Operand::from(""), &mut Params::new()).unwrap(),
            "DELETE FROM \"user\""
        );
    }

    #[test]
    fn test_batch_insert_literals() {
        let qb = QueryBuilder::new(Arc::new(MySqlDialect));
        let mut params = Params::new();
        let rows = vec![
            vec![Operand::from("it's"), Operand::from(1.5), Operand::from(false)],
            vec![Operand::from(()), Operand::from(2), Expression::raw("NOW()").into()],
        ];
        let sql = qb
            .batch_insert("t", &["a", "b", "c"], &rows, None, &mut params)
            .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO `t` (`a`, `b`, `c`) VALUES ('it''s', 1.5, 0), (NULL, 2, NOW())"
        );
        assert!(params.is_empty());
        assert_eq!(qb.batch_insert("t", &["a"], &[], None, &mut params).unwrap(), "");
    }

    #[test]
    fn test_prepare_upsert_columns() {
        let qb = QueryBuilder::new(Arc::new(PostgresDialect));
        let schema = user_schema();
        let source = InsertSource::values([("email", "a"), ("name", "b")]);
        let (unique, insert, update) = qb
            .prepare_upsert_columns(&source, &UpsertUpdate::All, Some(&schema))
            .unwrap();
        assert_eq!(unique, vec!["\"email\""]);
        assert_eq!(insert, vec!["\"email\"", "\"name\""]);
        assert_eq!(update, Some(vec!["\"name\"".to_string()]));
    }

    #[test]
    fn test_upsert_per_dialect() {
        let schema = user_schema();
        let source = InsertSource::values([("email", "a"), ("name", "b")]);

        let pg = QueryBuilder::new(Arc::new(PostgresDialect));
        let sql = pg
            .upsert("user", &source, &UpsertUpdate::All, Some(&schema), &mut Params::new())
            .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"user\" (\"email\", \"name\") VALUES (?, ?) ON CONFLICT (\"email\") DO UPDATE SET \"name\"=EXCLUDED.\"name\""
        );
        let sql = pg
            .upsert("user", &source, &UpsertUpdate::Nothing, Some(&schema), &mut Params::new())
            .unwrap();
        assert!(sql.ends_with("ON CONFLICT DO NOTHING"));

        let mysql = QueryBuilder::new(Arc::new(MySqlDialect));
        let sql = mysql
            .upsert("user", &source, &UpsertUpdate::All, Some(&schema), &mut Params::new())
            .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO `user` (`email`, `name`) VALUES (?, ?) ON DUPLICATE KEY UPDATE `name`=VALUES(`name`)"
        );
        let mut params = Params::new();
        let sql = mysql
            .upsert(
                "user",
                &source,
                &UpsertUpdate::Columns(vec![("name".to_string(), Operand::from("c"))]),
                Some(&schema),
                &mut params,
            )
            .unwrap();
        assert!(sql.ends_with("ON DUPLICATE KEY UPDATE `name`=?"));
        assert_eq!(params.len(), 3);

        let err = QueryBuilder::new(Arc::new(GenericDialect::new("odbc")))
            .upsert("user", &source, &UpsertUpdate::All, Some(&schema), &mut Params::new())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unsupported operation: odbc does not support upsert statements."
        );
    }
}
