//! Compiles `Query` models and statement arguments into SQL plus params
//!
//! Every clause builder appends the values it references to the `Params`
//! it is handed, in the order their placeholders appear in the text.

pub mod conditions;
pub mod ddl;
pub mod dml;
pub mod registry;
pub mod values;

pub use ddl::ForeignKeyAction;
pub use dml::{InsertSource, UpsertUpdate};
pub use registry::{BuildExpression, ExpressionBuilders, ExpressionFamily};

use crate::condition::Condition;
use crate::dialect::{DatabaseBackend, SqlDialect};
use crate::error::{Error, Result};
use crate::expression::{Expression, Operand};
use crate::params::Params;
use crate::query::{Column, ColumnItem, Join, OrderItem, Query, SortDirection, Union};
use crate::value::Value;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

static SELECT_ALIAS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(.*?)(?i:\s+as\s+|\s+)([\w\-_.]+)$").expect("valid select alias pattern")
});

static TABLE_ALIAS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*?)(?i:\s+as|)\s+([^ ]+)$").expect("valid table alias pattern"));

/// SQL compiler bound to one dialect
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    dialect: Arc<dyn SqlDialect>,
    builders: ExpressionBuilders,
}

impl QueryBuilder {
    pub fn new(dialect: Arc<dyn SqlDialect>) -> Self {
        let mut builders = ExpressionBuilders::defaults();
        dialect.register_builders(&mut builders);
        Self { dialect, builders }
    }

    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    pub fn builders(&self) -> &ExpressionBuilders {
        &self.builders
    }

    /// Install or replace an expression builder
    pub fn register(&mut self, family: ExpressionFamily, builder: Arc<dyn BuildExpression>) {
        self.builders.register(family, builder);
    }

    /// Compile `query`, appending to `params`
    pub fn build(&self, query: &Query, mut params: Params) -> Result<(String, Params)> {
        let sql = self.build_into(query, &mut params)?;
        Ok((sql, params))
    }

    /// Compile `query` into an existing accumulator; used for subqueries
    pub fn build_into(&self, query: &Query, params: &mut Params) -> Result<String> {
        params.extend(query.params.clone());

        let clauses = [
            self.build_select(
                &query.select,
                params,
                query.distinct,
                query.select_option.as_deref(),
            )?,
            self.build_from(&query.from, params)?,
            self.build_join(&query.join, params)?,
            self.build_where(query.where_.as_ref(), params)?,
            self.build_group_by(&query.group_by, params)?,
            self.build_having(query.having.as_ref(), params)?,
        ];
        let mut sql = clauses
            .into_iter()
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        let order_by = self.build_order_by(&query.order_by, params)?;
        if !order_by.is_empty() {
            sql.push(' ');
            sql.push_str(&order_by);
        }
        let limit = self.build_limit(query.limit, query.offset);
        if !limit.is_empty() {
            sql.push(' ');
            sql.push_str(&limit);
        }

        let union = self.build_union(&query.union, params)?;
        if !union.is_empty() {
            sql = format!("({}) {}", sql, union);
        }
        Ok(sql)
    }

    pub fn build_select(
        &self,
        columns: &[ColumnItem],
        params: &mut Params,
        distinct: bool,
        select_option: Option<&str>,
    ) -> Result<String> {
        let mut select = if distinct {
            "SELECT DISTINCT".to_string()
        } else {
            "SELECT".to_string()
        };
        if let Some(option) = select_option {
            select.push(' ');
            select.push_str(option);
        }
        if columns.is_empty() {
            return Ok(format!("{} *", select));
        }

        let mut parts = Vec::with_capacity(columns.len());
        for item in columns {
            let part = match (&item.alias, &item.column) {
                (Some(alias), Column::Expr(e)) => format!(
                    "{} AS {}",
                    self.build_expression(e, params)?,
                    self.quote_column_name(alias)
                ),
                (None, Column::Expr(e)) => self.build_expression(e, params)?,
                (Some(alias), Column::Name(name)) if alias != name => format!(
                    "{} AS {}",
                    self.column_name(name),
                    self.quote_column_name(alias)
                ),
                (_, Column::Name(name)) if name.contains('(') => name.clone(),
                (_, Column::Name(name)) => match SELECT_ALIAS.captures(name) {
                    Some(caps) => format!(
                        "{} AS {}",
                        self.quote_column_name(&caps[1]),
                        self.quote_column_name(&caps[2])
                    ),
                    None => self.quote_column_name(name),
                },
            };
            parts.push(part);
        }
        Ok(format!("{} {}", select, parts.join(", ")))
    }

    pub fn build_from(&self, tables: &[ColumnItem], params: &mut Params) -> Result<String> {
        if tables.is_empty() {
            return Ok(String::new());
        }
        Ok(format!("FROM {}", self.quote_table_names(tables, params)?))
    }

    fn quote_table_names(&self, tables: &[ColumnItem], params: &mut Params) -> Result<String> {
        let mut parts = Vec::with_capacity(tables.len());
        for item in tables {
            parts.push(self.table_item(item, params)?);
        }
        Ok(parts.join(", "))
    }

    fn table_item(&self, item: &ColumnItem, params: &mut Params) -> Result<String> {
        Ok(match (&item.alias, &item.column) {
            (Some(alias), Column::Expr(e)) => format!(
                "{} {}",
                self.build_expression(e, params)?,
                self.quote_table_name(alias)
            ),
            (None, Column::Expr(e)) => self.build_expression(e, params)?,
            (Some(alias), Column::Name(name)) => {
                let table = if name.contains('(') {
                    name.clone()
                } else {
                    self.quote_table_name(name)
                };
                format!("{} {}", table, self.quote_table_name(alias))
            }
            (None, Column::Name(name)) if name.contains('(') => name.clone(),
            (None, Column::Name(name)) => match TABLE_ALIAS.captures(name) {
                Some(caps) => format!(
                    "{} {}",
                    self.quote_table_name(&caps[1]),
                    self.quote_table_name(&caps[2])
                ),
                None => self.quote_table_name(name),
            },
        })
    }

    pub fn build_join(&self, joins: &[Join], params: &mut Params) -> Result<String> {
        let mut parts = Vec::with_capacity(joins.len());
        for join in joins {
            let mut sql = format!(
                "{} JOIN {}",
                join.join_type,
                self.table_item(&join.table, params)?
            );
            if let Some(on) = &join.on {
                let condition = self.build_condition(on, params)?;
                if !condition.is_empty() {
                    sql.push_str(" ON ");
                    sql.push_str(&condition);
                }
            }
            parts.push(sql);
        }
        Ok(parts.join(" "))
    }

    pub fn build_where(&self, condition: Option<&Operand>, params: &mut Params) -> Result<String> {
        let sql = match condition {
            Some(c) => self.build_condition(c, params)?,
            None => String::new(),
        };
        Ok(if sql.is_empty() {
            sql
        } else {
            format!("WHERE {}", sql)
        })
    }

    pub fn build_group_by(&self, columns: &[Column], params: &mut Params) -> Result<String> {
        if columns.is_empty() {
            return Ok(String::new());
        }
        let mut parts = Vec::with_capacity(columns.len());
        for column in columns {
            parts.push(match column {
                Column::Expr(e) => self.build_expression(e, params)?,
                Column::Name(name) => self.column_name(name),
            });
        }
        Ok(format!("GROUP BY {}", parts.join(", ")))
    }

    pub fn build_having(&self, condition: Option<&Operand>, params: &mut Params) -> Result<String> {
        let sql = match condition {
            Some(c) => self.build_condition(c, params)?,
            None => String::new(),
        };
        Ok(if sql.is_empty() {
            sql
        } else {
            format!("HAVING {}", sql)
        })
    }

    pub fn build_order_by(&self, columns: &[OrderItem], params: &mut Params) -> Result<String> {
        if columns.is_empty() {
            return Ok(String::new());
        }
        let mut parts = Vec::with_capacity(columns.len());
        for item in columns {
            parts.push(match &item.column {
                Column::Expr(e) => self.build_expression(e, params)?,
                Column::Name(name) => {
                    let column = self.column_name(name);
                    match item.direction {
                        SortDirection::Desc => format!("{} DESC", column),
                        SortDirection::Asc => column,
                    }
                }
            });
        }
        Ok(format!("ORDER BY {}", parts.join(", ")))
    }

    /// `LIMIT n [OFFSET m]`; a zero offset is omitted
    pub fn build_limit(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        let offset = offset.filter(|o| *o > 0);
        match (limit, offset) {
            (Some(l), Some(o)) => format!("LIMIT {} OFFSET {}", l, o),
            (Some(l), None) => format!("LIMIT {}", l),
            (None, Some(o)) => match self.dialect.backend() {
                DatabaseBackend::MySql => format!("LIMIT {}, 18446744073709551615", o),
                DatabaseBackend::Sqlite => format!("LIMIT -1 OFFSET {}", o),
                _ => format!("OFFSET {}", o),
            },
            (None, None) => String::new(),
        }
    }

    pub fn build_union(&self, unions: &[Union], params: &mut Params) -> Result<String> {
        let mut parts = Vec::with_capacity(unions.len());
        for union in unions {
            let sql = self.build_into(&union.query, params)?;
            let keyword = if union.all { "UNION ALL" } else { "UNION" };
            parts.push(format!("{} ( {} )", keyword, sql));
        }
        Ok(parts.join(" "))
    }

    /// Render a condition in any of its DSL forms.
    ///
    /// Strings are raw SQL; empty lists and hashes render nothing.
    pub fn build_condition(&self, condition: &Operand, params: &mut Params) -> Result<String> {
        match condition {
            Operand::Value(Value::String(s)) => Ok(s.clone()),
            Operand::Value(v) => Ok(v.to_plain_string()),
            Operand::List(items) if items.is_empty() => Ok(String::new()),
            Operand::Map(entries) if entries.is_empty() => Ok(String::new()),
            Operand::List(_) | Operand::Map(_) => {
                let condition = Condition::from_operand(condition)?;
                self.build_expression(&Expression::condition(condition), params)
            }
            Operand::Expr(e) => self.build_expression(e, params),
        }
    }

    pub fn build_expression(&self, expr: &Expression, params: &mut Params) -> Result<String> {
        self.builders
            .get(ExpressionFamily::of(expr))?
            .build(self, expr, params)
    }

    /// `SELECT EXISTS(sql)`
    pub fn select_exists(&self, raw_sql: &str) -> String {
        format!("SELECT EXISTS({})", raw_sql)
    }

    pub fn quote_table_name(&self, name: &str) -> String {
        self.dialect.quote_table_name(name)
    }

    pub fn quote_column_name(&self, name: &str) -> String {
        self.dialect.quote_column_name(name)
    }

    pub fn quote_value(&self, value: &str) -> String {
        self.dialect.quote_value(value)
    }

    /// Quote a column unless it is an SQL fragment containing `(`
    pub(crate) fn column_name(&self, name: &str) -> String {
        if name.contains('(') {
            name.to_string()
        } else {
            self.quote_column_name(name)
        }
    }

    /// Render the column side of a condition
    pub(crate) fn column_sql(&self, column: &Operand, params: &mut Params) -> Result<String> {
        match column {
            Operand::Value(Value::String(name)) => Ok(self.column_name(name)),
            Operand::Value(v) => Ok(v.to_plain_string()),
            Operand::Expr(e) => self.build_expression(e, params),
            other => self.build_condition(other, params),
        }
    }

    /// Bind the value side of a condition, building expressions inline
    pub(crate) fn bind_operand(&self, value: &Operand, params: &mut Params) -> Result<String> {
        match value {
            Operand::Value(v) => Ok(params.push(v.clone()).to_string()),
            Operand::Expr(e) => self.build_expression(e, params),
            Operand::List(items) => {
                let values = items
                    .iter()
                    .map(|i| match i {
                        Operand::Value(v) => Ok(v.clone()),
                        _ => Err(Error::invalid_argument(
                            "Only plain values can be bound as an array",
                        )),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(params.push(Value::Array(values)).to_string())
            }
            Operand::Map(_) => Err(Error::invalid_argument(
                "A hash can not be bound as a single value",
            )),
        }
    }

    /// Inline a value as a SQL literal
    pub fn literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Value::I32(_) | Value::I64(_) | Value::F32(_) | Value::F64(_) => value.to_plain_string(),
            other => self.quote_value(&other.to_plain_string()),
        }
    }
}
