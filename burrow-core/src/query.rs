//! The query model: a mutable SELECT specification plus the execution
//! methods that compile and run it through a session.

use crate::cache::CachePolicy;
use crate::command::Command;
use crate::error::{Error, Result};
use crate::executor::{Pool, Row};
use crate::expression::{Expression, Operand};
use crate::params::Params;
use crate::session::Session;
use crate::value::Value;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A column or table reference: a name, or an expression such as a subquery
#[derive(Debug, Clone)]
pub enum Column {
    Name(String),
    Expr(Expression),
}

impl Column {
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Column::Name(n) => Some(n),
            Column::Expr(_) => None,
        }
    }

    fn same_as(&self, other: &Column) -> bool {
        match (self, other) {
            (Column::Name(a), Column::Name(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&str> for Column {
    fn from(s: &str) -> Self {
        Column::Name(s.to_string())
    }
}

impl From<String> for Column {
    fn from(s: String) -> Self {
        Column::Name(s)
    }
}

impl From<Expression> for Column {
    fn from(e: Expression) -> Self {
        Column::Expr(e)
    }
}

impl From<Query> for Column {
    fn from(q: Query) -> Self {
        Column::Expr(Expression::query(q))
    }
}

/// A select column or from table with an optional alias
#[derive(Debug, Clone)]
pub struct ColumnItem {
    pub alias: Option<String>,
    pub column: Column,
}

/// FROM items share the select item shape
pub type TableItem = ColumnItem;

impl ColumnItem {
    pub fn new(column: impl Into<Column>) -> Self {
        Self {
            alias: None,
            column: column.into(),
        }
    }

    pub fn aliased(alias: impl Into<String>, column: impl Into<Column>) -> Self {
        Self {
            alias: Some(alias.into()),
            column: column.into(),
        }
    }
}

impl From<&str> for ColumnItem {
    fn from(s: &str) -> Self {
        ColumnItem::new(s)
    }
}

impl From<String> for ColumnItem {
    fn from(s: String) -> Self {
        ColumnItem::new(s)
    }
}

/// Split a comma-separated list; strings with `(` are kept whole
pub(crate) fn split_columns(s: &str) -> Vec<String> {
    if s.contains('(') {
        let s = s.trim();
        return if s.is_empty() { Vec::new() } else { vec![s.to_string()] };
    }
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Types usable as a column or table list
pub trait IntoColumns {
    fn into_columns(self) -> Vec<ColumnItem>;
}

impl IntoColumns for &str {
    fn into_columns(self) -> Vec<ColumnItem> {
        split_columns(self).into_iter().map(ColumnItem::new).collect()
    }
}

impl IntoColumns for String {
    fn into_columns(self) -> Vec<ColumnItem> {
        self.as_str().into_columns()
    }
}

impl IntoColumns for &String {
    fn into_columns(self) -> Vec<ColumnItem> {
        self.as_str().into_columns()
    }
}

impl<const N: usize> IntoColumns for [&str; N] {
    fn into_columns(self) -> Vec<ColumnItem> {
        self.into_iter().map(ColumnItem::new).collect()
    }
}

impl IntoColumns for Vec<&str> {
    fn into_columns(self) -> Vec<ColumnItem> {
        self.into_iter().map(ColumnItem::new).collect()
    }
}

impl IntoColumns for Vec<String> {
    fn into_columns(self) -> Vec<ColumnItem> {
        self.into_iter().map(ColumnItem::new).collect()
    }
}

/// `(alias, column)` pairs
impl<const N: usize> IntoColumns for [(&str, &str); N] {
    fn into_columns(self) -> Vec<ColumnItem> {
        self.into_iter()
            .map(|(alias, column)| ColumnItem::aliased(alias, column))
            .collect()
    }
}

impl IntoColumns for ColumnItem {
    fn into_columns(self) -> Vec<ColumnItem> {
        vec![self]
    }
}

impl IntoColumns for Vec<ColumnItem> {
    fn into_columns(self) -> Vec<ColumnItem> {
        self
    }
}

impl IntoColumns for Expression {
    fn into_columns(self) -> Vec<ColumnItem> {
        vec![ColumnItem::new(self)]
    }
}

/// Sort direction for ORDER BY clauses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDirection::Asc => write!(f, "ASC"),
            SortDirection::Desc => write!(f, "DESC"),
        }
    }
}

/// An ORDER BY item; expressions ignore the direction
#[derive(Debug, Clone)]
pub struct OrderItem {
    pub column: Column,
    pub direction: SortDirection,
}

static ORDER_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(.*?)\s+(asc|desc)$").expect("valid order pattern"));

fn parse_order(s: &str) -> Vec<OrderItem> {
    split_columns(s)
        .into_iter()
        .map(|part| match ORDER_SUFFIX.captures(&part) {
            Some(caps) => OrderItem {
                column: Column::Name(caps[1].to_string()),
                direction: if caps[2].eq_ignore_ascii_case("desc") {
                    SortDirection::Desc
                } else {
                    SortDirection::Asc
                },
            },
            None => OrderItem {
                column: Column::Name(part),
                direction: SortDirection::Asc,
            },
        })
        .collect()
}

/// Types usable as an ORDER BY list
pub trait IntoOrderBy {
    fn into_order_by(self) -> Vec<OrderItem>;
}

impl IntoOrderBy for &str {
    fn into_order_by(self) -> Vec<OrderItem> {
        parse_order(self)
    }
}

impl IntoOrderBy for String {
    fn into_order_by(self) -> Vec<OrderItem> {
        parse_order(&self)
    }
}

impl<const N: usize> IntoOrderBy for [(&str, SortDirection); N] {
    fn into_order_by(self) -> Vec<OrderItem> {
        self.into_iter()
            .map(|(column, direction)| OrderItem {
                column: Column::from(column),
                direction,
            })
            .collect()
    }
}

impl IntoOrderBy for Vec<(String, SortDirection)> {
    fn into_order_by(self) -> Vec<OrderItem> {
        self.into_iter()
            .map(|(column, direction)| OrderItem {
                column: Column::Name(column),
                direction,
            })
            .collect()
    }
}

impl IntoOrderBy for Expression {
    fn into_order_by(self) -> Vec<OrderItem> {
        vec![OrderItem {
            column: Column::Expr(self),
            direction: SortDirection::Asc,
        }]
    }
}

impl IntoOrderBy for Vec<OrderItem> {
    fn into_order_by(self) -> Vec<OrderItem> {
        self
    }
}

/// JOIN types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

impl JoinType {
    /// Accepts `left`, `LEFT JOIN`, `left outer join` and the like
    pub fn parse(s: &str) -> Result<JoinType> {
        let normalized = s.trim().to_ascii_uppercase();
        let head = normalized
            .strip_suffix("JOIN")
            .unwrap_or(&normalized)
            .trim()
            .trim_end_matches("OUTER")
            .trim();
        match head {
            "" | "INNER" => Ok(JoinType::Inner),
            "LEFT" => Ok(JoinType::Left),
            "RIGHT" => Ok(JoinType::Right),
            "FULL" => Ok(JoinType::Full),
            "CROSS" => Ok(JoinType::Cross),
            _ => Err(Error::invalid_argument(format!("Unknown join type '{}'.", s))),
        }
    }
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinType::Inner => write!(f, "INNER"),
            JoinType::Left => write!(f, "LEFT"),
            JoinType::Right => write!(f, "RIGHT"),
            JoinType::Full => write!(f, "FULL OUTER"),
            JoinType::Cross => write!(f, "CROSS"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Join {
    pub join_type: JoinType,
    pub table: TableItem,
    pub on: Option<Operand>,
}

#[derive(Debug, Clone)]
pub struct Union {
    pub query: Query,
    pub all: bool,
}

/// How fetched rows are keyed
#[derive(Clone)]
pub enum IndexBy {
    Column(String),
    Closure(Arc<dyn Fn(&Row) -> String + Send + Sync>),
}

impl IndexBy {
    pub fn key(&self, row: &Row) -> String {
        match self {
            IndexBy::Column(c) => row.get(c).map(Value::to_plain_string).unwrap_or_default(),
            IndexBy::Closure(f) => f(row),
        }
    }
}

impl fmt::Debug for IndexBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexBy::Column(c) => f.debug_tuple("Column").field(c).finish(),
            IndexBy::Closure(_) => f.write_str("Closure"),
        }
    }
}

/// Rows keyed by `index_by`; a repeated key replaces the earlier entry
pub type Keyed<T> = Vec<(String, T)>;

fn keyed<T>(items: impl IntoIterator<Item = (String, T)>) -> Keyed<T> {
    let mut out: Keyed<T> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    for (key, item) in items {
        match positions.get(&key) {
            Some(&i) => out[i].1 = item,
            None => {
                positions.insert(key.clone(), out.len());
                out.push((key, item));
            }
        }
    }
    out
}

/// A SELECT statement specification
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub select: Vec<ColumnItem>,
    pub select_option: Option<String>,
    pub distinct: bool,
    pub from: Vec<TableItem>,
    pub join: Vec<Join>,
    pub where_: Option<Operand>,
    pub group_by: Vec<Column>,
    pub having: Option<Operand>,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub union: Vec<Union>,
    pub params: Params,
    pub index_by: Option<IndexBy>,
    pub cache: Option<CachePolicy>,
    pub share: bool,
    pub emulate_execution: bool,
}

fn and_condition(existing: Option<Operand>, condition: Operand) -> Operand {
    match existing {
        None => condition,
        Some(Operand::List(mut items))
            if items
                .first()
                .and_then(Operand::as_str)
                .map_or(false, |op| op.eq_ignore_ascii_case("and")) =>
        {
            items.push(condition);
            Operand::List(items)
        }
        Some(old) => Operand::List(vec![Operand::from("and"), old, condition]),
    }
}

fn or_condition(existing: Option<Operand>, condition: Operand) -> Operand {
    match existing {
        None => condition,
        Some(old) => Operand::List(vec![Operand::from("or"), old, condition]),
    }
}

fn non_empty(condition: Operand) -> Option<Operand> {
    let filtered = condition.filter();
    if filtered.is_empty() {
        None
    } else {
        Some(filtered)
    }
}

static COMPARE_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(<>|>=|>|<=|<|=)").expect("valid compare pattern"));

static FROM_ALIAS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)^\s*((?:['"`\[]|\{\{).*?(?:['"`\]]|\}\})|\(.*?\)|.*?)(?:\s+(?:as)?\s*((?:['"`\[]|\{\{).*?(?:['"`\]]|\}\})|.*?))?\s*$"#,
    )
    .expect("valid from pattern")
});

static BRACED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\{\{.*\}\}$").expect("valid brace pattern"));

fn ensure_name_quoted(name: &str) -> String {
    let name: String = name
        .chars()
        .filter(|c| !matches!(c, '\'' | '"' | '`' | '[' | ']'))
        .collect();
    if !name.is_empty() && !BRACED.is_match(&name) {
        format!("{{{{{}}}}}", name)
    } else {
        name
    }
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the select list
    pub fn select(mut self, columns: impl IntoColumns) -> Self {
        self.select.clear();
        self.select = self.unique_columns(columns.into_columns());
        self
    }

    pub fn select_option(mut self, option: impl Into<String>) -> Self {
        self.select_option = Some(option.into());
        self
    }

    /// Append columns, skipping ones already selected
    pub fn add_select(mut self, columns: impl IntoColumns) -> Self {
        let columns = self.unique_columns(columns.into_columns());
        self.select.extend(columns);
        self
    }

    fn unique_columns(&self, columns: Vec<ColumnItem>) -> Vec<ColumnItem> {
        let mut result: Vec<ColumnItem> = Vec::new();
        for item in columns {
            if item.column.as_name().is_some() {
                let duplicate = match &item.alias {
                    Some(alias) => self.select.iter().any(|s| {
                        s.alias.as_deref() == Some(alias.as_str()) && s.column.same_as(&item.column)
                    }),
                    None => self
                        .select
                        .iter()
                        .chain(result.iter())
                        .any(|s| s.alias.is_none() && s.column.same_as(&item.column)),
                };
                if duplicate {
                    continue;
                }
            }
            result.push(item);
        }
        result
    }

    pub fn distinct(mut self, value: bool) -> Self {
        self.distinct = value;
        self
    }

    pub fn from(mut self, tables: impl IntoColumns) -> Self {
        self.from = tables.into_columns();
        self
    }

    /// Add a table (or subquery) under `alias`
    pub fn from_aliased(mut self, alias: impl Into<String>, table: impl Into<Column>) -> Self {
        self.from.push(ColumnItem::aliased(alias, table));
        self
    }

    pub fn join(mut self, join_type: JoinType, table: impl Into<TableItem>, on: impl Into<Operand>) -> Self {
        let on = on.into();
        self.join.push(Join {
            join_type,
            table: table.into(),
            on: if on.is_empty() { None } else { Some(on) },
        });
        self
    }

    pub fn inner_join(self, table: impl Into<TableItem>, on: impl Into<Operand>) -> Self {
        self.join(JoinType::Inner, table, on)
    }

    pub fn left_join(self, table: impl Into<TableItem>, on: impl Into<Operand>) -> Self {
        self.join(JoinType::Left, table, on)
    }

    pub fn right_join(self, table: impl Into<TableItem>, on: impl Into<Operand>) -> Self {
        self.join(JoinType::Right, table, on)
    }

    pub fn where_(mut self, condition: impl Into<Operand>) -> Self {
        self.where_ = Some(condition.into());
        self
    }

    pub fn and_where(mut self, condition: impl Into<Operand>) -> Self {
        self.where_ = Some(and_condition(self.where_.take(), condition.into()));
        self
    }

    pub fn or_where(mut self, condition: impl Into<Operand>) -> Self {
        self.where_ = Some(or_condition(self.where_.take(), condition.into()));
        self
    }

    /// Like `where_`, after dropping operands with empty values
    pub fn filter_where(self, condition: impl Into<Operand>) -> Self {
        match non_empty(condition.into()) {
            Some(c) => self.where_(c),
            None => self,
        }
    }

    pub fn and_filter_where(self, condition: impl Into<Operand>) -> Self {
        match non_empty(condition.into()) {
            Some(c) => self.and_where(c),
            None => self,
        }
    }

    pub fn or_filter_where(self, condition: impl Into<Operand>) -> Self {
        match non_empty(condition.into()) {
            Some(c) => self.or_where(c),
            None => self,
        }
    }

    /// Filter on `name` using an operator prefixed to `value`, e.g. `>=10`
    pub fn and_filter_compare(self, name: &str, value: &str, default_operator: &str) -> Self {
        let (operator, value) = match COMPARE_PREFIX.find(value) {
            Some(m) => (m.as_str(), &value[m.end()..]),
            None => (default_operator, value),
        };
        self.and_filter_where(Operand::List(vec![
            Operand::from(operator),
            Operand::from(name),
            Operand::from(value),
        ]))
    }

    pub fn having(mut self, condition: impl Into<Operand>) -> Self {
        self.having = Some(condition.into());
        self
    }

    pub fn and_having(mut self, condition: impl Into<Operand>) -> Self {
        self.having = Some(and_condition(self.having.take(), condition.into()));
        self
    }

    pub fn or_having(mut self, condition: impl Into<Operand>) -> Self {
        self.having = Some(or_condition(self.having.take(), condition.into()));
        self
    }

    pub fn filter_having(self, condition: impl Into<Operand>) -> Self {
        match non_empty(condition.into()) {
            Some(c) => self.having(c),
            None => self,
        }
    }

    pub fn and_filter_having(self, condition: impl Into<Operand>) -> Self {
        match non_empty(condition.into()) {
            Some(c) => self.and_having(c),
            None => self,
        }
    }

    pub fn or_filter_having(self, condition: impl Into<Operand>) -> Self {
        match non_empty(condition.into()) {
            Some(c) => self.or_having(c),
            None => self,
        }
    }

    pub fn group_by(mut self, columns: impl IntoColumns) -> Self {
        self.group_by = columns.into_columns().into_iter().map(|c| c.column).collect();
        self
    }

    pub fn add_group_by(mut self, columns: impl IntoColumns) -> Self {
        self.group_by
            .extend(columns.into_columns().into_iter().map(|c| c.column));
        self
    }

    pub fn order_by(mut self, columns: impl IntoOrderBy) -> Self {
        self.order_by = columns.into_order_by();
        self
    }

    pub fn add_order_by(mut self, columns: impl IntoOrderBy) -> Self {
        self.order_by.extend(columns.into_order_by());
        self
    }

    pub fn limit(mut self, limit: impl Into<Option<u64>>) -> Self {
        self.limit = limit.into();
        self
    }

    pub fn offset(mut self, offset: impl Into<Option<u64>>) -> Self {
        self.offset = offset.into();
        self
    }

    pub fn union(mut self, query: Query, all: bool) -> Self {
        self.union.push(Union { query, all });
        self
    }

    /// Replace the bound parameters
    pub fn params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn add_params(mut self, params: Params) -> Self {
        self.params.extend(params);
        self
    }

    /// Bind a named parameter
    pub fn param(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.set(name, value);
        self
    }

    pub fn index_by(mut self, column: impl Into<String>) -> Self {
        self.index_by = Some(IndexBy::Column(column.into()));
        self
    }

    pub fn index_by_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Row) -> String + Send + Sync + 'static,
    {
        self.index_by = Some(IndexBy::Closure(Arc::new(f)));
        self
    }

    /// Cache results for `ttl`; `None` never expires
    pub fn cache(mut self, ttl: Option<Duration>) -> Self {
        self.cache = Some(CachePolicy::new(ttl));
        self
    }

    pub fn cache_with(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.cache = None;
        self
    }

    pub fn share(mut self, share: bool) -> Self {
        self.share = share;
        self
    }

    pub fn emulate_execution(mut self, value: bool) -> Self {
        self.emulate_execution = value;
        self
    }

    /// Tables in FROM keyed by alias, both wrapped as `{{name}}`
    pub fn tables_used_in_from(&self) -> Result<Vec<(String, Column)>> {
        let mut tables = Vec::with_capacity(self.from.len());
        for item in &self.from {
            match (&item.alias, &item.column) {
                (Some(alias), Column::Name(table)) => {
                    tables.push((ensure_name_quoted(alias), Column::Name(ensure_name_quoted(table))))
                }
                (Some(alias), expr @ Column::Expr(_)) => {
                    tables.push((ensure_name_quoted(alias), expr.clone()))
                }
                (None, Column::Name(definition)) => {
                    let (table, alias) = match FROM_ALIAS.captures(definition) {
                        Some(caps) => {
                            let table = caps.get(1).map_or("", |m| m.as_str()).to_string();
                            let alias = caps
                                .get(2)
                                .map(|m| m.as_str().to_string())
                                .filter(|a| !a.is_empty())
                                .unwrap_or_else(|| table.clone());
                            (table, alias)
                        }
                        None => (definition.clone(), definition.clone()),
                    };
                    tables.push((ensure_name_quoted(&alias), Column::Name(ensure_name_quoted(&table))));
                }
                (None, Column::Expr(_)) => {
                    return Err(Error::invalid_argument(
                        "To use Expression in from() method, pass it in array format with alias.",
                    ))
                }
            }
        }
        Ok(tables)
    }

    /// Key rows by `index_by`; without it rows are keyed by position
    pub fn populate(&self, rows: Vec<Row>) -> Keyed<Row> {
        match &self.index_by {
            Some(index) => keyed(rows.into_iter().map(|row| (index.key(&row), row))),
            None => rows
                .into_iter()
                .enumerate()
                .map(|(i, row)| (i.to_string(), row))
                .collect(),
        }
    }

    /// The statement an aggregate such as `COUNT(*)` is computed with.
    ///
    /// Plain queries have their select list replaced; DISTINCT, grouped,
    /// filtered-by-HAVING and UNION queries are wrapped as a subquery.
    pub fn scalar_query(&self, select_expression: &str) -> Query {
        if !self.distinct && self.group_by.is_empty() && self.having.is_none() && self.union.is_empty()
        {
            let mut query = self.clone();
            query.select = vec![ColumnItem::new(Expression::raw(select_expression))];
            query.order_by.clear();
            query.limit = None;
            query.offset = None;
            query
        } else {
            let mut query = Query::new()
                .select(Expression::raw(select_expression))
                .from_aliased("c", self.clone())
                .share(self.share);
            query.cache = self.cache.clone();
            query
        }
    }

    /// Compile into a command bound to `session`
    pub fn create_command<'s, P: Pool>(&self, session: &'s mut Session<P>) -> Result<Command<'s, P>> {
        let (sql, params) = session.query_builder().build(self, Params::new())?;
        Ok(session
            .create_command(sql)
            .bind_values(params)
            .share(self.share)
            .cache(self.cache.clone()))
    }

    pub async fn all<P: Pool>(&self, session: &mut Session<P>) -> Result<Vec<Row>> {
        if self.emulate_execution {
            return Ok(Vec::new());
        }
        self.create_command(session)?.query_all().await
    }

    /// All rows keyed by `index_by`
    pub async fn all_indexed<P: Pool>(&self, session: &mut Session<P>) -> Result<Keyed<Row>> {
        let rows = self.all(session).await?;
        Ok(self.populate(rows))
    }

    /// First row, fetched with `LIMIT 1`
    pub async fn one<P: Pool>(&self, session: &mut Session<P>) -> Result<Option<Row>> {
        if self.emulate_execution {
            return Ok(None);
        }
        self.clone().limit(1).create_command(session)?.query_one().await
    }

    pub async fn one_as<T, P>(&self, session: &mut Session<P>) -> Result<Option<T>>
    where
        T: serde::de::DeserializeOwned,
        P: Pool,
    {
        match self.one(session).await? {
            Some(row) => Ok(Some(row.decode()?)),
            None => Ok(None),
        }
    }

    pub async fn all_as<T, P>(&self, session: &mut Session<P>) -> Result<Vec<T>>
    where
        T: serde::de::DeserializeOwned,
        P: Pool,
    {
        self.all(session).await?.iter().map(|row| row.decode()).collect()
    }

    pub async fn scalar<P: Pool>(&self, session: &mut Session<P>) -> Result<Option<Value>> {
        if self.emulate_execution {
            return Ok(None);
        }
        self.create_command(session)?.query_scalar().await
    }

    /// First column of every row
    pub async fn column<P: Pool>(&self, session: &mut Session<P>) -> Result<Vec<Value>> {
        if self.emulate_execution {
            return Ok(Vec::new());
        }
        self.create_command(session)?.query_column().await
    }

    /// First column keyed by `index_by`.
    ///
    /// A column `index_by` is appended to a single-column select, prefixed by
    /// the first FROM alias when it has no table part.
    pub async fn column_indexed<P: Pool>(&self, session: &mut Session<P>) -> Result<Keyed<Value>> {
        if self.emulate_execution {
            return Ok(Vec::new());
        }
        let index = match &self.index_by {
            None => {
                let values = self.column(session).await?;
                return Ok(values
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| (i.to_string(), v))
                    .collect());
            }
            Some(index) => index.clone(),
        };
        let mut query = self.clone();
        if let IndexBy::Column(column) = &index {
            if query.select.len() == 1 {
                let tables = query.tables_used_in_from()?;
                let extra = match tables.first() {
                    Some((alias, _)) if !column.contains('.') => format!("{}.{}", alias, column),
                    _ => column.clone(),
                };
                query.select.push(ColumnItem::new(extra));
            }
        }
        let rows = query.create_command(session)?.query_all().await?;
        Ok(keyed(rows.into_iter().map(|row| {
            let value = row.first().cloned().unwrap_or(Value::Null);
            (index.key(&row), value)
        })))
    }

    async fn query_scalar<P: Pool>(&self, session: &mut Session<P>, expression: &str) -> Result<Option<Value>> {
        if self.emulate_execution {
            return Ok(None);
        }
        self.scalar_query(expression)
            .create_command(session)?
            .query_scalar()
            .await
    }

    pub async fn count<P: Pool>(&self, session: &mut Session<P>, q: &str) -> Result<i64> {
        let value = self.query_scalar(session, &format!("COUNT({})", q)).await?;
        Ok(value.and_then(|v| v.as_i64()).unwrap_or(0))
    }

    pub async fn sum<P: Pool>(&self, session: &mut Session<P>, q: &str) -> Result<f64> {
        let value = self.query_scalar(session, &format!("SUM({})", q)).await?;
        Ok(value.and_then(|v| v.as_f64()).unwrap_or(0.0))
    }

    pub async fn average<P: Pool>(&self, session: &mut Session<P>, q: &str) -> Result<f64> {
        let value = self.query_scalar(session, &format!("AVG({})", q)).await?;
        Ok(value.and_then(|v| v.as_f64()).unwrap_or(0.0))
    }

    pub async fn min<P: Pool>(&self, session: &mut Session<P>, q: &str) -> Result<Option<Value>> {
        self.query_scalar(session, &format!("MIN({})", q)).await
    }

    pub async fn max<P: Pool>(&self, session: &mut Session<P>, q: &str) -> Result<Option<Value>> {
        self.query_scalar(session, &format!("MAX({})", q)).await
    }

    pub async fn exists<P: Pool>(&self, session: &mut Session<P>) -> Result<bool> {
        if self.emulate_execution {
            return Ok(false);
        }
        let (sql, params) = session.query_builder().build(self, Params::new())?;
        let sql = session.query_builder().select_exists(&sql);
        let value = session
            .create_command(sql)
            .bind_values(params)
            .share(self.share)
            .cache(self.cache.clone())
            .query_scalar()
            .await?;
        Ok(value.and_then(|v| v.as_bool()).unwrap_or(false))
    }

    /// Iterate in pages of `size` rows
    pub fn batch(&self, size: u64) -> BatchQuery {
        BatchQuery::new(self.clone(), size)
    }

    /// Iterate row by row, fetching `size` rows at a time
    pub fn each(&self, size: u64) -> EachQuery {
        EachQuery {
            batch: BatchQuery::new(self.clone(), size),
            buffer: VecDeque::new(),
        }
    }
}

/// Paginated fetch over LIMIT/OFFSET.
///
/// An existing limit on the query caps the total number of rows.
#[derive(Debug, Clone)]
pub struct BatchQuery {
    query: Query,
    size: u64,
    next_offset: u64,
    remaining: Option<u64>,
    done: bool,
}

impl BatchQuery {
    fn new(query: Query, size: u64) -> Self {
        let size = size.max(1);
        Self {
            next_offset: query.offset.unwrap_or(0),
            remaining: query.limit,
            query,
            size,
            done: false,
        }
    }

    /// Next page, or `None` when exhausted
    pub async fn next<P: Pool>(&mut self, session: &mut Session<P>) -> Result<Option<Vec<Row>>> {
        if self.done || self.query.emulate_execution {
            return Ok(None);
        }
        let take = match self.remaining {
            Some(0) => {
                self.done = true;
                return Ok(None);
            }
            Some(left) => left.min(self.size),
            None => self.size,
        };
        let page = self
            .query
            .clone()
            .limit(take)
            .offset(self.next_offset)
            .all(session)
            .await?;
        let fetched = page.len() as u64;
        self.next_offset += fetched;
        if let Some(left) = self.remaining.as_mut() {
            *left = left.saturating_sub(fetched);
        }
        if fetched < take {
            self.done = true;
        }
        if page.is_empty() {
            return Ok(None);
        }
        Ok(Some(page))
    }
}

/// Row-at-a-time view over [`BatchQuery`]
#[derive(Debug, Clone)]
pub struct EachQuery {
    batch: BatchQuery,
    buffer: VecDeque<Row>,
}

impl EachQuery {
    pub async fn next<P: Pool>(&mut self, session: &mut Session<P>) -> Result<Option<Row>> {
        if self.buffer.is_empty() {
            match self.batch.next(session).await? {
                Some(page) => self.buffer.extend(page),
                None => return Ok(None),
            }
        }
        Ok(self.buffer.pop_front())
    }
}
