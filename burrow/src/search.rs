//! JSON filter DSL for building queries from request input.
//!
//! A filter is an object whose keys name [`Query`] builder methods:
//!
//! ```json
//! {
//!     "select": "id, name",
//!     "from": "user",
//!     "where": {"status": 1},
//!     "and_filter_where[]": [["like", "name", "jo"], {"role": ""}],
//!     "order_by": {"id": "desc"},
//!     "limit": 10
//! }
//! ```
//!
//! A key ending in `[]` applies its method once per array element. Inside
//! `select`, `from` and the where family, `{"query": {...}}` is a nested
//! filter compiled into a subquery and `{"exp": "sql"}` is a raw
//! expression.

use burrow_core::operator::ConditionKind;
use burrow_core::{
    CachePolicy, ColumnItem, Error, Expression, JoinType, Operand, Operator, Params, Pool, Query,
    Result, Row, Session, SortDirection, Value,
};
use serde_json::{Map, Value as Json};
use std::str::FromStr;

/// Query builder method a filter key dispatches to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerb {
    Select,
    AddSelect,
    From,
    Where,
    AndWhere,
    OrWhere,
    FilterWhere,
    AndFilterWhere,
    OrFilterWhere,
    Having,
    AndHaving,
    OrHaving,
    GroupBy,
    OrderBy,
    Limit,
    Offset,
    Distinct,
    Join,
    LeftJoin,
    InnerJoin,
    RightJoin,
    IndexBy,
}

impl FromStr for FilterVerb {
    type Err = Error;

    /// Accepts `and_where` as well as `andWhere`
    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        let verb = match normalized.as_str() {
            "select" => FilterVerb::Select,
            "addselect" => FilterVerb::AddSelect,
            "from" => FilterVerb::From,
            "where" => FilterVerb::Where,
            "andwhere" => FilterVerb::AndWhere,
            "orwhere" => FilterVerb::OrWhere,
            "filterwhere" => FilterVerb::FilterWhere,
            "andfilterwhere" => FilterVerb::AndFilterWhere,
            "orfilterwhere" => FilterVerb::OrFilterWhere,
            "having" => FilterVerb::Having,
            "andhaving" => FilterVerb::AndHaving,
            "orhaving" => FilterVerb::OrHaving,
            "groupby" => FilterVerb::GroupBy,
            "orderby" => FilterVerb::OrderBy,
            "limit" => FilterVerb::Limit,
            "offset" => FilterVerb::Offset,
            "distinct" => FilterVerb::Distinct,
            "join" => FilterVerb::Join,
            "leftjoin" => FilterVerb::LeftJoin,
            "innerjoin" => FilterVerb::InnerJoin,
            "rightjoin" => FilterVerb::RightJoin,
            "indexby" => FilterVerb::IndexBy,
            _ => {
                return Err(Error::invalid_argument(format!(
                    "Unknown filter method '{}'.",
                    s
                )))
            }
        };
        Ok(verb)
    }
}

impl FilterVerb {
    /// Whether `{"query": ..}` and `{"exp": ..}` values are expanded
    fn expands_nested(self) -> bool {
        matches!(
            self,
            FilterVerb::Select
                | FilterVerb::AddSelect
                | FilterVerb::From
                | FilterVerb::Where
                | FilterVerb::AndWhere
                | FilterVerb::OrWhere
                | FilterVerb::FilterWhere
                | FilterVerb::AndFilterWhere
                | FilterVerb::OrFilterWhere
        )
    }
}

fn reject_semicolon(sql: &str) -> Result<()> {
    if sql.contains(';') {
        return Err(Error::invalid_argument("Sql can not include ';'!"));
    }
    Ok(())
}

/// Apply every key of `filter` to `query`
pub fn search(query: Query, filter: &Json) -> Result<Query> {
    let entries = match filter {
        Json::Object(entries) => entries,
        Json::Null => return Ok(query),
        _ => return Err(Error::invalid_argument("A search filter must be an object.")),
    };
    apply_all(query, entries)
}

fn apply_all(mut query: Query, entries: &Map<String, Json>) -> Result<Query> {
    for (key, value) in entries {
        match key.strip_suffix("[]") {
            Some(method) => {
                let verb = method.parse::<FilterVerb>()?;
                let items = match value {
                    Json::Array(items) => items.as_slice(),
                    other => std::slice::from_ref(other),
                };
                for item in items {
                    query = apply(query, verb, item)?;
                }
            }
            None => query = apply(query, key.parse()?, value)?,
        }
    }
    Ok(query)
}

fn apply(query: Query, verb: FilterVerb, value: &Json) -> Result<Query> {
    if let Json::String(s) = value {
        reject_semicolon(s)?;
    }
    let nested = verb.expands_nested();
    let query = match verb {
        FilterVerb::Select => query.select(column_items(value)?),
        FilterVerb::AddSelect => query.add_select(column_items(value)?),
        FilterVerb::From => query.from(column_items(value)?),
        FilterVerb::Where => query.where_(operand(value, nested)?),
        FilterVerb::AndWhere => query.and_where(operand(value, nested)?),
        FilterVerb::OrWhere => query.or_where(operand(value, nested)?),
        FilterVerb::FilterWhere => query.filter_where(operand(value, nested)?),
        FilterVerb::AndFilterWhere => query.and_filter_where(operand(value, nested)?),
        FilterVerb::OrFilterWhere => query.or_filter_where(operand(value, nested)?),
        FilterVerb::Having => query.having(operand(value, nested)?),
        FilterVerb::AndHaving => query.and_having(operand(value, nested)?),
        FilterVerb::OrHaving => query.or_having(operand(value, nested)?),
        FilterVerb::GroupBy => query.group_by(names(value)?),
        FilterVerb::OrderBy => query.order_by(order_items(value)?),
        FilterVerb::Limit => query.limit(number(value, "limit")?),
        FilterVerb::Offset => query.offset(number(value, "offset")?),
        FilterVerb::Distinct => query.distinct(truthy(value)),
        FilterVerb::Join => {
            let args = join_args(value, 2, 3)?;
            let join_type = match &args[0] {
                Json::String(s) => JoinType::parse(s)?,
                _ => return Err(Error::invalid_argument("A join type must be a string.")),
            };
            query.join(join_type, table_item(&args[1])?, join_on(args.get(2))?)
        }
        FilterVerb::LeftJoin => {
            let args = join_args(value, 1, 2)?;
            query.left_join(table_item(&args[0])?, join_on(args.get(1))?)
        }
        FilterVerb::InnerJoin => {
            let args = join_args(value, 1, 2)?;
            query.inner_join(table_item(&args[0])?, join_on(args.get(1))?)
        }
        FilterVerb::RightJoin => {
            let args = join_args(value, 1, 2)?;
            query.right_join(table_item(&args[0])?, join_on(args.get(1))?)
        }
        FilterVerb::IndexBy => match value {
            Json::String(column) => query.index_by(column.as_str()),
            _ => return Err(Error::invalid_argument("index_by expects a column name.")),
        },
    };
    Ok(query)
}

/// `{"query": {...}}` or `{"exp": ...}` when `value` is one of the two
fn nested_operand(value: &Json) -> Result<Option<Operand>> {
    let entries = match value {
        Json::Object(entries) if entries.len() == 1 => entries,
        _ => return Ok(None),
    };
    if let Some(filter) = entries.get("query") {
        return Ok(Some(Operand::from(search(Query::new(), filter)?)));
    }
    if let Some(exp) = entries.get("exp") {
        return Ok(Some(Operand::from(expression(exp)?)));
    }
    Ok(None)
}

/// `"sql"` or `["sql", {"name": value}]`
fn expression(exp: &Json) -> Result<Expression> {
    match exp {
        Json::String(sql) => {
            reject_semicolon(sql)?;
            Ok(Expression::raw(sql.as_str()))
        }
        Json::Array(parts) => match parts.as_slice() {
            [Json::String(sql)] => {
                reject_semicolon(sql)?;
                Ok(Expression::raw(sql.as_str()))
            }
            [Json::String(sql), Json::Object(bound)] => {
                reject_semicolon(sql)?;
                let mut params = Params::new();
                for (name, value) in bound {
                    params.set(name, Value::from_json(value.clone()));
                }
                Ok(Expression::raw_with(sql.as_str(), params))
            }
            _ => Err(Error::invalid_argument("exp expects [sql] or [sql, params].")),
        },
        _ => Err(Error::invalid_argument("exp expects a SQL string.")),
    }
}

/// Reject `;` wherever a condition reaches SQL unbound: operators, column
/// names and hash keys, and every raw member of `and`/`or`/`not`
fn guard_condition(value: &Json) -> Result<()> {
    match value {
        Json::Array(items) => {
            let Some(Json::String(op)) = items.first() else {
                return Ok(());
            };
            reject_semicolon(op)?;
            match Operator::parse(op).kind() {
                ConditionKind::Not | ConditionKind::Conjunction(_) => {
                    for member in &items[1..] {
                        match member {
                            Json::String(sql) => reject_semicolon(sql)?,
                            other => guard_condition(other)?,
                        }
                    }
                }
                _ => {
                    if let Some(Json::String(column)) = items.get(1) {
                        reject_semicolon(column)?;
                    }
                }
            }
            Ok(())
        }
        Json::Object(entries) => entries.keys().try_for_each(|column| reject_semicolon(column)),
        _ => Ok(()),
    }
}

fn operand(value: &Json, nested: bool) -> Result<Operand> {
    guard_condition(value)?;
    build_operand(value, nested)
}

fn build_operand(value: &Json, nested: bool) -> Result<Operand> {
    if nested {
        if let Some(resolved) = nested_operand(value)? {
            return Ok(resolved);
        }
        return match value {
            Json::Array(items) => items
                .iter()
                .map(|item| build_operand(item, true))
                .collect::<Result<Vec<_>>>()
                .map(Operand::List),
            Json::Object(entries) => entries
                .iter()
                .map(|(key, item)| Ok((key.clone(), build_operand(item, true)?)))
                .collect::<Result<Vec<_>>>()
                .map(Operand::Map),
            scalar => Ok(Operand::from(scalar.clone())),
        };
    }
    Ok(Operand::from(value.clone()))
}

fn column_item(alias: Option<&str>, value: &Json) -> Result<ColumnItem> {
    let column: burrow_core::Column = match nested_operand(value)? {
        Some(Operand::Expr(Expression::Query(query))) => (*query).into(),
        Some(Operand::Expr(expr)) => expr.into(),
        Some(_) => return Err(Error::invalid_argument("Unsupported column value.")),
        None => match value {
            Json::String(name) => {
                reject_semicolon(name)?;
                name.as_str().into()
            }
            _ => return Err(Error::invalid_argument("A column must be a name or an object.")),
        },
    };
    Ok(match alias {
        Some(alias) => ColumnItem::aliased(alias, column),
        None => ColumnItem::new(column),
    })
}

/// `"a, b"`, `["a", {"query": ..}]` or `{"alias": "column"}`
fn column_items(value: &Json) -> Result<Vec<ColumnItem>> {
    match value {
        Json::String(list) => Ok(burrow_core::query::IntoColumns::into_columns(list.as_str())),
        Json::Array(items) => items.iter().map(|item| column_item(None, item)).collect(),
        Json::Object(_) if nested_operand(value)?.is_some() => Ok(vec![column_item(None, value)?]),
        Json::Object(entries) => entries
            .iter()
            .map(|(alias, item)| column_item(Some(alias), item))
            .collect(),
        Json::Null => Ok(Vec::new()),
        _ => Err(Error::invalid_argument("Expected a column list.")),
    }
}

fn table_item(value: &Json) -> Result<ColumnItem> {
    let mut items = column_items(value)?;
    match items.len() {
        1 => Ok(items.remove(0)),
        _ => Err(Error::invalid_argument("A join needs exactly one table.")),
    }
}

fn join_args(value: &Json, min: usize, max: usize) -> Result<Vec<Json>> {
    match value {
        Json::Array(args) if (min..=max).contains(&args.len()) => Ok(args.clone()),
        _ => Err(Error::invalid_argument(format!(
            "A join expects an array of {} to {} arguments.",
            min, max
        ))),
    }
}

fn join_on(value: Option<&Json>) -> Result<Operand> {
    match value {
        None | Some(Json::Null) => Ok(Operand::from("")),
        Some(Json::String(on)) => {
            reject_semicolon(on)?;
            Ok(Operand::from(on.as_str()))
        }
        Some(other) => operand(other, true),
    }
}

fn names(value: &Json) -> Result<Vec<String>> {
    match value {
        Json::String(list) => Ok(list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()),
        Json::Array(items) => items
            .iter()
            .map(|item| match item {
                Json::String(name) => reject_semicolon(name).map(|_| name.clone()),
                _ => Err(Error::invalid_argument("Expected a column name.")),
            })
            .collect(),
        _ => Err(Error::invalid_argument("Expected a column list.")),
    }
}

/// `"a DESC, b"` or `{"a": "desc", "b": 1}`
fn order_items(value: &Json) -> Result<Vec<(String, SortDirection)>> {
    let direction = |v: &Json| match v {
        Json::String(s) if s.eq_ignore_ascii_case("desc") => SortDirection::Desc,
        Json::Number(n) if n.as_i64() == Some(-1) => SortDirection::Desc,
        _ => SortDirection::Asc,
    };
    match value {
        Json::String(list) => Ok(list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|part| match part.rsplit_once(char::is_whitespace) {
                Some((column, dir)) if dir.eq_ignore_ascii_case("desc") => {
                    (column.trim().to_string(), SortDirection::Desc)
                }
                Some((column, dir)) if dir.eq_ignore_ascii_case("asc") => {
                    (column.trim().to_string(), SortDirection::Asc)
                }
                _ => (part.to_string(), SortDirection::Asc),
            })
            .collect()),
        Json::Object(entries) => Ok(entries
            .iter()
            .map(|(column, dir)| (column.clone(), direction(dir)))
            .collect()),
        _ => Err(Error::invalid_argument("Expected an order list.")),
    }
}

fn number(value: &Json, name: &str) -> Result<Option<u64>> {
    match value {
        Json::Null => Ok(None),
        Json::Number(n) => match n.as_u64() {
            Some(0) => Ok(None),
            Some(n) => Ok(Some(n)),
            None => Err(Error::invalid_argument(format!("{} must be a positive integer.", name))),
        },
        Json::String(s) if s.trim().is_empty() => Ok(None),
        Json::String(s) => s
            .trim()
            .parse::<u64>()
            .map(|n| Some(n).filter(|n| *n > 0))
            .map_err(|_| Error::invalid_argument(format!("{} must be a positive integer.", name))),
        _ => Err(Error::invalid_argument(format!("{} must be a positive integer.", name))),
    }
}

fn truthy(value: &Json) -> bool {
    match value {
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().map_or(false, |n| n != 0.0),
        Json::String(s) => !s.is_empty() && s != "0",
        Json::Null => false,
        Json::Array(items) => !items.is_empty(),
        Json::Object(entries) => !entries.is_empty(),
    }
}

/// One page of results plus the total row count
#[derive(Debug, Clone)]
pub struct SearchPage {
    pub total: i64,
    pub data: Vec<Row>,
}

impl SearchPage {
    /// `{"total": n, "data": [...]}`
    pub fn to_json(&self) -> Json {
        serde_json::json!({
            "total": self.total,
            "data": self.data.iter().map(Row::to_json).collect::<Vec<_>>(),
        })
    }
}

/// Fetch one page of `query` narrowed by `filter`.
///
/// `limit` (default 20), `offset` (default `(page - 1) * limit`) and `count`
/// (the COUNT argument, default `1`) are read out of the filter first. With
/// a limit the total is counted separately; without one it is the number of
/// rows returned. `cache` applies to both the page and the count.
pub async fn search_list<P: Pool>(
    query: Query,
    filter: &Json,
    page: u64,
    cache: Option<CachePolicy>,
    session: &mut Session<P>,
) -> Result<SearchPage> {
    let mut entries = match filter {
        Json::Object(entries) => entries.clone(),
        Json::Null => Map::new(),
        _ => return Err(Error::invalid_argument("A search filter must be an object.")),
    };
    let limit = match entries.remove("limit") {
        Some(value) => number(&value, "limit")?,
        None => Some(20),
    };
    let offset = match entries.remove("offset") {
        Some(value) => number(&value, "offset")?,
        None => limit.map(|limit| page.saturating_sub(1) * limit),
    };
    let count = match entries.remove("count") {
        Some(Json::String(expr)) => {
            reject_semicolon(&expr)?;
            expr
        }
        Some(Json::Number(n)) => n.to_string(),
        Some(_) => return Err(Error::invalid_argument("count expects a SQL expression.")),
        None => "1".to_string(),
    };

    let query = if entries.is_empty() {
        query
    } else {
        apply_all(query, &entries)?
    };
    let query = match cache {
        Some(policy) => query.cache_with(policy),
        None => query,
    };
    let data = query.clone().limit(limit).offset(offset).all(session).await?;
    let total = match limit {
        Some(_) => query.limit(None).offset(None).count(session, &count).await?,
        None => data.len() as i64,
    };
    Ok(SearchPage { total, data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_core::dialect::MySqlDialect;
    use burrow_core::executor::mock::MockPool;
    use burrow_core::{Connection, ConnectionConfig, QueryBuilder};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn build(query: &Query) -> (String, Vec<Value>) {
        let (sql, params) = QueryBuilder::new(Arc::new(MySqlDialect))
            .build(query, Params::new())
            .unwrap();
        (sql, params.values())
    }

    #[test]
    fn test_verb_parsing() {
        assert_eq!("and_where".parse::<FilterVerb>().unwrap(), FilterVerb::AndWhere);
        assert_eq!("andFilterWhere".parse::<FilterVerb>().unwrap(), FilterVerb::AndFilterWhere);
        assert_eq!("INDEX_BY".parse::<FilterVerb>().unwrap(), FilterVerb::IndexBy);
        assert!("drop".parse::<FilterVerb>().is_err());
    }

    #[test]
    fn test_search_builds_query() {
        let filter = json!({
            "select": "id, name",
            "from": "user",
            "where": {"status": 1},
            "and_where": [">", "age", 18],
            "order_by": {"id": "desc"},
            "limit": 10
        });
        let query = search(Query::new(), &filter).unwrap();
        let (sql, params) = build(&query);
        assert_eq!(
            sql,
            "SELECT `id`, `name` FROM `user` WHERE (`status` = ?) AND (`age` > ?) ORDER BY `id` DESC LIMIT 10"
        );
        assert_eq!(params, vec![Value::I64(1), Value::I64(18)]);
    }

    #[test]
    fn test_repeated_keys() {
        let filter = json!({
            "from": "user",
            "and_filter_where[]": [{"role": ""}, ["like", "name", "jo"]]
        });
        let query = search(Query::new(), &filter).unwrap();
        let (sql, params) = build(&query);
        assert_eq!(sql, "SELECT * FROM `user` WHERE `name` LIKE ?");
        assert_eq!(params, vec![Value::from("%jo%")]);
    }

    #[test]
    fn test_nested_query_and_expression() {
        let filter = json!({
            "from": "user",
            "where": ["in", "id", {"query": {"select": "user_id", "from": "order"}}],
            "and_where": {"exp": "created_at > NOW()"}
        });
        let query = search(Query::new(), &filter).unwrap();
        let (sql, _) = build(&query);
        assert_eq!(
            sql,
            "SELECT * FROM `user` WHERE (`id` IN (SELECT `user_id` FROM `order`)) AND (created_at > NOW())"
        );
    }

    #[test]
    fn test_semicolon_rejected() {
        for filter in [
            json!({"select": "id; DROP TABLE user"}),
            json!({"where": {"exp": "1=1; DELETE FROM user"}}),
            json!({"order_by": "id;"}),
            json!({"where": ["or", "a=1", "b=2; DROP TABLE t"]}),
            json!({"having": ["and", ["or", "a=1", "b=2;"], "c=3"]}),
            json!({"and_where[]": [["not", "x; DELETE FROM user"]]}),
            json!({"where": ["=", "id; DROP TABLE t", 1]}),
            json!({"where": {"id; DROP TABLE t": 1}}),
        ] {
            let err = search(Query::new(), &filter).unwrap_err();
            assert!(err.to_string().contains("Sql can not include ';'!"));
        }
    }

    #[test]
    fn test_semicolon_allowed_in_bound_values() {
        let filter = json!({
            "from": "user",
            "where": ["or", ["=", "note", "a;b"], {"name": "x;y"}]
        });
        let query = search(Query::new(), &filter).unwrap();
        let (sql, params) = build(&query);
        assert_eq!(sql, "SELECT * FROM `user` WHERE (`note` = ?) OR (`name` = ?)");
        assert_eq!(params, vec![Value::from("a;b"), Value::from("x;y")]);
    }

    #[test]
    fn test_unknown_method() {
        let err = tokio_test::assert_err!(search(Query::new(), &json!({"truncate": "user"})));
        assert!(err.to_string().contains("Unknown filter method 'truncate'."));
    }

    #[test]
    fn test_joins() {
        let filter = json!({
            "from": "user u",
            "left_join": ["profile p", "p.user_id = u.id"],
            "join": ["inner", {"o": "order"}, {"o.user_id": {"exp": "u.id"}}]
        });
        let query = search(Query::new(), &filter).unwrap();
        let (sql, _) = build(&query);
        assert_eq!(
            sql,
            "SELECT * FROM `user` `u` LEFT JOIN `profile` `p` ON p.user_id = u.id \
             INNER JOIN `order` `o` ON `o`.`user_id` = u.id"
        );
    }

    #[tokio::test]
    async fn test_search_list_pages() {
        let pool = MockPool::new("mysql://localhost/app")
            .with_rows("SELECT * FROM", vec![Row::new().with("id", 3)])
            .with_rows("COUNT(1)", vec![Row::new().with("total", 21i64)]);
        let conn = Connection::new(ConnectionConfig::new("mysql://localhost/app"), pool.clone()).unwrap();
        let mut session = conn.create_session();

        let page = search_list(
            Query::new().from("user"),
            &json!({"where": {"status": 1}}),
            2,
            None,
            &mut session,
        )
        .await
        .unwrap();
        assert_eq!(page.total, 21);
        assert_eq!(page.data.len(), 1);
        assert_eq!(
            pool.statements(),
            vec![
                "SELECT * FROM `user` WHERE `status` = ? LIMIT 20 OFFSET 20",
                "SELECT COUNT(1) FROM `user` WHERE `status` = ?",
            ]
        );
        assert_eq!(page.to_json()["total"], json!(21));
    }

    #[tokio::test]
    async fn test_search_list_without_limit() {
        let pool = MockPool::new("mysql://localhost/app").with_rows(
            "FROM `user`",
            vec![Row::new().with("id", 1), Row::new().with("id", 2)],
        );
        let conn = Connection::new(ConnectionConfig::new("mysql://localhost/app"), pool.clone()).unwrap();
        let mut session = conn.create_session();

        let page = search_list(Query::new().from("user"), &json!({"limit": 0}), 1, None, &mut session)
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(pool.statements(), vec!["SELECT * FROM `user`"]);
    }

    #[tokio::test]
    async fn test_search_list_cached() {
        let pool = MockPool::new("mysql://localhost/app")
            .with_rows("SELECT * FROM", vec![Row::new().with("id", 3)])
            .with_rows("COUNT(1)", vec![Row::new().with("total", 1i64)]);
        let conn = Connection::new(ConnectionConfig::new("mysql://localhost/app"), pool.clone()).unwrap();
        let mut session = conn.create_session();

        for _ in 0..2 {
            let page = search_list(
                Query::new().from("user"),
                &json!({"limit": 5}),
                1,
                Some(CachePolicy::new(Some(Duration::from_secs(60)))),
                &mut session,
            )
            .await
            .unwrap();
            assert_eq!(page.total, 1);
            assert_eq!(page.data.len(), 1);
        }
        assert_eq!(pool.statements().len(), 2);
    }
}
