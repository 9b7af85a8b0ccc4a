//! SQL fragment values: raw expressions, typed values, array/JSON values,
//! and the `Operand` form of the condition DSL.

use crate::condition::Condition;
use crate::params::Params;
use crate::query::Query;
use crate::value::{ParamType, Value};

/// Anything the expression builder registry can render
#[derive(Debug, Clone)]
pub enum Expression {
    Raw(RawExpression),
    Typed(TypedValue),
    Array(ArrayExpression),
    Json(JsonExpression),
    Query(Box<Query>),
    Condition(Box<Condition>),
}

impl Expression {
    /// A raw fragment inserted verbatim
    pub fn raw(sql: impl Into<String>) -> Self {
        Expression::Raw(RawExpression::new(sql))
    }

    /// A raw fragment carrying its own parameters
    pub fn raw_with(sql: impl Into<String>, params: Params) -> Self {
        Expression::Raw(RawExpression::with_params(sql, params))
    }

    /// A value bound with an explicit driver type
    pub fn typed(value: impl Into<Value>, param_type: ParamType) -> Self {
        Expression::Typed(TypedValue::new(value, param_type))
    }

    pub fn json(value: serde_json::Value) -> Self {
        Expression::Json(JsonExpression::new(value))
    }

    pub fn array(values: Vec<Value>) -> Self {
        Expression::Array(ArrayExpression::new(values))
    }

    pub fn query(query: Query) -> Self {
        Expression::Query(Box::new(query))
    }

    pub fn condition(condition: Condition) -> Self {
        Expression::Condition(Box::new(condition))
    }

    pub fn as_query(&self) -> Option<&Query> {
        match self {
            Expression::Query(q) => Some(q),
            _ => None,
        }
    }
}

/// Raw SQL text plus the parameters it references
#[derive(Debug, Clone, PartialEq)]
pub struct RawExpression {
    pub sql: String,
    pub params: Params,
}

impl RawExpression {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Params::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Params) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// A scalar bound with a forced driver type
#[derive(Debug, Clone, PartialEq)]
pub struct TypedValue {
    pub value: Value,
    pub param_type: ParamType,
}

impl TypedValue {
    pub fn new(value: impl Into<Value>, param_type: ParamType) -> Self {
        Self {
            value: value.into(),
            param_type,
        }
    }
}

/// Source of an array value
#[derive(Debug, Clone)]
pub enum ArraySource {
    Values(Vec<Value>),
    Query(Box<Query>),
}

/// An array-typed value such as a Postgres `int[]`
#[derive(Debug, Clone)]
pub struct ArrayExpression {
    pub source: ArraySource,
    pub element_type: Option<String>,
    pub dimension: usize,
}

impl ArrayExpression {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            source: ArraySource::Values(values),
            element_type: None,
            dimension: 1,
        }
    }

    pub fn from_query(query: Query) -> Self {
        Self {
            source: ArraySource::Query(Box::new(query)),
            element_type: None,
            dimension: 1,
        }
    }

    pub fn of_type(mut self, element_type: impl Into<String>) -> Self {
        self.element_type = Some(element_type.into());
        self
    }

    pub fn dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }
}

/// A JSON document bound as a single parameter
#[derive(Debug, Clone, PartialEq)]
pub struct JsonExpression {
    pub value: serde_json::Value,
    /// `json` or `jsonb` where the dialect distinguishes them
    pub json_type: Option<String>,
}

impl JsonExpression {
    pub const TYPE_JSON: &'static str = "json";
    pub const TYPE_JSONB: &'static str = "jsonb";

    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value,
            json_type: None,
        }
    }

    pub fn of_type(mut self, json_type: impl Into<String>) -> Self {
        self.json_type = Some(json_type.into());
        self
    }
}

/// One node of the condition DSL.
///
/// A `List` whose first element is a string is the operator form
/// `[OP, operand, ...]`; a `Map` is the hash form `{column: value}`.
#[derive(Debug, Clone)]
pub enum Operand {
    Value(Value),
    List(Vec<Operand>),
    Map(Vec<(String, Operand)>),
    Expr(Expression),
}

impl Operand {
    pub fn list<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Operand>,
    {
        Operand::List(items.into_iter().map(Into::into).collect())
    }

    pub fn map<I, K, T>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, T)>,
        K: Into<String>,
        T: Into<Operand>,
    {
        Operand::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Empty operands are dropped by the filter variants of where builders
    pub fn is_empty(&self) -> bool {
        match self {
            Operand::Value(v) => v.is_blank(),
            Operand::List(items) => items.is_empty(),
            Operand::Map(entries) => entries.is_empty(),
            Operand::Expr(_) => false,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Operand::Value(Value::Null))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Operand::Value(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_query(&self) -> Option<&Query> {
        match self {
            Operand::Expr(Expression::Query(q)) => Some(q),
            _ => None,
        }
    }

    /// Visit every raw string in the tree, including map keys
    pub fn walk_strings<'a>(&'a self, f: &mut dyn FnMut(&'a str)) {
        match self {
            Operand::Value(Value::String(s)) => f(s),
            Operand::Value(_) => {}
            Operand::List(items) => items.iter().for_each(|i| i.walk_strings(f)),
            Operand::Map(entries) => entries.iter().for_each(|(k, v)| {
                f(k);
                v.walk_strings(f);
            }),
            Operand::Expr(Expression::Raw(raw)) => f(&raw.sql),
            Operand::Expr(_) => {}
        }
    }
}

macro_rules! operand_from_value {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Operand {
                fn from(v: $t) -> Self {
                    Operand::Value(Value::from(v))
                }
            }
        )*
    };
}

operand_from_value!(bool, i32, i64, u32, f32, f64, String, &str, &String);

impl From<Value> for Operand {
    fn from(v: Value) -> Self {
        Operand::Value(v)
    }
}

impl From<()> for Operand {
    fn from(_: ()) -> Self {
        Operand::Value(Value::Null)
    }
}

impl<T> From<Option<T>> for Operand
where
    T: Into<Operand>,
{
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => Operand::Value(Value::Null),
        }
    }
}

impl<T> From<Vec<T>> for Operand
where
    T: Into<Operand>,
{
    fn from(items: Vec<T>) -> Self {
        Operand::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<Expression> for Operand {
    fn from(e: Expression) -> Self {
        Operand::Expr(e)
    }
}

impl From<RawExpression> for Operand {
    fn from(e: RawExpression) -> Self {
        Operand::Expr(Expression::Raw(e))
    }
}

impl From<Query> for Operand {
    fn from(q: Query) -> Self {
        Operand::Expr(Expression::query(q))
    }
}

impl From<Condition> for Operand {
    fn from(c: Condition) -> Self {
        Operand::Expr(Expression::condition(c))
    }
}

/// JSON is the wire form of the DSL: arrays are lists, objects are hashes
impl From<serde_json::Value> for Operand {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Array(items) => Operand::List(items.into_iter().map(Operand::from).collect()),
            Json::Object(map) => {
                Operand::Map(map.into_iter().map(|(k, v)| (k, Operand::from(v))).collect())
            }
            scalar => Operand::Value(Value::from_json(scalar)),
        }
    }
}

/// Build an operator-form or value-list operand
///
/// ```
/// use burrow_core::{hash, list};
///
/// let cond = list!["and", hash! {"status" => 1}, list![">", "age", 18]];
/// ```
#[macro_export]
macro_rules! list {
    () => {
        $crate::Operand::List(::std::vec::Vec::new())
    };
    ($($item:expr),+ $(,)?) => {
        $crate::Operand::List(::std::vec![$($crate::Operand::from($item)),+])
    };
}

/// Build a hash-form operand `{column => value}`
#[macro_export]
macro_rules! hash {
    ($($key:expr => $value:expr),* $(,)?) => {
        $crate::Operand::Map(::std::vec![$((::std::string::ToString::to_string(&$key), $crate::Operand::from($value))),*])
    };
}
