//! Builders for value-like expressions: raw SQL, typed values, subqueries,
//! arrays and JSON documents

use super::registry::BuildExpression;
use super::QueryBuilder;
use crate::error::{Error, Result};
use crate::expression::{ArrayExpression, ArraySource, Expression};
use crate::params::Params;
use crate::value::Value;

fn mismatch(builder: &str) -> Error {
    Error::invalid_argument(format!("{} received an expression it can not build", builder))
}

/// Emits the SQL verbatim and merges its params
#[derive(Debug, Clone, Copy, Default)]
pub struct RawBuilder;

impl BuildExpression for RawBuilder {
    fn build(&self, _qb: &QueryBuilder, expr: &Expression, params: &mut Params) -> Result<String> {
        match expr {
            Expression::Raw(raw) => {
                params.extend(raw.params.clone());
                Ok(raw.sql.clone())
            }
            _ => Err(mismatch("RawBuilder")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TypedBuilder;

impl BuildExpression for TypedBuilder {
    fn build(&self, _qb: &QueryBuilder, expr: &Expression, params: &mut Params) -> Result<String> {
        match expr {
            Expression::Typed(typed) => Ok(params
                .push_typed(typed.value.clone(), typed.param_type)
                .to_string()),
            _ => Err(mismatch("TypedBuilder")),
        }
    }
}

/// Subquery as a parenthesised fragment
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryExpressionBuilder;

impl BuildExpression for QueryExpressionBuilder {
    fn build(&self, qb: &QueryBuilder, expr: &Expression, params: &mut Params) -> Result<String> {
        match expr {
            Expression::Query(query) => Ok(format!("({})", qb.build_into(query, params)?)),
            _ => Err(mismatch("QueryExpressionBuilder")),
        }
    }
}

/// Postgres `ARRAY[...]::type[]` literals
#[derive(Debug, Clone, Copy, Default)]
pub struct ArrayBuilder;

impl ArrayBuilder {
    fn type_hint(array: &ArrayExpression) -> String {
        match &array.element_type {
            Some(t) => format!("::{}{}", t, "[]".repeat(array.dimension.max(1))),
            None => String::new(),
        }
    }

    fn build_array(&self, qb: &QueryBuilder, array: &ArrayExpression, params: &mut Params) -> Result<String> {
        let hint = Self::type_hint(array);
        let values = match &array.source {
            ArraySource::Query(query) => {
                return Ok(format!("ARRAY({}){}", qb.build_into(query, params)?, hint))
            }
            ArraySource::Values(values) => values,
        };
        if values.is_empty() {
            return Ok(format!("ARRAY[]{}", hint));
        }
        let mut placeholders = Vec::with_capacity(values.len());
        for value in values {
            match value {
                Value::Array(inner) if array.dimension > 1 => {
                    let nested = ArrayExpression {
                        source: ArraySource::Values(inner.clone()),
                        element_type: array.element_type.clone(),
                        dimension: array.dimension - 1,
                    };
                    placeholders.push(self.build_array(qb, &nested, params)?);
                }
                other => placeholders.push(params.push(other.clone()).to_string()),
            }
        }
        Ok(format!("ARRAY[{}]{}", placeholders.join(", "), hint))
    }
}

impl BuildExpression for ArrayBuilder {
    fn build(&self, qb: &QueryBuilder, expr: &Expression, params: &mut Params) -> Result<String> {
        match expr {
            Expression::Array(array) => self.build_array(qb, array, params),
            _ => Err(mismatch("ArrayBuilder")),
        }
    }
}

/// How a dialect marks a bound JSON document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonCast {
    /// `CAST(? AS JSON)`
    CastAs,
    /// `?::json` when a type is set
    Suffix,
    None,
}

/// Binds JSON documents as their serialized text
#[derive(Debug, Clone, Copy)]
pub struct JsonBuilder {
    cast: JsonCast,
}

impl JsonBuilder {
    pub fn new(cast: JsonCast) -> Self {
        Self { cast }
    }
}

impl BuildExpression for JsonBuilder {
    fn build(&self, _qb: &QueryBuilder, expr: &Expression, params: &mut Params) -> Result<String> {
        let json = match expr {
            Expression::Json(json) => json,
            _ => return Err(mismatch("JsonBuilder")),
        };
        let placeholder = params.push(Value::String(json.value.to_string()));
        Ok(match (self.cast, &json.json_type) {
            (JsonCast::CastAs, _) => format!("CAST({} AS JSON)", placeholder),
            (JsonCast::Suffix, Some(t)) => format!("{}::{}", placeholder, t),
            _ => placeholder.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{MySqlDialect, PostgresDialect, SqliteDialect};
    use crate::expression::JsonExpression;
    use crate::query::Query;
    use crate::value::ParamType;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_raw_and_typed() {
        let qb = QueryBuilder::new(Arc::new(SqliteDialect));
        let mut params = Params::new();
        let raw = Expression::raw_with("NOW() - ?", [5].into_iter().collect());
        assert_eq!(qb.build_expression(&raw, &mut params).unwrap(), "NOW() - ?");
        let typed = Expression::typed("blob", ParamType::Lob);
        assert_eq!(qb.build_expression(&typed, &mut params).unwrap(), "?");
        let bound: Vec<_> = params.positional().map(|p| p.param_type).collect();
        assert_eq!(bound, vec![ParamType::Int, ParamType::Lob]);
    }

    #[test]
    fn test_postgres_arrays() {
        let qb = QueryBuilder::new(Arc::new(PostgresDialect));
        let mut params = Params::new();
        let expr = Expression::Array(ArrayExpression::new(vec![1.into(), 2.into()]).of_type("int"));
        assert_eq!(
            qb.build_expression(&expr, &mut params).unwrap(),
            "ARRAY[?, ?]::int[]"
        );

        let nested = Expression::Array(
            ArrayExpression::new(vec![Value::from(vec![1, 2]), Value::from(vec![3, 4])])
                .of_type("int")
                .dimension(2),
        );
        assert_eq!(
            qb.build_expression(&nested, &mut params).unwrap(),
            "ARRAY[ARRAY[?, ?]::int[], ARRAY[?, ?]::int[]]::int[][]"
        );

        let empty = Expression::Array(ArrayExpression::new(Vec::new()).of_type("text"));
        assert_eq!(qb.build_expression(&empty, &mut params).unwrap(), "ARRAY[]::text[]");

        let sub = Expression::Array(ArrayExpression::from_query(
            Query::new().select("id").from("user"),
        ));
        assert_eq!(
            qb.build_expression(&sub, &mut params).unwrap(),
            "ARRAY(SELECT \"id\" FROM \"user\")"
        );
        assert_eq!(params.len(), 6);
    }

    #[test]
    fn test_arrays_need_a_registered_builder() {
        let qb = QueryBuilder::new(Arc::new(MySqlDialect));
        let err = qb
            .build_expression(&Expression::array(vec![1.into()]), &mut Params::new())
            .unwrap_err();
        assert!(err.to_string().contains("Expression of kind Array can not be built"));
    }

    #[test]
    fn test_json_casts() {
        let doc = json!({"a": 1});
        let mut params = Params::new();

        let mysql = QueryBuilder::new(Arc::new(MySqlDialect));
        assert_eq!(
            mysql.build_expression(&Expression::json(doc.clone()), &mut params).unwrap(),
            "CAST(? AS JSON)"
        );

        let pg = QueryBuilder::new(Arc::new(PostgresDialect));
        let typed = Expression::Json(JsonExpression::new(doc.clone()).of_type(JsonExpression::TYPE_JSONB));
        assert_eq!(pg.build_expression(&typed, &mut params).unwrap(), "?::jsonb");
        assert_eq!(pg.build_expression(&Expression::json(doc), &mut params).unwrap(), "?");

        assert_eq!(params.values()[0], Value::String("{\"a\":1}".to_string()));
    }
}
