//! Builders for the condition families

use super::registry::BuildExpression;
use super::QueryBuilder;
use crate::condition::{
    BetweenCondition, Condition, HashCondition, InCondition, LikeCondition, LikeEscape,
};
use crate::error::{Error, Result};
use crate::expression::{Expression, Operand};
use crate::operator::Conjunction;
use crate::params::Params;
use crate::value::Value;

fn condition_of<'a>(expr: &'a Expression, builder: &str) -> Result<&'a Condition> {
    match expr {
        Expression::Condition(c) => Ok(c),
        _ => Err(Error::invalid_argument(format!(
            "{} received an expression it can not build",
            builder
        ))),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HashBuilder;

impl BuildExpression for HashBuilder {
    fn build(&self, qb: &QueryBuilder, expr: &Expression, params: &mut Params) -> Result<String> {
        let Condition::Hash(HashCondition { entries }) = condition_of(expr, "HashBuilder")? else {
            return Err(Error::invalid_argument("HashBuilder expects a hash condition"));
        };
        let mut parts = Vec::with_capacity(entries.len());
        for (column, value) in entries {
            let is_list = matches!(value, Operand::List(_) | Operand::Value(Value::Array(_)))
                || value.as_query().is_some();
            if is_list {
                let condition = Condition::in_list(column.as_str(), value.clone());
                parts.push(qb.build_expression(&Expression::condition(condition), params)?);
                continue;
            }
            let quoted = qb.column_name(column);
            let part = match value {
                Operand::Value(Value::Null) => format!("{} IS NULL", quoted),
                Operand::Expr(e) => format!("{} = {}", quoted, qb.build_expression(e, params)?),
                other => format!("{} = {}", quoted, qb.bind_operand(other, params)?),
            };
            parts.push(part);
        }
        Ok(parts.join(" AND "))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleBuilder;

impl BuildExpression for SimpleBuilder {
    fn build(&self, qb: &QueryBuilder, expr: &Expression, params: &mut Params) -> Result<String> {
        let Condition::Simple(simple) = condition_of(expr, "SimpleBuilder")? else {
            return Err(Error::invalid_argument("SimpleBuilder expects a simple condition"));
        };
        let column = qb.column_sql(&simple.column, params)?;
        let value = match &simple.value {
            Operand::Value(Value::Null) => "NULL".to_string(),
            other => qb.bind_operand(other, params)?,
        };
        Ok(format!("{} {} {}", column, simple.operator, value))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NotBuilder;

impl BuildExpression for NotBuilder {
    fn build(&self, qb: &QueryBuilder, expr: &Expression, params: &mut Params) -> Result<String> {
        let Condition::Not(not) = condition_of(expr, "NotBuilder")? else {
            return Err(Error::invalid_argument("NotBuilder expects a NOT condition"));
        };
        let inner = qb.build_condition(&not.condition, params)?;
        if inner.is_empty() {
            return Ok(String::new());
        }
        Ok(format!("NOT ({})", inner))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConjunctionBuilder;

impl BuildExpression for ConjunctionBuilder {
    fn build(&self, qb: &QueryBuilder, expr: &Expression, params: &mut Params) -> Result<String> {
        let Condition::Conjunction(conj) = condition_of(expr, "ConjunctionBuilder")? else {
            return Err(Error::invalid_argument("ConjunctionBuilder expects AND/OR"));
        };
        let mut parts = Vec::with_capacity(conj.operands.len());
        for operand in &conj.operands {
            let part = qb.build_condition(operand, params)?;
            if !part.is_empty() {
                parts.push(part);
            }
        }
        Ok(match parts.len() {
            0 => String::new(),
            1 => parts.remove(0),
            _ => format!(
                "({})",
                parts.join(&format!(") {} (", conj.conjunction.as_str()))
            ),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BetweenBuilder;

impl BuildExpression for BetweenBuilder {
    fn build(&self, qb: &QueryBuilder, expr: &Expression, params: &mut Params) -> Result<String> {
        let Condition::Between(BetweenCondition {
            column,
            negated,
            from,
            to,
        }) = condition_of(expr, "BetweenBuilder")?
        else {
            return Err(Error::invalid_argument("BetweenBuilder expects BETWEEN"));
        };
        let column = qb.column_sql(column, params)?;
        let from = qb.bind_operand(from, params)?;
        let to = qb.bind_operand(to, params)?;
        let operator = if *negated { "NOT BETWEEN" } else { "BETWEEN" };
        Ok(format!("{} {} {} AND {}", column, operator, from, to))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InBuilder;

impl InBuilder {
    fn empty_result(negated: bool) -> String {
        if negated {
            String::new()
        } else {
            "0=1".to_string()
        }
    }

    /// Flatten the value operand into its members
    fn members(values: &Operand) -> Vec<Operand> {
        match values {
            Operand::List(items) => items.clone(),
            Operand::Value(Value::Array(items)) => {
                items.iter().cloned().map(Operand::Value).collect()
            }
            other => vec![other.clone()],
        }
    }

    fn composite_columns(column: &Operand) -> Option<Vec<String>> {
        match column {
            Operand::List(items) => Some(
                items
                    .iter()
                    .map(|c| match c {
                        Operand::Value(v) => v.to_plain_string(),
                        _ => String::new(),
                    })
                    .collect(),
            ),
            _ => None,
        }
    }

    fn build_composite(
        &self,
        qb: &QueryBuilder,
        columns: &[String],
        cond: &InCondition,
        params: &mut Params,
    ) -> Result<String> {
        let rows = Self::members(&cond.values);
        let mut tuples = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut placeholders = Vec::with_capacity(columns.len());
            for (i, column) in columns.iter().enumerate() {
                let value = match row {
                    Operand::Map(entries) => entries
                        .iter()
                        .find(|(k, _)| k == column)
                        .map(|(_, v)| v.clone()),
                    Operand::List(items) => items.get(i).cloned(),
                    Operand::Value(Value::Array(items)) => items.get(i).cloned().map(Operand::Value),
                    _ => None,
                };
                placeholders.push(match value {
                    None | Some(Operand::Value(Value::Null)) => "NULL".to_string(),
                    Some(v) => qb.bind_operand(&v, params)?,
                });
            }
            tuples.push(format!("({})", placeholders.join(", ")));
        }
        if tuples.is_empty() {
            return Ok(Self::empty_result(cond.negated));
        }
        let quoted: Vec<String> = columns.iter().map(|c| qb.column_name(c)).collect();
        let operator = if cond.negated { "NOT IN" } else { "IN" };
        Ok(format!(
            "({}) {} ({})",
            quoted.join(", "),
            operator,
            tuples.join(", ")
        ))
    }
}

impl BuildExpression for InBuilder {
    fn build(&self, qb: &QueryBuilder, expr: &Expression, params: &mut Params) -> Result<String> {
        let Condition::In(cond) = condition_of(expr, "InBuilder")? else {
            return Err(Error::invalid_argument("InBuilder expects IN"));
        };
        let operator = if cond.negated { "NOT IN" } else { "IN" };

        if let Some(query) = cond.values.as_query() {
            let column = match Self::composite_columns(&cond.column) {
                Some(columns) => format!(
                    "({})",
                    columns
                        .iter()
                        .map(|c| qb.column_name(c))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                None => qb.column_sql(&cond.column, params)?,
            };
            let sql = qb.build_into(query, params)?;
            return Ok(format!("{} {} ({})", column, operator, sql));
        }

        if let Operand::Expr(other) = &cond.values {
            let column = qb.column_sql(&cond.column, params)?;
            let sql = qb.build_expression(other, params)?;
            return Ok(format!("{} {} ({})", column, operator, sql));
        }

        if let Some(columns) = Self::composite_columns(&cond.column) {
            if columns.len() > 1 {
                return self.build_composite(qb, &columns, cond, params);
            }
        }

        let column_name = match &cond.column {
            Operand::List(items) => items.first().cloned().unwrap_or(Operand::Value(Value::Null)),
            other => other.clone(),
        };
        let plain_name = column_name.as_str().map(str::to_string);
        let column = qb.column_sql(&column_name, params)?;

        let mut placeholders = Vec::new();
        let mut has_null = false;
        for member in Self::members(&cond.values) {
            let member = match (member, &plain_name) {
                (Operand::Map(entries), Some(name)) => entries
                    .into_iter()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v)
                    .unwrap_or(Operand::Value(Value::Null)),
                (m, _) => m,
            };
            match member {
                Operand::Value(Value::Null) => has_null = true,
                other => placeholders.push(qb.bind_operand(&other, params)?),
            }
        }

        if placeholders.is_empty() {
            return Ok(match (has_null, cond.negated) {
                (true, false) => format!("{} IS NULL", column),
                (true, true) => format!("{} IS NOT NULL", column),
                (false, negated) => Self::empty_result(negated),
            });
        }

        let sql = if placeholders.len() == 1 {
            let op = if cond.negated { "<>" } else { "=" };
            format!("{} {} {}", column, op, placeholders[0])
        } else {
            format!("{} {} ({})", column, operator, placeholders.join(", "))
        };

        Ok(match (has_null, cond.negated) {
            (false, _) => sql,
            (true, false) => format!("({} OR {} IS NULL)", sql, column),
            (true, true) => format!("({} AND {} IS NOT NULL)", sql, column),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LikeBuilder;

impl BuildExpression for LikeBuilder {
    fn build(&self, qb: &QueryBuilder, expr: &Expression, params: &mut Params) -> Result<String> {
        let Condition::Like(LikeCondition {
            column,
            negated,
            combine,
            values,
            escape,
        }) = condition_of(expr, "LikeBuilder")?
        else {
            return Err(Error::invalid_argument("LikeBuilder expects LIKE"));
        };

        let patterns = match values {
            Operand::List(items) => items.clone(),
            Operand::Value(Value::Array(items)) => items.iter().cloned().map(Operand::Value).collect(),
            other if other.is_empty() => Vec::new(),
            other => vec![other.clone()],
        };
        if patterns.is_empty() {
            return Ok(if *negated { String::new() } else { "0=1".to_string() });
        }

        let column = qb.column_sql(column, params)?;
        let operator = if *negated { "NOT LIKE" } else { "LIKE" };
        let escape_sql = qb.dialect().like_escape_sql().unwrap_or("");
        let mut parts = Vec::with_capacity(patterns.len());
        for pattern in &patterns {
            let placeholder = match pattern {
                Operand::Expr(e) => qb.build_expression(e, params)?,
                Operand::Value(v) => {
                    let bound = match escape {
                        LikeEscape::Disabled => v.to_plain_string(),
                        other => format!("%{}%", other.apply(&v.to_plain_string())),
                    };
                    params.push(bound).to_string()
                }
                _ => {
                    return Err(Error::invalid_argument(
                        "LIKE patterns must be values or expressions",
                    ))
                }
            };
            parts.push(format!("{} {} {}{}", column, operator, placeholder, escape_sql));
        }
        let glue = match combine {
            Conjunction::And => " AND ",
            Conjunction::Or => " OR ",
        };
        Ok(parts.join(glue))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExistsBuilder;

impl BuildExpression for ExistsBuilder {
    fn build(&self, qb: &QueryBuilder, expr: &Expression, params: &mut Params) -> Result<String> {
        let Condition::Exists(exists) = condition_of(expr, "ExistsBuilder")? else {
            return Err(Error::invalid_argument("ExistsBuilder expects EXISTS"));
        };
        let sql = qb.build_into(&exists.query, params)?;
        let operator = if exists.negated { "NOT EXISTS" } else { "EXISTS" };
        Ok(format!("{} ({})", operator, sql))
    }
}
