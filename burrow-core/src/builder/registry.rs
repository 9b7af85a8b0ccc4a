//! Maps expression families to the builders that render them

use super::conditions::{
    BetweenBuilder, ConjunctionBuilder, ExistsBuilder, HashBuilder, InBuilder, LikeBuilder,
    NotBuilder, SimpleBuilder,
};
use super::values::{QueryExpressionBuilder, RawBuilder, TypedBuilder};
use super::QueryBuilder;
use crate::condition::Condition;
use crate::error::{Error, Result};
use crate::expression::Expression;
use crate::params::Params;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Kind of an expression, used as the registry key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpressionFamily {
    Query,
    Typed,
    Raw,
    Conjunction,
    Not,
    Between,
    In,
    Like,
    Exists,
    Simple,
    Hash,
    Array,
    Json,
}

impl ExpressionFamily {
    pub fn of(expr: &Expression) -> Self {
        match expr {
            Expression::Raw(_) => ExpressionFamily::Raw,
            Expression::Typed(_) => ExpressionFamily::Typed,
            Expression::Array(_) => ExpressionFamily::Array,
            Expression::Json(_) => ExpressionFamily::Json,
            Expression::Query(_) => ExpressionFamily::Query,
            Expression::Condition(c) => match c.as_ref() {
                Condition::Hash(_) => ExpressionFamily::Hash,
                Condition::Simple(_) => ExpressionFamily::Simple,
                Condition::Not(_) => ExpressionFamily::Not,
                Condition::Conjunction(_) => ExpressionFamily::Conjunction,
                Condition::Between(_) => ExpressionFamily::Between,
                Condition::In(_) => ExpressionFamily::In,
                Condition::Like(_) => ExpressionFamily::Like,
                Condition::Exists(_) => ExpressionFamily::Exists,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExpressionFamily::Query => "Query",
            ExpressionFamily::Typed => "Typed",
            ExpressionFamily::Raw => "Raw",
            ExpressionFamily::Conjunction => "Conjunction",
            ExpressionFamily::Not => "Not",
            ExpressionFamily::Between => "Between",
            ExpressionFamily::In => "In",
            ExpressionFamily::Like => "Like",
            ExpressionFamily::Exists => "Exists",
            ExpressionFamily::Simple => "Simple",
            ExpressionFamily::Hash => "Hash",
            ExpressionFamily::Array => "Array",
            ExpressionFamily::Json => "Json",
        }
    }
}

impl fmt::Display for ExpressionFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Renders one expression family to SQL, appending its bound values
pub trait BuildExpression: Send + Sync {
    fn build(&self, qb: &QueryBuilder, expr: &Expression, params: &mut Params) -> Result<String>;
}

/// Family-to-builder table held by each `QueryBuilder`
#[derive(Clone)]
pub struct ExpressionBuilders {
    map: HashMap<ExpressionFamily, Arc<dyn BuildExpression>>,
}

impl ExpressionBuilders {
    /// Builders for every dialect-independent family.
    ///
    /// Arrays and JSON are registered by dialects that support them.
    pub fn defaults() -> Self {
        let mut builders = Self {
            map: HashMap::new(),
        };
        builders.register(ExpressionFamily::Query, Arc::new(QueryExpressionBuilder));
        builders.register(ExpressionFamily::Typed, Arc::new(TypedBuilder));
        builders.register(ExpressionFamily::Raw, Arc::new(RawBuilder));
        builders.register(ExpressionFamily::Conjunction, Arc::new(ConjunctionBuilder));
        builders.register(ExpressionFamily::Not, Arc::new(NotBuilder));
        builders.register(ExpressionFamily::Between, Arc::new(BetweenBuilder));
        builders.register(ExpressionFamily::In, Arc::new(InBuilder));
        builders.register(ExpressionFamily::Like, Arc::new(LikeBuilder));
        builders.register(ExpressionFamily::Exists, Arc::new(ExistsBuilder));
        builders.register(ExpressionFamily::Simple, Arc::new(SimpleBuilder));
        builders.register(ExpressionFamily::Hash, Arc::new(HashBuilder));
        builders
    }

    /// Install or replace the builder of `family`
    pub fn register(&mut self, family: ExpressionFamily, builder: Arc<dyn BuildExpression>) {
        self.map.insert(family, builder);
    }

    pub fn get(&self, family: ExpressionFamily) -> Result<&Arc<dyn BuildExpression>> {
        self.map.get(&family).ok_or_else(|| {
            Error::invalid_argument(format!("Expression of kind {} can not be built", family))
        })
    }

    pub fn contains(&self, family: ExpressionFamily) -> bool {
        self.map.contains_key(&family)
    }
}

impl Default for ExpressionBuilders {
    fn default() -> Self {
        Self::defaults()
    }
}

impl fmt::Debug for ExpressionBuilders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut families: Vec<_> = self.map.keys().map(ExpressionFamily::as_str).collect();
        families.sort_unstable();
        f.debug_struct("ExpressionBuilders")
            .field("families", &families)
            .finish()
    }
}
