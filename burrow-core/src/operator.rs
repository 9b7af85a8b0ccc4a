//! Condition operator tokens and the operator table of the condition DSL

use std::borrow::Cow;
use std::fmt::{self, Display};

/// A normalized (upper-cased) condition operator token
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Operator(Cow<'static, str>);

/// How two or more operands are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Conjunction {
    And,
    Or,
}

impl Conjunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Conjunction::And => "AND",
            Conjunction::Or => "OR",
        }
    }
}

/// Condition variant an operator token resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    Not,
    Conjunction(Conjunction),
    Between { negated: bool },
    In { negated: bool },
    Like { negated: bool, combine: Conjunction },
    Exists { negated: bool },
    Simple,
}

impl Operator {
    pub const AND: Self = Operator(Cow::Borrowed("AND"));
    pub const OR: Self = Operator(Cow::Borrowed("OR"));
    pub const NOT: Self = Operator(Cow::Borrowed("NOT"));
    pub const BETWEEN: Self = Operator(Cow::Borrowed("BETWEEN"));
    pub const NOT_BETWEEN: Self = Operator(Cow::Borrowed("NOT BETWEEN"));
    pub const IN: Self = Operator(Cow::Borrowed("IN"));
    pub const NOT_IN: Self = Operator(Cow::Borrowed("NOT IN"));
    pub const LIKE: Self = Operator(Cow::Borrowed("LIKE"));
    pub const NOT_LIKE: Self = Operator(Cow::Borrowed("NOT LIKE"));
    pub const OR_LIKE: Self = Operator(Cow::Borrowed("OR LIKE"));
    pub const OR_NOT_LIKE: Self = Operator(Cow::Borrowed("OR NOT LIKE"));
    pub const EXISTS: Self = Operator(Cow::Borrowed("EXISTS"));
    pub const NOT_EXISTS: Self = Operator(Cow::Borrowed("NOT EXISTS"));

    pub const EQ: Self = Operator(Cow::Borrowed("="));
    pub const NEQ: Self = Operator(Cow::Borrowed("<>"));
    pub const GT: Self = Operator(Cow::Borrowed(">"));
    pub const GTE: Self = Operator(Cow::Borrowed(">="));
    pub const LT: Self = Operator(Cow::Borrowed("<"));
    pub const LTE: Self = Operator(Cow::Borrowed("<="));

    /// Normalize an arbitrary token: trimmed and upper-cased
    pub fn parse(token: &str) -> Self {
        Operator(Cow::Owned(token.trim().to_uppercase()))
    }

    /// Get the string representation of the operator
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Look the token up in the operator table.
    ///
    /// Tokens outside the table are binary comparisons (`Simple`).
    pub fn kind(&self) -> ConditionKind {
        match self.as_str() {
            "NOT" => ConditionKind::Not,
            "AND" => ConditionKind::Conjunction(Conjunction::And),
            "OR" => ConditionKind::Conjunction(Conjunction::Or),
            "BETWEEN" => ConditionKind::Between { negated: false },
            "NOT BETWEEN" => ConditionKind::Between { negated: true },
            "IN" => ConditionKind::In { negated: false },
            "NOT IN" => ConditionKind::In { negated: true },
            "LIKE" => ConditionKind::Like {
                negated: false,
                combine: Conjunction::And,
            },
            "NOT LIKE" => ConditionKind::Like {
                negated: true,
                combine: Conjunction::And,
            },
            "OR LIKE" => ConditionKind::Like {
                negated: false,
                combine: Conjunction::Or,
            },
            "OR NOT LIKE" => ConditionKind::Like {
                negated: true,
                combine: Conjunction::Or,
            },
            "EXISTS" => ConditionKind::Exists { negated: false },
            "NOT EXISTS" => ConditionKind::Exists { negated: true },
            _ => ConditionKind::Simple,
        }
    }
}

impl Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Conjunction> for Operator {
    fn from(c: Conjunction) -> Self {
        match c {
            Conjunction::And => Operator::AND,
            Conjunction::Or => Operator::OR,
        }
    }
}

/// Trait for types that can be converted to condition operators
pub trait IntoOperator {
    fn into_operator(self) -> Operator;
}

impl IntoOperator for Operator {
    fn into_operator(self) -> Operator {
        self
    }
}

impl IntoOperator for &str {
    fn into_operator(self) -> Operator {
        Operator::parse(self)
    }
}

/// Convenience module for operator constants
pub mod op {
    use super::Operator;

    pub const AND: Operator = Operator::AND;
    pub const OR: Operator = Operator::OR;
    pub const NOT: Operator = Operator::NOT;
    pub const IN: Operator = Operator::IN;
    pub const NOT_IN: Operator = Operator::NOT_IN;
    pub const LIKE: Operator = Operator::LIKE;
    pub const BETWEEN: Operator = Operator::BETWEEN;
    pub const EXISTS: Operator = Operator::EXISTS;
    pub const EQ: Operator = Operator::EQ;
    pub const NEQ: Operator = Operator::NEQ;
    pub const GT: Operator = Operator::GT;
    pub const GTE: Operator = Operator::GTE;
    pub const LT: Operator = Operator::LT;
    pub const LTE: Operator = Operator::LTE;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_constants() {
        assert_eq!(Operator::GT.as_str(), ">");
        assert_eq!(Operator::NOT_IN.as_str(), "NOT IN");
        assert_eq!(Operator::OR_NOT_LIKE.as_str(), "OR NOT LIKE");
    }

    #[test]
    fn test_parse_normalizes_case() {
        assert_eq!(Operator::parse(" not between "), Operator::NOT_BETWEEN);
        assert_eq!("or like".into_operator(), Operator::OR_LIKE);
        assert_eq!(format!("{}", Operator::parse("@@")), "@@");
    }

    #[test]
    fn test_operator_table() {
        assert_eq!(Operator::parse("and").kind(), ConditionKind::Conjunction(Conjunction::And));
        assert_eq!(Operator::parse("Not In").kind(), ConditionKind::In { negated: true });
        assert_eq!(
            Operator::parse("or not like").kind(),
            ConditionKind::Like {
                negated: true,
                combine: Conjunction::Or
            }
        );
        assert_eq!(Operator::parse("not exists").kind(), ConditionKind::Exists { negated: true });
    }

    #[test]
    fn test_unknown_tokens_are_simple() {
        assert_eq!(Operator::parse(">=").kind(), ConditionKind::Simple);
        assert_eq!(Operator::parse("ILIKE").kind(), ConditionKind::Simple);
    }
}
