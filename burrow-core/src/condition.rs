//! Structured conditions and their reconstruction from the operator-array DSL

use crate::error::{Error, Result};
use crate::expression::Operand;
use crate::operator::{ConditionKind, Conjunction, Operator};
use crate::query::Query;
use crate::value::Value;

/// A structured WHERE/HAVING condition
#[derive(Debug, Clone)]
pub enum Condition {
    Hash(HashCondition),
    Simple(SimpleCondition),
    Not(NotCondition),
    Conjunction(ConjunctionCondition),
    Between(BetweenCondition),
    In(InCondition),
    Like(LikeCondition),
    Exists(ExistsCondition),
}

/// `{column: value}` pairs joined by AND
#[derive(Debug, Clone)]
pub struct HashCondition {
    pub entries: Vec<(String, Operand)>,
}

/// `column OP value`
#[derive(Debug, Clone)]
pub struct SimpleCondition {
    pub column: Operand,
    pub operator: Operator,
    pub value: Operand,
}

#[derive(Debug, Clone)]
pub struct NotCondition {
    pub condition: Operand,
}

#[derive(Debug, Clone)]
pub struct ConjunctionCondition {
    pub conjunction: Conjunction,
    pub operands: Vec<Operand>,
}

#[derive(Debug, Clone)]
pub struct BetweenCondition {
    pub column: Operand,
    pub negated: bool,
    pub from: Operand,
    pub to: Operand,
}

/// `column IN (values)`; `column` may be a list for composite keys and
/// `values` may be a subquery
#[derive(Debug, Clone)]
pub struct InCondition {
    pub column: Operand,
    pub negated: bool,
    pub values: Operand,
}

/// Escaping applied to LIKE patterns before binding
#[derive(Debug, Clone, PartialEq)]
pub enum LikeEscape {
    /// `\` → `\\`, `%` → `\%`, `_` → `\_`
    Default,
    Custom(Vec<(String, String)>),
    /// Patterns are bound verbatim
    Disabled,
}

impl LikeEscape {
    pub fn apply(&self, pattern: &str) -> String {
        match self {
            LikeEscape::Default => pattern
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_"),
            LikeEscape::Custom(map) => {
                // single pass so replacements are never re-escaped
                let mut out = String::with_capacity(pattern.len());
                let mut rest = pattern;
                'outer: while !rest.is_empty() {
                    for (from, to) in map {
                        if !from.is_empty() && rest.starts_with(from.as_str()) {
                            out.push_str(to);
                            rest = &rest[from.len()..];
                            continue 'outer;
                        }
                    }
                    let mut chars = rest.chars();
                    if let Some(c) = chars.next() {
                        out.push(c);
                    }
                    rest = chars.as_str();
                }
                out
            }
            LikeEscape::Disabled => pattern.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LikeCondition {
    pub column: Operand,
    pub negated: bool,
    pub combine: Conjunction,
    pub values: Operand,
    pub escape: LikeEscape,
}

#[derive(Debug, Clone)]
pub struct ExistsCondition {
    pub negated: bool,
    pub query: Box<Query>,
}

impl Condition {
    /// Rebuild a condition from its operator-array or hash form
    pub fn from_operand(operand: &Operand) -> Result<Condition> {
        match operand {
            Operand::Map(entries) => Ok(Condition::Hash(HashCondition {
                entries: entries.clone(),
            })),
            Operand::List(items) => {
                let token = items.first().and_then(Operand::as_str).ok_or_else(|| {
                    Error::invalid_argument(
                        "Operator-form condition must start with an operator string.",
                    )
                })?;
                Self::from_parts(Operator::parse(token), &items[1..])
            }
            _ => Err(Error::invalid_argument(
                "Condition must be an operator list or a hash.",
            )),
        }
    }

    fn from_parts(operator: Operator, operands: &[Operand]) -> Result<Condition> {
        let cond = match operator.kind() {
            ConditionKind::Not => {
                if operands.len() != 1 {
                    return Err(Error::invalid_argument(format!(
                        "Operator '{}' requires exactly one operand.",
                        operator
                    )));
                }
                Condition::Not(NotCondition {
                    condition: operands[0].clone(),
                })
            }
            ConditionKind::Conjunction(conjunction) => Condition::Conjunction(ConjunctionCondition {
                conjunction,
                operands: operands.to_vec(),
            }),
            ConditionKind::Between { negated } => {
                if operands.len() < 3 {
                    return Err(Error::invalid_argument(format!(
                        "Operator '{}' requires three operands.",
                        operator
                    )));
                }
                Condition::Between(BetweenCondition {
                    column: operands[0].clone(),
                    negated,
                    from: operands[1].clone(),
                    to: operands[2].clone(),
                })
            }
            ConditionKind::In { negated } => {
                require_two(&operator, operands)?;
                Condition::In(InCondition {
                    column: operands[0].clone(),
                    negated,
                    values: operands[1].clone(),
                })
            }
            ConditionKind::Like { negated, combine } => {
                require_two(&operator, operands)?;
                let escape = match operands.get(2) {
                    None => LikeEscape::Default,
                    Some(Operand::Value(Value::Bool(false))) => LikeEscape::Disabled,
                    Some(Operand::Map(map)) => LikeEscape::Custom(
                        map.iter()
                            .map(|(k, v)| {
                                (k.clone(), v.as_str().map(str::to_string).unwrap_or_default())
                            })
                            .collect(),
                    ),
                    Some(_) => LikeEscape::Default,
                };
                Condition::Like(LikeCondition {
                    column: operands[0].clone(),
                    negated,
                    combine,
                    values: operands[1].clone(),
                    escape,
                })
            }
            ConditionKind::Exists { negated } => {
                let query = operands.first().and_then(Operand::as_query).ok_or_else(|| {
                    Error::invalid_argument("Subquery for EXISTS operator must be a Query object.")
                })?;
                Condition::Exists(ExistsCondition {
                    negated,
                    query: Box::new(query.clone()),
                })
            }
            ConditionKind::Simple => {
                if operands.len() != 2 {
                    return Err(Error::invalid_argument(format!(
                        "Operator '{}' requires two operands.",
                        operator
                    )));
                }
                Condition::Simple(SimpleCondition {
                    column: operands[0].clone(),
                    operator,
                    value: operands[1].clone(),
                })
            }
        };
        Ok(cond)
    }

    pub fn hash<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Operand>,
    {
        Condition::Hash(HashCondition {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        })
    }

    pub fn compare(column: impl Into<Operand>, operator: &str, value: impl Into<Operand>) -> Self {
        Condition::Simple(SimpleCondition {
            column: column.into(),
            operator: Operator::parse(operator),
            value: value.into(),
        })
    }

    pub fn not(condition: impl Into<Operand>) -> Self {
        Condition::Not(NotCondition {
            condition: condition.into(),
        })
    }

    pub fn and(operands: Vec<Operand>) -> Self {
        Condition::Conjunction(ConjunctionCondition {
            conjunction: Conjunction::And,
            operands,
        })
    }

    pub fn or(operands: Vec<Operand>) -> Self {
        Condition::Conjunction(ConjunctionCondition {
            conjunction: Conjunction::Or,
            operands,
        })
    }

    pub fn between(
        column: impl Into<Operand>,
        from: impl Into<Operand>,
        to: impl Into<Operand>,
    ) -> Self {
        Condition::Between(BetweenCondition {
            column: column.into(),
            negated: false,
            from: from.into(),
            to: to.into(),
        })
    }

    pub fn in_list(column: impl Into<Operand>, values: impl Into<Operand>) -> Self {
        Condition::In(InCondition {
            column: column.into(),
            negated: false,
            values: values.into(),
        })
    }

    pub fn not_in(column: impl Into<Operand>, values: impl Into<Operand>) -> Self {
        Condition::In(InCondition {
            column: column.into(),
            negated: true,
            values: values.into(),
        })
    }

    pub fn like(column: impl Into<Operand>, values: impl Into<Operand>) -> Self {
        Condition::Like(LikeCondition {
            column: column.into(),
            negated: false,
            combine: Conjunction::And,
            values: values.into(),
            escape: LikeEscape::Default,
        })
    }

    pub fn exists(query: Query) -> Self {
        Condition::Exists(ExistsCondition {
            negated: false,
            query: Box::new(query),
        })
    }

    pub fn not_exists(query: Query) -> Self {
        Condition::Exists(ExistsCondition {
            negated: true,
            query: Box::new(query),
        })
    }
}

fn require_two(operator: &Operator, operands: &[Operand]) -> Result<()> {
    if operands.len() < 2 {
        return Err(Error::invalid_argument(format!(
            "Operator '{}' requires two operands.",
            operator
        )));
    }
    Ok(())
}

impl Operand {
    /// Drop the parts of a condition whose values are empty.
    ///
    /// Returns an empty operand when nothing meaningful remains. Expression
    /// operands and raw strings pass through untouched.
    pub fn filter(self) -> Operand {
        match self {
            Operand::Map(entries) => {
                Operand::Map(entries.into_iter().filter(|(_, v)| !v.is_empty()).collect())
            }
            Operand::List(items) => {
                let op = match items.first().and_then(Operand::as_str) {
                    Some(token) => Operator::parse(token),
                    None => return Operand::List(items),
                };
                let mut iter = items.into_iter();
                let head = iter.next();
                let operands: Vec<Operand> = iter.collect();
                match op.kind() {
                    ConditionKind::Not | ConditionKind::Conjunction(_) => {
                        let kept: Vec<Operand> = operands
                            .into_iter()
                            .map(Operand::filter)
                            .filter(|o| !o.is_empty())
                            .collect();
                        if kept.is_empty() {
                            return Operand::List(Vec::new());
                        }
                        Operand::List(head.into_iter().chain(kept).collect())
                    }
                    ConditionKind::Between { .. } => {
                        if operands.len() >= 3 && (operands[1].is_empty() || operands[2].is_empty())
                        {
                            return Operand::List(Vec::new());
                        }
                        Operand::List(head.into_iter().chain(operands).collect())
                    }
                    _ => {
                        if operands.get(1).map_or(false, Operand::is_empty) {
                            return Operand::List(Vec::new());
                        }
                        Operand::List(head.into_iter().chain(operands).collect())
                    }
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hash, list};

    #[test]
    fn test_operator_form_parsing() {
        let cond = Condition::from_operand(&list!["not between", "age", 1, 10]).unwrap();
        assert!(matches!(cond, Condition::Between(BetweenCondition { negated: true, .. })));

        let cond = Condition::from_operand(&list!["or like", "name", list!["a", "b"]]).unwrap();
        match cond {
            Condition::Like(like) => {
                assert_eq!(like.combine, Conjunction::Or);
                assert!(!like.negated);
                assert_eq!(like.escape, LikeEscape::Default);
            }
            other => panic!("unexpected {:?}", other),
        }

        let cond = Condition::from_operand(&list![">=", "age", 18]).unwrap();
        assert!(matches!(cond, Condition::Simple(ref s) if s.operator == Operator::GTE));

        let cond = Condition::from_operand(&hash! {"a" => 1}).unwrap();
        assert!(matches!(cond, Condition::Hash(_)));
    }

    #[test]
    fn test_operand_count_errors() {
        let err = Condition::from_operand(&list!["not", "a", "b"]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid statement argument: Operator 'NOT' requires exactly one operand."
        );
        let err = Condition::from_operand(&list!["between", "a", 1]).unwrap_err();
        assert!(err.to_string().contains("requires three operands"));
        let err = Condition::from_operand(&list!["in", "a"]).unwrap_err();
        assert!(err.to_string().contains("requires two operands"));
        let err = Condition::from_operand(&list!["=", "a"]).unwrap_err();
        assert!(err.to_string().contains("requires two operands"));
        let err = Condition::from_operand(&list!["exists", "SELECT 1"]).unwrap_err();
        assert!(err
            .to_string()
            .contains("Subquery for EXISTS operator must be a Query object."));
    }

    #[test]
    fn test_like_escape_options() {
        assert_eq!(LikeEscape::Default.apply("10%_a\\"), "10\\%\\_a\\\\");
        assert_eq!(LikeEscape::Disabled.apply("10%"), "10%");
        let custom = LikeEscape::Custom(vec![("%".into(), "!%".into()), ("!".into(), "!!".into())]);
        assert_eq!(custom.apply("a%!"), "a!%!!");

        let cond = Condition::from_operand(&list!["like", "name", "x", false]).unwrap();
        assert!(matches!(cond, Condition::Like(ref l) if l.escape == LikeEscape::Disabled));
    }

    #[test]
    fn test_filter_hash_drops_empty_entries() {
        let filtered = hash! {"a" => "", "b" => 1, "c" => None::<i32>, "d" => list![]}.filter();
        match filtered {
            Operand::Map(entries) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].0, "b");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_filter_nested_conjunctions() {
        let filtered = list!["and", hash! {"a" => ""}, list!["or", list!["=", "b", " "]]].filter();
        assert!(filtered.is_empty());

        let filtered = list!["and", list!["like", "name", ""], list![">", "age", 3]].filter();
        match filtered {
            Operand::List(items) => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[0].as_str(), Some("and"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_filter_between_requires_both_bounds() {
        assert!(list!["between", "age", 1, ""].filter().is_empty());
        assert!(!list!["between", "age", 1, 5].filter().is_empty());
        assert!(!list!["in", "id", list![1]].filter().is_empty());
        assert!(list!["in", "id", list![]].filter().is_empty());
    }
}
