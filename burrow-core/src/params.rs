//! Ordered parameter accumulator shared by the compiler and commands

use crate::error::{Error, Result};
use crate::value::{ParamType, Value};

/// A bound value together with the type the driver should bind it as
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub value: Value,
    pub param_type: ParamType,
}

impl Param {
    pub fn new(value: Value) -> Self {
        let param_type = value.param_type();
        Self { value, param_type }
    }

    pub fn typed(value: Value, param_type: ParamType) -> Self {
        Self { value, param_type }
    }
}

/// Key of a parameter: positional entries bind to `?`, named ones to `:name`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamKey {
    Positional,
    Named(String),
}

/// Parameters in bind order.
///
/// Positional entries keep insertion order. Named entries keep the position
/// of their first insertion and are replaced on rebinding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    entries: Vec<(ParamKey, Param)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional value and return its placeholder
    pub fn push(&mut self, value: impl Into<Value>) -> &'static str {
        self.entries
            .push((ParamKey::Positional, Param::new(value.into())));
        "?"
    }

    pub fn push_typed(&mut self, value: Value, param_type: ParamType) -> &'static str {
        self.entries
            .push((ParamKey::Positional, Param::typed(value, param_type)));
        "?"
    }

    /// Insert or replace a named parameter; a leading `:` is optional
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.set_param(name, Param::new(value.into()));
    }

    pub fn set_param(&mut self, name: &str, param: Param) {
        let name = normalize_name(name);
        if let Some(slot) = self
            .entries
            .iter_mut()
            .find(|(key, _)| matches!(key, ParamKey::Named(n) if *n == name))
        {
            slot.1 = param;
        } else {
            self.entries.push((ParamKey::Named(name), param));
        }
    }

    /// Append positional entries and merge named ones
    pub fn extend(&mut self, other: Params) {
        for (key, param) in other.entries {
            match key {
                ParamKey::Positional => self.entries.push((ParamKey::Positional, param)),
                ParamKey::Named(name) => self.set_param(&name, param),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(ParamKey, Param)> {
        self.entries.iter()
    }

    /// Positional values in bind order
    pub fn positional(&self) -> impl Iterator<Item = &Param> {
        self.entries
            .iter()
            .filter(|(key, _)| *key == ParamKey::Positional)
            .map(|(_, p)| p)
    }

    pub fn named(&self, name: &str) -> Option<&Param> {
        let name = normalize_name(name);
        self.entries.iter().find_map(|(key, p)| match key {
            ParamKey::Named(n) if *n == name => Some(p),
            _ => None,
        })
    }

    /// Every value in bind order, ignoring keys
    pub fn values(&self) -> Vec<Value> {
        self.entries.iter().map(|(_, p)| p.value.clone()).collect()
    }
}

impl Params {
    /// Resolve `?` and `:name` placeholders in `sql` into bind order.
    ///
    /// Tokens inside quoted strings or identifiers are left alone, as are
    /// `::` casts and names with no bound value. Quotes close on a doubled
    /// quote; a backslash escapes the next character only when
    /// `backslash_escapes` is set. `emit` receives each value and its 1-based
    /// position and returns the text to put in its place.
    pub fn bind_sql<F>(
        &self,
        sql: &str,
        backslash_escapes: bool,
        mut emit: F,
    ) -> Result<(String, Vec<Param>)>
    where
        F: FnMut(&Param, usize) -> String,
    {
        let mut positional = self.positional();
        let mut out = String::with_capacity(sql.len());
        let mut bound: Vec<Param> = Vec::new();
        let chars: Vec<char> = sql.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            match c {
                '\'' | '"' | '`' => {
                    out.push(c);
                    i += 1;
                    while i < chars.len() {
                        let d = chars[i];
                        out.push(d);
                        i += 1;
                        if backslash_escapes && d == '\\' && i < chars.len() {
                            out.push(chars[i]);
                            i += 1;
                        } else if d == c {
                            if i < chars.len() && chars[i] == c {
                                out.push(c);
                                i += 1;
                            } else {
                                break;
                            }
                        }
                    }
                }
                '?' => {
                    let param = positional.next().ok_or_else(|| {
                        Error::invalid_argument(format!(
                            "Not enough parameters bound for SQL: {}",
                            sql
                        ))
                    })?;
                    bound.push(param.clone());
                    out.push_str(&emit(param, bound.len()));
                    i += 1;
                }
                ':' if chars.get(i + 1) == Some(&':') => {
                    out.push_str("::");
                    i += 2;
                }
                ':' if chars
                    .get(i + 1)
                    .map_or(false, |n| n.is_ascii_alphabetic() || *n == '_') =>
                {
                    let start = i + 1;
                    let mut end = start;
                    while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
                        end += 1;
                    }
                    let name: String = chars[start..end].iter().collect();
                    match self.named(&name) {
                        Some(param) => {
                            bound.push(param.clone());
                            out.push_str(&emit(param, bound.len()));
                        }
                        None => {
                            out.push(':');
                            out.push_str(&name);
                        }
                    }
                    i = end;
                }
                _ => {
                    out.push(c);
                    i += 1;
                }
            }
        }
        Ok((out, bound))
    }
}

impl<T: Into<Value>> FromIterator<T> for Params {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut params = Params::new();
        for v in iter {
            params.push(v);
        }
        params
    }
}

fn normalize_name(name: &str) -> String {
    name.strip_prefix(':').unwrap_or(name).to_string()
}
