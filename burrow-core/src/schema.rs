//! Table metadata used by the query builder, and the per-connection cache
//! holding it.

use crate::error::{Error, Result};
use crate::expression::Operand;
use crate::value::Value;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Bumped whenever the cached layout changes
pub const SCHEMA_CACHE_VERSION: u32 = 1;

/// Abstract column types understood by `QueryBuilder::column_type`
pub mod types {
    pub const PK: &str = "pk";
    pub const UPK: &str = "upk";
    pub const BIGPK: &str = "bigpk";
    pub const UBIGPK: &str = "ubigpk";
    pub const CHAR: &str = "char";
    pub const STRING: &str = "string";
    pub const TEXT: &str = "text";
    pub const TINYINT: &str = "tinyint";
    pub const SMALLINT: &str = "smallint";
    pub const INTEGER: &str = "integer";
    pub const BIGINT: &str = "bigint";
    pub const FLOAT: &str = "float";
    pub const DOUBLE: &str = "double";
    pub const DECIMAL: &str = "decimal";
    pub const DATETIME: &str = "datetime";
    pub const TIMESTAMP: &str = "timestamp";
    pub const TIME: &str = "time";
    pub const DATE: &str = "date";
    pub const BINARY: &str = "binary";
    pub const BOOLEAN: &str = "boolean";
    pub const MONEY: &str = "money";
    pub const JSON: &str = "json";
}

/// Native representation a column's values are coerced to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Integer,
    Boolean,
    Double,
    #[default]
    String,
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnSchema {
    pub name: String,
    pub allow_null: bool,
    /// Abstract type, one of [`types`]
    #[serde(rename = "type")]
    pub column_type: String,
    pub kind: ValueKind,
    pub db_type: String,
    pub default_value: Option<Value>,
    pub enum_values: Vec<String>,
    pub size: Option<u32>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    pub is_primary_key: bool,
    pub auto_increment: bool,
    pub unsigned: bool,
    pub comment: String,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, column_type: &str, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            column_type: column_type.to_string(),
            kind,
            allow_null: true,
            ..Default::default()
        }
    }

    /// Coerce a value about to be written toward the column's type
    pub fn db_typecast(&self, value: Operand) -> Result<Operand> {
        let value = match value {
            Operand::Value(v) => v,
            other => return Ok(other),
        };
        if matches!(&value, Value::String(s) if s.is_empty())
            && ![types::TEXT, types::STRING, types::BINARY, types::CHAR]
                .contains(&self.column_type.as_str())
        {
            return Ok(Operand::Value(Value::Null));
        }
        let cast = match (self.kind, value) {
            (_, Value::Null) => Value::Null,
            (ValueKind::String, v @ Value::String(_)) => v,
            (ValueKind::String, Value::Array(_)) | (ValueKind::String, Value::Json(_)) => {
                return Err(Error::invalid_argument(format!(
                    "{} can not convert to string",
                    self.name
                )))
            }
            (ValueKind::String, v @ Value::Bytes(_)) => v,
            (ValueKind::String, v) => Value::String(v.to_plain_string()),
            (ValueKind::Integer, v @ (Value::I32(_) | Value::I64(_))) => v,
            (ValueKind::Integer, v) => Value::I64(v.as_i64().unwrap_or(0)),
            (ValueKind::Boolean, Value::String(s)) => {
                Value::Bool(!(s.is_empty() || s == "0" || s == "\0"))
            }
            (ValueKind::Boolean, v) => Value::Bool(v.as_bool().unwrap_or(false)),
            (ValueKind::Double, v @ (Value::F32(_) | Value::F64(_))) => v,
            (ValueKind::Double, v) => Value::F64(v.as_f64().unwrap_or(0.0)),
            (ValueKind::Other, v) => v,
        };
        Ok(Operand::Value(cast))
    }
}

/// Named set of columns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Constraint {
    pub name: Option<String>,
    pub column_names: Vec<String>,
}

impl Constraint {
    pub fn new(name: Option<&str>, columns: &[&str]) -> Self {
        Self {
            name: name.map(str::to_string),
            column_names: columns.iter().map(|c| c.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConstraint {
    pub name: Option<String>,
    pub column_names: Vec<String>,
    pub is_unique: bool,
    pub is_primary: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForeignKeyConstraint {
    pub name: Option<String>,
    pub column_names: Vec<String>,
    pub foreign_schema_name: Option<String>,
    pub foreign_table_name: String,
    pub foreign_column_names: Vec<String>,
    pub on_update: Option<String>,
    pub on_delete: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConstraint {
    pub name: Option<String>,
    pub column_names: Vec<String>,
    pub expression: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConstraints {
    pub primary_key: Option<Constraint>,
    pub indexes: Vec<IndexConstraint>,
    pub uniques: Vec<Constraint>,
    pub foreign_keys: Vec<ForeignKeyConstraint>,
    pub checks: Vec<CheckConstraint>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableSchema {
    pub schema_name: Option<String>,
    pub name: String,
    pub full_name: String,
    pub primary_key: Vec<String>,
    pub sequence_name: Option<String>,
    pub foreign_keys: Vec<ForeignKeyConstraint>,
    /// In table order
    pub columns: Vec<ColumnSchema>,
    pub constraints: TableConstraints,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            full_name: name.clone(),
            name,
            ..Default::default()
        }
    }

    pub fn with_column(mut self, column: ColumnSchema) -> Self {
        if column.is_primary_key {
            self.primary_key.push(column.name.clone());
        }
        self.columns.push(column);
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Per-connection table metadata cache.
///
/// Entries are tagged with [`SCHEMA_CACHE_VERSION`]; tables on the exclusion
/// list are never stored.
#[derive(Debug, Default)]
pub struct SchemaCache {
    enabled: bool,
    exclude: Vec<String>,
    tables: RwLock<HashMap<String, (u32, Arc<TableSchema>)>>,
}

impl SchemaCache {
    pub fn new(enabled: bool, exclude: Vec<String>) -> Self {
        Self {
            enabled,
            exclude,
            tables: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, name: &str) -> Option<Arc<TableSchema>> {
        let tables = self.tables.read();
        match tables.get(name) {
            Some((version, schema)) if *version == SCHEMA_CACHE_VERSION => Some(schema.clone()),
            _ => None,
        }
    }

    pub fn insert(&self, name: &str, schema: Arc<TableSchema>) {
        if !self.enabled || self.exclude.iter().any(|t| t == name) {
            return;
        }
        self.tables
            .write()
            .insert(name.to_string(), (SCHEMA_CACHE_VERSION, schema));
    }

    /// Drop a single table, e.g. after DDL touched it
    pub fn refresh_table(&self, name: &str) {
        self.tables.write().remove(name);
    }

    pub fn clear(&self) {
        self.tables.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(kind: ValueKind, column_type: &str) -> ColumnSchema {
        ColumnSchema::new("c", column_type, kind)
    }

    fn cast(col: &ColumnSchema, v: impl Into<Value>) -> Value {
        match col.db_typecast(Operand::Value(v.into())).unwrap() {
            Operand::Value(v) => v,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_empty_string_becomes_null_for_non_text() {
        assert_eq!(cast(&column(ValueKind::Integer, types::INTEGER), ""), Value::Null);
        assert_eq!(
            cast(&column(ValueKind::String, types::STRING), ""),
            Value::String(String::new())
        );
    }

    #[test]
    fn test_typecast_by_kind() {
        assert_eq!(cast(&column(ValueKind::Integer, types::INTEGER), "42"), Value::I64(42));
        assert_eq!(cast(&column(ValueKind::Integer, types::INTEGER), 7), Value::I32(7));
        assert_eq!(cast(&column(ValueKind::Boolean, types::BOOLEAN), "0"), Value::Bool(false));
        assert_eq!(cast(&column(ValueKind::Boolean, types::BOOLEAN), 2), Value::Bool(true));
        assert_eq!(cast(&column(ValueKind::Double, types::FLOAT), "1.5"), Value::F64(1.5));
        assert_eq!(cast(&column(ValueKind::String, types::STRING), 1.5), Value::from("1.5"));
    }

    #[test]
    fn test_typecast_rejects_array_for_string() {
        let err = column(ValueKind::String, types::STRING)
            .db_typecast(Operand::Value(Value::from(vec![1, 2])))
            .unwrap_err();
        assert!(err.to_string().contains("c can not convert to string"));
    }

    #[test]
    fn test_schema_cache_exclusions() {
        let cache = SchemaCache::new(true, vec!["skip".to_string()]);
        cache.insert("user", Arc::new(TableSchema::new("user")));
        cache.insert("skip", Arc::new(TableSchema::new("skip")));
        assert!(cache.get("user").is_some());
        assert!(cache.get("skip").is_none());
        cache.refresh_table("user");
        assert!(cache.get("user").is_none());

        let disabled = SchemaCache::new(false, Vec::new());
        disabled.insert("user", Arc::new(TableSchema::new("user")));
        assert!(disabled.get("user").is_none());
    }

    #[test]
    fn test_table_schema_columns() {
        let mut pk = ColumnSchema::new("id", types::PK, ValueKind::Integer);
        pk.is_primary_key = true;
        let table = TableSchema::new("user")
            .with_column(pk)
            .with_column(ColumnSchema::new("name", types::STRING, ValueKind::String));
        assert_eq!(table.primary_key, vec!["id"]);
        assert_eq!(table.column_names(), vec!["id", "name"]);
        assert!(table.column("name").is_some());
    }
}
