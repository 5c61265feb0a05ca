use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ValueError;

/// A value carried on a node slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    File(Utf8PathBuf),
    List(Vec<Value>),
    /// Ordered string pairs, e.g. substitution rules.
    Pairs(Vec<(String, String)>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::File(_) => "file",
            Value::List(_) => "list",
            Value::Pairs(_) => "pairs",
        }
    }

    pub fn as_file(&self) -> Option<&Utf8Path> {
        match self {
            Value::File(path) => Some(path),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Collects every file path in this value, descending into lists.
    pub fn files(&self) -> Vec<&Utf8Path> {
        match self {
            Value::File(path) => vec![path.as_path()],
            Value::List(items) => items.iter().flat_map(Value::files).collect(),
            _ => Vec::new(),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::Int(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Utf8PathBuf> for Value {
    fn from(value: Utf8PathBuf) -> Self {
        Value::File(value)
    }
}

impl From<&Utf8Path> for Value {
    fn from(value: &Utf8Path) -> Self {
        Value::File(value.to_path_buf())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::List(value.into_iter().map(Into::into).collect())
    }
}

/// Named slot values of a node, ordered by slot name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Values(BTreeMap<String, Value>);

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, slot: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(slot, value);
        self
    }

    pub fn set(&mut self, slot: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(slot.into(), value.into());
    }

    pub fn get(&self, slot: &str) -> Option<&Value> {
        self.0.get(slot)
    }

    pub fn contains(&self, slot: &str) -> bool {
        self.0.contains_key(slot)
    }

    /// Overlays `other` on top of `self`.
    pub fn merge(&mut self, other: Values) {
        self.0.extend(other.0);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn require(&self, slot: &str) -> Result<&Value, ValueError> {
        self.0
            .get(slot)
            .ok_or_else(|| ValueError::Missing(slot.to_string()))
    }

    fn mismatch(slot: &str, expected: &'static str, found: &Value) -> ValueError {
        ValueError::Type {
            slot: slot.to_string(),
            expected,
            found: found.kind(),
        }
    }

    pub fn file(&self, slot: &str) -> Result<&Utf8Path, ValueError> {
        let value = self.require(slot)?;
        match value {
            Value::File(path) => Ok(path),
            // single-element lists come out of globbing
            Value::List(items) if items.len() == 1 => items[0]
                .as_file()
                .ok_or_else(|| Self::mismatch(slot, "file", value)),
            other => Err(Self::mismatch(slot, "file", other)),
        }
    }

    /// One or more files, a single file counts as a list of one.
    pub fn files(&self, slot: &str) -> Result<Vec<&Utf8Path>, ValueError> {
        match self.require(slot)? {
            value @ (Value::File(_) | Value::List(_)) => {
                let files = value.files();
                if let Value::List(items) = value
                    && files.len() != items.len()
                {
                    return Err(Self::mismatch(slot, "list of files", value));
                }
                Ok(files)
            }
            other => Err(Self::mismatch(slot, "list of files", other)),
        }
    }

    pub fn int(&self, slot: &str) -> Result<i64, ValueError> {
        match self.require(slot)? {
            Value::Int(value) => Ok(*value),
            other => Err(Self::mismatch(slot, "int", other)),
        }
    }

    /// Floats accept integer values too.
    pub fn float(&self, slot: &str) -> Result<f64, ValueError> {
        match self.require(slot)? {
            Value::Float(value) => Ok(*value),
            Value::Int(value) => Ok(*value as f64),
            other => Err(Self::mismatch(slot, "float", other)),
        }
    }

    pub fn bool(&self, slot: &str) -> Result<bool, ValueError> {
        match self.require(slot)? {
            Value::Bool(value) => Ok(*value),
            other => Err(Self::mismatch(slot, "bool", other)),
        }
    }

    pub fn text(&self, slot: &str) -> Result<&str, ValueError> {
        match self.require(slot)? {
            Value::Text(value) => Ok(value),
            other => Err(Self::mismatch(slot, "text", other)),
        }
    }

    pub fn pairs(&self, slot: &str) -> Result<&[(String, String)], ValueError> {
        match self.require(slot)? {
            Value::Pairs(value) => Ok(value),
            other => Err(Self::mismatch(slot, "pairs", other)),
        }
    }

    /// Like [`Values::file`], `None` when the slot is unset.
    pub fn file_opt(&self, slot: &str) -> Result<Option<&Utf8Path>, ValueError> {
        self.optional(slot, Self::file)
    }

    pub fn int_opt(&self, slot: &str) -> Result<Option<i64>, ValueError> {
        self.optional(slot, Self::int)
    }

    pub fn float_opt(&self, slot: &str) -> Result<Option<f64>, ValueError> {
        self.optional(slot, Self::float)
    }

    pub fn bool_opt(&self, slot: &str) -> Result<Option<bool>, ValueError> {
        self.optional(slot, Self::bool)
    }

    pub fn text_opt(&self, slot: &str) -> Result<Option<&str>, ValueError> {
        self.optional(slot, Self::text)
    }

    fn optional<'a, T>(
        &'a self,
        slot: &str,
        get: impl FnOnce(&'a Self, &str) -> Result<T, ValueError>,
    ) -> Result<Option<T>, ValueError> {
        if self.contains(slot) {
            get(self, slot).map(Some)
        } else {
            Ok(None)
        }
    }
}

impl FromIterator<(String, Value)> for Values {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Values {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_access() {
        let values = Values::new()
            .with("in_file", Utf8PathBuf::from("rest.nii.gz"))
            .with("begin_index", 6i64)
            .with("standardize", true);

        assert_eq!(values.file("in_file").unwrap(), "rest.nii.gz");
        assert_eq!(values.int("begin_index").unwrap(), 6);
        assert_eq!(values.float("begin_index").unwrap(), 6.0);
        assert!(values.bool("standardize").unwrap());
        assert_eq!(values.int_opt("end_index").unwrap(), None);

        assert_eq!(
            values.int("in_file"),
            Err(ValueError::Type {
                slot: "in_file".into(),
                expected: "int",
                found: "file",
            })
        );
        assert_eq!(values.text("x"), Err(ValueError::Missing("x".into())));
    }

    #[test]
    fn test_files_accepts_single() {
        let values = Values::new()
            .with("one", Utf8PathBuf::from("a.nii"))
            .with("many", vec![Utf8PathBuf::from("a.nii"), Utf8PathBuf::from("b.nii")])
            .with("mixed", Value::List(vec![Value::Int(1)]));

        assert_eq!(values.files("one").unwrap().len(), 1);
        assert_eq!(values.files("many").unwrap().len(), 2);
        assert_eq!(values.file("many").ok(), None);
        assert!(values.files("mixed").is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let values = Values::new()
            .with("rules", Value::Pairs(vec![("a".into(), "b".into())]))
            .with("ratio", 0.5);
        let json = serde_json::to_string(&values).unwrap();
        let back: Values = serde_json::from_str(&json).unwrap();
        assert_eq!(back, values);
    }
}
