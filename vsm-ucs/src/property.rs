//! Typed named parameters carried in the control-server envelope.
//!
//! Telemetry fields, command arguments and device attributes all travel as
//! `(field id, value)` pairs. The value model is schema-agnostic: the
//! semantic of a field id is agreed upon between device driver and server,
//! the runtime only moves values around and diffs them.

use serde::{Deserialize, Serialize};

use vsm::error::{Error, Result};

/// Value of one parameter field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
  /// Present but valueless (telemetry dropout).
  #[default]
  None,
  Bool(bool),
  Int(i64),
  Float(f64),
  String(String),
  /// Index into an enumeration agreed upon out of band.
  Enum(i32),
  Bytes(Vec<u8>),
}

impl Value {
  pub fn kind_name(&self) -> &'static str {
    match self {
      Value::None => "none",
      Value::Bool(_) => "bool",
      Value::Int(_) => "int",
      Value::Float(_) => "float",
      Value::String(_) => "string",
      Value::Enum(_) => "enum",
      Value::Bytes(_) => "bytes",
    }
  }

  fn same_kind(&self, other: &Value) -> bool {
    matches!(self, Value::None)
      || matches!(other, Value::None)
      || std::mem::discriminant(self) == std::mem::discriminant(other)
  }

  pub fn as_int(&self) -> Result<i64> {
    match self {
      Value::Int(v) => Ok(*v),
      Value::Enum(v) => Ok(i64::from(*v)),
      Value::Bool(v) => Ok(i64::from(*v)),
      other => Err(Error::NotConvertible(format!(
        "{} is not an integer",
        other.kind_name()
      ))),
    }
  }

  pub fn as_float(&self) -> Result<f64> {
    match self {
      Value::Float(v) => Ok(*v),
      Value::Int(v) => Ok(*v as f64),
      other => Err(Error::NotConvertible(format!(
        "{} is not a float",
        other.kind_name()
      ))),
    }
  }

  pub fn as_bool(&self) -> Result<bool> {
    match self {
      Value::Bool(v) => Ok(*v),
      other => Err(Error::NotConvertible(format!(
        "{} is not a bool",
        other.kind_name()
      ))),
    }
  }

  pub fn as_str(&self) -> Result<&str> {
    match self {
      Value::String(v) => Ok(v),
      other => Err(Error::NotConvertible(format!(
        "{} is not a string",
        other.kind_name()
      ))),
    }
  }
}

/// Wire form of one field: id plus value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyField {
  pub id: u32,
  pub value: Value,
}

impl PropertyField {
  pub fn new(id: u32, value: Value) -> PropertyField {
    PropertyField { id, value }
  }
}

/// Declared parameter of a device: identity, name, current value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
  pub id: u32,
  pub name: String,
  value: Value,
}

impl Property {
  pub fn new(id: u32, name: impl Into<String>, value: Value) -> Property {
    Property { id, name: name.into(), value }
  }

  pub fn value(&self) -> &Value {
    &self.value
  }

  /// Replaces the value; the kind must stay stable once set (a `None`
  /// dropout is always allowed).
  pub fn set_value(&mut self, value: Value) -> Result<()> {
    if !self.value.same_kind(&value) {
      return Err(Error::NotConvertible(format!(
        "property {} is {}, got {}",
        self.name,
        self.value.kind_name(),
        value.kind_name()
      )));
    }
    self.value = value;
    Ok(())
  }

  pub fn as_field(&self) -> PropertyField {
    PropertyField { id: self.id, value: self.value.clone() }
  }
}

/// Computes the changed-fields-only delta of `next` against `cache`,
/// updating the cache in place.
pub fn diff_fields(
  cache: &mut std::collections::HashMap<u32, Value>,
  next: &[PropertyField],
) -> Vec<PropertyField> {
  let mut changed = Vec::new();
  for field in next {
    let stale = cache
      .get(&field.id)
      .map(|cached| cached != &field.value)
      .unwrap_or(true);
    if stale {
      cache.insert(field.id, field.value.clone());
      changed.push(field.clone());
    }
  }
  changed
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  #[test]
  fn test_conversions() {
    assert_eq!(Value::Int(5).as_int().unwrap(), 5);
    assert_eq!(Value::Enum(2).as_int().unwrap(), 2);
    assert_eq!(Value::Bool(true).as_int().unwrap(), 1);
    assert_eq!(Value::Int(5).as_float().unwrap(), 5.0);
    assert!(Value::String("x".into()).as_int().is_err());
    assert!(Value::Float(1.0).as_bool().is_err());
  }

  #[test]
  fn test_set_value_kind_stability() {
    let mut prop = Property::new(1, "altitude", Value::Float(10.0));
    prop.set_value(Value::Float(11.5)).unwrap();
    assert!(prop.set_value(Value::String("high".into())).is_err());
    // Dropout and recovery are allowed.
    prop.set_value(Value::None).unwrap();
    prop.set_value(Value::Float(12.0)).unwrap();
  }

  #[test]
  fn test_diff_reports_changes_only() {
    let mut cache = HashMap::new();
    let first = vec![
      PropertyField::new(1, Value::Int(10)),
      PropertyField::new(2, Value::Float(1.5)),
    ];
    let changed = diff_fields(&mut cache, &first);
    assert_eq!(changed.len(), 2);

    let second = vec![
      PropertyField::new(1, Value::Int(10)),
      PropertyField::new(2, Value::Float(2.5)),
    ];
    let changed = diff_fields(&mut cache, &second);
    assert_eq!(changed, vec![PropertyField::new(2, Value::Float(2.5))]);

    let changed = diff_fields(&mut cache, &second);
    assert!(changed.is_empty());
  }
}
