//! Tool argument holders that approval edits can be applied to.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArgsError {
    #[error("edited arguments failed validation: {0}")]
    Invalid(#[from] serde_json::Error),

    #[error("edited arguments match no known field")]
    NoMatchingFields,

    #[error("arguments do not serialize to an object")]
    NotAnObject,
}

/// Arguments of one tool call.
pub trait ToolArgs: Send {
    fn to_value(&self) -> Value;

    /// Merge `edits` over the current arguments. On error the arguments are
    /// left untouched.
    fn apply_edits(&mut self, edits: &Map<String, Value>) -> Result<(), ArgsError>;
}

/// Untyped arguments. Edits may only replace keys that already exist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JsonArgs(pub Map<String, Value>);

impl JsonArgs {
    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl ToolArgs for JsonArgs {
    fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    fn apply_edits(&mut self, edits: &Map<String, Value>) -> Result<(), ArgsError> {
        if edits.is_empty() {
            return Ok(());
        }
        let known: Vec<(&String, &Value)> = edits
            .iter()
            .filter(|(key, _)| self.0.contains_key(*key))
            .collect();
        if known.is_empty() {
            return Err(ArgsError::NoMatchingFields);
        }
        for (key, value) in known {
            self.0.insert(key.clone(), value.clone());
        }
        Ok(())
    }
}

/// Schema-backed arguments. Edits are merged and the result re-validated
/// by deserializing into `T`.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedArgs<T>(pub T);

impl<T> ToolArgs for TypedArgs<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    fn to_value(&self) -> Value {
        serde_json::to_value(&self.0).unwrap_or(Value::Null)
    }

    fn apply_edits(&mut self, edits: &Map<String, Value>) -> Result<(), ArgsError> {
        if edits.is_empty() {
            return Ok(());
        }
        let Value::Object(mut merged) = serde_json::to_value(&self.0)? else {
            return Err(ArgsError::NotAnObject);
        };
        for (key, value) in edits {
            merged.insert(key.clone(), value.clone());
        }
        self.0 = serde_json::from_value(Value::Object(merged))?;
        Ok(())
    }
}
