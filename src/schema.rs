//! The schema validation contract (spec.md §6). The core needs
//! `validate(init|req|res, value)`; the concrete schema library
//! (a JSON-schema engine, a derive-based validator, ...) is an external
//! collaborator and stays out of scope. [`PermissiveSchema`] is the null
//! object this crate uses in its own tests and examples.

use crate::error::SchemaError;
use serde_json::Value;

/// Validation mode (spec.md §6): non-strict cleans/defaults/decodes
/// before validating; strict requires an exact match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    Strict,
    NonStrict,
}

pub trait Schema: Send + Sync + 'static {
    /// Validates (and, in non-strict mode, may rewrite) a value against
    /// this schema, returning the value to actually hand to the handler.
    fn validate(&self, value: Value, mode: ValidationMode) -> Result<Value, SchemaError>;
}

/// Accepts any value unchanged. Stands in for "no schema declared" and
/// is what this crate's own test procedures use.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissiveSchema;

impl Schema for PermissiveSchema {
    fn validate(&self, value: Value, _mode: ValidationMode) -> Result<Value, SchemaError> {
        Ok(value)
    }
}

/// A schema that requires the value to be a JSON object containing every
/// named key, rejecting anything else. Enough fidelity for the seed
/// end-to-end tests (spec.md §8) without pulling in a JSON Schema engine.
#[derive(Debug, Clone)]
pub struct RequiredKeysSchema {
    pub keys: Vec<&'static str>,
}

impl RequiredKeysSchema {
    pub fn new(keys: &[&'static str]) -> Self {
        RequiredKeysSchema {
            keys: keys.to_vec(),
        }
    }
}

impl Schema for RequiredKeysSchema {
    fn validate(&self, value: Value, _mode: ValidationMode) -> Result<Value, SchemaError> {
        let obj = value
            .as_object()
            .ok_or_else(|| SchemaError::Invalid("expected a JSON object".into()))?;
        for key in &self.keys {
            if !obj.contains_key(*key) {
                return Err(SchemaError::Invalid(format!("missing required key `{key}`")));
            }
        }
        Ok(value)
    }
}
