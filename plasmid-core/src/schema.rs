// SPDX-License-Identifier: MIT OR Apache-2.0

//! Validation of arbitrary JSON values against arbitrary JSON schemas.
use serde_json::{Map, Value};

/// Outcome of validating a value against a schema.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Schema which accepts any value.
pub fn accept_anything() -> Value {
    Value::Object(Map::new())
}

/// Validate `value` against `schema`.
///
/// A schema which can't be compiled never accepts anything, its compile error is reported as
/// validation error.
pub fn validate(value: &Value, schema: &Value) -> Validation {
    let validator = match jsonschema::validator_for(schema) {
        Ok(validator) => validator,
        Err(err) => {
            return Validation {
                valid: false,
                errors: vec![format!("invalid schema: {err}")],
            };
        }
    };

    let errors: Vec<String> = validator
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();

    Validation {
        valid: errors.is_empty(),
        errors,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{accept_anything, validate};

    #[test]
    fn accept_anything_schema() {
        for value in [json!({ "type": "FROM_BOB" }), json!(1), json!(null), json!([])] {
            assert!(validate(&value, &accept_anything()).is_valid());
        }
    }

    #[test]
    fn report_errors() {
        let schema = json!({
            "type": "object",
            "required": ["type", "amount"],
            "properties": {
                "type": { "const": "PAYMENT" },
                "amount": { "type": "integer", "maximum": 10 }
            }
        });

        assert!(validate(&json!({ "type": "PAYMENT", "amount": 5 }), &schema).valid);

        let result = validate(&json!({ "type": "PAYMENT", "amount": 50 }), &schema);
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 1);

        let result = validate(&json!({ "type": "OTHER" }), &schema);
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn invalid_schema_denies() {
        let result = validate(&json!({}), &json!({ "type": 12 }));
        assert!(!result.valid);
        assert!(result.errors[0].starts_with("invalid schema"));

        assert!(!validate(&json!({}), &json!(null)).valid);
    }
}
