// SPDX-License-Identifier: MIT

//! The opaque schema-validation collaborator (spec §1, §6): Durably treats
//! input/output validation as an external concern and only depends on this
//! trait's shape.

use serde_json::Value;

/// `validate(x) -> {ok: true, value} | {ok: false, error}` from spec §6,
/// expressed as a `Result`.
pub trait Validator: Send + Sync {
    fn validate(&self, value: Value) -> Result<Value, String>;
}

/// Default validator used when a Job registers no `output_validator`
/// (spec §6 says the output validator is optional) and as a convenient
/// stand-in in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopValidator;

impl Validator for NoopValidator {
    fn validate(&self, value: Value) -> Result<Value, String> {
        Ok(value)
    }
}
