//! Structural request validation.
//!
//! Every external JSON body is checked against a declared [`Shape`] before
//! any handler logic runs. The check is a strict whitelist: a body carrying
//! any key beyond the declared required+optional set is rejected, which
//! closes off parameter-pollution and type-confusion inputs at the boundary.

use std::collections::BTreeMap;

use serde_json::Value;

/// Declared type of a single field.
#[derive(Debug, Clone)]
pub enum FieldType {
    String,
    Number,
    Boolean,
    /// String of hex characters (`0-9a-f`), any length.
    Hex,
    /// Hex string of exactly 64 characters — an X25519 public key.
    Key,
    /// Hex string of exactly 64 characters — a SHA3-256 digest.
    Hash,
    /// Nested object validated recursively.
    Object(Shape),
    /// Homogeneous array; every element must match the inner type.
    Array(Box<FieldType>),
}

/// Required/optional field maps for one object level.
#[derive(Debug, Clone, Default)]
pub struct Shape {
    required: BTreeMap<&'static str, FieldType>,
    optional: BTreeMap<&'static str, FieldType>,
}

impl Shape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: &'static str, ty: FieldType) -> Self {
        self.required.insert(name, ty);
        self
    }

    pub fn optional(mut self, name: &'static str, ty: FieldType) -> Self {
        self.optional.insert(name, ty);
        self
    }
}

/// Returns true if `value` does NOT match `shape`.
///
/// A value is malformed when it is not an object, a required field is
/// absent or mistyped, an optional field is present but mistyped, or any
/// key outside the declared set is present.
pub fn is_malformed(value: &Value, shape: &Shape) -> bool {
    let Some(map) = value.as_object() else {
        return true;
    };

    let mut matched = 0usize;
    for (name, ty) in &shape.required {
        match map.get(*name) {
            Some(v) if matches_type(v, ty) => matched += 1,
            _ => return true,
        }
    }
    for (name, ty) in &shape.optional {
        if let Some(v) = map.get(*name) {
            if !matches_type(v, ty) {
                return true;
            }
            matched += 1;
        }
    }

    // Any key not counted above is undeclared.
    matched != map.len()
}

fn matches_type(value: &Value, ty: &FieldType) -> bool {
    match ty {
        FieldType::String => value.is_string(),
        FieldType::Number => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Hex => value.as_str().is_some_and(is_hex),
        FieldType::Key | FieldType::Hash => value
            .as_str()
            .is_some_and(|s| s.len() == 64 && is_hex(s)),
        FieldType::Object(shape) => !is_malformed(value, shape),
        FieldType::Array(elem) => value
            .as_array()
            .is_some_and(|items| items.iter().all(|item| matches_type(item, elem))),
    }
}

fn is_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
