//! Field-table value grammar.
//!
//! AMQP field tables are self-describing maps used for peer capabilities,
//! message headers, and per-method argument tables. Each value is tagged
//! with a single type octet:
//!
//! ```text
//! t bool    b i8    B u8    U i16    u u16    I i32    i u32
//! L i64     l i64   f f32   d f64    D decimal
//! s shortstr  S longstr  x binary  T timestamp  V void
//! F nested table  A array
//! ```
//!
//! Keys follow the grammar `^[A-z$#][A-z0-9$#_.]{0,127}$`. Note the
//! literal `A-z` range, which admits `[ \ ] ^ _` and backquote.

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::{AmqpError, Result};

/// A decimal value: `unscaled * 10^-scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decimal {
    pub scale: u8,
    pub unscaled: u32,
}

impl Decimal {
    pub fn new(scale: u8, unscaled: u32) -> Self {
        Self { scale, unscaled }
    }

    /// Convert a non-negative float, packing fractional digits greedily
    /// while the unscaled value still fits in a `u32`.
    pub fn from_f64(value: f64) -> Result<Self> {
        if !value.is_finite() || value < 0.0 {
            return Err(AmqpError::codec(
                "decimal",
                format!("cannot encode {value} as decimal"),
            ));
        }
        if value > u32::MAX as f64 {
            return Err(AmqpError::codec(
                "decimal",
                format!("{value} does not fit in a decimal"),
            ));
        }

        let mut scale: u8 = 0;
        let mut scaled = value;
        while scaled.fract() != 0.0 && scaled * 10.0 <= u32::MAX as f64 && scale < u8::MAX {
            scaled *= 10.0;
            scale += 1;
        }

        Ok(Self {
            scale,
            unscaled: scaled.round() as u32,
        })
    }

    pub fn to_f64(self) -> f64 {
        self.unscaled as f64 / 10f64.powi(self.scale as i32)
    }
}

/// A single typed value in a field table or array.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    Float(f32),
    Double(f64),
    Decimal(Decimal),
    LongString(String),
    Binary(Bytes),
    Timestamp(u64),
    Void,
    Table(FieldTable),
    Array(Vec<FieldValue>),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::LongString(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::LongString(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::I32(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::I64(value)
    }
}

/// A field table: ordered `name -> value` map.
///
/// Iteration order is insertion order so that encoded tables are
/// deterministic (the inner map is a `Vec` of pairs; tables are tiny).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldTable {
    entries: Vec<(String, FieldValue)>,
}

impl FieldTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, validating the key grammar. Replaces an existing
    /// entry with the same key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Result<()> {
        let key = key.into();
        if !is_valid_table_key(&key) {
            return Err(AmqpError::InvalidTableKey(key));
        }
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value.into();
        } else {
            self.entries.push((key, value.into()));
        }
        Ok(())
    }

    /// Insert without key validation; used by the decoder, which accepts
    /// whatever the broker sent.
    pub(crate) fn insert_unchecked(&mut self, key: String, value: FieldValue) {
        self.entries.push((key, value));
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Table-key grammar: `^[A-z$#][A-z0-9$#_.]{0,127}$`.
pub fn is_valid_table_key(key: &str) -> bool {
    let mut chars = key.chars();
    let first = match chars.next() {
        Some(c) => c,
        None => return false,
    };
    if key.len() > 128 {
        return false;
    }

    // The `A-z` range of the source grammar, taken literally.
    let in_a_z = |c: char| ('A'..='z').contains(&c);

    if !(in_a_z(first) || first == '$' || first == '#') {
        return false;
    }
    chars.all(|c| in_a_z(c) || c.is_ascii_digit() || matches!(c, '$' | '#' | '_' | '.'))
}

/// Exchange and queue names: at most 127 bytes of `[a-zA-Z0-9-_.:]`.
/// The empty string is valid (the default exchange).
pub fn assert_name(value: &str, what: &'static str) -> Result<()> {
    if value.len() > 127 {
        return Err(AmqpError::InvalidName(value.to_string(), what));
    }
    let ok = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if !ok {
        return Err(AmqpError::InvalidName(value.to_string(), what));
    }
    Ok(())
}

/// Non-empty string assertion for required arguments.
pub fn assert_not_empty(value: &str, what: &'static str) -> Result<()> {
    if value.is_empty() {
        return Err(AmqpError::EmptyArgument(what));
    }
    Ok(())
}
