//! Result documents assembled from fields that may individually fail to read.
//!
//! Host object models often throw when an optional property is absent. Rather
//! than swallowing those failures, handlers collect fields through
//! [`BestEffort`]: a failed read leaves the field out and records its name.

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt::Display;

/// Key under which the names of unreadable fields are reported.
pub const UNAVAILABLE_KEY: &str = "unavailable";

#[derive(Debug, Default, Clone)]
pub struct BestEffort {
    fields: Map<String, Value>,
    unavailable: Vec<String>,
}

impl BestEffort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always-present field.
    pub fn set(&mut self, name: &str, value: impl Serialize) -> &mut Self {
        self.field(name, || Ok::<_, serde_json::Error>(value))
    }

    /// Read a field; on failure it is omitted and listed as unavailable.
    pub fn field<T, E, F>(&mut self, name: &str, read: F) -> &mut Self
    where
        T: Serialize,
        E: Display,
        F: FnOnce() -> Result<T, E>,
    {
        let value = read()
            .map_err(|err| err.to_string())
            .and_then(|value| serde_json::to_value(value).map_err(|err| err.to_string()));
        match value {
            Ok(value) => {
                self.fields.insert(name.to_string(), value);
            }
            Err(reason) => {
                tracing::debug!(field = name, %reason, "best-effort field unavailable");
                self.unavailable.push(name.to_string());
            }
        }
        self
    }

    /// Like [`field`](Self::field) for reads that signal absence with `None`.
    pub fn optional<T, F>(&mut self, name: &str, read: F) -> &mut Self
    where
        T: Serialize,
        F: FnOnce() -> Option<T>,
    {
        self.field(name, || read().ok_or("not present"))
    }

    pub fn unavailable(&self) -> &[String] {
        &self.unavailable
    }

    pub fn is_complete(&self) -> bool {
        self.unavailable.is_empty()
    }

    /// The collected object; `unavailable` is added only when something failed.
    pub fn into_value(self) -> Value {
        let mut fields = self.fields;
        if !self.unavailable.is_empty() {
            fields.insert(
                UNAVAILABLE_KEY.to_string(),
                Value::from(self.unavailable),
            );
        }
        Value::Object(fields)
    }
}
