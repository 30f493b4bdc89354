//! Rename decisions produced by the oracle.

use indexmap::IndexMap;
use serde_json::Value;

/// The accumulated `original name -> chosen name` dictionary, carried
/// forward across scheduling rounds as advisory prompt context only. Names
/// are only ever added, never removed.
pub type KnownNames = IndexMap<String, String>;

/// The oracle's decision for one function.
///
/// All fields are optional; an empty mapping is the recorded outcome for
/// functions whose batch failed, so they still count as processed.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RenameMapping {
    /// Suggested name for the function itself, applied at the scope
    /// containing its declaration.
    #[serde(rename = "functionName", default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    /// Free-form description, emitted as a leading block comment when
    /// description emission is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// `old identifier -> new identifier`, applied only within the
    /// function's own lexical scope.
    #[serde(default)]
    pub renames: IndexMap<String, String>,
}

impl RenameMapping {
    /// Whether the mapping carries no decisions at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.function_name.is_none() && self.description.is_none() && self.renames.is_empty()
    }

    /// Field-by-field validation of one oracle response entry.
    ///
    /// `renames` must map strings to strings; `functionName` and
    /// `description`, if present, must be strings; unknown fields are
    /// ignored. Anything else makes the whole entry malformed, and the
    /// caller discards it with a warning.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let Value::Object(entry) = value else {
            return Err(format!("entry is not an object: {value}"));
        };
        let mut mapping = Self::default();
        if let Some(name) = entry.get("functionName") {
            match name {
                Value::String(s) => mapping.function_name = Some(s.clone()),
                Value::Null => {}
                other => return Err(format!("functionName is not a string: {other}")),
            }
        }
        if let Some(description) = entry.get("description") {
            match description {
                Value::String(s) => mapping.description = Some(s.clone()),
                Value::Null => {}
                other => return Err(format!("description is not a string: {other}")),
            }
        }
        if let Some(renames) = entry.get("renames") {
            match renames {
                Value::Object(pairs) => {
                    for (old, new) in pairs {
                        match new {
                            Value::String(new) => {
                                mapping.renames.insert(old.clone(), new.clone());
                            }
                            other => {
                                return Err(format!("rename target for {old:?} is not a string: {other}"));
                            }
                        }
                    }
                }
                Value::Null => {}
                other => return Err(format!("renames is not an object: {other}")),
            }
        }
        Ok(mapping)
    }
}
