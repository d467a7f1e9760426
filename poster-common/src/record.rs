use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A record decoded from a stream payload: a mapping of field name to JSON value.
///
/// The fields we rely on are an `id`, a `deleted` flag and nested entries such as
/// `fixedFields.61.value`. Anything else is passed through to the destination untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DecodedRecord(Map<String, Value>);

impl DecodedRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// The record identifier rendered as a string, if present.
    pub fn id(&self) -> Option<String> {
        match self.0.get("id")? {
            Value::String(s) => Some(s.to_owned()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Whether the record is flagged for deletion. Only a boolean `true` counts.
    pub fn is_deleted(&self) -> bool {
        matches!(self.0.get("deleted"), Some(Value::Bool(true)))
    }

    /// Look up a value by dotted path, e.g. `fixedFields.61.value` or `varFields.0`.
    /// Objects are stepped into by key and arrays by index.
    pub fn field(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.0.get(segments.next()?)?;

        for segment in segments {
            current = match current {
                Value::Object(fields) => fields.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }

        Some(current)
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_owned(), value);
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for DecodedRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}
