//! Property paths into entry payloads

use coordspace_common::{Entry, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Dotted path addressing a property in an entry's map payload
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PropertyPath(Vec<String>);

impl PropertyPath {
    /// Build from a dotted string (`"price.amount"`)
    #[must_use]
    pub fn parse(dotted: &str) -> Self {
        Self(
            dotted
                .split('.')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    #[must_use]
    pub const fn from_segments(segments: Vec<String>) -> Self {
        Self(segments)
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Extract the property from an entry; a missing property reads as `Null`
    #[must_use]
    pub fn extract(&self, entry: &Entry) -> Value {
        entry.property(&self.0).cloned().unwrap_or(Value::Null)
    }
}

impl From<&str> for PropertyPath {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_extract() {
        let path = PropertyPath::parse("price.amount");
        assert_eq!(path.segments(), ["price", "amount"]);
        assert_eq!(path.to_string(), "price.amount");

        let entry = Entry::new(
            "ticket",
            Value::map([("price", Value::map([("amount", 40)]))]),
        );
        assert_eq!(path.extract(&entry), Value::Int(40));
        assert_eq!(PropertyPath::parse("seat").extract(&entry), Value::Null);
    }
}
