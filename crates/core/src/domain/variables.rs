//! Insertion-ordered variable map.
//!
//! [`Variables`] carries the environment fragments that travel with a
//! job: descriptor `inputs`, agent-injected values, and the captured
//! output of the env dump. Captured variables must be reported in the
//! order the dump produced them, so the map is backed by a `Vec`
//! rather than a hash map. On the wire it serialises as a plain JSON
//! object.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Ordered `name -> value` mapping preserving insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variables {
    entries: Vec<(String, String)>,
}

impl Variables {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a value by name.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Insert or update an entry.
    ///
    /// Updating an existing name keeps its original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Merge `other` into `self`; entries from `other` win on conflict.
    pub fn merge(&mut self, other: &Variables) {
        for (k, v) in other.iter() {
            self.insert(k, v);
        }
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Render as the conventional `KEY=VALUE` sequence consumed by
    /// shells and container runtimes.
    pub fn to_env_strings(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect()
    }

    /// Expand `${NAME}` references in `raw`.
    ///
    /// Names resolve against this map first, then against the process
    /// environment; unresolved references expand to the empty string.
    /// Only the braced form is recognised; a bare `$NAME` passes
    /// through untouched.
    pub fn expand(&self, raw: &str) -> String {
        expand_with(raw, |name| {
            self.get(name)
                .map(str::to_owned)
                .or_else(|| std::env::var(name).ok())
        })
    }
}

/// Expand `${NAME}` references against the process environment only.
pub fn expand_env(raw: &str) -> String {
    expand_with(raw, |name| std::env::var(name).ok())
}

/// Shared `${NAME}` walker behind [`Variables::expand`] and
/// [`expand_env`].
fn expand_with(raw: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                if let Some(value) = lookup(name) {
                    out.push_str(&value);
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                // Unterminated reference, keep the remainder verbatim.
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }

    out.push_str(rest);
    out
}

impl FromIterator<(String, String)> for Variables {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut vars = Variables::new();
        for (k, v) in iter {
            vars.insert(k, v);
        }
        vars
    }
}

impl<'a> IntoIterator for &'a Variables {
    type Item = (&'a String, &'a String);
    type IntoIter = std::iter::Map<
        std::slice::Iter<'a, (String, String)>,
        fn(&'a (String, String)) -> (&'a String, &'a String),
    >;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter().map(|(k, v)| (k, v))
    }
}

impl Serialize for Variables {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Variables {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct VariablesVisitor;

        impl<'de> Visitor<'de> for VariablesVisitor {
            type Value = Variables;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of string to string")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut vars = Variables::new();
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    vars.insert(k, v);
                }
                Ok(vars)
            }
        }

        deserializer.deserialize_map(VariablesVisitor)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
