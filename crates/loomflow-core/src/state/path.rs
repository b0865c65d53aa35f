//! Typed state paths.
//!
//! `"state.items[0].name"` parses into a [`StatePath`] whose scope is checked
//! at parse time; unknown scopes never reach the store.

use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};

use super::StateError;
use crate::suggest::closest_match;

/// The tier a path addresses. `raw` is accepted as an alias of `inputs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Inputs,
    State,
    Computed,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Inputs => "inputs",
            Scope::State => "state",
            Scope::Computed => "computed",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Key(String),
    Index(usize),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Key(k) => write!(f, ".{k}"),
            Segment::Index(i) => write!(f, "[{i}]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatePath {
    scope: Scope,
    segments: Vec<Segment>,
}

impl StatePath {
    pub fn parse(path: &str) -> Result<Self, StateError> {
        let invalid = |reason: &str| StateError::InvalidPath {
            path: path.to_string(),
            reason: reason.to_string(),
            suggestion: None,
        };

        let trimmed = path.trim();
        let (head, mut rest) = match trimmed.find(['.', '[']) {
            Some(i) => (&trimmed[..i], &trimmed[i..]),
            None => (trimmed, ""),
        };
        let scope = match head {
            "inputs" | "raw" => Scope::Inputs,
            "state" => Scope::State,
            "computed" => Scope::Computed,
            "" => return Err(invalid("path is empty")),
            other => {
                return Err(StateError::InvalidPath {
                    path: path.to_string(),
                    reason: format!("unknown scope '{other}', expected state, computed or inputs"),
                    suggestion: closest_match(other, ["state", "computed", "inputs", "raw"]),
                });
            }
        };

        let mut segments = Vec::new();
        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('.') {
                let end = after.find(['.', '[']).unwrap_or(after.len());
                let key = &after[..end];
                if key.is_empty() {
                    return Err(invalid("empty key segment"));
                }
                segments.push(Segment::Key(key.to_string()));
                rest = &after[end..];
            } else if let Some(after) = rest.strip_prefix('[') {
                let end = after.find(']').ok_or_else(|| invalid("unclosed '['"))?;
                let inner = after[..end].trim().trim_matches(|c| c == '\'' || c == '"');
                let segment = match inner.parse::<usize>() {
                    Ok(i) => Segment::Index(i),
                    Err(_) if !inner.is_empty() => Segment::Key(inner.to_string()),
                    Err(_) => return Err(invalid("empty index")),
                };
                segments.push(segment);
                rest = &after[end + 1..];
            } else {
                return Err(invalid("expected '.' or '['"));
            }
        }
        Ok(Self { scope, segments })
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// First key below the scope, used for lock and dependency indexing.
    pub fn root_key(&self) -> Option<&str> {
        match self.segments.first() {
            Some(Segment::Key(k)) => Some(k),
            _ => None,
        }
    }

    /// Whether one path is a prefix of the other (a write to either touches both).
    pub fn overlaps(&self, other: &StatePath) -> bool {
        self.scope == other.scope
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(a, b)| segment_eq(a, b))
    }

    /// Read this path's value from a tier map.
    pub fn lookup<'a>(&self, tier: &'a Map<String, Value>) -> Option<&'a Value> {
        let (first, rest) = self.segments.split_first()?;
        let mut current = match first {
            Segment::Key(k) => tier.get(k)?,
            Segment::Index(i) => tier.get(&i.to_string())?,
        };
        for segment in rest {
            current = step_into(current, segment)?;
        }
        Some(current)
    }

    /// Mutable slot for this path, creating intermediate objects as needed.
    pub fn slot<'a>(&self, tier: &'a mut Map<String, Value>) -> Result<&'a mut Value, StateError> {
        let (first, rest) = self.segments.split_first().ok_or_else(|| StateError::InvalidPath {
            path: self.to_string(),
            reason: "path must name a key below the scope".to_string(),
            suggestion: None,
        })?;
        let key = match first {
            Segment::Key(k) => k.clone(),
            Segment::Index(i) => i.to_string(),
        };
        let mut current = tier.entry(key).or_insert(Value::Null);
        for segment in rest {
            current = match segment {
                Segment::Index(i) => match current {
                    Value::Array(items) if *i <= items.len() => {
                        if *i == items.len() {
                            items.push(Value::Null);
                        }
                        &mut items[*i]
                    }
                    _ => {
                        return Err(StateError::InvalidPath {
                            path: self.to_string(),
                            reason: format!("index {i} is out of bounds or not an array"),
                            suggestion: None,
                        });
                    }
                },
                Segment::Key(k) => {
                    if current.is_null() {
                        *current = Value::Object(Map::new());
                    }
                    match current {
                        Value::Object(map) => map.entry(k.clone()).or_insert(Value::Null),
                        Value::Array(items) => match k.parse::<usize>() {
                            Ok(i) if i < items.len() => &mut items[i],
                            _ => return Err(self.not_container(k)),
                        },
                        _ => return Err(self.not_container(k)),
                    }
                }
            };
        }
        Ok(current)
    }

    fn not_container(&self, key: &str) -> StateError {
        StateError::InvalidPath {
            path: self.to_string(),
            reason: format!("cannot descend into '{key}': parent is not an object"),
            suggestion: None,
        }
    }
}

fn segment_eq(a: &Segment, b: &Segment) -> bool {
    match (a, b) {
        (Segment::Key(x), Segment::Key(y)) => x == y,
        (Segment::Index(x), Segment::Index(y)) => x == y,
        (Segment::Key(k), Segment::Index(i)) | (Segment::Index(i), Segment::Key(k)) => {
            *k == i.to_string()
        }
    }
}

fn step_into<'a>(value: &'a Value, segment: &Segment) -> Option<&'a Value> {
    match (value, segment) {
        (Value::Object(map), Segment::Key(k)) => map.get(k),
        (Value::Object(map), Segment::Index(i)) => map.get(&i.to_string()),
        (Value::Array(items), Segment::Index(i)) => items.get(*i),
        (Value::Array(items), Segment::Key(k)) => k.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scope.as_str())?;
        for segment in &self.segments {
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for StatePath {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StatePath::parse(s)
    }
}
