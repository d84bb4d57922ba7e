//! Minimal JSONPath resolver: `$` root, `.field`, `[i]`, `[*]`.
//!
//! Resolution collapses multiplicity: exactly one match returns the value
//! itself, several matches return an array, zero matches is an error.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JsonPathError {
    #[error("malformed JSONPath '{0}'")]
    Malformed(String),
    #[error("JSONPath '{0}' matched nothing")]
    NoMatch(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
    Wildcard,
}

fn parse(path: &str) -> Result<Vec<Segment>, JsonPathError> {
    let malformed = || JsonPathError::Malformed(path.to_string());
    let mut rest = path.strip_prefix('$').ok_or_else(malformed)?;
    let mut segments = Vec::new();

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('.') {
            let end = after
                .find(|c| c == '.' || c == '[')
                .unwrap_or(after.len());
            if end == 0 {
                return Err(malformed());
            }
            segments.push(Segment::Field(after[..end].to_string()));
            rest = &after[end..];
        } else if let Some(after) = rest.strip_prefix('[') {
            let close = after.find(']').ok_or_else(malformed)?;
            let inner = &after[..close];
            if inner == "*" {
                segments.push(Segment::Wildcard);
            } else {
                let index: usize = inner.parse().map_err(|_| malformed())?;
                segments.push(Segment::Index(index));
            }
            rest = &after[close + 1..];
        } else {
            return Err(malformed());
        }
    }

    Ok(segments)
}

/// Resolve `path` against `root`.
pub fn resolve(path: &str, root: &Value) -> Result<Value, JsonPathError> {
    let segments = parse(path)?;
    let mut current: Vec<&Value> = vec![root];

    for segment in &segments {
        let mut next = Vec::new();
        for value in current {
            match segment {
                Segment::Field(name) => {
                    if let Some(found) = value.get(name.as_str()) {
                        next.push(found);
                    }
                }
                Segment::Index(i) => {
                    if let Some(found) = value.get(i) {
                        next.push(found);
                    }
                }
                Segment::Wildcard => match value {
                    Value::Array(items) => next.extend(items.iter()),
                    Value::Object(map) => next.extend(map.values()),
                    _ => {}
                },
            }
        }
        current = next;
        if current.is_empty() {
            return Err(JsonPathError::NoMatch(path.to_string()));
        }
    }

    match current.len() {
        1 => Ok(current[0].clone()),
        _ => Ok(Value::Array(current.into_iter().cloned().collect())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn root_resolves_to_itself() {
        let value = json!({"a": 1});
        assert_eq!(resolve("$", &value).unwrap(), value);
    }

    #[test]
    fn nested_fields_resolve() {
        let value = json!({"a": {"b": "v"}});
        assert_eq!(resolve("$.a.b", &value).unwrap(), json!("v"));
    }

    #[test]
    fn index_and_wildcard() {
        let value = json!({"items": [{"id": 1}, {"id": 2}]});
        assert_eq!(resolve("$.items[0].id", &value).unwrap(), json!(1));
        assert_eq!(resolve("$.items[*].id", &value).unwrap(), json!([1, 2]));
    }

    #[test]
    fn single_wildcard_match_collapses_to_scalar() {
        let value = json!({"items": [{"id": 7}]});
        assert_eq!(resolve("$.items[*].id", &value).unwrap(), json!(7));
    }

    #[test]
    fn zero_matches_is_an_error() {
        let value = json!({"a": 1});
        assert!(matches!(
            resolve("$.missing", &value),
            Err(JsonPathError::NoMatch(_))
        ));
        assert!(matches!(
            resolve("$.a.deeper", &value),
            Err(JsonPathError::NoMatch(_))
        ));
    }

    #[test]
    fn malformed_paths_are_rejected() {
        let value = json!({});
        for path in ["steps", "$.", "$[x]", "$.a[", "$a"] {
            assert!(
                matches!(resolve(path, &value), Err(JsonPathError::Malformed(_))),
                "expected malformed for {path}"
            );
        }
    }
}
