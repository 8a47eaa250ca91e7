//! Extract members and elements from JSON values.
//!
//! Extraction specs look like `x`, `x.y`, `[3]`, or `x[3].y`: object member
//! names joined by dots, array indices in brackets.

use serde_json::Value;

use crate::error::{Error, Result};

/// The type of a JSON node.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum JsonType {
    Null,
    Boolean,
    Number,
    String,
    Object,
    Array,
}

pub fn type_of(value: &Value) -> JsonType {
    match value {
        Value::Null => JsonType::Null,
        Value::Bool(_) => JsonType::Boolean,
        Value::Number(_) => JsonType::Number,
        Value::String(_) => JsonType::String,
        Value::Object(_) => JsonType::Object,
        Value::Array(_) => JsonType::Array,
    }
}

/// One parsed step of an extraction spec.
#[derive(Debug, Clone, Eq, PartialEq)]
enum Step<'s> {
    /// Object member name.
    Member(&'s str),
    /// Array element index.
    Element(usize),
}

/// Parse an extraction spec into steps. `None` if the spec is malformed.
fn parse_spec(spec: &str) -> Option<Vec<Step<'_>>> {
    let mut steps = Vec::new();
    let mut rest = spec;

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('[') {
            let close = after.find(']')?;
            let index: usize = after[..close].parse().ok()?;
            steps.push(Step::Element(index));
            rest = &after[close + 1..];
        } else {
            // A member name runs until the next '.' or '['.
            let end = rest.find(['.', '[']).unwrap_or(rest.len());
            if end == 0 {
                return None;
            }
            steps.push(Step::Member(&rest[..end]));
            rest = &rest[end..];
        }

        // A dot must be followed by a member name.
        if let Some(after) = rest.strip_prefix('.') {
            if after.is_empty() || after.starts_with('[') {
                return None;
            }
            rest = after;
        }
    }

    if steps.is_empty() { None } else { Some(steps) }
}

/// Extract the node a spec points at from a JSON document.
///
/// Returns the (owned) sub-value and its type. `BadParameter` for a
/// malformed spec, `Fault` for text that isn't JSON, `NotFound` when the
/// document has no such member or element.
pub fn extract(json_text: &str, spec: &str) -> Result<(Value, JsonType)> {
    let steps = parse_spec(spec).ok_or(Error::BadParameter)?;
    let doc: Value = serde_json::from_str(json_text).map_err(|_| Error::Fault)?;

    let mut node = &doc;
    for step in &steps {
        node = match step {
            Step::Member(name) => node.get(*name),
            Step::Element(index) => node.get(*index),
        }
        .ok_or(Error::NotFound)?;
    }

    Ok((node.clone(), type_of(node)))
}

/// Coerce an extracted node to a boolean. Anything but `true` is false.
pub fn convert_to_bool(value: &Value) -> bool {
    value.as_bool().unwrap_or(false)
}

/// Coerce an extracted node to a number. NaN if it isn't one.
pub fn convert_to_number(value: &Value) -> f64 {
    value.as_f64().unwrap_or(f64::NAN)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_specs() {
        assert_eq!(parse_spec("a").unwrap(), vec![Step::Member("a")]);
        assert_eq!(parse_spec("[3]").unwrap(), vec![Step::Element(3)]);
        assert_eq!(
            parse_spec("a.b[1].c").unwrap(),
            vec![
                Step::Member("a"),
                Step::Member("b"),
                Step::Element(1),
                Step::Member("c"),
            ]
        );
    }

    #[test]
    fn rejects_bad_specs() {
        assert!(parse_spec("").is_none());
        assert!(parse_spec(".").is_none());
        assert!(parse_spec("a.").is_none());
        assert!(parse_spec("a..b").is_none());
        assert!(parse_spec("a.[1]").is_none());
        assert!(parse_spec("[x]").is_none());
        assert!(parse_spec("[1").is_none());
    }

    #[test]
    fn extracts_nested() {
        let doc = r#"{"a":{"b":[10,20,30]}}"#;
        let (v, t) = extract(doc, "a.b[1]").unwrap();
        assert_eq!(t, JsonType::Number);
        assert_eq!(v.as_f64(), Some(20.0));

        let (v, t) = extract(doc, "a").unwrap();
        assert_eq!(t, JsonType::Object);
        assert_eq!(v["b"][0].as_f64(), Some(10.0));
    }

    #[test]
    fn extraction_failures() {
        let doc = r#"{"a":1}"#;
        assert_eq!(extract(doc, "b"), Err(Error::NotFound));
        assert_eq!(extract(doc, "a[0]"), Err(Error::NotFound));
        assert_eq!(extract(doc, ""), Err(Error::BadParameter));
        assert_eq!(extract("not json", "a"), Err(Error::Fault));
    }

    #[test]
    fn coercions() {
        let (v, _) = extract(r#"{"on":true}"#, "on").unwrap();
        assert!(convert_to_bool(&v));
        let (v, _) = extract(r#"{"n":2.5}"#, "n").unwrap();
        assert_eq!(convert_to_number(&v), 2.5);
        let (v, _) = extract(r#"{"n":"nope"}"#, "n").unwrap();
        assert!(convert_to_number(&v).is_nan());
        assert!(!convert_to_bool(&v));
    }
}
