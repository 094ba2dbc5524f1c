//! Structural body comparison
//!
//! JSON bodies are compared as typed trees. Anything else falls back to byte
//! equality. Pure and deterministic; never fails on bad input.

use std::fmt::Write as _;
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::models::{Body, DiffLocation, DiffReason, Discrepancy};

/// Longest body excerpt kept in an `unparseable` discrepancy
const PREVIEW_CHARS: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Any,
}

/// Compiled ignore path such as `meta.timestamp` or `items.*.updatedAt`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnorePath(Vec<Segment>);

impl FromStr for IgnorePath {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let trimmed = trimmed
            .strip_prefix("$.")
            .or_else(|| trimmed.strip_prefix('$'))
            .unwrap_or(trimmed);
        let segments: Vec<Segment> = trimmed
            .split('.')
            .filter(|s| !s.is_empty())
            .map(|s| match s {
                "*" => Segment::Any,
                key => Segment::Key(key.to_string()),
            })
            .collect();
        if segments.is_empty() {
            return Err(format!("empty ignore path `{raw}`"));
        }
        Ok(Self(segments))
    }
}

impl IgnorePath {
    fn matches(&self, path: &[PathElem]) -> bool {
        self.0.len() == path.len()
            && self.0.iter().zip(path).all(|(seg, elem)| match (seg, elem) {
                (Segment::Any, _) => true,
                (Segment::Key(k), PathElem::Key(key)) => k == key,
                (Segment::Key(k), PathElem::Index(i)) => k.parse::<usize>().ok() == Some(*i),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathElem {
    Key(String),
    Index(usize),
}

fn render_path(path: &[PathElem]) -> String {
    let mut out = String::from("$");
    for elem in path {
        match elem {
            PathElem::Key(k) => {
                let _ = write!(out, ".{k}");
            }
            PathElem::Index(i) => {
                let _ = write!(out, "[{i}]");
            }
        }
    }
    out
}

/// Body comparison rules
#[derive(Debug, Clone, Default)]
pub struct BodyRules {
    pub ignore_paths: Vec<IgnorePath>,
    pub array_order_sensitive: bool,
}

impl BodyRules {
    /// Compile rules; unparseable ignore paths are skipped with a warning
    pub fn new(ignore_paths: &[String], array_order_sensitive: bool) -> Self {
        let ignore_paths = ignore_paths
            .iter()
            .filter_map(|raw| match raw.parse::<IgnorePath>() {
                Ok(p) => Some(p),
                Err(e) => {
                    tracing::warn!("skipping ignore path: {}", e);
                    None
                }
            })
            .collect();
        Self {
            ignore_paths,
            array_order_sensitive,
        }
    }

    fn is_ignored(&self, path: &[PathElem]) -> bool {
        self.ignore_paths.iter().any(|p| p.matches(path))
    }
}

/// Compare two optional bodies. An empty body is treated as absent.
pub fn compare_bodies(
    primary: Option<&Body>,
    shadow: Option<&Body>,
    rules: &BodyRules,
) -> Vec<Discrepancy> {
    let primary = primary.filter(|b| !b.is_empty());
    let shadow = shadow.filter(|b| !b.is_empty());

    match (primary, shadow) {
        (None, None) => Vec::new(),
        (Some(p), Some(s)) => match (parse_json(p), parse_json(s)) {
            (Some(pv), Some(sv)) => compare_json(&pv, &sv, rules),
            _ if p.as_bytes() == s.as_bytes() => Vec::new(),
            _ => vec![unparseable(Some(p), Some(s))],
        },
        (p, s) => vec![unparseable(p, s)],
    }
}

fn parse_json(body: &Body) -> Option<Value> {
    serde_json::from_slice(body.as_bytes()).ok()
}

fn preview(body: &Body) -> Value {
    let text = String::from_utf8_lossy(body.as_bytes());
    Value::String(text.chars().take(PREVIEW_CHARS).collect())
}

fn unparseable(primary: Option<&Body>, shadow: Option<&Body>) -> Discrepancy {
    Discrepancy {
        location: DiffLocation::Body("$".into()),
        reason: DiffReason::Unparseable,
        primary: primary.map(preview),
        shadow: shadow.map(preview),
    }
}

/// Structural diff of two JSON documents
pub fn compare_json(primary: &Value, shadow: &Value, rules: &BodyRules) -> Vec<Discrepancy> {
    let mut path = Vec::new();
    let mut out = Vec::new();
    if rules.array_order_sensitive {
        diff_value(primary, shadow, &mut path, rules, &mut out);
    } else {
        // Ignore paths address original positions, so they are applied before
        // sorting and never again on the sorted trees
        let primary = canonicalize(strip_ignored(primary, &mut path, rules));
        let shadow = canonicalize(strip_ignored(shadow, &mut path, rules));
        diff_value(&primary, &shadow, &mut path, &BodyRules::default(), &mut out);
    }
    out
}

/// Replace ignored nodes with null so positions stay stable
fn strip_ignored(value: &Value, path: &mut Vec<PathElem>, rules: &BodyRules) -> Value {
    if !path.is_empty() && rules.is_ignored(path) {
        return Value::Null;
    }
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                path.push(PathElem::Key(k.clone()));
                if !rules.is_ignored(path) {
                    out.insert(k.clone(), strip_ignored(v, path, rules));
                }
                path.pop();
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, v) in items.iter().enumerate() {
                path.push(PathElem::Index(i));
                out.push(strip_ignored(v, path, rules));
                path.pop();
            }
            Value::Array(out)
        }
        other => other.clone(),
    }
}

/// Sort every array by the canonical encoding of its elements
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Array(items) => {
            let mut keyed: Vec<(String, Value)> = items
                .into_iter()
                .map(canonicalize)
                .map(|v| (v.to_string(), v))
                .collect();
            keyed.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Array(keyed.into_iter().map(|(_, v)| v).collect())
        }
        Value::Object(map) => {
            Value::Object(map.into_iter().map(|(k, v)| (k, canonicalize(v))).collect())
        }
        Value::Number(n) => match n.as_f64() {
            // 1.0 and 1 must sort together
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
                Value::from(f as i64)
            }
            _ => Value::Number(n),
        },
        other => other,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn numbers_equal(a: &serde_json::Number, b: &serde_json::Number) -> bool {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x == y;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn push(
    out: &mut Vec<Discrepancy>,
    path: &[PathElem],
    reason: DiffReason,
    primary: Option<Value>,
    shadow: Option<Value>,
) {
    out.push(Discrepancy {
        location: DiffLocation::Body(render_path(path)),
        reason,
        primary,
        shadow,
    });
}

fn diff_value(
    primary: &Value,
    shadow: &Value,
    path: &mut Vec<PathElem>,
    rules: &BodyRules,
    out: &mut Vec<Discrepancy>,
) {
    if !path.is_empty() && rules.is_ignored(path) {
        return;
    }

    match (primary, shadow) {
        (Value::Object(p), Value::Object(s)) => {
            for (key, pv) in p {
                path.push(PathElem::Key(key.clone()));
                match s.get(key) {
                    Some(sv) => diff_value(pv, sv, path, rules, out),
                    None if !rules.is_ignored(path) => {
                        push(out, path, DiffReason::MissingInShadow, Some(pv.clone()), None)
                    }
                    None => {}
                }
                path.pop();
            }
            for (key, sv) in s {
                if p.contains_key(key) {
                    continue;
                }
                path.push(PathElem::Key(key.clone()));
                if !rules.is_ignored(path) {
                    push(out, path, DiffReason::MissingInPrimary, None, Some(sv.clone()));
                }
                path.pop();
            }
        }
        (Value::Array(p), Value::Array(s)) => {
            if p.len() != s.len() {
                push(
                    out,
                    path,
                    DiffReason::LengthMismatch,
                    Some(Value::from(p.len())),
                    Some(Value::from(s.len())),
                );
            }
            for (i, (pv, sv)) in p.iter().zip(s).enumerate() {
                path.push(PathElem::Index(i));
                diff_value(pv, sv, path, rules, out);
                path.pop();
            }
        }
        (Value::Number(p), Value::Number(s)) => {
            if !numbers_equal(p, s) {
                push(
                    out,
                    path,
                    DiffReason::ValueMismatch,
                    Some(primary.clone()),
                    Some(shadow.clone()),
                );
            }
        }
        (p, s) if type_name(p) != type_name(s) => push(
            out,
            path,
            DiffReason::TypeMismatch,
            Some(p.clone()),
            Some(s.clone()),
        ),
        (p, s) => {
            if p != s {
                push(
                    out,
                    path,
                    DiffReason::ValueMismatch,
                    Some(p.clone()),
                    Some(s.clone()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rules(paths: &[&str], ordered: bool) -> BodyRules {
        let paths: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
        BodyRules::new(&paths, ordered)
    }

    fn body(s: &str) -> Body {
        Body::from(s)
    }

    #[test]
    fn test_identical_documents_match() {
        let doc = json!({"a": 1, "b": [1, {"c": null}], "d": "x"});
        assert!(compare_json(&doc, &doc, &rules(&[], true)).is_empty());
    }

    #[test]
    fn test_numbers_compare_by_value() {
        let d = compare_bodies(
            Some(&body(r#"{"a":1}"#)),
            Some(&body(r#"{"a":1.0}"#)),
            &rules(&[], true),
        );
        assert!(d.is_empty());
    }

    #[test]
    fn test_reports_paths_and_reasons() {
        let p = json!({"a": {"b": [1, 2, 3]}, "gone": true, "t": "1"});
        let s = json!({"a": {"b": [1, 5, 3]}, "new": 1, "t": 1});
        let d = compare_json(&p, &s, &rules(&[], true));

        let find = |at: &str| {
            d.iter()
                .find(|x| x.location == DiffLocation::Body(at.into()))
                .map(|x| x.reason)
        };
        assert_eq!(find("$.a.b[1]"), Some(DiffReason::ValueMismatch));
        assert_eq!(find("$.gone"), Some(DiffReason::MissingInShadow));
        assert_eq!(find("$.new"), Some(DiffReason::MissingInPrimary));
        assert_eq!(find("$.t"), Some(DiffReason::TypeMismatch));
        assert_eq!(d.len(), 4);
    }

    #[test]
    fn test_length_mismatch() {
        let d = compare_json(&json!([1, 2]), &json!([1, 2, 3]), &rules(&[], true));
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].reason, DiffReason::LengthMismatch);
        assert_eq!(d[0].location, DiffLocation::Body("$".into()));
    }

    #[test]
    fn test_ignore_paths_with_wildcards() {
        let p = json!({"meta": {"ts": 1, "v": 1}, "items": [{"id": 1, "n": "a"}, {"id": 2, "n": "b"}]});
        let s = json!({"meta": {"ts": 2, "v": 1}, "items": [{"id": 9, "n": "a"}, {"id": 8, "n": "b"}]});
        assert!(compare_json(&p, &s, &rules(&["$.meta.ts", "items.*.id"], true)).is_empty());
        assert_eq!(compare_json(&p, &s, &rules(&["meta.ts"], true)).len(), 2);

        // Ignored key missing on one side is not a discrepancy
        let s2 = json!({"meta": {"v": 1}, "items": p["items"].clone()});
        assert!(compare_json(&p, &s2, &rules(&["meta.ts"], true)).is_empty());
    }

    #[test]
    fn test_array_order_insensitive() {
        let p = json!({"tags": ["b", "a", {"k": 1}], "n": [2, 1.0]});
        let s = json!({"tags": [{"k": 1}, "a", "b"], "n": [1, 2]});
        assert!(compare_json(&p, &s, &rules(&[], false)).is_empty());
        assert!(!compare_json(&p, &s, &rules(&[], true)).is_empty());
    }

    #[test]
    fn test_order_insensitive_respects_ignored_fields() {
        let p = json!([{"id": 1, "ts": 5}, {"id": 2, "ts": 1}]);
        let s = json!([{"id": 2, "ts": 9}, {"id": 1, "ts": 0}]);
        assert!(compare_json(&p, &s, &rules(&["*.ts"], false)).is_empty());
    }

    #[test]
    fn test_order_insensitive_index_rule_targets_original_element() {
        // items.0 is the first element as sent, not the first after sorting
        let p = json!({"items": [{"id": 1}, {"id": 2}]});
        let s = json!({"items": [{"id": 1}, {"id": 3}]});
        let d = compare_json(&p, &s, &rules(&["items.0.id"], false));
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].reason, DiffReason::ValueMismatch);
        assert_eq!(d[0].primary, Some(json!(2)));
        assert_eq!(d[0].shadow, Some(json!(3)));

        let s = json!({"items": [{"id": 9}, {"id": 2}]});
        assert!(compare_json(&p, &s, &rules(&["items.0.id"], false)).is_empty());
    }

    #[test]
    fn test_non_json_falls_back_to_bytes() {
        let r = rules(&[], true);
        assert!(compare_bodies(Some(&body("plain")), Some(&body("plain")), &r).is_empty());

        let d = compare_bodies(Some(&body("plain")), Some(&body("other")), &r);
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].reason, DiffReason::Unparseable);

        let d = compare_bodies(Some(&body(r#"{"a":1}"#)), None, &r);
        assert_eq!(d[0].reason, DiffReason::Unparseable);
        assert!(d[0].shadow.is_none());
    }

    #[test]
    fn test_empty_equals_absent() {
        let r = rules(&[], true);
        assert!(compare_bodies(None, None, &r).is_empty());
        assert!(compare_bodies(Some(&body("")), None, &r).is_empty());
    }

    #[test]
    fn test_ignore_path_parse() {
        assert!("".parse::<IgnorePath>().is_err());
        assert!("$".parse::<IgnorePath>().is_err());
        assert_eq!(
            "$.a.*".parse::<IgnorePath>().unwrap(),
            IgnorePath(vec![Segment::Key("a".into()), Segment::Any])
        );
    }
}
