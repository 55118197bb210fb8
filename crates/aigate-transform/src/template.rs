//! `${...}` placeholder resolution against a JSON object graph.
//!
//! A placeholder holds `||`-separated candidates. Candidates starting with
//! [`PATH_SIGIL`] are path expressions (`@provider.metadata.api-key`,
//! `@model["name"]`); anything else is a literal fallback. The first candidate
//! that yields a non-empty string wins.

use serde_json::Value;

pub const PATH_SIGIL: char = '@';
const OPEN: &str = "${";
const CLOSE: char = '}';
const ALTERNATIVE: &str = "||";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("invalid path expression {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("path {path:?} cannot descend into a {found} value")]
    NotAContainer { path: String, found: &'static str },
    #[error("no value resolved for {}{}", .placeholders.join(", "), cause_suffix(.cause))]
    Unresolved {
        /// The input with every resolvable placeholder substituted.
        partial: String,
        placeholders: Vec<String>,
        cause: Option<Box<TemplateError>>,
    },
}

fn cause_suffix(cause: &Option<Box<TemplateError>>) -> String {
    match cause {
        Some(cause) => format!(" (first error: {cause})"),
        None => String::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    Path(String),
    Literal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    /// The placeholder exactly as written, including `${` and `}`.
    pub raw: String,
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Lists the placeholders in `s`, in order of appearance.
pub fn search(s: &str) -> Vec<Placeholder> {
    scan(s)
        .into_iter()
        .map(|(start, end)| parse_placeholder(&s[start..end]))
        .collect()
}

pub fn contains_placeholder(s: &str) -> bool {
    !scan(s).is_empty()
}

/// Substitutes every placeholder in `s`.
///
/// Placeholders are resolved independently; when some cannot be resolved the
/// error still carries the partially substituted string, with unresolved
/// placeholders left verbatim.
pub fn resolve(s: &str, graph: &Value) -> Result<String, TemplateError> {
    let spans = scan(s);
    if spans.is_empty() {
        return Ok(s.to_string());
    }

    let mut out = String::with_capacity(s.len());
    let mut unresolved = Vec::new();
    let mut first_error: Option<TemplateError> = None;
    let mut cursor = 0;

    for (start, end) in spans {
        out.push_str(&s[cursor..start]);
        let placeholder = parse_placeholder(&s[start..end]);
        match resolve_placeholder(&placeholder, graph, &mut first_error) {
            Some(value) => out.push_str(&value),
            None => {
                out.push_str(&placeholder.raw);
                unresolved.push(placeholder.raw);
            }
        }
        cursor = end;
    }
    out.push_str(&s[cursor..]);

    if unresolved.is_empty() {
        Ok(out)
    } else {
        Err(TemplateError::Unresolved {
            partial: out,
            placeholders: unresolved,
            cause: first_error.map(Box::new),
        })
    }
}

/// Resolves placeholders in every string leaf of `value`, in place.
pub fn resolve_value(value: &mut Value, graph: &Value) -> Result<(), TemplateError> {
    match value {
        Value::String(text) => {
            if contains_placeholder(text) {
                *text = resolve(text, graph)?;
            }
            Ok(())
        }
        Value::Array(items) => items.iter_mut().try_for_each(|item| resolve_value(item, graph)),
        Value::Object(map) => map
            .values_mut()
            .try_for_each(|item| resolve_value(item, graph)),
        _ => Ok(()),
    }
}

fn resolve_placeholder(
    placeholder: &Placeholder,
    graph: &Value,
    first_error: &mut Option<TemplateError>,
) -> Option<String> {
    for candidate in &placeholder.candidates {
        match candidate {
            Candidate::Literal(text) => {
                if !text.is_empty() {
                    return Some(text.clone());
                }
            }
            Candidate::Path(path) => match lookup(graph, path) {
                Ok(Some(value)) => {
                    let text = stringify(value);
                    if !text.is_empty() {
                        return Some(text);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    if first_error.is_none() {
                        *first_error = Some(err);
                    }
                }
            },
        }
    }
    None
}

/// Byte spans of `${...}` tokens. An unterminated `${` is left as text.
fn scan(s: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut from = 0;
    while let Some(offset) = s[from..].find(OPEN) {
        let start = from + offset;
        let body_start = start + OPEN.len();
        match s[body_start..].find(CLOSE) {
            Some(close) => {
                let end = body_start + close + 1;
                spans.push((start, end));
                from = end;
            }
            None => break,
        }
    }
    spans
}

fn parse_placeholder(raw: &str) -> Placeholder {
    let inner = &raw[OPEN.len()..raw.len() - 1];
    let candidates = inner
        .split(ALTERNATIVE)
        .map(str::trim)
        .map(|part| match part.strip_prefix(PATH_SIGIL) {
            Some(path) => Candidate::Path(path.trim().to_string()),
            None => Candidate::Literal(part.to_string()),
        })
        .collect();
    Placeholder {
        raw: raw.to_string(),
        candidates,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Evaluates `path` against `graph`. A missing key is `Ok(None)`; descending
/// into a scalar is an error.
pub fn lookup<'a>(graph: &'a Value, path: &str) -> Result<Option<&'a Value>, TemplateError> {
    let segments = parse_path(path)?;
    let mut current = graph;
    for segment in &segments {
        let next = match (current, segment) {
            (Value::Object(map), PathSegment::Key(key)) => map.get(key),
            (Value::Object(map), PathSegment::Index(index)) => map.get(&index.to_string()),
            (Value::Array(items), PathSegment::Index(index)) => items.get(*index),
            (Value::Array(_), PathSegment::Key(_)) => None,
            (Value::Null, _) => None,
            (other, _) => {
                return Err(TemplateError::NotAContainer {
                    path: path.to_string(),
                    found: kind(other),
                });
            }
        };
        match next {
            Some(value) => current = value,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn parse_path(path: &str) -> Result<Vec<PathSegment>, TemplateError> {
    let invalid = |reason| TemplateError::InvalidPath {
        path: path.to_string(),
        reason,
    };
    let chars: Vec<char> = path.trim().chars().collect();
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut i = 0usize;

    while i < chars.len() {
        match chars[i] {
            '.' => {
                if current.is_empty() {
                    return Err(invalid("empty segment"));
                }
                segments.push(dotted_segment(&current));
                current.clear();
                if i + 1 >= chars.len() {
                    return Err(invalid("trailing dot"));
                }
                i += 1;
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(dotted_segment(&current));
                    current.clear();
                }
                i += 1;
                let mut inner = String::new();
                let mut quote: Option<char> = None;
                while i < chars.len() {
                    let ch = chars[i];
                    match quote {
                        Some(q) if ch == '\\' && i + 1 < chars.len() && chars[i + 1] == q => {
                            inner.push(q);
                            i += 2;
                            continue;
                        }
                        Some(q) if ch == q => quote = None,
                        None if ch == '"' || ch == '\'' => quote = Some(ch),
                        None if ch == ']' => break,
                        _ => {}
                    }
                    inner.push(ch);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(invalid("missing closing ]"));
                }
                segments.push(bracket_segment(inner.trim()).ok_or_else(|| invalid("empty bracket segment"))?);
                i += 1;
                if i < chars.len() && chars[i] == '.' {
                    if i + 1 >= chars.len() {
                        return Err(invalid("trailing dot"));
                    }
                    i += 1;
                }
            }
            ']' => return Err(invalid("unexpected ]")),
            ch => {
                current.push(ch);
                i += 1;
            }
        }
    }
    if !current.is_empty() {
        segments.push(dotted_segment(&current));
    }
    if segments.is_empty() {
        return Err(invalid("empty path"));
    }
    Ok(segments)
}

fn dotted_segment(token: &str) -> PathSegment {
    match token.parse::<usize>() {
        Ok(index) => PathSegment::Index(index),
        Err(_) => PathSegment::Key(token.to_string()),
    }
}

fn bracket_segment(inner: &str) -> Option<PathSegment> {
    if inner.is_empty() {
        return None;
    }
    let quoted = inner.len() >= 2
        && ((inner.starts_with('"') && inner.ends_with('"'))
            || (inner.starts_with('\'') && inner.ends_with('\'')));
    if quoted {
        let key = &inner[1..inner.len() - 1];
        if key.is_empty() {
            return None;
        }
        return Some(PathSegment::Key(key.to_string()));
    }
    Some(dotted_segment(inner))
}
