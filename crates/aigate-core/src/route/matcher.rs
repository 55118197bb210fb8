//! Path patterns and route priority.
//!
//! Patterns are `/`-separated segments. A segment is a literal, a
//! `{name}` parameter matching exactly one segment, or `*` matching the rest
//! of the path (zero or more segments). `*` must be the last segment.

use std::collections::BTreeMap;

use super::RouteError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Wildcard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

fn split(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

impl PathPattern {
    pub fn parse(raw: &str) -> Result<Self, RouteError> {
        let raw = raw.trim();
        let invalid = |reason: &str| RouteError::InvalidPath {
            path: raw.to_string(),
            reason: reason.to_string(),
        };
        if !raw.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }
        let mut segments = Vec::new();
        for segment in split(raw) {
            if matches!(segments.last(), Some(Segment::Wildcard)) {
                return Err(invalid("'*' must be the last segment"));
            }
            let parsed = if segment == "*" {
                Segment::Wildcard
            } else if let Some(name) = segment.strip_prefix('{') {
                let name = name
                    .strip_suffix('}')
                    .filter(|name| !name.is_empty() && !name.contains(['{', '}']))
                    .ok_or_else(|| invalid("malformed parameter segment"))?;
                Segment::Param(name.to_string())
            } else if segment.contains(['{', '}', '*']) {
                return Err(invalid("literal segments cannot contain '{', '}' or '*'"));
            } else {
                Segment::Literal(segment.to_string())
            };
            segments.push(parsed);
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn has_wildcard(&self) -> bool {
        self.segments.contains(&Segment::Wildcard)
    }

    fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Captured parameters when `path` matches.
    pub fn matches(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let mut params = BTreeMap::new();
        let mut parts = split(path);
        for segment in &self.segments {
            match segment {
                Segment::Wildcard => return Some(params),
                Segment::Literal(literal) => {
                    if parts.next()? != literal {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    params.insert(name.clone(), parts.next()?.to_string());
                }
            }
        }
        parts.next().is_none().then_some(params)
    }

    /// Higher is more specific. The method term is included so the score
    /// is comparable across routes.
    pub fn score(&self, concrete_method: bool) -> i64 {
        let mut literal = 0i64;
        let mut param = 0i64;
        for segment in &self.segments {
            match segment {
                Segment::Literal(_) => literal += 1,
                Segment::Param(_) => param += 1,
                Segment::Wildcard => {}
            }
        }
        let mut score = 10 * literal - param + 2 * self.segments.len() as i64;
        if concrete_method {
            score += 5;
        }
        if self.is_root() {
            score -= 50;
        }
        if self.has_wildcard() {
            score -= 20;
        }
        score
    }
}
