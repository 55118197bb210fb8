//! API-style configuration attached to providers and models, and the merge
//! that folds them into one effective directive set for a request.

use std::collections::BTreeMap;

use aigate_transform::body::BodyTransform;
use serde::{Deserialize, Serialize};

pub const STYLE_OPENAI: &str = "openai-compatible";
pub const STYLE_ANTHROPIC: &str = "anthropic-compatible";
pub const STYLE_VERTEX: &str = "google-vertex-ai";
pub const VENDOR_ANTHROPIC: &str = "anthropic";
pub const VENDOR_BEDROCK: &str = "aws-bedrock";

const WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathOp {
    Set,
    Replace,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacePair {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathDirective {
    pub op: PathOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replace: Vec<ReplacePair>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvOp {
    Add,
    Set,
    Delete,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvDirective {
    pub op: KvOp,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl KvDirective {
    /// An add or set without a usable value. A delete never is.
    pub fn is_empty(&self) -> bool {
        self.op != KvOp::Delete && self.values.iter().all(|value| value.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiDirective {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathDirective>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, KvDirective>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, KvDirective>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<BodyTransform>,
}

/// One configuration fragment, attached to a provider or a model.
///
/// `directives` is keyed by `METHOD:path-pattern`; either side may be `*`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiSegment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_vendor: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub directives: BTreeMap<String, ApiDirective>,
}

impl ApiSegment {
    /// The most specific directive for `(method, path_pattern)`: exact match,
    /// then any-method, then any-path, then `*:*`.
    pub fn find(&self, method: &str, path_pattern: &str) -> Option<&ApiDirective> {
        let mut best: Option<(u8, &ApiDirective)> = None;
        for (key, directive) in &self.directives {
            let Some((key_method, key_path)) = key.split_once(':') else {
                continue;
            };
            let (key_method, key_path) = (key_method.trim(), key_path.trim());
            let method_exact = key_method.eq_ignore_ascii_case(method);
            let path_exact = key_path == path_pattern;
            let method_ok = method_exact || key_method == WILDCARD;
            let path_ok = path_exact || key_path == WILDCARD;
            if !method_ok || !path_ok {
                continue;
            }
            let rank = match (method_exact, path_exact) {
                (true, true) => 3,
                (false, true) => 2,
                (true, false) => 1,
                (false, false) => 0,
            };
            if best.is_none_or(|(current, _)| rank > current) {
                best = Some((rank, directive));
            }
        }
        best.map(|(_, directive)| directive)
    }
}

/// Effective configuration for one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiStyleConfig {
    pub api_style: Option<String>,
    pub api_vendor: Option<String>,
    pub directive: ApiDirective,
}

impl ApiStyleConfig {
    pub fn style_is(&self, style: &str) -> bool {
        self.api_style
            .as_deref()
            .is_some_and(|value| value.trim().eq_ignore_ascii_case(style))
    }

    pub fn vendor_is(&self, vendor: &str) -> bool {
        self.api_vendor
            .as_deref()
            .is_some_and(|value| value.trim().eq_ignore_ascii_case(vendor))
    }
}

/// Folds segments, lowest priority first, into the effective config for
/// `(method, path_pattern)`. Returns `None` when no segment has a matching
/// directive.
///
/// Scalars and map entries take the last non-empty value; `path` and `body`
/// are replaced whole by the last segment that sets them.
pub fn merge<'a>(
    method: &str,
    path_pattern: &str,
    segments: impl IntoIterator<Item = &'a ApiSegment>,
) -> Option<ApiStyleConfig> {
    let mut out = ApiStyleConfig::default();
    let mut matched = false;

    for segment in segments {
        overlay_scalar(&mut out.api_style, &segment.api_style);
        overlay_scalar(&mut out.api_vendor, &segment.api_vendor);

        let Some(fragment) = segment.find(method, path_pattern) else {
            continue;
        };
        matched = true;
        let target = &mut out.directive;
        overlay_scalar(&mut target.method, &fragment.method);
        overlay_scalar(&mut target.scheme, &fragment.scheme);
        overlay_scalar(&mut target.host, &fragment.host);
        if fragment.path.is_some() {
            target.path = fragment.path.clone();
        }
        overlay_entries(&mut target.query, &fragment.query);
        overlay_entries(&mut target.headers, &fragment.headers);
        if fragment.body.is_some() {
            target.body = fragment.body.clone();
        }
    }

    matched.then_some(out)
}

fn overlay_entries(target: &mut BTreeMap<String, KvDirective>, entries: &BTreeMap<String, KvDirective>) {
    for (key, directive) in entries.iter().filter(|(_, directive)| !directive.is_empty()) {
        target.insert(key.clone(), directive.clone());
    }
}

fn overlay_scalar(target: &mut Option<String>, value: &Option<String>) {
    if let Some(value) = value.as_deref().filter(|v| !v.trim().is_empty()) {
        *target = Some(value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn segment(value: serde_json::Value) -> ApiSegment {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn model_host_wins_and_provider_header_survives() {
        let provider = segment(json!({
            "api_style": "openai-compatible",
            "directives": {"*:*": {
                "host": "a.com",
                "headers": {"X": {"op": "set", "values": ["p"]}}
            }}
        }));
        let model = segment(json!({
            "directives": {"*:*": {"host": "b.com"}}
        }));

        let merged = merge("POST", "/v1/chat/completions", [&provider, &model]).unwrap();
        assert_eq!(merged.directive.host.as_deref(), Some("b.com"));
        assert_eq!(merged.directive.headers["X"].values, vec!["p".to_string()]);
        assert!(merged.style_is("OpenAI-Compatible"));
    }

    #[test]
    fn body_and_path_are_replaced_whole() {
        let provider = segment(json!({"directives": {"*:*": {
            "path": {"op": "set", "value": "/a"},
            "body": {"drop": ["top_p"], "rename": {"max_tokens": "max_completion_tokens"}}
        }}}));
        let model = segment(json!({"directives": {"*:*": {
            "body": {"drop": ["user"]}
        }}}));

        let merged = merge("POST", "/x", [&provider, &model]).unwrap();
        let body = merged.directive.body.unwrap();
        assert_eq!(body.drop, vec!["user".to_string()]);
        assert!(body.rename.is_empty());
        assert_eq!(merged.directive.path.unwrap().value.as_deref(), Some("/a"));
    }

    #[test]
    fn empty_scalars_do_not_override() {
        let provider = segment(json!({"directives": {"*:*": {"host": "a.com", "scheme": "https"}}}));
        let model = segment(json!({"directives": {"*:*": {"host": "  "}}}));
        let merged = merge("GET", "/", [&provider, &model]).unwrap();
        assert_eq!(merged.directive.host.as_deref(), Some("a.com"));
    }

    #[test]
    fn empty_entries_do_not_override_earlier_values() {
        let provider = segment(json!({"directives": {"*:*": {
            "headers": {"X-Team": {"op": "set", "values": ["core"]}},
            "query": {"api-version": {"op": "set", "values": ["2024-10-01"]}}
        }}}));
        let model = segment(json!({"directives": {"*:*": {
            "headers": {"X-Team": {"op": "set", "values": []}, "X-Trace": {"op": "delete"}},
            "query": {"api-version": {"op": "add", "values": [" "]}}
        }}}));

        let merged = merge("POST", "/x", [&provider, &model]).unwrap();
        assert_eq!(merged.directive.headers["X-Team"].values, vec!["core".to_string()]);
        assert_eq!(merged.directive.headers["X-Trace"].op, KvOp::Delete);
        assert_eq!(merged.directive.query["api-version"].values, vec!["2024-10-01".to_string()]);
    }

    #[test]
    fn most_specific_key_is_chosen_within_a_segment() {
        let seg = segment(json!({"directives": {
            "*:*": {"host": "any"},
            "POST:*": {"host": "post-any"},
            "*:/v1/chat/completions": {"host": "any-chat"},
            "post:/v1/chat/completions": {"host": "post-chat"}
        }}));
        assert_eq!(seg.find("POST", "/v1/chat/completions").unwrap().host.as_deref(), Some("post-chat"));
        assert_eq!(seg.find("GET", "/v1/chat/completions").unwrap().host.as_deref(), Some("any-chat"));
        assert_eq!(seg.find("POST", "/v1/embeddings").unwrap().host.as_deref(), Some("post-any"));
        assert_eq!(seg.find("GET", "/v1/models").unwrap().host.as_deref(), Some("any"));
    }

    #[test]
    fn no_matching_fragment_yields_none() {
        let seg = segment(json!({
            "api_style": "openai-compatible",
            "directives": {"POST:/v1/embeddings": {"host": "a.com"}}
        }));
        assert!(merge("POST", "/v1/chat/completions", [&seg]).is_none());
    }

    #[test]
    fn unknown_ops_deserialize() {
        let directive: KvDirective = serde_json::from_value(json!({"op": "prepend"})).unwrap();
        assert_eq!(directive.op, KvOp::Unknown);
        let path: PathDirective = serde_json::from_value(json!({"op": "regex"})).unwrap();
        assert_eq!(path.op, PathOp::Unknown);
    }
}
