//! Route definitions, their expansion into concrete routes, and lookup.

mod matcher;

use std::collections::BTreeMap;
use std::path::Path;

use aigate_provider_core::{FilterRegistry, FilterSpec, RegistryError};
use serde::{Deserialize, Serialize};

pub use matcher::PathPattern;

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("read route file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse route definitions: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("route {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("route {path:?}: method {method:?} is not a concrete verb")]
    InvalidMethod { path: String, method: String },
    #[error("route {method} {path}: {source}")]
    Filter {
        method: String,
        path: String,
        #[source]
        source: RegistryError,
    },
}

/// One declared route. `path` and `method` may be comma-separated lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDefinition {
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub request_filters: Vec<FilterSpec>,
    #[serde(default)]
    pub response_filters: Vec<FilterSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteFile {
    #[serde(default)]
    pub routes: Vec<RouteDefinition>,
}

impl RouteFile {
    pub fn from_yaml(text: &str) -> Result<Self, RouteError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RouteError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RouteError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text)
    }
}

/// A single-method, single-path route.
#[derive(Debug, Clone)]
pub struct Route {
    pub method: String,
    pub path: PathPattern,
    pub request_filters: Vec<FilterSpec>,
    pub response_filters: Vec<FilterSpec>,
}

#[derive(Debug)]
pub struct RouteMatch<'a> {
    pub route: &'a Route,
    pub params: BTreeMap<String, String>,
}

const VERBS: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

fn list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|item| !item.is_empty())
}

/// The immutable route set of the process.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Expands every definition into the cartesian product of its paths and
    /// methods, then checks each referenced filter by constructing it once.
    pub fn build(
        definitions: &[RouteDefinition],
        registry: &FilterRegistry,
    ) -> Result<Self, RouteError> {
        let mut routes = Vec::new();
        for definition in definitions {
            let methods: Vec<String> = list(&definition.method)
                .map(str::to_ascii_uppercase)
                .collect();
            if methods.is_empty() {
                return Err(RouteError::InvalidMethod {
                    path: definition.path.clone(),
                    method: definition.method.clone(),
                });
            }
            for path in list(&definition.path) {
                let pattern = PathPattern::parse(path)?;
                for method in &methods {
                    if !VERBS.contains(&method.as_str()) {
                        return Err(RouteError::InvalidMethod {
                            path: path.to_string(),
                            method: method.clone(),
                        });
                    }
                    for spec in definition
                        .request_filters
                        .iter()
                        .chain(&definition.response_filters)
                    {
                        registry.create(spec).map_err(|source| RouteError::Filter {
                            method: method.clone(),
                            path: path.to_string(),
                            source,
                        })?;
                    }
                    routes.push(Route {
                        method: method.clone(),
                        path: pattern.clone(),
                        request_filters: definition.request_filters.clone(),
                        response_filters: definition.response_filters.clone(),
                    });
                }
            }
        }
        Ok(Self { routes })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// The highest-scoring route accepting the request; the first
    /// registered one wins ties.
    pub fn find_best_match(&self, method: &str, path: &str) -> Option<RouteMatch<'_>> {
        let mut best: Option<(i64, RouteMatch<'_>)> = None;
        for route in &self.routes {
            if !route.method.eq_ignore_ascii_case(method) {
                continue;
            }
            let Some(params) = route.path.matches(path) else {
                continue;
            };
            let score = route.path.score(true);
            if best.as_ref().is_none_or(|(top, _)| score > *top) {
                best = Some((score, RouteMatch { route, params }));
            }
        }
        best.map(|(_, found)| found)
    }
}
