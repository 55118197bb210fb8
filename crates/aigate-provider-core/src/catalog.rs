//! Collaborator seams for identity and model lookup. Storage is not this
//! crate's concern; `aigate-core` ships in-memory implementations.

use async_trait::async_trait;

use crate::errors::ProviderError;
use crate::records::{Client, ClientToken, Model, Provider};

/// How the downstream addressed a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSelector {
    Id(String),
    Name(String),
}

impl ModelSelector {
    /// Parses a raw selector. `"display name [ID:<id>]"` selects by id, a
    /// plain value selects by name. Blank input yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Some(id) = embedded_id(raw) {
            return Some(ModelSelector::Id(id.to_string()));
        }
        Some(ModelSelector::Name(raw.to_string()))
    }

    pub fn id(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        (!raw.is_empty()).then(|| ModelSelector::Id(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            ModelSelector::Id(value) | ModelSelector::Name(value) => value,
        }
    }
}

fn embedded_id(raw: &str) -> Option<&str> {
    let inner = raw.strip_suffix(']')?;
    let start = inner.rfind('[')?;
    let tag = inner[start + 1..].trim();
    let (prefix, id) = tag.split_once(':')?;
    if !prefix.trim().eq_ignore_ascii_case("id") {
        return None;
    }
    let id = id.trim();
    (!id.is_empty()).then_some(id)
}

#[async_trait]
pub trait ModelCatalog: Send + Sync {
    /// The model and its provider, if the client may use it.
    async fn find_model(&self, client: &Client, selector: &ModelSelector)
    -> Option<(Model, Provider)>;

    /// Every model the client may use, with its provider.
    async fn list_models(&self, client: &Client) -> Vec<(Model, Provider)>;
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<(Client, Option<ClientToken>), ProviderError>;
}
