//! In-memory identity and model catalog loaded from one YAML/JSON file.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use aigate_provider_core::{
    Client, ClientToken, IdentityResolver, Model, ModelCatalog, ModelSelector, Provider,
    ProviderError,
};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("read catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse catalog: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("model {model:?} references unknown provider {provider:?}")]
    UnknownProvider { model: String, provider: String },
    #[error("token is assigned to more than one client ({0:?})")]
    DuplicateToken(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub clients: Vec<ClientEntry>,
    #[serde(default)]
    pub providers: Vec<Provider>,
    #[serde(default)]
    pub models: Vec<Model>,
}

impl CatalogFile {
    pub fn from_yaml(text: &str) -> Result<Self, CatalogError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text)
    }
}

#[derive(Debug, Default)]
struct CatalogSnapshot {
    clients: HashMap<String, Client>,
    tokens: HashMap<String, ClientToken>,
    providers: HashMap<String, Provider>,
    /// File order, which is also the model-list order.
    models: Vec<Model>,
}

impl CatalogSnapshot {
    fn build(file: CatalogFile) -> Result<Self, CatalogError> {
        let mut snapshot = CatalogSnapshot::default();
        for provider in file.providers {
            snapshot.providers.insert(provider.id.clone(), provider);
        }
        for model in &file.models {
            if !snapshot.providers.contains_key(&model.provider_id) {
                return Err(CatalogError::UnknownProvider {
                    model: model.id.clone(),
                    provider: model.provider_id.clone(),
                });
            }
        }
        snapshot.models = file.models;
        for entry in file.clients {
            for token in entry.tokens {
                if snapshot.tokens.contains_key(&token.token) {
                    return Err(CatalogError::DuplicateToken(entry.id));
                }
                snapshot.tokens.insert(
                    token.token.clone(),
                    ClientToken {
                        token: token.token,
                        client_id: entry.id.clone(),
                        expires_at: token.expires_at,
                    },
                );
            }
            snapshot.clients.insert(
                entry.id.clone(),
                Client {
                    id: entry.id,
                    name: entry.name,
                    allowed_models: entry.allowed_models,
                    metadata: entry.metadata,
                },
            );
        }
        Ok(snapshot)
    }

    fn with_provider(&self, model: &Model) -> Option<(Model, Provider)> {
        let provider = self.providers.get(&model.provider_id)?;
        Some((model.clone(), provider.clone()))
    }
}

/// Serves both collaborator seams from one swappable snapshot.
pub struct MemoryCatalog {
    snapshot: ArcSwap<CatalogSnapshot>,
}

impl MemoryCatalog {
    pub fn new(file: CatalogFile) -> Result<Self, CatalogError> {
        Ok(Self {
            snapshot: ArcSwap::from_pointee(CatalogSnapshot::build(file)?),
        })
    }

    pub fn replace(&self, file: CatalogFile) -> Result<(), CatalogError> {
        self.snapshot.store(Arc::new(CatalogSnapshot::build(file)?));
        Ok(())
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        let snapshot = self.snapshot.load();
        (
            snapshot.clients.len(),
            snapshot.providers.len(),
            snapshot.models.len(),
        )
    }
}

#[async_trait]
impl IdentityResolver for MemoryCatalog {
    async fn resolve(&self, token: &str) -> Result<(Client, Option<ClientToken>), ProviderError> {
        let snapshot = self.snapshot.load();
        let entry = snapshot
            .tokens
            .get(token)
            .ok_or_else(|| ProviderError::Unauthorized("invalid api key".to_string()))?;
        if let Some(expires_at) = entry.expires_at
            && expires_at <= OffsetDateTime::now_utc().unix_timestamp()
        {
            return Err(ProviderError::Unauthorized("api key expired".to_string()));
        }
        let client = snapshot
            .clients
            .get(&entry.client_id)
            .ok_or_else(|| ProviderError::Unauthorized("api key has no client".to_string()))?;
        Ok((client.clone(), Some(entry.clone())))
    }
}

#[async_trait]
impl ModelCatalog for MemoryCatalog {
    async fn find_model(&self, client: &Client, selector: &ModelSelector) -> Option<(Model, Provider)> {
        let snapshot = self.snapshot.load();
        let found = match selector {
            ModelSelector::Id(id) => snapshot.models.iter().find(|model| &model.id == id),
            ModelSelector::Name(name) => snapshot
                .models
                .iter()
                .find(|model| model.public_name() == name)
                .or_else(|| snapshot.models.iter().find(|model| &model.name == name)),
        }?;
        if !client.may_use(found) {
            return None;
        }
        snapshot.with_provider(found)
    }

    async fn list_models(&self, client: &Client) -> Vec<(Model, Provider)> {
        let snapshot = self.snapshot.load();
        snapshot
            .models
            .iter()
            .filter(|model| client.may_use(model))
            .filter_map(|model| snapshot.with_provider(model))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
clients:
  - id: team-a
    name: Team A
    allowed_models: [m-1]
    tokens:
      - token: sk-a
      - token: sk-old
        expires_at: 1000
  - id: team-b
    tokens: [{token: sk-b}]
providers:
  - id: p-1
    name: openai
    api_key: sk-upstream
models:
  - id: m-1
    name: gpt-4o-2024-08-06
    display_name: gpt-4o
    provider_id: p-1
  - id: m-2
    name: gpt-4o-mini
    provider_id: p-1
"#;

    fn catalog() -> MemoryCatalog {
        MemoryCatalog::new(CatalogFile::from_yaml(CATALOG).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn resolves_tokens() {
        let catalog = catalog();
        let (client, token) = catalog.resolve("sk-a").await.unwrap();
        assert_eq!(client.id, "team-a");
        assert_eq!(token.unwrap().client_id, "team-a");
        assert!(matches!(catalog.resolve("sk-old").await, Err(ProviderError::Unauthorized(_))));
        assert!(matches!(catalog.resolve("nope").await, Err(ProviderError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn finds_models_by_public_name_or_id_within_allowance() {
        let catalog = catalog();
        let (team_a, _) = catalog.resolve("sk-a").await.unwrap();
        let (team_b, _) = catalog.resolve("sk-b").await.unwrap();

        let (model, provider) = catalog
            .find_model(&team_a, &ModelSelector::Name("gpt-4o".into()))
            .await
            .unwrap();
        assert_eq!(model.name, "gpt-4o-2024-08-06");
        assert_eq!(provider.name, "openai");

        assert!(catalog.find_model(&team_a, &ModelSelector::Id("m-2".into())).await.is_none());
        assert!(catalog.find_model(&team_b, &ModelSelector::Id("m-2".into())).await.is_some());
        assert_eq!(catalog.list_models(&team_a).await.len(), 1);
        assert_eq!(catalog.list_models(&team_b).await.len(), 2);
    }

    #[test]
    fn rejects_dangling_provider_references() {
        let file = CatalogFile::from_yaml(
            "models: [{id: m, name: x, provider_id: missing}]",
        )
        .unwrap();
        assert!(matches!(MemoryCatalog::new(file), Err(CatalogError::UnknownProvider { .. })));
    }
}
