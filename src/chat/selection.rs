use std::fmt;

use crate::api::models::{ModelInfo, ProviderInfo};
use crate::api::ChatBackend;
use crate::chat::ChatError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelSelection {
    pub provider: String,
    pub model: String,
}

impl ModelSelection {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for ModelSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub provider: String,
    pub models: Vec<String>,
}

/// Provider -> model list, in the order the backend reported them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        let mut catalog = Catalog::default();
        for entry in entries {
            for model in entry.models {
                catalog.insert(&entry.provider, &model);
            }
        }
        catalog
    }

    fn insert(&mut self, provider: &str, model: &str) {
        match self.entries.iter_mut().find(|e| e.provider == provider) {
            Some(entry) => {
                if !entry.models.iter().any(|m| m == model) {
                    entry.models.push(model.to_string());
                }
            }
            None => self.entries.push(CatalogEntry {
                provider: provider.to_string(),
                models: vec![model.to_string()],
            }),
        }
    }

    pub fn from_models(models: &[ModelInfo]) -> Self {
        let mut catalog = Catalog::default();
        for model in models {
            catalog.insert(&model.provider, &model.name);
        }
        catalog
    }

    pub fn from_providers(providers: &[ProviderInfo]) -> Self {
        let mut catalog = Catalog::default();
        for provider in providers {
            for model in &provider.models {
                catalog.insert(&provider.name, model);
            }
        }
        catalog
    }

    /// Builds the catalog from `/models`, falling back to `/providers` when
    /// the model listing is empty.
    pub async fn load(backend: &dyn ChatBackend) -> Result<Self, ChatError> {
        let models = backend.list_models().await?;
        if !models.is_empty() {
            return Ok(Self::from_models(&models));
        }
        let providers = backend.list_providers().await?;
        Ok(Self::from_providers(&providers))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.provider.as_str())
    }

    pub fn models_for(&self, provider: &str) -> &[String] {
        self.entries
            .iter()
            .find(|e| e.provider == provider)
            .map(|e| e.models.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains(&self, provider: &str, model: &str) -> bool {
        self.models_for(provider).iter().any(|m| m == model)
    }

    pub fn first(&self) -> Option<ModelSelection> {
        self.entries
            .iter()
            .find_map(|e| e.models.first().map(|m| ModelSelection::new(&e.provider, m)))
    }
}

/// Current model choice, always kept consistent with the catalog.
#[derive(Debug, Clone, Default)]
pub struct SelectionState {
    catalog: Catalog,
    current: Option<ModelSelection>,
}

impl SelectionState {
    pub fn new(catalog: Catalog) -> Self {
        let current = catalog.first();
        Self { catalog, current }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn current(&self) -> Option<&ModelSelection> {
        self.current.as_ref()
    }

    /// First catalog entry; stable for an unchanged catalog.
    pub fn default_selection(&self) -> Option<ModelSelection> {
        self.catalog.first()
    }

    /// Swaps in a fresh catalog, keeping the current choice if it survived.
    pub fn set_catalog(&mut self, catalog: Catalog) {
        self.catalog = catalog;
        let still_valid = self
            .current
            .as_ref()
            .is_some_and(|s| self.catalog.contains(&s.provider, &s.model));
        if !still_valid {
            self.current = self.catalog.first();
        }
    }

    pub fn select(&mut self, provider: &str, model: &str) -> Result<&ModelSelection, ChatError> {
        if !self.catalog.contains(provider, model) {
            return Err(ChatError::InvalidSelection {
                provider: provider.to_string(),
                model: model.to_string(),
            });
        }
        Ok(self.current.insert(ModelSelection::new(provider, model)))
    }

    /// The selection to send with, checked against the catalog.
    pub fn validated(&self) -> Result<ModelSelection, ChatError> {
        match &self.current {
            Some(s) if self.catalog.contains(&s.provider, &s.model) => Ok(s.clone()),
            Some(s) => Err(ChatError::InvalidSelection {
                provider: s.provider.clone(),
                model: s.model.clone(),
            }),
            None => Err(ChatError::InvalidState("no model is selected".to_string())),
        }
    }
}
