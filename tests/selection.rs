mod common;

#[cfg(test)]
mod tests {
    use super::common::{model_info, FakeBackend};
    use teehee::api::models::ProviderInfo;
    use teehee::chat::selection::CatalogEntry;
    use teehee::chat::{Catalog, ChatError, ModelSelection, SelectionState};

    fn catalog() -> Catalog {
        Catalog::from_models(&[
            model_info("openai", "gpt-4o"),
            model_info("openai", "gpt-4o-mini"),
            model_info("anthropic", "claude-3-5-sonnet"),
            model_info("openai", "gpt-4o"),
        ])
    }

    #[test]
    fn test_catalog_groups_and_dedupes_in_order() {
        let catalog = catalog();
        let providers: Vec<&str> = catalog.providers().collect();
        assert_eq!(providers, vec!["openai", "anthropic"]);
        assert_eq!(catalog.models_for("openai"), ["gpt-4o", "gpt-4o-mini"]);
        assert!(catalog.models_for("mistral").is_empty());
        assert!(catalog.contains("anthropic", "claude-3-5-sonnet"));
        assert!(!catalog.contains("anthropic", "gpt-4o"));
    }

    #[test]
    fn test_default_is_first_entry_and_stable() {
        let state = SelectionState::new(catalog());
        let expected = ModelSelection::new("openai", "gpt-4o");
        assert_eq!(state.current(), Some(&expected));
        assert_eq!(state.default_selection(), Some(expected.clone()));
        assert_eq!(state.default_selection(), Some(expected));
    }

    #[test]
    fn test_select_rejects_unknown_pair() {
        let mut state = SelectionState::new(catalog());
        let err = state.select("anthropic", "gpt-4o").unwrap_err();
        assert!(matches!(err, ChatError::InvalidSelection { .. }));
        assert_eq!(state.current().unwrap().model, "gpt-4o");

        let chosen = state.select("anthropic", "claude-3-5-sonnet").unwrap();
        assert_eq!(chosen.to_string(), "anthropic/claude-3-5-sonnet");
        assert_eq!(state.validated().unwrap().provider, "anthropic");
    }

    #[test]
    fn test_set_catalog_keeps_surviving_choice() {
        let mut state = SelectionState::new(catalog());
        state.select("openai", "gpt-4o-mini").unwrap();

        state.set_catalog(Catalog::new(vec![CatalogEntry {
            provider: "openai".to_string(),
            models: vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()],
        }]));
        assert_eq!(state.current().unwrap().model, "gpt-4o-mini");

        state.set_catalog(Catalog::new(vec![CatalogEntry {
            provider: "anthropic".to_string(),
            models: vec!["claude-3-opus".to_string()],
        }]));
        assert_eq!(
            state.current(),
            Some(&ModelSelection::new("anthropic", "claude-3-opus"))
        );
    }

    #[test]
    fn test_empty_catalog_has_no_valid_selection() {
        let state = SelectionState::new(Catalog::default());
        assert!(state.current().is_none());
        assert!(matches!(state.validated(), Err(ChatError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_load_prefers_models_then_falls_back_to_providers() {
        let backend = FakeBackend::default();
        backend.set_catalog(
            vec![],
            vec![ProviderInfo {
                name: "ollama".to_string(),
                models: vec!["llama3".to_string()],
                description: String::new(),
            }],
        );
        let catalog = Catalog::load(&backend).await.unwrap();
        assert_eq!(catalog.first(), Some(ModelSelection::new("ollama", "llama3")));

        backend.set_catalog(vec![model_info("openai", "gpt-4o")], vec![]);
        let catalog = Catalog::load(&backend).await.unwrap();
        assert_eq!(catalog.first(), Some(ModelSelection::new("openai", "gpt-4o")));
    }
}
