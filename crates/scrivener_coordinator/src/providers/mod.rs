//! Config-backed provider gateway.

mod openai;

pub use openai::OpenAiCompatibleClient;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::collaborators::{GenerationClient, ModelLimits, ProviderGateway, ResolvedModel};
use crate::config::ProviderConfig;
use crate::error::{CoordinatorError, Result};
use crate::params::ParamSpec;

struct ModelEntry {
    enabled: bool,
    client: Arc<dyn GenerationClient>,
    limits: ModelLimits,
    supported_params: Vec<ParamSpec>,
    param_defaults: Map<String, Value>,
}

/// Resolves model ids against `[[providers]]` configuration.
///
/// Clients are built once at startup. A model is usable only when both it and its
/// provider are enabled.
#[derive(Default)]
pub struct ConfigProviderGateway {
    models: HashMap<String, ModelEntry>,
}

impl ConfigProviderGateway {
    pub fn from_config(providers: &[ProviderConfig]) -> Result<Self> {
        let mut gateway = Self::default();

        for provider in providers {
            let api_key = provider.api_key_env.as_deref().and_then(|var| {
                let key = std::env::var(var).ok().filter(|k| !k.is_empty());
                if key.is_none() {
                    warn!(provider = %provider.name, env = var, "API key variable is not set");
                }
                key
            });

            for model in &provider.models {
                let api_name = model.api_name.clone().unwrap_or_else(|| model.id.clone());
                let client = OpenAiCompatibleClient::new(&provider.base_url, api_key.clone(), api_name)?;
                gateway.insert(
                    &model.id,
                    provider.enabled && model.enabled,
                    Arc::new(client),
                    ModelLimits {
                        context_window: model.context_window,
                        max_output_tokens: model.max_output_tokens,
                    },
                    provider.params.clone(),
                    model.defaults.clone(),
                );
            }
            info!(
                provider = %provider.name,
                models = provider.models.len(),
                enabled = provider.enabled,
                "Provider registered"
            );
        }

        Ok(gateway)
    }

    /// Register a model with an explicit client.
    pub fn insert(
        &mut self,
        model_id: &str,
        enabled: bool,
        client: Arc<dyn GenerationClient>,
        limits: ModelLimits,
        supported_params: Vec<ParamSpec>,
        param_defaults: Map<String, Value>,
    ) {
        self.models.insert(
            model_id.to_string(),
            ModelEntry {
                enabled,
                client,
                limits,
                supported_params,
                param_defaults,
            },
        );
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }
}

#[async_trait]
impl ProviderGateway for ConfigProviderGateway {
    async fn resolve(&self, model_id: &str) -> Result<ResolvedModel> {
        let entry = self
            .models
            .get(model_id)
            .ok_or_else(|| CoordinatorError::NotFound(format!("Model {}", model_id)))?;

        if !entry.enabled {
            return Err(CoordinatorError::ProviderDisabled(model_id.to_string()));
        }

        Ok(ResolvedModel {
            model_id: model_id.to_string(),
            client: Arc::clone(&entry.client),
            limits: entry.limits,
            supported_params: entry.supported_params.clone(),
            param_defaults: entry.param_defaults.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;

    fn provider(enabled: bool, model_enabled: bool) -> ProviderConfig {
        ProviderConfig {
            name: "local".to_string(),
            base_url: "http://localhost:11434/v1".to_string(),
            api_key_env: None,
            enabled,
            params: Vec::new(),
            models: vec![ModelConfig {
                id: "llama".to_string(),
                api_name: None,
                enabled: model_enabled,
                context_window: 8192,
                max_output_tokens: None,
                defaults: Map::new(),
            }],
        }
    }

    #[tokio::test]
    async fn test_resolve_enabled_model() {
        let gateway = ConfigProviderGateway::from_config(&[provider(true, true)]).unwrap();
        let model = gateway.resolve("llama").await.unwrap();
        assert_eq!(model.limits.context_window, 8192);
    }

    #[tokio::test]
    async fn test_disabled_is_distinct_from_missing() {
        let gateway = ConfigProviderGateway::from_config(&[provider(false, true)]).unwrap();
        assert!(matches!(
            gateway.resolve("llama").await,
            Err(CoordinatorError::ProviderDisabled(_))
        ));
        assert!(matches!(
            gateway.resolve("gpt-9").await,
            Err(CoordinatorError::NotFound(_))
        ));

        let gateway = ConfigProviderGateway::from_config(&[provider(true, false)]).unwrap();
        assert!(matches!(
            gateway.resolve("llama").await,
            Err(CoordinatorError::ProviderDisabled(_))
        ));
    }
}
