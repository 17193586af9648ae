//! One LLM invocation: assemble, resolve, guard, merge, call, check.

use scrivener_protocol::defaults::DEFAULT_CHARS_PER_TOKEN;
use scrivener_protocol::{FileRef, JobPayload, OutputFormat, TokenUsage};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::collaborators::{
    AssemblyRequest, GenerationRequest, KnowledgeSource, PromptAssembler, ProviderGateway,
};
use crate::error::{CoordinatorError, Result};
use crate::params::merge_params;

/// Thresholds for the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationSettings {
    /// Responses shorter than this (after trimming) fail the sanity check.
    pub min_output_chars: usize,
    /// Characters per token for the prompt estimate.
    pub chars_per_token: usize,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            min_output_chars: 1,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }
}

/// Output of one successful generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Generated {
    pub prompt: String,
    pub response: String,
    pub token_usage: TokenUsage,
    /// Assembler and parameter warnings, for the run's validation warnings.
    pub warnings: Vec<String>,
}

pub struct GenerationPipeline {
    assembler: Arc<dyn PromptAssembler>,
    gateway: Arc<dyn ProviderGateway>,
    knowledge: Option<Arc<dyn KnowledgeSource>>,
    settings: GenerationSettings,
}

impl GenerationPipeline {
    pub fn new(
        assembler: Arc<dyn PromptAssembler>,
        gateway: Arc<dyn ProviderGateway>,
        knowledge: Option<Arc<dyn KnowledgeSource>>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            assembler,
            gateway,
            knowledge,
            settings,
        }
    }

    pub async fn generate(
        &self,
        tenant_id: &str,
        payload: &JobPayload,
        subjects: &[&FileRef],
    ) -> Result<Generated> {
        let workflow = &payload.workflow;
        let mut warnings = Vec::new();

        let knowledge = if workflow.knowledge_enabled {
            match &self.knowledge {
                Some(source) => source.knowledge_context(tenant_id, workflow).await?,
                None => {
                    warnings.push(
                        "Knowledge is enabled for this workflow but no knowledge source is configured"
                            .to_string(),
                    );
                    None
                }
            }
        } else {
            None
        };

        let assembled = self
            .assembler
            .assemble(AssemblyRequest {
                tenant_id,
                template: &workflow.prompt_template,
                input_roles: &workflow.input_roles,
                context_inputs: &payload.context_inputs,
                subjects,
                knowledge: knowledge.as_deref(),
            })
            .await?;
        warnings.extend(assembled.warnings);

        let model = self.gateway.resolve(&workflow.execution.model_id).await?;

        let estimated = estimate_tokens(&assembled.prompt, self.settings.chars_per_token);
        if estimated > model.limits.context_window {
            return Err(CoordinatorError::generation(format!(
                "Prompt is about {} tokens, over the {}-token context window of model '{}'",
                estimated, model.limits.context_window, model.model_id
            )));
        }

        let merged = merge_params(
            &model.supported_params,
            &model.param_defaults,
            &workflow.execution.overrides,
        );
        for warning in &merged.warnings {
            warn!(model_id = %model.model_id, "{}", warning);
        }
        warnings.extend(merged.warnings);

        debug!(
            model_id = %model.model_id,
            estimated_tokens = estimated,
            params = merged.values.len(),
            "Calling model"
        );

        let response = model
            .client
            .generate(&GenerationRequest {
                prompt: assembled.prompt.clone(),
                params: merged.values,
            })
            .await?;

        check_output(
            &response.text,
            response.token_usage,
            model.limits.max_output_tokens,
            workflow.output.format,
            self.settings.min_output_chars,
        )?;

        Ok(Generated {
            prompt: assembled.prompt,
            response: response.text,
            token_usage: response.token_usage,
            warnings,
        })
    }
}

/// Rough token estimate: characters divided by `chars_per_token`, rounded up.
pub fn estimate_tokens(text: &str, chars_per_token: usize) -> u64 {
    let chars = text.chars().count() as u64;
    let per_token = chars_per_token.max(1) as u64;
    chars.div_ceil(per_token)
}

/// Output sanity check. A failure here is handled exactly like a provider error.
pub fn check_output(
    text: &str,
    usage: TokenUsage,
    max_output_tokens: Option<u64>,
    format: OutputFormat,
    min_output_chars: usize,
) -> Result<()> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(CoordinatorError::generation("Model returned an empty response"));
    }

    let chars = trimmed.chars().count();
    if chars < min_output_chars {
        return Err(CoordinatorError::generation(format!(
            "Model response is {} characters, below the minimum of {}",
            chars, min_output_chars
        )));
    }

    if let Some(budget) = max_output_tokens {
        if usage.completion_tokens > budget {
            return Err(CoordinatorError::generation(format!(
                "Model used {} output tokens, over the budget of {}",
                usage.completion_tokens, budget
            )));
        }
    }

    if format == OutputFormat::Json {
        serde_json::from_str::<serde_json::Value>(strip_code_fence(trimmed)).map_err(|e| {
            CoordinatorError::generation(format!("Model response is not valid JSON: {}", e))
        })?;
    }

    Ok(())
}

/// Body of a fenced code block (```json ... ```), or the input unchanged.
pub fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return text;
    };
    match body.split_once('\n') {
        Some((_lang, inner)) => inner.trim(),
        None => body.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_rounds_up() {
        assert_eq!(estimate_tokens("", 4), 0);
        assert_eq!(estimate_tokens("abcd", 4), 1);
        assert_eq!(estimate_tokens("abcde", 4), 2);
        assert_eq!(estimate_tokens("abc", 0), 3);
    }

    #[test]
    fn test_sanity_check_rejects_empty_and_short() {
        let usage = TokenUsage::default();
        assert!(check_output("   ", usage, None, OutputFormat::Markdown, 1).is_err());
        assert!(check_output("ok", usage, None, OutputFormat::Markdown, 10).is_err());
        assert!(check_output("long enough", usage, None, OutputFormat::Markdown, 10).is_ok());
    }

    #[test]
    fn test_sanity_check_output_budget() {
        let usage = TokenUsage::new(10, 600, 610);
        let err = check_output("text", usage, Some(500), OutputFormat::Text, 1).unwrap_err();
        assert!(matches!(err, CoordinatorError::Generation(_)));
        assert!(check_output("text", usage, Some(600), OutputFormat::Text, 1).is_ok());
    }

    #[test]
    fn test_json_format_requires_json() {
        let usage = TokenUsage::default();
        assert!(check_output("{\"a\": 1}", usage, None, OutputFormat::Json, 1).is_ok());
        assert!(check_output("```json\n{\"a\": 1}\n```", usage, None, OutputFormat::Json, 1).is_ok());
        assert!(check_output("not json", usage, None, OutputFormat::Json, 1).is_err());
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n[1]\n```"), "[1]");
        assert_eq!(strip_code_fence("```[1]```"), "[1]");
        assert_eq!(strip_code_fence("[1]"), "[1]");
    }
}
