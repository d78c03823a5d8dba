//! Vision-LLM OCR backend.
//!
//! Sends the rendered page as a base64 PNG together with the line-detection
//! prompt from [`crate::prompts`], then parses the JSON line list out of the
//! reply. Retries are not handled here: a failed call is classified into an
//! [`OcrError`] and the caller's retry policy decides what happens next.

use super::{CoordinateSpace, OcrBackend, OcrError, OcrPage};
use crate::config::OcrConfig;
use crate::error::AnnotationError;
use crate::pipeline::{encode, postprocess};
use crate::prompts::DEFAULT_OCR_PROMPT;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const DEFAULT_MODEL: &str = "gpt-4.1-nano";

pub struct VlmOcrBackend {
    provider: Arc<dyn LLMProvider>,
    name: String,
    prompt: String,
    temperature: f32,
    max_tokens: usize,
    timeout: Duration,
}

impl std::fmt::Debug for VlmOcrBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VlmOcrBackend")
            .field("name", &self.name)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl VlmOcrBackend {
    /// Wrap an already-built provider with the settings from `config`.
    pub fn new(provider: Arc<dyn LLMProvider>, config: &OcrConfig) -> Self {
        let name = match (&config.provider_name, &config.model) {
            (Some(p), Some(m)) => format!("vlm:{}/{}", p, m),
            (Some(p), None) => format!("vlm:{}", p),
            _ => "vlm".to_string(),
        };
        Self {
            provider,
            name,
            prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_OCR_PROMPT.to_string()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.api_timeout_secs),
        }
    }

    /// Resolve a provider from `config` and the environment, then wrap it.
    pub fn from_config(config: &OcrConfig) -> Result<Self, AnnotationError> {
        let provider = resolve_provider(config)?;
        Ok(Self::new(provider, config))
    }

    fn build_messages(&self, png: &[u8]) -> Vec<ChatMessage> {
        vec![
            ChatMessage::system(self.prompt.as_str()),
            ChatMessage::user_with_images("", vec![encode::to_image_data(png)]),
        ]
    }

    fn build_options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

#[async_trait]
impl OcrBackend for VlmOcrBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn detect_lines(&self, png: &[u8]) -> Result<OcrPage, OcrError> {
        let start = Instant::now();
        let messages = self.build_messages(png);
        let options = self.build_options();

        let response =
            tokio::time::timeout(self.timeout, self.provider.chat(&messages, Some(&options)))
                .await
                .map_err(|_| OcrError::Timeout(format!("no reply within {:?}", self.timeout)))?
                .map_err(|e| OcrError::classify(e.to_string()))?;

        debug!(
            "{}: {} input tokens, {} output tokens, {:?}",
            self.name,
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );

        let lines = postprocess::parse_line_reply(&response.content).map_err(OcrError::Service)?;
        Ok(OcrPage {
            lines,
            coordinates: CoordinateSpace::Normalized,
        })
    }
}

/// Instantiate a named provider with the given model.
fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, AnnotationError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        AnnotationError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the vision provider, from most-specific to least-specific:
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider + model** (`config.provider_name`); the factory reads
///    the matching API key from the environment.
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`),
///    checked before auto-detection so the model choice is honoured even
///    when several API keys are present.
/// 4. **`OPENAI_API_KEY`** present: OpenAI with the configured or default model.
/// 5. **Full auto-detection** (`ProviderFactory::from_env`).
pub fn resolve_provider(config: &OcrConfig) -> Result<Arc<dyn LLMProvider>, AnnotationError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_vision_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| AnnotationError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No vision provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or pass --provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}
