//! Configuration types for manifest building, task rendering and OCR.
//!
//! Every entry point takes its knobs from one struct built through a
//! builder. `build()` validates the whole struct, so a missing or
//! nonsensical job parameter is reported as
//! [`AnnotationError::InvalidConfig`] before any storage or OCR call is made.

use crate::error::AnnotationError;
use crate::job::DEFAULT_ENTITY_TYPES;
use crate::pipeline::render::AnalysisOptions;
use crate::pipeline::retry::RetryPolicy;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Key prefix under which the pre-human-task handler stores page payloads.
pub const DEFAULT_INTERMEDIATE_PREFIX: &str = "comprehend-semi-structured-docs-intermediate-output";

// ── ManifestConfig ───────────────────────────────────────────────────────

/// Configuration for [`crate::manifest::build_manifest`].
///
/// # Example
/// ```rust
/// use ssie_annotation::ManifestConfig;
///
/// let config = ManifestConfig::builder()
///     .labels(vec!["PER".into(), "ORG".into()])
///     .concurrency(8)
///     .build()
///     .unwrap();
/// assert!(!config.force_ocr);
/// ```
#[derive(Clone)]
pub struct ManifestConfig {
    /// Entity types offered to annotators; written to every record's
    /// `metadata.labels`. Default: [`DEFAULT_ENTITY_TYPES`].
    pub labels: Vec<String>,

    /// Key/value pairs shown to annotators alongside the page.
    pub annotator_metadata: Option<BTreeMap<String, String>>,

    /// Skip the text layer and OCR every page. Recorded as
    /// `metadata.use-textract-only`. Default: false.
    pub force_ocr: bool,

    /// Pages processed concurrently (OCR calls in flight). Default: 4.
    pub concurrency: usize,

    /// Retry budget for transient storage/OCR failures. Default: 3.
    pub max_retries: u32,

    /// Initial backoff in milliseconds, doubled per retry. Default: 500.
    pub retry_backoff_ms: u64,

    /// Longest side of a page rendered for OCR. Default: 2000.
    pub max_rendered_pixels: u32,

    /// Receives per-document and per-page events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            labels: DEFAULT_ENTITY_TYPES.iter().map(|s| s.to_string()).collect(),
            annotator_metadata: None,
            force_ocr: false,
            concurrency: 4,
            max_retries: 3,
            retry_backoff_ms: 500,
            max_rendered_pixels: 2000,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ManifestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManifestConfig")
            .field("labels", &self.labels)
            .field("annotator_metadata", &self.annotator_metadata)
            .field("force_ocr", &self.force_ocr)
            .field("concurrency", &self.concurrency)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ManifestProgressCallback>"),
            )
            .finish()
    }
}

impl ManifestConfig {
    pub fn builder() -> ManifestConfigBuilder {
        ManifestConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_backoff_ms)
    }

    /// Checks applied by the builder; entry points repeat them for configs
    /// assembled by hand.
    pub fn validate(&self) -> Result<(), AnnotationError> {
        if self.labels.is_empty() {
            return Err(AnnotationError::InvalidConfig(
                "at least one entity type is required".into(),
            ));
        }
        if let Some(label) = self.labels.iter().find(|l| l.trim().is_empty()) {
            return Err(AnnotationError::InvalidConfig(format!(
                "blank entity type {:?}",
                label
            )));
        }
        if self.concurrency == 0 {
            return Err(AnnotationError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        Ok(())
    }

    pub fn analysis_options(&self) -> AnalysisOptions {
        AnalysisOptions {
            force_ocr: self.force_ocr,
            max_rendered_pixels: self.max_rendered_pixels,
            only_page: None,
        }
    }
}

/// Builder for [`ManifestConfig`].
#[derive(Debug)]
pub struct ManifestConfigBuilder {
    config: ManifestConfig,
}

impl ManifestConfigBuilder {
    pub fn labels(mut self, labels: Vec<String>) -> Self {
        self.config.labels = labels;
        self
    }

    pub fn annotator_metadata(mut self, pairs: BTreeMap<String, String>) -> Self {
        self.config.annotator_metadata = Some(pairs);
        self
    }

    pub fn force_ocr(mut self, v: bool) -> Self {
        self.config.force_ocr = v;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    pub fn build(self) -> Result<ManifestConfig, AnnotationError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ── TaskConfig ───────────────────────────────────────────────────────────

/// Configuration for the pre-human-task adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskConfig {
    /// Entity-type menu. Required unless `verification` is set, in which
    /// case an empty list means "reuse the types of the prior annotation".
    pub entity_types: Vec<String>,

    /// The job reviews prior annotations instead of starting blind.
    pub verification: bool,

    /// Key prefix for page payloads written by the Lambda flow.
    pub intermediate_prefix: String,

    pub retry: RetryPolicy,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            entity_types: Vec::new(),
            verification: false,
            intermediate_prefix: DEFAULT_INTERMEDIATE_PREFIX.to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl TaskConfig {
    pub fn builder() -> TaskConfigBuilder {
        TaskConfigBuilder {
            config: Self::default(),
        }
    }
}

#[derive(Debug)]
pub struct TaskConfigBuilder {
    config: TaskConfig,
}

impl TaskConfigBuilder {
    pub fn entity_types(mut self, types: Vec<String>) -> Self {
        self.config.entity_types = types;
        self
    }

    pub fn verification(mut self, v: bool) -> Self {
        self.config.verification = v;
        self
    }

    pub fn intermediate_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.intermediate_prefix = prefix.into();
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn build(self) -> Result<TaskConfig, AnnotationError> {
        let c = &self.config;
        if c.entity_types.is_empty() && !c.verification {
            return Err(AnnotationError::InvalidConfig(
                "entity types are required outside verification mode".into(),
            ));
        }
        if c.intermediate_prefix.trim_matches('/').is_empty() {
            return Err(AnnotationError::InvalidConfig(
                "intermediate prefix must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── OcrConfig ────────────────────────────────────────────────────────────

/// Configuration for the vision-LLM OCR backend.
#[derive(Clone)]
pub struct OcrConfig {
    /// LLM model identifier, e.g. "gpt-4.1-nano". If None, the provider's
    /// default is used.
    pub model: Option<String>,

    /// Provider name ("openai", "anthropic", "ollama", ...). If None along
    /// with `provider`, the provider is detected from the environment.
    pub provider_name: Option<String>,

    /// Pre-constructed provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Custom line-detection prompt. If None, uses the built-in default.
    pub system_prompt: Option<String>,

    /// Sampling temperature. Default: 0.0.
    pub temperature: f32,

    /// Maximum tokens per reply. Default: 4096.
    pub max_tokens: usize,

    /// Per-call timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            model: None,
            provider_name: None,
            provider: None,
            system_prompt: None,
            temperature: 0.0,
            max_tokens: 4096,
            api_timeout_secs: 60,
        }
    }
}

impl fmt::Debug for OcrConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OcrConfig")
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .finish()
    }
}

impl OcrConfig {
    pub fn builder() -> OcrConfigBuilder {
        OcrConfigBuilder {
            config: Self::default(),
        }
    }
}

#[derive(Debug)]
pub struct OcrConfigBuilder {
    config: OcrConfig,
}

impl OcrConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn build(self) -> Result<OcrConfig, AnnotationError> {
        if self.config.max_tokens == 0 {
            return Err(AnnotationError::InvalidConfig(
                "max_tokens must be ≥ 1".into(),
            ));
        }
        if self.config.api_timeout_secs == 0 {
            return Err(AnnotationError::InvalidConfig(
                "API timeout must be ≥ 1 second".into(),
            ));
        }
        Ok(self.config)
    }
}
