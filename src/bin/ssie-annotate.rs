//! CLI binary for ssie-annotation-kit.
//!
//! A thin shim over the library crate: maps flags to the config builders,
//! runs one flow and prints the result. Platform calls (starting the
//! labeling job) are left to the caller; `create-job` prints the request.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use ssie_annotation::job::{labels_from_schema, parse_annotator_metadata, parse_entity_types, ui_schema};
use ssie_annotation::manifest::records_from_previous_jobs;
use ssie_annotation::ocr::{OcrError, OcrPage};
use ssie_annotation::{
    build_manifest, consolidate_batch, handle_pre_human_task, write_manifest,
    CreateLabelingJobRequest, DocumentStore, JobConfig, LocalDocumentStore, ManifestConfig,
    ManifestOutput, ManifestProgressCallback, OcrBackend, OcrConfig, PreviousJob,
    ProgressCallback, TaskConfig, VlmOcrBackend,
};
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Page-counting progress bar. The total grows as documents are opened,
/// since page counts are unknown until then.
struct CliProgressCallback {
    bar: ProgressBar,
    page_errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>4}/{len} pages  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Listing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            page_errors: AtomicUsize::new(0),
        })
    }
}

impl ManifestProgressCallback for CliProgressCallback {
    fn on_build_start(&self, total_documents: usize) {
        self.bar.set_prefix("Extracting");
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Found {total_documents} PDF documents"))
        ));
    }

    fn on_document_start(&self, source_ref: &str, total_pages: usize) {
        self.bar.inc_length(total_pages as u64);
        self.bar.set_message(source_ref.to_string());
    }

    fn on_page_complete(&self, _source_ref: &str, _page_num: usize, _line_count: usize) {
        self.bar.inc(1);
    }

    fn on_page_error(&self, source_ref: &str, page_num: usize, error: &str) {
        self.page_errors.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} {} page {}  {}",
            red("✗"),
            source_ref,
            page_num,
            dim(error)
        ));
        self.bar.inc(1);
    }

    fn on_document_error(&self, source_ref: &str, error: &str) {
        self.bar
            .println(format!("  {} {}  {}", red("✗"), source_ref, red(error)));
    }

    fn on_build_complete(&self, total_records: usize, failures: usize) {
        self.bar.finish_and_clear();
        let empty = self.page_errors.load(Ordering::SeqCst);
        if failures == 0 {
            eprintln!("{} {} manifest records", green("✔"), bold(&total_records.to_string()));
        } else {
            eprintln!(
                "{} {} manifest records  ({} failures, {} empty pages)",
                cyan("⚠"),
                bold(&total_records.to_string()),
                red(&failures.to_string()),
                empty
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Build a manifest for every PDF under a prefix (local store rooted at ./data)
  ssie-annotate --store-root ./data manifest s3://docs/invoices -o s3://docs/input-manifest/run.manifest

  # Prepare a labeling job and print the CreateLabelingJob request
  ssie-annotate --s3 create-job --bucket docs --input-s3-path s3://docs/invoices \
      --entity-types "DATE, NAME" --workteam-arn ... --role-arn ... \
      --pre-human-task-lambda-arn ... --consolidation-lambda-arn ...

  # Verification job over an earlier blind pass
  ssie-annotate --s3 create-job --bucket docs --blind1-labeling-job-name job-a \
      --blind1-output-manifest s3://docs/output/job-a/manifests/output/output.manifest ...

  # Run the Lambda flows against a saved event
  ssie-annotate pre-human-task event.json --entity-types "DATE, NAME"
  ssie-annotate consolidate consolidation-event.json

STORES:
  Paths are s3://bucket/key URIs. Without --s3 they map onto
  <store-root>/bucket/key on the local filesystem.

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key (vision-LLM OCR)
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_PROVIDER      Override OCR provider
  EDGEQUAKE_MODEL         Override OCR model ID
  PDFIUM_LIB_PATH         Path to libpdfium
  AWS_REGION, AWS_PROFILE Used with --s3 and --ocr textract
"#;

/// Build labeling manifests from PDF pages and consolidate NER annotations.
#[derive(Parser, Debug)]
#[command(
    name = "ssie-annotate",
    version,
    about = "Build labeling manifests from PDF pages and consolidate NER annotations",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "SSIE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "SSIE_QUIET")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct StoreArgs {
    /// Root directory of the local store.
    #[arg(long, global = true, env = "SSIE_STORE_ROOT", default_value = ".")]
    store_root: PathBuf,

    /// Use Amazon S3 instead of the local store (feature `aws`).
    #[arg(long, global = true, env = "SSIE_USE_S3")]
    s3: bool,
}

#[derive(Args, Debug)]
struct OcrArgs {
    /// OCR backend for scanned pages.
    #[arg(long, env = "SSIE_OCR", value_enum, default_value = "vlm")]
    ocr: OcrChoice,

    /// Vision LLM model ID.
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Vision LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Per-page OCR call timeout in seconds.
    #[arg(long, env = "SSIE_OCR_TIMEOUT", default_value_t = 60)]
    ocr_timeout: u64,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OcrChoice {
    /// Vision LLM through edgequake-llm.
    Vlm,
    /// AWS Textract (feature `aws`).
    Textract,
    /// No OCR: scanned pages are emitted empty with a warning.
    None,
}

#[derive(Args, Debug)]
struct ExtractionArgs {
    /// Entity types, comma separated. Default: the built-in NER label set.
    #[arg(long, env = "SSIE_ENTITY_TYPES")]
    entity_types: Option<String>,

    /// Metadata shown to annotators: "key=Info,value=Sample,key=Due,value=12/12".
    #[arg(long, env = "SSIE_ANNOTATOR_METADATA")]
    annotator_metadata: Option<String>,

    /// OCR every page, ignoring the text layer.
    #[arg(long, env = "SSIE_USE_TEXTRACT_ONLY")]
    use_textract_only: bool,

    /// Pages OCR'd concurrently.
    #[arg(short, long, env = "SSIE_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Retries per collaborator call on transient failures.
    #[arg(long, env = "SSIE_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    #[command(flatten)]
    ocr: OcrArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a manifest for every PDF under a prefix.
    Manifest {
        /// Prefix to scan, e.g. s3://bucket/folder.
        input: String,

        /// Store the manifest at this path instead of printing it.
        #[arg(short, long, env = "SSIE_OUTPUT")]
        output: Option<String>,

        /// Print the full output (records, failures, stats) as JSON.
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        extraction: ExtractionArgs,
    },

    /// Write the input manifest and UI schema and print the job request.
    CreateJob(Box<CreateJobArgs>),

    /// Run the pre-human-task flow on a saved event.
    PreHumanTask {
        /// Event JSON file.
        event: PathBuf,

        /// Entity types, comma separated.
        #[arg(long, env = "SSIE_ENTITY_TYPES")]
        entity_types: Option<String>,

        /// The job reviews prior annotations.
        #[arg(long)]
        verification: bool,

        #[command(flatten)]
        ocr: OcrArgs,
    },

    /// Run the consolidation flow on a saved event.
    Consolidate {
        /// Event JSON file.
        event: PathBuf,
    },
}

#[derive(Args, Debug)]
struct CreateJobArgs {
    /// Bucket for manifests, UI artifacts and job output.
    #[arg(long, env = "SSIE_BUCKET")]
    bucket: String,

    /// Prefix holding the PDFs to annotate.
    #[arg(long, env = "SSIE_INPUT_S3_PATH")]
    input_s3_path: Option<String>,

    #[arg(long, env = "SSIE_JOB_NAME_PREFIX", default_value = ssie_annotation::job::DEFAULT_JOB_NAME_PREFIX)]
    job_name_prefix: String,

    #[arg(long, env = "SSIE_WORKTEAM_ARN", default_value = "")]
    workteam_arn: String,

    #[arg(long, env = "SSIE_ROLE_ARN", default_value = "")]
    role_arn: String,

    #[arg(long, env = "SSIE_PRE_HUMAN_TASK_LAMBDA_ARN", default_value = "")]
    pre_human_task_lambda_arn: String,

    #[arg(long, env = "SSIE_CONSOLIDATION_LAMBDA_ARN", default_value = "")]
    consolidation_lambda_arn: String,

    /// Workers per data object.
    #[arg(long, env = "SSIE_WORKERS", default_value_t = 1)]
    workers: u32,

    #[arg(long, env = "SSIE_TASK_TIME_LIMIT", default_value_t = 3600)]
    task_time_limit: u32,

    #[arg(long, env = "SSIE_TASK_AVAILABILITY", default_value_t = 864_000)]
    task_availability: u32,

    /// Earlier blind pass whose annotations are verified.
    #[arg(long, requires = "blind1_output_manifest")]
    blind1_labeling_job_name: Option<String>,

    /// Output manifest of the blind1 job.
    #[arg(long)]
    blind1_output_manifest: Option<String>,

    /// Second blind pass, for arbitration.
    #[arg(long, requires = "blind2_output_manifest")]
    blind2_labeling_job_name: Option<String>,

    /// Output manifest of the blind2 job.
    #[arg(long)]
    blind2_output_manifest: Option<String>,

    /// Re-issue only the blind1 tasks that expired unanswered.
    #[arg(long)]
    only_include_expired_tasks: bool,

    /// Labeling UI template; its placeholder is pointed at the job's artifacts.
    #[arg(long, env = "SSIE_UI_TEMPLATE")]
    ui_template: Option<PathBuf>,

    /// Write the input manifest and stop.
    #[arg(long)]
    create_input_manifest_only: bool,

    #[command(flatten)]
    extraction: ExtractionArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs for the extraction commands.
    let extracting = matches!(cli.command, Command::Manifest { .. } | Command::CreateJob(_));
    let show_progress = extracting && !cli.quiet && !cli.verbose;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let store = open_store(&cli.store).await?;
    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn ManifestProgressCallback>)
    } else {
        None
    };

    match cli.command {
        Command::Manifest {
            input,
            output,
            json,
            extraction,
        } => {
            let config = manifest_config(&extraction, None, progress)?;
            let ocr = open_ocr(&extraction.ocr).await?;
            let result = build_manifest(store.as_ref(), ocr.as_ref(), &input, &config)
                .await
                .context("Manifest build failed")?;
            report_failures(&result, cli.quiet);

            if json {
                let stats = serde_json::to_value(&result.stats)?;
                let doc = serde_json::json!({
                    "records": result.records,
                    "failures": result.failures,
                    "stats": stats,
                });
                println!("{}", serde_json::to_string_pretty(&doc)?);
            }
            match output {
                Some(path) => {
                    write_manifest(store.as_ref(), &path, &result.records)
                        .await
                        .context("Failed to write manifest")?;
                    if !cli.quiet {
                        eprintln!("{}  →  {}", green("✔"), bold(&path));
                    }
                }
                None if !json => {
                    print!("{}", ssie_annotation::manifest::to_json_lines(&result.records)?);
                }
                None => {}
            }
        }

        Command::CreateJob(args) => {
            create_job(store.as_ref(), *args, progress, cli.quiet).await?;
        }

        Command::PreHumanTask {
            event,
            entity_types,
            verification,
            ocr,
        } => {
            let event = read_event(&event).await?;
            let config = TaskConfig::builder()
                .entity_types(entity_types.as_deref().map(parse_entity_types).unwrap_or_default())
                .verification(verification)
                .build()
                .context("Invalid configuration")?;
            let ocr = open_ocr(&ocr).await?;
            let output = handle_pre_human_task(&event, store.as_ref(), ocr.as_ref(), &config)
                .await
                .context("Pre-human-task flow failed")?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }

        Command::Consolidate { event } => {
            let event = read_event(&event).await?;
            let output = consolidate_batch(&event, store.as_ref())
                .await
                .context("Consolidation failed")?;
            for failure in &output.failures {
                eprintln!("  {} {}", red("✗"), failure);
            }
            for (id, reconciled) in &output.reconciled {
                for rejection in &reconciled.rejected {
                    eprintln!("  {} {}: {}", cyan("⚠"), id, rejection);
                }
            }
            println!("{}", serde_json::to_string_pretty(&output.responses)?);
        }
    }

    Ok(())
}

async fn create_job(
    store: &dyn DocumentStore,
    args: CreateJobArgs,
    progress: Option<ProgressCallback>,
    quiet: bool,
) -> Result<()> {
    let config = JobConfig::builder()
        .bucket(args.bucket.trim_start_matches("s3://").trim_end_matches('/'))
        .job_name_prefix(args.job_name_prefix.as_str())
        .workteam_arn(args.workteam_arn.as_str())
        .role_arn(args.role_arn.as_str())
        .pre_human_task_lambda_arn(args.pre_human_task_lambda_arn.as_str())
        .consolidation_lambda_arn(args.consolidation_lambda_arn.as_str())
        .workers_per_object(args.workers)
        .task_time_limit_secs(args.task_time_limit)
        .task_availability_secs(args.task_availability)
        .blind1_job_name(args.blind1_labeling_job_name.clone())
        .blind2_job_name(args.blind2_labeling_job_name.clone())
        .build()
        .context("Invalid job configuration")?;

    let annotator_metadata = args
        .extraction
        .annotator_metadata
        .as_deref()
        .map(parse_annotator_metadata)
        .transpose()
        .context("Invalid --annotator-metadata")?;

    let (result, labels) = match (&config.blind1_job_name, &args.blind1_output_manifest) {
        (Some(blind1), Some(blind1_manifest)) => {
            // Follow-up job: labels come from the blind1 job's schema.
            let schema_text = read_text(store, &config.ui_schema_path(blind1)).await?;
            let schema: Value =
                serde_json::from_str(&schema_text).context("UI schema is not valid JSON")?;
            let labels = labels_from_schema(&schema)?;

            let primary_text = read_text(store, blind1_manifest).await?;
            let secondary_text = match &args.blind2_output_manifest {
                Some(path) => Some(read_text(store, path).await?),
                None => None,
            };
            let secondary = match (&config.blind2_job_name, &secondary_text) {
                (Some(job_name), Some(manifest)) => Some(PreviousJob { manifest, job_name }),
                _ => None,
            };
            let result = records_from_previous_jobs(
                PreviousJob {
                    manifest: &primary_text,
                    job_name: blind1,
                },
                secondary,
                &labels,
                annotator_metadata.as_ref(),
                args.only_include_expired_tasks,
            )?;
            (result, labels)
        }
        _ => {
            let Some(input) = args.input_s3_path.as_deref() else {
                bail!("--input-s3-path is required unless --blind1-labeling-job-name is given");
            };
            let input = input.trim_end_matches('/');
            let input_bucket = ssie_annotation::storage::bucket_of(input)?;
            if input_bucket != config.bucket && !args.create_input_manifest_only {
                bail!(
                    "Input path must be under s3://{} to start a labeling job (got {})",
                    config.bucket,
                    input
                );
            }
            let manifest = manifest_config(&args.extraction, annotator_metadata, progress)?;
            let ocr = open_ocr(&args.extraction.ocr).await?;
            let result = build_manifest(store, ocr.as_ref(), input, &manifest)
                .await
                .context("Manifest build failed")?;
            (result, manifest.labels)
        }
    };
    report_failures(&result, quiet);
    if result.records.is_empty() {
        bail!("No manifest records were produced");
    }

    let now = Utc::now();
    let job_name = config.job_name(now);
    let manifest_path = config.input_manifest_path(&job_name);
    write_manifest(store, &manifest_path, &result.records)
        .await
        .context("Failed to write input manifest")?;
    if !quiet {
        eprintln!("Uploaded input manifest file to {}", bold(&manifest_path));
    }
    if args.create_input_manifest_only {
        return Ok(());
    }

    let schema_path = config.ui_schema_path(&job_name);
    let schema = serde_json::to_vec(&ui_schema(&labels))?;
    store
        .put(&schema_path, schema)
        .await
        .with_context(|| format!("Failed to write {}", schema_path))?;
    if !quiet {
        eprintln!("Uploaded schema file to {}", bold(&schema_path));
    }

    if let Some(path) = &args.ui_template {
        let template = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read UI template from {:?}", path))?;
        let template_path = config.ui_template_path(&job_name);
        store
            .put(
                &template_path,
                config.render_ui_template(&template, &job_name).into_bytes(),
            )
            .await
            .with_context(|| format!("Failed to write {}", template_path))?;
        if !quiet {
            eprintln!("Uploaded template UI to {}", bold(&template_path));
        }
    }

    let request = CreateLabelingJobRequest::new(&config, now).context("Invalid job configuration")?;
    println!("{}", serde_json::to_string_pretty(&request)?);
    Ok(())
}

/// Map extraction flags to `ManifestConfig`.
fn manifest_config(
    args: &ExtractionArgs,
    annotator_metadata: Option<BTreeMap<String, String>>,
    progress: Option<ProgressCallback>,
) -> Result<ManifestConfig> {
    let mut builder = ManifestConfig::builder()
        .force_ocr(args.use_textract_only)
        .concurrency(args.concurrency)
        .max_retries(args.max_retries);
    if let Some(types) = &args.entity_types {
        builder = builder.labels(parse_entity_types(types));
    }
    let metadata = match annotator_metadata {
        Some(m) => Some(m),
        None => args
            .annotator_metadata
            .as_deref()
            .map(parse_annotator_metadata)
            .transpose()
            .context("Invalid --annotator-metadata")?,
    };
    if let Some(m) = metadata {
        builder = builder.annotator_metadata(m);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    builder.build().context("Invalid configuration")
}

async fn open_store(args: &StoreArgs) -> Result<Box<dyn DocumentStore>> {
    if args.s3 {
        #[cfg(feature = "aws")]
        return Ok(Box::new(ssie_annotation::storage::S3DocumentStore::from_env().await));
        #[cfg(not(feature = "aws"))]
        bail!("--s3 needs a build with the `aws` feature");
    }
    Ok(Box::new(LocalDocumentStore::new(&args.store_root)))
}

async fn open_ocr(args: &OcrArgs) -> Result<Box<dyn OcrBackend>> {
    match args.ocr {
        OcrChoice::Vlm => {
            let mut builder = OcrConfig::builder().api_timeout_secs(args.ocr_timeout);
            if let Some(model) = &args.model {
                builder = builder.model(model.as_str());
            }
            if let Some(provider) = &args.provider {
                builder = builder.provider_name(provider.as_str());
            }
            let config = builder.build().context("Invalid OCR configuration")?;
            Ok(Box::new(VlmOcrBackend::from_config(&config)?))
        }
        OcrChoice::Textract => {
            #[cfg(feature = "aws")]
            return Ok(Box::new(
                ssie_annotation::ocr::TextractOcrBackend::from_env().await,
            ));
            #[cfg(not(feature = "aws"))]
            bail!("--ocr textract needs a build with the `aws` feature");
        }
        OcrChoice::None => Ok(Box::new(DisabledOcr)),
    }
}

/// Backend for `--ocr none`.
struct DisabledOcr;

#[async_trait]
impl OcrBackend for DisabledOcr {
    fn name(&self) -> &str {
        "none"
    }

    async fn detect_lines(&self, _png: &[u8]) -> Result<OcrPage, OcrError> {
        Err(OcrError::InvalidRequest("OCR is disabled (--ocr none)".into()))
    }
}

async fn read_event(path: &PathBuf) -> Result<Value> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read event from {:?}", path))?;
    serde_json::from_str(&text).with_context(|| format!("{:?} is not valid JSON", path))
}

async fn read_text(store: &dyn DocumentStore, path: &str) -> Result<String> {
    let obj = store
        .get(path)
        .await
        .with_context(|| format!("Failed to read {}", path))?;
    Ok(obj.text()?.to_string())
}

fn report_failures(output: &ManifestOutput, quiet: bool) {
    if quiet {
        return;
    }
    for failure in &output.failures {
        eprintln!("  {} {}", red("✗"), failure);
    }
    let s = &output.stats;
    eprintln!(
        "{}",
        dim(&format!(
            "   {} documents ({} skipped), {} pages: {} native, {} OCR, {} empty in {}ms",
            s.documents, s.failed_documents, s.pages, s.native_pages, s.ocr_pages, s.empty_pages, s.duration_ms
        ))
    );
}
