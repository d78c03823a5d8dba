//! Labeling-job setup: entity types, annotator metadata, the UI schema and
//! the `CreateLabelingJob` request body.
//!
//! Nothing here talks to the labeling platform. [`CreateLabelingJobRequest`]
//! serializes to the platform's PascalCase request shape; submitting it is
//! the caller's concern.

use crate::error::AnnotationError;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Entity types offered when a job names none.
pub const DEFAULT_ENTITY_TYPES: &[&str] = &[
    "PER",
    "LOC",
    "ORG",
    "FAC",
    "BRAND",
    "COMM",
    "TITLE:MOVIE",
    "TITLE:MUSIC",
    "TITLE:BOOK",
    "TITLE:SOFT",
    "TITLE:GAME",
    "TITLE:OTHER",
    "PERSON:TITLE",
    "QUANT",
    "IDENTITY",
    "OTHER",
];

pub const DEFAULT_JOB_NAME_PREFIX: &str = "comprehend-semi-structured-docs";

/// Folder under the bucket that holds per-job UI artifacts.
pub const UI_TEMPLATE_FOLDER: &str = "comprehend-semi-structured-docs-ui-template";

/// Placeholder in the UI template replaced with the job's artifact folder.
pub const UI_TEMPLATE_PLACEHOLDER: &str = "TO_BE_REPLACE";

const SCHEMA_VERSION: &str = "SSIE_NER_SCHEMA_2021-04-15";

// ── Annotator metadata ───────────────────────────────────────────────────

static KEY_PART: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?i:key)=([^=]*)").unwrap());
static VALUE_PART: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?i:value)=([^=]*)").unwrap());

/// Parse `key=A,value=B,key=C,value=D` into `{A: B, C: D}`.
///
/// Parts are taken pairwise and used verbatim, surrounding whitespace
/// included. A part that is not `key=`/`value=` in its position, an
/// unpaired key, or a repeated key is an error.
pub fn parse_annotator_metadata(s: &str) -> Result<BTreeMap<String, String>, AnnotationError> {
    let invalid = |detail: &str| {
        AnnotationError::InvalidConfig(format!("annotator metadata '{}': {}", s, detail))
    };
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() < 2 {
        return Err(invalid("expected key=...,value=... pairs"));
    }
    if parts.len() % 2 != 0 {
        return Err(invalid("every key needs a value"));
    }

    let mut out = BTreeMap::new();
    for pair in parts.chunks(2) {
        let (Some(key), Some(value)) = (KEY_PART.captures(pair[0]), VALUE_PART.captures(pair[1]))
        else {
            return Err(invalid("expected key=...,value=... pairs"));
        };
        let key = key[1].to_string();
        if out.contains_key(&key) {
            return Err(invalid(&format!("duplicate key '{}'", key)));
        }
        out.insert(key, value[1].to_string());
    }
    Ok(out)
}

/// Split a comma-separated entity-type list, trimming each entry.
pub fn parse_entity_types(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// NER schema document the annotation UI loads.
pub fn ui_schema(labels: &[String]) -> Value {
    json!({
        "version": SCHEMA_VERSION,
        "schemas": {
            "named_entity": {
                "annotation_task": "NER",
                "tags": labels,
                "properties": [],
            }
        },
        "exported_time": "2021-04-15T17:34:34.493Z",
        "uuid": "f44b0438-72ac-43ac-bdc7-5727914522b9",
    })
}

/// Tags of a schema produced by [`ui_schema`].
pub fn labels_from_schema(schema: &Value) -> Result<Vec<String>, AnnotationError> {
    schema
        .pointer("/schemas/named_entity/tags")
        .and_then(|tags| serde_json::from_value(tags.clone()).ok())
        .ok_or_else(|| AnnotationError::malformed("UI schema", "no named_entity tags"))
}

// ── Job configuration ────────────────────────────────────────────────────

/// Everything needed to name a job and build its request.
#[derive(Debug, Clone, PartialEq)]
pub struct JobConfig {
    pub job_name_prefix: String,
    /// Bucket holding documents, manifests, UI artifacts and output.
    pub bucket: String,
    pub workteam_arn: String,
    pub role_arn: String,
    pub pre_human_task_lambda_arn: String,
    pub consolidation_lambda_arn: String,
    pub workers_per_object: u32,
    pub task_time_limit_secs: u32,
    pub task_availability_secs: u32,
    /// Earlier blind pass whose annotations are verified.
    pub blind1_job_name: Option<String>,
    /// Second blind pass, for arbitration.
    pub blind2_job_name: Option<String>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            job_name_prefix: DEFAULT_JOB_NAME_PREFIX.to_string(),
            bucket: String::new(),
            workteam_arn: String::new(),
            role_arn: String::new(),
            pre_human_task_lambda_arn: String::new(),
            consolidation_lambda_arn: String::new(),
            workers_per_object: 1,
            task_time_limit_secs: 3600,
            task_availability_secs: 864_000,
            blind1_job_name: None,
            blind2_job_name: None,
        }
    }
}

impl JobConfig {
    pub fn builder() -> JobConfigBuilder {
        JobConfigBuilder {
            inner: JobConfig::default(),
        }
    }

    /// `{prefix}-labeling-job-{YYYYmmddTHHMMSS}`.
    pub fn job_name(&self, now: DateTime<Utc>) -> String {
        format!(
            "{}-labeling-job-{}",
            self.job_name_prefix,
            timestamp(now)
        )
    }

    pub fn input_manifest_path(&self, job_name: &str) -> String {
        format!("s3://{}/input-manifest/{}.manifest", self.bucket, job_name)
    }

    /// Folder (bucket-relative) holding the job's UI artifacts.
    pub fn ui_artifact_prefix(&self, job_name: &str) -> String {
        format!("{}/{}/ui-template", UI_TEMPLATE_FOLDER, job_name)
    }

    pub fn ui_schema_path(&self, job_name: &str) -> String {
        format!("s3://{}/{}/schema.json", self.bucket, self.ui_artifact_prefix(job_name))
    }

    pub fn ui_template_path(&self, job_name: &str) -> String {
        format!(
            "s3://{}/{}/template-2021-04-15.liquid",
            self.bucket,
            self.ui_artifact_prefix(job_name)
        )
    }

    /// UI template with its placeholder pointing at this job's artifacts.
    pub fn render_ui_template(&self, template: &str, job_name: &str) -> String {
        let folder = format!("{}/{}/{}", self.bucket, UI_TEMPLATE_FOLDER, job_name);
        template.replace(UI_TEMPLATE_PLACEHOLDER, &folder)
    }

    /// Checks that must hold before any manifest is written.
    pub fn validate(&self) -> Result<(), AnnotationError> {
        if self.job_name_prefix.trim().is_empty() {
            return Err(AnnotationError::InvalidConfig(
                "job name prefix must not be empty".into(),
            ));
        }
        if self.bucket.trim().is_empty() {
            return Err(AnnotationError::InvalidConfig("bucket must not be empty".into()));
        }
        if self.workers_per_object == 0 {
            return Err(AnnotationError::InvalidConfig(
                "workers per data object must be at least 1".into(),
            ));
        }
        if self.task_time_limit_secs == 0 || self.task_availability_secs == 0 {
            return Err(AnnotationError::InvalidConfig(
                "task time limits must be positive".into(),
            ));
        }
        if self.blind2_job_name.is_some() && self.blind1_job_name.is_none() {
            return Err(AnnotationError::InvalidConfig(
                "a blind2 job needs a blind1 job".into(),
            ));
        }
        Ok(())
    }
}

pub struct JobConfigBuilder {
    inner: JobConfig,
}

impl JobConfigBuilder {
    pub fn job_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.inner.job_name_prefix = prefix.into();
        self
    }

    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.inner.bucket = bucket.into();
        self
    }

    pub fn workteam_arn(mut self, arn: impl Into<String>) -> Self {
        self.inner.workteam_arn = arn.into();
        self
    }

    pub fn role_arn(mut self, arn: impl Into<String>) -> Self {
        self.inner.role_arn = arn.into();
        self
    }

    pub fn pre_human_task_lambda_arn(mut self, arn: impl Into<String>) -> Self {
        self.inner.pre_human_task_lambda_arn = arn.into();
        self
    }

    pub fn consolidation_lambda_arn(mut self, arn: impl Into<String>) -> Self {
        self.inner.consolidation_lambda_arn = arn.into();
        self
    }

    pub fn workers_per_object(mut self, n: u32) -> Self {
        self.inner.workers_per_object = n;
        self
    }

    pub fn task_time_limit_secs(mut self, secs: u32) -> Self {
        self.inner.task_time_limit_secs = secs;
        self
    }

    pub fn task_availability_secs(mut self, secs: u32) -> Self {
        self.inner.task_availability_secs = secs;
        self
    }

    pub fn blind1_job_name(mut self, name: Option<String>) -> Self {
        self.inner.blind1_job_name = name;
        self
    }

    pub fn blind2_job_name(mut self, name: Option<String>) -> Self {
        self.inner.blind2_job_name = name;
        self
    }

    pub fn build(self) -> Result<JobConfig, AnnotationError> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}

fn timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%dT%H%M%S").to_string()
}

// ── Request body ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateLabelingJobRequest {
    pub labeling_job_name: String,
    pub label_attribute_name: String,
    pub input_config: InputConfig,
    pub output_config: OutputConfig,
    pub role_arn: String,
    pub stopping_conditions: StoppingConditions,
    pub human_task_config: HumanTaskConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InputConfig {
    pub data_source: DataSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataSource {
    pub s3_data_source: S3DataSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct S3DataSource {
    pub manifest_s3_uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OutputConfig {
    pub s3_output_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StoppingConditions {
    pub max_percentage_of_input_dataset_labeled: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HumanTaskConfig {
    pub workteam_arn: String,
    pub ui_config: UiConfig,
    pub pre_human_task_lambda_arn: String,
    pub task_title: String,
    pub task_description: String,
    pub number_of_human_workers_per_data_object: u32,
    pub task_time_limit_in_seconds: u32,
    pub task_availability_lifetime_in_seconds: u32,
    pub annotation_consolidation_config: AnnotationConsolidationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UiConfig {
    pub ui_template_s3_uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AnnotationConsolidationConfig {
    pub annotation_consolidation_lambda_arn: String,
}

impl CreateLabelingJobRequest {
    /// Request for a job started at `now`.
    ///
    /// # Errors
    /// `InvalidConfig` when the config fails validation or lacks the
    /// workteam, role or Lambda ARNs the platform requires.
    pub fn new(config: &JobConfig, now: DateTime<Utc>) -> Result<Self, AnnotationError> {
        config.validate()?;
        for (name, value) in [
            ("workteam ARN", &config.workteam_arn),
            ("role ARN", &config.role_arn),
            ("pre-human-task Lambda ARN", &config.pre_human_task_lambda_arn),
            ("consolidation Lambda ARN", &config.consolidation_lambda_arn),
        ] {
            if value.trim().is_empty() {
                return Err(AnnotationError::InvalidConfig(format!(
                    "{} is required to create a labeling job",
                    name
                )));
            }
        }

        let job_name = config.job_name(now);
        let task_title = format!(
            "{}-labeling-job-task-{}",
            config.job_name_prefix,
            timestamp(now)
        );
        Ok(Self {
            labeling_job_name: job_name.clone(),
            label_attribute_name: job_name.clone(),
            input_config: InputConfig {
                data_source: DataSource {
                    s3_data_source: S3DataSource {
                        manifest_s3_uri: config.input_manifest_path(&job_name),
                    },
                },
            },
            output_config: OutputConfig {
                s3_output_path: format!("s3://{}/output/", config.bucket),
            },
            role_arn: config.role_arn.clone(),
            stopping_conditions: StoppingConditions {
                max_percentage_of_input_dataset_labeled: 100,
            },
            human_task_config: HumanTaskConfig {
                workteam_arn: config.workteam_arn.clone(),
                ui_config: UiConfig {
                    ui_template_s3_uri: config.ui_template_path(&job_name),
                },
                pre_human_task_lambda_arn: config.pre_human_task_lambda_arn.clone(),
                task_title: task_title.clone(),
                task_description: task_title,
                number_of_human_workers_per_data_object: config.workers_per_object,
                task_time_limit_in_seconds: config.task_time_limit_secs,
                task_availability_lifetime_in_seconds: config.task_availability_secs,
                annotation_consolidation_config: AnnotationConsolidationConfig {
                    annotation_consolidation_lambda_arn: config.consolidation_lambda_arn.clone(),
                },
            },
        })
    }
}
