//! Workflow definition types for Weft.
//!
//! Defines the declarative workflow representation parsed from YAML or JSON:
//! a named set of steps with dependencies, per-step agent assignment, and
//! retry/timeout policy. A `WorkflowDefinition` is immutable once parsed --
//! the engine never mutates it at runtime.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The declarative workflow definition.
///
/// YAML and JSON files are structurally identical and both deserialize into
/// this struct. It is the single source of truth for a workflow's shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Human-readable workflow name.
    pub name: String,
    /// Version string (e.g. "1.0.0").
    pub version: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional author attribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Free-form tags for discovery/filtering.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Workflow-level execution configuration.
    #[serde(default)]
    pub config: WorkflowConfig,
    /// Ordered list of step definitions forming the workflow DAG.
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    /// Look up a step by its key.
    pub fn step(&self, key: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.key == key)
    }
}

// ---------------------------------------------------------------------------
// Workflow Config
// ---------------------------------------------------------------------------

/// Workflow-level execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Workflow-level timeout in seconds (default 30 minutes).
    #[serde(default = "default_workflow_timeout_secs")]
    pub timeout_secs: u64,
    /// Default retry budget for steps without an explicit policy.
    #[serde(default)]
    pub max_retries: u32,
    /// Minimum seconds between automatic checkpoints (default 0 = every level).
    #[serde(default)]
    pub checkpoint_interval_secs: u64,
    /// Maximum concurrently running steps within a level (default 4).
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// When true, non-optional step failures do not abort the workflow.
    #[serde(default)]
    pub continue_on_error: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_workflow_timeout_secs(),
            max_retries: 0,
            checkpoint_interval_secs: 0,
            parallelism: default_parallelism(),
            continue_on_error: false,
        }
    }
}

fn default_workflow_timeout_secs() -> u64 {
    1800
}

fn default_parallelism() -> usize {
    4
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// User-defined step key (e.g. "gather-news"). Unique within a workflow.
    pub key: String,
    /// Target capability identifier -- which agent executes this step.
    pub agent: String,
    /// Prompt/payload template. May reference other steps' outputs via
    /// `{{stepKey.fieldPath}}` placeholders, resolved at dispatch time.
    pub prompt: String,
    /// Step keys this step depends on (DAG edges).
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Advisory parallelism hint. Actual concurrency is determined solely by
    /// the dependency graph.
    #[serde(default = "default_parallel")]
    pub parallel: bool,
    /// When true, failure of this step does not abort the workflow.
    #[serde(default)]
    pub optional: bool,
    /// Step-level timeout in seconds (default 300).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Retry policy for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

fn default_parallel() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Retry policy for a workflow step.
///
/// The delay before attempt `n` (0-based retry count) is
/// `retry_delay_ms * retry_backoff_multiplier^n`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt (default 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay before the first retry, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Multiplier applied to the delay for each subsequent retry.
    #[serde(default = "default_backoff_multiplier")]
    pub retry_backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a full `WorkflowDefinition` exercising the step surface.
    fn sample_workflow() -> WorkflowDefinition {
        WorkflowDefinition {
            name: "daily-digest".to_string(),
            version: "1.0.0".to_string(),
            description: Some("Gather news, analyze, summarize".to_string()),
            author: Some("ops".to_string()),
            tags: vec!["news".to_string(), "digest".to_string()],
            config: WorkflowConfig {
                timeout_secs: 600,
                max_retries: 1,
                checkpoint_interval_secs: 30,
                parallelism: 2,
                continue_on_error: false,
            },
            steps: vec![
                StepDefinition {
                    key: "gather".to_string(),
                    agent: "researcher".to_string(),
                    prompt: "Find the top 5 AI news stories".to_string(),
                    dependencies: vec![],
                    parallel: true,
                    optional: false,
                    timeout_secs: Some(120),
                    retry: None,
                },
                StepDefinition {
                    key: "analyze".to_string(),
                    agent: "analyst".to_string(),
                    prompt: "Analyze: {{gather.articles}}".to_string(),
                    dependencies: vec!["gather".to_string()],
                    parallel: true,
                    optional: false,
                    timeout_secs: None,
                    retry: Some(RetryPolicy {
                        max_retries: 2,
                        retry_delay_ms: 500,
                        retry_backoff_multiplier: 2.0,
                    }),
                },
                StepDefinition {
                    key: "notify".to_string(),
                    agent: "messenger".to_string(),
                    prompt: "Send digest: {{analyze.summary}}".to_string(),
                    dependencies: vec!["analyze".to_string()],
                    parallel: false,
                    optional: true,
                    timeout_secs: Some(30),
                    retry: None,
                },
            ],
        }
    }

    // -----------------------------------------------------------------------
    // YAML roundtrip
    // -----------------------------------------------------------------------

    #[test]
    fn test_workflow_definition_yaml_roundtrip() {
        let original = sample_workflow();
        let yaml = serde_yaml_ng::to_string(&original).expect("serialize to YAML");

        assert!(yaml.contains("daily-digest"));
        assert!(yaml.contains("gather"));
        assert!(yaml.contains("agent: researcher"));

        let parsed: WorkflowDefinition =
            serde_yaml_ng::from_str(&yaml).expect("deserialize from YAML");
        assert_eq!(parsed.name, "daily-digest");
        assert_eq!(parsed.version, "1.0.0");
        assert_eq!(parsed.steps.len(), 3);
        assert_eq!(parsed.config.parallelism, 2);
        assert_eq!(parsed.steps[1].dependencies, vec!["gather"]);
    }

    #[test]
    fn test_workflow_definition_json_roundtrip() {
        let original = sample_workflow();
        let json_str = serde_json::to_string_pretty(&original).expect("serialize to JSON");
        let parsed: WorkflowDefinition =
            serde_json::from_str(&json_str).expect("deserialize from JSON");
        assert_eq!(parsed.name, original.name);
        assert_eq!(parsed.steps.len(), original.steps.len());
        assert_eq!(parsed.steps[2].optional, true);
    }

    // -----------------------------------------------------------------------
    // Defaults
    // -----------------------------------------------------------------------

    #[test]
    fn test_workflow_config_defaults() {
        let config = WorkflowConfig::default();
        assert_eq!(config.timeout_secs, 1800);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.checkpoint_interval_secs, 0);
        assert_eq!(config.parallelism, 4);
        assert!(!config.continue_on_error);
    }

    #[test]
    fn test_retry_policy_defaults() {
        let yaml = "{}";
        let policy: RetryPolicy = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.retry_delay_ms, 1000);
        assert_eq!(policy.retry_backoff_multiplier, 2.0);
    }

    #[test]
    fn test_step_definition_defaults() {
        let yaml = r#"
key: lone
agent: worker
prompt: do it
"#;
        let step: StepDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert!(step.dependencies.is_empty());
        assert!(step.parallel, "parallel defaults to true");
        assert!(!step.optional);
        assert!(step.timeout_secs.is_none());
        assert!(step.retry.is_none());
    }

    // -----------------------------------------------------------------------
    // Realistic YAML parse
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_realistic_yaml_workflow() {
        let yaml = r#"
name: daily-digest
version: "1.0"
description: Gather news and summarize
config:
  timeout_secs: 900
  parallelism: 3
  continue_on_error: false
steps:
  - key: gather
    agent: researcher
    prompt: Find the top 5 AI news stories
    timeout_secs: 120
  - key: analyze
    agent: analyst
    prompt: "Analyze trends in: {{gather.articles}}"
    dependencies: [gather]
    retry:
      max_retries: 2
      retry_delay_ms: 250
  - key: archive
    agent: archivist
    prompt: "Store: {{analyze.summary}}"
    dependencies: [analyze]
    optional: true
"#;
        let wf: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(wf.name, "daily-digest");
        assert_eq!(wf.version, "1.0");
        assert_eq!(wf.config.timeout_secs, 900);
        assert_eq!(wf.config.parallelism, 3);
        assert_eq!(wf.steps.len(), 3);
        assert_eq!(wf.steps[1].dependencies, vec!["gather"]);
        assert_eq!(wf.steps[1].retry.as_ref().unwrap().max_retries, 2);
        assert_eq!(
            wf.steps[1].retry.as_ref().unwrap().retry_backoff_multiplier,
            2.0,
            "multiplier falls back to default"
        );
        assert!(wf.steps[2].optional);
    }

    #[test]
    fn test_step_lookup() {
        let wf = sample_workflow();
        assert!(wf.step("gather").is_some());
        assert_eq!(wf.step("analyze").unwrap().agent, "analyst");
        assert!(wf.step("missing").is_none());
    }
}
