//! Execution context: step outputs, variables, and prompt templating.
//!
//! The context is the single shared data surface of a run. Step outputs are
//! written by the engine after each step completes and read by later steps
//! through `{{step.path}}` placeholders in their prompts. Size limits bound
//! the memory a runaway step can pin.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::definition::WorkflowError;

/// Maximum serialized size of a single step output (1 MiB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1024 * 1024;

/// Maximum serialized size of the whole context (10 MiB).
pub const MAX_CONTEXT_SIZE: usize = 10 * 1024 * 1024;

/// Shared data surface of a single workflow run.
///
/// Serializable so it can be checkpointed and restored verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// The execution this context belongs to.
    pub execution_id: Uuid,
    /// Name of the workflow being executed.
    pub workflow_name: String,
    /// Outputs of completed steps, keyed by step key.
    pub step_outputs: HashMap<String, Value>,
    /// Caller-supplied variables, available under the `vars` namespace.
    pub variables: HashMap<String, Value>,
    /// Payload of the event that triggered this run, available under the
    /// `trigger` namespace.
    pub trigger_payload: Option<Value>,
}

impl ExecutionContext {
    pub fn new(execution_id: Uuid, workflow_name: impl Into<String>) -> Self {
        Self {
            execution_id,
            workflow_name: workflow_name.into(),
            step_outputs: HashMap::new(),
            variables: HashMap::new(),
            trigger_payload: None,
        }
    }

    /// Record a step's output, enforcing per-output and whole-context limits.
    pub fn set_step_output(&mut self, step_key: &str, output: Value) -> Result<(), WorkflowError> {
        let output_size = serde_json::to_string(&output)
            .map(|s| s.len())
            .unwrap_or(0);
        if output_size > MAX_STEP_OUTPUT_SIZE {
            return Err(WorkflowError::Execution(format!(
                "output of step '{step_key}' is {output_size} bytes, exceeds limit of {MAX_STEP_OUTPUT_SIZE}"
            )));
        }

        self.step_outputs.insert(step_key.to_string(), output);

        let total = serde_json::to_string(&self).map(|s| s.len()).unwrap_or(0);
        if total > MAX_CONTEXT_SIZE {
            self.step_outputs.remove(step_key);
            return Err(WorkflowError::Execution(format!(
                "context would grow to {total} bytes, exceeds limit of {MAX_CONTEXT_SIZE}"
            )));
        }
        Ok(())
    }

    /// The output of a completed step, if present.
    pub fn step_output(&self, step_key: &str) -> Option<&Value> {
        self.step_outputs.get(step_key)
    }

    /// Render a prompt template by substituting every `{{path}}` placeholder.
    ///
    /// Paths are dotted: the first segment selects the namespace (a step key,
    /// `trigger`, or `vars`) and the rest traverses into the JSON value.
    /// Any placeholder that does not resolve is an error; a template never
    /// renders with raw `{{...}}` markers left in place.
    pub fn render_template(&self, template: &str) -> Result<String, WorkflowError> {
        let mut rendered = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            rendered.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                return Err(WorkflowError::Template(format!(
                    "unterminated placeholder in template: {:?}",
                    &rest[start..]
                )));
            };
            let path = after[..end].trim();
            let value = self.resolve_path(path).ok_or_else(|| {
                WorkflowError::Template(format!("unresolved placeholder '{{{{{path}}}}}'"))
            })?;
            rendered.push_str(&value_to_text(&value));
            rest = &after[end + 2..];
        }
        rendered.push_str(rest);
        Ok(rendered)
    }

    /// Resolve a dotted path against the context namespaces.
    pub fn resolve_path(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let namespace = segments.next()?;

        let root: &Value = match namespace {
            "trigger" => self.trigger_payload.as_ref()?,
            "vars" => {
                let key = segments.next()?;
                let value = self.variables.get(key)?;
                return traverse(value, segments).cloned();
            }
            step_key => self.step_outputs.get(step_key)?,
        };
        traverse(root, segments).cloned()
    }
}

fn traverse<'a>(
    mut value: &'a Value,
    segments: impl Iterator<Item = &'a str>,
) -> Option<&'a Value> {
    for segment in segments {
        value = match value {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

/// Text rendering for substituted values. Strings substitute bare, without
/// surrounding quotes; everything else renders as compact JSON.
fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
