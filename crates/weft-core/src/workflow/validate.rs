//! Advisory workflow validation.
//!
//! Unlike the fail-fast path in `definition`, this module returns the full
//! list of issues found so callers (editors, CLIs) can surface all problems
//! at once instead of one at a time.

use std::collections::HashSet;
use std::fmt;

use weft_types::workflow::WorkflowDefinition;

use super::definition::WorkflowError;
use super::graph::DependencyGraph;

/// A single validation finding, optionally tied to a step.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue {
    /// The step this issue belongs to, if any.
    pub step_key: Option<String>,
    /// Human-readable description of the problem.
    pub message: String,
}

impl ValidationIssue {
    fn workflow(message: impl Into<String>) -> Self {
        Self {
            step_key: None,
            message: message.into(),
        }
    }

    fn step(key: &str, message: impl Into<String>) -> Self {
        Self {
            step_key: Some(key.to_string()),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step_key {
            Some(key) => write!(f, "step '{key}': {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Namespaces a prompt placeholder may reference besides step outputs.
const BUILTIN_NAMESPACES: &[&str] = &["trigger", "vars"];

/// Validate a workflow definition, returning every issue found.
///
/// An empty result means the workflow is structurally valid and its
/// dependency graph is acyclic.
pub fn validate_workflow(def: &WorkflowDefinition) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if def.name.trim().is_empty() {
        issues.push(ValidationIssue::workflow("workflow name must not be empty"));
    }
    if def.version.trim().is_empty() {
        issues.push(ValidationIssue::workflow(
            "workflow version must not be empty",
        ));
    }
    if def.steps.is_empty() {
        issues.push(ValidationIssue::workflow(
            "workflow must declare at least one step",
        ));
    }
    if def.config.timeout_secs == 0 {
        issues.push(ValidationIssue::workflow(
            "config.timeout_secs must be greater than zero",
        ));
    }
    if def.config.parallelism == 0 {
        issues.push(ValidationIssue::workflow(
            "config.parallelism must be greater than zero",
        ));
    }

    // Step-level checks. Duplicate keys make the graph ambiguous, so graph
    // checks are skipped when any are found.
    let mut seen_keys = HashSet::new();
    let mut has_duplicates = false;
    for step in &def.steps {
        if step.key.trim().is_empty() {
            issues.push(ValidationIssue::workflow("step key must not be empty"));
        }
        if !seen_keys.insert(step.key.as_str()) {
            issues.push(ValidationIssue::step(
                &step.key,
                format!("duplicate step key '{}'", step.key),
            ));
            has_duplicates = true;
        }
        if step.agent.trim().is_empty() {
            issues.push(ValidationIssue::step(&step.key, "agent must not be empty"));
        }
        if step.prompt.trim().is_empty() {
            issues.push(ValidationIssue::step(&step.key, "prompt must not be empty"));
        }
        if let Some(0) = step.timeout_secs {
            issues.push(ValidationIssue::step(
                &step.key,
                "timeout_secs must be greater than zero",
            ));
        }
        for dep in &step.dependencies {
            if dep == &step.key {
                issues.push(ValidationIssue::step(
                    &step.key,
                    format!("step '{}' depends on itself", step.key),
                ));
            }
        }
    }

    let declared: HashSet<&str> = def.steps.iter().map(|s| s.key.as_str()).collect();

    for step in &def.steps {
        for dep in &step.dependencies {
            if dep != &step.key && !declared.contains(dep.as_str()) {
                issues.push(ValidationIssue::step(
                    &step.key,
                    format!("depends on unknown step '{dep}'"),
                ));
            }
        }
        for namespace in placeholder_namespaces(&step.prompt) {
            if !declared.contains(namespace.as_str())
                && !BUILTIN_NAMESPACES.contains(&namespace.as_str())
            {
                issues.push(ValidationIssue::step(
                    &step.key,
                    format!("prompt references unknown step '{namespace}' in placeholder"),
                ));
            }
        }
    }

    // Cycle check only makes sense on an otherwise well-formed graph.
    let graph_checkable = !has_duplicates
        && !issues
            .iter()
            .any(|i| i.message.contains("unknown step") && !i.message.contains("placeholder"));
    if graph_checkable && !def.steps.is_empty() {
        if let Err(WorkflowError::Cycle { path }) = DependencyGraph::build(def) {
            issues.push(ValidationIssue::workflow(format!(
                "dependency cycle detected: {path}"
            )));
        }
    }

    issues
}

/// Extract the leading namespace of each `{{path}}` placeholder in a prompt.
///
/// `{{gather.articles}}` yields `gather`; `{{trigger}}` yields `trigger`.
fn placeholder_namespaces(prompt: &str) -> Vec<String> {
    let mut namespaces = Vec::new();
    let mut rest = prompt;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else { break };
        let path = after[..end].trim();
        if !path.is_empty() {
            let namespace = path.split('.').next().unwrap_or(path);
            namespaces.push(namespace.to_string());
        }
        rest = &after[end + 2..];
    }
    namespaces
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::workflow::{StepDefinition, WorkflowConfig};

    fn workflow(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            name: "wf".to_string(),
            version: "1.0".to_string(),
            description: None,
            author: None,
            tags: vec![],
            config: WorkflowConfig::default(),
            steps,
        }
    }

    fn step(key: &str, prompt: &str, deps: Vec<&str>) -> StepDefinition {
        StepDefinition {
            key: key.to_string(),
            agent: "agent".to_string(),
            prompt: prompt.to_string(),
            dependencies: deps.into_iter().map(String::from).collect(),
            parallel: true,
            optional: false,
            timeout_secs: None,
            retry: None,
        }
    }

    #[test]
    fn test_valid_workflow_has_no_issues() {
        let def = workflow(vec![
            step("a", "go", vec![]),
            step("b", "use {{a.result}}", vec!["a"]),
        ]);
        assert!(validate_workflow(&def).is_empty());
    }

    #[test]
    fn test_empty_name_flagged() {
        let mut def = workflow(vec![step("a", "go", vec![])]);
        def.name = "  ".to_string();
        let issues = validate_workflow(&def);
        assert!(issues.iter().any(|i| i.message.contains("name")));
    }

    #[test]
    fn test_no_steps_flagged() {
        let def = workflow(vec![]);
        let issues = validate_workflow(&def);
        assert!(issues.iter().any(|i| i.message.contains("at least one step")));
    }

    #[test]
    fn test_duplicate_keys_flagged() {
        let def = workflow(vec![step("a", "one", vec![]), step("a", "two", vec![])]);
        let issues = validate_workflow(&def);
        assert!(issues.iter().any(|i| i.message.contains("duplicate step key")));
    }

    #[test]
    fn test_self_dependency_flagged() {
        let def = workflow(vec![step("a", "go", vec!["a"])]);
        let issues = validate_workflow(&def);
        assert!(issues.iter().any(|i| i.message.contains("depends on itself")));
    }

    #[test]
    fn test_dangling_dependency_flagged() {
        let def = workflow(vec![step("a", "go", vec!["ghost"])]);
        let issues = validate_workflow(&def);
        assert!(
            issues
                .iter()
                .any(|i| i.message.contains("unknown step 'ghost'"))
        );
    }

    #[test]
    fn test_cycle_reported_with_path() {
        let def = workflow(vec![
            step("x", "go", vec!["y"]),
            step("y", "go", vec!["x"]),
        ]);
        let issues = validate_workflow(&def);
        let cycle = issues
            .iter()
            .find(|i| i.message.contains("cycle"))
            .expect("cycle issue");
        assert!(cycle.message.contains("->"), "got: {}", cycle.message);
    }

    #[test]
    fn test_unknown_placeholder_namespace_flagged() {
        let def = workflow(vec![step("a", "use {{phantom.output}}", vec![])]);
        let issues = validate_workflow(&def);
        assert!(issues.iter().any(|i| i.message.contains("placeholder")));
    }

    #[test]
    fn test_builtin_namespaces_allowed() {
        let def = workflow(vec![step(
            "a",
            "topic {{trigger.topic}} and {{vars.tone}}",
            vec![],
        )]);
        assert!(validate_workflow(&def).is_empty());
    }

    #[test]
    fn test_zero_parallelism_flagged() {
        let mut def = workflow(vec![step("a", "go", vec![])]);
        def.config.parallelism = 0;
        let issues = validate_workflow(&def);
        assert!(issues.iter().any(|i| i.message.contains("parallelism")));
    }

    #[test]
    fn test_zero_step_timeout_flagged() {
        let mut def = workflow(vec![step("a", "go", vec![])]);
        def.steps[0].timeout_secs = Some(0);
        let issues = validate_workflow(&def);
        assert!(issues.iter().any(|i| i.message.contains("timeout_secs")));
    }

    #[test]
    fn test_multiple_issues_all_reported() {
        let mut def = workflow(vec![
            step("a", "go", vec!["missing"]),
            step("a", "", vec![]),
        ]);
        def.name = String::new();
        let issues = validate_workflow(&def);
        assert!(issues.len() >= 3, "got: {issues:?}");
    }

    #[test]
    fn test_display_includes_step_key() {
        let issue = ValidationIssue::step("gather", "prompt must not be empty");
        assert_eq!(issue.to_string(), "step 'gather': prompt must not be empty");
    }
}
