//! Execution context and `${{ ... }}` expression rendering
//!
//! Expressions are paths (`workflow`, `head_ref`, `env.X`, `inputs.X`,
//! `steps.<id>.outputs.<key>`, `secrets.X`) or quoted literals, joined with
//! `||`; the first alternative with a non-empty value wins. Unknown paths
//! render as the empty string.

use crate::core::config::ConfigurationError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

fn expression_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{\{(.*?)\}\}").expect("expression pattern is valid"))
}

/// Bodies of the `${{ ... }}` expressions in a template, trimmed
pub fn expressions(template: &str) -> impl Iterator<Item = &str> {
    expression_pattern()
        .captures_iter(template)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
}

/// Split an expression into its `||` alternatives, validating each
pub fn parse_expression(expression: &str) -> Result<Vec<&str>, ConfigurationError> {
    let invalid = |reason: &str| ConfigurationError::InvalidExpression {
        expression: expression.to_string(),
        reason: reason.to_string(),
    };

    expression
        .split("||")
        .map(str::trim)
        .map(|alternative| {
            if alternative.is_empty() {
                return Err(invalid("empty alternative"));
            }
            if is_literal(alternative) {
                return Ok(alternative);
            }
            let valid_path = alternative.split('.').all(|segment| {
                !segment.is_empty()
                    && segment
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            });
            if valid_path {
                Ok(alternative)
            } else {
                Err(invalid("expected a dotted path or a quoted literal"))
            }
        })
        .collect()
}

/// Step id referenced by a `steps.<id>.outputs.<key>` path
pub fn referenced_step(path: &str) -> Option<&str> {
    let mut segments = path.split('.');
    match (segments.next(), segments.next(), segments.next()) {
        (Some("steps"), Some(id), Some("outputs")) => Some(id),
        _ => None,
    }
}

fn is_literal(alternative: &str) -> bool {
    alternative.len() >= 2 && alternative.starts_with('\'') && alternative.ends_with('\'')
}

/// Source of secret values for `secrets.X` paths
pub trait SecretResolver {
    fn resolve(&self, name: &str) -> Result<String, ConfigurationError>;
}

/// Resolver for contexts where secrets are never available
pub struct NoSecrets;

impl SecretResolver for NoSecrets {
    fn resolve(&self, name: &str) -> Result<String, ConfigurationError> {
        Err(ConfigurationError::MissingSecret(name.to_string()))
    }
}

/// Execution context for one job of a run
///
/// Each job owns its own context; nothing in here is shared between jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineContext {
    /// Run variables (`workflow`, `ref`, `head_ref`, `run_id`, `event_name`, ...)
    pub variables: HashMap<String, String>,

    /// Environment visible to `env.X`
    pub env: BTreeMap<String, String>,

    /// Parameters of the step being rendered, visible to `inputs.X`
    pub inputs: BTreeMap<String, String>,

    /// Outputs from completed steps (step_id -> key -> value)
    pub step_outputs: HashMap<String, BTreeMap<String, String>>,

    /// The current step being executed (if any)
    pub current_step_id: Option<String>,
}

impl PipelineContext {
    /// Create a new empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable
    pub fn set_variable(&mut self, key: &str, value: impl Into<String>) {
        self.variables.insert(key.to_string(), value.into());
    }

    /// Get a variable
    pub fn get_variable(&self, key: &str) -> Option<&String> {
        self.variables.get(key)
    }

    /// Record the outputs of a completed step
    pub fn set_step_outputs(&mut self, step_id: &str, outputs: BTreeMap<String, String>) {
        self.step_outputs.insert(step_id.to_string(), outputs);
    }

    /// Get one output of a step
    pub fn get_step_output(&self, step_id: &str, key: &str) -> Option<&String> {
        self.step_outputs.get(step_id).and_then(|o| o.get(key))
    }

    /// Render every expression in `template`
    pub fn render(
        &self,
        template: &str,
        secrets: &dyn SecretResolver,
    ) -> Result<String, ConfigurationError> {
        let mut rendered = String::with_capacity(template.len());
        let mut last = 0;

        for caps in expression_pattern().captures_iter(template) {
            let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            rendered.push_str(&template[last..whole.start()]);
            rendered.push_str(&self.evaluate(body.as_str().trim(), secrets)?);
            last = whole.end();
        }
        rendered.push_str(&template[last..]);

        Ok(rendered)
    }

    /// Evaluate one expression body; alternatives are tried lazily so a
    /// secret behind a non-empty alternative is never looked up.
    fn evaluate(
        &self,
        expression: &str,
        secrets: &dyn SecretResolver,
    ) -> Result<String, ConfigurationError> {
        for alternative in parse_expression(expression)? {
            let value = self.lookup(alternative, secrets)?;
            if !value.is_empty() {
                return Ok(value);
            }
        }
        Ok(String::new())
    }

    fn lookup(
        &self,
        path: &str,
        secrets: &dyn SecretResolver,
    ) -> Result<String, ConfigurationError> {
        if is_literal(path) {
            return Ok(path[1..path.len() - 1].to_string());
        }

        let value = match path.split_once('.') {
            Some(("secrets", name)) => return secrets.resolve(name),
            Some(("env", key)) => self.env.get(key).cloned(),
            Some(("inputs", key)) => self.inputs.get(key).cloned(),
            Some(("steps", rest)) => match rest.split('.').collect::<Vec<_>>().as_slice() {
                [id, "outputs", key] => self.get_step_output(id, key).cloned(),
                _ => None,
            },
            _ => self.variables.get(path).cloned(),
        };

        Ok(value.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct RecordingSecrets {
        values: HashMap<String, String>,
        looked_up: RefCell<Vec<String>>,
    }

    impl SecretResolver for RecordingSecrets {
        fn resolve(&self, name: &str) -> Result<String, ConfigurationError> {
            self.looked_up.borrow_mut().push(name.to_string());
            self.values
                .get(name)
                .cloned()
                .ok_or_else(|| ConfigurationError::MissingSecret(name.to_string()))
        }
    }

    fn ci_context() -> PipelineContext {
        let mut ctx = PipelineContext::new();
        ctx.set_variable("workflow", "CI");
        ctx.set_variable("run_id", "42");
        ctx.set_variable("head_ref", "");
        ctx
    }

    #[test]
    fn test_fallback_to_second_alternative() {
        let ctx = ci_context();
        let key = ctx
            .render("${{ workflow }}-${{ head_ref || run_id }}", &NoSecrets)
            .unwrap();
        assert_eq!(key, "CI-42");
    }

    #[test]
    fn test_first_non_empty_alternative_wins() {
        let mut ctx = ci_context();
        ctx.set_variable("head_ref", "fix-parser");
        let key = ctx
            .render("${{ workflow }}-${{ head_ref || run_id }}", &NoSecrets)
            .unwrap();
        assert_eq!(key, "CI-fix-parser");
    }

    #[test]
    fn test_step_outputs_and_inputs() {
        let mut ctx = ci_context();
        let mut outputs = BTreeMap::new();
        outputs.insert("version".to_string(), "1.2.3".to_string());
        ctx.set_step_outputs("meta", outputs);
        ctx.inputs.insert("toolchain".to_string(), "stable".to_string());

        let rendered = ctx
            .render(
                "rustup default ${{ inputs.toolchain }} && echo ${{steps.meta.outputs.version}}",
                &NoSecrets,
            )
            .unwrap();
        assert_eq!(rendered, "rustup default stable && echo 1.2.3");
    }

    #[test]
    fn test_unknown_paths_render_empty() {
        let ctx = ci_context();
        assert_eq!(ctx.render("[${{ github.sha }}]", &NoSecrets).unwrap(), "[]");
        assert_eq!(ctx.render("${{ env.MISSING || 'none' }}", &NoSecrets).unwrap(), "none");
    }

    #[test]
    fn test_secrets_are_resolved_lazily() {
        let ctx = ci_context();
        let secrets = RecordingSecrets {
            values: HashMap::from([("TOKEN".to_string(), "hunter2".to_string())]),
            looked_up: RefCell::new(Vec::new()),
        };

        assert_eq!(ctx.render("${{ run_id || secrets.TOKEN }}", &secrets).unwrap(), "42");
        assert!(secrets.looked_up.borrow().is_empty());

        assert_eq!(ctx.render("${{ secrets.TOKEN }}", &secrets).unwrap(), "hunter2");
        assert_eq!(*secrets.looked_up.borrow(), vec!["TOKEN".to_string()]);
    }

    #[test]
    fn test_missing_secret_is_configuration_error() {
        let ctx = ci_context();
        assert_eq!(
            ctx.render("token=${{ secrets.CARGO_REGISTRY_TOKEN }}", &NoSecrets),
            Err(ConfigurationError::MissingSecret("CARGO_REGISTRY_TOKEN".to_string()))
        );
    }

    #[test]
    fn test_parse_expression_rejects_garbage() {
        assert!(parse_expression("head_ref || ").is_err());
        assert!(parse_expression("a b").is_err());
        assert_eq!(parse_expression("a || 'x y'").unwrap(), vec!["a", "'x y'"]);
        assert_eq!(referenced_step("steps.meta.outputs.version"), Some("meta"));
        assert_eq!(referenced_step("env.HOME"), None);
    }
}
