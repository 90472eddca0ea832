//! The skills executor (templated multi-step macro interpreter) and the
//! dispatcher that routes a resolved tool to either the executor or a
//! live upstream MCP client.

use std::collections::HashMap;
use std::sync::OnceLock;

use aggregator_core::{SkillStep, ToolRecord};
use aggregator_registry::ToolRegistry;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("tool not found: {tool}{}", server.as_ref().map(|s| format!(" on server {s}")).unwrap_or_default())]
    ToolNotFound { tool: String, server: Option<String> },
    #[error("tool execution failed: {0}")]
    Execution(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Dispatch `tool` (either an upstream tool or a skill) with `args` and
/// return its raw result unchanged.
pub async fn execute_tool(registry: &ToolRegistry, tool: &ToolRecord, args: Value) -> Result<Value> {
    if tool.is_skill {
        let steps = tool.steps.clone().unwrap_or_default();
        // Boxed to break the execute_tool <-> execute_skill recursion cycle.
        Box::pin(execute_skill(registry, &steps, args)).await
    } else {
        let arguments = args.as_object().cloned();
        let result = registry
            .call_upstream(&tool.server, &tool.name, arguments)
            .await
            .map_err(ExecutorError::Execution)?;
        serde_json::to_value(&result).map_err(|e| ExecutorError::Execution(e.into()))
    }
}

/// Run a skill's steps against a context seeded from `args` (never
/// mutating `args` itself) and return the final step's raw result.
pub async fn execute_skill(registry: &ToolRegistry, steps: &[SkillStep], args: Value) -> Result<Value> {
    let mut context: Map<String, Value> = args.as_object().cloned().unwrap_or_default();
    let mut last_result = Value::Null;

    for step in steps {
        let substituted_args = substitute(&step.args, &context);
        let tool = resolve_step_tool(registry, step).await?;
        let result = execute_tool(registry, &tool, substituted_args).await?;

        if let Some(result_var) = &step.result_var {
            context.insert(result_var.clone(), bind_result(&result));
        }
        last_result = result;
    }

    Ok(last_result)
}

async fn resolve_step_tool(registry: &ToolRegistry, step: &SkillStep) -> Result<ToolRecord> {
    if let Some(server) = &step.server {
        registry
            .get_tool(server, &step.tool)
            .await
            .ok_or_else(|| ExecutorError::ToolNotFound {
                tool: step.tool.clone(),
                server: Some(server.clone()),
            })
    } else {
        let mut matches = registry.find_by_name(&step.tool).await;
        if matches.is_empty() {
            return Err(ExecutorError::ToolNotFound {
                tool: step.tool.clone(),
                server: None,
            });
        }
        if matches.len() > 1 {
            warn!(
                "tool name '{}' is ambiguous across {} servers; using '{}'",
                step.tool,
                matches.len(),
                matches[0].server
            );
        }
        Ok(matches.swap_remove(0))
    }
}

/// Post-process a step's raw result before binding it into the context:
/// `{content: [{type: "text", text: ...}, ...]}` binds the bare text,
/// anything else binds the whole value.
fn bind_result(result: &Value) -> Value {
    if let Some(text) = result
        .as_object()
        .and_then(|obj| obj.get("content"))
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
        .filter(|first| first.get("type").and_then(|t| t.as_str()) == Some("text"))
        .and_then(|first| first.get("text"))
        .and_then(|t| t.as_str())
    {
        Value::String(text.to_string())
    } else {
        result.clone()
    }
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").unwrap())
}

/// Recursively substitute `{{var}}` placeholders throughout a JSON value.
pub fn substitute(value: &Value, context: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => substitute_string(s, context),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, context)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_string(s: &str, context: &Map<String, Value>) -> Value {
    if let Some(var_name) = whole_placeholder_variable(s) {
        if let Some(value) = context.get(&var_name) {
            return value.clone();
        }
    }

    let replaced = placeholder_regex().replace_all(s, |caps: &Captures| {
        let name = caps[1].trim();
        match context.get(name) {
            Some(value) => stringify(value),
            None => caps[0].to_string(),
        }
    });
    Value::String(replaced.into_owned())
}

/// If `s` is exactly one placeholder (`{{ ... }}` with no second `{{`
/// after position 2), return the trimmed variable name.
fn whole_placeholder_variable(s: &str) -> Option<String> {
    if !s.starts_with("{{") || !s.ends_with("}}") || s.len() < 4 {
        return None;
    }
    if s[2..].contains("{{") {
        return None;
    }
    Some(s[2..s.len() - 2].trim().to_string())
}

/// `String(value)` semantics: arrays join their stringified elements with
/// commas (no brackets, no spaces), matching JS's `Array.prototype.toString`.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        Value::Array(items) => items.iter().map(stringify).collect::<Vec<_>>().join(","),
        Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn whole_placeholder_preserves_array_type() {
        let context = ctx(&[("x", json!([1, 2]))]);
        let result = substitute(&json!("{{x}}"), &context);
        assert_eq!(result, json!([1, 2]));
    }

    #[test]
    fn textual_placeholder_stringifies_array_without_brackets() {
        let context = ctx(&[("x", json!([1, 2]))]);
        let result = substitute(&json!("a {{x}} b"), &context);
        assert_eq!(result, json!("a 1,2 b"));
    }

    #[test]
    fn partial_substitution_keeps_surrounding_text() {
        let context = ctx(&[("val", json!("Middle"))]);
        let result = substitute(&json!("Prefix {{val}} Suffix"), &context);
        assert_eq!(result, json!("Prefix Middle Suffix"));
    }

    #[test]
    fn undefined_variable_survives_literally() {
        let context = ctx(&[]);
        let result = substitute(&json!("hello {{missing}}"), &context);
        assert_eq!(result, json!("hello {{missing}}"));
    }

    #[test]
    fn substitution_recurses_into_nested_structures() {
        let context = ctx(&[("name", json!("Ada"))]);
        let input = json!({"greeting": "Hi {{name}}", "tags": ["{{name}}", "static"]});
        let result = substitute(&input, &context);
        assert_eq!(
            result,
            json!({"greeting": "Hi Ada", "tags": ["Ada", "static"]})
        );
    }

    #[test]
    fn bind_result_extracts_bare_text_from_content_array() {
        let result = json!({"content": [{"type": "text", "text": "Echo: Hello"}]});
        assert_eq!(bind_result(&result), json!("Echo: Hello"));
    }

    #[test]
    fn bind_result_passes_through_non_content_shapes() {
        let result = json!({"value": 42});
        assert_eq!(bind_result(&result), json!({"value": 42}));
    }

    #[tokio::test]
    async fn execute_skill_does_not_mutate_caller_args() {
        let registry = ToolRegistry::new();
        let args = json!({"input": "Hello"});
        let original = args.clone();
        let steps = vec![SkillStep {
            tool: "nonexistent_tool".to_string(),
            server: None,
            args: json!({"message": "{{input}}"}),
            result_var: None,
            description: None,
        }];
        let _ = execute_skill(&registry, &steps, args.clone()).await;
        assert_eq!(args, original);
    }

    #[tokio::test]
    async fn missing_tool_surfaces_tool_not_found() {
        let registry = ToolRegistry::new();
        let steps = vec![SkillStep {
            tool: "nonexistent".to_string(),
            server: None,
            args: json!({}),
            result_var: None,
            description: None,
        }];
        let err = execute_skill(&registry, &steps, json!({})).await.unwrap_err();
        assert!(matches!(err, ExecutorError::ToolNotFound { .. }));
    }
}
