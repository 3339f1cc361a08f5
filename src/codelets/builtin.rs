use anyhow::{anyhow, Result};
use async_trait::async_trait;
use evalexpr::{ContextWithMutableVariables, eval_with_context};
use serde_json::{Map, Value};
use tracing::info;

use crate::codelets::Codelet;
use crate::runtime::predicate::{eval_context, to_json_value};

/// Logs `msg` (or the whole input) and produces nothing.
#[derive(Debug)]
pub struct LogCodelet;

#[async_trait]
impl Codelet for LogCodelet {
    fn name(&self) -> &str {
        "log"
    }

    fn validate(&self, _params: &Value) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, params: Value, input: &Map<String, Value>) -> Result<Map<String, Value>> {
        if let Some(msg) = params.get("msg").and_then(|v| v.as_str()) {
            info!("[LOG] {}", msg);
        } else {
            info!("[LOG] {:?}", input);
        }
        Ok(Map::new())
    }
}

/// Sets output variables.
///
/// ```yaml
/// params:
///   assignments:
///     - { key: approved, value: true }
///   expressions:
///     - "total = price * quantity"
/// ```
///
/// Expressions see the input plus every earlier assignment.
#[derive(Debug)]
pub struct AssignCodelet;

impl AssignCodelet {
    fn split_assignment(expr: &str) -> Result<(&str, &str)> {
        // `==` is a comparison, not an assignment
        let pos = expr
            .char_indices()
            .find(|&(i, c)| {
                c == '='
                    && !expr[i + 1..].starts_with('=')
                    && !expr[..i].ends_with(['=', '!', '<', '>'])
            })
            .map(|(i, _)| i)
            .ok_or_else(|| anyhow!("'{}' is not of the form 'var = expr'", expr))?;
        let target = expr[..pos].trim();
        if target.is_empty() {
            return Err(anyhow!("'{}' has no target variable", expr));
        }
        Ok((target, expr[pos + 1..].trim()))
    }
}

#[async_trait]
impl Codelet for AssignCodelet {
    fn name(&self) -> &str {
        "assign"
    }

    fn validate(&self, params: &Value) -> Result<()> {
        if let Some(list) = params.get("expressions") {
            let list = list.as_array().ok_or_else(|| anyhow!("'expressions' must be a list"))?;
            for expr in list {
                let expr = expr.as_str().ok_or_else(|| anyhow!("expressions must be strings"))?;
                Self::split_assignment(expr)?;
            }
        }
        Ok(())
    }

    async fn execute(&self, params: Value, input: &Map<String, Value>) -> Result<Map<String, Value>> {
        let mut output = Map::new();

        if let Some(list) = params.get("assignments").and_then(|v| v.as_array()) {
            for item in list {
                if let (Some(k), Some(v)) = (item.get("key").and_then(|s| s.as_str()), item.get("value")) {
                    output.insert(k.to_string(), v.clone());
                }
            }
        }

        if let Some(list) = params.get("expressions").and_then(|v| v.as_array()) {
            let mut scope = input.clone();
            scope.extend(output.clone());
            let mut ctx = eval_context(&scope);

            for expr in list.iter().filter_map(|e| e.as_str()) {
                let (target, rhs) = Self::split_assignment(expr)?;
                let result = eval_with_context(rhs, &ctx)
                    .map_err(|e| anyhow!("expression '{}' failed: {}", rhs, e))?;
                let _ = ctx.set_value(target.to_string(), result.clone());
                let json = to_json_value(result)
                    .ok_or_else(|| anyhow!("expression '{}' produced an unsupported value", rhs))?;
                output.insert(target.to_string(), json);
            }
        }

        Ok(output)
    }
}
