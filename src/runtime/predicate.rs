use evalexpr::{
    build_operator_tree, ContextWithMutableVariables, DefaultNumericTypes, HashMapContext,
    Node as EvalNode,
};
use serde_json::{json, Map, Value};
use tracing::warn;

/// A flow predicate compiled once at load time.
#[derive(Debug, Clone)]
pub struct Predicate {
    raw: String,
    tree: EvalNode<DefaultNumericTypes>,
}

impl Predicate {
    /// Accepts `x > 10`, `${x} > 10` and `${x > 10}`.
    pub fn compile(raw: &str) -> Result<Self, String> {
        let clean = strip_placeholders(raw);
        let tree = build_operator_tree::<DefaultNumericTypes>(&clean).map_err(|e| e.to_string())?;
        Ok(Self { raw: clean, tree })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Evaluation errors (unknown variable, non-boolean result) count as `false`.
    pub fn evaluate(&self, data: &Map<String, Value>) -> bool {
        let ctx = eval_context(data);
        self.tree.eval_boolean_with_context(&ctx).unwrap_or_else(|e| {
            warn!(predicate = %self.raw, error = %e, "predicate evaluation failed");
            false
        })
    }
}

/// Drops `${...}` placeholder syntax, either wrapping the whole expression
/// or around a single variable name. Braces inside string literals stay.
fn strip_placeholders(raw: &str) -> String {
    let trimmed = raw.trim();
    let body = match trimmed.strip_prefix("${").and_then(|r| r.strip_suffix('}')) {
        // `${x} > ${y}` starts and ends like a wrapper but is not one
        Some(body) if !has_unquoted_brace(body) => body.trim(),
        _ => trimmed,
    };
    unwrap_variables(body)
}

fn has_unquoted_brace(expr: &str) -> bool {
    let mut in_string = false;
    let mut escaped = false;
    for c in expr.chars() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' | '}' if !in_string => return true,
            _ => {}
        }
    }
    false
}

/// `${name}` outside string literals becomes `name`.
fn unwrap_variables(expr: &str) -> String {
    let mut out = String::with_capacity(expr.len());
    let mut rest = expr;
    let mut in_string = false;
    let mut escaped = false;
    while let Some(c) = rest.chars().next() {
        if !in_string {
            if let Some(after) = rest.strip_prefix("${") {
                if let Some(end) = after.find('}') {
                    let name = &after[..end];
                    if !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.') {
                        out.push_str(name);
                        rest = &after[end + 1..];
                        continue;
                    }
                }
            }
        }
        match c {
            _ if escaped => escaped = false,
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            _ => {}
        }
        out.push(c);
        rest = &rest[c.len_utf8()..];
    }
    out
}

/// Builds an evalexpr context from the scalar entries of a data map.
/// Objects, arrays and nulls are not visible to expressions.
pub fn eval_context(data: &Map<String, Value>) -> HashMapContext<DefaultNumericTypes> {
    let mut ctx = HashMapContext::<DefaultNumericTypes>::new();
    for (k, v) in data {
        if let Some(ev) = to_eval_value(v) {
            let _ = ctx.set_value(k.clone(), ev);
        }
    }
    ctx
}

fn to_eval_value(v: &Value) -> Option<evalexpr::Value<DefaultNumericTypes>> {
    match v {
        Value::String(s) => Some(evalexpr::Value::String(s.clone())),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(evalexpr::Value::Int(i))
            } else {
                n.as_f64().map(evalexpr::Value::Float)
            }
        }
        Value::Bool(b) => Some(evalexpr::Value::Boolean(*b)),
        _ => None,
    }
}

pub fn to_json_value(v: evalexpr::Value<DefaultNumericTypes>) -> Option<Value> {
    match v {
        evalexpr::Value::String(s) => Some(Value::String(s)),
        evalexpr::Value::Int(i) => Some(json!(i)),
        evalexpr::Value::Float(f) => Some(json!(f)),
        evalexpr::Value::Boolean(b) => Some(Value::Bool(b)),
        evalexpr::Value::Empty => Some(Value::Null),
        _ => None,
    }
}
