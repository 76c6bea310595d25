//! Template rendering for step URLs, headers and bodies.
//!
//! Placeholders have the form `{section.key}`, addressing the task
//! context's sub-maps, e.g. `{click.id}`, `{conversion.amount}`,
//! `{custom.source}`. Unknown placeholders render empty; braces that do
//! not form a placeholder pass through untouched.

use serde_json::Value;

use afftok_types::TaskContext;

/// Render one template against the task context.
pub fn render(template: &str, ctx: &TaskContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let path = &after[..close];
        if is_placeholder(path) {
            // Known placeholder shape; unresolvable paths render empty.
            if let Some(value) = ctx.lookup(path) {
                out.push_str(&value_to_string(value));
            }
            rest = &after[close + 1..];
        } else if let Some(inner) = path.find('{') {
            // A literal '{' with another candidate opening inside it
            // (JSON bodies). Emit up to the inner brace and rescan.
            out.push('{');
            out.push_str(&path[..inner]);
            rest = &after[inner..];
        } else {
            out.push('{');
            out.push_str(path);
            out.push('}');
            rest = &after[close + 1..];
        }
    }
    out.push_str(rest);
    out
}

fn is_placeholder(path: &str) -> bool {
    path.contains('.')
        && !path.is_empty()
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
