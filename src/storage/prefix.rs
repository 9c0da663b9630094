//! File prefix templating.
//!
//! Prefixes are format strings resolved against the run start, e.g.
//! `{start[scan_id]}-{start[sample]}` or the shorthand `{scan_id}`. Literal
//! braces are written doubled (`{{`, `}}`).

use crate::document::RunStart;
use crate::error::{SpecError, SpecResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

#[allow(clippy::expect_used)]
static TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{|\}\}|\{(?:start\[([A-Za-z0-9_]+)\]|([A-Za-z0-9_]+))\}|[{}]")
        .expect("file prefix token pattern is valid")
});

/// Resolve `template` against the fields of `start`.
pub fn resolve_prefix(template: &str, start: &RunStart) -> SpecResult<String> {
    let mut resolved = String::with_capacity(template.len());
    let mut last = 0;
    for caps in TOKEN.captures_iter(template) {
        let Some(token) = caps.get(0) else { continue };
        resolved.push_str(&template[last..token.start()]);
        last = token.end();

        match token.as_str() {
            "{{" => resolved.push('{'),
            "}}" => resolved.push('}'),
            _ => {
                let key = caps.get(1).or_else(|| caps.get(2)).ok_or_else(|| {
                    SpecError::Template(format!(
                        "unbalanced brace at offset {} in '{template}'",
                        token.start()
                    ))
                })?;
                let value = start.field(key.as_str()).ok_or_else(|| {
                    SpecError::Template(format!(
                        "run start has no field '{}' (template '{template}')",
                        key.as_str()
                    ))
                })?;
                resolved.push_str(&render(&value));
            }
        }
    }
    resolved.push_str(&template[last..]);
    Ok(resolved)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
