//! Variable interpolation
//!
//! Replaces `{{name}}`, `{{node_id.result}}` and `{{node_id.result.field}}`
//! references with values from the execution's variables, using a strict
//! path resolver. A missing reference fails only when the node's
//! validation rules list it as required; otherwise it becomes the empty
//! string.

use serde_json::Value;

/// Resolve a dotted path against the variables map.
///
/// The first segment names a variable; the rest index into objects (or
/// arrays by number). `result` as the second segment falls back to the
/// node output itself when the output has no `result` field, so
/// `{{node.result}}` works for nodes whose output is a plain value.
pub fn resolve_path(
    variables: &serde_json::Map<String, Value>,
    path: &str,
) -> Option<Value> {
    let mut segments = path.split('.');
    let root = segments.next()?;
    let mut current = variables.get(root)?.clone();

    for (index, segment) in segments.enumerate() {
        let next = match &current {
            Value::Object(map) => map.get(segment).cloned(),
            Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i).cloned()),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            // `result` aliases the output root for plain-value outputs.
            None if index == 0 && segment == "result" => {}
            None => return None,
        }
    }
    Some(current)
}

/// Render a resolved value into a template string.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Interpolate every `{{ref}}` occurrence in `template`.
///
/// Returns the missing reference name when a required reference does not
/// resolve.
pub fn interpolate(
    template: &str,
    variables: &serde_json::Map<String, Value>,
    required: &[String],
) -> Result<String, String> {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let reference = after[..end].trim();
                match resolve_path(variables, reference) {
                    Some(value) => output.push_str(&value_to_string(&value)),
                    None => {
                        if required.iter().any(|r| r == reference) {
                            return Err(reference.to_string());
                        }
                        // Unrequired misses substitute empty.
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated braces pass through verbatim.
                output.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    output.push_str(rest);
    Ok(output)
}

/// Interpolate every string inside a JSON value, in place of templates in
/// request bodies and headers.
pub fn interpolate_value(
    value: &Value,
    variables: &serde_json::Map<String, Value>,
    required: &[String],
) -> Result<Value, String> {
    match value {
        Value::String(template) => {
            // A string that is exactly one reference keeps its JSON type.
            let trimmed = template.trim();
            if trimmed.starts_with("{{") && trimmed.ends_with("}}") && !trimmed[2..].contains("{{")
            {
                let reference = trimmed[2..trimmed.len() - 2].trim();
                if let Some(resolved) = resolve_path(variables, reference) {
                    return Ok(resolved);
                }
                if required.iter().any(|r| r == reference) {
                    return Err(reference.to_string());
                }
                return Ok(Value::String(String::new()));
            }
            interpolate(template, variables, required).map(Value::String)
        }
        Value::Array(items) => items
            .iter()
            .map(|item| interpolate_value(item, variables, required))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut output = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                output.insert(key.clone(), interpolate_value(item, variables, required)?);
            }
            Ok(Value::Object(output))
        }
        other => Ok(other.clone()),
    }
}
