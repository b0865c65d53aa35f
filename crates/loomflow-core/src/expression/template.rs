//! `{{ expr }}` interpolation for step payloads.
//!
//! A string that is exactly one template resolves to the typed result
//! (`"{{ state.items }}"` yields the array); anything else is rendered as
//! text with each template replaced by its display string.

use serde_json::{Map, Value};

use super::{Evaluator, ExpressionError};

/// Byte ranges of `{{ ... }}` segments: (outer start, outer end, inner expr).
fn segments(template: &str) -> Vec<(usize, usize, &str)> {
    let mut out = Vec::new();
    let mut cursor = 0;
    while let Some(open) = template[cursor..].find("{{") {
        let start = cursor + open;
        let Some(close) = template[start + 2..].find("}}") else {
            break;
        };
        let end = start + 2 + close + 2;
        out.push((start, end, template[start + 2..end - 2].trim()));
        cursor = end;
    }
    out
}

/// Expressions embedded in a template string, in order.
pub fn template_expressions(template: &str) -> Vec<&str> {
    segments(template).into_iter().map(|(_, _, e)| e).collect()
}

/// Resolve the templates in one string.
pub fn interpolate_str(
    template: &str,
    context: &Value,
    evaluator: &dyn Evaluator,
) -> Result<Value, ExpressionError> {
    let parts = segments(template);
    if parts.is_empty() {
        return Ok(Value::String(template.to_string()));
    }
    if let [(start, end, expr)] = parts.as_slice() {
        if template[..*start].trim().is_empty() && template[*end..].trim().is_empty() {
            return evaluator.evaluate_json(expr, context);
        }
    }
    let mut out = String::with_capacity(template.len());
    let mut cursor = 0;
    for (start, end, expr) in parts {
        out.push_str(&template[cursor..start]);
        out.push_str(&evaluator.evaluate(expr, context)?.to_display_string());
        cursor = end;
    }
    out.push_str(&template[cursor..]);
    Ok(Value::String(out))
}

/// Resolve every template inside a JSON value, recursing into containers.
pub fn interpolate_value(
    value: &Value,
    context: &Value,
    evaluator: &dyn Evaluator,
) -> Result<Value, ExpressionError> {
    match value {
        Value::String(s) => interpolate_str(s, context, evaluator),
        Value::Array(items) => items
            .iter()
            .map(|v| interpolate_value(v, context, evaluator))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), interpolate_value(v, context, evaluator)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::ExpressionEngine;
    use serde_json::json;

    fn ctx() -> Value {
        json!({"state": {"items": [1, 2], "name": "loom", "n": 3}})
    }

    #[test]
    fn test_whole_template_keeps_type() {
        let engine = ExpressionEngine::new();
        assert_eq!(
            interpolate_str("{{ state.items }}", &ctx(), &engine).unwrap(),
            json!([1, 2])
        );
        assert_eq!(
            interpolate_str("  {{state.n * 2}} ", &ctx(), &engine).unwrap(),
            json!(6)
        );
    }

    #[test]
    fn test_mixed_template_renders_text() {
        let engine = ExpressionEngine::new();
        assert_eq!(
            interpolate_str("hello {{ state.name }} x{{ state.n }}", &ctx(), &engine).unwrap(),
            json!("hello loom x3")
        );
        assert_eq!(
            interpolate_str("missing: [{{ state.nope }}]", &ctx(), &engine).unwrap(),
            json!("missing: []")
        );
    }

    #[test]
    fn test_plain_and_unclosed_strings_untouched() {
        let engine = ExpressionEngine::new();
        assert_eq!(interpolate_str("plain", &ctx(), &engine).unwrap(), json!("plain"));
        assert_eq!(interpolate_str("{{ open", &ctx(), &engine).unwrap(), json!("{{ open"));
    }

    #[test]
    fn test_interpolate_nested_value() {
        let engine = ExpressionEngine::new();
        let payload = json!({"args": ["{{ state.name }}", 5], "count": "{{ state.n }}"});
        assert_eq!(
            interpolate_value(&payload, &ctx(), &engine).unwrap(),
            json!({"args": ["loom", 5], "count": 3})
        );
    }

    #[test]
    fn test_template_expressions() {
        assert_eq!(
            template_expressions("{{ a }} and {{b.c}}"),
            vec!["a", "b.c"]
        );
    }

    #[test]
    fn test_bad_expression_propagates() {
        let engine = ExpressionEngine::new();
        assert!(interpolate_str("x {{ 1 + }}", &ctx(), &engine).is_err());
    }
}
