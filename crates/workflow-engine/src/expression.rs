//! Condition expressions
//!
//! The minimal `LHS OP RHS` grammar used by condition and decision nodes
//! and by condition-bearing edges. Operands are variable references
//! (`{{var.path}}` or a bare dotted path) or literals; the operator is one
//! of `==`, `!=`, `>`, `>=`, `<`, `<=`, `contains`.

use crate::interpolate::resolve_path;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

#[derive(Debug, Clone)]
pub struct Expression {
    pub lhs: Operand,
    pub op: Operator,
    pub rhs: Operand,
}

#[derive(Debug, Clone)]
pub enum Operand {
    /// `{{path}}` or a bare path that is not a literal.
    Reference(String),
    Literal(Value),
}

/// Parse `LHS OP RHS`. Operators are matched longest-first so `>=` is not
/// read as `>`.
pub fn parse(expression: &str) -> Result<Expression, String> {
    const OPERATORS: [(&str, Operator); 7] = [
        (" contains ", Operator::Contains),
        (">=", Operator::Ge),
        ("<=", Operator::Le),
        ("==", Operator::Eq),
        ("!=", Operator::Ne),
        (">", Operator::Gt),
        ("<", Operator::Lt),
    ];

    for (symbol, op) in OPERATORS {
        if let Some(index) = expression.find(symbol) {
            let lhs = expression[..index].trim();
            let rhs = expression[index + symbol.len()..].trim();
            if lhs.is_empty() || rhs.is_empty() {
                return Err(format!("incomplete expression: {}", expression));
            }
            return Ok(Expression {
                lhs: parse_operand(lhs),
                op,
                rhs: parse_operand(rhs),
            });
        }
    }
    Err(format!("no operator in expression: {}", expression))
}

fn parse_operand(token: &str) -> Operand {
    if token.starts_with("{{") && token.ends_with("}}") {
        return Operand::Reference(token[2..token.len() - 2].trim().to_string());
    }
    if let Some(literal) = parse_literal(token) {
        return Operand::Literal(literal);
    }
    // A bare dotted name reads as a reference; an unresolvable reference
    // falls back to its text at evaluation time.
    Operand::Reference(token.to_string())
}

fn parse_literal(token: &str) -> Option<Value> {
    match token {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        "null" => return Some(Value::Null),
        _ => {}
    }
    if (token.starts_with('"') && token.ends_with('"') && token.len() >= 2)
        || (token.starts_with('\'') && token.ends_with('\'') && token.len() >= 2)
    {
        return Some(Value::String(token[1..token.len() - 1].to_string()));
    }
    if let Ok(number) = token.parse::<f64>() {
        return serde_json::Number::from_f64(number).map(Value::Number);
    }
    None
}

/// Evaluate the expression against the execution's variables.
pub fn evaluate(
    expression: &str,
    variables: &serde_json::Map<String, Value>,
) -> Result<bool, String> {
    let parsed = parse(expression)?;
    let lhs = resolve_operand(&parsed.lhs, variables);
    let rhs = resolve_operand(&parsed.rhs, variables);
    Ok(compare(parsed.op, &lhs, &rhs))
}

fn resolve_operand(operand: &Operand, variables: &serde_json::Map<String, Value>) -> Value {
    match operand {
        Operand::Literal(value) => value.clone(),
        Operand::Reference(path) => resolve_path(variables, path)
            .unwrap_or_else(|| Value::String(path.clone())),
    }
}

fn compare(op: Operator, lhs: &Value, rhs: &Value) -> bool {
    match op {
        Operator::Eq => loose_eq(lhs, rhs),
        Operator::Ne => !loose_eq(lhs, rhs),
        Operator::Gt | Operator::Ge | Operator::Lt | Operator::Le => {
            match (as_number(lhs), as_number(rhs)) {
                (Some(l), Some(r)) => match op {
                    Operator::Gt => l > r,
                    Operator::Ge => l >= r,
                    Operator::Lt => l < r,
                    Operator::Le => l <= r,
                    _ => unreachable!(),
                },
                _ => {
                    let (l, r) = (as_string(lhs), as_string(rhs));
                    match op {
                        Operator::Gt => l > r,
                        Operator::Ge => l >= r,
                        Operator::Lt => l < r,
                        Operator::Le => l <= r,
                        _ => unreachable!(),
                    }
                }
            }
        }
        Operator::Contains => match lhs {
            Value::String(s) => s.contains(&as_string(rhs)),
            Value::Array(items) => items.iter().any(|item| loose_eq(item, rhs)),
            Value::Object(map) => map.contains_key(&as_string(rhs)),
            _ => false,
        },
    }
}

/// Equality across the string/number/bool representations the template
/// layer produces.
fn loose_eq(lhs: &Value, rhs: &Value) -> bool {
    if lhs == rhs {
        return true;
    }
    if let (Some(l), Some(r)) = (as_number(lhs), as_number(rhs)) {
        return l == r;
    }
    as_string(lhs) == as_string(rhs)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn variables() -> serde_json::Map<String, Value> {
        match json!({
            "input": {"count": 5, "tags": ["alpha", "beta"], "title": "Hello World"},
            "check": {"result": true},
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn numeric_comparisons() {
        let vars = variables();
        assert!(!evaluate("{{input.count}} > 10", &vars).unwrap());
        assert!(evaluate("{{input.count}} <= 5", &vars).unwrap());
        assert!(evaluate("{{input.count}} >= 5", &vars).unwrap());
        assert!(evaluate("{{input.count}} != 7", &vars).unwrap());
    }

    #[test]
    fn bare_references_work_like_braced_ones() {
        let vars = variables();
        assert!(evaluate("check.result == true", &vars).unwrap());
        assert!(evaluate("input.count < 10", &vars).unwrap());
    }

    #[test]
    fn string_equality_and_contains() {
        let vars = variables();
        assert!(evaluate("{{input.title}} contains \"World\"", &vars).unwrap());
        assert!(evaluate("{{input.tags}} contains \"alpha\"", &vars).unwrap());
        assert!(!evaluate("{{input.tags}} contains \"gamma\"", &vars).unwrap());
        assert!(evaluate("{{input.title}} == \"Hello World\"", &vars).unwrap());
    }

    #[test]
    fn number_and_string_forms_compare_equal() {
        let vars = variables();
        assert!(evaluate("{{input.count}} == \"5\"", &vars).unwrap());
    }

    #[test]
    fn missing_reference_falls_back_to_text() {
        let vars = variables();
        assert!(!evaluate("{{absent.path}} == true", &vars).unwrap());
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        let vars = variables();
        assert!(evaluate("no operator here", &vars).is_err());
        assert!(evaluate("== 5", &vars).is_err());
    }

    #[test]
    fn longest_operator_wins() {
        let parsed = parse("{{a}} >= 3").unwrap();
        assert_eq!(parsed.op, Operator::Ge);
    }
}
