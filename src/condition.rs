//! Condition evaluator: `when`, `if`, `unless`.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::context::Context;

/// `when` enum with three outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum When {
    OnSuccess,
    OnFailure,
    Always,
}

impl Default for When {
    fn default() -> Self {
        When::OnSuccess
    }
}

impl When {
    pub fn evaluate(self, ctx: &Context) -> bool {
        match self {
            When::OnSuccess => !ctx.any_step_failed(),
            When::OnFailure => ctx.any_step_failed(),
            When::Always => true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    #[error("invalid condition: {0}")]
    InvalidExpression(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
    Matches,
}

/// Parses and evaluates the minimal `<lhs> <op> <rhs>` grammar.
///
/// `lhs`/`rhs` are interpolated strings or numeric literals; `matches`
/// treats rhs as a regex applied to lhs.
pub fn evaluate_expression(expr: &str, ctx: &Context) -> Result<bool, ConditionError> {
    let (lhs_raw, op, rhs_raw) = parse(expr)?;
    let lhs = ctx.interpolate(lhs_raw.trim());
    let rhs = ctx.interpolate(rhs_raw.trim());

    let result = match op {
        Op::Matches => {
            let re = Regex::new(&rhs)
                .map_err(|e| ConditionError::InvalidExpression(format!("bad regex: {e}")))?;
            re.is_match(&lhs)
        }
        Op::Eq => compare_values(&lhs, &rhs) == Some(std::cmp::Ordering::Equal),
        Op::Ne => compare_values(&lhs, &rhs) != Some(std::cmp::Ordering::Equal),
        Op::Ge => matches!(
            compare_values(&lhs, &rhs),
            Some(std::cmp::Ordering::Greater) | Some(std::cmp::Ordering::Equal)
        ),
        Op::Le => matches!(
            compare_values(&lhs, &rhs),
            Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal)
        ),
        Op::Gt => compare_values(&lhs, &rhs) == Some(std::cmp::Ordering::Greater),
        Op::Lt => compare_values(&lhs, &rhs) == Some(std::cmp::Ordering::Less),
    };

    Ok(result)
}

fn compare_values(lhs: &str, rhs: &str) -> Option<std::cmp::Ordering> {
    let stripped_lhs = lhs.trim_matches('"');
    let stripped_rhs = rhs.trim_matches('"');
    if let (Ok(l), Ok(r)) = (stripped_lhs.parse::<f64>(), stripped_rhs.parse::<f64>()) {
        return l.partial_cmp(&r);
    }
    Some(stripped_lhs.cmp(stripped_rhs))
}

fn parse(expr: &str) -> Result<(&str, Op, &str), ConditionError> {
    const OPERATORS: &[(&str, Op)] = &[
        ("==", Op::Eq),
        ("!=", Op::Ne),
        (">=", Op::Ge),
        ("<=", Op::Le),
        (">", Op::Gt),
        ("<", Op::Lt),
        ("matches", Op::Matches),
    ];

    for (token, op) in OPERATORS {
        if let Some(idx) = expr.find(token) {
            let lhs = &expr[..idx];
            let rhs = &expr[idx + token.len()..];
            if lhs.trim().is_empty() || rhs.trim().is_empty() {
                continue;
            }
            return Ok((lhs, *op, rhs));
        }
    }

    Err(ConditionError::InvalidExpression(expr.to_string()))
}

/// Evaluates `if`/`unless` against an already-resolved `when` decision.
/// Returns whether the step should execute.
pub fn should_execute(
    when: When,
    if_expr: Option<&str>,
    unless_expr: Option<&str>,
    ctx: &Context,
) -> Result<bool, ConditionError> {
    if !when.evaluate(ctx) {
        return Ok(false);
    }

    if let Some(expr) = if_expr {
        if !evaluate_expression(expr, ctx)? {
            return Ok(false);
        }
    }

    if let Some(expr) = unless_expr {
        if evaluate_expression(expr, ctx)? {
            return Ok(false);
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn when_on_success_default_blocks_after_failure() {
        let ctx = Context::new(BTreeMap::new());
        ctx.set_step_status("a", crate::context::StepStatus::Failed);
        assert!(!When::OnSuccess.evaluate(&ctx));
    }

    #[test]
    fn when_on_failure_requires_a_failure() {
        let ctx = Context::new(BTreeMap::new());
        assert!(!When::OnFailure.evaluate(&ctx));
        ctx.set_step_status("a", crate::context::StepStatus::Failed);
        assert!(When::OnFailure.evaluate(&ctx));
    }

    #[test]
    fn when_always_ignores_history() {
        let ctx = Context::new(BTreeMap::new());
        ctx.set_step_status("a", crate::context::StepStatus::Failed);
        assert!(When::Always.evaluate(&ctx));
    }

    #[test]
    fn scenario_s3_if_condition_on_step_output() {
        let ctx = Context::new(BTreeMap::new());
        ctx.set_step_outputs("A", BTreeMap::from([("result".to_string(), "fail".to_string())]));
        let execute = should_execute(When::OnSuccess, Some("${A.result} == \"ok\""), None, &ctx).unwrap();
        assert!(!execute);
    }

    #[test]
    fn matches_operator_uses_regex() {
        let ctx = Context::new(BTreeMap::new());
        assert!(evaluate_expression("abc123 matches ^abc", &ctx).unwrap());
        assert!(!evaluate_expression("xyz matches ^abc", &ctx).unwrap());
    }

    #[test]
    fn numeric_comparison() {
        let ctx = Context::new(BTreeMap::new());
        assert!(evaluate_expression("10 >= 5", &ctx).unwrap());
        assert!(!evaluate_expression("3 > 5", &ctx).unwrap());
    }

    #[test]
    fn invalid_expression_errors() {
        let ctx = Context::new(BTreeMap::new());
        assert!(evaluate_expression("no operator here", &ctx).is_err());
    }

    #[test]
    fn unless_negates() {
        let ctx = Context::new(BTreeMap::new());
        let execute = should_execute(When::Always, None, Some("1 == 1"), &ctx).unwrap();
        assert!(!execute);
    }

    #[test]
    fn when_evaluated_before_if() {
        let ctx = Context::new(BTreeMap::new());
        ctx.set_step_status("a", crate::context::StepStatus::Failed);
        // if-expression would itself error, but on_success should short-circuit first.
        let execute = should_execute(When::OnSuccess, Some("not an expr"), None, &ctx).unwrap();
        assert!(!execute);
    }
}
