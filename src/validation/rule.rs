use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{info, warn};

use super::ValidationResult;

pub const REQUIRED_FIELDS: &[&str] = &[
    "id",
    "risk_point",
    "rule_text",
    "dsl",
    "variables_used",
    "source_refs",
    "safety_hints",
];

const VARIABLE_FIELDS: &[&str] = &["name", "period", "unit"];

const RESERVED_WORDS: &[&str] = &["and", "or", "not", "True", "False", "None"];

const COMPARISON_WORDS: &[&str] = &[
    "大于",
    "小于",
    "高于",
    "低于",
    "超过",
    "不少于",
    "不大于",
    "greater than",
    "less than",
    "higher than",
    "lower than",
    "exceeds",
    "not less than",
    "not greater than",
];

static RULE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^rule_\d{8}_\d{3,}$").expect("rule id pattern"));
static NUMERIC_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?%?").expect("numeric pattern"));
static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[a-zA-Z_][a-zA-Z0-9_]*\b").expect("identifier pattern"));

#[derive(Default)]
struct Findings {
    issues: Vec<String>,
    suggestions: Vec<String>,
}

impl Findings {
    fn add(&mut self, issue: impl Into<String>, suggestion: impl Into<String>) {
        self.issues.push(issue.into());
        self.suggestions.push(suggestion.into());
    }
}

/// Check a generated rule object field by field.
pub fn validate_rule(rule: &Value) -> ValidationResult {
    let Some(obj) = rule.as_object() else {
        return ValidationResult::from_findings(
            vec!["rule must be a JSON object".to_string()],
            vec!["Return a single JSON object with the required fields".to_string()],
        );
    };
    let id = obj.get("id").and_then(Value::as_str).unwrap_or("<unknown>");
    info!("RuleValidator: validating {}", id);

    let missing: Vec<&str> = REQUIRED_FIELDS.iter().copied().filter(|f| !obj.contains_key(*f)).collect();
    if !missing.is_empty() {
        let result = ValidationResult::from_findings(
            vec![format!("missing required fields: {}", missing.join(", "))],
            vec![format!("Include every required field: {}", REQUIRED_FIELDS.join(", "))],
        );
        warn!("RuleValidator: {} rejected: {}", id, result.summary());
        return result;
    }

    let mut findings = Findings::default();
    check_scalars(obj, &mut findings);
    check_rule_text(&obj["rule_text"], &mut findings);
    let dsl = obj["dsl"].as_str().unwrap_or_default();
    check_dsl(&obj["dsl"], &mut findings);
    check_variables(&obj["variables_used"], dsl, &mut findings);

    let result = ValidationResult::from_findings(findings.issues, findings.suggestions);
    if result.is_valid {
        info!("RuleValidator: {} passed", id);
    } else {
        warn!("RuleValidator: {} rejected: {}", id, result.summary());
    }
    result
}

fn non_empty_str(value: &Value) -> bool {
    value.as_str().is_some_and(|s| !s.is_empty())
}

fn check_scalars(obj: &Map<String, Value>, findings: &mut Findings) {
    let id_ok = obj["id"].as_str().is_some_and(|id| RULE_ID.is_match(id));
    if !id_ok {
        findings.add(
            format!("malformed id {}: expected rule_YYYYMMDD_xxx", obj["id"]),
            "Use an id such as rule_20240101_001",
        );
    }
    if !obj["source_refs"].as_array().is_some_and(|refs| !refs.is_empty()) {
        findings.add("source_refs must be a non-empty list", "Cite at least one source in source_refs");
    }
    if !obj["safety_hints"].is_array() {
        findings.add("safety_hints must be a list", "Provide safety_hints as a JSON array");
    }
    if !non_empty_str(&obj["rule_text"]) {
        findings.add("rule_text must be a non-empty string", "Describe the rule in rule_text");
    }
    if !non_empty_str(&obj["risk_point"]) {
        findings.add("risk_point must be a non-empty string", "Echo the risk point being modelled");
    }
}

fn check_rule_text(rule_text: &Value, findings: &mut Findings) {
    let text = rule_text.as_str().unwrap_or_default();
    if !NUMERIC_TOKEN.is_match(text) {
        findings.add(
            "rule_text has no numeric threshold",
            "State an explicit threshold such as 30% or 1.5 in rule_text",
        );
    }
    if !COMPARISON_WORDS.iter().any(|w| text.contains(w)) {
        findings.add(
            "rule_text has no comparison word",
            "Use a comparison such as 大于/低于 or greater than/less than in rule_text",
        );
    }
}

fn check_dsl(dsl: &Value, findings: &mut Findings) {
    let text = dsl.as_str().unwrap_or_default();

    let mut depth = 0usize;
    for c in text.chars() {
        match c {
            '(' => depth += 1,
            ')' if depth == 0 => {
                findings.add(
                    "unbalanced parentheses in dsl: extra closing parenthesis",
                    "Remove the unmatched ')' from dsl",
                );
                break;
            }
            ')' => depth -= 1,
            _ => {}
        }
    }
    if depth > 0 {
        findings.add(
            "unbalanced parentheses in dsl: missing closing parenthesis",
            "Close every '(' in dsl",
        );
    }

    if text.trim().is_empty() {
        findings.add("dsl must not be empty", "Write the rule as a boolean dsl expression");
    }
}

fn check_variables(variables: &Value, dsl: &str, findings: &mut Findings) {
    let Some(vars) = variables.as_object() else {
        findings.add(
            "variables_used must be an object",
            "Map every dsl symbol to {name, period, unit} in variables_used",
        );
        return;
    };

    for (symbol, info) in vars {
        let Some(info) = info.as_object() else {
            findings.add(
                format!("variable {} must be an object", symbol),
                format!("Describe {} as {{name, period, unit}}", symbol),
            );
            continue;
        };
        for field in VARIABLE_FIELDS {
            if !info.contains_key(*field) {
                findings.add(
                    format!("variable {} is missing field: {}", symbol, field),
                    format!("Add `{}` to variable {}", field, symbol),
                );
            }
        }
    }

    let mut undefined: Vec<&str> = Vec::new();
    for token in IDENTIFIER.find_iter(dsl).map(|m| m.as_str()) {
        if vars.contains_key(token) || RESERVED_WORDS.contains(&token) || undefined.contains(&token) {
            continue;
        }
        undefined.push(token);
    }
    if !undefined.is_empty() {
        findings.add(
            format!("dsl uses undefined variables: {}", undefined.join(", ")),
            format!("Define {} in variables_used or remove them from dsl", undefined.join(", ")),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule() -> Value {
        json!({
            "id": "rule_20240315_001",
            "risk_point": "应收账款异常增长",
            "rule_text": "应收账款增长率超过营业收入增长率 20% 以上",
            "dsl": "(ar_growth - rev_growth) > 0.2",
            "variables_used": {
                "ar_growth": {"name": "应收账款增长率", "period": "本期", "unit": "%"},
                "rev_growth": {"name": "营业收入增长率", "period": "本期", "unit": "%"}
            },
            "source_refs": ["年报附注"],
            "safety_hints": []
        })
    }

    fn with(field: &str, value: Value) -> Value {
        let mut r = rule();
        r[field] = value;
        r
    }

    #[test]
    fn well_formed_rule_passes() {
        let result = validate_rule(&rule());
        assert!(result.is_valid, "{:?}", result.issues);
    }

    #[test]
    fn missing_field_is_one_combined_issue() {
        let mut r = rule();
        r.as_object_mut().unwrap().remove("dsl");
        r["id"] = json!("bad");
        let result = validate_rule(&r);
        assert_eq!(result.issues, vec!["missing required fields: dsl".to_string()]);
    }

    #[test]
    fn parenthesis_balance() {
        let balanced = validate_rule(&with("dsl", json!("(ar_growth + rev_growth) > 1")));
        assert!(!balanced.issues.iter().any(|i| i.contains("parenthes")));

        let open = validate_rule(&with("dsl", json!("(ar_growth + rev_growth > 1")));
        assert!(open.issues.iter().any(|i| i.contains("missing closing parenthesis")));

        let extra = validate_rule(&with("dsl", json!("ar_growth + rev_growth) > 1")));
        assert!(extra.issues.iter().any(|i| i.contains("extra closing parenthesis")));
        assert!(!extra.issues.iter().any(|i| i.contains("missing closing")));
    }

    #[test]
    fn undefined_symbols_are_named_once() {
        let mut r = with("dsl", json!("e - a > 15.0 and e > a"));
        r["variables_used"] = json!({"a": {"name": "A", "period": "本期", "unit": "元"}});
        let result = validate_rule(&r);
        let issue = result.issues.iter().find(|i| i.contains("undefined")).expect("issue");
        assert!(issue.ends_with(": e"));

        r["variables_used"]["e"] = json!({"name": "E", "period": "本期", "unit": "元"});
        let result = validate_rule(&r);
        assert!(!result.issues.iter().any(|i| i.contains("undefined")));
    }

    #[test]
    fn threshold_and_comparison_are_separate_issues() {
        let result = validate_rule(&with("rule_text", json!("应收账款增长较快")));
        assert!(result.issues.iter().any(|i| i.contains("numeric threshold")));
        assert!(result.issues.iter().any(|i| i.contains("comparison word")));

        let result = validate_rule(&with("rule_text", json!("ratio greater than 1.5")));
        assert!(result.is_valid, "{:?}", result.issues);
    }

    #[test]
    fn id_and_list_fields() {
        let result = validate_rule(&with("id", json!("rule_2024_1")));
        assert!(result.issues[0].contains("malformed id"));
        assert!(!validate_rule(&with("source_refs", json!([]))).is_valid);
        assert!(!validate_rule(&with("safety_hints", json!("none"))).is_valid);
        assert!(!validate_rule(&with("risk_point", json!(""))).is_valid);
    }

    #[test]
    fn variable_definitions_need_all_fields() {
        let mut r = rule();
        r["variables_used"]["ar_growth"] = json!({"name": "应收账款增长率"});
        let result = validate_rule(&r);
        let missing: Vec<_> = result.issues.iter().filter(|i| i.contains("missing field")).collect();
        assert_eq!(missing.len(), 2);
        assert!(!validate_rule(&with("variables_used", json!([]))).is_valid);
    }

    #[test]
    fn suggestions_pair_with_issues() {
        let result = validate_rule(&with("dsl", json!("")));
        assert_eq!(result.issues.len(), result.suggestions.len());
        assert!(result.issues.iter().any(|i| i.contains("must not be empty")));
    }
}
