//! Restricted executor for generated `check_risk(data_dict)` snippets.
//!
//! Snippets are parsed and evaluated by an in-process interpreter for a small Python subset.
//! Nothing outside the allow-listed builtins and the `math` module is reachable. Every run is
//! bounded by a step budget and a call-depth limit, and executes on its own thread with a
//! large stack so nested values and calls cannot exhaust the caller's stack.

pub mod ast;
mod builtins;
mod interp;
mod lexer;
mod parser;
mod value;

use serde_json::{Map, Number, Value as Json};
use thiserror::Error;
use tracing::{debug, warn};

pub use builtins::{BUILTIN_FUNCTIONS, IMPORTABLE_MODULES};
pub use interp::Limits;
pub use parser::parse;

use interp::{Interpreter, Unwind};
use value::{MAX_SEQUENCE_LEN, Value};

/// Name of the function every generated snippet must define.
pub const ENTRY_POINT: &str = "check_risk";

const SANDBOX_STACK_BYTES: usize = 256 * 1024 * 1024;

/// Nesting kept when a returned value is converted to JSON; deeper levels become `"..."`.
const MAX_JSON_DEPTH: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct SyntaxError {
    pub line: usize,
    pub message: String,
}

/// Outcome of running a snippet against one input.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    Verdict(bool),
    /// The entry point returned something other than a boolean.
    NonBoolean(Json),
    /// No verdict was produced; the string says why.
    NoResult(String),
}

impl ExecutionResult {
    /// Only an explicit `True` counts as risk.
    pub fn is_risk(&self) -> bool {
        matches!(self, ExecutionResult::Verdict(true))
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            ExecutionResult::NoResult(reason) => Some(reason),
            _ => None,
        }
    }

    /// JSON rendering used in saved records: the boolean, the raw value, or `null`.
    pub fn to_json(&self) -> Json {
        match self {
            ExecutionResult::Verdict(b) => Json::Bool(*b),
            ExecutionResult::NonBoolean(v) => v.clone(),
            ExecutionResult::NoResult(_) => Json::Null,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    limits: Limits,
}

impl Sandbox {
    pub fn new(limits: Limits) -> Self {
        Self { limits }
    }

    /// Parse `code`, run its top level, then call `check_risk(input)`.
    pub fn execute(&self, code: &str, input: &Json) -> ExecutionResult {
        let limits = self.limits;
        let result = std::thread::scope(|scope| {
            let worker = std::thread::Builder::new()
                .name("sandbox".to_string())
                .stack_size(SANDBOX_STACK_BYTES)
                .spawn_scoped(scope, || execute_here(limits, code, input));
            match worker {
                Ok(handle) => handle
                    .join()
                    .unwrap_or_else(|_| ExecutionResult::NoResult("sandbox thread panicked".to_string())),
                Err(e) => ExecutionResult::NoResult(format!("failed to start sandbox thread: {}", e)),
            }
        });

        if let ExecutionResult::NoResult(reason) = &result {
            warn!("Sandbox: no verdict ({})", reason);
        }
        result
    }
}

fn execute_here(limits: Limits, code: &str, input: &Json) -> ExecutionResult {
    let module = match parse(code) {
        Ok(module) => module,
        Err(e) => return ExecutionResult::NoResult(format!("syntax error at {}", e)),
    };

    let mut interp = Interpreter::new(limits);
    let result = run_entry_point(&mut interp, &module, input);
    debug!("Sandbox: finished after {} steps", interp.steps());
    interp.clear();
    result
}

fn run_entry_point(interp: &mut Interpreter, module: &ast::Module, input: &Json) -> ExecutionResult {
    if let Err(unwind) = interp.run_module(module) {
        return ExecutionResult::NoResult(describe_unwind("module level", unwind));
    }
    let entry = match interp.global(ENTRY_POINT) {
        Some(func @ Value::Function(_)) => func,
        Some(other) => {
            return ExecutionResult::NoResult(format!(
                "{} is a {}, not a function",
                ENTRY_POINT,
                other.type_name()
            ));
        }
        None => return ExecutionResult::NoResult(format!("{} is not defined", ENTRY_POINT)),
    };

    match interp.call(&entry, vec![from_json(input)], Vec::new()) {
        Ok(Value::Bool(verdict)) => ExecutionResult::Verdict(verdict),
        Ok(other) => ExecutionResult::NonBoolean(to_json(&other)),
        Err(unwind) => ExecutionResult::NoResult(describe_unwind(ENTRY_POINT, unwind)),
    }
}

fn describe_unwind(context: &str, unwind: Unwind) -> String {
    match unwind {
        Unwind::Raise(exc) => format!("{} raised {}", context, exc),
        Unwind::Abort(reason) => format!("{} aborted: {}", context, reason),
    }
}

fn from_json(json: &Json) -> Value {
    match json {
        Json::Null => Value::None,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(s) => Value::str(s),
        Json::Array(items) => Value::list(items.iter().map(from_json).collect()),
        Json::Object(map) => Value::dict(
            map.iter()
                .map(|(k, v)| (Value::str(k), from_json(v)))
                .collect(),
        ),
    }
}

fn to_json(value: &Value) -> Json {
    let mut budget = MAX_SEQUENCE_LEN;
    to_json_bounded(value, 0, &mut budget)
}

/// `budget` counts values converted; once spent, the rest become `"..."`.
fn to_json_bounded(value: &Value, depth: usize, budget: &mut usize) -> Json {
    if depth > MAX_JSON_DEPTH || *budget == 0 {
        return Json::String("...".to_string());
    }
    *budget -= 1;
    match value {
        Value::None => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::Number((*i).into()),
        Value::Float(f) => Number::from_f64(*f)
            .map(Json::Number)
            .unwrap_or_else(|| Json::String(value.repr())),
        Value::Str(s) => Json::String(s.to_string()),
        Value::List(items) => Json::Array(
            items.borrow().iter().map(|v| to_json_bounded(v, depth + 1, budget)).collect(),
        ),
        Value::Tuple(items) => {
            Json::Array(items.iter().map(|v| to_json_bounded(v, depth + 1, budget)).collect())
        }
        Value::Dict(entries) => {
            let mut map = Map::new();
            for (k, v) in entries.borrow().iter() {
                map.insert(k.to_str(), to_json_bounded(v, depth + 1, budget));
            }
            Json::Object(map)
        }
        other => Json::String(other.repr()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(code: &str) -> ExecutionResult {
        Sandbox::default().execute(code, &json!({"company_name": "Acme", "model_items": []}))
    }

    fn sample_input() -> Json {
        json!({
            "company_name": "示例公司",
            "model_items": [{"项目名称": "营业收入", "类型": "本期", "值": 100.0}],
            "model_data_by_name_type": {
                "营业收入_本期": 100.0,
                "营业收入_上期": 160.0,
                "应收账款_本期": "45.5"
            }
        })
    }

    #[test]
    fn returns_true_verdict() {
        assert_eq!(run("def check_risk(data_dict):\n    return True\n"), ExecutionResult::Verdict(true));
        assert!(run("def check_risk(data_dict):\n    return True\n").is_risk());
    }

    #[test]
    fn unguarded_exception_yields_no_result() {
        let result = run("def check_risk(data_dict):\n    return 1 / 0\n");
        match result {
            ExecutionResult::NoResult(reason) => assert!(reason.contains("ZeroDivisionError")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn non_boolean_return_is_kept_but_not_risk() {
        let result = run("def check_risk(data_dict):\n    return 0.75\n");
        assert_eq!(result, ExecutionResult::NonBoolean(json!(0.75)));
        assert!(!result.is_risk());
        assert!(!run("def check_risk(data_dict):\n    return 1\n").is_risk());
    }

    #[test]
    fn missing_entry_point() {
        let result = run("def other(data_dict):\n    return True\n");
        assert!(matches!(result, ExecutionResult::NoResult(r) if r.contains("not defined")));
        let result = run("check_risk = 5\n");
        assert!(matches!(result, ExecutionResult::NoResult(r) if r.contains("not a function")));
    }

    #[test]
    fn syntax_errors_yield_no_result() {
        let result = run("def check_risk(data_dict)\n    return True\n");
        assert!(matches!(result, ExecutionResult::NoResult(r) if r.starts_with("syntax error")));
    }

    #[test]
    fn guarded_exceptions_fall_back_to_false() {
        let code = "def check_risk(data_dict):\n    try:\n        return data_dict['missing'] > 1\n    except (KeyError, TypeError):\n        return False\n";
        assert_eq!(run(code), ExecutionResult::Verdict(false));
    }

    #[test]
    fn disallowed_imports_and_names() {
        let result = run("import os\ndef check_risk(data_dict):\n    return True\n");
        assert!(matches!(result, ExecutionResult::NoResult(r) if r.contains("ImportError")));
        let result = run("def check_risk(data_dict):\n    return open('/etc/passwd') is not None\n");
        assert!(matches!(result, ExecutionResult::NoResult(r) if r.contains("NameError")));
        let result = run("def check_risk(data_dict):\n    return data_dict.__class__ is None\n");
        assert!(matches!(result, ExecutionResult::NoResult(r) if r.contains("AttributeError")));
    }

    #[test]
    fn endless_loop_is_bounded() {
        let sandbox = Sandbox::new(Limits { max_steps: 5_000, max_depth: 16 });
        let code = "def check_risk(data_dict):\n    try:\n        while True:\n            pass\n    except Exception:\n        return False\n";
        let result = sandbox.execute(code, &json!({}));
        assert!(matches!(result, ExecutionResult::NoResult(r) if r.contains("aborted")));
    }

    #[test]
    fn deep_nesting_is_rejected_without_crashing() {
        let code = format!(
            "def check_risk(data_dict):\n    return {}True{}\n",
            "(".repeat(200_000),
            ")".repeat(200_000)
        );
        let result = Sandbox::default().execute(&code, &json!({}));
        assert!(matches!(result, ExecutionResult::NoResult(r) if r.contains("too deeply nested")));
    }

    #[test]
    fn deeply_nested_values_are_released_safely() {
        let code = "def check_risk(data_dict):\n    x = []\n    while True:\n        x = [x]\n";
        let result = Sandbox::default().execute(code, &json!({}));
        assert!(matches!(result, ExecutionResult::NoResult(r) if r.contains("aborted")));
    }

    #[test]
    fn oversized_format_width_is_an_overflow() {
        let code = "def check_risk(data_dict):\n    return len(f'{1:>900000000}') > 0\n";
        let result = Sandbox::default().execute(code, &json!({}));
        assert!(matches!(result, ExecutionResult::NoResult(r) if r.contains("OverflowError")));
    }

    #[test]
    fn returned_structures_are_truncated() {
        let code = "def check_risk(data_dict):\n    x = [1]\n    x.append(x)\n    return x\n";
        let ExecutionResult::NonBoolean(json) = Sandbox::default().execute(code, &json!({})) else {
            panic!("expected a non-boolean result");
        };
        let mut depth = 0;
        let mut node = &json;
        while let Json::Array(items) = node {
            depth += 1;
            node = &items[1];
        }
        assert_eq!(depth, MAX_JSON_DEPTH + 1);
        assert_eq!(node, &json!("..."));

        let code = "def check_risk(data_dict):\n    x = 0\n    n = 0\n    while n < 40:\n        x = [x, x]\n        n += 1\n    return x\n";
        let result = Sandbox::default().execute(code, &json!({}));
        let text = result.to_json().to_string();
        assert!(text.len() < 8 * MAX_SEQUENCE_LEN);
        assert!(text.contains("\"...\""));
    }

    #[test]
    fn evaluates_a_realistic_rule() {
        let code = r#"
import math

def check_risk(data_dict):
    try:
        values = data_dict.get("model_data_by_name_type", {})
        current = float(values.get("营业收入_本期", 0) or 0)
        previous = float(values.get("营业收入_上期", 0) or 0)
        receivable = float(values.get("应收账款_本期", 0))
        if previous == 0:
            return False
        decline = (previous - current) / previous
        names = [item.get("项目名称") for item in data_dict.get("model_items", [])]
        return decline > 0.3 and receivable / current > 0.4 and "营业收入" in names and math.isfinite(decline)
    except (ValueError, TypeError, ZeroDivisionError):
        return False
"#;
        let result = Sandbox::default().execute(code, &sample_input());
        assert_eq!(result, ExecutionResult::Verdict(true));
    }

    #[test]
    fn json_conversion_round_trips_structure() {
        let value = from_json(&sample_input());
        let back = to_json(&value);
        assert_eq!(back, sample_input());
    }
}
