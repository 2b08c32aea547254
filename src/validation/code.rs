use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use super::ValidationResult;
use crate::sandbox::{ENTRY_POINT, parse};

/// Replacement used when a candidate cannot be salvaged: parses, defines the entry point, never flags risk.
pub const SAFE_STUB: &str = "def check_risk(data_dict):
    try:
        return False
    except (ValueError, TypeError, AttributeError, ZeroDivisionError):
        return False
";

static ENTRY_DEF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^([ \t]*)def[ \t]+check_risk[ \t]*\([ \t]*([A-Za-z_][A-Za-z0-9_]*)[ \t]*(?::[^,()]*)?,?[ \t]*\)")
        .expect("entry point pattern")
});
static TRY_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*try[ \t]*:").expect("try pattern"));
static EXCEPT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*except\b").expect("except pattern"));
static BOOL_RETURN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\breturn[ \t]+(True|False)\b").expect("return pattern"));
static ANY_RETURN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\breturn\b").expect("return pattern"));
static BARE_EXCEPT_EXCEPTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"except[ \t]+Exception[ \t]*:").expect("except pattern"));

/// Module usages that imply an import, with the import line that satisfies them.
const IMPLIED_IMPORTS: &[(&str, &str, &str)] = &[
    (r"\bmath\.", r"(?m)^[ \t]*(import[ \t]+math\b|from[ \t]+math[ \t]+import)", "import math"),
    (r"\bnp\.", r"(?m)^[ \t]*import[ \t]+numpy[ \t]+as[ \t]+np\b", "import numpy as np"),
    (r"\bnumpy\.", r"(?m)^[ \t]*import[ \t]+numpy\b", "import numpy"),
    (
        r"\bstatistics\.",
        r"(?m)^[ \t]*(import[ \t]+statistics\b|from[ \t]+statistics[ \t]+import)",
        "import statistics",
    ),
];

/// Parameter name of the entry point, if a single-parameter definition exists.
fn entry_param(code: &str) -> Option<String> {
    ENTRY_DEF.captures(code).map(|c| c[2].to_string())
}

/// Static checks on a candidate snippet. Pure: the same input always yields the same result.
pub fn validate_code(code: &str) -> ValidationResult {
    let mut issues = Vec::new();
    let mut suggestions = Vec::new();

    let param = entry_param(code);
    if param.is_none() {
        issues.push(format!("missing entry point `def {}(data_dict)` with exactly one parameter", ENTRY_POINT));
        suggestions.push(format!(
            "Define a single function `def {}(data_dict):` that takes the input dict",
            ENTRY_POINT
        ));
    }

    if !(TRY_BLOCK.is_match(code) && EXCEPT_BLOCK.is_match(code)) {
        issues.push("no try/except guard around the risk logic".to_string());
        suggestions.push(
            "Wrap the body in try/except (ValueError, TypeError, KeyError, ZeroDivisionError) and return False on failure"
                .to_string(),
        );
    }

    if !BOOL_RETURN.is_match(code) {
        issues.push("no explicit `return True` or `return False`".to_string());
        suggestions.push("Return the boolean literals True or False from every branch".to_string());
    }

    let param = param.unwrap_or_else(|| "data_dict".to_string());
    let usage = Regex::new(&format!(r"\b{}[ \t]*(\[|\.get\()", regex::escape(&param)));
    if !usage.is_ok_and(|re| re.is_match(code)) {
        issues.push(format!("parameter `{}` is never read via `[...]` or `.get(...)`", param));
        suggestions.push(format!(
            "Read inputs from {0}, e.g. {0}.get(\"model_data_by_name_type\", {{}})",
            param
        ));
    }

    ValidationResult::from_findings(issues, suggestions)
}

/// One best-effort pass of mechanical fixes.
pub fn repair_code(code: &str) -> String {
    if entry_param(code).is_none() {
        debug!("CodeRepair: no entry point, substituting the safe stub");
        return SAFE_STUB.to_string();
    }

    let mut code = code.to_string();

    let mut missing_imports = Vec::new();
    for (usage, existing, line) in IMPLIED_IMPORTS {
        let used = Regex::new(usage).is_ok_and(|re| re.is_match(&code));
        let imported = Regex::new(existing).is_ok_and(|re| re.is_match(&code));
        if used && !imported {
            missing_imports.push(*line);
        }
    }
    if !missing_imports.is_empty() {
        debug!("CodeRepair: injecting {:?}", missing_imports);
        code = format!("{}\n{}", missing_imports.join("\n"), code);
    }

    code = BARE_EXCEPT_EXCEPTION.replace_all(&code, "except Exception as e:").into_owned();

    if !BOOL_RETURN.is_match(&code) {
        code = insert_return_false(&code);
    }
    code
}

/// Insert `return False` where the entry point's body ends, found by indentation.
fn insert_return_false(code: &str) -> String {
    let mut lines: Vec<String> = code.lines().map(str::to_string).collect();
    let indent_of = |line: &str| line.len() - line.trim_start().len();

    let Some(def_idx) = lines
        .iter()
        .position(|l| l.trim_start().starts_with(&format!("def {}(", ENTRY_POINT)))
    else {
        return code.to_string();
    };
    let def_indent = indent_of(&lines[def_idx]);

    let body_end = (def_idx + 2..lines.len())
        .find(|&j| !lines[j].trim().is_empty() && indent_of(&lines[j]) <= def_indent);

    match body_end {
        Some(end) => {
            lines.insert(end, format!("{}return False", " ".repeat(def_indent + 4)));
            lines.join("\n")
        }
        None if !ANY_RETURN.is_match(code) => {
            format!("{}\n{}return False", code.trim_end_matches('\n'), " ".repeat(def_indent + 4))
        }
        None => code.to_string(),
    }
}

/// Repair once, then require the result to parse; anything unparseable becomes the safe stub.
pub fn finalize_code(raw: &str) -> String {
    let repaired = repair_code(raw);
    match parse(&repaired) {
        Ok(_) => repaired,
        Err(e) => {
            warn!("CodeRepair: repaired code still fails to parse ({}), using safe stub", e);
            SAFE_STUB.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = "import math

def check_risk(data_dict):
    try:
        values = data_dict.get('model_data_by_name_type', {})
        ratio = values.get('a_企业', 0) / values.get('b_企业', 1)
        if math.isfinite(ratio) and ratio > 0.5:
            return True
        return False
    except (ValueError, TypeError, ZeroDivisionError):
        return False
";

    #[test]
    fn valid_code_passes_and_is_stable() {
        let first = validate_code(GOOD);
        assert!(first.is_valid, "{:?}", first.issues);
        assert!(first.issues.is_empty());
        assert_eq!(first, validate_code(GOOD));
    }

    #[test]
    fn each_missing_element_is_one_issue() {
        let result = validate_code("def check_risk(data_dict):\n    return data_dict['x'] > 1\n");
        assert!(!result.is_valid);
        assert_eq!(result.issues.len(), 2);
        assert_eq!(result.suggestions.len(), 2);
        assert!(result.issues[0].contains("try/except"));
        assert!(result.issues[1].contains("return True"));
    }

    #[test]
    fn wrong_arity_is_missing_entry_point() {
        let result = validate_code("def check_risk(a, b):\n    try:\n        return a['x']\n    except Exception:\n        return False\n");
        assert!(result.issues.iter().any(|i| i.contains("entry point")));
    }

    #[test]
    fn parameter_usage_follows_the_declared_name() {
        let code = "def check_risk(d):\n    try:\n        return d.get('x', 0) > 1 or False\n    except Exception:\n        return False\n";
        assert!(validate_code(code).is_valid);
        let unused = "def check_risk(d):\n    try:\n        return True\n    except Exception:\n        return False\n";
        let result = validate_code(unused);
        assert_eq!(result.issues.len(), 1);
        assert!(result.issues[0].contains("`d`"));
    }

    #[test]
    fn repair_injects_imports_and_binds_exception() {
        let code = "def check_risk(data_dict):\n    try:\n        return math.sqrt(data_dict['x']) > 2\n    except Exception:\n        return False\n";
        let repaired = repair_code(code);
        assert!(repaired.starts_with("import math\n"));
        assert!(repaired.contains("except Exception as e:"));
        assert!(!repaired.contains("except Exception:"));
    }

    #[test]
    fn repair_inserts_return_at_body_end() {
        let code = "def check_risk(data_dict):\n    x = data_dict.get('x', 0)\n    y = x * 2\n\nRESULT = 1\n";
        let repaired = repair_code(code);
        let lines: Vec<&str> = repaired.lines().collect();
        let idx = lines.iter().position(|l| *l == "    return False").expect("inserted");
        assert!(idx < lines.iter().position(|l| *l == "RESULT = 1").unwrap_or(0));
    }

    #[test]
    fn repair_appends_return_when_body_runs_to_end() {
        let code = "def check_risk(data_dict):\n    x = data_dict.get('x', 0)\n";
        assert!(repair_code(code).ends_with("\n    return False"));
    }

    #[test]
    fn missing_entry_point_becomes_stub() {
        assert_eq!(repair_code("print('hello')"), SAFE_STUB);
        assert_eq!(finalize_code("def other(x):\n    return True\n"), SAFE_STUB);
    }

    #[test]
    fn unparseable_code_becomes_stub() {
        let broken = "def check_risk(data_dict):\n    try:\n        return (data_dict['x'] > \n    except Exception:\n        return False\n";
        assert_eq!(finalize_code(broken), SAFE_STUB);
    }

    #[test]
    fn deeply_nested_code_becomes_stub() {
        let deep = format!(
            "def check_risk(data_dict):\n    try:\n        return {}True{}\n    except Exception:\n        return False\n",
            "(".repeat(200_000),
            ")".repeat(200_000)
        );
        assert_eq!(finalize_code(&deep), SAFE_STUB);
    }

    #[test]
    fn stub_is_itself_valid_python_subset() {
        assert!(parse(SAFE_STUB).is_ok());
        assert_eq!(finalize_code(SAFE_STUB), SAFE_STUB);
    }

    #[test]
    fn finalize_keeps_good_code() {
        assert_eq!(finalize_code(GOOD), GOOD);
    }
}
