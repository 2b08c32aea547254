//! The allow-listed builtins, the `math` module, container access and methods.

use std::rc::Rc;

use super::interp::{Eval, Interpreter};
use super::value::{
    ExcKind, Exception, MAX_SEQUENCE_LEN, Value, binary_op, float_repr, py_eq, py_lt,
};
use super::ast::BinOp;

/// Callable builtins visible to snippets. Anything else resolves to `NameError`.
pub const BUILTIN_FUNCTIONS: &[&str] = &[
    "abs", "min", "max", "round", "len", "sum", "any", "all", "bool", "int", "float", "str",
];

/// Exception types visible to snippets.
pub const EXCEPTION_TYPES: &[ExcKind] = &[
    ExcKind::ValueError,
    ExcKind::KeyError,
    ExcKind::TypeError,
    ExcKind::IndexError,
    ExcKind::ZeroDivisionError,
    ExcKind::AttributeError,
    ExcKind::Exception,
];

/// Modules a snippet may import.
pub const IMPORTABLE_MODULES: &[&str] = &["math"];

const MATH_FUNCTIONS: &[(&str, &str)] = &[
    ("sqrt", "math.sqrt"),
    ("fabs", "math.fabs"),
    ("floor", "math.floor"),
    ("ceil", "math.ceil"),
    ("isnan", "math.isnan"),
    ("isinf", "math.isinf"),
    ("isfinite", "math.isfinite"),
    ("log", "math.log"),
    ("log10", "math.log10"),
    ("exp", "math.exp"),
    ("pow", "math.pow"),
];

pub fn lookup(name: &str) -> Option<Value> {
    if let Some(builtin) = BUILTIN_FUNCTIONS.iter().find(|b| **b == name) {
        return Some(Value::Builtin(*builtin));
    }
    EXCEPTION_TYPES.iter().find(|k| k.name() == name).map(|k| Value::ExcType(*k))
}

pub fn import_module(module: &str) -> Result<Value, Exception> {
    match IMPORTABLE_MODULES.iter().find(|m| **m == module) {
        Some(m) => Ok(Value::Module(*m)),
        None => Err(Exception::new(
            ExcKind::ImportError,
            format!("import of '{}' is not allowed", module),
        )),
    }
}

pub fn module_attr(module: &str, name: &str) -> Option<Value> {
    if module != "math" {
        return None;
    }
    match name {
        "pi" => Some(Value::Float(std::f64::consts::PI)),
        "e" => Some(Value::Float(std::f64::consts::E)),
        "inf" => Some(Value::Float(f64::INFINITY)),
        "nan" => Some(Value::Float(f64::NAN)),
        _ => MATH_FUNCTIONS
            .iter()
            .find(|(attr, _)| *attr == name)
            .map(|(_, qualified)| Value::Builtin(*qualified)),
    }
}

pub fn module_exports(module: &str) -> Vec<(&'static str, Value)> {
    let mut names: Vec<&'static str> = vec!["pi", "e", "inf", "nan"];
    names.extend(MATH_FUNCTIONS.iter().map(|(attr, _)| *attr));
    names
        .into_iter()
        .filter_map(|name| module_attr(module, name).map(|v| (name, v)))
        .collect()
}

// ---- argument helpers ----

fn no_kwargs(name: &str, kwargs: &[(String, Value)]) -> Result<(), Exception> {
    if kwargs.is_empty() {
        Ok(())
    } else {
        Err(Exception::type_error(format!("{}() takes no keyword arguments", name)))
    }
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), Exception> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("exactly {}", min)
        } else if args.len() < min {
            format!("at least {}", min)
        } else {
            format!("at most {}", max)
        };
        return Err(Exception::type_error(format!(
            "{}() takes {} argument{} ({} given)",
            name,
            expected,
            if max == 1 && min == max { "" } else { "s" },
            args.len()
        )));
    }
    Ok(())
}

fn real(name: &str, value: &Value) -> Result<f64, Exception> {
    value.as_f64().ok_or_else(|| {
        Exception::type_error(format!(
            "{}() argument must be a real number, not '{}'",
            name,
            value.type_name()
        ))
    })
}

fn domain_error() -> Exception {
    Exception::value_error("math domain error")
}

fn float_to_int(f: f64) -> Result<Value, Exception> {
    if f.is_nan() {
        return Err(Exception::value_error("cannot convert float NaN to integer"));
    }
    if f.is_infinite() {
        return Err(Exception::new(
            ExcKind::OverflowError,
            "cannot convert float infinity to integer",
        ));
    }
    let t = f.trunc();
    if t >= i64::MIN as f64 && t < i64::MAX as f64 {
        Ok(Value::Int(t as i64))
    } else {
        Ok(Value::Float(t))
    }
}

// ---- builtin functions ----

pub fn call_builtin(
    interp: &mut Interpreter,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Eval {
    if let Some(math_fn) = name.strip_prefix("math.") {
        no_kwargs(math_fn, &kwargs)?;
        return Ok(call_math(math_fn, &args)?);
    }
    match name {
        "min" | "max" => min_max(interp, name, args, kwargs),
        _ => {
            no_kwargs(name, &kwargs)?;
            Ok(call_simple(name, args)?)
        }
    }
}

fn call_simple(name: &str, args: Vec<Value>) -> Result<Value, Exception> {
    match name {
        "abs" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Float(f) => Ok(Value::Float(f.abs())),
                v => match v.as_int() {
                    Some(i) => Ok(i.checked_abs().map(Value::Int).unwrap_or(Value::Float((i as f64).abs()))),
                    None => Err(Exception::type_error(format!(
                        "bad operand type for abs(): '{}'",
                        v.type_name()
                    ))),
                },
            }
        }
        "len" => {
            arity(name, &args, 1, 1)?;
            let len = match &args[0] {
                Value::Str(s) => s.chars().count(),
                Value::List(l) => l.borrow().len(),
                Value::Tuple(t) => t.len(),
                Value::Dict(d) => d.borrow().len(),
                v => {
                    return Err(Exception::type_error(format!(
                        "object of type '{}' has no len()",
                        v.type_name()
                    )));
                }
            };
            Ok(Value::Int(len as i64))
        }
        "sum" => {
            arity(name, &args, 1, 2)?;
            let mut total = args.get(1).cloned().unwrap_or(Value::Int(0));
            if matches!(total, Value::Str(_)) {
                return Err(Exception::type_error(
                    "sum() can't sum strings [use ''.join(seq) instead]",
                ));
            }
            for item in args[0].iterate()? {
                total = binary_op(BinOp::Add, &total, &item)?;
            }
            Ok(total)
        }
        "any" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Bool(args[0].iterate()?.iter().any(Value::truthy)))
        }
        "all" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Bool(args[0].iterate()?.iter().all(Value::truthy)))
        }
        "bool" => {
            arity(name, &args, 0, 1)?;
            Ok(Value::Bool(args.first().is_some_and(Value::truthy)))
        }
        "str" => {
            arity(name, &args, 0, 1)?;
            Ok(Value::str(args.first().map(Value::to_str).unwrap_or_default()))
        }
        "int" => {
            arity(name, &args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Int(0)),
                Some(Value::Float(f)) => float_to_int(*f),
                Some(Value::Str(s)) => parse_int(s),
                Some(v) => v.as_int().map(Value::Int).ok_or_else(|| {
                    Exception::type_error(format!(
                        "int() argument must be a string, a bytes-like object or a real number, not '{}'",
                        v.type_name()
                    ))
                }),
            }
        }
        "float" => {
            arity(name, &args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Float(0.0)),
                Some(Value::Str(s)) => parse_float(s),
                Some(v) => v.as_f64().map(Value::Float).ok_or_else(|| {
                    Exception::type_error(format!(
                        "float() argument must be a string or a real number, not '{}'",
                        v.type_name()
                    ))
                }),
            }
        }
        "round" => {
            arity(name, &args, 1, 2)?;
            let ndigits = match args.get(1) {
                None | Some(Value::None) => None,
                Some(v) => Some(v.as_int().ok_or_else(|| {
                    Exception::type_error(format!(
                        "'{}' object cannot be interpreted as an integer",
                        v.type_name()
                    ))
                })?),
            };
            round(&args[0], ndigits)
        }
        other => Err(Exception::new(
            ExcKind::NameError,
            format!("name '{}' is not defined", other),
        )),
    }
}

fn parse_int(s: &str) -> Result<Value, Exception> {
    let cleaned: String = s.trim().chars().filter(|c| *c != '_').collect();
    cleaned.parse::<i64>().map(Value::Int).map_err(|_| {
        Exception::value_error(format!("invalid literal for int() with base 10: {}", Value::str(s).repr()))
    })
}

fn parse_float(s: &str) -> Result<Value, Exception> {
    let trimmed = s.trim();
    let valid_chars = trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '-' | '_'));
    let parsed = if valid_chars && !trimmed.is_empty() {
        trimmed.replace('_', "").parse::<f64>().ok()
    } else {
        None
    };
    parsed.map(Value::Float).ok_or_else(|| {
        Exception::value_error(format!("could not convert string to float: {}", Value::str(s).repr()))
    })
}

fn round(value: &Value, ndigits: Option<i64>) -> Result<Value, Exception> {
    match (value, ndigits) {
        (Value::Float(f), None) => float_to_int(f.round_ties_even()),
        (Value::Float(f), Some(n)) => {
            if !f.is_finite() {
                return Ok(Value::Float(*f));
            }
            let n = n.clamp(-308, 308) as i32;
            let scale = 10f64.powi(n);
            let scaled = f * scale;
            if !scaled.is_finite() {
                return Ok(Value::Float(*f));
            }
            Ok(Value::Float(scaled.round_ties_even() / scale))
        }
        (v, None) if v.as_int().is_some() => Ok(Value::Int(v.as_int().unwrap_or(0))),
        (v, Some(n)) if v.as_int().is_some() => {
            let i = v.as_int().unwrap_or(0);
            if n >= 0 {
                return Ok(Value::Int(i));
            }
            let scale = 10f64.powi((-n).min(18) as i32);
            Ok(Value::Int(((i as f64 / scale).round_ties_even() * scale) as i64))
        }
        (v, _) => Err(Exception::type_error(format!(
            "type {} doesn't define __round__ method",
            v.type_name()
        ))),
    }
}

fn min_max(
    interp: &mut Interpreter,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Eval {
    let mut key = None;
    let mut default = None;
    for (k, v) in kwargs {
        match k.as_str() {
            "key" if !matches!(v, Value::None) => key = Some(v),
            "key" => {}
            "default" => default = Some(v),
            other => {
                return Err(Exception::type_error(format!(
                    "{}() got an unexpected keyword argument '{}'",
                    name, other
                ))
                .into());
            }
        }
    }

    let items = match args.len() {
        0 => {
            return Err(Exception::type_error(format!(
                "{} expected at least 1 argument, got 0",
                name
            ))
            .into());
        }
        1 => args[0].iterate()?,
        _ => {
            if default.is_some() {
                return Err(Exception::type_error(format!(
                    "Cannot specify a default for {}() with multiple positional arguments",
                    name
                ))
                .into());
            }
            args
        }
    };

    let mut best: Option<(Value, Value)> = None;
    for item in items {
        let item_key = match &key {
            Some(f) => interp.call(f, vec![item.clone()], Vec::new())?,
            None => item.clone(),
        };
        let replace = match &best {
            None => true,
            Some((_, best_key)) if name == "min" => py_lt(&item_key, best_key)?,
            Some((_, best_key)) => py_lt(best_key, &item_key)?,
        };
        if replace {
            best = Some((item, item_key));
        }
    }
    match (best, default) {
        (Some((item, _)), _) => Ok(item),
        (None, Some(default)) => Ok(default),
        (None, None) => Err(Exception::value_error(format!("{}() arg is an empty sequence", name)).into()),
    }
}

fn call_math(name: &str, args: &[Value]) -> Result<Value, Exception> {
    match name {
        "log" => {
            arity(name, args, 1, 2)?;
            let x = real(name, &args[0])?;
            if x <= 0.0 {
                return Err(domain_error());
            }
            match args.get(1) {
                None => Ok(Value::Float(x.ln())),
                Some(base) => {
                    let base = real(name, base)?;
                    if base <= 0.0 {
                        return Err(domain_error());
                    }
                    if base == 1.0 {
                        return Err(Exception::zero_division("float division by zero"));
                    }
                    Ok(Value::Float(x.ln() / base.ln()))
                }
            }
        }
        "pow" => {
            arity(name, args, 2, 2)?;
            let (x, y) = (real(name, &args[0])?, real(name, &args[1])?);
            if x == 0.0 && y < 0.0 || x < 0.0 && y.is_finite() && y.fract() != 0.0 {
                return Err(domain_error());
            }
            let r = x.powf(y);
            if r.is_infinite() && x.is_finite() && y.is_finite() {
                return Err(Exception::new(ExcKind::OverflowError, "math range error"));
            }
            Ok(Value::Float(r))
        }
        _ => {
            arity(name, args, 1, 1)?;
            let x = real(name, &args[0])?;
            match name {
                "sqrt" if x < 0.0 => Err(domain_error()),
                "sqrt" => Ok(Value::Float(x.sqrt())),
                "fabs" => Ok(Value::Float(x.abs())),
                "floor" => match &args[0] {
                    Value::Float(_) => float_to_int(x.floor()),
                    v => Ok(Value::Int(v.as_int().unwrap_or(0))),
                },
                "ceil" => match &args[0] {
                    Value::Float(_) => float_to_int(x.ceil()),
                    v => Ok(Value::Int(v.as_int().unwrap_or(0))),
                },
                "isnan" => Ok(Value::Bool(x.is_nan())),
                "isinf" => Ok(Value::Bool(x.is_infinite())),
                "isfinite" => Ok(Value::Bool(x.is_finite())),
                "log10" if x <= 0.0 => Err(domain_error()),
                "log10" => Ok(Value::Float(x.log10())),
                "exp" => {
                    let r = x.exp();
                    if r.is_infinite() && x.is_finite() {
                        return Err(Exception::new(ExcKind::OverflowError, "math range error"));
                    }
                    Ok(Value::Float(r))
                }
                other => Err(Exception::new(
                    ExcKind::AttributeError,
                    format!("module 'math' has no attribute '{}'", other),
                )),
            }
        }
    }
}

// ---- containers ----

fn check_key(key: &Value) -> Result<(), Exception> {
    if key.is_hashable() {
        Ok(())
    } else {
        Err(Exception::type_error(format!("unhashable type: '{}'", key.type_name())))
    }
}

pub fn dict_lookup(entries: &[(Value, Value)], key: &Value) -> Result<Option<Value>, Exception> {
    for (k, v) in entries {
        if py_eq(k, key)? {
            return Ok(Some(v.clone()));
        }
    }
    Ok(None)
}

fn position(items: &[Value], item: &Value) -> Result<Option<usize>, Exception> {
    for (i, v) in items.iter().enumerate() {
        if py_eq(v, item)? {
            return Ok(Some(i));
        }
    }
    Ok(None)
}

fn normalize_index(index: &Value, len: usize, kind: &str) -> Result<usize, Exception> {
    let i = index.as_int().ok_or_else(|| {
        Exception::type_error(format!(
            "{} indices must be integers or slices, not {}",
            kind,
            index.type_name()
        ))
    })?;
    let len = len as i64;
    let resolved = if i < 0 { i + len } else { i };
    if resolved < 0 || resolved >= len {
        return Err(Exception::new(ExcKind::IndexError, format!("{} index out of range", kind)));
    }
    Ok(resolved as usize)
}

pub fn get_item(object: &Value, index: &Value) -> Result<Value, Exception> {
    match object {
        Value::List(items) => {
            let items = items.borrow();
            let i = normalize_index(index, items.len(), "list")?;
            Ok(items[i].clone())
        }
        Value::Tuple(items) => {
            let i = normalize_index(index, items.len(), "tuple")?;
            Ok(items[i].clone())
        }
        Value::Str(s) => {
            let len = s.chars().count();
            let i = normalize_index(index, len, "string")?;
            Ok(Value::str(s.chars().nth(i).map(String::from).unwrap_or_default()))
        }
        Value::Dict(entries) => {
            check_key(index)?;
            dict_lookup(&entries.borrow(), index)?
                .ok_or_else(|| Exception::new(ExcKind::KeyError, index.repr()))
        }
        other => Err(Exception::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

pub fn set_item(object: &Value, index: Value, value: Value) -> Result<(), Exception> {
    match object {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let len = items.len();
            let i = normalize_index(&index, len, "list").map_err(|e| match e.kind {
                ExcKind::IndexError => {
                    Exception::new(ExcKind::IndexError, "list assignment index out of range")
                }
                _ => e,
            })?;
            items[i] = value;
            Ok(())
        }
        Value::Dict(entries) => {
            check_key(&index)?;
            let mut entries = entries.borrow_mut();
            let mut slot = None;
            for (i, (k, _)) in entries.iter().enumerate() {
                if py_eq(k, &index)? {
                    slot = Some(i);
                    break;
                }
            }
            match slot {
                Some(i) => entries[i].1 = value,
                None => entries.push((index, value)),
            }
            Ok(())
        }
        other => Err(Exception::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

fn slice_indices(len: usize, lower: Option<i64>, upper: Option<i64>, step: Option<i64>) -> Result<Vec<usize>, Exception> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(Exception::value_error("slice step cannot be zero"));
    }
    let len = len as i64;
    let mut out = Vec::new();
    if step > 0 {
        let clamp = |v: i64| if v < 0 { (v + len).max(0) } else { v.min(len) };
        let start = lower.map_or(0, clamp);
        let stop = upper.map_or(len, clamp);
        let mut i = start;
        while i < stop {
            out.push(i as usize);
            i += step;
        }
    } else {
        let clamp = |v: i64| if v < 0 { (v + len).max(-1) } else { v.min(len - 1) };
        let start = lower.map_or(len - 1, clamp);
        let stop = upper.map_or(-1, clamp);
        let mut i = start;
        while i > stop {
            out.push(i as usize);
            i += step;
        }
    }
    Ok(out)
}

pub fn slice(object: &Value, lower: Option<i64>, upper: Option<i64>, step: Option<i64>) -> Result<Value, Exception> {
    match object {
        Value::List(items) => {
            let items = items.borrow();
            let picked = slice_indices(items.len(), lower, upper, step)?;
            Ok(Value::list(picked.into_iter().map(|i| items[i].clone()).collect()))
        }
        Value::Tuple(items) => {
            let picked = slice_indices(items.len(), lower, upper, step)?;
            Ok(Value::tuple(picked.into_iter().map(|i| items[i].clone()).collect()))
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let picked = slice_indices(chars.len(), lower, upper, step)?;
            Ok(Value::str(picked.into_iter().map(|i| chars[i]).collect::<String>()))
        }
        other => Err(Exception::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

/// `item in container`.
pub fn contains(container: &Value, item: &Value) -> Result<bool, Exception> {
    match container {
        Value::Str(s) => match item {
            Value::Str(needle) => Ok(s.contains(&**needle)),
            other => Err(Exception::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(items) => Ok(position(&items.borrow(), item)?.is_some()),
        Value::Tuple(items) => Ok(position(items, item)?.is_some()),
        Value::Dict(entries) => {
            check_key(item)?;
            Ok(dict_lookup(&entries.borrow(), item)?.is_some())
        }
        other => Err(Exception::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

// ---- attributes and methods ----

fn has_method(value: &Value, name: &str) -> bool {
    match value {
        Value::Dict(_) => matches!(name, "get" | "keys" | "values" | "items"),
        Value::List(_) => matches!(name, "append" | "extend" | "index" | "count" | "pop"),
        Value::Str(_) => matches!(
            name,
            "strip" | "lower" | "upper" | "startswith" | "endswith" | "replace" | "split"
                | "isdigit" | "join" | "format"
        ),
        Value::Float(_) => name == "is_integer",
        _ => false,
    }
}

pub fn get_attribute(object: &Value, name: &str) -> Result<Value, Exception> {
    if let Value::Module(module) = object {
        return module_attr(module, name).ok_or_else(|| {
            Exception::new(
                ExcKind::AttributeError,
                format!("module '{}' has no attribute '{}'", module, name),
            )
        });
    }
    if let Value::Exception(exc) = object {
        if name == "args" {
            return Ok(Value::tuple(vec![Value::str(&exc.message)]));
        }
    }
    if has_method(object, name) {
        return Ok(Value::Method(Rc::new((object.clone(), name.to_string()))));
    }
    Err(Exception::new(
        ExcKind::AttributeError,
        format!("'{}' object has no attribute '{}'", object.type_name(), name),
    ))
}

pub fn call_method(
    _interp: &mut Interpreter,
    receiver: &Value,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Eval {
    no_kwargs(name, &kwargs)?;
    let result = match receiver {
        Value::Dict(entries) => dict_method(&entries.borrow(), name, &args),
        Value::List(items) => list_method(items, name, args),
        Value::Str(s) => str_method(s, name, &args),
        Value::Float(f) if name == "is_integer" => {
            arity(name, &args, 0, 0)?;
            Ok(Value::Bool(f.is_finite() && f.fract() == 0.0))
        }
        other => Err(Exception::new(
            ExcKind::AttributeError,
            format!("'{}' object has no attribute '{}'", other.type_name(), name),
        )),
    };
    Ok(result?)
}

fn dict_method(entries: &[(Value, Value)], name: &str, args: &[Value]) -> Result<Value, Exception> {
    match name {
        "get" => {
            arity(name, args, 1, 2)?;
            check_key(&args[0])?;
            Ok(dict_lookup(entries, &args[0])?.unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::None)))
        }
        "keys" => {
            arity(name, args, 0, 0)?;
            Ok(Value::list(entries.iter().map(|(k, _)| k.clone()).collect()))
        }
        "values" => {
            arity(name, args, 0, 0)?;
            Ok(Value::list(entries.iter().map(|(_, v)| v.clone()).collect()))
        }
        _ => {
            arity(name, args, 0, 0)?;
            Ok(Value::list(
                entries
                    .iter()
                    .map(|(k, v)| Value::tuple(vec![k.clone(), v.clone()]))
                    .collect(),
            ))
        }
    }
}

fn list_method(
    items: &Rc<std::cell::RefCell<Vec<Value>>>,
    name: &str,
    args: Vec<Value>,
) -> Result<Value, Exception> {
    match name {
        "append" => {
            arity(name, &args, 1, 1)?;
            let mut items = items.borrow_mut();
            if items.len() >= MAX_SEQUENCE_LEN {
                return Err(Exception::new(ExcKind::OverflowError, "list too large"));
            }
            items.extend(args);
            Ok(Value::None)
        }
        "extend" => {
            arity(name, &args, 1, 1)?;
            let extra = args[0].iterate()?;
            let mut items = items.borrow_mut();
            if items.len() + extra.len() > MAX_SEQUENCE_LEN {
                return Err(Exception::new(ExcKind::OverflowError, "list too large"));
            }
            items.extend(extra);
            Ok(Value::None)
        }
        "index" => {
            arity(name, &args, 1, 1)?;
            position(&items.borrow(), &args[0])?
                .map(|i| Value::Int(i as i64))
                .ok_or_else(|| Exception::value_error(format!("{} is not in list", args[0].repr())))
        }
        "count" => {
            arity(name, &args, 1, 1)?;
            let mut n = 0;
            for v in items.borrow().iter() {
                if py_eq(v, &args[0])? {
                    n += 1;
                }
            }
            Ok(Value::Int(n as i64))
        }
        _ => {
            arity(name, &args, 0, 1)?;
            let mut items = items.borrow_mut();
            if items.is_empty() {
                return Err(Exception::new(ExcKind::IndexError, "pop from empty list"));
            }
            let idx = match args.first() {
                Some(i) => normalize_index(i, items.len(), "pop")
                    .map_err(|_| Exception::new(ExcKind::IndexError, "pop index out of range"))?,
                None => items.len() - 1,
            };
            Ok(items.remove(idx))
        }
    }
}

fn str_arg<'a>(name: &str, value: &'a Value) -> Result<&'a str, Exception> {
    match value {
        Value::Str(s) => Ok(&**s),
        other => Err(Exception::type_error(format!(
            "{}() argument must be str, not {}",
            name,
            other.type_name()
        ))),
    }
}

fn affix_matches(name: &str, s: &str, arg: &Value, check: fn(&str, &str) -> bool) -> Result<bool, Exception> {
    match arg {
        Value::Tuple(options) => {
            for option in options.iter() {
                if check(s, str_arg(name, option)?) {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        other => Ok(check(s, str_arg(name, other)?)),
    }
}

fn str_method(s: &str, name: &str, args: &[Value]) -> Result<Value, Exception> {
    match name {
        "strip" => {
            arity(name, args, 0, 1)?;
            match args.first() {
                None | Some(Value::None) => Ok(Value::str(s.trim())),
                Some(chars) => {
                    let chars: Vec<char> = str_arg(name, chars)?.chars().collect();
                    Ok(Value::str(s.trim_matches(|c: char| chars.contains(&c))))
                }
            }
        }
        "lower" => {
            arity(name, args, 0, 0)?;
            Ok(Value::str(s.to_lowercase()))
        }
        "upper" => {
            arity(name, args, 0, 0)?;
            Ok(Value::str(s.to_uppercase()))
        }
        "startswith" => {
            arity(name, args, 1, 1)?;
            Ok(Value::Bool(affix_matches(name, s, &args[0], |s, p| s.starts_with(p))?))
        }
        "endswith" => {
            arity(name, args, 1, 1)?;
            Ok(Value::Bool(affix_matches(name, s, &args[0], |s, p| s.ends_with(p))?))
        }
        "replace" => {
            arity(name, args, 2, 2)?;
            let (from, to) = (str_arg(name, &args[0])?, str_arg(name, &args[1])?);
            let count = s.matches(from).count();
            let len = (s.len() - count * from.len()).saturating_add(count.saturating_mul(to.len()));
            if len > MAX_SEQUENCE_LEN {
                return Err(Exception::new(ExcKind::OverflowError, "result too large"));
            }
            Ok(Value::str(s.replace(from, to)))
        }
        "split" => {
            arity(name, args, 0, 1)?;
            let parts: Vec<Value> = match args.first() {
                None | Some(Value::None) => s.split_whitespace().map(Value::str).collect(),
                Some(sep) => {
                    let sep = str_arg(name, sep)?;
                    if sep.is_empty() {
                        return Err(Exception::value_error("empty separator"));
                    }
                    s.split(sep).map(Value::str).collect()
                }
            };
            Ok(Value::list(parts))
        }
        "isdigit" => {
            arity(name, args, 0, 0)?;
            Ok(Value::Bool(!s.is_empty() && s.chars().all(|c| c.is_numeric())))
        }
        "join" => {
            arity(name, args, 1, 1)?;
            let mut pieces = Vec::new();
            for (i, item) in args[0].iterate()?.iter().enumerate() {
                match item {
                    Value::Str(p) => pieces.push(p.to_string()),
                    other => {
                        return Err(Exception::type_error(format!(
                            "sequence item {}: expected str instance, {} found",
                            i,
                            other.type_name()
                        )));
                    }
                }
            }
            let len = pieces
                .iter()
                .map(String::len)
                .fold(s.len().saturating_mul(pieces.len().saturating_sub(1)), usize::saturating_add);
            if len > MAX_SEQUENCE_LEN {
                return Err(Exception::new(ExcKind::OverflowError, "result too large"));
            }
            Ok(Value::str(pieces.join(s)))
        }
        _ => str_format(s, args).map(Value::str),
    }
}

/// `"...".format(*args)` with positional fields only.
fn str_format(template: &str, args: &[Value]) -> Result<String, Exception> {
    let mut out = String::new();
    let mut chars = template.chars().peekable();
    let mut auto_index = 0;
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut field = String::new();
                let mut closed = false;
                for d in chars.by_ref() {
                    if d == '}' {
                        closed = true;
                        break;
                    }
                    field.push(d);
                }
                if !closed {
                    return Err(Exception::value_error("expected '}' before end of string"));
                }
                let (name, spec) = match field.split_once(':') {
                    Some((n, s)) => (n.to_string(), Some(s.to_string())),
                    None => (field, None),
                };
                let index = if name.is_empty() {
                    auto_index += 1;
                    auto_index - 1
                } else {
                    name.parse::<usize>()
                        .map_err(|_| Exception::new(ExcKind::KeyError, Value::str(&name).repr()))?
                };
                let value = args.get(index).ok_or_else(|| {
                    Exception::new(
                        ExcKind::IndexError,
                        format!("Replacement index {} out of range for positional args tuple", index),
                    )
                })?;
                out.push_str(&format_value(value, spec.as_deref())?);
                if out.len() > MAX_SEQUENCE_LEN {
                    return Err(Exception::new(ExcKind::OverflowError, "result too large"));
                }
            }
            '}' => return Err(Exception::value_error("Single '}' encountered in format string")),
            c => out.push(c),
        }
    }
    Ok(out)
}

// ---- format specs ----

#[derive(Debug, Default)]
struct FormatSpec {
    fill: Option<char>,
    align: Option<char>,
    sign: Option<char>,
    zero: bool,
    width: usize,
    grouping: Option<char>,
    precision: Option<usize>,
    kind: Option<char>,
}

fn parse_spec(spec: &str) -> Result<FormatSpec, Exception> {
    let chars: Vec<char> = spec.chars().collect();
    let invalid = || Exception::value_error("Invalid format specifier");
    let mut out = FormatSpec::default();
    let mut i = 0;
    let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');
    if chars.len() >= 2 && is_align(chars[1]) {
        out.fill = Some(chars[0]);
        out.align = Some(chars[1]);
        i = 2;
    } else if chars.first().is_some_and(|c| is_align(*c)) {
        out.align = Some(chars[0]);
        i = 1;
    }
    if let Some(&c) = chars.get(i) {
        if matches!(c, '+' | '-' | ' ') {
            out.sign = Some(c);
            i += 1;
        }
    }
    if chars.get(i) == Some(&'#') {
        i += 1;
    }
    if chars.get(i) == Some(&'0') {
        out.zero = true;
        i += 1;
    }
    let start = i;
    while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
        i += 1;
    }
    if i > start {
        out.width = chars[start..i].iter().collect::<String>().parse().map_err(|_| invalid())?;
    }
    if let Some(&c) = chars.get(i) {
        if matches!(c, ',' | '_') {
            out.grouping = Some(c);
            i += 1;
        }
    }
    if chars.get(i) == Some(&'.') {
        i += 1;
        let start = i;
        while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
            i += 1;
        }
        if i == start {
            return Err(Exception::value_error("Format specifier missing precision"));
        }
        out.precision = Some(chars[start..i].iter().collect::<String>().parse().map_err(|_| invalid())?);
    }
    if let Some(&c) = chars.get(i) {
        out.kind = Some(c);
        i += 1;
    }
    if i != chars.len() {
        return Err(invalid());
    }
    if out.width > MAX_SEQUENCE_LEN || out.precision.is_some_and(|p| p > MAX_SEQUENCE_LEN) {
        return Err(Exception::new(ExcKind::OverflowError, "result too large"));
    }
    Ok(out)
}

fn sci(x: f64, precision: usize, upper: bool) -> String {
    if !x.is_finite() {
        return float_repr(x);
    }
    let raw = format!("{:.*e}", precision, x);
    let (mantissa, exp) = raw.split_once('e').unwrap_or((raw.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let sign = if exp < 0 { '-' } else { '+' };
    let out = format!("{}e{}{:02}", mantissa, sign, exp.abs());
    if upper { out.to_uppercase() } else { out }
}

fn fixed(x: f64, precision: usize) -> String {
    if !x.is_finite() {
        return float_repr(x);
    }
    format!("{:.*}", precision, x)
}

fn general(x: f64, precision: usize) -> String {
    if !x.is_finite() {
        return float_repr(x);
    }
    if x == 0.0 {
        return "0".to_string();
    }
    let p = precision.max(1);
    let raw = format!("{:.*e}", p - 1, x);
    let exp: i32 = raw.split_once('e').and_then(|(_, e)| e.parse().ok()).unwrap_or(0);
    let strip = |s: String| -> String {
        if s.contains('.') {
            s.trim_end_matches('0').trim_end_matches('.').to_string()
        } else {
            s
        }
    };
    if exp >= -4 && exp < p as i32 {
        strip(format!("{:.*}", (p as i32 - 1 - exp).max(0) as usize, x))
    } else {
        let s = sci(x, p - 1, false);
        match s.split_once('e') {
            Some((m, e)) => format!("{}e{}", strip(m.to_string()), e),
            None => s,
        }
    }
}

fn group_digits(body: &str, sep: char) -> String {
    let (sign, rest) = match body.strip_prefix('-') {
        Some(r) => ("-", r),
        None => ("", body),
    };
    let int_len = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let (int_part, tail) = rest.split_at(int_len);
    let mut grouped = String::new();
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(sep);
        }
        grouped.push(c);
    }
    format!("{}{}{}", sign, grouped, tail)
}

/// Render a value under a format spec such as `.2f`, `.1%`, `,d` or `>10`.
pub fn format_value(value: &Value, spec: Option<&str>) -> Result<String, Exception> {
    let spec = match spec {
        None | Some("") => return Ok(value.to_str()),
        Some(s) => parse_spec(s)?,
    };
    let unknown = |code: char| {
        Exception::value_error(format!(
            "Unknown format code '{}' for object of type '{}'",
            code,
            value.type_name()
        ))
    };

    let is_int = matches!(value, Value::Int(_) | Value::Bool(_));
    let numeric = value.is_number();
    let mut body = match (spec.kind, value.as_f64()) {
        (Some('f' | 'F'), Some(x)) => fixed(x, spec.precision.unwrap_or(6)),
        (Some('%'), Some(x)) => format!("{}%", fixed(x * 100.0, spec.precision.unwrap_or(6))),
        (Some(c @ ('e' | 'E')), Some(x)) => sci(x, spec.precision.unwrap_or(6), c == 'E'),
        (Some('g' | 'G'), Some(x)) => general(x, spec.precision.unwrap_or(6)),
        (Some('d' | 'n'), Some(_)) if is_int => value.as_int().unwrap_or(0).to_string(),
        (None, Some(x)) if !is_int && spec.precision.is_some() => {
            general(x, spec.precision.unwrap_or(6))
        }
        (None, Some(_)) => value.to_str(),
        (Some('s') | None, None) => {
            let s = value.to_str();
            match spec.precision {
                Some(p) => s.chars().take(p).collect(),
                None => s,
            }
        }
        (Some(code), _) => return Err(unknown(code)),
    };

    if numeric {
        if let Some(sep) = spec.grouping {
            body = group_digits(&body, sep);
        }
        if !body.starts_with('-') {
            match spec.sign {
                Some('+') => body.insert(0, '+'),
                Some(' ') => body.insert(0, ' '),
                _ => {}
            }
        }
    }

    let len = body.chars().count();
    if len >= spec.width {
        return Ok(body);
    }
    let pad = spec.width - len;
    let (fill, align) = if spec.zero && spec.align.is_none() && numeric {
        ('0', '=')
    } else {
        (spec.fill.unwrap_or(' '), spec.align.unwrap_or(if numeric { '>' } else { '<' }))
    };
    let padding = |n: usize| std::iter::repeat_n(fill, n).collect::<String>();
    Ok(match align {
        '<' => format!("{}{}", body, padding(pad)),
        '^' => format!("{}{}{}", padding(pad / 2), body, padding(pad - pad / 2)),
        '=' => {
            let sign_len = if body.starts_with(['-', '+', ' ']) { 1 } else { 0 };
            let (sign, digits) = body.split_at(sign_len);
            format!("{}{}{}", sign, padding(pad), digits)
        }
        _ => format!("{}{}", padding(pad), body),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(v: Value, spec: &str) -> String {
        format_value(&v, Some(spec)).unwrap()
    }

    #[test]
    fn allow_list_is_exact() {
        assert!(lookup("len").is_some());
        assert!(lookup("ZeroDivisionError").is_some());
        for banned in ["open", "eval", "exec", "__import__", "getattr", "print", "range"] {
            assert!(lookup(banned).is_none(), "{} should not resolve", banned);
        }
    }

    #[test]
    fn only_math_is_importable() {
        assert!(matches!(import_module("math"), Ok(Value::Module("math"))));
        let err = import_module("os").unwrap_err();
        assert_eq!(err.kind, ExcKind::ImportError);
        assert!(import_module("numpy").is_err());
    }

    #[test]
    fn format_specs() {
        assert_eq!(fmt(Value::Float(0.12345), ".2f"), "0.12");
        assert_eq!(fmt(Value::Float(0.12345), ".1%"), "12.3%");
        assert_eq!(fmt(Value::Int(1234567), ","), "1,234,567");
        assert_eq!(fmt(Value::Float(1234567.891), ",.2f"), "1,234,567.89");
        assert_eq!(fmt(Value::Int(42), ">5"), "   42");
        assert_eq!(fmt(Value::str("ab"), "^6"), "  ab  ");
        assert_eq!(fmt(Value::Int(7), "03d"), "007");
        assert_eq!(fmt(Value::Float(12345.678), ".3g"), "1.23e+04");
        assert_eq!(fmt(Value::Float(0.5), "+.1f"), "+0.5");
        assert!(format_value(&Value::Float(1.5), Some("d")).is_err());
    }

    #[test]
    fn oversized_width_and_precision_overflow() {
        let err = format_value(&Value::Int(1), Some(">900000000")).unwrap_err();
        assert_eq!(err.kind, ExcKind::OverflowError);
        assert_eq!(err.message, "result too large");
        let err = format_value(&Value::Float(1.0), Some(".900000000f")).unwrap_err();
        assert_eq!(err.kind, ExcKind::OverflowError);
        assert!(str_format("{:>900000000}", &[Value::Int(1)]).is_err());
        let repeated = "{0:>999999}".repeat(3);
        assert_eq!(str_format(&repeated, &[Value::Int(1)]).unwrap_err().kind, ExcKind::OverflowError);
        assert_eq!(fmt(Value::Int(1), ">8").len(), 8);
    }

    #[test]
    fn string_growth_is_checked_before_building() {
        let big = Value::str("x".repeat(1000));
        let haystack = "a".repeat(10_000);
        let err = str_method(&haystack, "replace", &[Value::str("a"), big]).unwrap_err();
        assert_eq!(err.kind, ExcKind::OverflowError);
        let pieces = Value::list(vec![Value::str("y"); 10_000]);
        let err = str_method(&"z".repeat(1000), "join", &[pieces]).unwrap_err();
        assert_eq!(err.kind, ExcKind::OverflowError);
        assert_eq!(str_method("a-b", "replace", &[Value::str("-"), Value::str("+")]).unwrap().to_str(), "a+b");
        assert_eq!(str_method("ab", "replace", &[Value::str(""), Value::str(".")]).unwrap().to_str(), ".a.b.");
    }

    #[test]
    fn str_format_positional() {
        assert_eq!(str_format("{} is {:.1f}", &[Value::str("ratio"), Value::Float(0.25)]).unwrap(), "ratio is 0.2");
        assert_eq!(str_format("{1}{0}{{}}", &[Value::Int(1), Value::Int(2)]).unwrap(), "21{}");
    }

    #[test]
    fn rounding_is_bankers() {
        assert!(matches!(round(&Value::Float(2.5), None), Ok(Value::Int(2))));
        assert!(matches!(round(&Value::Float(3.5), None), Ok(Value::Int(4))));
        assert!(matches!(round(&Value::Float(1.2345), Some(2)), Ok(Value::Float(f)) if f == 1.23));
    }

    #[test]
    fn conversions() {
        assert!(matches!(parse_float(" 3.5 "), Ok(Value::Float(f)) if f == 3.5));
        assert!(matches!(parse_float("nan"), Ok(Value::Float(f)) if f.is_nan()));
        assert_eq!(parse_float("abc").unwrap_err().kind, ExcKind::ValueError);
        assert!(matches!(parse_int("42"), Ok(Value::Int(42))));
        assert_eq!(parse_int("4.2").unwrap_err().kind, ExcKind::ValueError);
        assert!(matches!(float_to_int(-3.9), Ok(Value::Int(-3))));
    }

    #[test]
    fn slicing() {
        let list = Value::list((0..6).map(Value::Int).collect());
        assert_eq!(slice(&list, Some(1), Some(4), None).unwrap().repr(), "[1, 2, 3]");
        assert_eq!(slice(&list, None, None, Some(-2)).unwrap().repr(), "[5, 3, 1]");
        assert_eq!(slice(&list, Some(-2), None, None).unwrap().repr(), "[4, 5]");
        assert_eq!(slice(&Value::str("营业收入"), Some(0), Some(2), None).unwrap().to_str(), "营业");
    }

    #[test]
    fn dict_access() {
        let d = Value::dict(vec![(Value::str("a"), Value::Int(1))]);
        assert!(matches!(get_item(&d, &Value::str("a")), Ok(Value::Int(1))));
        let err = get_item(&d, &Value::str("b")).unwrap_err();
        assert_eq!(err.kind, ExcKind::KeyError);
        assert_eq!(err.message, "'b'");
        set_item(&d, Value::str("a"), Value::Int(5)).unwrap();
        assert!(matches!(get_item(&d, &Value::str("a")), Ok(Value::Int(5))));
        assert!(contains(&d, &Value::str("a")).unwrap());
        assert!(get_item(&d, &Value::list(vec![])).is_err());
    }
}
