//! Runtime values and the numeric/comparison semantics shared by the interpreter and builtins.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use super::ast::{BinOp, FunctionDef};

/// Longest string or list a single operation may produce.
pub const MAX_SEQUENCE_LEN: usize = 1_000_000;

const MAX_REPR_DEPTH: usize = 32;

/// Container nesting a single comparison may follow.
const MAX_COMPARE_DEPTH: usize = 256;

thread_local! {
    /// Element visits made by comparisons since the interpreter last charged them.
    static COMPARE_VISITS: Cell<usize> = const { Cell::new(0) };
}

/// Drain the comparison visits recorded on this thread.
pub fn take_compare_visits() -> usize {
    COMPARE_VISITS.with(|visits| visits.replace(0))
}

pub type Scope = Rc<RefCell<HashMap<String, Value>>>;

pub fn new_scope() -> Scope {
    Rc::new(RefCell::new(HashMap::new()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcKind {
    Exception,
    ValueError,
    KeyError,
    TypeError,
    IndexError,
    ZeroDivisionError,
    AttributeError,
    NameError,
    ImportError,
    AssertionError,
    OverflowError,
    RuntimeError,
}

impl ExcKind {
    pub fn name(self) -> &'static str {
        match self {
            ExcKind::Exception => "Exception",
            ExcKind::ValueError => "ValueError",
            ExcKind::KeyError => "KeyError",
            ExcKind::TypeError => "TypeError",
            ExcKind::IndexError => "IndexError",
            ExcKind::ZeroDivisionError => "ZeroDivisionError",
            ExcKind::AttributeError => "AttributeError",
            ExcKind::NameError => "NameError",
            ExcKind::ImportError => "ImportError",
            ExcKind::AssertionError => "AssertionError",
            ExcKind::OverflowError => "OverflowError",
            ExcKind::RuntimeError => "RuntimeError",
        }
    }

    /// Every kind derives directly from `Exception`.
    pub fn is_subclass_of(self, other: ExcKind) -> bool {
        other == ExcKind::Exception || self == other
    }
}

#[derive(Debug, Clone)]
pub struct Exception {
    pub kind: ExcKind,
    pub message: String,
}

impl Exception {
    pub fn new(kind: ExcKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ExcKind::TypeError, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(ExcKind::ValueError, message)
    }

    pub fn zero_division(message: impl Into<String>) -> Self {
        Self::new(ExcKind::ZeroDivisionError, message)
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind.name())
        } else {
            write!(f, "{}: {}", self.kind.name(), self.message)
        }
    }
}

/// A user-defined function together with the scopes it closes over.
pub struct Closure {
    pub def: Rc<FunctionDef>,
    /// One slot per parameter; `Some` when the parameter has a default.
    pub defaults: Vec<Option<Value>>,
    pub scopes: Vec<Scope>,
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<function {}>", self.def.name)
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<[Value]>),
    /// Insertion-ordered; keys are compared with Python equality.
    Dict(Rc<RefCell<Vec<(Value, Value)>>>),
    Function(Rc<Closure>),
    Builtin(&'static str),
    Method(Rc<(Value, String)>),
    ExcType(ExcKind),
    Exception(Rc<Exception>),
    Module(&'static str),
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::Str(Rc::from(s.as_ref()))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Rc::from(items))
    }

    pub fn dict(entries: Vec<(Value, Value)>) -> Self {
        Value::Dict(Rc::new(RefCell::new(entries)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Function(_) => "function",
            Value::Builtin(_) | Value::Method(_) => "builtin_function_or_method",
            Value::ExcType(_) => "type",
            Value::Exception(e) => e.kind.name(),
            Value::Module(_) => "module",
        }
    }

    /// Elements held directly by a container, or bytes of a string. Zero for scalars.
    pub fn bulk_len(&self) -> usize {
        match self {
            Value::Str(s) => s.len(),
            Value::List(l) => l.borrow().len(),
            Value::Tuple(t) => t.len(),
            Value::Dict(d) => d.borrow().len(),
            _ => 0,
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.borrow().is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            Value::Dict(d) => !d.borrow().is_empty(),
            _ => true,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Bool(_) | Value::Int(_) | Value::Float(_))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(*b as i64),
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn is_hashable(&self) -> bool {
        match self {
            Value::List(_) | Value::Dict(_) => false,
            Value::Tuple(items) => items.iter().all(Value::is_hashable),
            _ => true,
        }
    }

    /// Items of an iterable, snapshotted.
    pub fn iterate(&self) -> Result<Vec<Value>, Exception> {
        match self {
            Value::List(l) => Ok(l.borrow().clone()),
            Value::Tuple(t) => Ok(t.to_vec()),
            Value::Dict(d) => Ok(d.borrow().iter().map(|(k, _)| k.clone()).collect()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::str(c.to_string())).collect()),
            other => Err(Exception::type_error(format!(
                "'{}' object is not iterable",
                other.type_name()
            ))),
        }
    }

    pub fn repr(&self) -> String {
        let mut out = String::new();
        self.write_repr(&mut out, 0);
        out
    }

    /// `str()` of the value.
    pub fn to_str(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            Value::Exception(e) => e.message.clone(),
            other => other.repr(),
        }
    }

    /// Output past [`MAX_SEQUENCE_LEN`] bytes is cut short with `...`.
    fn write_repr(&self, out: &mut String, depth: usize) {
        if depth > MAX_REPR_DEPTH || out.len() > MAX_SEQUENCE_LEN {
            out.push_str("...");
            return;
        }
        match self {
            Value::None => out.push_str("None"),
            Value::Bool(true) => out.push_str("True"),
            Value::Bool(false) => out.push_str("False"),
            Value::Int(i) => out.push_str(&i.to_string()),
            Value::Float(f) => out.push_str(&float_repr(*f)),
            Value::Str(s) => out.push_str(&str_repr(s)),
            Value::List(l) => {
                out.push('[');
                for (i, item) in l.borrow().iter().enumerate() {
                    if out.len() > MAX_SEQUENCE_LEN {
                        break;
                    }
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.write_repr(out, depth + 1);
                }
                out.push(']');
            }
            Value::Tuple(t) => {
                out.push('(');
                for (i, item) in t.iter().enumerate() {
                    if out.len() > MAX_SEQUENCE_LEN {
                        break;
                    }
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.write_repr(out, depth + 1);
                }
                if t.len() == 1 {
                    out.push(',');
                }
                out.push(')');
            }
            Value::Dict(d) => {
                out.push('{');
                for (i, (k, v)) in d.borrow().iter().enumerate() {
                    if out.len() > MAX_SEQUENCE_LEN {
                        break;
                    }
                    if i > 0 {
                        out.push_str(", ");
                    }
                    k.write_repr(out, depth + 1);
                    out.push_str(": ");
                    v.write_repr(out, depth + 1);
                }
                out.push('}');
            }
            Value::Function(c) => out.push_str(&format!("<function {}>", c.def.name)),
            Value::Builtin(name) => out.push_str(&format!("<built-in function {}>", name)),
            Value::Method(m) => out.push_str(&format!(
                "<built-in method {} of {} object>",
                m.1,
                m.0.type_name()
            )),
            Value::ExcType(kind) => out.push_str(&format!("<class '{}'>", kind.name())),
            Value::Exception(e) => {
                out.push_str(e.kind.name());
                out.push('(');
                if !e.message.is_empty() {
                    out.push_str(&str_repr(&e.message));
                }
                out.push(')');
            }
            Value::Module(name) => out.push_str(&format!("<module '{}'>", name)),
        }
    }
}

/// Python `==`.
pub fn py_eq(a: &Value, b: &Value) -> Result<bool, Exception> {
    Comparison::run(|cmp| cmp.eq(a, b, 0))
}

/// Python `is`, approximated by value for immutable scalars.
pub fn py_is(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::List(x), Value::List(y)) => Rc::ptr_eq(x, y),
        (Value::Dict(x), Value::Dict(y)) => Rc::ptr_eq(x, y),
        (Value::Tuple(x), Value::Tuple(y)) => Rc::ptr_eq(x, y),
        (Value::Float(x), Value::Float(y)) => x.to_bits() == y.to_bits(),
        (Value::ExcType(x), Value::ExcType(y)) => x == y,
        (Value::Function(x), Value::Function(y)) => Rc::ptr_eq(x, y),
        (Value::Builtin(x), Value::Builtin(y)) => x == y,
        (Value::Module(x), Value::Module(y)) => x == y,
        _ => false,
    }
}

/// Ordering for `<`-family operators. `None` when the types are unorderable,
/// `Some(None)` when either side is NaN.
pub fn py_cmp(a: &Value, b: &Value) -> Result<Option<Option<Ordering>>, Exception> {
    Comparison::run(|cmp| cmp.order(a, b, 0))
}

/// `a < b` with Python semantics.
pub fn py_lt(a: &Value, b: &Value) -> Result<bool, Exception> {
    match py_cmp(a, b)? {
        Some(ord) => Ok(ord == Some(Ordering::Less)),
        None => Err(unorderable("<", a, b)),
    }
}

/// One deep comparison. Nesting is capped at [`MAX_COMPARE_DEPTH`] and the element visits
/// pending on this thread at [`MAX_SEQUENCE_LEN`].
struct Comparison {
    visits: usize,
}

impl Comparison {
    fn run<T>(body: impl FnOnce(&mut Comparison) -> Result<T, Exception>) -> Result<T, Exception> {
        let mut cmp = Comparison { visits: COMPARE_VISITS.with(Cell::get) };
        let result = body(&mut cmp);
        COMPARE_VISITS.with(|visits| visits.set(cmp.visits));
        result
    }

    fn enter(&mut self, depth: usize) -> Result<(), Exception> {
        self.visits += 1;
        if depth > MAX_COMPARE_DEPTH {
            return Err(Exception::new(
                ExcKind::RuntimeError,
                "maximum recursion depth exceeded in comparison",
            ));
        }
        if self.visits > MAX_SEQUENCE_LEN {
            return Err(Exception::new(ExcKind::RuntimeError, "comparison too large"));
        }
        Ok(())
    }

    fn eq(&mut self, a: &Value, b: &Value, depth: usize) -> Result<bool, Exception> {
        self.enter(depth)?;
        match (a, b) {
            (Value::List(x), Value::List(y)) => {
                if Rc::ptr_eq(x, y) {
                    return Ok(true);
                }
                self.seq_eq(&x.borrow(), &y.borrow(), depth)
            }
            (Value::Tuple(x), Value::Tuple(y)) => self.seq_eq(x, y, depth),
            (Value::Dict(x), Value::Dict(y)) => {
                if Rc::ptr_eq(x, y) {
                    return Ok(true);
                }
                let (x, y) = (x.borrow(), y.borrow());
                if x.len() != y.len() {
                    return Ok(false);
                }
                for (k, v) in x.iter() {
                    let mut found = false;
                    for (k2, v2) in y.iter() {
                        if self.eq(k, k2, depth + 1)? && self.eq(v, v2, depth + 1)? {
                            found = true;
                            break;
                        }
                    }
                    if !found {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            _ => Ok(scalar_eq(a, b)),
        }
    }

    fn seq_eq(&mut self, x: &[Value], y: &[Value], depth: usize) -> Result<bool, Exception> {
        if x.len() != y.len() {
            return Ok(false);
        }
        for (p, q) in x.iter().zip(y.iter()) {
            if !self.eq(p, q, depth + 1)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn order(&mut self, a: &Value, b: &Value, depth: usize) -> Result<Option<Option<Ordering>>, Exception> {
        self.enter(depth)?;
        match (a, b) {
            (Value::List(x), Value::List(y)) => self.seq_order(&x.borrow(), &y.borrow(), depth),
            (Value::Tuple(x), Value::Tuple(y)) => self.seq_order(x, y, depth),
            _ => Ok(scalar_order(a, b)),
        }
    }

    fn seq_order(&mut self, x: &[Value], y: &[Value], depth: usize) -> Result<Option<Option<Ordering>>, Exception> {
        for (p, q) in x.iter().zip(y.iter()) {
            if !self.eq(p, q, depth + 1)? {
                return self.order(p, q, depth + 1);
            }
        }
        Ok(Some(Some(x.len().cmp(&y.len()))))
    }
}

fn scalar_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::ExcType(x), Value::ExcType(y)) => x == y,
        (Value::Function(x), Value::Function(y)) => Rc::ptr_eq(x, y),
        (Value::Builtin(x), Value::Builtin(y)) => x == y,
        (Value::Module(x), Value::Module(y)) => x == y,
        (Value::Exception(x), Value::Exception(y)) => Rc::ptr_eq(x, y),
        _ => match (a.as_int(), b.as_int()) {
            (Some(x), Some(y)) => x == y,
            _ => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        },
    }
}

fn scalar_order(a: &Value, b: &Value) -> Option<Option<Ordering>> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Some(Some(x.cmp(y))),
        _ => match (a.as_int(), b.as_int()) {
            (Some(x), Some(y)) => Some(Some(x.cmp(&y))),
            _ => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => Some(x.partial_cmp(&y)),
                _ => None,
            },
        },
    }
}

pub fn unorderable(op: &str, a: &Value, b: &Value) -> Exception {
    Exception::type_error(format!(
        "'{}' not supported between instances of '{}' and '{}'",
        op,
        a.type_name(),
        b.type_name()
    ))
}

/// Integer result, or the float fallback when the operation overflows `i64`.
fn int_or_float(checked: Option<i64>, fallback: f64) -> Value {
    checked.map(Value::Int).unwrap_or(Value::Float(fallback))
}

pub fn binary_op(op: BinOp, a: &Value, b: &Value) -> Result<Value, Exception> {
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        return int_op(op, x, y);
    }
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return float_op(op, x, y);
    }

    match (op, a, b) {
        (BinOp::Add, Value::Str(x), Value::Str(y)) => {
            check_len(x.len() + y.len())?;
            Ok(Value::str(format!("{}{}", x, y)))
        }
        (BinOp::Add, Value::List(x), Value::List(y)) => {
            let mut items = x.borrow().clone();
            items.extend(y.borrow().iter().cloned());
            check_len(items.len())?;
            Ok(Value::list(items))
        }
        (BinOp::Add, Value::Tuple(x), Value::Tuple(y)) => {
            let items: Vec<Value> = x.iter().chain(y.iter()).cloned().collect();
            check_len(items.len())?;
            Ok(Value::tuple(items))
        }
        (BinOp::Mul, seq, n) | (BinOp::Mul, n, seq)
            if matches!(seq, Value::Str(_) | Value::List(_) | Value::Tuple(_))
                && matches!(n, Value::Int(_) | Value::Bool(_)) =>
        {
            let count = n.as_int().unwrap_or(0).max(0) as usize;
            repeat(seq, count)
        }
        _ => Err(Exception::type_error(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn repeat(seq: &Value, count: usize) -> Result<Value, Exception> {
    match seq {
        Value::Str(s) => {
            check_len(s.len().saturating_mul(count))?;
            Ok(Value::str(s.repeat(count)))
        }
        Value::List(l) => {
            let items = l.borrow();
            check_len(items.len().saturating_mul(count))?;
            let mut out = Vec::with_capacity(items.len() * count);
            for _ in 0..count {
                out.extend(items.iter().cloned());
            }
            Ok(Value::list(out))
        }
        Value::Tuple(t) => {
            check_len(t.len().saturating_mul(count))?;
            let mut out = Vec::with_capacity(t.len() * count);
            for _ in 0..count {
                out.extend(t.iter().cloned());
            }
            Ok(Value::tuple(out))
        }
        _ => Err(Exception::type_error("can't multiply sequence")),
    }
}

fn check_len(len: usize) -> Result<(), Exception> {
    if len > MAX_SEQUENCE_LEN {
        return Err(Exception::new(ExcKind::OverflowError, "result too large"));
    }
    Ok(())
}

fn int_op(op: BinOp, x: i64, y: i64) -> Result<Value, Exception> {
    let (fx, fy) = (x as f64, y as f64);
    Ok(match op {
        BinOp::Add => int_or_float(x.checked_add(y), fx + fy),
        BinOp::Sub => int_or_float(x.checked_sub(y), fx - fy),
        BinOp::Mul => int_or_float(x.checked_mul(y), fx * fy),
        BinOp::Div => {
            if y == 0 {
                return Err(Exception::zero_division("division by zero"));
            }
            Value::Float(fx / fy)
        }
        BinOp::FloorDiv => {
            if y == 0 {
                return Err(Exception::zero_division("integer division or modulo by zero"));
            }
            match x.checked_div(y) {
                Some(q) if x % y != 0 && ((x < 0) != (y < 0)) => Value::Int(q - 1),
                Some(q) => Value::Int(q),
                None => Value::Float((fx / fy).floor()),
            }
        }
        BinOp::Mod => {
            if y == 0 {
                return Err(Exception::zero_division("integer division or modulo by zero"));
            }
            let r = x.checked_rem(y).unwrap_or(0);
            Value::Int(if r != 0 && ((r < 0) != (y < 0)) { r + y } else { r })
        }
        BinOp::Pow => {
            if y < 0 {
                if x == 0 {
                    return Err(Exception::zero_division(
                        "0.0 cannot be raised to a negative power",
                    ));
                }
                Value::Float(fx.powf(fy))
            } else {
                let checked = u32::try_from(y).ok().and_then(|e| x.checked_pow(e));
                int_or_float(checked, fx.powf(fy))
            }
        }
    })
}

pub fn py_fmod(x: f64, y: f64) -> f64 {
    let r = x % y;
    if r != 0.0 && ((r < 0.0) != (y < 0.0)) { r + y } else { r }
}

fn float_op(op: BinOp, x: f64, y: f64) -> Result<Value, Exception> {
    Ok(Value::Float(match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => {
            if y == 0.0 {
                return Err(Exception::zero_division("float division by zero"));
            }
            x / y
        }
        BinOp::FloorDiv => {
            if y == 0.0 {
                return Err(Exception::zero_division("float floor division by zero"));
            }
            (x / y).floor()
        }
        BinOp::Mod => {
            if y == 0.0 {
                return Err(Exception::zero_division("float modulo"));
            }
            py_fmod(x, y)
        }
        BinOp::Pow => {
            if x == 0.0 && y < 0.0 {
                return Err(Exception::zero_division(
                    "0.0 cannot be raised to a negative power",
                ));
            }
            if x < 0.0 && y.fract() != 0.0 {
                return Err(Exception::value_error("math domain error"));
            }
            let r = x.powf(y);
            if r.is_infinite() && x.is_finite() && y.is_finite() {
                return Err(Exception::new(ExcKind::OverflowError, "(34, 'Numerical result out of range')"));
            }
            r
        }
    }))
}

/// Python's `repr(float)`: shortest round-trip digits, exponent form outside `1e-4..1e16`.
pub fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if f == 0.0 {
        return if f.is_sign_negative() { "-0.0" } else { "0.0" }.to_string();
    }
    let sci = format!("{:e}", f);
    let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    if (-4..16).contains(&exp) {
        let plain = f.to_string();
        if plain.contains('.') { plain } else { format!("{}.0", plain) }
    } else {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exp.abs())
    }
}

pub fn str_repr(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_control() => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_repr_matches_python() {
        assert_eq!(float_repr(1.0), "1.0");
        assert_eq!(float_repr(0.1), "0.1");
        assert_eq!(float_repr(-2.5), "-2.5");
        assert_eq!(float_repr(1e16), "1e+16");
        assert_eq!(float_repr(1.5e-5), "1.5e-05");
        assert_eq!(float_repr(123456.789), "123456.789");
        assert_eq!(float_repr(f64::INFINITY), "inf");
    }

    #[test]
    fn floor_division_and_modulo_follow_divisor_sign() {
        assert!(matches!(binary_op(BinOp::FloorDiv, &Value::Int(-7), &Value::Int(2)), Ok(Value::Int(-4))));
        assert!(matches!(binary_op(BinOp::Mod, &Value::Int(-7), &Value::Int(2)), Ok(Value::Int(1))));
        assert!(matches!(binary_op(BinOp::Mod, &Value::Int(7), &Value::Int(-2)), Ok(Value::Int(-1))));
        match binary_op(BinOp::Mod, &Value::Float(-1.5), &Value::Float(1.0)) {
            Ok(Value::Float(r)) => assert_eq!(r, 0.5),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn true_division_always_floats() {
        assert!(matches!(binary_op(BinOp::Div, &Value::Int(4), &Value::Int(2)), Ok(Value::Float(f)) if f == 2.0));
        let err = binary_op(BinOp::Div, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert_eq!(err.kind, ExcKind::ZeroDivisionError);
    }

    #[test]
    fn integer_overflow_degrades_to_float() {
        assert!(matches!(
            binary_op(BinOp::Mul, &Value::Int(i64::MAX), &Value::Int(2)),
            Ok(Value::Float(_))
        ));
        assert!(matches!(binary_op(BinOp::Pow, &Value::Int(2), &Value::Int(10)), Ok(Value::Int(1024))));
    }

    #[test]
    fn mixed_types_raise_type_error() {
        let err = binary_op(BinOp::Add, &Value::str("a"), &Value::Int(1)).unwrap_err();
        assert_eq!(err.kind, ExcKind::TypeError);
        assert!(err.message.contains("'str' and 'int'"));
    }

    #[test]
    fn numeric_equality_crosses_types() {
        assert!(py_eq(&Value::Int(1), &Value::Float(1.0)).unwrap());
        assert!(py_eq(&Value::Bool(true), &Value::Int(1)).unwrap());
        assert!(!py_eq(&Value::str("1"), &Value::Int(1)).unwrap());
        assert_eq!(py_cmp(&Value::Int(1), &Value::Float(1.5)).unwrap(), Some(Some(Ordering::Less)));
        assert_eq!(py_cmp(&Value::str("a"), &Value::Int(1)).unwrap(), None);
        assert_eq!(py_cmp(&Value::Float(f64::NAN), &Value::Int(1)).unwrap(), Some(None));
        assert!(!py_lt(&Value::Float(f64::NAN), &Value::Int(1)).unwrap());
        take_compare_visits();
    }

    fn self_containing_list() -> Value {
        let list = Value::list(vec![Value::Int(1)]);
        if let Value::List(items) = &list {
            items.borrow_mut().push(list.clone());
        }
        list
    }

    fn clear_list(value: &Value) {
        if let Value::List(items) = value {
            items.borrow_mut().clear();
        }
    }

    #[test]
    fn cyclic_comparison_raises_instead_of_recursing() {
        let (a, b) = (self_containing_list(), self_containing_list());
        assert!(py_eq(&a, &a).unwrap());
        let err = py_eq(&a, &b).unwrap_err();
        assert_eq!(err.kind, ExcKind::RuntimeError);
        assert!(err.message.contains("recursion"));
        assert!(py_cmp(&a, &b).is_err());
        take_compare_visits();
        clear_list(&a);
        clear_list(&b);
    }

    #[test]
    fn shared_structure_comparison_is_bounded() {
        // 2^40 paths through 40 shared pairs.
        let (mut x, mut y) = (Value::Int(0), Value::Int(0));
        for _ in 0..40 {
            x = Value::list(vec![x.clone(), x]);
            y = Value::list(vec![y.clone(), y]);
        }
        let err = py_eq(&x, &y).unwrap_err();
        assert_eq!(err.message, "comparison too large");
        assert!(take_compare_visits() > MAX_SEQUENCE_LEN);
        assert!(py_eq(&Value::Int(1), &Value::Int(1)).unwrap());
        assert_eq!(take_compare_visits(), 1);
    }

    #[test]
    fn repr_output_is_capped() {
        let mut v = Value::list(vec![Value::Int(1_000_000); 1000]);
        for _ in 0..3 {
            v = Value::list(vec![v; 1000]);
        }
        let text = v.repr();
        assert!(text.len() < MAX_SEQUENCE_LEN + 1000);
        assert!(text.starts_with("[[[[1000000, "));
        assert!(text.ends_with("]]]]"));

        let cyclic = self_containing_list();
        assert_eq!(cyclic.repr().matches('[').count(), MAX_REPR_DEPTH + 1);
        clear_list(&cyclic);
    }

    #[test]
    fn repr_of_containers() {
        let v = Value::dict(vec![
            (Value::str("a"), Value::list(vec![Value::Int(1), Value::Float(2.0)])),
            (Value::str("b"), Value::tuple(vec![Value::None])),
        ]);
        assert_eq!(v.repr(), "{'a': [1, 2.0], 'b': (None,)}");
        assert_eq!(Value::str("it's").repr(), "\"it's\"");
    }
}
