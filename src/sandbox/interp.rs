//! Tree-walking evaluator with a step budget and a call-depth limit.

use std::rc::Rc;

use super::ast::*;
use super::builtins;
use super::value::{
    Closure, ExcKind, Exception, MAX_SEQUENCE_LEN, Scope, Value, binary_op, new_scope, py_cmp,
    py_eq, py_is, take_compare_visits, unorderable,
};

/// Elements a bulk operation may touch for one step of the budget.
const ELEMENTS_PER_STEP: u64 = 64;

/// Non-local exits from evaluation.
#[derive(Debug)]
pub enum Unwind {
    /// A snippet-level exception, catchable by `try`/`except`.
    Raise(Exception),
    /// Resource limit hit; never caught by snippet code.
    Abort(String),
}

impl From<Exception> for Unwind {
    fn from(exc: Exception) -> Self {
        Unwind::Raise(exc)
    }
}

pub type Eval<T = Value> = Result<T, Unwind>;

#[derive(Debug)]
enum Flow {
    Next,
    Return(Value),
    Break,
    Continue,
}

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_steps: u64,
    pub max_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self { max_steps: 200_000, max_depth: 64 }
    }
}

/// Local scopes from outermost to innermost; empty at module level.
#[derive(Clone, Default)]
struct Env {
    scopes: Vec<Scope>,
}

impl Env {
    fn nested(&self) -> Env {
        let mut scopes = self.scopes.clone();
        scopes.push(new_scope());
        Env { scopes }
    }
}

pub struct Interpreter {
    globals: Scope,
    limits: Limits,
    steps: u64,
    /// Bulk elements not yet converted into steps.
    elements: u64,
    depth: usize,
    handling: Vec<Exception>,
}

impl Interpreter {
    pub fn new(limits: Limits) -> Self {
        take_compare_visits();
        Self { globals: new_scope(), limits, steps: 0, elements: 0, depth: 0, handling: Vec::new() }
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Execute top-level statements, populating the global scope.
    pub fn run_module(&mut self, module: &Module) -> Eval<()> {
        let mut env = Env::default();
        self.exec_block(&module.body, &mut env)?;
        Ok(())
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.borrow().get(name).cloned()
    }

    /// Drop every global binding, breaking reference cycles through closures.
    pub fn clear(&mut self) {
        self.globals.borrow_mut().clear();
    }

    fn tick(&mut self) -> Eval<()> {
        self.steps += 1;
        self.charge(0)
    }

    /// Charge `elements` of bulk work, plus the comparison visits made since the last charge,
    /// at [`ELEMENTS_PER_STEP`] elements per step.
    fn charge(&mut self, elements: usize) -> Eval<()> {
        self.elements = self
            .elements
            .saturating_add(elements as u64)
            .saturating_add(take_compare_visits() as u64);
        self.steps = self.steps.saturating_add(self.elements / ELEMENTS_PER_STEP);
        self.elements %= ELEMENTS_PER_STEP;
        if self.steps > self.limits.max_steps {
            return Err(Unwind::Abort(format!(
                "step budget of {} exhausted",
                self.limits.max_steps
            )));
        }
        Ok(())
    }

    // ---- statements ----

    fn exec_block(&mut self, body: &[Stmt], env: &mut Env) -> Eval<Flow> {
        for stmt in body {
            match self.exec(stmt, env)? {
                Flow::Next => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Next)
    }

    fn exec(&mut self, stmt: &Stmt, env: &mut Env) -> Eval<Flow> {
        self.tick()?;
        match stmt {
            Stmt::Expr(expr) => {
                self.eval(expr, env)?;
            }
            Stmt::Assign { targets, value } => {
                let value = self.eval(value, env)?;
                for target in targets {
                    self.assign(target, value.clone(), env)?;
                }
            }
            Stmt::AugAssign { target, op, value } => {
                let current = match target {
                    Target::Name(name) => self.lookup(name, env)?,
                    Target::Subscript { object, index } => {
                        let object = self.eval(object, env)?;
                        let index = self.eval(index, env)?;
                        builtins::get_item(&object, &index)?
                    }
                    Target::Tuple(_) => {
                        return Err(Exception::new(
                            ExcKind::RuntimeError,
                            "illegal expression for augmented assignment",
                        )
                        .into());
                    }
                };
                let rhs = self.eval(value, env)?;
                let updated = match (&current, op) {
                    // In-place list extension keeps aliasing intact.
                    (Value::List(items), BinOp::Add) if matches!(rhs, Value::List(_) | Value::Tuple(_)) => {
                        let extra = rhs.iterate()?;
                        self.charge(extra.len())?;
                        let mut items = items.borrow_mut();
                        if items.len() + extra.len() > MAX_SEQUENCE_LEN {
                            return Err(Exception::new(ExcKind::OverflowError, "list too large").into());
                        }
                        items.extend(extra);
                        current.clone()
                    }
                    _ => {
                        let result = binary_op(*op, &current, &rhs)?;
                        self.charge(result.bulk_len())?;
                        result
                    }
                };
                self.assign(target, updated, env)?;
            }
            Stmt::If { branches, orelse } => {
                for (cond, body) in branches {
                    if self.eval(cond, env)?.truthy() {
                        return self.exec_block(body, env);
                    }
                }
                return self.exec_block(orelse, env);
            }
            Stmt::For { target, iter, body, orelse } => {
                let items = self.eval(iter, env)?.iterate()?;
                self.charge(items.len())?;
                for item in items {
                    self.tick()?;
                    self.assign(target, item, env)?;
                    match self.exec_block(body, env)? {
                        Flow::Break => return Ok(Flow::Next),
                        Flow::Continue | Flow::Next => {}
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
                return self.exec_block(orelse, env);
            }
            Stmt::While { cond, body, orelse } => {
                loop {
                    self.tick()?;
                    if !self.eval(cond, env)?.truthy() {
                        break;
                    }
                    match self.exec_block(body, env)? {
                        Flow::Break => return Ok(Flow::Next),
                        Flow::Continue | Flow::Next => {}
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
                return self.exec_block(orelse, env);
            }
            Stmt::Try { body, handlers, orelse, finally } => {
                return self.exec_try(body, handlers, orelse, finally, env);
            }
            Stmt::FunctionDef(def) => {
                let closure = self.make_closure(def, env)?;
                self.set(&def.name, closure, env);
            }
            Stmt::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, env)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            Stmt::Raise(value) => return Err(self.raise(value.as_ref(), env)?),
            Stmt::Assert { test, msg } => {
                if !self.eval(test, env)?.truthy() {
                    let message = match msg {
                        Some(expr) => self.eval(expr, env)?.to_str(),
                        None => String::new(),
                    };
                    return Err(Exception::new(ExcKind::AssertionError, message).into());
                }
            }
            Stmt::Import { module, alias } => {
                let value = builtins::import_module(module)?;
                let name = alias.as_deref().unwrap_or(module.as_str());
                self.set(name, value, env);
            }
            Stmt::ImportFrom { module, names } => {
                builtins::import_module(module)?;
                for (name, alias) in names {
                    if name == "*" {
                        for (attr, value) in builtins::module_exports(module) {
                            self.set(attr, value, env);
                        }
                        continue;
                    }
                    let value = builtins::module_attr(module, name).ok_or_else(|| {
                        Exception::new(
                            ExcKind::ImportError,
                            format!("cannot import name '{}' from '{}'", name, module),
                        )
                    })?;
                    self.set(alias.as_deref().unwrap_or(name), value, env);
                }
            }
            Stmt::Pass => {}
            Stmt::Break => return Ok(Flow::Break),
            Stmt::Continue => return Ok(Flow::Continue),
        }
        Ok(Flow::Next)
    }

    fn exec_try(
        &mut self,
        body: &[Stmt],
        handlers: &[Handler],
        orelse: &[Stmt],
        finally: &[Stmt],
        env: &mut Env,
    ) -> Eval<Flow> {
        let outcome = match self.exec_block(body, env) {
            Err(Unwind::Raise(exc)) => self.handle(exc, handlers, env),
            Ok(Flow::Next) => self.exec_block(orelse, env),
            other => other,
        };
        if finally.is_empty() || matches!(outcome, Err(Unwind::Abort(_))) {
            return outcome;
        }
        match self.exec_block(finally, env)? {
            Flow::Next => outcome,
            overriding => Ok(overriding),
        }
    }

    fn handle(&mut self, exc: Exception, handlers: &[Handler], env: &mut Env) -> Eval<Flow> {
        for handler in handlers {
            let matched = match &handler.kinds {
                None => true,
                Some(kinds) => {
                    let kinds = self.eval(kinds, env)?;
                    exception_matches(&exc, &kinds)?
                }
            };
            if !matched {
                continue;
            }
            if let Some(name) = &handler.binding {
                self.set(name, Value::Exception(Rc::new(exc.clone())), env);
            }
            self.handling.push(exc);
            let result = self.exec_block(&handler.body, env);
            self.handling.pop();
            return result;
        }
        Err(Unwind::Raise(exc))
    }

    fn raise(&mut self, value: Option<&Expr>, env: &mut Env) -> Eval<Unwind> {
        let Some(expr) = value else {
            return Ok(match self.handling.last() {
                Some(exc) => Unwind::Raise(exc.clone()),
                None => Unwind::Raise(Exception::new(
                    ExcKind::RuntimeError,
                    "No active exception to reraise",
                )),
            });
        };
        let exc = match self.eval(expr, env)? {
            Value::ExcType(kind) => Exception::new(kind, ""),
            Value::Exception(exc) => (*exc).clone(),
            _ => Exception::type_error("exceptions must derive from BaseException"),
        };
        Ok(Unwind::Raise(exc))
    }

    fn make_closure(&mut self, def: &Rc<FunctionDef>, env: &mut Env) -> Eval {
        let mut defaults = Vec::with_capacity(def.params.len());
        for param in &def.params {
            defaults.push(match &param.default {
                Some(expr) => Some(self.eval(expr, env)?),
                None => None,
            });
        }
        Ok(Value::Function(Rc::new(Closure {
            def: Rc::clone(def),
            defaults,
            scopes: env.scopes.clone(),
        })))
    }

    // ---- names and targets ----

    fn set(&mut self, name: &str, value: Value, env: &Env) {
        let scope = env.scopes.last().unwrap_or(&self.globals);
        scope.borrow_mut().insert(name.to_string(), value);
    }

    fn lookup(&self, name: &str, env: &Env) -> Eval {
        for scope in env.scopes.iter().rev() {
            if let Some(value) = scope.borrow().get(name) {
                return Ok(value.clone());
            }
        }
        if let Some(value) = self.globals.borrow().get(name) {
            return Ok(value.clone());
        }
        builtins::lookup(name).ok_or_else(|| {
            Exception::new(ExcKind::NameError, format!("name '{}' is not defined", name)).into()
        })
    }

    fn assign(&mut self, target: &Target, value: Value, env: &mut Env) -> Eval<()> {
        match target {
            Target::Name(name) => self.set(name, value, env),
            Target::Tuple(targets) => {
                let items = value.iterate()?;
                if items.len() != targets.len() {
                    let message = if items.len() > targets.len() {
                        format!("too many values to unpack (expected {})", targets.len())
                    } else {
                        format!(
                            "not enough values to unpack (expected {}, got {})",
                            targets.len(),
                            items.len()
                        )
                    };
                    return Err(Exception::value_error(message).into());
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item, env)?;
                }
            }
            Target::Subscript { object, index } => {
                let object = self.eval(object, env)?;
                let index = self.eval(index, env)?;
                builtins::set_item(&object, index, value)?;
            }
        }
        Ok(())
    }

    // ---- expressions ----

    fn eval(&mut self, expr: &Expr, env: &mut Env) -> Eval {
        match expr {
            Expr::Literal(lit) => Ok(match lit {
                Literal::None => Value::None,
                Literal::Bool(b) => Value::Bool(*b),
                Literal::Int(i) => Value::Int(*i),
                Literal::Float(f) => Value::Float(*f),
                Literal::Str(s) => Value::str(s),
            }),
            Expr::Name(name) => self.lookup(name, env),
            Expr::List(items) => Ok(Value::list(self.eval_all(items, env)?)),
            Expr::Tuple(items) => Ok(Value::tuple(self.eval_all(items, env)?)),
            Expr::Dict(pairs) => {
                let dict = Value::dict(Vec::with_capacity(pairs.len()));
                for (key, value) in pairs {
                    let key = self.eval(key, env)?;
                    let value = self.eval(value, env)?;
                    builtins::set_item(&dict, key, value)?;
                }
                Ok(dict)
            }
            Expr::FString(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        FStringPart::Text(text) => out.push_str(text),
                        FStringPart::Value { expr, spec } => {
                            let value = self.eval(expr, env)?;
                            out.push_str(&builtins::format_value(&value, spec.as_deref())?);
                            if out.len() > MAX_SEQUENCE_LEN {
                                return Err(Exception::new(ExcKind::OverflowError, "result too large").into());
                            }
                        }
                    }
                }
                self.charge(out.len())?;
                Ok(Value::str(out))
            }
            Expr::Unary { op, operand } => {
                let value = self.eval(operand, env)?;
                Ok(unary(*op, &value)?)
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left, env)?;
                let right = self.eval(right, env)?;
                let result = binary_op(*op, &left, &right)?;
                self.charge(result.bulk_len())?;
                Ok(result)
            }
            Expr::Bool { op, left, right } => {
                let left = self.eval(left, env)?;
                match (op, left.truthy()) {
                    (BoolOp::And, false) | (BoolOp::Or, true) => Ok(left),
                    _ => self.eval(right, env),
                }
            }
            Expr::Compare { left, rest } => {
                let mut left = self.eval(left, env)?;
                for (op, right) in rest {
                    let right = self.eval(right, env)?;
                    let outcome = compare(*op, &left, &right);
                    self.charge(right.bulk_len())?;
                    if !outcome? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::IfExp { cond, then, orelse } => {
                if self.eval(cond, env)?.truthy() {
                    self.eval(then, env)
                } else {
                    self.eval(orelse, env)
                }
            }
            Expr::Call { func, args, kwargs } => {
                let func = self.eval(func, env)?;
                let args = self.eval_all(args, env)?;
                let mut kw = Vec::with_capacity(kwargs.len());
                for (name, value) in kwargs {
                    kw.push((name.clone(), self.eval(value, env)?));
                }
                self.call(&func, args, kw)
            }
            Expr::Attribute { object, name } => {
                let object = self.eval(object, env)?;
                Ok(builtins::get_attribute(&object, name)?)
            }
            Expr::Subscript { object, index } => {
                let object = self.eval(object, env)?;
                if let Expr::Slice { lower, upper, step } = index.as_ref() {
                    let lower = self.eval_bound(lower.as_deref(), env)?;
                    let upper = self.eval_bound(upper.as_deref(), env)?;
                    let step = self.eval_bound(step.as_deref(), env)?;
                    let result = builtins::slice(&object, lower, upper, step)?;
                    self.charge(object.bulk_len())?;
                    return Ok(result);
                }
                let index = self.eval(index, env)?;
                let outcome = builtins::get_item(&object, &index);
                // String indexing walks characters; dict lookups are charged as comparisons.
                self.charge(if matches!(object, Value::Str(_)) { object.bulk_len() } else { 0 })?;
                Ok(outcome?)
            }
            Expr::Slice { .. } => Err(Exception::type_error("slice outside of a subscript").into()),
            Expr::ListComp { element, generators } => {
                let mut inner = env.nested();
                let mut out = Vec::new();
                self.comprehension(generators, &mut inner, &mut |interp, env| {
                    out.push(interp.eval(element, env)?);
                    Ok(())
                })?;
                Ok(Value::list(out))
            }
            Expr::DictComp { key, value, generators } => {
                let mut inner = env.nested();
                let dict = Value::dict(Vec::new());
                self.comprehension(generators, &mut inner, &mut |interp, env| {
                    let k = interp.eval(key, env)?;
                    let v = interp.eval(value, env)?;
                    builtins::set_item(&dict, k, v)?;
                    Ok(())
                })?;
                Ok(dict)
            }
            Expr::Lambda(def) => self.make_closure(def, env),
        }
    }

    fn eval_all(&mut self, exprs: &[Expr], env: &mut Env) -> Eval<Vec<Value>> {
        exprs.iter().map(|e| self.eval(e, env)).collect()
    }

    fn eval_bound(&mut self, expr: Option<&Expr>, env: &mut Env) -> Eval<Option<i64>> {
        let Some(expr) = expr else { return Ok(None) };
        match self.eval(expr, env)? {
            Value::None => Ok(None),
            v => v.as_int().map(Some).ok_or_else(|| {
                Exception::type_error(
                    "slice indices must be integers or None or have an __index__ method",
                )
                .into()
            }),
        }
    }

    fn comprehension(
        &mut self,
        generators: &[Comprehension],
        env: &mut Env,
        produce: &mut dyn FnMut(&mut Interpreter, &mut Env) -> Eval<()>,
    ) -> Eval<()> {
        let Some((first, rest)) = generators.split_first() else {
            return produce(self, env);
        };
        let items = self.eval(&first.iter, env)?.iterate()?;
        self.charge(items.len())?;
        'items: for item in items {
            self.tick()?;
            self.assign(&first.target, item, env)?;
            for cond in &first.conditions {
                if !self.eval(cond, env)?.truthy() {
                    continue 'items;
                }
            }
            self.comprehension(rest, env, produce)?;
        }
        Ok(())
    }

    // ---- calls ----

    pub fn call(&mut self, func: &Value, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Eval {
        match func {
            Value::Function(closure) => self.call_closure(closure, args, kwargs),
            Value::Builtin(name) => {
                let work = argument_work(name, &args);
                let result = builtins::call_builtin(self, name, args, kwargs);
                self.charge_call(work, result)
            }
            Value::Method(bound) => {
                let (receiver, name) = (&bound.0, &bound.1);
                let mut work = argument_work(name, &args);
                if matches!(receiver, Value::Str(_)) {
                    work += receiver.bulk_len();
                }
                let result = builtins::call_method(self, receiver, name, args, kwargs);
                self.charge_call(work, result)
            }
            Value::ExcType(kind) => {
                if !kwargs.is_empty() {
                    return Err(Exception::type_error(format!(
                        "{}() takes no keyword arguments",
                        kind.name()
                    ))
                    .into());
                }
                let message = match args.as_slice() {
                    [] => String::new(),
                    [single] if *kind == ExcKind::KeyError => single.repr(),
                    [single] => single.to_str(),
                    many => Value::tuple(many.to_vec()).repr(),
                };
                Ok(Value::Exception(Rc::new(Exception::new(*kind, message))))
            }
            other => Err(Exception::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))
            .into()),
        }
    }

    fn charge_call(&mut self, work: usize, result: Eval) -> Eval {
        let produced = result.as_ref().map(Value::bulk_len).unwrap_or(0);
        self.charge(work.saturating_add(produced))?;
        result
    }

    fn call_closure(
        &mut self,
        closure: &Rc<Closure>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Eval {
        self.tick()?;
        if self.depth >= self.limits.max_depth {
            return Err(Unwind::Abort(format!(
                "maximum call depth of {} exceeded",
                self.limits.max_depth
            )));
        }
        let def = &closure.def;
        let params = &def.params;
        if args.len() > params.len() {
            return Err(Exception::type_error(format!(
                "{}() takes {} positional argument{} but {} {} given",
                def.name,
                params.len(),
                if params.len() == 1 { "" } else { "s" },
                args.len(),
                if args.len() == 1 { "was" } else { "were" }
            ))
            .into());
        }

        let mut slots: Vec<Option<Value>> = args.into_iter().map(Some).collect();
        slots.resize(params.len(), None);
        for (name, value) in kwargs {
            let Some(idx) = params.iter().position(|p| p.name == name) else {
                return Err(Exception::type_error(format!(
                    "{}() got an unexpected keyword argument '{}'",
                    def.name, name
                ))
                .into());
            };
            if slots[idx].is_some() {
                return Err(Exception::type_error(format!(
                    "{}() got multiple values for argument '{}'",
                    def.name, name
                ))
                .into());
            }
            slots[idx] = Some(value);
        }

        let locals = new_scope();
        for (idx, (param, slot)) in params.iter().zip(slots).enumerate() {
            let value = match slot.or_else(|| closure.defaults.get(idx).cloned().flatten()) {
                Some(v) => v,
                None => {
                    return Err(Exception::type_error(format!(
                        "{}() missing 1 required positional argument: '{}'",
                        def.name, param.name
                    ))
                    .into());
                }
            };
            locals.borrow_mut().insert(param.name.clone(), value);
        }

        let mut scopes = closure.scopes.clone();
        scopes.push(locals);
        let mut env = Env { scopes };

        self.depth += 1;
        let result = self.exec_block(&def.body, &mut env);
        self.depth -= 1;
        match result? {
            Flow::Return(value) => Ok(value),
            _ => Ok(Value::None),
        }
    }
}

/// Elements a builtin walks in its arguments; `len` of a container is constant time.
fn argument_work(name: &str, args: &[Value]) -> usize {
    args.iter()
        .filter(|arg| name != "len" || matches!(arg, Value::Str(_)))
        .map(Value::bulk_len)
        .sum()
}

fn exception_matches(exc: &Exception, kinds: &Value) -> Eval<bool> {
    match kinds {
        Value::ExcType(kind) => Ok(exc.kind.is_subclass_of(*kind)),
        Value::Tuple(items) => {
            for item in items.iter() {
                if exception_matches(exc, item)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(Exception::type_error(
            "catching classes that do not inherit from BaseException is not allowed",
        )
        .into()),
    }
}

fn unary(op: UnaryOp, value: &Value) -> Result<Value, Exception> {
    match (op, value) {
        (UnaryOp::Not, v) => Ok(Value::Bool(!v.truthy())),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Pos, Value::Float(f)) => Ok(Value::Float(*f)),
        (UnaryOp::Neg, v) if v.as_int().is_some() => {
            let i = v.as_int().unwrap_or(0);
            Ok(i.checked_neg().map(Value::Int).unwrap_or(Value::Float(-(i as f64))))
        }
        (UnaryOp::Pos, v) if v.as_int().is_some() => Ok(Value::Int(v.as_int().unwrap_or(0))),
        (op, v) => Err(Exception::type_error(format!(
            "bad operand type for unary {}: '{}'",
            if op == UnaryOp::Neg { "-" } else { "+" },
            v.type_name()
        ))),
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, Exception> {
    use std::cmp::Ordering::*;
    let ordered = |symbol: &str, accept: &[std::cmp::Ordering]| -> Result<bool, Exception> {
        match py_cmp(left, right)? {
            Some(Some(ord)) => Ok(accept.contains(&ord)),
            Some(None) => Ok(false),
            None => Err(unorderable(symbol, left, right)),
        }
    };
    match op {
        CmpOp::Eq => py_eq(left, right),
        CmpOp::NotEq => py_eq(left, right).map(|eq| !eq),
        CmpOp::Lt => ordered("<", &[Less]),
        CmpOp::LtE => ordered("<=", &[Less, Equal]),
        CmpOp::Gt => ordered(">", &[Greater]),
        CmpOp::GtE => ordered(">=", &[Greater, Equal]),
        CmpOp::In => builtins::contains(right, left),
        CmpOp::NotIn => builtins::contains(right, left).map(|found| !found),
        CmpOp::Is => Ok(py_is(left, right)),
        CmpOp::IsNot => Ok(!py_is(left, right)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::parser::parse;

    fn run(src: &str, name: &str) -> Eval {
        let module = parse(src).expect("parse");
        let mut interp = Interpreter::new(Limits::default());
        interp.run_module(&module)?;
        let func = interp.global(name).expect("function defined");
        interp.call(&func, Vec::new(), Vec::new())
    }

    fn run_to_abort(src: &str) -> (Eval, Interpreter) {
        let module = parse(src).expect("parse");
        let mut interp = Interpreter::new(Limits::default());
        interp.run_module(&module).expect("module runs");
        let func = interp.global("f").expect("function defined");
        let outcome = interp.call(&func, Vec::new(), Vec::new());
        (outcome, interp)
    }

    fn value(src: &str) -> Value {
        run(src, "f").expect("no exception")
    }

    #[test]
    fn closures_see_enclosing_locals() {
        let v = value(
            "def f():\n    scale = 3\n    xs = [1, 5, 2]\n    return max(xs, key=lambda x: -x * scale)\n",
        );
        assert!(matches!(v, Value::Int(1)));
    }

    #[test]
    fn comprehension_variables_do_not_leak() {
        let err = run("def f():\n    ys = [x for x in [1, 2]]\n    return x\n", "f").unwrap_err();
        assert!(matches!(err, Unwind::Raise(e) if e.kind == ExcKind::NameError));
    }

    #[test]
    fn try_except_else_finally_order() {
        let v = value(
            "def f():\n    log = []\n    try:\n        log.append('body')\n    except ValueError:\n        log.append('handler')\n    else:\n        log.append('else')\n    finally:\n        log.append('finally')\n    return log\n",
        );
        assert_eq!(v.repr(), "['body', 'else', 'finally']");
    }

    #[test]
    fn handler_tuple_and_binding() {
        let v = value(
            "def f():\n    try:\n        return {}['missing']\n    except (ValueError, KeyError) as e:\n        return str(e)\n",
        );
        assert_eq!(v.to_str(), "'missing'");
    }

    #[test]
    fn unmatched_exception_propagates() {
        let err = run("def f():\n    try:\n        1 / 0\n    except KeyError:\n        return 1\n", "f")
            .unwrap_err();
        assert!(matches!(err, Unwind::Raise(e) if e.kind == ExcKind::ZeroDivisionError));
    }

    #[test]
    fn bare_raise_reraises_current() {
        let err = run(
            "def f():\n    try:\n        int('x')\n    except ValueError:\n        raise\n",
            "f",
        )
        .unwrap_err();
        assert!(matches!(err, Unwind::Raise(e) if e.kind == ExcKind::ValueError));
    }

    #[test]
    fn finally_return_overrides() {
        let v = value("def f():\n    try:\n        return 1\n    finally:\n        return 2\n");
        assert!(matches!(v, Value::Int(2)));
    }

    #[test]
    fn loops_with_break_and_else() {
        let v = value(
            "def f():\n    total = 0\n    for v in [1, 2, 3, 4]:\n        if v == 3:\n            break\n        total += v\n    else:\n        total = -1\n    n = 0\n    while n < 5:\n        n += 1\n    else:\n        n *= 10\n    return total, n\n",
        );
        assert_eq!(v.repr(), "(3, 50)");
    }

    #[test]
    fn infinite_loop_aborts_uncatchably() {
        let src = "def f():\n    try:\n        while True:\n            pass\n    except Exception:\n        return False\n";
        assert!(matches!(run(src, "f"), Err(Unwind::Abort(_))));
    }

    #[test]
    fn runaway_recursion_aborts() {
        let src = "def f():\n    return f()\n";
        assert!(matches!(run(src, "f"), Err(Unwind::Abort(msg)) if msg.contains("depth")));
    }

    #[test]
    fn keyword_arguments_and_defaults() {
        let v = value(
            "def g(a, b=10, c=100):\n    return a + b + c\ndef f():\n    return g(1, c=2)\n",
        );
        assert!(matches!(v, Value::Int(13)));
        let err = run("def g(a):\n    return a\ndef f():\n    return g()\n", "f").unwrap_err();
        assert!(matches!(err, Unwind::Raise(e) if e.kind == ExcKind::TypeError));
    }

    #[test]
    fn tuple_unpacking_and_subscript_assignment() {
        let v = value(
            "def f():\n    d = {}\n    for k, v in [('a', 1), ('b', 2)]:\n        d[k] = v * 2\n    d['a'] += 5\n    return d\n",
        );
        assert_eq!(v.repr(), "{'a': 7, 'b': 4}");
    }

    #[test]
    fn chained_comparisons_short_circuit() {
        let v = value("def f():\n    x = 5\n    return 0 < x <= 5 < 6, 1 < x < 3\n");
        assert_eq!(v.repr(), "(True, False)");
    }

    #[test]
    fn augmented_list_add_mutates_in_place() {
        let v = value("def f():\n    a = [1]\n    b = a\n    a += [2]\n    return b\n");
        assert_eq!(v.repr(), "[1, 2]");
    }

    #[test]
    fn bulk_allocation_is_charged_per_element() {
        let src = "rounds = []\ndef f():\n    n = 0\n    try:\n        while True:\n            x = [0] * 999999\n            n = n + sum(x) + 1\n            rounds.append(n)\n    except Exception:\n        return n\n";
        let (outcome, interp) = run_to_abort(src);
        assert!(matches!(outcome, Err(Unwind::Abort(msg)) if msg.contains("step budget")));
        let rounds = interp.global("rounds").map(|r| r.bulk_len()).unwrap_or(0);
        assert!(rounds < 10, "{} rounds ran", rounds);
    }

    #[test]
    fn string_scans_are_charged() {
        let src = "def f():\n    s = 'a' * 999999\n    while True:\n        found = 'b' in s\n";
        let (outcome, interp) = run_to_abort(src);
        assert!(matches!(outcome, Err(Unwind::Abort(_))));
        assert!(interp.steps() > Limits::default().max_steps);
    }

    #[test]
    fn in_place_list_growth_is_capped() {
        let v = value(
            "def f():\n    a = [0]\n    try:\n        while True:\n            a += a\n    except OverflowError:\n        return len(a)\n",
        );
        assert!(matches!(v, Value::Int(n) if n as usize <= MAX_SEQUENCE_LEN));
    }

    #[test]
    fn cyclic_equality_raises_catchable_error() {
        let v = value(
            "def f():\n    a = [1]\n    a.append(a)\n    b = [1]\n    b.append(b)\n    try:\n        return a == b\n    except RuntimeError:\n        return 'cycle'\n",
        );
        assert_eq!(v.to_str(), "cycle");
    }

    #[test]
    fn raise_custom_message() {
        let err = run("def f():\n    raise ValueError('bad ratio')\n", "f").unwrap_err();
        match err {
            Unwind::Raise(e) => assert_eq!(e.to_string(), "ValueError: bad ratio"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
