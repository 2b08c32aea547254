//! Recursive-descent parser producing the [`ast`](super::ast) tree.

use std::rc::Rc;

use super::SyntaxError;
use super::ast::*;
use super::lexer::{Tok, Token, tokenize};

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

const AUG_OPS: &[(&str, BinOp)] = &[
    ("+=", BinOp::Add),
    ("-=", BinOp::Sub),
    ("*=", BinOp::Mul),
    ("/=", BinOp::Div),
    ("//=", BinOp::FloorDiv),
    ("%=", BinOp::Mod),
    ("**=", BinOp::Pow),
];

/// Deepest block, bracket or operator nesting a snippet may use.
const MAX_NESTING: usize = 64;

/// Parse a complete snippet into a module.
pub fn parse(source: &str) -> Result<Module, SyntaxError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0, depth: 0 };
    let mut body = Vec::new();
    loop {
        match parser.peek() {
            Tok::Eof => break,
            Tok::Newline => parser.pos += 1,
            _ => body.extend(parser.statement()?),
        }
    }
    Ok(Module { body })
}

fn parse_standalone_expr(source: &str, line: usize, depth: usize) -> Result<Expr, SyntaxError> {
    let tokens = tokenize(source.trim()).map_err(|e| SyntaxError { line, message: e.message })?;
    let mut parser = Parser { tokens, pos: 0, depth };
    let expr = parser.testlist().map_err(|e| SyntaxError { line, message: e.message })?;
    while matches!(parser.peek(), Tok::Newline) {
        parser.pos += 1;
    }
    if !matches!(parser.peek(), Tok::Eof) {
        return Err(SyntaxError { line, message: "f-string: invalid expression".to_string() });
    }
    Ok(expr)
}

fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        self.tokens.get(self.pos).map(|t| &t.tok).unwrap_or(&Tok::Eof)
    }

    fn peek_next(&self) -> &Tok {
        self.tokens.get(self.pos + 1).map(|t| &t.tok).unwrap_or(&Tok::Eof)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn err<T>(&self, message: impl Into<String>) -> Result<T, SyntaxError> {
        Err(SyntaxError { line: self.line(), message: message.into() })
    }

    /// Enter one nesting level; callers restore `depth` when they return.
    fn descend(&mut self) -> Result<(), SyntaxError> {
        if self.depth >= MAX_NESTING {
            return self.err("too deeply nested");
        }
        self.depth += 1;
        Ok(())
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn is_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.is_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), SyntaxError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            self.err(format!("expected '{}', found {}", op, describe(self.peek())))
        }
    }

    fn is_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Name(n) if n == kw)
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.is_kw(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: &str) -> Result<(), SyntaxError> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            self.err(format!("expected '{}', found {}", kw, describe(self.peek())))
        }
    }

    fn expect_name(&mut self) -> Result<String, SyntaxError> {
        match self.peek().clone() {
            Tok::Name(n) if !is_keyword(&n) => {
                self.pos += 1;
                Ok(n)
            }
            other => self.err(format!("expected a name, found {}", describe(&other))),
        }
    }

    fn end_of_line(&mut self) -> Result<(), SyntaxError> {
        match self.peek() {
            Tok::Newline => {
                self.pos += 1;
                Ok(())
            }
            Tok::Eof | Tok::Dedent => Ok(()),
            other => self.err(format!("invalid syntax near {}", describe(other))),
        }
    }

    // ---- statements ----

    fn statement(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        match self.peek().clone() {
            Tok::Indent => self.err("unexpected indent"),
            Tok::Name(kw) => match kw.as_str() {
                "def" => Ok(vec![self.function_def()?]),
                "if" => Ok(vec![self.if_stmt()?]),
                "for" => Ok(vec![self.for_stmt()?]),
                "while" => Ok(vec![self.while_stmt()?]),
                "try" => Ok(vec![self.try_stmt()?]),
                "class" | "with" | "async" | "global" | "nonlocal" | "del" | "yield" => {
                    self.err(format!("'{}' statements are not supported", kw))
                }
                _ => self.simple_line(),
            },
            _ => self.simple_line(),
        }
    }

    fn simple_line(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        let mut stmts = Vec::new();
        loop {
            stmts.extend(self.simple_stmt()?);
            if !self.eat_op(";") {
                break;
            }
            if matches!(self.peek(), Tok::Newline | Tok::Eof) {
                break;
            }
        }
        self.end_of_line()?;
        Ok(stmts)
    }

    fn block(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        self.descend()?;
        let body = self.block_body();
        self.depth -= 1;
        body
    }

    fn block_body(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        self.expect_op(":")?;
        if !matches!(self.peek(), Tok::Newline) {
            return self.simple_line();
        }
        self.pos += 1;
        if !matches!(self.peek(), Tok::Indent) {
            return self.err("expected an indented block");
        }
        self.pos += 1;
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Tok::Dedent => {
                    self.pos += 1;
                    break;
                }
                Tok::Eof => break,
                Tok::Newline => self.pos += 1,
                _ => body.extend(self.statement()?),
            }
        }
        Ok(body)
    }

    fn function_def(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.line();
        self.expect_kw("def")?;
        let name = self.expect_name()?;
        self.expect_op("(")?;
        let params = self.params(")")?;
        self.expect_op(")")?;
        if self.eat_op("->") {
            self.test()?;
        }
        let body = self.block()?;
        Ok(Stmt::FunctionDef(Rc::new(FunctionDef { name, params, body, line })))
    }

    fn params(&mut self, close: &str) -> Result<Vec<Param>, SyntaxError> {
        let mut params: Vec<Param> = Vec::new();
        while !self.is_op(close) {
            if self.is_op("*") || self.is_op("**") || self.is_op("/") {
                return self.err("variadic and positional-only parameters are not supported");
            }
            let name = self.expect_name()?;
            if params.iter().any(|p| p.name == name) {
                return self.err(format!("duplicate argument '{}' in function definition", name));
            }
            if close == ")" && self.eat_op(":") {
                self.test()?;
            }
            let default = if self.eat_op("=") { Some(self.test()?) } else { None };
            if default.is_none() && params.iter().any(|p| p.default.is_some()) {
                return self.err("non-default argument follows default argument");
            }
            params.push(Param { name, default });
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(params)
    }

    fn if_stmt(&mut self) -> Result<Stmt, SyntaxError> {
        self.expect_kw("if")?;
        let mut branches = Vec::new();
        let cond = self.test()?;
        branches.push((cond, self.block()?));
        let mut orelse = Vec::new();
        loop {
            if self.eat_kw("elif") {
                let cond = self.test()?;
                branches.push((cond, self.block()?));
            } else if self.eat_kw("else") {
                orelse = self.block()?;
                break;
            } else {
                break;
            }
        }
        Ok(Stmt::If { branches, orelse })
    }

    fn for_stmt(&mut self) -> Result<Stmt, SyntaxError> {
        self.expect_kw("for")?;
        let target = self.target_list()?;
        self.expect_kw("in")?;
        let iter = self.testlist()?;
        let body = self.block()?;
        let orelse = if self.eat_kw("else") { self.block()? } else { Vec::new() };
        Ok(Stmt::For { target, iter, body, orelse })
    }

    fn while_stmt(&mut self) -> Result<Stmt, SyntaxError> {
        self.expect_kw("while")?;
        let cond = self.test()?;
        let body = self.block()?;
        let orelse = if self.eat_kw("else") { self.block()? } else { Vec::new() };
        Ok(Stmt::While { cond, body, orelse })
    }

    fn try_stmt(&mut self) -> Result<Stmt, SyntaxError> {
        self.expect_kw("try")?;
        let body = self.block()?;
        let mut handlers = Vec::new();
        while self.eat_kw("except") {
            let (kinds, binding) = if self.is_op(":") {
                (None, None)
            } else {
                let kinds = self.test()?;
                let binding = if self.eat_kw("as") { Some(self.expect_name()?) } else { None };
                (Some(kinds), binding)
            };
            let body = self.block()?;
            handlers.push(Handler { kinds, binding, body });
        }
        let orelse = if !handlers.is_empty() && self.eat_kw("else") {
            self.block()?
        } else {
            Vec::new()
        };
        let finally = if self.eat_kw("finally") { self.block()? } else { Vec::new() };
        if handlers.is_empty() && finally.is_empty() {
            return self.err("expected 'except' or 'finally' block");
        }
        Ok(Stmt::Try { body, handlers, orelse, finally })
    }

    fn simple_stmt(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        if let Tok::Name(kw) = self.peek().clone() {
            match kw.as_str() {
                "pass" => {
                    self.pos += 1;
                    return Ok(vec![Stmt::Pass]);
                }
                "break" => {
                    self.pos += 1;
                    return Ok(vec![Stmt::Break]);
                }
                "continue" => {
                    self.pos += 1;
                    return Ok(vec![Stmt::Continue]);
                }
                "return" => {
                    self.pos += 1;
                    let value = if self.at_stmt_end() { None } else { Some(self.testlist()?) };
                    return Ok(vec![Stmt::Return(value)]);
                }
                "raise" => {
                    self.pos += 1;
                    let value = if self.at_stmt_end() { None } else { Some(self.test()?) };
                    if self.eat_kw("from") {
                        self.test()?;
                    }
                    return Ok(vec![Stmt::Raise(value)]);
                }
                "assert" => {
                    self.pos += 1;
                    let test = self.test()?;
                    let msg = if self.eat_op(",") { Some(self.test()?) } else { None };
                    return Ok(vec![Stmt::Assert { test, msg }]);
                }
                "import" => {
                    self.pos += 1;
                    let mut stmts = Vec::new();
                    loop {
                        let module = self.dotted_name()?;
                        let alias = if self.eat_kw("as") { Some(self.expect_name()?) } else { None };
                        stmts.push(Stmt::Import { module, alias });
                        if !self.eat_op(",") {
                            break;
                        }
                    }
                    return Ok(stmts);
                }
                "from" => {
                    self.pos += 1;
                    let module = self.dotted_name()?;
                    self.expect_kw("import")?;
                    let mut names = Vec::new();
                    if self.eat_op("*") {
                        names.push(("*".to_string(), None));
                    } else {
                        let paren = self.eat_op("(");
                        loop {
                            if paren && self.is_op(")") {
                                break;
                            }
                            let name = self.expect_name()?;
                            let alias = if self.eat_kw("as") { Some(self.expect_name()?) } else { None };
                            names.push((name, alias));
                            if !self.eat_op(",") {
                                break;
                            }
                        }
                        if paren {
                            self.expect_op(")")?;
                        }
                    }
                    return Ok(vec![Stmt::ImportFrom { module, names }]);
                }
                _ => {}
            }
        }
        self.expr_stmt().map(|s| vec![s])
    }

    fn dotted_name(&mut self) -> Result<String, SyntaxError> {
        let mut name = self.expect_name()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.expect_name()?);
        }
        Ok(name)
    }

    fn at_stmt_end(&self) -> bool {
        matches!(self.peek(), Tok::Newline | Tok::Eof | Tok::Dedent) || self.is_op(";")
    }

    fn expr_stmt(&mut self) -> Result<Stmt, SyntaxError> {
        let first = self.testlist()?;

        for (symbol, op) in AUG_OPS {
            if self.eat_op(symbol) {
                let target = self.to_target(first)?;
                if matches!(target, Target::Tuple(_)) {
                    return self.err("illegal expression for augmented assignment");
                }
                let value = self.testlist()?;
                return Ok(Stmt::AugAssign { target, op: *op, value });
            }
        }

        if self.eat_op(":") {
            let target = self.to_target(first)?;
            self.test()?;
            if self.eat_op("=") {
                let value = self.testlist()?;
                return Ok(Stmt::Assign { targets: vec![target], value });
            }
            return Ok(Stmt::Pass);
        }

        if !self.is_op("=") {
            return Ok(Stmt::Expr(first));
        }
        let mut exprs = vec![first];
        while self.eat_op("=") {
            exprs.push(self.testlist()?);
        }
        let value = exprs.pop().unwrap_or(Expr::Literal(Literal::None));
        let targets = exprs
            .into_iter()
            .map(|e| self.to_target(e))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Stmt::Assign { targets, value })
    }

    fn to_target(&self, expr: Expr) -> Result<Target, SyntaxError> {
        match expr {
            Expr::Name(name) => Ok(Target::Name(name)),
            Expr::Tuple(items) | Expr::List(items) => Ok(Target::Tuple(
                items
                    .into_iter()
                    .map(|e| self.to_target(e))
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            Expr::Subscript { object, index } => Ok(Target::Subscript { object: *object, index: *index }),
            Expr::Attribute { .. } => self.err("attribute assignment is not supported"),
            _ => self.err("cannot assign to expression"),
        }
    }

    /// Targets of `for` loops and comprehensions; stops before `in`.
    fn target_list(&mut self) -> Result<Target, SyntaxError> {
        let first = self.arith()?;
        if !self.is_op(",") {
            return self.to_target(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_kw("in") {
                break;
            }
            items.push(self.arith()?);
        }
        self.to_target(Expr::Tuple(items))
    }

    // ---- expressions ----

    fn can_start_expr(&self) -> bool {
        match self.peek() {
            Tok::Name(n) => {
                !is_keyword(n) || matches!(n.as_str(), "True" | "False" | "None" | "not" | "lambda")
            }
            Tok::Int(_) | Tok::Float(_) | Tok::Str(_) | Tok::FStr(_) => true,
            Tok::Op(op) => matches!(*op, "(" | "[" | "{" | "-" | "+" | "~" | "..."),
            _ => false,
        }
    }

    /// One or more comma-separated expressions; more than one becomes a tuple.
    fn testlist(&mut self) -> Result<Expr, SyntaxError> {
        let first = self.test()?;
        if !self.is_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if !self.can_start_expr() {
                break;
            }
            items.push(self.test()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn test(&mut self) -> Result<Expr, SyntaxError> {
        self.descend()?;
        let expr = self.conditional();
        self.depth -= 1;
        expr
    }

    fn conditional(&mut self) -> Result<Expr, SyntaxError> {
        if self.is_kw("lambda") {
            return self.lambda();
        }
        let value = self.or_test()?;
        if self.eat_kw("if") {
            let cond = self.or_test()?;
            self.expect_kw("else")?;
            let orelse = self.test()?;
            return Ok(Expr::IfExp {
                cond: Box::new(cond),
                then: Box::new(value),
                orelse: Box::new(orelse),
            });
        }
        Ok(value)
    }

    fn lambda(&mut self) -> Result<Expr, SyntaxError> {
        let line = self.line();
        self.expect_kw("lambda")?;
        let params = self.params(":")?;
        self.expect_op(":")?;
        let body = self.test()?;
        Ok(Expr::Lambda(Rc::new(FunctionDef {
            name: "<lambda>".to_string(),
            params,
            body: vec![Stmt::Return(Some(body))],
            line,
        })))
    }

    fn or_test(&mut self) -> Result<Expr, SyntaxError> {
        let base = self.depth;
        let expr = self.or_chain();
        self.depth = base;
        expr
    }

    // Each link of a left-associative chain nests the tree one level deeper.
    fn or_chain(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.and_test()?;
        while self.eat_kw("or") {
            self.descend()?;
            let right = self.and_test()?;
            left = Expr::Bool { op: BoolOp::Or, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn and_test(&mut self) -> Result<Expr, SyntaxError> {
        let base = self.depth;
        let expr = self.and_chain();
        self.depth = base;
        expr
    }

    fn and_chain(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.not_test()?;
        while self.eat_kw("and") {
            self.descend()?;
            let right = self.not_test()?;
            left = Expr::Bool { op: BoolOp::And, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn not_test(&mut self) -> Result<Expr, SyntaxError> {
        if self.eat_kw("not") {
            self.descend()?;
            let operand = self.not_test();
            self.depth -= 1;
            return Ok(Expr::Unary { op: UnaryOp::Not, operand: Box::new(operand?) });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, SyntaxError> {
        let left = self.arith()?;
        let mut rest = Vec::new();
        loop {
            let tok = self.peek().clone();
            let op = match &tok {
                Tok::Op("==") => CmpOp::Eq,
                Tok::Op("!=") => CmpOp::NotEq,
                Tok::Op("<") => CmpOp::Lt,
                Tok::Op("<=") => CmpOp::LtE,
                Tok::Op(">") => CmpOp::Gt,
                Tok::Op(">=") => CmpOp::GtE,
                Tok::Name(n) if n == "in" => CmpOp::In,
                Tok::Name(n) if n == "not" && matches!(self.peek_next(), Tok::Name(m) if m == "in") => {
                    self.pos += 1;
                    CmpOp::NotIn
                }
                Tok::Name(n) if n == "is" => {
                    if matches!(self.peek_next(), Tok::Name(m) if m == "not") {
                        self.pos += 1;
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    }
                }
                _ => break,
            };
            self.pos += 1;
            rest.push((op, self.arith()?));
        }
        if rest.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare { left: Box::new(left), rest })
        }
    }

    fn arith(&mut self) -> Result<Expr, SyntaxError> {
        let base = self.depth;
        let expr = self.arith_chain();
        self.depth = base;
        expr
    }

    fn arith_chain(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Tok::Op("+") => BinOp::Add,
                Tok::Op("-") => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            self.descend()?;
            let right = self.term()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, SyntaxError> {
        let base = self.depth;
        let expr = self.term_chain();
        self.depth = base;
        expr
    }

    fn term_chain(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.factor()?;
        loop {
            let op = match self.peek() {
                Tok::Op("*") => BinOp::Mul,
                Tok::Op("/") => BinOp::Div,
                Tok::Op("//") => BinOp::FloorDiv,
                Tok::Op("%") => BinOp::Mod,
                _ => break,
            };
            self.pos += 1;
            self.descend()?;
            let right = self.factor()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr, SyntaxError> {
        let op = match self.peek() {
            Tok::Op("-") => UnaryOp::Neg,
            Tok::Op("+") => UnaryOp::Pos,
            Tok::Op("~") => return self.err("bitwise operators are not supported"),
            _ => return self.power(),
        };
        self.pos += 1;
        self.descend()?;
        let operand = self.factor();
        self.depth -= 1;
        Ok(Expr::Unary { op, operand: Box::new(operand?) })
    }

    fn power(&mut self) -> Result<Expr, SyntaxError> {
        let base = self.atom_expr()?;
        if self.eat_op("**") {
            self.descend()?;
            let exponent = self.factor();
            self.depth -= 1;
            return Ok(Expr::Binary { op: BinOp::Pow, left: Box::new(base), right: Box::new(exponent?) });
        }
        Ok(base)
    }

    fn atom_expr(&mut self) -> Result<Expr, SyntaxError> {
        let base = self.depth;
        let expr = self.postfix_chain();
        self.depth = base;
        expr
    }

    fn postfix_chain(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = self.atom()?;
        loop {
            if matches!(self.peek(), Tok::Op("(" | "[" | ".")) {
                self.descend()?;
            }
            if self.eat_op("(") {
                let (args, kwargs) = self.call_args()?;
                expr = Expr::Call { func: Box::new(expr), args, kwargs };
            } else if self.eat_op("[") {
                let index = self.subscript_list()?;
                self.expect_op("]")?;
                expr = Expr::Subscript { object: Box::new(expr), index: Box::new(index) };
            } else if self.eat_op(".") {
                let name = match self.advance() {
                    Tok::Name(n) => n,
                    other => return self.err(format!("expected attribute name, found {}", describe(&other))),
                };
                expr = Expr::Attribute { object: Box::new(expr), name };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), SyntaxError> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while !self.is_op(")") {
            if self.is_op("*") || self.is_op("**") {
                return self.err("argument unpacking is not supported");
            }
            let is_keyword_arg = matches!(self.peek(), Tok::Name(n) if !is_keyword(n))
                && matches!(self.peek_next(), Tok::Op("="));
            if is_keyword_arg {
                let name = self.expect_name()?;
                self.expect_op("=")?;
                if kwargs.iter().any(|(k, _)| *k == name) {
                    return self.err(format!("keyword argument repeated: {}", name));
                }
                kwargs.push((name, self.test()?));
            } else {
                if !kwargs.is_empty() {
                    return self.err("positional argument follows keyword argument");
                }
                let value = self.test()?;
                if self.is_kw("for") {
                    let generators = self.comprehensions()?;
                    args.push(Expr::ListComp { element: Box::new(value), generators });
                } else {
                    args.push(value);
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok((args, kwargs))
    }

    fn subscript_list(&mut self) -> Result<Expr, SyntaxError> {
        let first = self.subscript()?;
        if !self.is_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_op("]") {
                break;
            }
            items.push(self.subscript()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn subscript(&mut self) -> Result<Expr, SyntaxError> {
        let lower = if self.is_op(":") { None } else { Some(self.test()?) };
        if !self.eat_op(":") {
            return lower.map_or_else(|| self.err("invalid subscript"), Ok);
        }
        let bound_end = |p: &Parser| p.is_op(":") || p.is_op("]") || p.is_op(",");
        let upper = if bound_end(self) { None } else { Some(Box::new(self.test()?)) };
        let step = if self.eat_op(":") {
            if self.is_op("]") || self.is_op(",") { None } else { Some(Box::new(self.test()?)) }
        } else {
            None
        };
        Ok(Expr::Slice { lower: lower.map(Box::new), upper, step })
    }

    fn comprehensions(&mut self) -> Result<Vec<Comprehension>, SyntaxError> {
        let mut generators = Vec::new();
        while self.eat_kw("for") {
            let target = self.target_list()?;
            self.expect_kw("in")?;
            let iter = self.or_test()?;
            let mut conditions = Vec::new();
            while self.eat_kw("if") {
                conditions.push(self.or_test()?);
            }
            generators.push(Comprehension { target, iter, conditions });
        }
        Ok(generators)
    }

    fn atom(&mut self) -> Result<Expr, SyntaxError> {
        match self.peek().clone() {
            Tok::Op("(") => {
                self.pos += 1;
                if self.eat_op(")") {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let first = self.test()?;
                if self.is_kw("for") {
                    let generators = self.comprehensions()?;
                    self.expect_op(")")?;
                    return Ok(Expr::ListComp { element: Box::new(first), generators });
                }
                if self.eat_op(")") {
                    return Ok(first);
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.is_op(")") {
                        break;
                    }
                    items.push(self.test()?);
                }
                self.expect_op(")")?;
                Ok(Expr::Tuple(items))
            }
            Tok::Op("[") => {
                self.pos += 1;
                if self.eat_op("]") {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.test()?;
                if self.is_kw("for") {
                    let generators = self.comprehensions()?;
                    self.expect_op("]")?;
                    return Ok(Expr::ListComp { element: Box::new(first), generators });
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.is_op("]") {
                        break;
                    }
                    items.push(self.test()?);
                }
                self.expect_op("]")?;
                Ok(Expr::List(items))
            }
            Tok::Op("{") => {
                self.pos += 1;
                self.brace_display()
            }
            Tok::Op("...") => {
                self.pos += 1;
                Ok(Expr::Literal(Literal::None))
            }
            Tok::Name(name) => {
                self.pos += 1;
                match name.as_str() {
                    "True" => Ok(Expr::Literal(Literal::Bool(true))),
                    "False" => Ok(Expr::Literal(Literal::Bool(false))),
                    "None" => Ok(Expr::Literal(Literal::None)),
                    n if is_keyword(n) => {
                        self.pos -= 1;
                        self.err(format!("invalid syntax near '{}'", n))
                    }
                    _ => Ok(Expr::Name(name)),
                }
            }
            Tok::Int(v) => {
                self.pos += 1;
                Ok(Expr::Literal(Literal::Int(v)))
            }
            Tok::Float(v) => {
                self.pos += 1;
                Ok(Expr::Literal(Literal::Float(v)))
            }
            Tok::Str(_) | Tok::FStr(_) => self.strings(),
            other => self.err(format!("invalid syntax near {}", describe(&other))),
        }
    }

    /// Dict displays and comprehensions; set displays are evaluated as lists.
    fn brace_display(&mut self) -> Result<Expr, SyntaxError> {
        if self.eat_op("}") {
            return Ok(Expr::Dict(Vec::new()));
        }
        if self.is_op("**") {
            return self.err("dict unpacking is not supported");
        }
        let first = self.test()?;
        if self.eat_op(":") {
            let value = self.test()?;
            if self.is_kw("for") {
                let generators = self.comprehensions()?;
                self.expect_op("}")?;
                return Ok(Expr::DictComp { key: Box::new(first), value: Box::new(value), generators });
            }
            let mut pairs = vec![(first, value)];
            while self.eat_op(",") {
                if self.is_op("}") {
                    break;
                }
                let key = self.test()?;
                self.expect_op(":")?;
                pairs.push((key, self.test()?));
            }
            self.expect_op("}")?;
            return Ok(Expr::Dict(pairs));
        }
        if self.is_kw("for") {
            let generators = self.comprehensions()?;
            self.expect_op("}")?;
            return Ok(Expr::ListComp { element: Box::new(first), generators });
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_op("}") {
                break;
            }
            items.push(self.test()?);
        }
        self.expect_op("}")?;
        Ok(Expr::List(items))
    }

    /// Adjacent string literals concatenate; any f-string piece makes the whole an f-string.
    fn strings(&mut self) -> Result<Expr, SyntaxError> {
        let line = self.line();
        let mut parts: Vec<FStringPart> = Vec::new();
        let mut formatted = false;
        loop {
            match self.peek().clone() {
                Tok::Str(s) => {
                    self.pos += 1;
                    push_text(&mut parts, &s);
                }
                Tok::FStr(body) => {
                    self.pos += 1;
                    formatted = true;
                    for part in parse_fstring(&body, line, self.depth)? {
                        match part {
                            FStringPart::Text(t) => push_text(&mut parts, &t),
                            value => parts.push(value),
                        }
                    }
                }
                _ => break,
            }
        }
        if formatted {
            return Ok(Expr::FString(parts));
        }
        let text = match parts.pop() {
            Some(FStringPart::Text(t)) => t,
            _ => String::new(),
        };
        Ok(Expr::Literal(Literal::Str(text)))
    }
}

fn push_text(parts: &mut Vec<FStringPart>, text: &str) {
    if let Some(FStringPart::Text(last)) = parts.last_mut() {
        last.push_str(text);
    } else {
        parts.push(FStringPart::Text(text.to_string()));
    }
}

fn parse_fstring(body: &str, line: usize, depth: usize) -> Result<Vec<FStringPart>, SyntaxError> {
    let chars: Vec<char> = body.chars().collect();
    let mut parts = Vec::new();
    let mut text = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '{' && chars.get(i + 1) == Some(&'{') {
            text.push('{');
            i += 2;
            continue;
        }
        if c == '}' && chars.get(i + 1) == Some(&'}') {
            text.push('}');
            i += 2;
            continue;
        }
        if c == '}' {
            return Err(SyntaxError { line, message: "f-string: single '}' is not allowed".into() });
        }
        if c != '{' {
            text.push(c);
            i += 1;
            continue;
        }

        // Find the matching close brace, tracking nesting and quotes.
        let start = i + 1;
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        let mut split: Option<usize> = None;
        let mut j = start;
        while j < chars.len() {
            let d = chars[j];
            match quote {
                Some(q) if d == q => quote = None,
                Some(_) => {}
                None => match d {
                    '\'' | '"' => quote = Some(d),
                    '(' | '[' | '{' => depth += 1,
                    ')' | ']' => depth = depth.saturating_sub(1),
                    '}' if depth == 0 => break,
                    '}' => depth -= 1,
                    ':' if depth == 0 && split.is_none() => split = Some(j),
                    _ => {}
                },
            }
            j += 1;
        }
        if j >= chars.len() {
            return Err(SyntaxError { line, message: "f-string: expecting '}'".into() });
        }
        let expr_end = split.unwrap_or(j);
        let mut expr_text: String = chars[start..expr_end].iter().collect();
        for conversion in ["!r", "!s", "!a"] {
            if expr_text.trim_end().ends_with(conversion) {
                let trimmed = expr_text.trim_end();
                expr_text = trimmed[..trimmed.len() - 2].to_string();
            }
        }
        if expr_text.trim().is_empty() {
            return Err(SyntaxError { line, message: "f-string: empty expression not allowed".into() });
        }
        let spec = split.map(|s| chars[s + 1..j].iter().collect::<String>());

        if !text.is_empty() {
            parts.push(FStringPart::Text(std::mem::take(&mut text)));
        }
        let expr = parse_standalone_expr(&expr_text, line, depth)?;
        parts.push(FStringPart::Value { expr, spec });
        i = j + 1;
    }
    if !text.is_empty() {
        parts.push(FStringPart::Text(text));
    }
    Ok(parts)
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Name(n) => format!("'{}'", n),
        Tok::Int(v) => format!("'{}'", v),
        Tok::Float(v) => format!("'{}'", v),
        Tok::Str(_) | Tok::FStr(_) => "string literal".to_string(),
        Tok::Op(op) => format!("'{}'", op),
        Tok::Newline => "end of line".to_string(),
        Tok::Indent => "indent".to_string(),
        Tok::Dedent => "dedent".to_string(),
        Tok::Eof => "end of input".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typical_check_function() {
        let src = r#"
import math

def check_risk(data_dict):
    try:
        items = data_dict.get("model_data_by_name_type", {})
        a = float(items.get("营业收入_本期", 0) or 0)
        b = items.get("营业成本_本期", 0)
        if a == 0:
            return False
        ratio = (a - b) / a
        return ratio < 0.1 and not math.isnan(ratio)
    except (ValueError, TypeError, ZeroDivisionError) as e:
        return False
"#;
        let module = parse(src).unwrap();
        assert_eq!(module.function_names(), vec!["check_risk"]);
        let def = module.function("check_risk").unwrap();
        assert_eq!(def.params.len(), 1);
        assert!(matches!(def.body[0], Stmt::Try { .. }));
    }

    #[test]
    fn comprehensions_and_lambdas() {
        let src = "xs = [v * 2 for k, v in d.items() if v > 0]\nm = max(xs, key=lambda x: -x)\ns = sum(x for x in xs)\n";
        let module = parse(src).unwrap();
        assert_eq!(module.body.len(), 3);
        match &module.body[2] {
            Stmt::Assign { value: Expr::Call { args, .. }, .. } => {
                assert!(matches!(args[0], Expr::ListComp { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn chained_comparison_and_ternary() {
        let module = parse("y = 'a' if 0 < x <= 10 else 'b'\n").unwrap();
        match &module.body[0] {
            Stmt::Assign { value: Expr::IfExp { cond, .. }, .. } => match cond.as_ref() {
                Expr::Compare { rest, .. } => assert_eq!(rest.len(), 2),
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn not_in_and_is_not() {
        let module = parse("a = x not in y\nb = x is not None\n").unwrap();
        let ops: Vec<CmpOp> = module
            .body
            .iter()
            .filter_map(|s| match s {
                Stmt::Assign { value: Expr::Compare { rest, .. }, .. } => Some(rest[0].0),
                _ => None,
            })
            .collect();
        assert_eq!(ops, vec![CmpOp::NotIn, CmpOp::IsNot]);
    }

    #[test]
    fn fstring_with_format_spec() {
        let module = parse("s = f'ratio={r:.2f} {{raw}}'\n").unwrap();
        match &module.body[0] {
            Stmt::Assign { value: Expr::FString(parts), .. } => {
                assert_eq!(parts.len(), 3);
                assert!(matches!(&parts[1], FStringPart::Value { spec: Some(s), .. } if s == ".2f"));
                assert!(matches!(&parts[2], FStringPart::Text(t) if t == " {raw}"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn inline_blocks_and_semicolons() {
        let module = parse("def f(x): a = 1; return a\nif True: pass\n").unwrap();
        assert_eq!(module.body.len(), 2);
        assert_eq!(module.function("f").unwrap().body.len(), 2);
    }

    #[test]
    fn syntax_errors_carry_line_numbers() {
        let err = parse("def check_risk(data_dict):\n    return (1 +\n\nx = \n").unwrap_err();
        assert!(err.line >= 2);
        let err = parse("def f(:\n    pass\n").unwrap_err();
        assert_eq!(err.line, 1);
    }

    #[test]
    fn try_requires_handler() {
        assert!(parse("try:\n    x = 1\ny = 2\n").is_err());
    }

    #[test]
    fn unsupported_constructs_are_rejected() {
        assert!(parse("class A:\n    pass\n").is_err());
        assert!(parse("f(*args)\n").is_err());
        assert!(parse("obj.attr = 1\n").is_err());
    }

    fn nested_return(open: &str, inner: &str, close: &str, n: usize) -> String {
        format!("def check_risk(data_dict):\n    return {}{}{}\n", open.repeat(n), inner, close.repeat(n))
    }

    #[test]
    fn deep_nesting_is_a_syntax_error() {
        let err = parse(&nested_return("(", "True", ")", 10_000)).unwrap_err();
        assert_eq!(err.message, "too deeply nested");
        assert!(parse(&nested_return("[", "1", "]", 10_000)).is_err());
        assert!(parse(&nested_return("not ", "True", "", 10_000)).is_err());
        assert!(parse(&nested_return("-", "1", "", 10_000)).is_err());
        assert!(parse(&nested_return("f(", "1", ")", 10_000)).is_err());
        assert!(parse(&format!("x = 2{}\n", " ** 2".repeat(10_000))).is_err());
    }

    #[test]
    fn long_operator_chains_are_bounded() {
        assert!(parse(&format!("x = 1{}\n", " + 1".repeat(10_000))).is_err());
        assert!(parse(&format!("x = a{}\n", ".b".repeat(10_000))).is_err());
        assert!(parse(&format!("x = a{}\n", " or b".repeat(10_000))).is_err());
    }

    #[test]
    fn deeply_nested_blocks_are_rejected() {
        let mut src = String::new();
        for level in 0..200 {
            src.push_str(&format!("{}if x:\n", "    ".repeat(level)));
        }
        src.push_str(&format!("{}pass\n", "    ".repeat(200)));
        let err = parse(&src).unwrap_err();
        assert_eq!(err.message, "too deeply nested");
    }

    #[test]
    fn moderate_nesting_still_parses() {
        assert!(parse(&nested_return("(", "True", ")", 30)).is_ok());
        assert!(parse(&nested_return("not ", "True", "", 30)).is_ok());
        assert!(parse(&format!("x = 1{}\n", " + 1".repeat(30))).is_ok());
        // Sibling expressions do not accumulate depth.
        let siblings = (0..500).map(|i| format!("(({}))", i)).collect::<Vec<_>>().join(", ");
        assert!(parse(&format!("xs = [{}]\n", siblings)).is_ok());
    }
}
