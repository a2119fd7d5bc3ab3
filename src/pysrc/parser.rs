//! Recursive-descent parser over `lexer` tokens.
//!
//! Leniency policy: a statement that fails to parse is replaced by
//! `Stmt::Opaque` and skipped up to the end of its logical line (plus its
//! indented block and any `elif`/`else`/`except`/`finally` clauses). An
//! expression form outside the subset (lambda, comprehension, slice) parses to
//! `Expr::Opaque` so that the enclosing statement survives. The one failure
//! that is not recovered is nesting past [`MAX_NESTING`] (brackets, unary and
//! `not` chains, conditional expressions, indented blocks).

use std::rc::Rc;

use super::ast::*;
use super::lexer::{Tok, Token};

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

type PResult<T> = Result<T, ParseError>;

const KEYWORDS: &[&str] = &[
    "and", "as", "assert", "async", "await", "break", "class", "continue", "def", "del", "elif",
    "else", "except", "finally", "for", "from", "global", "if", "import", "in", "is", "lambda",
    "nonlocal", "not", "or", "pass", "raise", "return", "try", "while", "with", "yield",
];

const CLAUSE_KEYWORDS: &[&str] = &["elif", "else", "except", "finally"];

pub const MAX_NESTING: usize = 64;

/// Parse a token stream. `Err` carries the line where nesting went past
/// [`MAX_NESTING`].
pub fn parse_tokens(tokens: Vec<Token>) -> Result<Module, usize> {
    let mut p = Parser { tokens, pos: 0, depth: 0, too_deep: None };
    let mut body = Vec::new();
    while !p.at_eof() {
        if p.eat_tok(&Tok::Newline) || p.eat_tok(&Tok::Dedent) || p.eat_tok(&Tok::Indent) {
            continue;
        }
        body.extend(p.statement());
        if let Some(line) = p.too_deep {
            return Err(line);
        }
    }
    Ok(Module { body })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    too_deep: Option<usize>, // first line past MAX_NESTING
}

impl Parser {
    // ------------------------------ Cursor --------------------------------- //

    fn peek(&self) -> &Tok {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        self.tokens
            .get(self.pos + offset)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or(self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(0)
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), Tok::Eof)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if !self.at_eof() {
            self.pos += 1;
        }
        tok
    }

    fn eat_tok(&mut self, tok: &Tok) -> bool {
        if self.peek() == tok {
            self.pos += 1;
            true
        } else {
            false
        }
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

    fn err<T>(&self, message: impl Into<String>) -> PResult<T> {
        Err(ParseError { line: self.line(), message: message.into() })
    }

    fn descend<T>(&mut self, f: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        if self.depth >= MAX_NESTING {
            let line = self.line();
            self.too_deep.get_or_insert(line);
            return self.err(format!("nesting exceeds {MAX_NESTING} levels"));
        }
        self.depth += 1;
        let out = f(self);
        self.depth -= 1;
        out
    }

    fn expect_op(&mut self, op: &str) -> PResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            self.err(format!("expected `{op}`, found {:?}", self.peek()))
        }
    }

    fn expect_kw(&mut self, kw: &str) -> PResult<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            self.err(format!("expected `{kw}`, found {:?}", self.peek()))
        }
    }

    fn identifier(&mut self) -> PResult<String> {
        match self.peek().clone() {
            Tok::Name(n) if !KEYWORDS.contains(&n.as_str()) => {
                self.pos += 1;
                Ok(n)
            }
            other => self.err(format!("expected identifier, found {other:?}")),
        }
    }

    fn end_of_simple_statement(&mut self) -> PResult<()> {
        if self.eat_tok(&Tok::Newline) || self.at_eof() || matches!(self.peek(), Tok::Dedent) {
            Ok(())
        } else {
            self.err(format!("unexpected {:?} at end of statement", self.peek()))
        }
    }

    // ---------------------------- Statements ------------------------------- //

    fn statement(&mut self) -> Vec<Stmt> {
        let start = self.pos;
        let line = self.line();
        match self.try_statement() {
            Ok(stmts) => stmts,
            Err(_) => {
                self.pos = start;
                self.skip_statement();
                vec![Stmt::Opaque { line }]
            }
        }
    }

    /// Skip one logical line, its indented block and trailing clauses.
    fn skip_statement(&mut self) {
        loop {
            while !matches!(self.peek(), Tok::Newline | Tok::Eof) {
                self.pos += 1;
            }
            self.eat_tok(&Tok::Newline);
            if matches!(self.peek(), Tok::Indent) {
                let mut depth = 0usize;
                loop {
                    match self.advance() {
                        Tok::Indent => depth += 1,
                        Tok::Dedent => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        Tok::Eof => return,
                        _ => {}
                    }
                }
            }
            let continues = matches!(self.peek(), Tok::Name(n) if CLAUSE_KEYWORDS.contains(&n.as_str()));
            if !continues {
                return;
            }
        }
    }

    fn try_statement(&mut self) -> PResult<Vec<Stmt>> {
        if self.is_op("@") {
            // decorators carry no spec data
            while self.eat_op("@") {
                self.expression()?;
                self.expect_newline()?;
            }
            return self.try_statement();
        }
        let kw = match self.peek() {
            Tok::Name(n) => n.clone(),
            _ => return self.simple_statements(),
        };
        match kw.as_str() {
            "def" => Ok(vec![self.function_def()?]),
            "class" => Ok(vec![self.class_def()?]),
            "if" => {
                self.pos += 1;
                Ok(vec![self.if_rest()?])
            }
            "for" => Ok(vec![self.for_stmt()?]),
            "try" => Ok(vec![self.try_stmt()?]),
            "with" => Ok(vec![self.with_stmt()?]),
            "while" | "async" | "match" if kw != "match" || self.looks_like_match() => {
                self.err(format!("unsupported `{kw}` statement"))
            }
            _ => self.simple_statements(),
        }
    }

    fn looks_like_match(&self) -> bool {
        // `match` is a soft keyword; treat it as a statement only when the
        // logical line ends with `:`.
        let mut i = self.pos;
        while let Some(t) = self.tokens.get(i) {
            match t.tok {
                Tok::Newline | Tok::Eof => break,
                _ => i += 1,
            }
        }
        i > 0 && matches!(self.tokens.get(i - 1).map(|t| &t.tok), Some(Tok::Op(":")))
    }

    fn expect_newline(&mut self) -> PResult<()> {
        if self.eat_tok(&Tok::Newline) {
            Ok(())
        } else {
            self.err("expected end of line")
        }
    }

    fn simple_statements(&mut self) -> PResult<Vec<Stmt>> {
        let mut out = vec![self.small_statement()?];
        while self.eat_op(";") {
            if matches!(self.peek(), Tok::Newline | Tok::Eof) {
                break;
            }
            out.push(self.small_statement()?);
        }
        self.end_of_simple_statement()?;
        Ok(out)
    }

    fn small_statement(&mut self) -> PResult<Stmt> {
        if let Tok::Name(kw) = self.peek().clone() {
            match kw.as_str() {
                "pass" => {
                    self.pos += 1;
                    return Ok(Stmt::Pass);
                }
                "break" => {
                    self.pos += 1;
                    return Ok(Stmt::Break);
                }
                "continue" => {
                    self.pos += 1;
                    return Ok(Stmt::Continue);
                }
                "return" => {
                    self.pos += 1;
                    if self.at_statement_end() {
                        return Ok(Stmt::Return(None));
                    }
                    return Ok(Stmt::Return(Some(self.expression_list()?)));
                }
                "raise" => {
                    self.pos += 1;
                    if self.at_statement_end() {
                        return Ok(Stmt::Raise(None));
                    }
                    let exc = self.expression()?;
                    if self.eat_kw("from") {
                        self.expression()?;
                    }
                    return Ok(Stmt::Raise(Some(exc)));
                }
                "global" | "nonlocal" => {
                    self.pos += 1;
                    self.identifier()?;
                    while self.eat_op(",") {
                        self.identifier()?;
                    }
                    return Ok(Stmt::Pass);
                }
                "assert" => {
                    self.pos += 1;
                    self.expression()?;
                    if self.eat_op(",") {
                        self.expression()?;
                    }
                    return Ok(Stmt::Pass);
                }
                "del" => {
                    self.pos += 1;
                    let mut targets = vec![self.or_expr()?];
                    while self.eat_op(",") {
                        if self.at_statement_end() {
                            break;
                        }
                        targets.push(self.or_expr()?);
                    }
                    return Ok(Stmt::Delete(targets));
                }
                "import" => return self.import_stmt(),
                "from" => return self.import_from_stmt(),
                "yield" => return self.err("unsupported `yield`"),
                _ => {}
            }
        }
        self.expression_statement()
    }

    fn at_statement_end(&self) -> bool {
        matches!(self.peek(), Tok::Newline | Tok::Eof | Tok::Dedent | Tok::Op(";"))
    }

    fn expression_statement(&mut self) -> PResult<Stmt> {
        let first = self.star_expression_list()?;
        if self.eat_op(":") {
            self.expression()?; // annotation
            let value = if self.eat_op("=") { Some(self.star_expression_list()?) } else { None };
            return Ok(Stmt::AnnAssign { target: first, value });
        }
        if let Some(op) = self.augmented_op() {
            self.pos += 1;
            let value = self.star_expression_list()?;
            return Ok(Stmt::AugAssign { target: first, op, value });
        }
        if self.is_op("=") {
            let mut exprs = vec![first];
            while self.eat_op("=") {
                exprs.push(self.star_expression_list()?);
            }
            let value = exprs.pop().unwrap_or(Expr::Const(Constant::None));
            return Ok(Stmt::Assign { targets: exprs, value });
        }
        Ok(Stmt::Expr(first))
    }

    fn augmented_op(&self) -> Option<BinOp> {
        let Tok::Op(op) = self.peek() else { return None };
        Some(match *op {
            "+=" => BinOp::Add,
            "-=" => BinOp::Sub,
            "*=" => BinOp::Mul,
            "/=" => BinOp::Div,
            "//=" => BinOp::FloorDiv,
            "%=" => BinOp::Mod,
            "**=" => BinOp::Pow,
            "@=" => BinOp::MatMul,
            "|=" => BinOp::BitOr,
            "^=" => BinOp::BitXor,
            "&=" => BinOp::BitAnd,
            "<<=" => BinOp::LShift,
            ">>=" => BinOp::RShift,
            _ => return None,
        })
    }

    fn dotted_name(&mut self) -> PResult<String> {
        let mut name = self.identifier()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.identifier()?);
        }
        Ok(name)
    }

    fn import_stmt(&mut self) -> PResult<Stmt> {
        self.expect_kw("import")?;
        let mut names = Vec::new();
        loop {
            let name = self.dotted_name()?;
            let alias = if self.eat_kw("as") { Some(self.identifier()?) } else { None };
            names.push(ImportName { name, alias });
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(Stmt::Import(names))
    }

    fn import_from_stmt(&mut self) -> PResult<Stmt> {
        self.expect_kw("from")?;
        let mut module = String::new();
        loop {
            if self.eat_op(".") {
                module.push('.');
            } else if self.eat_op("...") {
                module.push_str("...");
            } else {
                break;
            }
        }
        if !self.is_kw("import") {
            module.push_str(&self.dotted_name()?);
        }
        self.expect_kw("import")?;
        let mut names = Vec::new();
        if self.eat_op("*") {
            names.push(ImportName { name: "*".into(), alias: None });
            return Ok(Stmt::ImportFrom { module, names });
        }
        let parenthesized = self.eat_op("(");
        loop {
            if parenthesized && self.is_op(")") {
                break;
            }
            let name = self.identifier()?;
            let alias = if self.eat_kw("as") { Some(self.identifier()?) } else { None };
            names.push(ImportName { name, alias });
            if !self.eat_op(",") {
                break;
            }
        }
        if parenthesized {
            self.expect_op(")")?;
        }
        Ok(Stmt::ImportFrom { module, names })
    }

    fn block(&mut self) -> PResult<Vec<Stmt>> {
        self.descend(Self::block_body)
    }

    fn block_body(&mut self) -> PResult<Vec<Stmt>> {
        self.expect_op(":")?;
        if !self.eat_tok(&Tok::Newline) {
            return self.simple_statements();
        }
        if !self.eat_tok(&Tok::Indent) {
            return self.err("expected an indented block");
        }
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Tok::Dedent => {
                    self.pos += 1;
                    break;
                }
                Tok::Eof => break,
                Tok::Newline => {
                    self.pos += 1;
                }
                _ => body.extend(self.statement()),
            }
        }
        Ok(body)
    }

    fn function_def(&mut self) -> PResult<Stmt> {
        self.expect_kw("def")?;
        let name = self.identifier()?;
        self.expect_op("(")?;
        let mut params = Vec::new();
        let mut keyword_only = false;
        while !self.is_op(")") {
            if self.eat_op("/") {
                // positional-only marker
            } else if self.eat_op("**") {
                let name = self.identifier()?;
                self.skip_annotation()?;
                params.push(Param { name, kind: ParamKind::VarKwargs, default: None });
            } else if self.eat_op("*") {
                keyword_only = true;
                if let Tok::Name(_) = self.peek() {
                    let name = self.identifier()?;
                    self.skip_annotation()?;
                    params.push(Param { name, kind: ParamKind::VarArgs, default: None });
                }
            } else {
                let name = self.identifier()?;
                self.skip_annotation()?;
                let default = if self.eat_op("=") { Some(self.expression()?) } else { None };
                let kind = if keyword_only { ParamKind::KeywordOnly } else { ParamKind::Normal };
                params.push(Param { name, kind, default });
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        if self.eat_op("->") {
            self.expression()?;
        }
        let body = self.block()?;
        Ok(Stmt::FunctionDef(Rc::new(FunctionDef { name, params, body })))
    }

    fn skip_annotation(&mut self) -> PResult<()> {
        if self.eat_op(":") {
            self.expression()?;
        }
        Ok(())
    }

    fn class_def(&mut self) -> PResult<Stmt> {
        self.expect_kw("class")?;
        let name = self.identifier()?;
        let mut bases = Vec::new();
        if self.eat_op("(") {
            for arg in self.call_arguments()? {
                if let Arg::Positional(e) = arg {
                    bases.push(e);
                }
            }
        }
        let body = self.block()?;
        Ok(Stmt::ClassDef(Rc::new(ClassDef { name, bases, body })))
    }

    /// After `if` / `elif` has been consumed.
    fn if_rest(&mut self) -> PResult<Stmt> {
        let test = self.named_expression()?;
        let body = self.block()?;
        let orelse = if self.eat_kw("elif") {
            vec![self.if_rest()?]
        } else if self.eat_kw("else") {
            self.block()?
        } else {
            Vec::new()
        };
        Ok(Stmt::If { test, body, orelse })
    }

    fn for_stmt(&mut self) -> PResult<Stmt> {
        self.expect_kw("for")?;
        let target = self.target_list()?;
        self.expect_kw("in")?;
        let iter = self.star_expression_list()?;
        let body = self.block()?;
        let orelse = if self.eat_kw("else") { self.block()? } else { Vec::new() };
        Ok(Stmt::For { target, iter, body, orelse })
    }

    fn try_stmt(&mut self) -> PResult<Stmt> {
        self.expect_kw("try")?;
        let body = self.block()?;
        let mut handlers = Vec::new();
        while self.eat_kw("except") {
            self.eat_op("*");
            let mut name = None;
            if !self.is_op(":") {
                self.expression()?;
                if self.eat_kw("as") {
                    name = Some(self.identifier()?);
                } else if self.eat_op(",") {
                    // py2 `except E, e:`
                    name = Some(self.identifier()?);
                }
            }
            handlers.push(Handler { name, body: self.block()? });
        }
        let orelse = if self.eat_kw("else") { self.block()? } else { Vec::new() };
        let finalbody = if self.eat_kw("finally") { self.block()? } else { Vec::new() };
        if handlers.is_empty() && finalbody.is_empty() {
            return self.err("`try` without `except` or `finally`");
        }
        Ok(Stmt::Try { body, handlers, orelse, finalbody })
    }

    fn with_stmt(&mut self) -> PResult<Stmt> {
        self.expect_kw("with")?;
        let mut items = Vec::new();
        loop {
            let ctx = self.expression()?;
            let target = if self.eat_kw("as") { Some(self.star_or_expr()?) } else { None };
            items.push((ctx, target));
            if !self.eat_op(",") {
                break;
            }
        }
        let body = self.block()?;
        Ok(Stmt::With { items, body })
    }

    // ---------------------------- Expressions ------------------------------ //

    /// `for` targets: bitwise-or level so `in` is not consumed as a comparison.
    fn target_list(&mut self) -> PResult<Expr> {
        let first = self.star_or_expr()?;
        if !self.is_op(",") {
            return Ok(first);
        }
        let mut elts = vec![first];
        while self.eat_op(",") {
            if self.is_kw("in") || self.is_op("=") || self.is_op(":") {
                break;
            }
            elts.push(self.star_or_expr()?);
        }
        Ok(Expr::Tuple(elts))
    }

    fn star_or_expr(&mut self) -> PResult<Expr> {
        if self.eat_op("*") {
            return Ok(Expr::Starred(Box::new(self.or_expr()?)));
        }
        self.or_expr()
    }

    /// Comma-separated expressions (with `*x`), tuple when more than one.
    fn star_expression_list(&mut self) -> PResult<Expr> {
        let first = self.star_expression()?;
        if !self.is_op(",") {
            return Ok(first);
        }
        let mut elts = vec![first];
        while self.eat_op(",") {
            if self.at_statement_end() || self.is_op("=") || self.is_op(")") || self.is_op(":") {
                break;
            }
            elts.push(self.star_expression()?);
        }
        Ok(Expr::Tuple(elts))
    }

    fn expression_list(&mut self) -> PResult<Expr> {
        self.star_expression_list()
    }

    fn star_expression(&mut self) -> PResult<Expr> {
        if self.eat_op("*") {
            return Ok(Expr::Starred(Box::new(self.or_expr()?)));
        }
        self.expression()
    }

    fn named_expression(&mut self) -> PResult<Expr> {
        let e = self.expression()?;
        if self.is_op(":=") {
            return self.err("unsupported assignment expression");
        }
        Ok(e)
    }

    fn expression(&mut self) -> PResult<Expr> {
        self.descend(Self::conditional)
    }

    fn conditional(&mut self) -> PResult<Expr> {
        if self.eat_kw("lambda") {
            while !self.is_op(":") {
                if self.at_eof() || matches!(self.peek(), Tok::Newline) {
                    return self.err("unterminated lambda");
                }
                self.pos += 1;
            }
            self.expect_op(":")?;
            self.expression()?;
            return Ok(Expr::Opaque("lambda"));
        }
        let body = self.or_test()?;
        if self.eat_kw("if") {
            let test = self.or_test()?;
            self.expect_kw("else")?;
            let orelse = self.expression()?;
            return Ok(Expr::IfExp { test: Box::new(test), body: Box::new(body), orelse: Box::new(orelse) });
        }
        Ok(body)
    }

    fn or_test(&mut self) -> PResult<Expr> {
        let first = self.and_test()?;
        if !self.is_kw("or") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_kw("or") {
            values.push(self.and_test()?);
        }
        Ok(Expr::BoolOp { op: BoolOp::Or, values })
    }

    fn and_test(&mut self) -> PResult<Expr> {
        let first = self.not_test()?;
        if !self.is_kw("and") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_kw("and") {
            values.push(self.not_test()?);
        }
        Ok(Expr::BoolOp { op: BoolOp::And, values })
    }

    fn not_test(&mut self) -> PResult<Expr> {
        if self.eat_kw("not") {
            let operand = self.descend(Self::not_test)?;
            return Ok(Expr::UnaryOp { op: UnaryOp::Not, operand: Box::new(operand) });
        }
        self.comparison()
    }

    fn comparison_op(&mut self) -> Option<CmpOp> {
        let op = match self.peek().clone() {
            Tok::Op("==") => CmpOp::Eq,
            Tok::Op("!=") => CmpOp::NotEq,
            Tok::Op("<") => CmpOp::Lt,
            Tok::Op("<=") => CmpOp::LtE,
            Tok::Op(">") => CmpOp::Gt,
            Tok::Op(">=") => CmpOp::GtE,
            Tok::Name(n) if n == "in" => CmpOp::In,
            Tok::Name(n) if n == "is" => {
                if matches!(self.peek_at(1), Tok::Name(m) if m == "not") {
                    self.pos += 2;
                    return Some(CmpOp::IsNot);
                }
                CmpOp::Is
            }
            Tok::Name(n) if n == "not" && matches!(self.peek_at(1), Tok::Name(m) if m == "in") => {
                self.pos += 2;
                return Some(CmpOp::NotIn);
            }
            _ => return None,
        };
        self.pos += 1;
        Some(op)
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let left = self.or_expr()?;
        let mut ops = Vec::new();
        while let Some(op) = self.comparison_op() {
            ops.push((op, self.or_expr()?));
        }
        if ops.is_empty() {
            return Ok(left);
        }
        Ok(Expr::Compare { left: Box::new(left), ops })
    }

    fn binary_level(
        &mut self,
        table: &[(&str, BinOp)],
        next: fn(&mut Self) -> PResult<Expr>,
    ) -> PResult<Expr> {
        let mut left = next(self)?;
        'outer: loop {
            for (sym, op) in table {
                if self.eat_op(sym) {
                    let right = next(self)?;
                    left = Expr::BinOp { left: Box::new(left), op: *op, right: Box::new(right) };
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn or_expr(&mut self) -> PResult<Expr> {
        self.binary_level(&[("|", BinOp::BitOr)], Self::xor_expr)
    }

    fn xor_expr(&mut self) -> PResult<Expr> {
        self.binary_level(&[("^", BinOp::BitXor)], Self::and_expr)
    }

    fn and_expr(&mut self) -> PResult<Expr> {
        self.binary_level(&[("&", BinOp::BitAnd)], Self::shift_expr)
    }

    fn shift_expr(&mut self) -> PResult<Expr> {
        self.binary_level(&[("<<", BinOp::LShift), (">>", BinOp::RShift)], Self::arith_expr)
    }

    fn arith_expr(&mut self) -> PResult<Expr> {
        self.binary_level(&[("+", BinOp::Add), ("-", BinOp::Sub)], Self::term)
    }

    fn term(&mut self) -> PResult<Expr> {
        self.binary_level(
            &[
                ("*", BinOp::Mul),
                ("/", BinOp::Div),
                ("//", BinOp::FloorDiv),
                ("%", BinOp::Mod),
                ("@", BinOp::MatMul),
            ],
            Self::factor,
        )
    }

    fn factor(&mut self) -> PResult<Expr> {
        let op = match self.peek() {
            Tok::Op("-") => UnaryOp::Neg,
            Tok::Op("+") => UnaryOp::Pos,
            Tok::Op("~") => UnaryOp::Invert,
            _ => return self.power(),
        };
        self.pos += 1;
        let operand = self.descend(Self::factor)?;
        Ok(Expr::UnaryOp { op, operand: Box::new(operand) })
    }

    fn power(&mut self) -> PResult<Expr> {
        if self.eat_kw("await") {
            return self.err("unsupported `await`");
        }
        let base = self.primary()?;
        if self.eat_op("**") {
            let exp = self.descend(Self::factor)?;
            return Ok(Expr::BinOp { left: Box::new(base), op: BinOp::Pow, right: Box::new(exp) });
        }
        Ok(base)
    }

    fn primary(&mut self) -> PResult<Expr> {
        let mut expr = self.atom()?;
        loop {
            if self.eat_op(".") {
                let attr = match self.advance() {
                    Tok::Name(n) => n,
                    other => return self.err(format!("expected attribute name, found {other:?}")),
                };
                expr = Expr::Attribute(Box::new(expr), attr);
            } else if self.eat_op("(") {
                let args = self.call_arguments()?;
                expr = Expr::Call { func: Box::new(expr), args };
            } else if self.eat_op("[") {
                let index = self.subscript()?;
                expr = Expr::Subscript(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    /// After `[`; consumes the closing `]`.
    fn subscript(&mut self) -> PResult<Expr> {
        if self.is_op(":") || self.slice_ahead() {
            self.skip_to_closing("]")?;
            return Ok(Expr::Opaque("slice"));
        }
        let index = self.star_expression_list()?;
        self.expect_op("]")?;
        Ok(index)
    }

    fn slice_ahead(&self) -> bool {
        let mut depth = 0usize;
        let mut i = self.pos;
        while let Some(t) = self.tokens.get(i) {
            match &t.tok {
                Tok::Op("(") | Tok::Op("[") | Tok::Op("{") => depth += 1,
                Tok::Op(")") | Tok::Op("}") => depth = depth.saturating_sub(1),
                Tok::Op("]") if depth == 0 => return false,
                Tok::Op("]") => depth -= 1,
                Tok::Op(":") if depth == 0 => return true,
                Tok::Name(n) if depth == 0 && n == "lambda" => return false,
                Tok::Eof => return false,
                _ => {}
            }
            i += 1;
        }
        false
    }

    /// Skip to (and consume) the bracket closing the one just opened.
    fn skip_to_closing(&mut self, close: &str) -> PResult<()> {
        let mut depth = 0usize;
        loop {
            match self.advance() {
                Tok::Op("(") | Tok::Op("[") | Tok::Op("{") => depth += 1,
                Tok::Op(op @ (")" | "]" | "}")) => {
                    if depth == 0 {
                        return if op == close { Ok(()) } else { self.err("mismatched bracket") };
                    }
                    depth -= 1;
                }
                Tok::Eof => return self.err("unexpected end of input"),
                _ => {}
            }
        }
    }

    /// After `(`; consumes the closing `)`.
    fn call_arguments(&mut self) -> PResult<Vec<Arg>> {
        let mut args = Vec::new();
        while !self.is_op(")") {
            if self.eat_op("**") {
                args.push(Arg::DoubleStar(self.expression()?));
            } else if self.eat_op("*") {
                args.push(Arg::Star(self.expression()?));
            } else if matches!(self.peek(), Tok::Name(n) if !KEYWORDS.contains(&n.as_str()))
                && matches!(self.peek_at(1), Tok::Op("="))
            {
                let name = self.identifier()?;
                self.expect_op("=")?;
                args.push(Arg::Keyword(name, self.expression()?));
            } else {
                let e = self.named_expression()?;
                if self.is_kw("for") || self.is_kw("async") {
                    self.skip_to_closing(")")?;
                    args.push(Arg::Positional(Expr::Opaque("generator")));
                    return Ok(args);
                }
                args.push(Arg::Positional(e));
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok(args)
    }

    fn atom(&mut self) -> PResult<Expr> {
        match self.peek().clone() {
            Tok::Op("(") => {
                self.pos += 1;
                if self.eat_op(")") {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                if self.is_kw("yield") {
                    return self.err("unsupported `yield`");
                }
                let first = self.star_expression()?;
                if self.is_kw("for") || self.is_kw("async") {
                    self.skip_to_closing(")")?;
                    return Ok(Expr::Opaque("generator"));
                }
                if self.eat_op(")") {
                    return Ok(first);
                }
                let mut elts = vec![first];
                while self.eat_op(",") {
                    if self.is_op(")") {
                        break;
                    }
                    elts.push(self.star_expression()?);
                }
                self.expect_op(")")?;
                Ok(Expr::Tuple(elts))
            }
            Tok::Op("[") => {
                self.pos += 1;
                let elts = self.sequence_items("]")?;
                Ok(elts.map(Expr::List).unwrap_or(Expr::Opaque("comprehension")))
            }
            Tok::Op("{") => {
                self.pos += 1;
                self.dict_or_set()
            }
            Tok::Op("...") => {
                self.pos += 1;
                Ok(Expr::Const(Constant::Ellipsis))
            }
            Tok::Int(i) => {
                self.pos += 1;
                Ok(Expr::Const(Constant::Int(i)))
            }
            Tok::Float(f) => {
                self.pos += 1;
                Ok(Expr::Const(Constant::Float(f)))
            }
            Tok::Str(s) => {
                self.pos += 1;
                let mut text = s;
                while let Tok::Str(more) = self.peek().clone() {
                    self.pos += 1;
                    text.push_str(&more);
                }
                Ok(Expr::Const(Constant::Str(text)))
            }
            Tok::Name(n) => match n.as_str() {
                "None" => {
                    self.pos += 1;
                    Ok(Expr::Const(Constant::None))
                }
                "True" => {
                    self.pos += 1;
                    Ok(Expr::Const(Constant::Bool(true)))
                }
                "False" => {
                    self.pos += 1;
                    Ok(Expr::Const(Constant::Bool(false)))
                }
                _ => Ok(Expr::Name(self.identifier()?)),
            },
            other => self.err(format!("unexpected {other:?}")),
        }
    }

    /// Items of a list/set display up to `close`; `None` for a comprehension.
    fn sequence_items(&mut self, close: &str) -> PResult<Option<Vec<Expr>>> {
        let mut elts = Vec::new();
        while !self.is_op(close) {
            let e = self.star_expression()?;
            if elts.is_empty() && (self.is_kw("for") || self.is_kw("async")) {
                self.skip_to_closing(close)?;
                return Ok(None);
            }
            elts.push(e);
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(close)?;
        Ok(Some(elts))
    }

    /// After `{`.
    fn dict_or_set(&mut self) -> PResult<Expr> {
        if self.eat_op("}") {
            return Ok(Expr::Dict(Vec::new()));
        }
        // set display: first item is not followed by `:` and not a `**` unpack
        if !self.is_op("**") {
            let start = self.pos;
            let first = self.star_expression()?;
            if !self.is_op(":") {
                if self.is_kw("for") || self.is_kw("async") {
                    self.skip_to_closing("}")?;
                    return Ok(Expr::Opaque("comprehension"));
                }
                let mut elts = vec![first];
                while self.eat_op(",") {
                    if self.is_op("}") {
                        break;
                    }
                    elts.push(self.star_expression()?);
                }
                self.expect_op("}")?;
                return Ok(Expr::Set(elts));
            }
            self.pos = start;
        }
        let mut items = Vec::new();
        while !self.is_op("}") {
            if self.eat_op("**") {
                items.push(DictItem::Unpack(self.or_expr()?));
            } else {
                let key = self.expression()?;
                self.expect_op(":")?;
                let value = self.expression()?;
                if items.is_empty() && (self.is_kw("for") || self.is_kw("async")) {
                    self.skip_to_closing("}")?;
                    return Ok(Expr::Opaque("comprehension"));
                }
                items.push(DictItem::Pair(key, value));
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op("}")?;
        Ok(Expr::Dict(items))
    }
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pysrc::lexer::tokenize;

    fn parse(src: &str) -> Module {
        parse_tokens(tokenize(src).unwrap()).unwrap()
    }

    #[test]
    fn dict_call_with_keywords() {
        let m = parse("argument_spec = dict(name=dict(type='str', required=True))\n");
        let Stmt::Assign { targets, value } = &m.body[0] else { panic!("{:?}", m.body) };
        assert_eq!(targets, &vec![Expr::Name("argument_spec".into())]);
        let Expr::Call { func, args } = value else { panic!() };
        assert_eq!(**func, Expr::Name("dict".into()));
        assert!(matches!(&args[0], Arg::Keyword(k, Expr::Call { .. }) if k == "name"));
    }

    #[test]
    fn dict_literal_with_unpack_and_set_literal() {
        let m = parse("x = {'a': 1, **base}\ny = {1, 2}\nz = {}\n");
        assert!(matches!(&m.body[0], Stmt::Assign { value: Expr::Dict(items), .. } if items.len() == 2));
        assert!(matches!(&m.body[1], Stmt::Assign { value: Expr::Set(items), .. } if items.len() == 2));
        assert!(matches!(&m.body[2], Stmt::Assign { value: Expr::Dict(items), .. } if items.is_empty()));
    }

    #[test]
    fn function_and_class_definitions() {
        let src = "\
class Thing(AnsibleModule):
    def __init__(self, *args, spec=None, **kwargs):
        super().__init__(argument_spec=spec)

def main():
    module = Thing(spec={})
    module.exit_json(changed=False)

if __name__ == '__main__':
    main()
";
        let m = parse(src);
        assert_eq!(m.body.len(), 3);
        let Stmt::ClassDef(c) = &m.body[0] else { panic!() };
        assert_eq!(c.name, "Thing");
        assert_eq!(c.bases, vec![Expr::Name("AnsibleModule".into())]);
        let Stmt::FunctionDef(init) = &c.body[0] else { panic!() };
        let kinds: Vec<ParamKind> = init.params.iter().map(|p| p.kind).collect();
        assert_eq!(
            kinds,
            [ParamKind::Normal, ParamKind::VarArgs, ParamKind::KeywordOnly, ParamKind::VarKwargs]
        );
        assert!(matches!(&m.body[2], Stmt::If { .. }));
    }

    #[test]
    fn unsupported_statements_become_opaque_and_parsing_continues() {
        let src = "\
while True:
    x = 1
else:
    y = 2
spec = dict(a=1)
";
        let m = parse(src);
        assert!(matches!(m.body[0], Stmt::Opaque { line: 1 }));
        assert!(matches!(&m.body[1], Stmt::Assign { .. }));
        assert_eq!(m.body.len(), 2);
    }

    #[test]
    fn comprehension_lambda_and_slice_are_opaque_expressions() {
        let m = parse("a = [x for x in y]\nb = lambda q: q\nc = d[1:2]\n");
        assert!(matches!(&m.body[0], Stmt::Assign { value: Expr::Opaque("comprehension"), .. }));
        assert!(matches!(&m.body[1], Stmt::Assign { value: Expr::Opaque("lambda"), .. }));
        assert!(matches!(
            &m.body[2],
            Stmt::Assign { value: Expr::Subscript(_, idx), .. } if **idx == Expr::Opaque("slice")
        ));
    }

    #[test]
    fn nesting_past_the_bound_fails_the_parse() {
        let deep = format!("x = {}1{}\n", "(".repeat(300), ")".repeat(300));
        assert_eq!(parse_tokens(tokenize(&deep).unwrap()), Err(1));
        let unary = format!("x = {}1\n", "-".repeat(300));
        assert!(parse_tokens(tokenize(&unary).unwrap()).is_err());

        let shallow = format!("x = {}1{}\n", "(".repeat(20), ")".repeat(20));
        assert!(parse_tokens(tokenize(&shallow).unwrap()).is_ok());
    }

    #[test]
    fn imports() {
        let m = parse(
            "from ansible.module_utils.basic import AnsibleModule\nimport copy, os.path as p\nfrom ..module_utils.core import (A as B,\n  C,)\n",
        );
        assert_eq!(
            m.body[0],
            Stmt::ImportFrom {
                module: "ansible.module_utils.basic".into(),
                names: vec![ImportName { name: "AnsibleModule".into(), alias: None }],
            }
        );
        let Stmt::Import(names) = &m.body[1] else { panic!() };
        assert_eq!(names[1].name, "os.path");
        assert_eq!(names[1].alias.as_deref(), Some("p"));
        let Stmt::ImportFrom { module, names } = &m.body[2] else { panic!() };
        assert_eq!(module, "..module_utils.core");
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn try_except_and_not_in() {
        let src = "\
try:
    import boto3
    HAS_BOTO3 = True
except ImportError as e:
    HAS_BOTO3 = False
ok = 'a' not in spec and x is not None
";
        let m = parse(src);
        let Stmt::Try { body, handlers, .. } = &m.body[0] else { panic!() };
        assert_eq!(body.len(), 2);
        assert_eq!(handlers[0].name.as_deref(), Some("e"));
        let Stmt::Assign { value: Expr::BoolOp { values, .. }, .. } = &m.body[1] else { panic!() };
        assert!(matches!(&values[0], Expr::Compare { ops, .. } if ops[0].0 == CmpOp::NotIn));
        assert!(matches!(&values[1], Expr::Compare { ops, .. } if ops[0].0 == CmpOp::IsNot));
    }
}
