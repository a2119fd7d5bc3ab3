// Lenient AST for the Python subset. Anything outside the subset is kept as
// an `Opaque` node so the surrounding code still loads.

use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    Assign { targets: Vec<Expr>, value: Expr },
    AugAssign { target: Expr, op: BinOp, value: Expr },
    AnnAssign { target: Expr, value: Option<Expr> },
    Delete(Vec<Expr>),
    Import(Vec<ImportName>),
    ImportFrom { module: String, names: Vec<ImportName> }, // name "*" for star imports
    FunctionDef(Rc<FunctionDef>),
    ClassDef(Rc<ClassDef>),
    Return(Option<Expr>),
    If { test: Expr, body: Vec<Stmt>, orelse: Vec<Stmt> },
    For { target: Expr, iter: Expr, body: Vec<Stmt>, orelse: Vec<Stmt> },
    Try { body: Vec<Stmt>, handlers: Vec<Handler>, orelse: Vec<Stmt>, finalbody: Vec<Stmt> },
    With { items: Vec<(Expr, Option<Expr>)>, body: Vec<Stmt> },
    Raise(Option<Expr>),
    Pass,
    Break,
    Continue,
    Opaque { line: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportName {
    pub name: String,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub kind: ParamKind,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Normal,
    KeywordOnly,
    VarArgs,   // *args
    VarKwargs, // **kwargs
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassDef {
    pub name: String,
    pub bases: Vec<Expr>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Handler {
    pub name: Option<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Name(String),
    Const(Constant),
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Set(Vec<Expr>),
    Dict(Vec<DictItem>),
    Starred(Box<Expr>),
    Attribute(Box<Expr>, String),
    Subscript(Box<Expr>, Box<Expr>),
    Call { func: Box<Expr>, args: Vec<Arg> },
    BinOp { left: Box<Expr>, op: BinOp, right: Box<Expr> },
    UnaryOp { op: UnaryOp, operand: Box<Expr> },
    BoolOp { op: BoolOp, values: Vec<Expr> },
    Compare { left: Box<Expr>, ops: Vec<(CmpOp, Expr)> },
    IfExp { test: Box<Expr>, body: Box<Expr>, orelse: Box<Expr> },
    Opaque(&'static str), // lambda, comprehension, slice, ...
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ellipsis,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DictItem {
    Pair(Expr, Expr),
    Unpack(Expr), // **other
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Positional(Expr),
    Keyword(String, Expr),
    Star(Expr),
    DoubleStar(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    MatMul,
    BitOr,
    BitXor,
    BitAnd,
    LShift,
    RShift,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Pos,
    Invert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    In,
    NotIn,
    Is,
    IsNot,
}

impl Module {
    /// Visit every expression in the module, statement bodies included.
    pub fn walk_exprs<'a>(&'a self, visit: &mut dyn FnMut(&'a Expr)) {
        walk_stmts(&self.body, visit);
    }
}

fn walk_stmts<'a>(stmts: &'a [Stmt], visit: &mut dyn FnMut(&'a Expr)) {
    for stmt in stmts {
        match stmt {
            Stmt::Expr(e) | Stmt::Return(Some(e)) | Stmt::Raise(Some(e)) => walk_expr(e, visit),
            Stmt::Assign { targets, value } => {
                targets.iter().for_each(|t| walk_expr(t, visit));
                walk_expr(value, visit);
            }
            Stmt::AugAssign { target, value, .. } => {
                walk_expr(target, visit);
                walk_expr(value, visit);
            }
            Stmt::AnnAssign { target, value } => {
                walk_expr(target, visit);
                if let Some(v) = value {
                    walk_expr(v, visit);
                }
            }
            Stmt::Delete(targets) => targets.iter().for_each(|t| walk_expr(t, visit)),
            Stmt::FunctionDef(f) => walk_stmts(&f.body, visit),
            Stmt::ClassDef(c) => {
                c.bases.iter().for_each(|b| walk_expr(b, visit));
                walk_stmts(&c.body, visit);
            }
            Stmt::If { test, body, orelse } => {
                walk_expr(test, visit);
                walk_stmts(body, visit);
                walk_stmts(orelse, visit);
            }
            Stmt::For { target, iter, body, orelse } => {
                walk_expr(target, visit);
                walk_expr(iter, visit);
                walk_stmts(body, visit);
                walk_stmts(orelse, visit);
            }
            Stmt::Try { body, handlers, orelse, finalbody } => {
                walk_stmts(body, visit);
                handlers.iter().for_each(|h| walk_stmts(&h.body, visit));
                walk_stmts(orelse, visit);
                walk_stmts(finalbody, visit);
            }
            Stmt::With { items, body } => {
                for (ctx, target) in items {
                    walk_expr(ctx, visit);
                    if let Some(t) = target {
                        walk_expr(t, visit);
                    }
                }
                walk_stmts(body, visit);
            }
            Stmt::Return(None)
            | Stmt::Raise(None)
            | Stmt::Import(_)
            | Stmt::ImportFrom { .. }
            | Stmt::Pass
            | Stmt::Break
            | Stmt::Continue
            | Stmt::Opaque { .. } => {}
        }
    }
}

fn walk_expr<'a>(expr: &'a Expr, visit: &mut dyn FnMut(&'a Expr)) {
    visit(expr);
    match expr {
        Expr::List(xs) | Expr::Tuple(xs) | Expr::Set(xs) => xs.iter().for_each(|x| walk_expr(x, visit)),
        Expr::Dict(items) => {
            for item in items {
                match item {
                    DictItem::Pair(k, v) => {
                        walk_expr(k, visit);
                        walk_expr(v, visit);
                    }
                    DictItem::Unpack(v) => walk_expr(v, visit),
                }
            }
        }
        Expr::Starred(e) | Expr::Attribute(e, _) => walk_expr(e, visit),
        Expr::UnaryOp { operand, .. } => walk_expr(operand, visit),
        Expr::Subscript(a, b) | Expr::BinOp { left: a, right: b, .. } => {
            walk_expr(a, visit);
            walk_expr(b, visit);
        }
        Expr::Call { func, args } => {
            walk_expr(func, visit);
            for arg in args {
                match arg {
                    Arg::Positional(e) | Arg::Keyword(_, e) | Arg::Star(e) | Arg::DoubleStar(e) => {
                        walk_expr(e, visit)
                    }
                }
            }
        }
        Expr::BoolOp { values, .. } => values.iter().for_each(|v| walk_expr(v, visit)),
        Expr::Compare { left, ops } => {
            walk_expr(left, visit);
            ops.iter().for_each(|(_, e)| walk_expr(e, visit));
        }
        Expr::IfExp { test, body, orelse } => {
            walk_expr(test, visit);
            walk_expr(body, visit);
            walk_expr(orelse, visit);
        }
        Expr::Name(_) | Expr::Const(_) | Expr::Opaque(_) => {}
    }
}
