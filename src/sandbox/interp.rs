//! Bounded evaluator for module code.
//!
//! Only data construction is modelled: containers, helper functions, classes
//! deriving from the stand-ins. Everything that would reach outside the
//! process (other imports, file handles, clients) evaluates to
//! `Value::Opaque`, which absorbs attribute access and calls. Constructing a
//! stand-in stops evaluation with `Flow::Captured`; exit calls stop it with
//! `Flow::Exit`. Neither can be caught by module code.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use log::debug;

use super::env::SubstitutionEnv;
use super::value::{
    Bound, Builtin, Class, Dict, Function, Instance, Key, MAX_NESTING, Method, Namespace, Scope, TooDeep, Value,
    shared,
};
use super::{Capture, ExitKind};
use crate::ir::SpecValue;
use crate::pysrc::ast::{
    self, Arg, BinOp, BoolOp, CmpOp, Constant, DictItem, Expr, FunctionDef, ImportName, ParamKind,
    Stmt, UnaryOp,
};

/// Non-local exits. Only `Error` is visible to `try`/`except`.
pub(crate) enum Flow {
    Error(String),
    Return(Value),
    Break,
    Continue,
    Exit(ExitKind),
    Captured(Capture),
}

type Exec<T> = Result<T, Flow>;

fn error<T>(message: impl Into<String>) -> Exec<T> {
    Err(Flow::Error(message.into()))
}

impl From<TooDeep> for Flow {
    fn from(err: TooDeep) -> Self {
        Flow::Error(err.to_string())
    }
}

const CONSTRAINT_KEYWORDS: &[&str] = &[
    "mutually_exclusive",
    "required_together",
    "required_one_of",
    "required_if",
    "required_by",
];

const DICT_METHODS: &[&str] = &["update", "copy", "get", "setdefault", "pop", "items", "keys", "values", "clear"];
const LIST_METHODS: &[&str] = &["append", "extend", "insert", "copy", "pop", "remove", "index", "count"];
const STR_METHODS: &[&str] = &[
    "lower", "upper", "strip", "lstrip", "rstrip", "split", "join", "replace", "startswith",
    "endswith", "format",
];

// builtins with no data meaning inside the sandbox
const OPAQUE_BUILTINS: &[&str] = &[
    "object", "type", "Exception", "BaseException", "ValueError", "TypeError", "KeyError",
    "ImportError", "ModuleNotFoundError", "AttributeError", "RuntimeError", "NotImplementedError",
    "OSError", "IOError", "getattr", "hasattr", "setattr", "open", "min", "max", "enumerate",
    "zip", "map", "filter", "any", "all", "repr", "format", "globals", "locals", "vars", "iter",
    "next", "abs", "round", "sum", "staticmethod", "classmethod", "property", "callable", "id",
    "hash", "bytes", "to_native", "to_text", "to_bytes",
];

const MAX_SEQUENCE: usize = 100_000;

#[derive(Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Module,
    Function,
    Class,
}

struct Frame {
    locals: Scope,
    closure: Vec<Scope>,
    kind: FrameKind,
    function: Option<Rc<Function>>,
}

pub(crate) struct Interpreter<'e> {
    env: &'e SubstitutionEnv,
    globals: Scope,
    stand_ins: IndexMap<String, Rc<Class>>,
    steps: usize,
    depth: usize,
}

// ————————————————————————————————————————————————————————————————————————————
// ENTRY POINTS
// ————————————————————————————————————————————————————————————————————————————

impl<'e> Interpreter<'e> {
    pub fn new(env: &'e SubstitutionEnv) -> Self {
        let mut stand_ins: IndexMap<String, Rc<Class>> = IndexMap::new();
        for def in env.stand_ins_parent_first() {
            let bases: Vec<Rc<Class>> = def
                .parent
                .as_ref()
                .and_then(|p| stand_ins.get(p))
                .cloned()
                .into_iter()
                .collect();
            let attrs: IndexMap<String, Value> = [
                ("__init__".to_string(), Value::Builtin(Builtin::StandInInit)),
                ("exit_json".to_string(), Value::Builtin(Builtin::ExitJson)),
                ("fail_json".to_string(), Value::Builtin(Builtin::FailJson)),
            ]
            .into_iter()
            .collect();
            let class = Class {
                name: def.name.clone(),
                bases,
                attrs: RefCell::new(attrs),
                stand_in: Some(def.name.clone()),
            };
            stand_ins.insert(def.name.clone(), Rc::new(class));
        }
        let globals = shared(IndexMap::new());
        globals.borrow_mut().insert("__name__".to_string(), Value::str("__sandbox__"));
        globals.borrow_mut().insert("__file__".to_string(), Value::Opaque);
        Self { env, globals, stand_ins, steps: 0, depth: 0 }
    }

    /// Run top-level statements. A failing statement is skipped; capture and
    /// exit end the run.
    pub fn run_module(&mut self, module: &ast::Module) -> Exec<()> {
        let frame = Frame {
            locals: self.globals.clone(),
            closure: Vec::new(),
            kind: FrameKind::Module,
            function: None,
        };
        for stmt in &module.body {
            match self.exec(&frame, stmt) {
                Ok(()) | Err(Flow::Return(_) | Flow::Break | Flow::Continue) => {}
                Err(Flow::Error(message)) => {
                    debug!("sandbox: skipping failed top-level statement: {message}");
                }
                Err(flow) => return Err(flow),
            }
        }
        Ok(())
    }

    /// Call a zero-argument module-level function. `None` when it is absent.
    pub fn call_entry(&mut self, name: &str) -> Option<Exec<Value>> {
        let entry = self.globals.borrow().get(name).cloned();
        match entry {
            Some(f @ Value::Function(_)) => Some(self.call(f, Vec::new(), IndexMap::new())),
            _ => None,
        }
    }

    fn tick(&mut self) -> Exec<()> {
        self.steps += 1;
        if self.steps > self.env.step_limit {
            return error("step limit exceeded");
        }
        Ok(())
    }
}

// ————————————————————————————————————————————————————————————————————————————
// STATEMENTS
// ————————————————————————————————————————————————————————————————————————————

impl Interpreter<'_> {
    fn exec_block(&mut self, frame: &Frame, body: &[Stmt]) -> Exec<()> {
        for stmt in body {
            self.exec(frame, stmt)?;
        }
        Ok(())
    }

    fn exec(&mut self, frame: &Frame, stmt: &Stmt) -> Exec<()> {
        self.tick()?;
        match stmt {
            Stmt::Expr(e) => {
                self.eval(frame, e)?;
            }
            Stmt::Assign { targets, value } => {
                let value = self.eval(frame, value)?;
                for target in targets {
                    self.assign(frame, target, value.clone())?;
                }
            }
            Stmt::AugAssign { target, op, value } => {
                let current = self.eval(frame, target)?;
                let rhs = self.eval(frame, value)?;
                let updated = augmented(current, *op, rhs)?;
                self.assign(frame, target, updated)?;
            }
            Stmt::AnnAssign { target, value } => {
                if let Some(value) = value {
                    let value = self.eval(frame, value)?;
                    self.assign(frame, target, value)?;
                }
            }
            Stmt::Delete(targets) => {
                for target in targets {
                    self.delete(frame, target)?;
                }
            }
            Stmt::Import(names) => {
                for name in names {
                    self.import(frame, name);
                }
            }
            Stmt::ImportFrom { module, names } => self.import_from(frame, module, names),
            Stmt::FunctionDef(def) => {
                let function = self.make_function(frame, def)?;
                frame.locals.borrow_mut().insert(def.name.clone(), Value::Function(function));
            }
            Stmt::ClassDef(def) => {
                let class = self.make_class(frame, def)?;
                frame.locals.borrow_mut().insert(def.name.clone(), Value::Class(class));
            }
            Stmt::Return(value) => {
                let value = match value {
                    Some(e) => self.eval(frame, e)?,
                    None => Value::None,
                };
                return Err(Flow::Return(value));
            }
            Stmt::If { test, body, orelse } => {
                if self.condition(frame, test)? {
                    self.exec_block(frame, body)?;
                } else {
                    self.exec_block(frame, orelse)?;
                }
            }
            Stmt::For { target, iter, body, orelse } => self.exec_for(frame, target, iter, body, orelse)?,
            Stmt::Try { body, handlers, orelse, finalbody } => {
                self.exec_try(frame, body, handlers, orelse, finalbody)?
            }
            Stmt::With { items, body } => {
                for (ctx, target) in items {
                    let value = self.eval(frame, ctx)?;
                    if let Some(target) = target {
                        self.assign(frame, target, value)?;
                    }
                }
                self.exec_block(frame, body)?;
            }
            Stmt::Raise(exc) => return error(describe_raise(exc.as_ref())),
            Stmt::Pass => {}
            Stmt::Break => return Err(Flow::Break),
            Stmt::Continue => return Err(Flow::Continue),
            Stmt::Opaque { line } => debug!("sandbox: skipping unsupported statement at line {line}"),
        }
        Ok(())
    }

    fn condition(&mut self, frame: &Frame, test: &Expr) -> Exec<bool> {
        let value = self.eval(frame, test)?;
        Ok(value.truthy().unwrap_or_else(|| {
            debug!("sandbox: undecidable condition treated as false");
            false
        }))
    }

    fn exec_for(
        &mut self,
        frame: &Frame,
        target: &Expr,
        iter: &Expr,
        body: &[Stmt],
        orelse: &[Stmt],
    ) -> Exec<()> {
        let iterable = self.eval(frame, iter)?;
        let items = match iterable.iter_items() {
            Some(items) => items,
            None if matches!(iterable, Value::Opaque) => {
                debug!("sandbox: loop over opaque value skipped");
                return Ok(());
            }
            None => return error(format!("'{}' object is not iterable", iterable.type_name())),
        };
        for item in items {
            self.assign(frame, target, item)?;
            match self.exec_block(frame, body) {
                Ok(()) | Err(Flow::Continue) => {}
                Err(Flow::Break) => return Ok(()),
                Err(flow) => return Err(flow),
            }
        }
        self.exec_block(frame, orelse)
    }

    fn exec_try(
        &mut self,
        frame: &Frame,
        body: &[Stmt],
        handlers: &[ast::Handler],
        orelse: &[Stmt],
        finalbody: &[Stmt],
    ) -> Exec<()> {
        let mut outcome = match (self.exec_block(frame, body), handlers.first()) {
            (Err(Flow::Error(message)), Some(handler)) => {
                debug!("sandbox: handled exception: {message}");
                if let Some(name) = &handler.name {
                    frame.locals.borrow_mut().insert(name.clone(), Value::str(&message));
                }
                self.exec_block(frame, &handler.body)
            }
            (Ok(()), _) => self.exec_block(frame, orelse),
            (other, _) => other,
        };
        if !finalbody.is_empty() {
            let finished = self.exec_block(frame, finalbody);
            if finished.is_err() {
                outcome = finished;
            }
        }
        outcome
    }

    fn assign(&mut self, frame: &Frame, target: &Expr, value: Value) -> Exec<()> {
        match target {
            Expr::Name(name) => {
                frame.locals.borrow_mut().insert(name.clone(), value);
                Ok(())
            }
            Expr::Tuple(targets) | Expr::List(targets) => self.unpack(frame, targets, value),
            Expr::Attribute(obj, name) => {
                match self.eval(frame, obj)? {
                    Value::Instance(inst) => {
                        inst.attrs.borrow_mut().insert(name.clone(), value);
                    }
                    Value::Class(class) => {
                        class.attrs.borrow_mut().insert(name.clone(), value);
                    }
                    Value::Module(ns) => {
                        ns.attrs.borrow_mut().insert(name.clone(), value);
                    }
                    Value::Opaque => {}
                    other => {
                        return error(format!("cannot set attribute on '{}'", other.type_name()));
                    }
                }
                Ok(())
            }
            Expr::Subscript(obj, index) => {
                let obj = self.eval(frame, obj)?;
                let index = self.eval(frame, index)?;
                set_item(&obj, &index, value)
            }
            _ => error("unsupported assignment target"),
        }
    }

    fn unpack(&mut self, frame: &Frame, targets: &[Expr], value: Value) -> Exec<()> {
        let items = match value.iter_items() {
            Some(items) => items,
            None if matches!(value, Value::Opaque) => {
                for target in targets {
                    let inner = match target {
                        Expr::Starred(inner) => inner,
                        other => other,
                    };
                    self.assign(frame, inner, Value::Opaque)?;
                }
                return Ok(());
            }
            None => return error(format!("cannot unpack '{}'", value.type_name())),
        };
        let star = targets.iter().position(|t| matches!(t, Expr::Starred(_)));
        let Some(star) = star else {
            if items.len() != targets.len() {
                return error(format!("cannot unpack {} values into {} targets", items.len(), targets.len()));
            }
            for (target, item) in targets.iter().zip(items) {
                self.assign(frame, target, item)?;
            }
            return Ok(());
        };
        let after = targets.len() - star - 1;
        if items.len() < targets.len() - 1 {
            return error("not enough values to unpack");
        }
        let tail_start = items.len() - after;
        for (target, item) in targets[..star].iter().zip(&items[..star]) {
            self.assign(frame, target, item.clone())?;
        }
        if let Expr::Starred(inner) = &targets[star] {
            self.assign(frame, inner, Value::new_list(items[star..tail_start].to_vec()))?;
        }
        for (target, item) in targets[star + 1..].iter().zip(&items[tail_start..]) {
            self.assign(frame, target, item.clone())?;
        }
        Ok(())
    }

    fn delete(&mut self, frame: &Frame, target: &Expr) -> Exec<()> {
        match target {
            Expr::Name(name) => {
                frame.locals.borrow_mut().shift_remove(name);
            }
            Expr::Subscript(obj, index) => {
                let obj = self.eval(frame, obj)?;
                let index = self.eval(frame, index)?;
                match &obj {
                    Value::Dict(d) => {
                        let key = hashable(&index)?;
                        if d.borrow_mut().shift_remove(&key).is_none() {
                            return error(format!("KeyError: {}", key.to_label()));
                        }
                    }
                    Value::List(xs) => {
                        let mut xs = xs.borrow_mut();
                        let i = position(&index, xs.len())?;
                        xs.remove(i);
                    }
                    _ => {}
                }
            }
            Expr::Attribute(obj, name) => {
                if let Value::Instance(inst) = self.eval(frame, obj)? {
                    inst.attrs.borrow_mut().shift_remove(name);
                }
            }
            Expr::Tuple(targets) | Expr::List(targets) => {
                for target in targets {
                    self.delete(frame, target)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn import(&mut self, frame: &Frame, name: &ImportName) {
        if self.env.is_framework_module(&name.name) {
            debug!("sandbox: substituting framework module {}", name.name);
        }
        let (binding, path) = match &name.alias {
            Some(alias) => (alias.clone(), name.name.clone()),
            None => {
                let head = name.name.split('.').next().unwrap_or(&name.name).to_string();
                (head.clone(), head)
            }
        };
        frame.locals.borrow_mut().insert(binding, namespace(&path));
    }

    fn import_from(&mut self, frame: &Frame, module: &str, names: &[ImportName]) {
        let framework = self.env.is_framework_module(module);
        for name in names {
            if name.name == "*" {
                if framework {
                    let symbols: Vec<(String, Value)> = self
                        .stand_ins
                        .iter()
                        .map(|(n, c)| (n.clone(), Value::Class(c.clone())))
                        .collect();
                    frame.locals.borrow_mut().extend(symbols);
                }
                continue;
            }
            let value = if framework {
                debug!("sandbox: resolving {}.{} through the substitution environment", module, name.name);
                self.framework_symbol(&name.name)
                    .unwrap_or_else(|| namespace(&format!("{module}.{}", name.name)))
            } else if module == "copy" {
                copy_module_symbol(&name.name)
            } else {
                Value::Opaque
            };
            let binding = name.alias.clone().unwrap_or_else(|| name.name.clone());
            frame.locals.borrow_mut().insert(binding, value);
        }
    }

    fn framework_symbol(&self, name: &str) -> Option<Value> {
        if let Some(class) = self.stand_ins.get(name) {
            return Some(Value::Class(class.clone()));
        }
        self.env.helper_index(name).map(|i| Value::Builtin(Builtin::Helper(i)))
    }

    fn enclosing_scopes(frame: &Frame) -> Vec<Scope> {
        match frame.kind {
            FrameKind::Module => Vec::new(),
            FrameKind::Class => frame.closure.clone(),
            FrameKind::Function => {
                let mut scopes = vec![frame.locals.clone()];
                scopes.extend(frame.closure.iter().cloned());
                scopes
            }
        }
    }

    fn make_function(&mut self, frame: &Frame, def: &Rc<FunctionDef>) -> Exec<Rc<Function>> {
        let mut defaults = Vec::with_capacity(def.params.len());
        for param in &def.params {
            let default = match &param.default {
                Some(e) => Some(self.eval(frame, e)?),
                None => None,
            };
            defaults.push(default);
        }
        Ok(Rc::new(Function {
            def: def.clone(),
            defaults,
            closure: Self::enclosing_scopes(frame),
            owner: RefCell::new(None),
        }))
    }

    fn make_class(&mut self, frame: &Frame, def: &Rc<ast::ClassDef>) -> Exec<Rc<Class>> {
        let mut bases = Vec::new();
        for base in &def.bases {
            match self.eval(frame, base)? {
                Value::Class(class) => bases.push(class),
                other => debug!("sandbox: class {} ignores base {:?}", def.name, other),
            }
        }
        let body = Frame {
            locals: shared(IndexMap::new()),
            closure: Self::enclosing_scopes(frame),
            kind: FrameKind::Class,
            function: None,
        };
        self.exec_block(&body, &def.body)?;
        let attrs = body.locals.borrow().clone();
        let class = Rc::new(Class {
            name: def.name.clone(),
            bases,
            attrs: RefCell::new(attrs),
            stand_in: None,
        });
        for value in class.attrs.borrow().values() {
            if let Value::Function(f) = value {
                *f.owner.borrow_mut() = Some(Rc::downgrade(&class));
            }
        }
        Ok(class)
    }
}

// ————————————————————————————————————————————————————————————————————————————
// EXPRESSIONS
// ————————————————————————————————————————————————————————————————————————————

impl Interpreter<'_> {
    fn eval(&mut self, frame: &Frame, expr: &Expr) -> Exec<Value> {
        match expr {
            Expr::Name(name) => self.lookup(frame, name),
            Expr::Const(c) => Ok(constant(c)),
            Expr::List(xs) => Ok(Value::new_list(self.eval_elements(frame, xs)?)),
            Expr::Tuple(xs) => Ok(Value::Tuple(Rc::new(self.eval_elements(frame, xs)?))),
            Expr::Set(xs) => {
                let items = self.eval_elements(frame, xs)?;
                Ok(Value::Set(shared(dedup(items))))
            }
            Expr::Dict(items) => self.eval_dict(frame, items),
            Expr::Starred(_) => error("starred expression outside of a display"),
            Expr::Attribute(obj, name) => {
                let obj = self.eval(frame, obj)?;
                self.get_attr(&obj, name)
            }
            Expr::Subscript(obj, index) => {
                let obj = self.eval(frame, obj)?;
                let index = self.eval(frame, index)?;
                get_item(&obj, &index)
            }
            Expr::Call { func, args } => {
                let callee = self.eval(frame, func)?;
                let (positional, keywords) = self.eval_args(frame, args)?;
                if let Value::Builtin(Builtin::Super) = callee {
                    return self.make_super(frame, &positional);
                }
                self.call(callee, positional, keywords)
            }
            Expr::BinOp { left, op, right } => {
                let left = self.eval(frame, left)?;
                let right = self.eval(frame, right)?;
                binary(left, *op, right)
            }
            Expr::UnaryOp { op, operand } => {
                let operand = self.eval(frame, operand)?;
                unary(*op, operand)
            }
            Expr::BoolOp { op, values } => {
                let mut last = Value::None;
                for value in values {
                    last = self.eval(frame, value)?;
                    match (op, last.truthy()) {
                        (_, None) => return Ok(Value::Opaque),
                        (BoolOp::And, Some(false)) | (BoolOp::Or, Some(true)) => return Ok(last),
                        _ => {}
                    }
                }
                Ok(last)
            }
            Expr::Compare { left, ops } => {
                let mut left = self.eval(frame, left)?;
                for (op, right) in ops {
                    let right = self.eval(frame, right)?;
                    match compare(*op, &left, &right)? {
                        Some(true) => {}
                        Some(false) => return Ok(Value::Bool(false)),
                        None => return Ok(Value::Opaque),
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::IfExp { test, body, orelse } => {
                if self.condition(frame, test)? {
                    self.eval(frame, body)
                } else {
                    self.eval(frame, orelse)
                }
            }
            Expr::Opaque(_) => Ok(Value::Opaque),
        }
    }

    fn lookup(&self, frame: &Frame, name: &str) -> Exec<Value> {
        if let Some(v) = frame.locals.borrow().get(name) {
            return Ok(v.clone());
        }
        for scope in &frame.closure {
            if let Some(v) = scope.borrow().get(name) {
                return Ok(v.clone());
            }
        }
        if let Some(v) = self.globals.borrow().get(name) {
            return Ok(v.clone());
        }
        if let Some(b) = Builtin::from_name(name) {
            return Ok(Value::Builtin(b));
        }
        if OPAQUE_BUILTINS.contains(&name) {
            return Ok(Value::Opaque);
        }
        error(format!("name '{name}' is not defined"))
    }

    fn eval_elements(&mut self, frame: &Frame, exprs: &[Expr]) -> Exec<Vec<Value>> {
        let mut out = Vec::with_capacity(exprs.len());
        for expr in exprs {
            match expr {
                Expr::Starred(inner) => {
                    let value = self.eval(frame, inner)?;
                    out.extend(iterate(&value)?);
                }
                other => out.push(self.eval(frame, other)?),
            }
        }
        Ok(out)
    }

    fn eval_dict(&mut self, frame: &Frame, items: &[DictItem]) -> Exec<Value> {
        let mut dict = Dict::new();
        for item in items {
            match item {
                DictItem::Pair(k, v) => {
                    let key = hashable(&self.eval(frame, k)?)?;
                    let value = self.eval(frame, v)?;
                    dict.insert(key, value);
                }
                DictItem::Unpack(e) => {
                    let value = self.eval(frame, e)?;
                    extend_dict(&mut dict, &value)?;
                }
            }
        }
        Ok(Value::new_dict(dict))
    }

    fn eval_args(&mut self, frame: &Frame, args: &[Arg]) -> Exec<(Vec<Value>, IndexMap<String, Value>)> {
        let mut positional = Vec::new();
        let mut keywords = IndexMap::new();
        for arg in args {
            match arg {
                Arg::Positional(e) => positional.push(self.eval(frame, e)?),
                Arg::Keyword(name, e) => {
                    let value = self.eval(frame, e)?;
                    keywords.insert(name.clone(), value);
                }
                Arg::Star(e) => {
                    let value = self.eval(frame, e)?;
                    positional.extend(iterate(&value)?);
                }
                Arg::DoubleStar(e) => match self.eval(frame, e)? {
                    Value::Dict(d) => {
                        for (k, v) in d.borrow().iter() {
                            keywords.insert(k.to_label(), v.clone());
                        }
                    }
                    Value::Opaque => debug!("sandbox: dropping opaque **kwargs"),
                    other => return error(format!("argument after ** must be a mapping, not {}", other.type_name())),
                },
            }
        }
        Ok((positional, keywords))
    }

    fn get_attr(&self, obj: &Value, name: &str) -> Exec<Value> {
        match obj {
            Value::Instance(inst) => {
                if let Some(v) = inst.attrs.borrow().get(name) {
                    return Ok(v.clone());
                }
                Ok(match inst.class.lookup(name) {
                    Some(v) => bind(obj, v),
                    None => Value::Opaque,
                })
            }
            Value::Class(class) => Ok(class.lookup(name).unwrap_or(Value::Opaque)),
            Value::Super(inst, class) => {
                let mro = inst.class.ancestry();
                let start = mro.iter().position(|c| Rc::ptr_eq(c, class)).map_or(0, |p| p + 1);
                let receiver = Value::Instance(inst.clone());
                for c in &mro[start..] {
                    if let Some(v) = c.attrs.borrow().get(name) {
                        return Ok(bind(&receiver, v.clone()));
                    }
                }
                Ok(Value::Opaque)
            }
            Value::Module(ns) => {
                if let Some(v) = ns.attrs.borrow().get(name) {
                    return Ok(v.clone());
                }
                if self.env.is_framework_module(&ns.name) {
                    return Ok(self
                        .framework_symbol(name)
                        .unwrap_or_else(|| namespace(&format!("{}.{name}", ns.name))));
                }
                if ns.name == "copy" {
                    return Ok(copy_module_symbol(name));
                }
                Ok(Value::Opaque)
            }
            Value::Dict(_) => native(obj, name, DICT_METHODS),
            Value::List(_) => native(obj, name, LIST_METHODS),
            Value::Str(_) => native(obj, name, STR_METHODS),
            Value::Opaque => Ok(Value::Opaque),
            other => error(format!("'{}' object has no attribute '{name}'", other.type_name())),
        }
    }

    fn make_super(&self, frame: &Frame, args: &[Value]) -> Exec<Value> {
        if let [Value::Class(class), Value::Instance(inst)] = args {
            return Ok(Value::Super(inst.clone(), class.clone()));
        }
        let Some(function) = &frame.function else {
            return error("super(): no arguments");
        };
        let owner = function.owner.borrow().as_ref().and_then(Weak::upgrade);
        let receiver = function
            .def
            .params
            .first()
            .and_then(|p| frame.locals.borrow().get(&p.name).cloned());
        match (owner, receiver) {
            (Some(class), Some(Value::Instance(inst))) => Ok(Value::Super(inst, class)),
            _ => error("super(): no arguments"),
        }
    }
}

// ————————————————————————————————————————————————————————————————————————————
// CALLS
// ————————————————————————————————————————————————————————————————————————————

impl Interpreter<'_> {
    fn call(&mut self, callee: Value, args: Vec<Value>, kwargs: IndexMap<String, Value>) -> Exec<Value> {
        self.tick()?;
        match callee {
            Value::Function(f) => self.call_function(&f, args, kwargs),
            Value::Builtin(b) => self.call_builtin(b, args, kwargs),
            Value::Class(class) => self.instantiate(&class, args, kwargs),
            Value::Bound(bound) => {
                if let Method::Native(name) = bound.target {
                    return self.call_native(&bound.receiver, name, args, kwargs);
                }
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(bound.receiver.clone());
                full.extend(args);
                match &bound.target {
                    Method::Function(f) => self.call_function(f, full, kwargs),
                    Method::Builtin(b) => self.call_builtin(*b, full, kwargs),
                    Method::Native(_) => Ok(Value::Opaque),
                }
            }
            Value::Opaque | Value::Module(_) | Value::Instance(_) => Ok(Value::Opaque),
            other => error(format!("'{}' object is not callable", other.type_name())),
        }
    }

    fn call_function(
        &mut self,
        function: &Rc<Function>,
        args: Vec<Value>,
        kwargs: IndexMap<String, Value>,
    ) -> Exec<Value> {
        if self.depth >= self.env.max_call_depth {
            return error("maximum call depth exceeded");
        }
        let frame = Frame {
            locals: bind_arguments(function, args, kwargs)?,
            closure: function.closure.clone(),
            kind: FrameKind::Function,
            function: Some(function.clone()),
        };
        self.depth += 1;
        let result = self.exec_block(&frame, &function.def.body);
        self.depth -= 1;
        match result {
            Ok(()) => Ok(Value::None),
            Err(Flow::Return(value)) => Ok(value),
            Err(Flow::Break | Flow::Continue) => error("'break' or 'continue' outside loop"),
            Err(flow) => Err(flow),
        }
    }

    fn instantiate(&mut self, class: &Rc<Class>, args: Vec<Value>, kwargs: IndexMap<String, Value>) -> Exec<Value> {
        let instance = Value::Instance(Rc::new(Instance {
            class: class.clone(),
            attrs: RefCell::new(IndexMap::new()),
        }));
        if let Some(init) = class.lookup("__init__") {
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(instance.clone());
            full.extend(args);
            match init {
                Value::Function(f) => {
                    self.call_function(&f, full, kwargs)?;
                }
                Value::Builtin(b) => {
                    self.call_builtin(b, full, kwargs)?;
                }
                _ => {}
            }
        }
        Ok(instance)
    }

    fn call_builtin(&mut self, builtin: Builtin, args: Vec<Value>, kwargs: IndexMap<String, Value>) -> Exec<Value> {
        let first = args.first();
        match builtin {
            Builtin::Dict => {
                let mut dict = Dict::new();
                if let Some(source) = first {
                    extend_dict(&mut dict, source)?;
                }
                for (k, v) in kwargs {
                    dict.insert(Key::str(&k), v);
                }
                Ok(Value::new_dict(dict))
            }
            Builtin::List => Ok(Value::new_list(match first {
                Some(v) => iterate(v)?,
                None => Vec::new(),
            })),
            Builtin::Tuple => Ok(Value::Tuple(Rc::new(match first {
                Some(v) => iterate(v)?,
                None => Vec::new(),
            }))),
            Builtin::Set => Ok(Value::Set(shared(dedup(match first {
                Some(v) => iterate(v)?,
                None => Vec::new(),
            })))),
            Builtin::Str => Ok(match first {
                Some(Value::Opaque) => Value::Opaque,
                Some(v) => Value::str(&py_str(v)),
                None => Value::str(""),
            }),
            Builtin::Int => to_int(first),
            Builtin::Float => to_float(first),
            Builtin::Bool => Ok(match first.map(Value::truthy) {
                Some(Some(b)) => Value::Bool(b),
                Some(None) => Value::Opaque,
                None => Value::Bool(false),
            }),
            Builtin::Len => match first {
                Some(Value::Opaque) => Ok(Value::Opaque),
                Some(Value::Dict(d)) => Ok(Value::Int(d.borrow().len() as i64)),
                Some(Value::Str(s)) => Ok(Value::Int(s.chars().count() as i64)),
                Some(v) => Ok(Value::Int(iterate(v)?.len() as i64)),
                None => error("len() takes exactly one argument"),
            },
            Builtin::Sorted => {
                let mut items = match first {
                    Some(v) => iterate(v)?,
                    None => return error("sorted expected 1 argument"),
                };
                let mut incomparable = false;
                items.sort_by(|a, b| {
                    ordering(a, b).unwrap_or_else(|| {
                        incomparable = true;
                        Ordering::Equal
                    })
                });
                if incomparable {
                    return error("'<' not supported between these values");
                }
                if kwargs.get("reverse").and_then(Value::truthy).unwrap_or(false) {
                    items.reverse();
                }
                Ok(Value::new_list(items))
            }
            Builtin::Range => range(&args),
            Builtin::Super => error("super() used outside a method call"),
            Builtin::Print => Ok(Value::None),
            Builtin::IsInstance => is_instance(&args),
            Builtin::Copy => Ok(first.map(Value::shallow_copy).unwrap_or(Value::None)),
            Builtin::DeepCopy => match first {
                Some(value) => Ok(value.deep_copy()?),
                None => Ok(Value::None),
            },
            Builtin::StandInInit => Err(Flow::Captured(self.capture(args, kwargs)?)),
            Builtin::ExitJson => Err(Flow::Exit(ExitKind::Success)),
            Builtin::FailJson => Err(Flow::Exit(ExitKind::Failure)),
            Builtin::Helper(index) => {
                let Some(helper) = self.env.helper_at(index) else {
                    return Ok(Value::Opaque);
                };
                debug!("sandbox: spec helper {} called", helper.name);
                let result = Value::from_spec(&helper.spec());
                if helper.merge_keywords {
                    if let Value::Dict(d) = &result {
                        let mut d = d.borrow_mut();
                        for (k, v) in kwargs {
                            d.insert(Key::str(&k), v);
                        }
                    }
                }
                Ok(result)
            }
        }
    }

    /// Constructor of a stand-in: record the spec and every constraint
    /// keyword, plus the parameters contributed by the stand-in ancestry.
    fn capture(&self, args: Vec<Value>, kwargs: IndexMap<String, Value>) -> Exec<Capture> {
        let mut args = args.into_iter();
        let receiver = args.next();
        let ancestry: Vec<Rc<Class>> = match &receiver {
            Some(Value::Instance(inst)) => inst
                .class
                .ancestry()
                .into_iter()
                .filter(|c| c.stand_in.is_some())
                .collect(),
            _ => Vec::new(),
        };
        let argument_spec = kwargs
            .get("argument_spec")
            .cloned()
            .or_else(|| args.next())
            .unwrap_or(Value::None);
        let mut constraints = IndexMap::new();
        for keyword in CONSTRAINT_KEYWORDS {
            if let Some(value) = kwargs.get(*keyword) {
                constraints.insert(keyword.to_string(), value.to_spec()?);
            }
        }
        let mut base_args: IndexMap<String, SpecValue> = IndexMap::new();
        for class in &ancestry {
            let def = class.stand_in.as_deref().and_then(|n| self.env.stand_in(n));
            if let Some(SpecValue::Map(params)) = def.map(|d| d.base_spec()) {
                for (name, node) in params {
                    base_args.entry(name).or_insert(node);
                }
            }
        }
        let stand_in = ancestry
            .first()
            .and_then(|c| c.stand_in.clone())
            .unwrap_or_default();
        debug!("sandbox: captured argument_spec from {stand_in} constructor");
        Ok(Capture {
            stand_in,
            argument_spec: argument_spec.to_spec()?,
            base_args,
            constraints,
        })
    }

    fn call_native(
        &mut self,
        receiver: &Value,
        name: &str,
        args: Vec<Value>,
        kwargs: IndexMap<String, Value>,
    ) -> Exec<Value> {
        match receiver {
            Value::Dict(d) => dict_method(d, name, args, kwargs),
            Value::List(xs) => list_method(xs, name, args),
            Value::Str(s) => str_method(s, name, args),
            _ => Ok(Value::Opaque),
        }
    }
}

// ————————————————————————————————————————————————————————————————————————————
// INTERNAL HELPERS
// ————————————————————————————————————————————————————————————————————————————

fn bind_arguments(function: &Function, args: Vec<Value>, mut kwargs: IndexMap<String, Value>) -> Exec<Scope> {
    let name = &function.def.name;
    let mut locals = IndexMap::new();
    let mut positional = args.into_iter();
    let mut var_args: Option<(String, Vec<Value>)> = None;
    let mut var_kwargs: Option<String> = None;
    for (param, default) in function.def.params.iter().zip(&function.defaults) {
        match param.kind {
            ParamKind::Normal => {
                let value = match positional.next() {
                    Some(_) if kwargs.contains_key(&param.name) => {
                        return error(format!("{name}() got multiple values for argument '{}'", param.name));
                    }
                    Some(v) => v,
                    None => match kwargs.shift_remove(&param.name).or_else(|| default.clone()) {
                        Some(v) => v,
                        None => return error(format!("{name}() missing required argument '{}'", param.name)),
                    },
                };
                locals.insert(param.name.clone(), value);
            }
            ParamKind::KeywordOnly => {
                let value = match kwargs.shift_remove(&param.name).or_else(|| default.clone()) {
                    Some(v) => v,
                    None => return error(format!("{name}() missing keyword argument '{}'", param.name)),
                };
                locals.insert(param.name.clone(), value);
            }
            ParamKind::VarArgs => var_args = Some((param.name.clone(), positional.by_ref().collect())),
            ParamKind::VarKwargs => var_kwargs = Some(param.name.clone()),
        }
    }
    if positional.next().is_some() {
        return error(format!("{name}() got too many positional arguments"));
    }
    if let Some((param, rest)) = var_args {
        locals.insert(param, Value::Tuple(Rc::new(rest)));
    }
    match var_kwargs {
        Some(param) => {
            let extra: Dict = kwargs.into_iter().map(|(k, v)| (Key::str(&k), v)).collect();
            locals.insert(param, Value::new_dict(extra));
        }
        None => {
            if let Some(unexpected) = kwargs.keys().next() {
                return error(format!("{name}() got an unexpected keyword argument '{unexpected}'"));
            }
        }
    }
    Ok(shared(locals))
}

fn bind(receiver: &Value, attr: Value) -> Value {
    let target = match attr {
        Value::Function(f) => Method::Function(f),
        Value::Builtin(b @ (Builtin::StandInInit | Builtin::ExitJson | Builtin::FailJson)) => Method::Builtin(b),
        other => return other,
    };
    Value::Bound(Rc::new(Bound { receiver: receiver.clone(), target }))
}

fn native(receiver: &Value, name: &str, methods: &[&'static str]) -> Exec<Value> {
    match methods.iter().find(|m| **m == name) {
        Some(method) => Ok(Value::Bound(Rc::new(Bound {
            receiver: receiver.clone(),
            target: Method::Native(method),
        }))),
        None => error(format!("'{}' object has no attribute '{name}'", receiver.type_name())),
    }
}

fn namespace(name: &str) -> Value {
    Value::Module(Rc::new(Namespace { name: name.to_string(), attrs: RefCell::new(IndexMap::new()) }))
}

fn copy_module_symbol(name: &str) -> Value {
    match name {
        "deepcopy" => Value::Builtin(Builtin::DeepCopy),
        "copy" => Value::Builtin(Builtin::Copy),
        _ => Value::Opaque,
    }
}

fn describe_raise(exc: Option<&Expr>) -> String {
    let name = match exc {
        Some(Expr::Call { func, .. }) => match func.as_ref() {
            Expr::Name(n) => Some(n.as_str()),
            Expr::Attribute(_, n) => Some(n.as_str()),
            _ => None,
        },
        Some(Expr::Name(n)) => Some(n.as_str()),
        _ => None,
    };
    match name {
        Some(name) => format!("module code raised {name}"),
        None => "module code raised an exception".to_string(),
    }
}

fn constant(c: &Constant) -> Value {
    match c {
        Constant::None | Constant::Ellipsis => Value::None,
        Constant::Bool(b) => Value::Bool(*b),
        Constant::Int(i) => Value::Int(*i),
        Constant::Float(f) => Value::Float(*f),
        Constant::Str(s) => Value::str(s),
    }
}

fn hashable(value: &Value) -> Exec<Key> {
    match Key::from_value(value) {
        Some(key) => Ok(key),
        None => error(format!("unhashable type: '{}'", value.type_name())),
    }
}

fn iterate(value: &Value) -> Exec<Vec<Value>> {
    match value.iter_items() {
        Some(items) => Ok(items),
        None => error(format!("'{}' object is not iterable", value.type_name())),
    }
}

fn dedup(items: Vec<Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
        if !out.iter().any(|x| x.py_eq(&item)) {
            out.push(item);
        }
    }
    out
}

fn extend_dict(dict: &mut Dict, source: &Value) -> Exec<()> {
    match source {
        Value::Dict(d) => {
            let entries: Vec<(Key, Value)> = d.borrow().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            dict.extend(entries);
        }
        Value::List(_) | Value::Tuple(_) => {
            for pair in iterate(source)? {
                match iterate(&pair)?.as_slice() {
                    [k, v] => {
                        dict.insert(hashable(k)?, v.clone());
                    }
                    _ => return error("dictionary update sequence element has wrong length"),
                }
            }
        }
        other => return error(format!("'{}' object is not a mapping", other.type_name())),
    }
    Ok(())
}

fn position(index: &Value, len: usize) -> Exec<usize> {
    let i = match index {
        Value::Int(i) => *i,
        Value::Bool(b) => i64::from(*b),
        other => return error(format!("indices must be integers, not {}", other.type_name())),
    };
    let resolved = if i < 0 { i + len as i64 } else { i };
    if resolved < 0 || resolved as usize >= len {
        return error("index out of range");
    }
    Ok(resolved as usize)
}

fn get_item(obj: &Value, index: &Value) -> Exec<Value> {
    if matches!(index, Value::Opaque) {
        return Ok(Value::Opaque);
    }
    match obj {
        Value::Dict(d) => {
            let key = hashable(index)?;
            match d.borrow().get(&key) {
                Some(v) => Ok(v.clone()),
                None => error(format!("KeyError: {}", key.to_label())),
            }
        }
        Value::List(xs) => {
            let xs = xs.borrow();
            Ok(xs[position(index, xs.len())?].clone())
        }
        Value::Tuple(xs) => Ok(xs[position(index, xs.len())?].clone()),
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            Ok(Value::str(&chars[position(index, chars.len())?].to_string()))
        }
        Value::Opaque | Value::Instance(_) | Value::Module(_) => Ok(Value::Opaque),
        other => error(format!("'{}' object is not subscriptable", other.type_name())),
    }
}

fn set_item(obj: &Value, index: &Value, value: Value) -> Exec<()> {
    match obj {
        Value::Dict(d) => {
            let key = hashable(index)?;
            d.borrow_mut().insert(key, value);
        }
        Value::List(xs) => {
            let mut xs = xs.borrow_mut();
            let i = position(index, xs.len())?;
            xs[i] = value;
        }
        Value::Opaque | Value::Instance(_) => {}
        other => return error(format!("'{}' object does not support item assignment", other.type_name())),
    }
    Ok(())
}

fn dict_method(d: &Rc<RefCell<Dict>>, name: &str, args: Vec<Value>, kwargs: IndexMap<String, Value>) -> Exec<Value> {
    let mut args = args.into_iter();
    match name {
        "update" => {
            let mut incoming = Dict::new();
            for source in args {
                extend_dict(&mut incoming, &source)?;
            }
            for (k, v) in kwargs {
                incoming.insert(Key::str(&k), v);
            }
            d.borrow_mut().extend(incoming);
            Ok(Value::None)
        }
        "copy" => Ok(Value::new_dict(d.borrow().clone())),
        "get" => {
            let key = hashable(&args.next().unwrap_or(Value::None))?;
            let fallback = args.next().unwrap_or(Value::None);
            Ok(d.borrow().get(&key).cloned().unwrap_or(fallback))
        }
        "setdefault" => {
            let key = hashable(&args.next().unwrap_or(Value::None))?;
            let fallback = args.next().unwrap_or(Value::None);
            Ok(d.borrow_mut().entry(key).or_insert(fallback).clone())
        }
        "pop" => {
            let key = hashable(&args.next().unwrap_or(Value::None))?;
            let removed = d.borrow_mut().shift_remove(&key);
            match (removed, args.next()) {
                (Some(v), _) | (None, Some(v)) => Ok(v),
                (None, None) => error(format!("KeyError: {}", key.to_label())),
            }
        }
        "items" => Ok(Value::new_list(
            d.borrow()
                .iter()
                .map(|(k, v)| Value::Tuple(Rc::new(vec![k.to_value(), v.clone()])))
                .collect(),
        )),
        "keys" => Ok(Value::new_list(d.borrow().keys().map(Key::to_value).collect())),
        "values" => Ok(Value::new_list(d.borrow().values().cloned().collect())),
        "clear" => {
            d.borrow_mut().clear();
            Ok(Value::None)
        }
        _ => Ok(Value::Opaque),
    }
}

fn list_method(xs: &Rc<RefCell<Vec<Value>>>, name: &str, args: Vec<Value>) -> Exec<Value> {
    let mut args = args.into_iter();
    match name {
        "append" => {
            let item = args.next().unwrap_or(Value::None);
            xs.borrow_mut().push(item);
            Ok(Value::None)
        }
        "extend" => {
            let items = iterate(&args.next().unwrap_or(Value::None))?;
            xs.borrow_mut().extend(items);
            Ok(Value::None)
        }
        "insert" => {
            let at = args.next().unwrap_or(Value::Int(0));
            let item = args.next().unwrap_or(Value::None);
            let mut xs = xs.borrow_mut();
            let len = xs.len() as i64;
            let i = match at {
                Value::Int(i) if i < 0 => (i + len).max(0),
                Value::Int(i) => i.min(len),
                _ => return error("list.insert index must be an integer"),
            };
            xs.insert(i as usize, item);
            Ok(Value::None)
        }
        "copy" => Ok(Value::new_list(xs.borrow().clone())),
        "pop" => {
            let mut xs = xs.borrow_mut();
            let i = match args.next() {
                Some(index) => position(&index, xs.len())?,
                None if xs.is_empty() => return error("pop from empty list"),
                None => xs.len() - 1,
            };
            Ok(xs.remove(i))
        }
        "remove" => {
            let item = args.next().unwrap_or(Value::None);
            let mut xs = xs.borrow_mut();
            match xs.iter().position(|x| x.py_eq(&item)) {
                Some(i) => {
                    xs.remove(i);
                    Ok(Value::None)
                }
                None => error("list.remove(x): x not in list"),
            }
        }
        "index" => {
            let item = args.next().unwrap_or(Value::None);
            match xs.borrow().iter().position(|x| x.py_eq(&item)) {
                Some(i) => Ok(Value::Int(i as i64)),
                None => error("value is not in list"),
            }
        }
        "count" => {
            let item = args.next().unwrap_or(Value::None);
            Ok(Value::Int(xs.borrow().iter().filter(|x| x.py_eq(&item)).count() as i64))
        }
        _ => Ok(Value::Opaque),
    }
}

fn str_method(s: &str, name: &str, args: Vec<Value>) -> Exec<Value> {
    let arg_str = |i: usize| match args.get(i) {
        Some(Value::Str(a)) => Some(a.to_string()),
        _ => None,
    };
    Ok(match name {
        "lower" => Value::str(&s.to_lowercase()),
        "upper" => Value::str(&s.to_uppercase()),
        "strip" => Value::str(s.trim()),
        "lstrip" => Value::str(s.trim_start()),
        "rstrip" => Value::str(s.trim_end()),
        "split" => {
            let parts: Vec<Value> = match arg_str(0) {
                Some(sep) if !sep.is_empty() => s.split(sep.as_str()).map(Value::str).collect(),
                _ => s.split_whitespace().map(Value::str).collect(),
            };
            Value::new_list(parts)
        }
        "join" => {
            let items = iterate(args.first().unwrap_or(&Value::None))?;
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Str(p) => parts.push(p.to_string()),
                    Value::Opaque => return Ok(Value::Opaque),
                    other => return error(format!("join expects str items, found {}", other.type_name())),
                }
            }
            Value::str(&parts.join(s))
        }
        "replace" => match (arg_str(0), arg_str(1)) {
            (Some(from), Some(to)) => Value::str(&s.replace(&from, &to)),
            _ => Value::Opaque,
        },
        "startswith" => arg_str(0).map_or(Value::Opaque, |p| Value::Bool(s.starts_with(&p))),
        "endswith" => arg_str(0).map_or(Value::Opaque, |p| Value::Bool(s.ends_with(&p))),
        _ => Value::Opaque, // format and friends: text only, no spec meaning
    })
}

fn augmented(current: Value, op: BinOp, rhs: Value) -> Exec<Value> {
    match (&current, op) {
        (Value::List(xs), BinOp::Add) => {
            let items = iterate(&rhs)?;
            xs.borrow_mut().extend(items);
            Ok(current)
        }
        (Value::Dict(d), BinOp::BitOr) => {
            let mut incoming = Dict::new();
            extend_dict(&mut incoming, &rhs)?;
            d.borrow_mut().extend(incoming);
            Ok(current)
        }
        _ => binary(current, op, rhs),
    }
}

fn as_int(v: &Value) -> Option<i64> {
    match v {
        Value::Int(i) => Some(*i),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn as_float(v: &Value) -> Option<f64> {
    match v {
        Value::Float(f) => Some(*f),
        other => as_int(other).map(|i| i as f64),
    }
}

fn repeat(items: &[Value], n: i64) -> Exec<Vec<Value>> {
    let n = n.max(0) as usize;
    if items.len().saturating_mul(n) > MAX_SEQUENCE {
        return error("sequence too large");
    }
    Ok(items.iter().cloned().cycle().take(items.len() * n).collect())
}

fn binary(left: Value, op: BinOp, right: Value) -> Exec<Value> {
    use Value as V;
    if matches!(left, V::Opaque) || matches!(right, V::Opaque) {
        return Ok(V::Opaque);
    }
    if let (Some(a), Some(b)) = (as_int(&left), as_int(&right)) {
        return int_op(op, a, b);
    }
    if let (Some(a), Some(b)) = (as_float(&left), as_float(&right)) {
        return float_op(op, a, b);
    }
    match (op, &left, &right) {
        (BinOp::Add, V::Str(a), V::Str(b)) => Ok(V::str(&format!("{a}{b}"))),
        (BinOp::Add, V::List(a), V::List(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            Ok(V::new_list(items))
        }
        (BinOp::Add, V::Tuple(a), V::Tuple(b)) => {
            Ok(V::Tuple(Rc::new(a.iter().chain(b.iter()).cloned().collect())))
        }
        (BinOp::Mul, V::Str(s), n) | (BinOp::Mul, n, V::Str(s)) if as_int(n).is_some() => {
            let n = as_int(n).unwrap_or(0).max(0) as usize;
            if s.len().saturating_mul(n) > MAX_SEQUENCE {
                return error("string too large");
            }
            Ok(V::str(&s.repeat(n)))
        }
        (BinOp::Mul, V::List(xs), n) | (BinOp::Mul, n, V::List(xs)) if as_int(n).is_some() => {
            let items = xs.borrow().clone();
            Ok(V::new_list(repeat(&items, as_int(n).unwrap_or(0))?))
        }
        (BinOp::BitOr, V::Dict(a), V::Dict(b)) => {
            let mut merged = a.borrow().clone();
            let incoming: Vec<(Key, Value)> = b.borrow().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            merged.extend(incoming);
            Ok(V::new_dict(merged))
        }
        (BinOp::BitOr, V::Set(a), V::Set(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            Ok(V::Set(shared(dedup(items))))
        }
        (BinOp::Mod, V::Str(_), _) => Ok(V::Opaque), // printf-style formatting
        _ => error(format!(
            "unsupported operand types for {op:?}: '{}' and '{}'",
            left.type_name(),
            right.type_name()
        )),
    }
}

fn int_op(op: BinOp, a: i64, b: i64) -> Exec<Value> {
    let checked = match op {
        BinOp::Add => a.checked_add(b),
        BinOp::Sub => a.checked_sub(b),
        BinOp::Mul => a.checked_mul(b),
        BinOp::Div => return float_op(op, a as f64, b as f64),
        BinOp::FloorDiv | BinOp::Mod if b == 0 => return error("integer division or modulo by zero"),
        BinOp::FloorDiv => a
            .checked_div(b)
            .zip(a.checked_rem(b))
            .map(|(q, r)| if r != 0 && ((r < 0) != (b < 0)) { q - 1 } else { q }),
        BinOp::Mod => a
            .checked_rem(b)
            .map(|r| if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r }),
        BinOp::Pow if b < 0 => return float_op(op, a as f64, b as f64),
        BinOp::Pow => u32::try_from(b).ok().and_then(|e| a.checked_pow(e)),
        BinOp::BitOr => Some(a | b),
        BinOp::BitXor => Some(a ^ b),
        BinOp::BitAnd => Some(a & b),
        BinOp::LShift => u32::try_from(b).ok().and_then(|s| a.checked_shl(s)),
        BinOp::RShift => u32::try_from(b).ok().map(|s| a >> s.min(63)),
        BinOp::MatMul => None,
    };
    match checked {
        Some(v) => Ok(Value::Int(v)),
        None if op == BinOp::MatMul => error("unsupported operand for @"),
        None => float_op(op, a as f64, b as f64),
    }
}

fn float_op(op: BinOp, a: f64, b: f64) -> Exec<Value> {
    let zero_divisor = b == 0.0 && matches!(op, BinOp::Div | BinOp::FloorDiv | BinOp::Mod);
    if zero_divisor {
        return error("float division by zero");
    }
    Ok(Value::Float(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        BinOp::FloorDiv => (a / b).floor(),
        BinOp::Mod => a - b * (a / b).floor(),
        BinOp::Pow => a.powf(b),
        _ => return error(format!("unsupported operand for {op:?} on float")),
    }))
}

fn unary(op: UnaryOp, operand: Value) -> Exec<Value> {
    Ok(match (op, &operand) {
        (_, Value::Opaque) => Value::Opaque,
        (UnaryOp::Not, v) => match v.truthy() {
            Some(b) => Value::Bool(!b),
            None => Value::Opaque,
        },
        (UnaryOp::Neg, Value::Float(f)) => Value::Float(-f),
        (UnaryOp::Neg, v) if as_int(v).is_some() => Value::Int(as_int(v).unwrap_or(0).wrapping_neg()),
        (UnaryOp::Pos, v) if as_float(v).is_some() => operand.clone(),
        (UnaryOp::Invert, v) if as_int(v).is_some() => Value::Int(!as_int(v).unwrap_or(0)),
        _ => return error(format!("bad operand type for unary {op:?}: '{}'", operand.type_name())),
    })
}

fn ordering(a: &Value, b: &Value) -> Option<Ordering> {
    ordering_within(a, b, MAX_NESTING)
}

fn ordering_within(a: &Value, b: &Value, depth: usize) -> Option<Ordering> {
    let depth = depth.checked_sub(1)?;
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::List(_) | Value::Tuple(_), Value::List(_) | Value::Tuple(_)) => {
            let (xs, ys) = (a.iter_items()?, b.iter_items()?);
            for (x, y) in xs.iter().zip(ys.iter()) {
                match ordering_within(x, y, depth)? {
                    Ordering::Equal => {}
                    other => return Some(other),
                }
            }
            Some(xs.len().cmp(&ys.len()))
        }
        _ => match (as_int(a), as_int(b)) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => as_float(a)?.partial_cmp(&as_float(b)?),
        },
    }
}

fn contains(container: &Value, item: &Value) -> Exec<bool> {
    match container {
        Value::Dict(d) => Ok(Key::from_value(item).is_some_and(|k| d.borrow().contains_key(&k))),
        Value::Str(s) => match item {
            Value::Str(sub) => Ok(s.contains(&**sub)),
            other => error(format!("'in <string>' requires string, not {}", other.type_name())),
        },
        other => Ok(iterate(other)?.iter().any(|x| x.py_eq(item))),
    }
}

fn identical(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::List(x), Value::List(y)) | (Value::Set(x), Value::Set(y)) => Rc::ptr_eq(x, y),
        (Value::Dict(x), Value::Dict(y)) => Rc::ptr_eq(x, y),
        (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        _ => a.py_eq(b),
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Exec<Option<bool>> {
    if matches!(left, Value::Opaque) || matches!(right, Value::Opaque) {
        return Ok(None);
    }
    let result = match op {
        CmpOp::Eq => left.py_eq(right),
        CmpOp::NotEq => !left.py_eq(right),
        CmpOp::Is => identical(left, right),
        CmpOp::IsNot => !identical(left, right),
        CmpOp::In => contains(right, left)?,
        CmpOp::NotIn => !contains(right, left)?,
        CmpOp::Lt | CmpOp::LtE | CmpOp::Gt | CmpOp::GtE => {
            let Some(ord) = ordering(left, right) else {
                return error(format!(
                    "'<' not supported between '{}' and '{}'",
                    left.type_name(),
                    right.type_name()
                ));
            };
            match op {
                CmpOp::Lt => ord == Ordering::Less,
                CmpOp::LtE => ord != Ordering::Greater,
                CmpOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }
        }
    };
    Ok(Some(result))
}

fn range(args: &[Value]) -> Exec<Value> {
    let ints: Option<Vec<i64>> = args.iter().map(as_int).collect();
    let (start, stop, step) = match ints.as_deref() {
        Some([stop]) => (0, *stop, 1),
        Some([start, stop]) => (*start, *stop, 1),
        Some([start, stop, step]) if *step != 0 => (*start, *stop, *step),
        _ if args.iter().any(|a| matches!(a, Value::Opaque)) => return Ok(Value::Opaque),
        _ => return error("range() arguments must be integers"),
    };
    let mut items = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        if items.len() >= MAX_SEQUENCE {
            return error("range too large");
        }
        items.push(Value::Int(i));
        i += step;
    }
    Ok(Value::new_list(items))
}

fn is_instance(args: &[Value]) -> Exec<Value> {
    let [value, types] = args else {
        return error("isinstance expected 2 arguments");
    };
    fn matches_type(value: &Value, ty: &Value) -> Option<bool> {
        match ty {
            Value::Class(class) => Some(match value {
                Value::Instance(inst) => inst.class.is_subclass_of(class),
                _ => false,
            }),
            Value::Builtin(b) => b.type_object_name().map(|name| {
                value.type_name() == name || (name == "int" && matches!(value, Value::Bool(_)))
            }),
            Value::Tuple(options) => {
                let mut any = Some(false);
                for option in options.iter() {
                    match matches_type(value, option) {
                        Some(true) => return Some(true),
                        None => any = None,
                        Some(false) => {}
                    }
                }
                any
            }
            _ => None,
        }
    }
    if matches!(value, Value::Opaque) {
        return Ok(Value::Opaque);
    }
    Ok(matches_type(value, types).map_or(Value::Opaque, Value::Bool))
}

fn to_int(value: Option<&Value>) -> Exec<Value> {
    Ok(match value {
        None => Value::Int(0),
        Some(Value::Float(f)) => Value::Int(f.trunc() as i64),
        Some(Value::Str(s)) => match s.trim().parse::<i64>() {
            Ok(i) => Value::Int(i),
            Err(_) => return error(format!("invalid literal for int(): '{s}'")),
        },
        Some(Value::Opaque) => Value::Opaque,
        Some(v) => match as_int(v) {
            Some(i) => Value::Int(i),
            None => return error(format!("int() argument must be a number, not '{}'", v.type_name())),
        },
    })
}

fn to_float(value: Option<&Value>) -> Exec<Value> {
    Ok(match value {
        None => Value::Float(0.0),
        Some(Value::Str(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "inf" | "+inf" | "infinity" => Value::Float(f64::INFINITY),
            "-inf" | "-infinity" => Value::Float(f64::NEG_INFINITY),
            "nan" => Value::Float(f64::NAN),
            text => match text.parse::<f64>() {
                Ok(f) => Value::Float(f),
                Err(_) => return error(format!("could not convert string to float: '{s}'")),
            },
        },
        Some(Value::Opaque) => Value::Opaque,
        Some(v) => match as_float(v) {
            Some(f) => Value::Float(f),
            None => return error(format!("float() argument must be a number, not '{}'", v.type_name())),
        },
    })
}

fn py_float(f: f64) -> String {
    if f.is_infinite() {
        return if f > 0.0 { "inf".into() } else { "-inf".into() };
    }
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        f.to_string()
    }
}

/// `str(value)`.
fn py_str(value: &Value) -> String {
    match value {
        Value::Str(s) => s.to_string(),
        other => py_repr(other),
    }
}

fn py_repr(value: &Value) -> String {
    repr_within(value, MAX_NESTING)
}

fn repr_within(value: &Value, depth: usize) -> String {
    let Some(depth) = depth.checked_sub(1) else { return "...".into() };
    let join = |items: &[Value]| items.iter().map(|x| repr_within(x, depth)).collect::<Vec<_>>().join(", ");
    match value {
        Value::None => "None".into(),
        Value::Bool(true) => "True".into(),
        Value::Bool(false) => "False".into(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => py_float(*f),
        Value::Str(s) => format!("'{s}'"),
        Value::List(xs) => format!("[{}]", join(&xs.borrow())),
        Value::Tuple(xs) if xs.len() == 1 => format!("({},)", join(xs)),
        Value::Tuple(xs) => format!("({})", join(xs)),
        Value::Set(xs) => format!("{{{}}}", join(&xs.borrow())),
        Value::Dict(d) => format!(
            "{{{}}}",
            d.borrow()
                .iter()
                .map(|(k, v)| format!("{}: {}", repr_within(&k.to_value(), depth), repr_within(v, depth)))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        Value::Class(c) => format!("<class '{}'>", c.name),
        other => format!("<{}>", other.type_name()),
    }
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pysrc;

    fn run(src: &str) -> (Interpreter<'static>, Exec<()>) {
        static ENV: once_cell::sync::Lazy<SubstitutionEnv> = once_cell::sync::Lazy::new(SubstitutionEnv::default);
        let module = pysrc::load(src).unwrap();
        let mut interp = Interpreter::new(&ENV);
        let result = interp.run_module(&module);
        (interp, result)
    }

    fn global(interp: &Interpreter<'_>, name: &str) -> SpecValue {
        interp.globals.borrow()[name].to_spec().unwrap()
    }

    #[test]
    fn dict_aliasing_and_update() {
        let (interp, result) = run("\
base = dict(a=1)
alias = base
alias.update({'b': 2}, c=3)
alias['d'] = [1, 2] + [3]
copied = dict(base)
copied.pop('a')
");
        assert!(result.is_ok());
        let base = global(&interp, "base");
        let keys: Vec<&String> = base.as_map().unwrap().keys().collect();
        assert_eq!(keys, ["a", "b", "c", "d"]);
        assert_eq!(global(&interp, "copied").as_map().unwrap().len(), 3);
    }

    #[test]
    fn helper_functions_with_keywords_and_kwargs() {
        let (interp, _) = run("\
def opt(kind='str', **extra):
    d = dict(type=kind)
    d.update(extra)
    return d

spec = {'name': opt(required=True), 'count': opt('int', default=0)}
");
        let spec = global(&interp, "spec");
        let name = spec.as_map().unwrap()["name"].as_map().unwrap().clone();
        assert_eq!(name["type"], SpecValue::Str("str".into()));
        assert_eq!(name["required"], SpecValue::Bool(true));
        let count = spec.as_map().unwrap()["count"].as_map().unwrap().clone();
        assert_eq!(count["default"], SpecValue::Int(0));
    }

    #[test]
    fn closures_loops_and_conditionals() {
        let (interp, _) = run("\
def build(names):
    out = {}
    def add(n):
        out[n] = dict(type='str')
    for n in names:
        if n.startswith('_'):
            continue
        add(n)
    return out

spec = build(['a', '_hidden', 'b'])
size = len(spec) if spec else -1
");
        assert_eq!(global(&interp, "size"), SpecValue::Int(2));
    }

    #[test]
    fn try_except_binds_message_and_runs_finally() {
        let (interp, _) = run("\
done = []
try:
    x = {}['missing']
except KeyError as e:
    msg = e
finally:
    done.append(1)
");
        assert_eq!(global(&interp, "msg"), SpecValue::Str("KeyError: missing".into()));
        assert_eq!(global(&interp, "done"), SpecValue::List(vec![SpecValue::Int(1)]));
    }

    #[test]
    fn opaque_values_absorb_calls_and_attributes() {
        let (interp, result) = run("\
import boto3
client = boto3.client('ec2').describe_instances()['Reservations']
ok = client is not None
");
        assert!(result.is_ok());
        assert_eq!(global(&interp, "ok"), SpecValue::Null);
    }

    #[test]
    fn step_limit_turns_runaway_code_into_an_error() {
        let module = pysrc::load("def f(n):\n    return f(n + 1)\n").unwrap();
        let mut env = SubstitutionEnv::default();
        env.max_call_depth = 8;
        let mut interp = Interpreter::new(&env);
        let _ = interp.run_module(&module);
        let module = pysrc::load("def main():\n    f(0)\n").unwrap();
        let _ = interp.run_module(&module);
        assert!(matches!(interp.call_entry("main"), Some(Err(Flow::Error(_)))));
    }
}
