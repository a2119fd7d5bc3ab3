//! Runtime values of the sandbox interpreter.
//!
//! Mutable containers are shared (`Rc<RefCell<_>>`) so aliasing behaves the
//! way module code expects: `spec = base; spec.update(extra)` mutates `base`.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use ordered_float::OrderedFloat;

use crate::ir::SpecValue;
use crate::pysrc::ast::FunctionDef;

pub(crate) type Shared<T> = Rc<RefCell<T>>;
pub(crate) type Scope = Shared<IndexMap<String, Value>>;
pub(crate) type Dict = IndexMap<Key, Value>;

pub(crate) fn shared<T>(value: T) -> Shared<T> {
    Rc::new(RefCell::new(value))
}

/// Containers may hold themselves; recursive walks stop at this depth.
pub(crate) const MAX_NESTING: usize = 100;

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("container nesting exceeds {MAX_NESTING} levels")]
pub(crate) struct TooDeep;

#[derive(Clone)]
pub(crate) enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Shared<Vec<Value>>),
    Tuple(Rc<Vec<Value>>),
    Set(Shared<Vec<Value>>),
    Dict(Shared<Dict>),
    Function(Rc<Function>),
    Builtin(Builtin),
    Class(Rc<Class>),
    Instance(Rc<Instance>),
    Bound(Rc<Bound>),
    Module(Rc<Namespace>),
    Super(Rc<Instance>, Rc<Class>), // instance, class whose bases are searched
    Opaque,                        // stands for anything outside the subset
}

/// Hashable projection of a value, used as dict key and set member.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Key {
    None,
    Bool(bool),
    Int(i64),
    Float(OrderedFloat<f64>),
    Str(Rc<str>),
    Tuple(Vec<Key>),
}

pub(crate) struct Function {
    pub def: Rc<FunctionDef>,
    pub defaults: Vec<Option<Value>>, // parallel to def.params
    pub closure: Vec<Scope>,          // enclosing function scopes, innermost first
    pub owner: RefCell<Option<Weak<Class>>>, // class whose body defined it, for `super()`
}

pub(crate) struct Class {
    pub name: String,
    pub bases: Vec<Rc<Class>>,
    pub attrs: RefCell<IndexMap<String, Value>>,
    pub stand_in: Option<String>, // registered stand-in this class *is*
}

pub(crate) struct Instance {
    pub class: Rc<Class>,
    pub attrs: RefCell<IndexMap<String, Value>>,
}

pub(crate) struct Bound {
    pub receiver: Value,
    pub target: Method,
}

pub(crate) enum Method {
    Function(Rc<Function>),
    Builtin(Builtin),
    Native(&'static str), // dict/list/str method by name
}

/// A module object reachable through `import x.y`.
pub(crate) struct Namespace {
    pub name: String,
    pub attrs: RefCell<IndexMap<String, Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Builtin {
    Dict,
    List,
    Tuple,
    Set,
    Str,
    Int,
    Float,
    Bool,
    Len,
    Sorted,
    Range,
    Super,
    Print,
    IsInstance,
    Copy,
    DeepCopy,
    StandInInit,
    ExitJson,
    FailJson,
    Helper(usize), // index into the environment's spec helpers
}

// ————————————————————————————————————————————————————————————————————————————
// IMPLEMENTATION
// ————————————————————————————————————————————————————————————————————————————

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }

    pub fn new_dict(d: Dict) -> Self {
        Value::Dict(shared(d))
    }

    pub fn new_list(xs: Vec<Value>) -> Self {
        Value::List(shared(xs))
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
            Value::Set(_) => "set",
            Value::Dict(_) => "dict",
            Value::Function(_) | Value::Bound(_) => "function",
            Value::Builtin(_) => "builtin_function_or_method",
            Value::Class(_) => "type",
            Value::Instance(_) => "object",
            Value::Module(_) => "module",
            Value::Super(..) => "super",
            Value::Opaque => "opaque",
        }
    }

    pub fn truthy(&self) -> Option<bool> {
        Some(match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(xs) | Value::Set(xs) => !xs.borrow().is_empty(),
            Value::Tuple(xs) => !xs.is_empty(),
            Value::Dict(d) => !d.borrow().is_empty(),
            Value::Opaque => return None,
            _ => true,
        })
    }

    /// Snapshot of the items of any finite iterable.
    pub fn iter_items(&self) -> Option<Vec<Value>> {
        Some(match self {
            Value::List(xs) | Value::Set(xs) => xs.borrow().clone(),
            Value::Tuple(xs) => (**xs).clone(),
            Value::Dict(d) => d.borrow().keys().map(Key::to_value).collect(),
            Value::Str(s) => s.chars().map(|c| Value::str(&c.to_string())).collect(),
            _ => return None,
        })
    }

    /// Structural equality, as `==`. Containers nested past [`MAX_NESTING`]
    /// compare unequal unless identical.
    pub fn py_eq(&self, other: &Value) -> bool {
        self.eq_within(other, MAX_NESTING)
    }

    fn eq_within(&self, other: &Value, depth: usize) -> bool {
        let Some(depth) = depth.checked_sub(1) else { return false };
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
            (Value::Bool(a), Value::Int(b)) | (Value::Int(b), Value::Bool(a)) => i64::from(*a) == *b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) | (Value::Set(a), Value::Set(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.eq_within(y, depth))
            }
            (Value::Tuple(a), Value::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.eq_within(y, depth))
            }
            (Value::Dict(a), Value::Dict(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| v.eq_within(w, depth)))
            }
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            _ => false,
        }
    }

    /// Independent copy of all nested containers.
    pub fn deep_copy(&self) -> Result<Value, TooDeep> {
        self.copy_within(MAX_NESTING)
    }

    fn copy_within(&self, depth: usize) -> Result<Value, TooDeep> {
        let depth = depth.checked_sub(1).ok_or(TooDeep)?;
        Ok(match self {
            Value::List(xs) => {
                Value::new_list(xs.borrow().iter().map(|x| x.copy_within(depth)).collect::<Result<_, _>>()?)
            }
            Value::Set(xs) => {
                Value::Set(shared(xs.borrow().iter().map(|x| x.copy_within(depth)).collect::<Result<_, _>>()?))
            }
            Value::Tuple(xs) => {
                Value::Tuple(Rc::new(xs.iter().map(|x| x.copy_within(depth)).collect::<Result<_, _>>()?))
            }
            Value::Dict(d) => Value::new_dict(
                d.borrow()
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), v.copy_within(depth)?)))
                    .collect::<Result<_, _>>()?,
            ),
            other => other.clone(),
        })
    }

    /// One level copy, as `dict.copy()` / `list.copy()`.
    pub fn shallow_copy(&self) -> Value {
        match self {
            Value::List(xs) => Value::new_list(xs.borrow().clone()),
            Value::Set(xs) => Value::Set(shared(xs.borrow().clone())),
            Value::Dict(d) => Value::new_dict(d.borrow().clone()),
            other => other.clone(),
        }
    }

    /// Project into plain data. Type objects become their names so that
    /// `type=int` reads the same as `type='int'`; callables and opaque values
    /// have no data meaning and become null.
    pub fn to_spec(&self) -> Result<SpecValue, TooDeep> {
        self.spec_within(MAX_NESTING)
    }

    fn spec_within(&self, depth: usize) -> Result<SpecValue, TooDeep> {
        let depth = depth.checked_sub(1).ok_or(TooDeep)?;
        Ok(match self {
            Value::None => SpecValue::Null,
            Value::Bool(b) => SpecValue::Bool(*b),
            Value::Int(i) => SpecValue::Int(*i),
            Value::Float(f) => SpecValue::Float(OrderedFloat(*f)),
            Value::Str(s) => SpecValue::Str(s.to_string()),
            Value::List(xs) | Value::Set(xs) => SpecValue::List(
                xs.borrow().iter().map(|x| x.spec_within(depth)).collect::<Result<_, _>>()?,
            ),
            Value::Tuple(xs) => {
                SpecValue::List(xs.iter().map(|x| x.spec_within(depth)).collect::<Result<_, _>>()?)
            }
            Value::Dict(d) => SpecValue::Map(
                d.borrow()
                    .iter()
                    .map(|(k, v)| Ok((k.to_label(), v.spec_within(depth)?)))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Builtin(b) => match b.type_object_name() {
                Some(name) => SpecValue::Str(name.to_string()),
                None => SpecValue::Null,
            },
            Value::Class(c) => SpecValue::Str(c.name.clone()),
            _ => SpecValue::Null,
        })
    }

    pub fn from_spec(v: &SpecValue) -> Value {
        match v {
            SpecValue::Null => Value::None,
            SpecValue::Bool(b) => Value::Bool(*b),
            SpecValue::Int(i) => Value::Int(*i),
            SpecValue::Float(f) => Value::Float(f.0),
            SpecValue::Str(s) => Value::str(s),
            SpecValue::List(xs) => Value::new_list(xs.iter().map(Value::from_spec).collect()),
            SpecValue::Map(m) => Value::new_dict(
                m.iter().map(|(k, v)| (Key::Str(Rc::from(k.as_str())), Value::from_spec(v))).collect(),
            ),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Class(c) => write!(f, "<class {}>", c.name),
            other => write!(f, "<{}>", other.type_name()),
        }
    }
}

impl Key {
    pub fn from_value(v: &Value) -> Option<Key> {
        Some(match v {
            Value::None => Key::None,
            Value::Bool(b) => Key::Bool(*b),
            Value::Int(i) => Key::Int(*i),
            Value::Float(f) => Key::Float(OrderedFloat(*f)),
            Value::Str(s) => Key::Str(s.clone()),
            Value::Tuple(xs) => Key::Tuple(xs.iter().map(Key::from_value).collect::<Option<_>>()?),
            _ => return None,
        })
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::None => Value::None,
            Key::Bool(b) => Value::Bool(*b),
            Key::Int(i) => Value::Int(*i),
            Key::Float(f) => Value::Float(f.0),
            Key::Str(s) => Value::Str(s.clone()),
            Key::Tuple(xs) => Value::Tuple(Rc::new(xs.iter().map(Key::to_value).collect())),
        }
    }

    /// Mapping keys in plain data are strings.
    pub fn to_label(&self) -> String {
        match self {
            Key::None => "None".into(),
            Key::Bool(b) => if *b { "True".into() } else { "False".into() },
            Key::Int(i) => i.to_string(),
            Key::Float(f) => f.0.to_string(),
            Key::Str(s) => s.to_string(),
            Key::Tuple(xs) => format!(
                "({})",
                xs.iter().map(Key::to_label).collect::<Vec<_>>().join(", ")
            ),
        }
    }

    pub fn str(s: &str) -> Key {
        Key::Str(Rc::from(s))
    }
}

impl Builtin {
    pub fn from_name(name: &str) -> Option<Builtin> {
        Some(match name {
            "dict" => Builtin::Dict,
            "list" => Builtin::List,
            "tuple" => Builtin::Tuple,
            "set" | "frozenset" => Builtin::Set,
            "str" => Builtin::Str,
            "int" => Builtin::Int,
            "float" => Builtin::Float,
            "bool" => Builtin::Bool,
            "len" => Builtin::Len,
            "sorted" => Builtin::Sorted,
            "range" => Builtin::Range,
            "super" => Builtin::Super,
            "print" => Builtin::Print,
            "isinstance" => Builtin::IsInstance,
            _ => return None,
        })
    }

    /// Name of the type object this builtin also stands for, if any.
    pub fn type_object_name(self) -> Option<&'static str> {
        Some(match self {
            Builtin::Dict => "dict",
            Builtin::List => "list",
            Builtin::Tuple => "tuple",
            Builtin::Set => "set",
            Builtin::Str => "str",
            Builtin::Int => "int",
            Builtin::Float => "float",
            Builtin::Bool => "bool",
            _ => return None,
        })
    }
}

impl Class {
    /// Depth-first, left-to-right ancestry including `self`.
    pub fn ancestry(self: &Rc<Self>) -> Vec<Rc<Class>> {
        let mut out: Vec<Rc<Class>> = Vec::new();
        let mut stack = vec![self.clone()];
        while let Some(class) = stack.pop() {
            if out.iter().any(|c| Rc::ptr_eq(c, &class)) {
                continue;
            }
            stack.extend(class.bases.iter().rev().cloned());
            out.push(class);
        }
        out
    }

    pub fn lookup(self: &Rc<Self>, name: &str) -> Option<Value> {
        self.ancestry()
            .iter()
            .find_map(|c| c.attrs.borrow().get(name).cloned())
    }

    pub fn is_subclass_of(self: &Rc<Self>, other: &Rc<Class>) -> bool {
        self.ancestry().iter().any(|c| Rc::ptr_eq(c, other))
    }
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(pairs: &[(&str, Value)]) -> Value {
        Value::new_dict(pairs.iter().map(|(k, v)| (Key::str(k), v.clone())).collect())
    }

    #[test]
    fn deep_copy_detaches_nested_containers() {
        let inner = dict(&[("type", Value::str("str"))]);
        let outer = dict(&[("name", inner.clone())]);
        let copy = outer.deep_copy().unwrap();
        if let Value::Dict(d) = &inner {
            d.borrow_mut().insert(Key::str("required"), Value::Bool(true));
        }
        let Value::Dict(c) = &copy else { panic!() };
        let Value::Dict(name) = &c.borrow()[&Key::str("name")] else { panic!() };
        assert_eq!(name.borrow().len(), 1);
    }

    #[test]
    fn type_objects_project_to_their_names() {
        let v = dict(&[("type", Value::Builtin(Builtin::Int))]);
        assert_eq!(
            v.to_spec().unwrap(),
            SpecValue::Map([("type".to_string(), SpecValue::Str("int".into()))].into_iter().collect())
        );
    }

    #[test]
    fn self_referencing_containers_stop_at_the_nesting_bound() {
        let spec = dict(&[("a", dict(&[]))]);
        if let Value::Dict(d) = &spec {
            d.borrow_mut().insert(Key::str("self"), spec.clone());
        }
        assert!(spec.to_spec().is_err());
        assert!(spec.deep_copy().is_err());
        assert!(spec.py_eq(&spec));
        assert!(!spec.py_eq(&dict(&[("a", dict(&[]))])));

        let ring = Value::new_list(vec![]);
        if let Value::List(xs) = &ring {
            xs.borrow_mut().push(ring.clone());
        }
        let other = Value::new_list(vec![]);
        if let Value::List(xs) = &other {
            xs.borrow_mut().push(other.clone());
        }
        assert!(!ring.py_eq(&other));
    }

    #[test]
    fn ancestry_is_depth_first_without_duplicates() {
        let root = Rc::new(Class {
            name: "Root".into(),
            bases: vec![],
            attrs: RefCell::new(IndexMap::new()),
            stand_in: None,
        });
        let mid = Rc::new(Class {
            name: "Mid".into(),
            bases: vec![root.clone()],
            attrs: RefCell::new(IndexMap::new()),
            stand_in: None,
        });
        let leaf = Rc::new(Class {
            name: "Leaf".into(),
            bases: vec![mid.clone(), root.clone()],
            attrs: RefCell::new(IndexMap::new()),
            stand_in: None,
        });
        let names: Vec<String> = leaf.ancestry().iter().map(|c| c.name.clone()).collect();
        assert_eq!(names, ["Leaf", "Mid", "Root"]);
        assert!(leaf.is_subclass_of(&root));
        assert!(!root.is_subclass_of(&leaf));
    }
}
