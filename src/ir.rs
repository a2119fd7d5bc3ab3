// Strongly-typed spec IR. Produced by `extract` / `playbook`, consumed read-only by `lower`.

use indexmap::IndexMap;
use ordered_float::OrderedFloat;
use serde_json::Value;

/// A literal carried through from a spec (`default`, `choices`, `required_if` values).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(OrderedFloat<f64>),
    Str(String),
    List(Vec<SpecValue>),
    Map(IndexMap<String, SpecValue>),
}

/// Primitive parameter kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    String,
    Integer,
    Float,
    Boolean,
    Path,
    Raw,
}

/// Kind of a parameter (or of a list element).
#[derive(Debug, Clone, PartialEq)]
pub enum ArgKind {
    Primitive(Primitive),
    Dict,                   // free-form mapping, no declared sub-options
    List(Box<ArgKind>),     // element kind
    NestedMapping(Suboptions), // never empty
}

pub type Suboptions = IndexMap<String, ArgumentSpecNode>;

#[derive(Debug, Clone, PartialEq)]
pub struct ArgumentSpecNode {
    pub name: String,
    pub kind: ArgKind,
    pub required: bool,
    pub default: Option<SpecValue>,
    pub choices: Option<Vec<SpecValue>>,
    pub aliases: Vec<String>,
    pub no_log: bool,
}

/// Root mapping of parameter name → node, plus the cross-parameter constraints
/// captured next to it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedSpecification {
    pub params: IndexMap<String, ArgumentSpecNode>,
    pub constraints: SpecConstraints,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpecConstraints {
    pub mutually_exclusive: Vec<Vec<String>>,
    pub required_together: Vec<Vec<String>>,
    pub required_one_of: Vec<Vec<String>>,
    pub required_if: Vec<RequiredIf>,
    pub required_by: IndexMap<String, Vec<String>>,
}

/// `[key, value, [requirements...], any?]`
#[derive(Debug, Clone, PartialEq)]
pub struct RequiredIf {
    pub key: String,
    pub value: SpecValue,
    pub requirements: Vec<String>,
    pub any: bool,
}

/// How an operation input obtains its value at orchestration time.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Literal(String),
    Property(String),
    Concat(Vec<Binding>),
}

/// Extra TOSCA wiring produced by the playbook path: inputs computed from other
/// properties, and runtime results exposed as attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Wiring {
    pub derived_inputs: IndexMap<String, Binding>,
    pub attributes: Vec<String>,
}

// ————————————————————————————————————————————————————————————————————————————
// IMPLEMENTATION
// ————————————————————————————————————————————————————————————————————————————

impl SpecValue {
    pub fn to_json(&self) -> Value {
        match self {
            SpecValue::Null => Value::Null,
            SpecValue::Bool(b) => Value::Bool(*b),
            SpecValue::Int(i) => Value::from(*i),
            SpecValue::Float(f) => serde_json::Number::from_f64(f.0)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(f.0.to_string())),
            SpecValue::Str(s) => Value::String(s.clone()),
            SpecValue::List(xs) => Value::Array(xs.iter().map(SpecValue::to_json).collect()),
            SpecValue::Map(m) => Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    pub fn from_json(v: &Value) -> Self {
        match v {
            Value::Null => SpecValue::Null,
            Value::Bool(b) => SpecValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SpecValue::Int(i),
                None => SpecValue::Float(OrderedFloat(n.as_f64().unwrap_or(f64::NAN))),
            },
            Value::String(s) => SpecValue::Str(s.clone()),
            Value::Array(xs) => SpecValue::List(xs.iter().map(SpecValue::from_json).collect()),
            Value::Object(m) => SpecValue::Map(
                m.iter().map(|(k, v)| (k.clone(), SpecValue::from_json(v))).collect(),
            ),
        }
    }

    pub fn from_yaml(v: &serde_yaml::Value) -> Self {
        use serde_yaml::Value as Y;
        match v {
            Y::Null => SpecValue::Null,
            Y::Bool(b) => SpecValue::Bool(*b),
            Y::Number(n) => match n.as_i64() {
                Some(i) => SpecValue::Int(i),
                None => SpecValue::Float(OrderedFloat(n.as_f64().unwrap_or(f64::NAN))),
            },
            Y::String(s) => SpecValue::Str(s.clone()),
            Y::Sequence(xs) => SpecValue::List(xs.iter().map(SpecValue::from_yaml).collect()),
            Y::Mapping(m) => SpecValue::Map(
                m.iter().map(|(k, v)| (yaml_key(k), SpecValue::from_yaml(v))).collect(),
            ),
            Y::Tagged(t) => SpecValue::from_yaml(&t.value),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SpecValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, SpecValue>> {
        match self {
            SpecValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Python-ish truthiness, used for flags like `required` and `no_log`.
    pub fn truthy(&self) -> bool {
        match self {
            SpecValue::Null => false,
            SpecValue::Bool(b) => *b,
            SpecValue::Int(i) => *i != 0,
            SpecValue::Float(f) => f.0 != 0.0,
            SpecValue::Str(s) => !s.is_empty(),
            SpecValue::List(xs) => !xs.is_empty(),
            SpecValue::Map(m) => !m.is_empty(),
        }
    }
}

fn yaml_key(k: &serde_yaml::Value) -> String {
    match k {
        serde_yaml::Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

impl ArgumentSpecNode {
    /// A bare optional parameter of the given kind.
    pub fn new(name: impl Into<String>, kind: ArgKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default: None,
            choices: None,
            aliases: Vec::new(),
            no_log: false,
        }
    }
}

impl MergedSpecification {
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Fold in ancestry-level parameters. Names already defined here (the
    /// module-level definitions) win; inherited ones are appended after them.
    pub fn merge_base(&mut self, base: IndexMap<String, ArgumentSpecNode>) {
        for (name, node) in base {
            self.params.entry(name).or_insert(node);
        }
    }
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_base_prefers_module_definitions() {
        let mut spec = MergedSpecification::default();
        let mut region = ArgumentSpecNode::new("region", ArgKind::Primitive(Primitive::String));
        region.required = true;
        spec.params.insert("region".into(), region);

        let mut base = IndexMap::new();
        base.insert(
            "region".to_string(),
            ArgumentSpecNode::new("region", ArgKind::Primitive(Primitive::Integer)),
        );
        base.insert(
            "profile".to_string(),
            ArgumentSpecNode::new("profile", ArgKind::Primitive(Primitive::String)),
        );
        spec.merge_base(base);

        assert_eq!(spec.len(), 2);
        let keys: Vec<&str> = spec.params.keys().map(String::as_str).collect();
        assert_eq!(keys, ["region", "profile"]);
        assert!(spec.params["region"].required);
        assert_eq!(spec.params["region"].kind, ArgKind::Primitive(Primitive::String));
    }

    #[test]
    fn non_finite_floats_render_as_strings() {
        let v = SpecValue::Float(OrderedFloat(f64::INFINITY));
        assert_eq!(v.to_json(), Value::String("inf".into()));
    }

    #[test]
    fn yaml_mapping_keeps_key_order() {
        let y: serde_yaml::Value = serde_yaml::from_str("b: 1\na: [x, 2.5]\n").unwrap();
        let v = SpecValue::from_yaml(&y);
        let m = v.as_map().unwrap();
        assert_eq!(m.keys().collect::<Vec<_>>(), ["b", "a"]);
        assert_eq!(
            m["a"],
            SpecValue::List(vec![SpecValue::Str("x".into()), SpecValue::Float(OrderedFloat(2.5))])
        );
    }
}
