//! Playbook Variable Inferencer.
//!
//! Reads a playbook (or task file) without an argument spec and infers one:
//! literal `vars`/`set_fact` bindings and `{{ x | default(v) }}` declarations
//! become parameters, templated bindings become derived operation inputs and
//! `register` targets become runtime attributes.
use std::path::Path;

use indexmap::{IndexMap, IndexSet};
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer};

use crate::error::{ConvertError, read_source};
use crate::inference::{self, U};
use crate::ir::{ArgumentSpecNode, Binding, MergedSpecification, SpecValue, Wiring};
use crate::path_de::from_yaml_str_with_path;

/// `{{ name | default(value) }}`
static DEFAULT_FILTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\|\s*default\s*\(\s*(.*?)\s*\)\s*\}\}")
        .expect("valid default-filter regex")
});

/// `{{ name }}`
static REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid reference regex"));

/// Variables that are never inputs.
const MAGIC_VARIABLES: &[&str] = &["item", "inventory_hostname", "ansible_facts", "hostvars", "groups", "omit"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybookInference {
    pub spec: MergedSpecification,
    pub wiring: Wiring,
}

// ————————————————————————————————————————————————————————————————————————————
// DOCUMENT SHAPE
// ————————————————————————————————————————————————————————————————————————————

/// A play or a task; both shapes share one entry type.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Entry {
    vars: Option<serde_yaml::Value>,
    #[serde(deserialize_with = "null_as_default")]
    vars_files: Vec<serde_yaml::Value>,
    #[serde(deserialize_with = "null_as_default")]
    pre_tasks: Vec<Entry>,
    #[serde(deserialize_with = "null_as_default")]
    roles: Vec<serde_yaml::Value>,
    #[serde(deserialize_with = "null_as_default")]
    tasks: Vec<Entry>,
    #[serde(deserialize_with = "null_as_default")]
    post_tasks: Vec<Entry>,
    #[serde(deserialize_with = "null_as_default")]
    handlers: Vec<Entry>,
    #[serde(deserialize_with = "null_as_default")]
    block: Vec<Entry>,
    #[serde(deserialize_with = "null_as_default")]
    rescue: Vec<Entry>,
    #[serde(deserialize_with = "null_as_default")]
    always: Vec<Entry>,
    register: Option<String>,
    set_fact: Option<serde_yaml::Value>,
    #[serde(flatten)]
    rest: IndexMap<String, serde_yaml::Value>,
}

/// An empty key (`tasks:`) reads as an empty collection.
fn null_as_default<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(de)?.unwrap_or_default())
}

// ————————————————————————————————————————————————————————————————————————————
// FRONT API
// ————————————————————————————————————————————————————————————————————————————

pub fn infer_from_path(path: &Path) -> Result<PlaybookInference, ConvertError> {
    let source = read_source(path)?;
    infer_from_str(&source).map_err(|message| ConvertError::PlaybookParse { path: path.to_path_buf(), message })
}

/// Infer from playbook YAML. The error is a path-qualified parse message.
pub fn infer_from_str(source: &str) -> Result<PlaybookInference, String> {
    let entries: Vec<Entry> = match serde_yaml::from_str::<serde_yaml::Value>(source) {
        Ok(serde_yaml::Value::Null) => Vec::new(),
        Ok(serde_yaml::Value::Sequence(_)) => from_yaml_str_with_path(source)?,
        Ok(_) => return Err("expected a list of plays or tasks at the document root".to_string()),
        Err(err) => return Err(err.to_string()),
    };
    let mut collector = Collector::default();
    for entry in &entries {
        collector.entry(entry);
    }
    Ok(collector.finish())
}

// ————————————————————————————————————————————————————————————————————————————
// COLLECTION
// ————————————————————————————————————————————————————————————————————————————

#[derive(Default)]
struct Variable {
    evidence: U,
    default: Option<SpecValue>,
    declared: bool, // bound somewhere, as opposed to only referenced
}

#[derive(Default)]
struct Collector {
    variables: IndexMap<String, Variable>,
    derived: IndexMap<String, Binding>,
    registered: IndexSet<String>,
}

impl Collector {
    fn entry(&mut self, entry: &Entry) {
        for (name, value) in bindings("vars", entry.vars.as_ref()) {
            self.bind(&name, &value);
        }
        for file in &entry.vars_files {
            warn!("vars_files entry not followed: {}", yaml_label(file));
        }
        if !entry.roles.is_empty() {
            debug!("playbook: {} role reference(s) not followed", entry.roles.len());
        }
        for (name, value) in bindings("set_fact", entry.set_fact.as_ref()) {
            if name != "cacheable" {
                self.bind(&name, &value);
            }
        }
        if let Some(name) = &entry.register {
            self.registered.insert(name.clone());
        }
        for value in entry.rest.values() {
            self.scan_task_args(value);
        }
        let nested = [&entry.pre_tasks, &entry.tasks, &entry.post_tasks, &entry.handlers, &entry.block, &entry.rescue, &entry.always];
        for task in nested.into_iter().flatten() {
            self.entry(task);
        }
    }

    /// A `vars`/`set_fact` binding.
    fn bind(&mut self, name: &str, value: &serde_yaml::Value) {
        let serde_yaml::Value::String(text) = value else {
            self.observe(name, SpecValue::from_yaml(value));
            return;
        };
        if let Some(caps) = DEFAULT_FILTER.captures(text) {
            if caps.get(0).is_some_and(|m| m.as_str() == text.trim()) {
                match parse_default(&caps[2]) {
                    Some(default) => self.observe(name, default),
                    None => self.declare(name),
                }
                return;
            }
        }
        match template_binding(text) {
            Some(binding) => {
                for var in referenced(&binding) {
                    self.reference(&var);
                }
                self.derived.insert(name.to_string(), binding);
            }
            None => {
                self.scan_task_args(value);
                self.observe(name, SpecValue::Str(text.clone()));
            }
        }
    }

    fn observe(&mut self, name: &str, value: SpecValue) {
        let var = self.variables.entry(name.to_string()).or_default();
        var.evidence = U::join(&var.evidence, &inference::observe(&value));
        var.declared = true;
        if value != SpecValue::Null {
            var.default = Some(value);
        }
    }

    fn declare(&mut self, name: &str) {
        self.variables.entry(name.to_string()).or_default().declared = true;
    }

    fn reference(&mut self, name: &str) {
        if !MAGIC_VARIABLES.contains(&name) {
            self.variables.entry(name.to_string()).or_default();
        }
    }

    /// `default(...)` filters anywhere in task arguments declare inputs;
    /// plain `{{ name }}` references make `name` an input.
    fn scan_task_args(&mut self, value: &serde_yaml::Value) {
        match value {
            serde_yaml::Value::String(text) => {
                for caps in DEFAULT_FILTER.captures_iter(text) {
                    match parse_default(&caps[2]) {
                        Some(default) => self.observe(&caps[1], default),
                        None => self.declare(&caps[1]),
                    }
                }
                for caps in REFERENCE.captures_iter(text) {
                    self.reference(&caps[1]);
                }
            }
            serde_yaml::Value::Sequence(xs) => xs.iter().for_each(|x| self.scan_task_args(x)),
            serde_yaml::Value::Mapping(m) => m.values().for_each(|x| self.scan_task_args(x)),
            serde_yaml::Value::Tagged(t) => self.scan_task_args(&t.value),
            _ => {}
        }
    }

    fn finish(self) -> PlaybookInference {
        let Collector { variables, derived, registered } = self;
        let mut params = IndexMap::new();
        for (name, var) in variables {
            if derived.contains_key(&name) && var.evidence.is_bottom() {
                continue;
            }
            if !var.declared && registered.contains(&name) {
                continue;
            }
            // required stays false: a playbook cannot say which inputs are mandatory
            let mut node = ArgumentSpecNode::new(name.clone(), inference::kind_of(&var.evidence));
            node.default = var.default;
            params.insert(name, node);
        }
        let derived_inputs = derived
            .iter()
            .map(|(name, binding)| (name.clone(), inline(binding, &derived, &mut vec![name.as_str()])))
            .collect();
        PlaybookInference {
            spec: MergedSpecification { params, ..Default::default() },
            wiring: Wiring { derived_inputs, attributes: registered.into_iter().collect() },
        }
    }
}

// ————————————————————————————————————————————————————————————————————————————
// INTERNAL HELPERS
// ————————————————————————————————————————————————————————————————————————————

/// Name/value pairs of a `vars` or `set_fact` field. Besides a mapping,
/// `set_fact` may be a `key=value ...` string; other shapes are skipped.
fn bindings(field: &str, value: Option<&serde_yaml::Value>) -> Vec<(String, serde_yaml::Value)> {
    match value {
        None | Some(serde_yaml::Value::Null) => Vec::new(),
        Some(serde_yaml::Value::Mapping(m)) => m
            .iter()
            .filter_map(|(k, v)| match k {
                serde_yaml::Value::String(name) => Some((name.clone(), v.clone())),
                other => {
                    warn!("{field}: non-string key {} skipped", yaml_label(other));
                    None
                }
            })
            .collect(),
        Some(serde_yaml::Value::String(text)) if field == "set_fact" => key_values(text)
            .into_iter()
            .map(|(k, v)| (k, serde_yaml::Value::String(v)))
            .collect(),
        Some(other) => {
            warn!("{field}: unsupported shape skipped: {}", yaml_label(other));
            Vec::new()
        }
    }
}

/// `a=1 b="two words"` → `[(a, 1), (b, two words)]`. Tokens without `=` are
/// ignored.
fn key_values(text: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = text.trim_start();
    while !rest.is_empty() {
        let token_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let Some(eq) = rest[..token_end].find('=') else {
            rest = rest[token_end..].trim_start();
            continue;
        };
        let key = rest[..eq].to_string();
        let after = &rest[eq + 1..];
        let quoted = after.chars().next().filter(|c| *c == '"' || *c == '\'');
        let (value, tail) = match quoted {
            Some(quote) => match after[1..].find(quote) {
                Some(close) => (after[1..close + 1].to_string(), &after[close + 2..]),
                None => (after[1..].to_string(), ""),
            },
            None => {
                let end = after.find(char::is_whitespace).unwrap_or(after.len());
                (after[..end].to_string(), &after[end..])
            }
        };
        out.push((key, value));
        rest = tail.trim_start();
    }
    out
}

/// `"/home/{{ user }}"` → `concat("/home/", get_property(user))`. `None` when
/// the string holds no plain variable reference.
fn template_binding(text: &str) -> Option<Binding> {
    let mut parts = Vec::new();
    let mut last = 0;
    for caps in REFERENCE.captures_iter(text) {
        let (Some(whole), Some(var)) = (caps.get(0), caps.get(1)) else { continue };
        if whole.start() > last {
            parts.push(Binding::Literal(text[last..whole.start()].to_string()));
        }
        parts.push(Binding::Property(var.as_str().to_string()));
        last = whole.end();
    }
    if parts.is_empty() {
        return None;
    }
    if last < text.len() {
        parts.push(Binding::Literal(text[last..].to_string()));
    }
    Some(match parts.len() {
        1 => parts.remove(0),
        _ => Binding::Concat(parts),
    })
}

fn referenced(binding: &Binding) -> Vec<String> {
    match binding {
        Binding::Literal(_) => Vec::new(),
        Binding::Property(name) => vec![name.clone()],
        Binding::Concat(parts) => parts.iter().flat_map(referenced).collect(),
    }
}

/// Replace references to other derived inputs by their own bindings, so every
/// `get_property` names a real property.
fn inline<'a>(binding: &'a Binding, derived: &'a IndexMap<String, Binding>, stack: &mut Vec<&'a str>) -> Binding {
    match binding {
        Binding::Property(name) => match derived.get_key_value(name) {
            Some((key, other)) if !stack.contains(&key.as_str()) => {
                stack.push(key);
                let out = inline(other, derived, stack);
                stack.pop();
                out
            }
            _ => binding.clone(),
        },
        Binding::Concat(parts) => {
            let mut flat = Vec::new();
            for part in parts {
                match inline(part, derived, stack) {
                    Binding::Concat(inner) => flat.extend(inner),
                    other => flat.push(other),
                }
            }
            Binding::Concat(flat)
        }
        Binding::Literal(_) => binding.clone(),
    }
}

/// The argument of a `default(...)` filter as a literal. `omit` and
/// non-literal expressions give `None`.
fn parse_default(raw: &str) -> Option<SpecValue> {
    let raw = raw.trim();
    for quote in ['\'', '"'] {
        if let Some(inner) = raw.strip_prefix(quote).and_then(|r| r.strip_suffix(quote)) {
            return Some(SpecValue::Str(inner.to_string()));
        }
    }
    match raw.to_ascii_lowercase().as_str() {
        "true" => return Some(SpecValue::Bool(true)),
        "false" => return Some(SpecValue::Bool(false)),
        "none" | "null" => return Some(SpecValue::Null),
        "omit" | "" => return None,
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Some(SpecValue::Int(i));
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Some(SpecValue::Float(f.into()));
    }
    if (raw.starts_with('[') && raw.ends_with(']')) || (raw.starts_with('{') && raw.ends_with('}')) {
        return serde_yaml::from_str::<serde_yaml::Value>(raw).ok().map(|v| SpecValue::from_yaml(&v));
    }
    None
}

fn yaml_label(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other).map(|s| s.trim_end().to_string()).unwrap_or_default(),
    }
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ArgKind, Primitive};
    use ordered_float::OrderedFloat;

    const SITE: &str = r#"
- hosts: web
  vars:
    user: deploy
    port: 8080
    debug: false
    ratio: 1
    home: "/home/{{ user }}"
    backup: "{{ home }}_backup"
    listen: "{{ bind_addr | default('0.0.0.0') }}"
    upstreams:
      - {host: a, weight: 1}
      - {host: b}
  vars_files:
    - secrets.yml
  tasks:
    - name: install
      package:
        name: "{{ pkg | default('nginx') }}"
      register: install_result
    - set_fact:
        ratio: 0.5
    - block:
        - command: "systemctl restart {{ service_name }}"
          register: restart
"#;

    fn infer(src: &str) -> PlaybookInference {
        infer_from_str(src).unwrap()
    }

    #[test]
    fn literal_bindings_become_typed_parameters() {
        let out = infer(SITE);
        let p = &out.spec.params;
        assert_eq!(p["user"].kind, ArgKind::Primitive(Primitive::String));
        assert_eq!(p["user"].default, Some(SpecValue::Str("deploy".into())));
        assert_eq!(p["port"].kind, ArgKind::Primitive(Primitive::Integer));
        assert_eq!(p["debug"].kind, ArgKind::Primitive(Primitive::Boolean));
        // joined with the later set_fact
        assert_eq!(p["ratio"].kind, ArgKind::Primitive(Primitive::Float));
        assert_eq!(p["ratio"].default, Some(SpecValue::Float(OrderedFloat(0.5))));
        let ArgKind::List(element) = &p["upstreams"].kind else { panic!() };
        let ArgKind::NestedMapping(options) = element.as_ref() else { panic!() };
        assert_eq!(options.keys().collect::<Vec<_>>(), ["host", "weight"]);
        assert!(options.values().all(|n| !n.required));
        assert!(p.values().all(|n| !n.required));
    }

    #[test]
    fn default_filters_declare_inputs() {
        let out = infer(SITE);
        let p = &out.spec.params;
        assert_eq!(p["listen"].default, Some(SpecValue::Str("0.0.0.0".into())));
        assert_eq!(p["pkg"].default, Some(SpecValue::Str("nginx".into())));
    }

    #[test]
    fn task_argument_references_become_inputs() {
        let out = infer(SITE);
        let service = &out.spec.params["service_name"];
        assert_eq!(service.kind, ArgKind::Primitive(Primitive::String));
        assert_eq!(service.default, None);
        assert!(!service.required);

        let out = infer("- hosts: all\n  tasks:\n    - debug:\n        msg: \"{{ item }} {{ install_result }}\"\n      register: install_result\n      loop: \"{{ hosts_list }}\"\n");
        assert_eq!(out.spec.params.keys().collect::<Vec<_>>(), ["hosts_list"]);
    }

    #[test]
    fn templates_become_derived_inputs() {
        let out = infer(SITE);
        assert!(!out.spec.params.contains_key("home"));
        assert_eq!(
            out.wiring.derived_inputs["home"],
            Binding::Concat(vec![Binding::Literal("/home/".into()), Binding::Property("user".into())])
        );
        assert_eq!(
            out.wiring.derived_inputs["backup"],
            Binding::Concat(vec![
                Binding::Literal("/home/".into()),
                Binding::Property("user".into()),
                Binding::Literal("_backup".into()),
            ])
        );
        assert_eq!(out.wiring.attributes, ["install_result", "restart"]);
    }

    #[test]
    fn undeclared_references_are_optional_inputs() {
        let out = infer("- hosts: all\n  vars:\n    target: \"{{ region }}\"\n");
        assert_eq!(out.wiring.derived_inputs["target"], Binding::Property("region".into()));
        assert!(!out.spec.params["region"].required);
        assert_eq!(out.spec.params["region"].default, None);
    }

    #[test]
    fn set_fact_key_value_form_is_accepted() {
        let out = infer("- hosts: all\n  tasks:\n    - set_fact: foo=bar greeting=\"hello there\" cacheable=yes\n    - set_fact: [1, 2]\n");
        let p = &out.spec.params;
        assert_eq!(p.keys().collect::<Vec<_>>(), ["foo", "greeting"]);
        assert_eq!(p["foo"].default, Some(SpecValue::Str("bar".into())));
        assert_eq!(p["greeting"].default, Some(SpecValue::Str("hello there".into())));
    }

    #[test]
    fn key_value_strings() {
        assert_eq!(
            key_values(" a=1  flag b='x y' c="),
            [("a".to_string(), "1".to_string()), ("b".into(), "x y".into()), ("c".into(), String::new())]
        );
        assert!(key_values("").is_empty());
    }

    #[test]
    fn patterns_compile() {
        Lazy::force(&DEFAULT_FILTER);
        Lazy::force(&REFERENCE);
    }

    #[test]
    fn default_literals() {
        assert_eq!(parse_default("42"), Some(SpecValue::Int(42)));
        assert_eq!(parse_default("True"), Some(SpecValue::Bool(true)));
        assert_eq!(parse_default("omit"), None);
        assert_eq!(parse_default("other_var"), None);
        assert_eq!(
            parse_default("[1, 2]"),
            Some(SpecValue::List(vec![SpecValue::Int(1), SpecValue::Int(2)]))
        );
    }

    #[test]
    fn malformed_documents_are_parse_errors() {
        assert!(infer_from_str("hosts: all\n").is_err());
        let err = infer_from_str("- hosts: all\n  tasks: 5\n").unwrap_err();
        assert!(err.contains("[0].tasks"), "{err}");
        // an unusable vars shape is skipped, not fatal
        assert_eq!(infer("- hosts: all\n  vars: [1, 2]\n").spec, MergedSpecification::default());
        assert_eq!(infer("").spec, MergedSpecification::default());
    }
}
