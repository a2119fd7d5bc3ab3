//! Spec Extractor.
//!
//! Produces a [`MergedSpecification`] from module source: first by running
//! the entry routine in the sandbox, then by reading a literal
//! `argument_spec` straight from the source, and finally by giving up with an
//! [`ExtractionMiss`] and an empty spec. Raw captured data is normalized into
//! typed [`ArgumentSpecNode`]s here; shape problems become [`Diagnostic`]s.

use std::fmt;
use std::path::Path;

use indexmap::IndexMap;
use log::{info, warn};

use crate::error::{ConvertError, read_source};
use crate::ir::{ArgKind, ArgumentSpecNode, MergedSpecification, Primitive, RequiredIf, SpecConstraints, SpecValue, Suboptions};
use crate::pysrc::{self, ast};
use crate::sandbox::{self, MissReason, SandboxOutcome, SubstitutionEnv};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExtractMode {
    #[default]
    Sandboxed,
    StaticOnly, // never run module code
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpecSource {
    Dynamic { stand_in: String },
    Static,
}

/// No spec could be found by any method. Not an error.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionMiss {
    pub sandbox: Option<MissReason>, // None when the sandbox was not run
}

/// A recovered irregularity in the spec data.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub spec: MergedSpecification,
    pub source: Option<SpecSource>,
    pub miss: Option<ExtractionMiss>,
    pub diagnostics: Vec<Diagnostic>,
}

// ————————————————————————————————————————————————————————————————————————————
// FRONT API
// ————————————————————————————————————————————————————————————————————————————

pub fn extract_from_path(path: &Path, mode: ExtractMode, env: &SubstitutionEnv) -> Result<Extraction, ConvertError> {
    let source = read_source(path)?;
    let extraction = extract_from_source(&source, mode, env);
    if let Some(miss) = &extraction.miss {
        warn!("{}: {miss}", path.display());
    }
    Ok(extraction)
}

pub fn extract_from_source(source: &str, mode: ExtractMode, env: &SubstitutionEnv) -> Extraction {
    let module = match pysrc::load(source) {
        Ok(module) => module,
        Err(err) => {
            let reason = MissReason::LoadFailed(err.to_string());
            return Extraction::missing(ExtractionMiss { sandbox: Some(reason) }, Vec::new());
        }
    };

    let mut diagnostics = Vec::new();
    let mut sandbox_miss = None;

    if mode == ExtractMode::Sandboxed {
        match sandbox::run_source(source, env) {
            SandboxOutcome::Captured(capture) => {
                let mut spec = MergedSpecification {
                    params: normalize_root(&capture.argument_spec, &mut diagnostics),
                    constraints: parse_constraints(&capture.constraints, &mut diagnostics),
                };
                let base = capture.base_args.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                spec.merge_base(normalize_params(&base, "", &mut diagnostics));
                if !spec.is_empty() {
                    info!("argument_spec captured from {} constructor ({} parameters)", capture.stand_in, spec.len());
                    return Extraction::found(spec, SpecSource::Dynamic { stand_in: capture.stand_in }, diagnostics);
                }
                sandbox_miss = Some(MissReason::EmptySpecification);
            }
            SandboxOutcome::NotCaptured(reason) => {
                info!("sandbox did not capture argument_spec: {reason}");
                sandbox_miss = Some(reason);
            }
        }
    }

    if let Some(found) = static_spec(&module) {
        let mut static_diagnostics = Vec::new();
        let spec = MergedSpecification {
            params: normalize_root(&found.argument_spec, &mut static_diagnostics),
            constraints: parse_constraints(&found.constraints, &mut static_diagnostics),
        };
        if !spec.is_empty() {
            info!("argument_spec read statically ({} parameters)", spec.len());
            return Extraction::found(spec, SpecSource::Static, static_diagnostics);
        }
    }

    Extraction::missing(ExtractionMiss { sandbox: sandbox_miss }, diagnostics)
}

impl Extraction {
    fn found(spec: MergedSpecification, source: SpecSource, diagnostics: Vec<Diagnostic>) -> Self {
        for d in &diagnostics {
            warn!("{d}");
        }
        Self { spec, source: Some(source), miss: None, diagnostics }
    }

    fn missing(miss: ExtractionMiss, diagnostics: Vec<Diagnostic>) -> Self {
        Self { spec: MergedSpecification::default(), source: None, miss: Some(miss), diagnostics }
    }
}

impl fmt::Display for ExtractionMiss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "argument_spec could not be found")?;
        if let Some(reason) = &self.sandbox {
            write!(f, " ({reason})")?;
        }
        Ok(())
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

// ————————————————————————————————————————————————————————————————————————————
// NORMALIZATION
// ————————————————————————————————————————————————————————————————————————————

fn normalize_root(raw: &SpecValue, diagnostics: &mut Vec<Diagnostic>) -> IndexMap<String, ArgumentSpecNode> {
    match raw {
        SpecValue::Map(params) => normalize_params(params, "", diagnostics),
        SpecValue::Null => IndexMap::new(),
        _ => {
            diagnostics.push(Diagnostic { path: String::new(), message: "argument_spec is not a mapping".into() });
            IndexMap::new()
        }
    }
}

/// Normalize a name → definition mapping.
pub(crate) fn normalize_params(
    raw: &IndexMap<String, SpecValue>,
    parent: &str,
    diagnostics: &mut Vec<Diagnostic>,
) -> IndexMap<String, ArgumentSpecNode> {
    raw.iter()
        .map(|(name, def)| {
            let path = if parent.is_empty() { name.clone() } else { format!("{parent}.{name}") };
            (name.clone(), normalize_node(name, def, &path, diagnostics))
        })
        .collect()
}

fn normalize_node(name: &str, raw: &SpecValue, path: &str, diagnostics: &mut Vec<Diagnostic>) -> ArgumentSpecNode {
    let mut diag = |message: String| diagnostics.push(Diagnostic { path: path.to_string(), message });
    let Some(fields) = raw.as_map() else {
        diag("definition is not a mapping; treated as an optional string".into());
        return ArgumentSpecNode::new(name, ArgKind::Primitive(Primitive::String));
    };

    let type_name = type_field(fields.get("type"), "type", &mut diag);
    let elements = type_field(fields.get("elements"), "elements", &mut diag);
    let options = match fields.get("options") {
        Some(SpecValue::Map(opts)) if !opts.is_empty() => Some(opts),
        Some(SpecValue::Map(_) | SpecValue::Null) | None => None,
        Some(_) => {
            diag("`options` is not a mapping; ignored".into());
            None
        }
    };

    let mut nested = Vec::new();
    let suboptions = options.map(|opts| normalize_params(opts, path, &mut nested));
    let kind = resolve_kind(type_name.as_deref(), elements.as_deref(), suboptions, &mut diag);
    let mut node = ArgumentSpecNode::new(name, kind);

    node.required = fields.get("required").is_some_and(SpecValue::truthy);
    node.no_log = fields.get("no_log").is_some_and(SpecValue::truthy);
    node.default = fields.get("default").filter(|v| **v != SpecValue::Null).cloned();
    node.aliases = match fields.get("aliases") {
        Some(SpecValue::List(xs)) => xs.iter().filter_map(|x| x.as_str().map(str::to_string)).collect(),
        Some(SpecValue::Str(alias)) => vec![alias.clone()],
        _ => Vec::new(),
    };
    node.choices = match fields.get("choices") {
        None | Some(SpecValue::Null) => None,
        Some(SpecValue::List(xs)) => match &node.kind {
            ArgKind::Dict | ArgKind::NestedMapping(_) => {
                diag("`choices` on a mapping parameter dropped; structure kept".into());
                None
            }
            _ => Some(xs.clone()),
        },
        Some(SpecValue::Map(m)) => Some(m.keys().map(|k| SpecValue::Str(k.clone())).collect()),
        Some(_) => {
            diag("`choices` is not a sequence; ignored".into());
            None
        }
    };
    if node.required && node.default.is_some() {
        diag("required parameter also declares a default".into());
    }
    diagnostics.append(&mut nested);
    node
}

fn type_field(value: Option<&SpecValue>, field: &str, diag: &mut impl FnMut(String)) -> Option<String> {
    match value {
        None | Some(SpecValue::Null) => None,
        Some(SpecValue::Str(s)) => Some(s.clone()),
        Some(_) => {
            diag(format!("`{field}` is not a type name; ignored"));
            None
        }
    }
}

fn resolve_kind(
    type_name: Option<&str>,
    elements: Option<&str>,
    suboptions: Option<Suboptions>,
    diag: &mut impl FnMut(String),
) -> ArgKind {
    let default_type = if suboptions.is_some() { "dict" } else { "str" };
    match type_name.unwrap_or(default_type) {
        "list" | "sequence" | "tuple" => {
            let element_default = if suboptions.is_some() { "dict" } else { "str" };
            let element = elements.unwrap_or(element_default);
            if matches!(element, "list" | "sequence") {
                diag("nested list elements are treated as raw values".into());
                return ArgKind::List(Box::new(ArgKind::Primitive(Primitive::Raw)));
            }
            ArgKind::List(Box::new(resolve_kind(Some(element), None, suboptions, diag)))
        }
        "dict" | "mapping" => match suboptions {
            Some(opts) => ArgKind::NestedMapping(opts),
            None => ArgKind::Dict,
        },
        other => {
            if suboptions.is_some() {
                diag(format!("`options` ignored on non-mapping type '{other}'"));
            }
            ArgKind::Primitive(primitive(other).unwrap_or_else(|| {
                diag(format!("unknown type '{other}'; treated as string"));
                Primitive::String
            }))
        }
    }
}

fn primitive(type_name: &str) -> Option<Primitive> {
    Some(match type_name {
        "str" | "string" | "bytes" | "bits" => Primitive::String,
        "int" | "integer" => Primitive::Integer,
        "float" => Primitive::Float,
        "bool" | "boolean" => Primitive::Boolean,
        "path" => Primitive::Path,
        "raw" | "jsonarg" | "json" => Primitive::Raw,
        _ => return None,
    })
}

/// Constraint keywords of the module constructor.
pub(crate) fn parse_constraints(raw: &IndexMap<String, SpecValue>, diagnostics: &mut Vec<Diagnostic>) -> SpecConstraints {
    let mut diag = |key: &str, message: &str| {
        diagnostics.push(Diagnostic { path: key.to_string(), message: message.to_string() })
    };
    let mut constraints = SpecConstraints::default();
    for (key, value) in raw {
        match key.as_str() {
            "mutually_exclusive" | "required_together" | "required_one_of" => {
                let Some(groups) = name_groups(value) else {
                    diag(key, "expected a list of parameter-name lists; ignored");
                    continue;
                };
                match key.as_str() {
                    "mutually_exclusive" => constraints.mutually_exclusive = groups,
                    "required_together" => constraints.required_together = groups,
                    _ => constraints.required_one_of = groups,
                }
            }
            "required_if" => {
                let SpecValue::List(rules) = value else {
                    diag(key, "expected a list of rules; ignored");
                    continue;
                };
                for rule in rules {
                    match required_if(rule) {
                        Some(rule) => constraints.required_if.push(rule),
                        None => diag(key, "malformed rule; ignored"),
                    }
                }
            }
            "required_by" => {
                let SpecValue::Map(m) = value else {
                    diag(key, "expected a mapping; ignored");
                    continue;
                };
                for (param, requires) in m {
                    let names = match requires {
                        SpecValue::Str(s) => vec![s.clone()],
                        other => names(other).unwrap_or_default(),
                    };
                    constraints.required_by.insert(param.clone(), names);
                }
            }
            _ => {}
        }
    }
    constraints
}

fn names(value: &SpecValue) -> Option<Vec<String>> {
    match value {
        SpecValue::List(xs) => xs.iter().map(|x| x.as_str().map(str::to_string)).collect(),
        _ => None,
    }
}

fn name_groups(value: &SpecValue) -> Option<Vec<Vec<String>>> {
    let SpecValue::List(groups) = value else { return None };
    if groups.iter().all(|g| matches!(g, SpecValue::Str(_))) && !groups.is_empty() {
        return names(value).map(|single| vec![single]);
    }
    groups.iter().map(names).collect()
}

fn required_if(rule: &SpecValue) -> Option<RequiredIf> {
    let SpecValue::List(parts) = rule else { return None };
    match parts.as_slice() {
        [SpecValue::Str(key), value, requirements, rest @ ..] if rest.len() <= 1 => Some(RequiredIf {
            key: key.clone(),
            value: value.clone(),
            requirements: names(requirements)?,
            any: rest.first().is_some_and(SpecValue::truthy),
        }),
        _ => None,
    }
}

// ————————————————————————————————————————————————————————————————————————————
// STATIC FALLBACK
// ————————————————————————————————————————————————————————————————————————————

struct StaticSpec {
    argument_spec: SpecValue,
    constraints: IndexMap<String, SpecValue>,
}

const CONSTRUCTOR_NAMES: &[&str] = &["AnsibleModule", "AnsibleAWSModule", "AnsibleK8SModule"];
const CONSTRAINT_KEYWORDS: &[&str] =
    &["mutually_exclusive", "required_together", "required_one_of", "required_if", "required_by"];

/// Read `argument_spec` without running anything: the top-level binding, or
/// else an `argument_spec=` keyword on a framework constructor call.
fn static_spec(module: &ast::Module) -> Option<StaticSpec> {
    let mut bindings: IndexMap<String, SpecValue> = IndexMap::new();
    for stmt in &module.body {
        let (target, value) = match stmt {
            ast::Stmt::Assign { targets, value } if targets.len() == 1 => (&targets[0], value),
            ast::Stmt::AnnAssign { target, value: Some(value) } => (target, value),
            _ => continue,
        };
        if let ast::Expr::Name(name) = target {
            match literal(value, &bindings) {
                Some(v) => {
                    bindings.insert(name.clone(), v);
                }
                None => {
                    bindings.shift_remove(name);
                }
            }
        }
    }
    if let Some(spec @ SpecValue::Map(_)) = bindings.get("argument_spec") {
        return Some(StaticSpec { argument_spec: spec.clone(), constraints: IndexMap::new() });
    }

    let mut found = None;
    module.walk_exprs(&mut |expr| {
        if found.is_some() {
            return;
        }
        let ast::Expr::Call { func, args } = expr else { return };
        let callee = match func.as_ref() {
            ast::Expr::Name(n) | ast::Expr::Attribute(_, n) => n.as_str(),
            _ => return,
        };
        if !CONSTRUCTOR_NAMES.contains(&callee) {
            return;
        }
        let mut spec = None;
        let mut constraints = IndexMap::new();
        for (i, arg) in args.iter().enumerate() {
            match arg {
                ast::Arg::Keyword(k, v) if k == "argument_spec" => spec = literal(v, &bindings),
                ast::Arg::Positional(v) if i == 0 => spec = literal(v, &bindings),
                ast::Arg::Keyword(k, v) if CONSTRAINT_KEYWORDS.contains(&k.as_str()) => {
                    if let Some(v) = literal(v, &bindings) {
                        constraints.insert(k.clone(), v);
                    }
                }
                _ => {}
            }
        }
        if let Some(spec @ SpecValue::Map(_)) = spec {
            found = Some(StaticSpec { argument_spec: spec, constraints });
        }
    });
    found
}

/// Evaluate a pure literal: constants, displays, `dict(...)`, unpacking of
/// earlier literal bindings and type names.
fn literal(expr: &ast::Expr, bindings: &IndexMap<String, SpecValue>) -> Option<SpecValue> {
    use ast::{Constant, Expr};
    Some(match expr {
        Expr::Const(Constant::None) => SpecValue::Null,
        Expr::Const(Constant::Bool(b)) => SpecValue::Bool(*b),
        Expr::Const(Constant::Int(i)) => SpecValue::Int(*i),
        Expr::Const(Constant::Float(f)) => SpecValue::Float((*f).into()),
        Expr::Const(Constant::Str(s)) => SpecValue::Str(s.clone()),
        Expr::Const(Constant::Ellipsis) => return None,
        Expr::List(xs) | Expr::Tuple(xs) | Expr::Set(xs) => {
            SpecValue::List(xs.iter().map(|x| literal(x, bindings)).collect::<Option<_>>()?)
        }
        Expr::Dict(items) => {
            let mut map = IndexMap::new();
            for item in items {
                match item {
                    ast::DictItem::Pair(k, v) => {
                        map.insert(literal_key(k)?, literal(v, bindings)?);
                    }
                    ast::DictItem::Unpack(e) => map.extend(literal(e, bindings)?.as_map()?.clone()),
                }
            }
            SpecValue::Map(map)
        }
        Expr::Call { func, args } if matches!(func.as_ref(), Expr::Name(n) if n == "dict") => {
            let mut map = IndexMap::new();
            for arg in args {
                match arg {
                    ast::Arg::Keyword(k, v) => {
                        map.insert(k.clone(), literal(v, bindings)?);
                    }
                    ast::Arg::Positional(e) | ast::Arg::DoubleStar(e) => {
                        map.extend(literal(e, bindings)?.as_map()?.clone())
                    }
                    ast::Arg::Star(_) => return None,
                }
            }
            SpecValue::Map(map)
        }
        Expr::UnaryOp { op: ast::UnaryOp::Neg, operand } => match literal(operand, bindings)? {
            SpecValue::Int(i) => SpecValue::Int(i.checked_neg()?),
            SpecValue::Float(f) => SpecValue::Float(-f),
            _ => return None,
        },
        Expr::BinOp { left, op: ast::BinOp::Add, right } => {
            match (literal(left, bindings)?, literal(right, bindings)?) {
                (SpecValue::List(mut a), SpecValue::List(b)) => {
                    a.extend(b);
                    SpecValue::List(a)
                }
                (SpecValue::Str(a), SpecValue::Str(b)) => SpecValue::Str(a + &b),
                _ => return None,
            }
        }
        Expr::Name(name) => match bindings.get(name) {
            Some(v) => v.clone(),
            None if matches!(name.as_str(), "str" | "int" | "float" | "bool" | "list" | "dict") => {
                SpecValue::Str(name.clone())
            }
            None => return None,
        },
        _ => return None,
    })
}

fn literal_key(expr: &ast::Expr) -> Option<String> {
    match expr {
        ast::Expr::Const(ast::Constant::Str(s)) => Some(s.clone()),
        ast::Expr::Const(ast::Constant::Int(i)) => Some(i.to_string()),
        _ => None,
    }
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(src: &str) -> Extraction {
        extract_from_source(src, ExtractMode::Sandboxed, &SubstitutionEnv::default())
    }

    const PORTS_STATIC: &str = r#"
argument_spec = {"name": {"type": "str", "required": True}, "ports": {"type": "list", "elements": "dict", "options": {"from": {"type": "int"}, "to": {"type": "int"}}}}
"#;

    #[test]
    fn static_fallback_when_entry_raises() {
        let src = format!("{PORTS_STATIC}\ndef main():\n    raise RuntimeError('no credentials')\n");
        let fallback = extract(&src);
        assert_eq!(fallback.source, Some(SpecSource::Static));
        assert!(fallback.miss.is_none());

        let direct = extract_from_source(PORTS_STATIC, ExtractMode::StaticOnly, &SubstitutionEnv::default());
        assert_eq!(fallback.spec, direct.spec);

        let ports = &fallback.spec.params["ports"];
        let ArgKind::List(element) = &ports.kind else { panic!("{:?}", ports.kind) };
        let ArgKind::NestedMapping(opts) = element.as_ref() else { panic!() };
        assert_eq!(opts.keys().collect::<Vec<_>>(), ["from", "to"]);
        assert_eq!(opts["from"].kind, ArgKind::Primitive(Primitive::Integer));
        assert!(fallback.spec.params["name"].required);
    }

    #[test]
    fn static_fallback_when_entry_recurses_without_end() {
        let src = format!("{PORTS_STATIC}\ndef f(n):\n    return [f(n + 1)]\n\ndef main():\n    f(0)\n");
        let fallback = extract(&src);
        assert_eq!(fallback.source, Some(SpecSource::Static));
        assert_eq!(fallback.spec.params.keys().collect::<Vec<_>>(), ["name", "ports"]);
    }

    #[test]
    fn dynamic_capture_wins_and_merges_base_args() {
        let src = "\
from ansible_collections.amazon.aws.plugins.module_utils.modules import AnsibleAWSModule
argument_spec = {'stale': {}}
def main():
    spec = dict(region=dict(required=True), name=dict())
    AnsibleAWSModule(argument_spec=spec, required_if=[['state', 'present', ['name']]])
";
        let ex = extract(src);
        assert_eq!(ex.source, Some(SpecSource::Dynamic { stand_in: "AnsibleAWSModule".into() }));
        let names: Vec<&str> = ex.spec.params.keys().map(String::as_str).collect();
        assert_eq!(&names[..2], ["region", "name"]);
        assert!(names.contains(&"access_key"));
        assert!(!names.contains(&"stale"));
        assert!(ex.spec.params["region"].required);
        assert_eq!(ex.spec.constraints.required_if[0].requirements, ["name"]);
    }

    #[test]
    fn empty_spec_is_a_miss_not_an_error() {
        let src = "\
from ansible.module_utils.basic import AnsibleModule
def main():
    module = AnsibleModule(argument_spec={})
    module.exit_json(changed=False)
";
        let ex = extract(src);
        assert!(ex.spec.is_empty());
        assert_eq!(ex.miss, Some(ExtractionMiss { sandbox: Some(MissReason::EmptySpecification) }));
        assert!(ex.miss.unwrap().to_string().starts_with("argument_spec could not be found"));
    }

    #[test]
    fn static_scan_finds_constructor_keywords() {
        let src = "\
def main():
    module = AnsibleModule(
        argument_spec=dict(state=dict(choices=['present', 'absent'], default='present')),
        mutually_exclusive=[('a', 'b')],
    )
";
        let ex = extract_from_source(src, ExtractMode::StaticOnly, &SubstitutionEnv::default());
        assert_eq!(ex.source, Some(SpecSource::Static));
        let state = &ex.spec.params["state"];
        assert_eq!(state.choices.as_ref().map(Vec::len), Some(2));
        assert_eq!(ex.spec.constraints.mutually_exclusive, vec![vec!["a".to_string(), "b".to_string()]]);
    }

    #[test]
    fn normalization_recovers_from_malformed_nodes() {
        let raw = SpecValue::from_json(&serde_json::json!({
            "mystery": {"type": "frobnicator"},
            "blob": {"type": "dict", "choices": ["x"]},
            "free": {"type": "dict"},
            "count": {"type": "int", "default": null},
            "bare": "oops",
            "when": {"type": "jsonarg", "aliases": "at"}
        }));
        let mut diags = Vec::new();
        let params = normalize_root(&raw, &mut diags);
        assert_eq!(params["mystery"].kind, ArgKind::Primitive(Primitive::String));
        assert_eq!(params["blob"].kind, ArgKind::Dict);
        assert!(params["blob"].choices.is_none());
        assert_eq!(params["free"].kind, ArgKind::Dict);
        assert_eq!(params["count"].default, None);
        assert_eq!(params["bare"].kind, ArgKind::Primitive(Primitive::String));
        assert_eq!(params["when"].kind, ArgKind::Primitive(Primitive::Raw));
        assert_eq!(params["when"].aliases, ["at"]);
        let paths: Vec<&str> = diags.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, ["mystery", "blob", "bare"]);
    }

    #[test]
    fn options_without_type_mean_nested_mapping() {
        let raw = SpecValue::from_json(&serde_json::json!({
            "auth": {"options": {"user": {"required": true}, "token": {"no_log": true}}}
        }));
        let params = normalize_root(&raw, &mut Vec::new());
        let ArgKind::NestedMapping(opts) = &params["auth"].kind else { panic!() };
        assert!(opts["user"].required);
        assert!(opts["token"].no_log);
    }

    #[test]
    fn type_objects_are_accepted_statically() {
        let ex = extract_from_source(
            "argument_spec = dict(n=dict(type=int), flag=dict(type=bool, default=False))\n",
            ExtractMode::StaticOnly,
            &SubstitutionEnv::default(),
        );
        assert_eq!(ex.spec.params["n"].kind, ArgKind::Primitive(Primitive::Integer));
        assert_eq!(ex.spec.params["flag"].default, Some(SpecValue::Bool(false)));
    }
}
