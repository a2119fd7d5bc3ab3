// JSON Schema (Draft-07) emitter.

use indexmap::IndexMap;
use serde_json::{Map, Value, json};

use super::EmitContext;
use crate::ir::{RequiredIf, SpecConstraints, SpecValue};
use crate::lower::{Property, SourceKind, TypeId, TypeModel, TypeRef};

pub const DRAFT_07: &str = "http://json-schema.org/draft-07/schema#";

pub fn document(model: &TypeModel, cx: &EmitContext<'_>) -> Value {
    let mut root = Map::new();
    root.insert("$schema".into(), json!(DRAFT_07));
    root.insert("title".into(), json!(cx.node_type_name));
    root.insert("type".into(), json!("object"));
    root.insert("properties".into(), properties(model, &model.properties));
    root.insert("required".into(), json!(model.required_names().collect::<Vec<_>>()));

    let definitions: Map<String, Value> = model
        .types
        .iter()
        .map(|entry| {
            let mut def = Map::new();
            def.insert("type".into(), json!("object"));
            if let Some(parent) = &entry.parent {
                def.insert("description".into(), json!(format!("Element of `{parent}`")));
            }
            def.insert("properties".into(), properties(model, &entry.properties));
            let required: Vec<&str> =
                entry.properties.iter().filter(|p| p.required).map(|p| p.name.as_str()).collect();
            if !required.is_empty() {
                def.insert("required".into(), json!(required));
            }
            (entry.type_name.clone(), Value::Object(def))
        })
        .collect();
    root.insert("definitions".into(), Value::Object(definitions));

    constraints(&model.constraints, &mut root);
    Value::Object(root)
}

fn properties(model: &TypeModel, props: &[Property]) -> Value {
    Value::Object(props.iter().map(|p| (p.name.clone(), property(model, p))).collect())
}

fn property(model: &TypeModel, prop: &Property) -> Value {
    let mut out = type_schema(model, &prop.ty);
    if let Some(id) = prop.ty.named().filter(|_| !prop.refinements.is_empty()) {
        attach(&mut out, refinement(model, id, &prop.refinements));
    }
    let annotations = annotations(prop, &mut out);
    if annotations.is_empty() {
        return out;
    }
    // keywords next to `$ref` are ignored in Draft-07
    if out.get("$ref").is_some() {
        out = json!({ "allOf": [out] });
    }
    if let Some(obj) = out.as_object_mut() {
        obj.extend(annotations);
    }
    out
}

/// `enum`, `default` and `x-ansible` of a property. List choices go straight
/// into the innermost `items` of `schema`.
fn annotations(prop: &Property, schema: &mut Value) -> Map<String, Value> {
    let mut annotations = Map::new();
    if let Some(choices) = &prop.choices {
        let choices = Value::Array(choices.iter().map(SpecValue::to_json).collect());
        match &prop.ty {
            TypeRef::List(_) => {
                if let Some(items) = innermost_items(schema).as_object_mut() {
                    items.insert("enum".into(), choices);
                }
            }
            _ => {
                annotations.insert("enum".into(), choices);
            }
        }
    }
    if let Some(default) = &prop.default {
        annotations.insert("default".into(), default.to_json());
    }
    let mut ansible = Map::new();
    match prop.source_kind {
        SourceKind::Path => {
            ansible.insert("type".into(), json!("path"));
        }
        SourceKind::Raw => {
            ansible.insert("type".into(), json!("raw"));
        }
        SourceKind::Plain => {}
    }
    if !prop.aliases.is_empty() {
        ansible.insert("aliases".into(), json!(prop.aliases));
    }
    if prop.no_log {
        ansible.insert("no_log".into(), json!(true));
    }
    if !ansible.is_empty() {
        annotations.insert("x-ansible".into(), Value::Object(ansible));
    }
    annotations
}

/// What one use site of a shared definition adds: a partial object schema
/// applied next to the `$ref`.
fn refinement(model: &TypeModel, id: TypeId, site: &[Property]) -> Value {
    let shared = &model.entry(id).properties;
    let mut props = Map::new();
    for prop in site {
        let mut schema = skeleton(&prop.ty);
        if let Some(inner) = prop.ty.named().filter(|_| !prop.refinements.is_empty()) {
            attach(&mut schema, refinement(model, inner, &prop.refinements));
        }
        let annotations = annotations(prop, &mut schema);
        if let Some(obj) = schema.as_object_mut() {
            obj.extend(annotations);
        }
        props.insert(prop.name.clone(), schema);
    }
    let required: Vec<&str> = site
        .iter()
        .filter(|p| p.required && shared.iter().any(|s| s.name == p.name && !s.required))
        .map(|p| p.name.as_str())
        .collect();
    let mut out = Map::new();
    out.insert("properties".into(), Value::Object(props));
    if !required.is_empty() {
        out.insert("required".into(), json!(required));
    }
    Value::Object(out)
}

/// Empty schema with the list nesting of `ty`.
fn skeleton(ty: &TypeRef) -> Value {
    match ty {
        TypeRef::List(element) => json!({ "items": skeleton(element) }),
        _ => json!({}),
    }
}

/// Put `fragment` at the innermost `items` level of `schema`, next to its `$ref`.
fn attach(schema: &mut Value, fragment: Value) {
    let slot = innermost_items(schema);
    if slot.get("$ref").is_some() {
        *slot = json!({ "allOf": [slot.take(), fragment] });
    } else {
        *slot = fragment;
    }
}

fn innermost_items(schema: &mut Value) -> &mut Value {
    if schema.get("items").is_some() { innermost_items(&mut schema["items"]) } else { schema }
}

fn type_schema(model: &TypeModel, ty: &TypeRef) -> Value {
    match ty {
        TypeRef::String => json!({ "type": "string" }),
        TypeRef::Integer => json!({ "type": "integer" }),
        TypeRef::Float => json!({ "type": "number" }),
        TypeRef::Boolean => json!({ "type": "boolean" }),
        TypeRef::Map => json!({ "type": "object" }),
        TypeRef::List(element) => json!({ "type": "array", "items": type_schema(model, element) }),
        TypeRef::Named(id) => json!({ "$ref": format!("#/definitions/{}", model.entry(*id).type_name) }),
    }
}

// ————————————————————————————————————————————————————————————————————————————
// CONSTRAINTS
// ————————————————————————————————————————————————————————————————————————————

fn constraints(c: &SpecConstraints, root: &mut Map<String, Value>) {
    let mut all_of = Vec::new();
    for group in &c.required_one_of {
        let any: Vec<Value> = group.iter().map(|name| json!({ "required": [name] })).collect();
        all_of.push(json!({ "anyOf": any }));
    }
    for group in &c.mutually_exclusive {
        for (i, a) in group.iter().enumerate() {
            for b in &group[i + 1..] {
                all_of.push(json!({ "not": { "required": [a, b] } }));
            }
        }
    }
    all_of.extend(c.required_if.iter().map(required_if));
    if !all_of.is_empty() {
        root.insert("allOf".into(), Value::Array(all_of));
    }

    let mut dependencies: IndexMap<&str, Vec<&str>> = IndexMap::new();
    for group in &c.required_together {
        for member in group {
            let needs = dependencies.entry(member).or_default();
            for other in group.iter().filter(|o| *o != member) {
                if !needs.contains(&other.as_str()) {
                    needs.push(other);
                }
            }
        }
    }
    for (param, requires) in &c.required_by {
        let needs = dependencies.entry(param).or_default();
        for name in requires {
            if !needs.contains(&name.as_str()) {
                needs.push(name);
            }
        }
    }
    dependencies.retain(|_, needs| !needs.is_empty());
    if !dependencies.is_empty() {
        root.insert("dependencies".into(), json!(dependencies));
    }
}

fn required_if(rule: &RequiredIf) -> Value {
    let then = if rule.any {
        let any: Vec<Value> = rule.requirements.iter().map(|name| json!({ "required": [name] })).collect();
        json!({ "anyOf": any })
    } else {
        json!({ "required": rule.requirements })
    };
    json!({
        "if": {
            "properties": { (rule.key.clone()): { "const": rule.value.to_json() } },
            "required": [rule.key],
        },
        "then": then,
    })
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{ExtractMode, extract_from_source};
    use crate::ir::Wiring;
    use crate::lower::lower_spec;
    use crate::sandbox::SubstitutionEnv;

    fn schema(src: &str) -> Value {
        let spec = extract_from_source(src, ExtractMode::StaticOnly, &SubstitutionEnv::default()).spec;
        let wiring = Wiring::default();
        let cx = EmitContext { node_type_name: "Demo", implementation: "demo.py", wiring: &wiring };
        document(&lower_spec(&spec), &cx)
    }

    fn at<'a>(v: &'a Value, pointer: &str) -> &'a Value {
        v.pointer(pointer).unwrap_or_else(|| panic!("missing {pointer} in {v:#}"))
    }

    #[test]
    fn ports_scenario() {
        let doc = schema(
            r#"argument_spec = {"name": {"type": "str", "required": True}, "ports": {"type": "list", "elements": "dict", "options": {"from": {"type": "int"}, "to": {"type": "int"}}}}"#,
        );
        assert_eq!(at(&doc, "/$schema"), DRAFT_07);
        assert_eq!(at(&doc, "/required"), &json!(["name"]));
        assert_eq!(at(&doc, "/properties/name/type"), "string");
        assert_eq!(at(&doc, "/properties/ports/type"), "array");
        assert_eq!(at(&doc, "/properties/ports/items/$ref"), "#/definitions/Ports");
        let defs = at(&doc, "/definitions").as_object().unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(at(&doc, "/definitions/Ports/properties/from/type"), "integer");
        assert_eq!(at(&doc, "/definitions/Ports/properties/to/type"), "integer");
    }

    #[test]
    fn empty_spec_has_no_properties_or_definitions() {
        let doc = schema("argument_spec = {}\n");
        assert_eq!(at(&doc, "/properties"), &json!({}));
        assert_eq!(at(&doc, "/definitions"), &json!({}));
        assert_eq!(at(&doc, "/required"), &json!([]));
    }

    #[test]
    fn annotations_and_shared_definitions() {
        let doc = schema(
            "\
opts = dict(host=dict(required=True), port=dict(type='int', default=22))
argument_spec = dict(
    primary=dict(type='dict', options=opts, aliases=['main']),
    replicas=dict(type='list', elements='dict', options=opts),
    state=dict(choices=['present', 'absent'], default='gone'),
    tags=dict(type='list', choices=['a', 'b']),
    key=dict(type='path', no_log=True),
)
",
        );
        assert_eq!(at(&doc, "/definitions").as_object().unwrap().len(), 1);
        assert_eq!(at(&doc, "/properties/primary/allOf/0/$ref"), "#/definitions/Primary");
        assert_eq!(at(&doc, "/properties/primary/x-ansible/aliases"), &json!(["main"]));
        assert_eq!(at(&doc, "/properties/replicas/items/$ref"), "#/definitions/Primary");
        assert_eq!(at(&doc, "/definitions/Primary/required"), &json!(["host"]));
        assert_eq!(at(&doc, "/definitions/Primary/properties/port/default"), 22);
        // choices/default mismatch is carried through unchanged
        assert_eq!(at(&doc, "/properties/state/enum"), &json!(["present", "absent"]));
        assert_eq!(at(&doc, "/properties/state/default"), "gone");
        assert_eq!(at(&doc, "/properties/tags/items/enum"), &json!(["a", "b"]));
        assert_eq!(at(&doc, "/properties/key/type"), "string");
        assert_eq!(at(&doc, "/properties/key/x-ansible"), &json!({"type": "path", "no_log": true}));
    }

    #[test]
    fn site_attributes_refine_a_shared_definition() {
        let doc = schema(
            "\
argument_spec = dict(
    a=dict(type='dict', options=dict(port=dict(type='int', default=80))),
    b=dict(type='dict', options=dict(port=dict(type='int', required=True))),
    c=dict(type='list', elements='dict', options=dict(port=dict(type='int'))),
)
",
        );
        assert_eq!(at(&doc, "/definitions").as_object().unwrap().len(), 1);
        assert!(doc.pointer("/definitions/A/required").is_none());
        assert!(doc.pointer("/definitions/A/properties/port/default").is_none());
        assert_eq!(at(&doc, "/properties/a/allOf/0/$ref"), "#/definitions/A");
        assert_eq!(at(&doc, "/properties/a/allOf/1"), &json!({"properties": {"port": {"default": 80}}}));
        assert_eq!(at(&doc, "/properties/b/allOf/1/required"), &json!(["port"]));
        assert_eq!(at(&doc, "/properties/c/items"), &json!({"$ref": "#/definitions/A"}));
    }

    #[test]
    fn constraints_become_draft_07_keywords() {
        let doc = schema(
            "\
module = AnsibleModule(
    argument_spec=dict(a=dict(), b=dict(), c=dict(), state=dict()),
    mutually_exclusive=[['a', 'b', 'c']],
    required_one_of=[['a', 'b']],
    required_together=[['b', 'c']],
    required_if=[['state', 'present', ['a', 'c'], True]],
    required_by={'a': 'state'},
)
",
        );
        let all_of = at(&doc, "/allOf").as_array().unwrap();
        assert_eq!(all_of[0], json!({"anyOf": [{"required": ["a"]}, {"required": ["b"]}]}));
        assert_eq!(all_of[1], json!({"not": {"required": ["a", "b"]}}));
        assert_eq!(all_of.len(), 1 + 3 + 1);
        assert_eq!(at(&all_of[4], "/if/properties/state/const"), "present");
        assert_eq!(at(&all_of[4], "/then/anyOf/1/required/0"), "c");
        assert_eq!(at(&doc, "/dependencies"), &json!({"b": ["c"], "c": ["b"], "a": ["state"]}));
    }
}
