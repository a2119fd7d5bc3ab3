// TOSCA emitter: one node type, one data type per reusable entry, and a
// Standard `create` operation wired to the node's properties.

use log::debug;
use serde_json::{Map, Value, json};

use super::EmitContext;
use crate::ir::{Binding, SpecValue};
use crate::lower::{Property, SourceKind, TypeModel, TypeRef};

pub const DEFINITIONS_VERSION: &str = "tosca_simple_yaml_1_3";
const NODE_ROOT: &str = "tosca.nodes.Root";
const DATA_ROOT: &str = "tosca.datatypes.Root";
const STANDARD: &str = "tosca.interfaces.node.lifecycle.Standard";

pub fn document(model: &TypeModel, cx: &EmitContext<'_>) -> Value {
    let constraints = &model.constraints;
    if !(constraints.mutually_exclusive.is_empty()
        && constraints.required_together.is_empty()
        && constraints.required_one_of.is_empty()
        && constraints.required_if.is_empty()
        && constraints.required_by.is_empty())
    {
        debug!("tosca: cross-parameter constraints have no TOSCA equivalent; omitted");
    }
    for prop in model.properties.iter().filter(|p| !p.refinements.is_empty()) {
        debug!("tosca: `{}` narrows data type attributes per site; data type keeps the shared ones", prop.name);
    }

    let mut doc = Map::new();
    doc.insert("tosca_definitions_version".into(), json!(DEFINITIONS_VERSION));

    if !model.types.is_empty() {
        let data_types: Map<String, Value> = model
            .types
            .iter()
            .map(|entry| {
                let mut def = Map::new();
                def.insert("derived_from".into(), json!(DATA_ROOT));
                if let Some(parent) = &entry.parent {
                    def.insert("description".into(), json!(format!("Element of `{parent}`")));
                }
                def.insert("properties".into(), properties(model, &entry.properties));
                (entry.type_name.clone(), Value::Object(def))
            })
            .collect();
        doc.insert("data_types".into(), Value::Object(data_types));
    }

    let mut node = Map::new();
    node.insert("derived_from".into(), json!(NODE_ROOT));
    node.insert("properties".into(), properties(model, &model.properties));
    if !cx.wiring.attributes.is_empty() {
        let attributes: Map<String, Value> = cx
            .wiring
            .attributes
            .iter()
            .map(|name| (name.clone(), json!({ "type": "string" })))
            .collect();
        node.insert("attributes".into(), Value::Object(attributes));
    }
    node.insert("interfaces".into(), json!({
        "Standard": {
            "type": STANDARD,
            "operations": {
                "create": {
                    "implementation": cx.implementation,
                    "inputs": inputs(model, cx),
                },
            },
        },
    }));

    let mut node_types = Map::new();
    node_types.insert(cx.node_type_name.to_string(), Value::Object(node));
    doc.insert("node_types".into(), Value::Object(node_types));
    Value::Object(doc)
}

fn properties(model: &TypeModel, props: &[Property]) -> Value {
    Value::Object(props.iter().map(|p| (p.name.clone(), property(model, p))).collect())
}

fn property(model: &TypeModel, prop: &Property) -> Value {
    let mut out = Map::new();
    out.insert("type".into(), json!(type_name(model, &prop.ty)));
    out.insert("required".into(), json!(prop.required));
    if let Some(default) = &prop.default {
        out.insert("default".into(), default.to_json());
    }
    let valid_values = prop
        .choices
        .as_ref()
        .map(|xs| json!([{ "valid_values": xs.iter().map(SpecValue::to_json).collect::<Vec<_>>() }]));
    match &prop.ty {
        TypeRef::List(element) => {
            out.insert("entry_schema".into(), Value::Object(entry_schema(model, element, valid_values)));
        }
        _ => {
            if let Some(valid_values) = valid_values {
                out.insert("constraints".into(), valid_values);
            }
        }
    }

    let mut metadata = Map::new();
    match prop.source_kind {
        SourceKind::Path => {
            metadata.insert("ansible_type".into(), json!("path"));
        }
        SourceKind::Raw => {
            metadata.insert("ansible_type".into(), json!("raw"));
        }
        SourceKind::Plain => {}
    }
    if !prop.aliases.is_empty() {
        metadata.insert("aliases".into(), json!(prop.aliases.join(", ")));
    }
    if prop.no_log {
        metadata.insert("no_log".into(), json!("true"));
    }
    if !metadata.is_empty() {
        out.insert("metadata".into(), Value::Object(metadata));
    }
    Value::Object(out)
}

/// `{type: ...}`, recursing into `entry_schema` for lists of lists. Element
/// constraints land on the innermost level.
fn entry_schema(model: &TypeModel, ty: &TypeRef, valid_values: Option<Value>) -> Map<String, Value> {
    let mut entry = Map::new();
    entry.insert("type".into(), json!(type_name(model, ty)));
    match ty {
        TypeRef::List(element) => {
            entry.insert("entry_schema".into(), Value::Object(entry_schema(model, element, valid_values)));
        }
        _ => {
            if let Some(valid_values) = valid_values {
                entry.insert("constraints".into(), valid_values);
            }
        }
    }
    entry
}

fn type_name(model: &TypeModel, ty: &TypeRef) -> String {
    match ty {
        TypeRef::String => "string".into(),
        TypeRef::Integer => "integer".into(),
        TypeRef::Float => "float".into(),
        TypeRef::Boolean => "boolean".into(),
        TypeRef::Map => "map".into(),
        TypeRef::List(_) => "list".into(),
        TypeRef::Named(id) => model.entry(*id).type_name.clone(),
    }
}

/// One input per property, then the derived inputs of the wiring.
fn inputs(model: &TypeModel, cx: &EmitContext<'_>) -> Value {
    let mut inputs: Map<String, Value> = model
        .properties
        .iter()
        .map(|p| (p.name.clone(), binding(&Binding::Property(p.name.clone()))))
        .collect();
    for (name, bound) in &cx.wiring.derived_inputs {
        inputs.insert(name.clone(), binding(bound));
    }
    Value::Object(inputs)
}

fn binding(bound: &Binding) -> Value {
    match bound {
        Binding::Literal(s) => json!(s),
        Binding::Property(name) => json!({ "get_property": ["SELF", name] }),
        Binding::Concat(parts) => json!({ "concat": parts.iter().map(binding).collect::<Vec<_>>() }),
    }
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{ExtractMode, extract_from_source};
    use crate::ir::Wiring;
    use crate::lower::lower_spec;
    use crate::sandbox::SubstitutionEnv;

    fn tosca(src: &str, wiring: &Wiring) -> Value {
        let spec = extract_from_source(src, ExtractMode::StaticOnly, &SubstitutionEnv::default()).spec;
        let cx = EmitContext { node_type_name: "PortsModule", implementation: "ports.py", wiring };
        document(&lower_spec(&spec), &cx)
    }

    fn at<'a>(v: &'a Value, pointer: &str) -> &'a Value {
        v.pointer(pointer).unwrap_or_else(|| panic!("missing {pointer} in {v:#}"))
    }

    #[test]
    fn ports_scenario() {
        let doc = tosca(
            r#"argument_spec = {"name": {"type": "str", "required": True}, "ports": {"type": "list", "elements": "dict", "options": {"from": {"type": "int"}, "to": {"type": "int"}}}}"#,
            &Wiring::default(),
        );
        let node = at(&doc, "/node_types/PortsModule");
        assert_eq!(at(node, "/properties/name"), &json!({"type": "string", "required": true}));
        assert_eq!(at(node, "/properties/ports/type"), "list");
        assert_eq!(at(node, "/properties/ports/entry_schema/type"), "Ports");
        assert_eq!(at(&doc, "/data_types").as_object().unwrap().len(), 1);
        assert_eq!(at(&doc, "/data_types/Ports/properties/from/type"), "integer");
        assert_eq!(at(&doc, "/data_types/Ports/properties/to/type"), "integer");

        let create = at(node, "/interfaces/Standard/operations/create");
        assert_eq!(at(create, "/implementation"), "ports.py");
        assert_eq!(at(create, "/inputs/name"), &json!({"get_property": ["SELF", "name"]}));
        assert_eq!(at(create, "/inputs/ports"), &json!({"get_property": ["SELF", "ports"]}));
    }

    #[test]
    fn empty_spec_yields_node_without_properties() {
        let doc = tosca("argument_spec = {}\n", &Wiring::default());
        assert!(doc.get("data_types").is_none());
        assert_eq!(at(&doc, "/node_types/PortsModule/properties"), &json!({}));
        assert_eq!(at(&doc, "/node_types/PortsModule/interfaces/Standard/operations/create/inputs"), &json!({}));
    }

    #[test]
    fn wiring_adds_derived_inputs_and_attributes() {
        let mut wiring = Wiring::default();
        wiring.derived_inputs.insert(
            "home".into(),
            Binding::Concat(vec![Binding::Literal("/home/".into()), Binding::Property("user".into())]),
        );
        wiring.attributes.push("result".into());
        let doc = tosca("argument_spec = dict(user=dict())\n", &wiring);
        let node = at(&doc, "/node_types/PortsModule");
        assert_eq!(
            at(node, "/interfaces/Standard/operations/create/inputs/home"),
            &json!({"concat": ["/home/", {"get_property": ["SELF", "user"]}]})
        );
        assert_eq!(at(node, "/attributes/result/type"), "string");
    }

    #[test]
    fn nested_lists_keep_every_entry_schema_level() {
        use crate::ir::{ArgKind, ArgumentSpecNode, MergedSpecification, Primitive};
        let mut grid = ArgumentSpecNode::new(
            "grid",
            ArgKind::List(Box::new(ArgKind::List(Box::new(ArgKind::Primitive(Primitive::Integer))))),
        );
        grid.choices = Some(vec![SpecValue::Int(1), SpecValue::Int(2)]);
        let spec = MergedSpecification { params: [("grid".to_string(), grid)].into_iter().collect(), ..Default::default() };
        let wiring = Wiring::default();
        let cx = EmitContext { node_type_name: "Grid", implementation: "grid.yml", wiring: &wiring };
        let doc = document(&lower_spec(&spec), &cx);

        let grid = at(&doc, "/node_types/Grid/properties/grid");
        assert_eq!(at(grid, "/entry_schema/type"), "list");
        assert_eq!(at(grid, "/entry_schema/entry_schema/type"), "integer");
        assert_eq!(at(grid, "/entry_schema/entry_schema/constraints/0/valid_values"), &json!([1, 2]));
    }

    #[test]
    fn choices_and_metadata() {
        let doc = tosca(
            "argument_spec = dict(mode=dict(choices=['a', 'b'], aliases=['m', 'mo']), secret=dict(no_log=True, type='raw'))\n",
            &Wiring::default(),
        );
        let props = at(&doc, "/node_types/PortsModule/properties");
        assert_eq!(at(props, "/mode/constraints/0/valid_values"), &json!(["a", "b"]));
        assert_eq!(at(props, "/mode/metadata/aliases"), "m, mo");
        assert_eq!(at(props, "/secret/metadata"), &json!({"ansible_type": "raw", "no_log": "true"}));
    }
}
