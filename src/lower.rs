//! Type Mapper: `MergedSpecification` → `TypeModel`.
//!
//! Nested mappings are registered depth-first (parent before children) into a
//! registry keyed by a canonical structural signature (property names and
//! mapped types), so every repeated shape becomes one named
//! [`ReusableTypeEntry`] referenced from all of its sites. The entry carries
//! the attributes its sites agree on; whatever a site adds on top is kept on
//! the referencing [`Property`] as `refinements`.
use std::collections::HashMap;

use heck::ToUpperCamelCase;

use crate::ir::{ArgKind, ArgumentSpecNode, MergedSpecification, Primitive, SpecConstraints, SpecValue, Suboptions};

// ————————————————————————————————————————————————————————————————————————————
// TYPES
// ————————————————————————————————————————————————————————————————————————————

/// Intermediate model shared by both emitters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeModel {
    pub properties: Vec<Property>,
    pub types: Vec<ReusableTypeEntry>, // first-encountered order
    pub constraints: SpecConstraints,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub name: String,
    pub ty: TypeRef,
    pub required: bool,
    pub default: Option<SpecValue>,
    pub choices: Option<Vec<SpecValue>>, // for lists: allowed element values
    pub aliases: Vec<String>,
    pub no_log: bool,
    pub source_kind: SourceKind,
    /// Sub-properties of the referenced shape whose attributes at this site
    /// differ from the shared entry. Empty unless `ty` reaches a named type.
    pub refinements: Vec<Property>,
}

/// The parameter type as written, kept for metadata (`path` and `raw` both
/// map onto strings).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Plain,
    Path,
    Raw,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeRef {
    String,
    Integer,
    Float,
    Boolean,
    Map,
    List(Box<TypeRef>),
    Named(TypeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub usize);

/// A named, deduplicated nested-mapping shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ReusableTypeEntry {
    pub type_name: String,
    pub properties: Vec<Property>,
    /// Path of the list parameter whose elements this type describes.
    pub parent: Option<String>,
}

// ————————————————————————————————————————————————————————————————————————————
// FRONT API
// ————————————————————————————————————————————————————————————————————————————

pub fn lower_spec(spec: &MergedSpecification) -> TypeModel {
    let mut registry = Registry::default();
    let mut properties: Vec<Property> = spec
        .params
        .values()
        .map(|node| registry.property(node, &[node.name.as_str()]))
        .collect();
    for property in &mut properties {
        prune_refinements(property, &registry.types);
    }
    TypeModel { properties, types: registry.types, constraints: spec.constraints.clone() }
}

impl TypeModel {
    pub fn entry(&self, id: TypeId) -> &ReusableTypeEntry {
        &self.types[id.0]
    }

    pub fn required_names(&self) -> impl Iterator<Item = &str> {
        self.properties.iter().filter(|p| p.required).map(|p| p.name.as_str())
    }
}

impl TypeRef {
    /// The named type this reference reaches through any list wrapping.
    pub fn named(&self) -> Option<TypeId> {
        match self {
            TypeRef::Named(id) => Some(*id),
            TypeRef::List(element) => element.named(),
            _ => None,
        }
    }
}

impl Property {
    /// Everything except name, type and refinements.
    fn same_attributes(&self, other: &Property) -> bool {
        self.required == other.required
            && self.default == other.default
            && self.choices == other.choices
            && self.aliases == other.aliases
            && self.no_log == other.no_log
            && self.source_kind == other.source_kind
    }

    /// Keep only what `site` agrees on.
    fn narrow_to(&mut self, site: &Property) {
        self.required &= site.required;
        self.no_log |= site.no_log;
        if self.default != site.default {
            self.default = None;
        }
        if self.choices != site.choices {
            self.choices = None;
        }
        if self.aliases != site.aliases {
            self.aliases.clear();
        }
        if self.source_kind != site.source_kind {
            self.source_kind = SourceKind::Plain;
        }
    }
}

// ————————————————————————————————————————————————————————————————————————————
// REGISTRY
// ————————————————————————————————————————————————————————————————————————————

#[derive(Default)]
struct Registry {
    types: Vec<ReusableTypeEntry>,
    by_signature: HashMap<String, TypeId>,
    used_names: HashMap<String, usize>,
}

impl Registry {
    fn property(&mut self, node: &ArgumentSpecNode, path: &[&str]) -> Property {
        let source_kind = match innermost(&node.kind) {
            ArgKind::Primitive(Primitive::Path) => SourceKind::Path,
            ArgKind::Primitive(Primitive::Raw) => SourceKind::Raw,
            _ => SourceKind::Plain,
        };
        let (ty, refinements) = self.map_kind(&node.kind, path, false);
        Property {
            name: node.name.clone(),
            ty,
            required: node.required,
            default: node.default.clone(),
            choices: node.choices.clone(),
            aliases: node.aliases.clone(),
            no_log: node.no_log,
            source_kind,
            refinements,
        }
    }

    /// The mapped type plus, for nested mappings, the full per-site properties.
    fn map_kind(&mut self, kind: &ArgKind, path: &[&str], list_element: bool) -> (TypeRef, Vec<Property>) {
        match kind {
            ArgKind::Primitive(p) => (primitive(*p), Vec::new()),
            ArgKind::Dict => (TypeRef::Map, Vec::new()),
            ArgKind::List(element) => {
                let (element, site) = self.map_kind(element, path, true);
                (TypeRef::List(Box::new(element)), site)
            }
            ArgKind::NestedMapping(options) => {
                let (id, fresh) = self.reserve(options, path, list_element);
                let site: Vec<Property> = options
                    .values()
                    .map(|node| {
                        let mut child = path.to_vec();
                        child.push(node.name.as_str());
                        self.property(node, &child)
                    })
                    .collect();
                let shared = &mut self.types[id.0].properties;
                if fresh {
                    *shared = site.iter().map(|p| Property { refinements: Vec::new(), ..p.clone() }).collect();
                } else {
                    for (shared, site) in shared.iter_mut().zip(&site) {
                        shared.narrow_to(site);
                    }
                }
                (TypeRef::Named(id), site)
            }
        }
    }

    /// Existing entry for this shape, or a fresh named placeholder.
    fn reserve(&mut self, options: &Suboptions, path: &[&str], list_element: bool) -> (TypeId, bool) {
        let signature = signature(options);
        if let Some(id) = self.by_signature.get(&signature) {
            return (*id, false);
        }
        let id = TypeId(self.types.len());
        self.by_signature.insert(signature, id);
        let type_name = self.fresh_name(path);
        self.types.push(ReusableTypeEntry {
            type_name,
            properties: Vec::new(),
            parent: list_element.then(|| path.join(".")),
        });
        (id, true)
    }

    /// `ports` → `Ports`, `auth.tls` → `AuthTls`; collisions get `2`, `3`, ...
    fn fresh_name(&mut self, path: &[&str]) -> String {
        let mut base: String = path.iter().map(|s| s.to_upper_camel_case()).collect();
        if base.is_empty() || base.starts_with(|c: char| c.is_ascii_digit()) {
            base.insert_str(0, "Type");
        }
        let seen = self.used_names.entry(base.clone()).or_insert(0);
        *seen += 1;
        let mut name = if *seen == 1 { base.clone() } else { format!("{base}{seen}") };
        while self.types.iter().any(|t| t.type_name == name) {
            let seen = self.used_names.entry(base.clone()).or_insert(1);
            *seen += 1;
            name = format!("{base}{seen}");
        }
        name
    }
}

// ————————————————————————————————————————————————————————————————————————————
// INTERNAL HELPERS
// ————————————————————————————————————————————————————————————————————————————

fn primitive(p: Primitive) -> TypeRef {
    match p {
        Primitive::String | Primitive::Path | Primitive::Raw => TypeRef::String,
        Primitive::Integer => TypeRef::Integer,
        Primitive::Float => TypeRef::Float,
        Primitive::Boolean => TypeRef::Boolean,
    }
}

fn innermost(kind: &ArgKind) -> &ArgKind {
    match kind {
        ArgKind::List(element) => innermost(element),
        other => other,
    }
}

/// Canonical structural signature of a sub-option mapping: every property
/// name in order with its mapped type. Independent of where it occurs.
fn signature(options: &Suboptions) -> String {
    let mut out = String::from("{");
    for node in options.values() {
        out.push_str(&format!("{:?}:", node.name));
        kind_signature(&node.kind, &mut out);
        out.push(',');
    }
    out.push('}');
    out
}

fn kind_signature(kind: &ArgKind, out: &mut String) {
    match kind {
        ArgKind::Primitive(p) => out.push_str(&format!("{:?}", primitive(*p))),
        ArgKind::Dict => out.push_str("Map"),
        ArgKind::List(element) => {
            out.push('[');
            kind_signature(element, out);
            out.push(']');
        }
        ArgKind::NestedMapping(options) => out.push_str(&signature(options)),
    }
}

/// Drop site properties that say nothing beyond the shared entry.
fn prune_refinements(property: &mut Property, types: &[ReusableTypeEntry]) {
    let Some(id) = property.ty.named() else {
        property.refinements.clear();
        return;
    };
    let shared = &types[id.0].properties;
    for site in &mut property.refinements {
        prune_refinements(site, types);
    }
    property.refinements.retain(|site| {
        !site.refinements.is_empty()
            || shared.iter().find(|s| s.name == site.name).is_none_or(|s| !s.same_attributes(site))
    });
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, kind: ArgKind) -> ArgumentSpecNode {
        ArgumentSpecNode::new(name, kind)
    }

    fn range_options() -> Suboptions {
        [
            ("from".to_string(), node("from", ArgKind::Primitive(Primitive::Integer))),
            ("to".to_string(), node("to", ArgKind::Primitive(Primitive::Integer))),
        ]
        .into_iter()
        .collect()
    }

    fn spec(nodes: Vec<ArgumentSpecNode>) -> MergedSpecification {
        MergedSpecification {
            params: nodes.into_iter().map(|n| (n.name.clone(), n)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn ports_list_becomes_entry_schema_type() {
        let mut name = node("name", ArgKind::Primitive(Primitive::String));
        name.required = true;
        let ports = node("ports", ArgKind::List(Box::new(ArgKind::NestedMapping(range_options()))));
        let model = lower_spec(&spec(vec![name, ports]));

        assert_eq!(model.required_names().collect::<Vec<_>>(), ["name"]);
        assert_eq!(model.types.len(), 1);
        let entry = &model.types[0];
        assert_eq!(entry.type_name, "Ports");
        assert_eq!(entry.parent.as_deref(), Some("ports"));
        assert!(entry.properties.iter().all(|p| p.ty == TypeRef::Integer));
        assert_eq!(model.properties[1].ty, TypeRef::List(Box::new(TypeRef::Named(TypeId(0)))));
    }

    #[test]
    fn identical_shapes_are_registered_once() {
        let a = node("ingress", ArgKind::NestedMapping(range_options()));
        let b = node("egress", ArgKind::List(Box::new(ArgKind::NestedMapping(range_options()))));
        let model = lower_spec(&spec(vec![a, b]));
        assert_eq!(model.types.len(), 1);
        assert_eq!(model.properties[0].ty, TypeRef::Named(TypeId(0)));
        assert_eq!(model.properties[1].ty, TypeRef::List(Box::new(TypeRef::Named(TypeId(0)))));
    }

    #[test]
    fn shapes_differing_only_in_attributes_share_one_entry() {
        let mut with_default = range_options();
        with_default["from"].default = Some(SpecValue::Int(80));
        let mut strict = range_options();
        strict["from"].required = true;
        let model = lower_spec(&spec(vec![
            node("a", ArgKind::NestedMapping(with_default)),
            node("b", ArgKind::NestedMapping(strict)),
            node("c", ArgKind::List(Box::new(ArgKind::NestedMapping(range_options())))),
        ]));
        assert_eq!(model.types.len(), 1);
        assert!(model.properties.iter().all(|p| p.ty.named() == Some(TypeId(0))));

        // shared entry keeps only what every site agrees on
        let shared = &model.types[0].properties;
        assert!(!shared[0].required);
        assert_eq!(shared[0].default, None);
        assert_eq!(shared[1].ty, TypeRef::Integer);

        // the rest stays with each site
        let a = &model.properties[0].refinements;
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].default, Some(SpecValue::Int(80)));
        let b = &model.properties[1].refinements;
        assert_eq!(b.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(), ["from"]);
        assert!(b[0].required);
        assert!(model.properties[2].refinements.is_empty());
    }

    #[test]
    fn path_and_string_sub_options_share_a_shape() {
        let path: Suboptions =
            [("cert".to_string(), node("cert", ArgKind::Primitive(Primitive::Path)))].into_iter().collect();
        let plain: Suboptions =
            [("cert".to_string(), node("cert", ArgKind::Primitive(Primitive::String)))].into_iter().collect();
        let model = lower_spec(&spec(vec![
            node("client", ArgKind::NestedMapping(plain)),
            node("server", ArgKind::NestedMapping(path)),
        ]));
        assert_eq!(model.types.len(), 1);
        assert_eq!(model.types[0].properties[0].source_kind, SourceKind::Plain);
        assert_eq!(model.properties[1].refinements[0].source_kind, SourceKind::Path);
    }

    #[test]
    fn parents_register_before_children_and_names_stay_unique() {
        let inner: Suboptions = [("cert".to_string(), node("cert", ArgKind::Primitive(Primitive::Path)))]
            .into_iter()
            .collect();
        let outer: Suboptions = [
            ("tls".to_string(), node("tls", ArgKind::NestedMapping(inner))),
            ("port".to_string(), node("port", ArgKind::Primitive(Primitive::Integer))),
        ]
        .into_iter()
        .collect();
        let other: Suboptions = [("x".to_string(), node("x", ArgKind::Dict))].into_iter().collect();
        let model = lower_spec(&spec(vec![
            node("server", ArgKind::NestedMapping(outer)),
            node("server_tls", ArgKind::NestedMapping(other)),
        ]));
        let names: Vec<&str> = model.types.iter().map(|t| t.type_name.as_str()).collect();
        assert_eq!(names, ["Server", "ServerTls", "ServerTls2"]);
        assert_eq!(model.types[1].properties[0].source_kind, SourceKind::Path);
        assert_eq!(model.types[2].properties[0].ty, TypeRef::Map);
    }

    #[test]
    fn empty_spec_lowers_to_empty_model() {
        let model = lower_spec(&MergedSpecification::default());
        assert!(model.properties.is_empty());
        assert!(model.types.is_empty());
    }
}
