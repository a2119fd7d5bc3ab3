//! Evidence lattice for playbook variables.
//!
//! Each literal bound to a variable is observed into a `U`; repeated bindings
//! are joined with ⊔, which is associative, commutative and idempotent, so the
//! joined evidence does not depend on the order assignments were found in.
//! [`kind_of`] then settles the evidence on one [`ArgKind`].
//!
//! One arm per kind (null, bool, number, string, array, object); arrays and
//! objects carry nested evidence.
pub mod arr;
pub mod num;
pub mod obj;

use indexmap::IndexMap;

pub use arr::ArrC;
pub use num::NumC;
pub use obj::ObjC;

use crate::ir::{ArgKind, ArgumentSpecNode, Primitive, SpecValue};

// ------------------------------ State ------------------------------------ //

#[derive(Clone, Debug, Default, PartialEq)]
pub struct U {
    pub nullable: bool,
    pub has_bool: bool,
    pub has_str: bool,
    pub num: Option<NumC>,
    pub arr: Option<ArrC>,
    pub obj: Option<ObjC>,
}

impl U {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_bottom(&self) -> bool {
        !self.nullable
            && !self.has_bool
            && !self.has_str
            && self.num.is_none()
            && self.arr.is_none()
            && self.obj.is_none()
    }

    pub fn join(a: &U, b: &U) -> U {
        U {
            nullable: a.nullable || b.nullable,
            has_bool: a.has_bool || b.has_bool,
            has_str: a.has_str || b.has_str,
            num: join_arm(&a.num, &b.num, NumC::join),
            arr: join_arm(&a.arr, &b.arr, ArrC::join),
            obj: join_arm(&a.obj, &b.obj, ObjC::join),
        }
    }

    /// Number of non-null arms.
    fn arms(&self) -> usize {
        [self.has_bool, self.has_str, self.num.is_some(), self.arr.is_some(), self.obj.is_some()]
            .into_iter()
            .filter(|x| *x)
            .count()
    }
}

fn join_arm<T: Clone>(a: &Option<T>, b: &Option<T>, join: fn(&T, &T) -> T) -> Option<T> {
    match (a, b) {
        (None, None) => None,
        (Some(x), None) | (None, Some(x)) => Some(x.clone()),
        (Some(x), Some(y)) => Some(join(x, y)),
    }
}

// ------------------------------ Observe ---------------------------------- //

pub fn observe(v: &SpecValue) -> U {
    match v {
        SpecValue::Null => U { nullable: true, ..U::default() },
        SpecValue::Bool(_) => U { has_bool: true, ..U::default() },
        SpecValue::Int(_) => U { num: Some(NumC::int()), ..U::default() },
        SpecValue::Float(_) => U { num: Some(NumC::float()), ..U::default() },
        SpecValue::Str(_) => U { has_str: true, ..U::default() },
        SpecValue::List(xs) => {
            let item = xs.iter().fold(U::empty(), |acc, x| U::join(&acc, &observe(x)));
            U { arr: Some(ArrC { item: Box::new(item) }), ..U::default() }
        }
        SpecValue::Map(m) => {
            let fields = m.iter().map(|(k, v)| (k.clone(), observe(v))).collect();
            U { obj: Some(ObjC { fields }), ..U::default() }
        }
    }
}

// ------------------------------- Settle ---------------------------------- //

/// Pick one kind for the evidence. Mixed evidence (other than integers mixed
/// with floats) is raw; no evidence at all is a string. Nested options are
/// never marked required: sample values cannot show that a key is mandatory.
pub fn kind_of(u: &U) -> ArgKind {
    if u.arms() > 1 {
        return ArgKind::Primitive(Primitive::Raw);
    }
    if let Some(num) = &u.num {
        return ArgKind::Primitive(if num.saw_float { Primitive::Float } else { Primitive::Integer });
    }
    if let Some(arr) = &u.arr {
        let element = if arr.item.arms() == 0 {
            ArgKind::Primitive(Primitive::String)
        } else {
            kind_of(&arr.item)
        };
        return ArgKind::List(Box::new(element));
    }
    if let Some(obj) = &u.obj {
        if obj.fields.is_empty() {
            return ArgKind::Dict;
        }
        let options: IndexMap<String, ArgumentSpecNode> = obj
            .fields
            .iter()
            .map(|(name, field)| (name.clone(), ArgumentSpecNode::new(name, kind_of(field))))
            .collect();
        return ArgKind::NestedMapping(options);
    }
    if u.has_bool {
        return ArgKind::Primitive(Primitive::Boolean);
    }
    ArgKind::Primitive(Primitive::String)
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ev(v: serde_json::Value) -> U {
        observe(&SpecValue::from_json(&v))
    }

    #[test]
    fn join_is_order_independent() {
        let xs = [json!(1), json!({"a": 1}), json!(null), json!({"a": 2.5, "b": "x"})];
        let forward = xs.iter().fold(U::empty(), |acc, x| U::join(&acc, &ev(x.clone())));
        let backward = xs.iter().rev().fold(U::empty(), |acc, x| U::join(&acc, &ev(x.clone())));
        assert_eq!(forward.nullable, backward.nullable);
        assert_eq!(kind_of(&forward), kind_of(&backward));
        assert_eq!(U::join(&forward, &forward).arms(), forward.arms());
    }

    #[test]
    fn numbers_widen_to_float() {
        let u = U::join(&ev(json!(3)), &ev(json!(0.5)));
        assert_eq!(kind_of(&u), ArgKind::Primitive(Primitive::Float));
        assert_eq!(kind_of(&ev(json!(3))), ArgKind::Primitive(Primitive::Integer));
    }

    #[test]
    fn mixed_evidence_is_raw_and_null_is_ignored() {
        assert_eq!(kind_of(&U::join(&ev(json!("a")), &ev(json!(1)))), ArgKind::Primitive(Primitive::Raw));
        assert_eq!(kind_of(&U::join(&ev(json!(true)), &ev(json!(null)))), ArgKind::Primitive(Primitive::Boolean));
        assert_eq!(kind_of(&ev(json!(null))), ArgKind::Primitive(Primitive::String));
    }

    #[test]
    fn structures_become_lists_and_nested_mappings() {
        let u = U::join(
            &ev(json!([{"port": 80, "proto": "tcp"}])),
            &ev(json!([{"port": 443}])),
        );
        let ArgKind::List(element) = kind_of(&u) else { panic!() };
        let ArgKind::NestedMapping(options) = *element else { panic!() };
        assert_eq!(options.keys().collect::<Vec<_>>(), ["port", "proto"]);
        // present and non-null in every sample, still not required
        assert!(options.values().all(|node| !node.required));
        assert_eq!(options["port"].kind, ArgKind::Primitive(Primitive::Integer));

        assert_eq!(kind_of(&ev(json!({}))), ArgKind::Dict);
        assert_eq!(kind_of(&ev(json!([]))), ArgKind::List(Box::new(ArgKind::Primitive(Primitive::String))));
    }
}
