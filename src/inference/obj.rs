use indexmap::IndexMap;

use super::U;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjC {
    pub fields: IndexMap<String, U>, // first-seen order
}

impl ObjC {
    pub(super) fn join(a: &Self, b: &Self) -> Self {
        let mut fields = IndexMap::new();

        // merge keys from a
        for (k, fa) in &a.fields {
            let merged = match b.fields.get(k) {
                None => fa.clone(),
                Some(fb) => U::join(fa, fb),
            };
            fields.insert(k.clone(), merged);
        }
        // add keys only in b
        for (k, fb) in &b.fields {
            if !fields.contains_key(k) {
                fields.insert(k.clone(), fb.clone());
            }
        }

        Self { fields }
    }
}
