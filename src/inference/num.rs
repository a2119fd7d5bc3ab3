#[derive(Clone, Debug, Default, PartialEq)]
pub struct NumC {
    pub saw_float: bool, // any non-integral literal widens the slot to float
}

impl NumC {
    pub(super) fn int() -> Self {
        Self { saw_float: false }
    }

    pub(super) fn float() -> Self {
        Self { saw_float: true }
    }

    pub(super) fn join(a: &Self, b: &Self) -> Self {
        Self { saw_float: a.saw_float || b.saw_float }
    }
}
