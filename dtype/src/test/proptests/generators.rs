use crate::*;
use proptest::prelude::*;
use strum::VariantArray;

/// Any supported element type.
pub fn dtype() -> impl Strategy<Value = DType> {
    proptest::sample::select(DType::VARIANTS)
}
