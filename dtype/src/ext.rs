use super::*;

pub trait HasDType {
    const DTYPE: DType;
}

/// A Rust scalar that can be stored in device memory.
///
/// `Pod` guarantees that any byte pattern is a valid value, so a replica's bytes
/// can be viewed as `[Self]` once size and alignment have been checked.
pub trait Element: HasDType + bytemuck::Pod + Send + Sync + std::fmt::Debug {}

impl<T> Element for T where T: HasDType + bytemuck::Pod + Send + Sync + std::fmt::Debug {}

macro_rules! impl_dtype_ext {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(impl HasDType for $ty { const DTYPE: DType = $dtype; })*
    };
}

impl_dtype_ext! {
    i8 => DType::Int8, i16 => DType::Int16, i32 => DType::Int32, i64 => DType::Int64,
    u8 => DType::UInt8, u16 => DType::UInt16, u32 => DType::UInt32, u64 => DType::UInt64,
    f32 => DType::Float32, f64 => DType::Float64,
}
