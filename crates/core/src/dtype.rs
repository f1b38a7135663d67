//! Dtype name bridge.
//!
//! Checkpoint configs and model configs name element types with strings
//! (`"bfloat16"`, `"fp16"`, ...). Everything past the config boundary works
//! with [`candle_core::DType`].

use candle_core::DType;

/// Parse a dtype name as found in model and checkpoint configs.
///
/// Returns `None` for names this crate does not load adapters in.
pub fn parse_dtype(name: &str) -> Option<DType> {
    match name.to_lowercase().as_str() {
        "bf16" | "bfloat16" => Some(DType::BF16),
        "fp16" | "f16" | "float16" | "half" => Some(DType::F16),
        "fp32" | "f32" | "float32" | "float" => Some(DType::F32),
        _ => None,
    }
}

/// Canonical config name for a dtype.
pub fn dtype_name(dtype: DType) -> &'static str {
    match dtype {
        DType::BF16 => "bfloat16",
        DType::F16 => "float16",
        DType::F32 => "float32",
        DType::F64 => "float64",
        DType::U8 => "uint8",
        DType::U32 => "uint32",
        DType::I64 => "int64",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_long_and_short_names() {
        assert_eq!(parse_dtype("bfloat16"), Some(DType::BF16));
        assert_eq!(parse_dtype("bf16"), Some(DType::BF16));
        assert_eq!(parse_dtype("float16"), Some(DType::F16));
        assert_eq!(parse_dtype("half"), Some(DType::F16));
        assert_eq!(parse_dtype("FP32"), Some(DType::F32));
    }

    #[test]
    fn rejects_unsupported_names() {
        assert_eq!(parse_dtype("int8"), None);
        assert_eq!(parse_dtype("auto"), None);
        assert_eq!(parse_dtype(""), None);
    }

    #[test]
    fn name_round_trips_for_load_dtypes() {
        for dtype in [DType::BF16, DType::F16, DType::F32] {
            assert_eq!(parse_dtype(dtype_name(dtype)), Some(dtype));
        }
    }
}
