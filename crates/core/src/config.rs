use candle_core::DType;
use serde::Deserialize;

use crate::dtype::parse_dtype;
use crate::lora::{LoraLoadError, ModuleRole};

/// Shape of the compiled model the adapters are loaded for.
///
/// Only the fields the adapter loaders need: layer count, the projection
/// widths that size the low-rank matrices, the execution dtype and the set
/// of engine modules that accept a LoRA update.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub num_layers: usize,
    pub hidden_size: usize,
    #[serde(default)]
    pub intermediate_size: usize,
    #[serde(default = "default_dtype")]
    pub dtype: String,
    /// Engine module names, e.g. `attn_q`, `attn_dense`, `mlp_4h_to_h`.
    pub lora_target_modules: Vec<String>,
}

fn default_dtype() -> String {
    "bfloat16".to_string()
}

impl ModelConfig {
    /// Parse `lora_target_modules` into roles, preserving config order.
    pub fn roles(&self) -> Result<Vec<ModuleRole>, LoraLoadError> {
        let mut roles = Vec::with_capacity(self.lora_target_modules.len());
        for name in &self.lora_target_modules {
            let role = ModuleRole::from_engine_name(name)
                .ok_or_else(|| LoraLoadError::UnknownModule(name.clone()))?;
            if !roles.contains(&role) {
                roles.push(role);
            }
        }
        Ok(roles)
    }

    pub fn execution_dtype(&self) -> Result<DType, LoraLoadError> {
        parse_dtype(&self.dtype).ok_or_else(|| LoraLoadError::UnsupportedDtype(self.dtype.clone()))
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_layers: 32,
            hidden_size: 4096,
            intermediate_size: 11008,
            dtype: default_dtype(),
            lora_target_modules: vec![
                "attn_q".to_string(),
                "attn_k".to_string(),
                "attn_v".to_string(),
                "attn_dense".to_string(),
                "mlp_h_to_4h".to_string(),
                "mlp_gate".to_string(),
                "mlp_4h_to_h".to_string(),
            ],
        }
    }
}
