//! LoRA adapter loading from HuggingFace PEFT checkpoints.
//!
//! Loads adapters from directories containing:
//! - `adapter_config.json`: PEFT configuration
//! - `adapter_model.safetensors` or `adapter_model.bin`: Weights
//!
//! Weight names follow
//! `base_model.model.model.layers.{i}.{self_attn|mlp}.{proj}.lora_{A|B}.weight`
//! with `lora_A: [r, in]` and `lora_B: [out, r]`, which is already the
//! engine layout, so no transpose is needed. Slicing for tensor
//! parallelism happens on the host in the checkpoint dtype, before the
//! cast and device transfer.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};

use super::loader::{
    read_json_config, CheckpointLoader, LoadOptions, LoadedAdapter, LoadedCheckpoint,
    LoraLoadError,
};
use super::types::{
    AdapterId, AdapterInfo, AuxiliaryWeights, CheckpointSource, LoraConfig, LowRankPair,
    ModuleRole, RankTable,
};
use crate::config::ModelConfig;

pub const HF_CONFIG_FILE: &str = "adapter_config.json";
pub const HF_SAFETENSORS_FILE: &str = "adapter_model.safetensors";
pub const HF_PICKLE_FILE: &str = "adapter_model.bin";
pub const HF_TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";

const LAYER_PREFIX: &str = "base_model.model.model.layers";
const LM_HEAD_KEY: &str = "base_model.model.lm_head.weight";
const EMBED_TOKENS_KEY: &str = "base_model.model.model.embed_tokens.weight";

/// Weight name of one LoRA matrix; `matrix` is `lora_A` or `lora_B`.
pub fn tensor_key(layer: usize, role: ModuleRole, matrix: &str) -> Option<String> {
    let module = role.hf_module()?;
    Some(format!(
        "{LAYER_PREFIX}.{layer}.{}.{module}.{matrix}.weight",
        role.hf_parent()
    ))
}

/// Loader for HuggingFace PEFT checkpoints.
///
/// Produces the sentinel plus exactly one adapter; PEFT directories hold a
/// single adapter each.
#[derive(Debug, Clone, Copy, Default)]
pub struct HfLoader;

impl HfLoader {
    /// Load adapter_config.json.
    pub fn load_config(dir: &Path) -> Result<LoraConfig, LoraLoadError> {
        read_json_config(&dir.join(HF_CONFIG_FILE))
    }

    /// Load tokenizer_config.json if the adapter ships one.
    pub fn load_tokenizer_config(dir: &Path) -> Result<Option<serde_json::Value>, LoraLoadError> {
        let path = dir.join(HF_TOKENIZER_CONFIG_FILE);
        if !path.exists() {
            tracing::debug!(path = %path.display(), "adapter has no tokenizer config");
            return Ok(None);
        }
        read_json_config(&path).map(Some)
    }

    /// Load weights from safetensors or bin format, on the host.
    fn load_weights(dir: &Path) -> Result<HashMap<String, Tensor>, LoraLoadError> {
        // Try safetensors first
        let safetensors_path = dir.join(HF_SAFETENSORS_FILE);
        if safetensors_path.exists() {
            return candle_core::safetensors::load(&safetensors_path, &Device::Cpu).map_err(|e| {
                LoraLoadError::WeightsLoad {
                    path: safetensors_path.display().to_string(),
                    reason: e.to_string(),
                }
            });
        }

        // Fall back to bin format
        let bin_path = dir.join(HF_PICKLE_FILE);
        if bin_path.exists() {
            let tensors = candle_core::pickle::read_all(&bin_path).map_err(|e| {
                LoraLoadError::WeightsLoad {
                    path: bin_path.display().to_string(),
                    reason: e.to_string(),
                }
            })?;
            return Ok(tensors.into_iter().collect());
        }

        Err(LoraLoadError::WeightsNotFound(dir.display().to_string()))
    }

    /// Roles the model exposes that the adapter was also trained for.
    fn targeted_roles(
        config: &LoraConfig,
        model_roles: &[ModuleRole],
    ) -> Result<Vec<ModuleRole>, LoraLoadError> {
        let mut adapter_roles = Vec::with_capacity(config.target_modules.len());
        for name in &config.target_modules {
            let role = ModuleRole::from_hf_module(name)
                .ok_or_else(|| LoraLoadError::UnknownModule(name.clone()))?;
            if !model_roles.contains(&role) {
                tracing::debug!(
                    module = %name,
                    "adapter targets a module the model does not expose"
                );
            }
            adapter_roles.push(role);
        }
        Ok(model_roles
            .iter()
            .copied()
            .filter(|r| adapter_roles.contains(r))
            .collect())
    }

    fn fetch<'a>(
        weights: &'a HashMap<String, Tensor>,
        key: &str,
    ) -> Result<&'a Tensor, LoraLoadError> {
        weights
            .get(key)
            .ok_or_else(|| LoraLoadError::MissingTensor(key.to_string()))
    }

    /// Check `lora_A: [r, in]` and `lora_B: [out, r]`.
    fn check_pair(
        layer: usize,
        role: ModuleRole,
        rank: usize,
        input: &Tensor,
        output: &Tensor,
    ) -> Result<(), LoraLoadError> {
        let a = input.dims();
        if a.len() != 2 || a[0] != rank {
            return Err(LoraLoadError::ShapeMismatch {
                context: format!("layer {layer} {role} lora_A"),
                expected: vec![rank, a.get(1).copied().unwrap_or(0)],
                actual: a.to_vec(),
            });
        }
        let b = output.dims();
        if b.len() != 2 || b[1] != rank {
            return Err(LoraLoadError::ShapeMismatch {
                context: format!("layer {layer} {role} lora_B"),
                expected: vec![b.first().copied().unwrap_or(0), rank],
                actual: b.to_vec(),
            });
        }
        Ok(())
    }

    fn load_auxiliary(
        config: &LoraConfig,
        weights: &HashMap<String, Tensor>,
        options: &LoadOptions,
        dtype: DType,
    ) -> Result<AuxiliaryWeights, LoraLoadError> {
        let mut auxiliary = AuxiliaryWeights::default();
        if config.saves_module("lm_head") {
            let t = Self::fetch(weights, LM_HEAD_KEY)?;
            auxiliary.lm_head = Some(options.materialize(t, dtype)?);
        }
        if config.saves_module("embed_tokens") {
            let t = Self::fetch(weights, EMBED_TOKENS_KEY)?;
            auxiliary.embedding = Some(options.materialize(t, dtype)?);
        }
        Ok(auxiliary)
    }
}

impl CheckpointLoader for HfLoader {
    fn source(&self) -> CheckpointSource {
        CheckpointSource::HuggingFace
    }

    fn load(
        &self,
        dir: &Path,
        model: &ModelConfig,
        options: &LoadOptions,
    ) -> Result<LoadedCheckpoint, LoraLoadError> {
        let config = Self::load_config(dir)?;
        let tokenizer_config = Self::load_tokenizer_config(dir)?;
        let weights = Self::load_weights(dir)?;
        let dtype = options.resolve_dtype(model)?;
        let topology = &options.topology;
        let rank = config.r;

        let roles = if rank == 0 {
            tracing::warn!(path = %dir.display(), "adapter declares r = 0; no modules customized");
            Vec::new()
        } else {
            Self::targeted_roles(&config, &model.roles()?)?
        };

        let mut pairs = Vec::with_capacity(model.num_layers * roles.len());
        for layer in 0..model.num_layers {
            for &role in &roles {
                let (Some(a_key), Some(b_key)) = (
                    tensor_key(layer, role, "lora_A"),
                    tensor_key(layer, role, "lora_B"),
                ) else {
                    continue;
                };
                let input = Self::fetch(&weights, &a_key)?;
                let output = Self::fetch(&weights, &b_key)?;
                Self::check_pair(layer, role, rank, input, output)?;

                let (input, output) = role
                    .partition_rule()
                    .apply(input, output, topology)
                    .map_err(|source| LoraLoadError::Partition {
                        context: format!("layer {layer} {role}"),
                        source,
                    })?;

                pairs.push(LowRankPair {
                    layer_index: layer,
                    role,
                    input: options.materialize(&input, dtype)?,
                    output: options.materialize(&output, dtype)?,
                });
            }
            tracing::debug!(layer, modules = roles.len(), "loaded HuggingFace LoRA layer");
        }

        let auxiliary = Self::load_auxiliary(&config, &weights, options, dtype)?;

        let name = options
            .adapter_name
            .clone()
            .or_else(|| dir.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "0".to_string());

        // Pairs are only built for targeted roles, so the table stays in
        // step with them.
        let adapter = LoadedAdapter {
            id: AdapterId::named(name.clone()),
            ranks: RankTable::uniform(model.num_layers, &roles, rank),
            pairs,
            auxiliary,
            info: AdapterInfo {
                label: Some(name),
                source: Some(CheckpointSource::HuggingFace),
                declared_rank: rank,
                scaling: Some(config.scaling()),
                tokenizer_config,
            },
        };

        tracing::info!(
            path = %dir.display(),
            adapter = %adapter.id,
            rank,
            modules = roles.len(),
            tp_rank = topology.tp_rank(),
            tp_size = topology.tp_size(),
            "loaded HuggingFace LoRA checkpoint"
        );

        Ok(LoadedCheckpoint {
            source: CheckpointSource::HuggingFace,
            adapters: vec![LoadedAdapter::sentinel(model.num_layers), adapter],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_keys_follow_peft_layout() {
        assert_eq!(
            tensor_key(0, ModuleRole::AttnQ, "lora_A").unwrap(),
            "base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight"
        );
        assert_eq!(
            tensor_key(5, ModuleRole::MlpGate, "lora_B").unwrap(),
            "base_model.model.model.layers.5.mlp.up_proj.lora_B.weight"
        );
        assert_eq!(
            tensor_key(1, ModuleRole::Mlp4hToH, "lora_A").unwrap(),
            "base_model.model.model.layers.1.mlp.down_proj.lora_A.weight"
        );
        assert!(tensor_key(0, ModuleRole::AttnQkv, "lora_A").is_none());
    }

    #[test]
    fn targeted_roles_intersect_model_set() {
        let config: LoraConfig = serde_json::from_str(
            r#"{"r": 8, "target_modules": ["q_proj", "v_proj", "down_proj"]}"#,
        )
        .unwrap();
        let model_roles = [ModuleRole::AttnQ, ModuleRole::AttnK, ModuleRole::AttnV];
        let roles = HfLoader::targeted_roles(&config, &model_roles).unwrap();
        assert_eq!(roles, vec![ModuleRole::AttnQ, ModuleRole::AttnV]);
    }

    #[test]
    fn unknown_target_module_is_rejected() {
        let config: LoraConfig =
            serde_json::from_str(r#"{"r": 8, "target_modules": ["q_proj", "c_attn"]}"#).unwrap();
        match HfLoader::targeted_roles(&config, &ModuleRole::ALL) {
            Err(LoraLoadError::UnknownModule(name)) => assert_eq!(name, "c_attn"),
            other => panic!("expected UnknownModule, got {other:?}"),
        }
    }

    #[test]
    fn check_pair_rejects_rank_mismatch() {
        let a = Tensor::zeros((4, 16), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((16, 8), DType::F32, &Device::Cpu).unwrap();
        match HfLoader::check_pair(2, ModuleRole::AttnV, 8, &a, &b) {
            Err(LoraLoadError::ShapeMismatch {
                context,
                expected,
                actual,
            }) => {
                assert_eq!(context, "layer 2 attn_v lora_A");
                assert_eq!(expected, vec![8, 16]);
                assert_eq!(actual, vec![4, 16]);
            }
            other => panic!("expected ShapeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn missing_weights_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            HfLoader::load_weights(dir.path()),
            Err(LoraLoadError::WeightsNotFound(_))
        ));
    }

    #[test]
    fn tokenizer_config_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(HfLoader::load_tokenizer_config(dir.path()).unwrap(), None);

        std::fs::write(
            dir.path().join(HF_TOKENIZER_CONFIG_FILE),
            r#"{"model_max_length": 4096, "pad_token": "<unk>"}"#,
        )
        .unwrap();
        let config = HfLoader::load_tokenizer_config(dir.path()).unwrap().unwrap();
        assert_eq!(config["model_max_length"], 4096);

        std::fs::write(dir.path().join(HF_TOKENIZER_CONFIG_FILE), "{").unwrap();
        assert!(matches!(
            HfLoader::load_tokenizer_config(dir.path()),
            Err(LoraLoadError::ConfigParse { .. })
        ));
    }

    #[test]
    fn missing_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = HfLoader.load(
            dir.path(),
            &ModelConfig::default(),
            &LoadOptions::default(),
        );
        assert!(matches!(result, Err(LoraLoadError::ConfigNotFound(_))));
    }
}
