//! LoRA adapter loading from NeMo checkpoints.
//!
//! Expected directory structure:
//! ```text
//! ckpt_dir/
//!   lora_weights.json
//!   model.model.language_model.encoder.layers.{i}.self_attention.adapter_layer.lora_kqv_adapter.{key}.linear_in.weight.bin
//!   model.model.language_model.encoder.layers.{i}.self_attention.adapter_layer.lora_kqv_adapter.{key}.linear_out.weight.bin
//!   ...
//! ```
//!
//! Blobs are raw little-endian arrays stored transposed relative to the
//! engine layout: `linear_in` is `[hidden, r]`, `linear_out` is
//! `[r, 3 * hidden]`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use serde::Deserialize;

use super::loader::{
    read_json_config, CheckpointLoader, LoadOptions, LoadedAdapter, LoadedCheckpoint,
    LoraLoadError,
};
use super::types::{AdapterId, AdapterInfo, CheckpointSource, LowRankPair, RankTable};
use crate::config::ModelConfig;

pub const NEMO_CONFIG_FILE: &str = "lora_weights.json";

#[derive(Debug, Deserialize)]
struct NemoWeightsFile {
    lora_config: NemoLoraConfig,
}

/// `lora_config` section of `lora_weights.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct NemoLoraConfig {
    /// Adapters keyed by the name their blobs are stored under.
    pub lora_kqv_adapter: BTreeMap<String, NemoAdapterEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NemoAdapterEntry {
    /// Identity the adapter is served under.
    pub key: String,
    #[serde(deserialize_with = "int_or_string")]
    pub low_rank: usize,
}

// Exporters write `low_rank` either as a number or as a numeric string.
fn int_or_string<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(usize),
        Str(String),
    }

    match IntOrString::deserialize(deserializer)? {
        IntOrString::Int(v) => Ok(v),
        IntOrString::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

impl NemoLoraConfig {
    /// Read `lora_weights.json` from a checkpoint directory.
    pub fn from_dir(dir: &Path) -> Result<Self, LoraLoadError> {
        let path = dir.join(NEMO_CONFIG_FILE);
        let file: NemoWeightsFile = read_json_config(&path)?;
        let config = file.lora_config;

        let mut seen: HashMap<&str, &str> = HashMap::new();
        for (label, entry) in &config.lora_kqv_adapter {
            if let Some(other) = seen.insert(entry.key.as_str(), label.as_str()) {
                return Err(LoraLoadError::ConfigParse {
                    path: path.display().to_string(),
                    reason: format!(
                        "adapter identity '{}' declared by both '{other}' and '{label}'",
                        entry.key
                    ),
                });
            }
        }
        Ok(config)
    }
}

/// Blob path prefix for one adapter on one layer.
pub fn blob_prefix(layer: usize, label: &str) -> String {
    format!(
        "model.model.language_model.encoder.layers.{layer}.self_attention.adapter_layer.lora_kqv_adapter.{label}"
    )
}

/// Byte length of a `[rows, cols]` blob, `None` on overflow.
fn blob_bytes(shape: (usize, usize), dtype: DType) -> Option<usize> {
    shape.0.checked_mul(shape.1)?.checked_mul(dtype.size_in_bytes())
}

/// Loader for NeMo `lora_kqv_adapter` checkpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct NemoLoader;

impl NemoLoader {
    /// Read one raw blob as a `[rows, cols]` host tensor.
    fn read_blob(
        path: &Path,
        shape: (usize, usize),
        dtype: DType,
    ) -> Result<Tensor, LoraLoadError> {
        if !path.exists() {
            return Err(LoraLoadError::BlobNotFound(path.display().to_string()));
        }
        let bytes = std::fs::read(path).map_err(|source| LoraLoadError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let expected_bytes =
            blob_bytes(shape, dtype).ok_or_else(|| LoraLoadError::ShapeMismatch {
                context: path.display().to_string(),
                expected: vec![shape.0, shape.1],
                actual: vec![bytes.len()],
            })?;
        if bytes.len() != expected_bytes {
            return Err(LoraLoadError::BlobSize {
                path: path.display().to_string(),
                shape: vec![shape.0, shape.1],
                expected_bytes,
                actual_bytes: bytes.len(),
            });
        }

        Ok(Tensor::from_raw_buffer(
            &bytes,
            dtype,
            &[shape.0, shape.1],
            &Device::Cpu,
        )?)
    }

    fn blob_path(dir: &Path, layer: usize, label: &str, matrix: &str) -> PathBuf {
        dir.join(format!("{}.{matrix}.weight.bin", blob_prefix(layer, label)))
    }

    /// `linear_in` and `linear_out` blob shapes for one adapter, rejecting
    /// ranks whose blobs could not be addressed.
    fn blob_shapes(
        dir: &Path,
        entry: &NemoAdapterEntry,
        hidden: usize,
        dtype: DType,
    ) -> Result<((usize, usize), (usize, usize)), LoraLoadError> {
        let rank = entry.low_rank;
        hidden
            .checked_mul(3)
            .map(|cols| ((hidden, rank), (rank, cols)))
            .filter(|&(input, output)| {
                blob_bytes(input, dtype).is_some() && blob_bytes(output, dtype).is_some()
            })
            .ok_or_else(|| LoraLoadError::ConfigParse {
                path: dir.join(NEMO_CONFIG_FILE).display().to_string(),
                reason: format!(
                    "adapter '{}' low_rank {rank} overflows its blob size (hidden {hidden})",
                    entry.key
                ),
            })
    }
}

impl CheckpointLoader for NemoLoader {
    fn source(&self) -> CheckpointSource {
        CheckpointSource::Nemo
    }

    fn load(
        &self,
        dir: &Path,
        model: &ModelConfig,
        options: &LoadOptions,
    ) -> Result<LoadedCheckpoint, LoraLoadError> {
        let config = NemoLoraConfig::from_dir(dir)?;
        let roles = model.roles()?;
        let dtype = options.resolve_dtype(model)?;
        let hidden = model.hidden_size;

        if !options.topology.is_single() {
            tracing::warn!(
                tp_size = options.topology.tp_size(),
                "NeMo kqv adapters are replicated on every rank, not sharded"
            );
        }

        let mut adapters = Vec::with_capacity(config.lora_kqv_adapter.len() + 1);
        for (label, entry) in &config.lora_kqv_adapter {
            let rank = entry.low_rank;
            let mut pairs = Vec::new();

            if rank > 0 {
                let (in_shape, out_shape) =
                    Self::blob_shapes(dir, entry, hidden, options.blob_dtype)?;
                for layer in 0..model.num_layers {
                    let in_path = Self::blob_path(dir, layer, label, "linear_in");
                    let out_path = Self::blob_path(dir, layer, label, "linear_out");

                    // [hidden, r] -> [r, hidden]
                    let input = Self::read_blob(&in_path, in_shape, options.blob_dtype)?.t()?;
                    // [r, 3 * hidden] -> [3 * hidden, r]
                    let output = Self::read_blob(&out_path, out_shape, options.blob_dtype)?.t()?;

                    let input = options.materialize(&input, dtype)?;
                    let output = options.materialize(&output, dtype)?;

                    // One fused kqv update serves every targeted module.
                    for &role in &roles {
                        pairs.push(LowRankPair {
                            layer_index: layer,
                            role,
                            input: input.clone(),
                            output: output.clone(),
                        });
                    }
                    tracing::debug!(layer, adapter = %entry.key, rank, "loaded NeMo LoRA layer");
                }
            }

            adapters.push(LoadedAdapter {
                id: AdapterId::named(entry.key.clone()),
                ranks: RankTable::uniform(model.num_layers, &roles, rank),
                pairs,
                auxiliary: Default::default(),
                info: AdapterInfo {
                    label: Some(label.clone()),
                    source: Some(CheckpointSource::Nemo),
                    declared_rank: rank,
                    scaling: None,
                    tokenizer_config: None,
                },
            });
        }

        adapters.push(LoadedAdapter::sentinel(model.num_layers));

        tracing::info!(
            path = %dir.display(),
            adapters = adapters.len() - 1,
            "loaded NeMo LoRA checkpoint"
        );

        Ok(LoadedCheckpoint {
            source: CheckpointSource::Nemo,
            adapters,
        })
    }
}
