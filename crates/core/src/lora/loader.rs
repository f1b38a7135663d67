//! Checkpoint loader abstraction shared by the NeMo and HuggingFace readers.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use thiserror::Error;

use super::hf::HfLoader;
use super::nemo::NemoLoader;
use super::types::{
    AdapterId, AdapterInfo, AuxiliaryWeights, CheckpointSource, LowRankPair, RankTable,
};
use crate::config::ModelConfig;
use crate::distributed::{DistributedError, TensorParallelTopology};

/// Errors that can occur during LoRA loading.
///
/// Every variant is fatal for the load pass; nothing loaded so far is
/// registered.
#[derive(Debug, Error)]
pub enum LoraLoadError {
    #[error("adapter config not found at {0}")]
    ConfigNotFound(String),
    #[error("failed to parse adapter config {path}: {reason}")]
    ConfigParse { path: String, reason: String },
    #[error("adapter weights not found in {0}")]
    WeightsNotFound(String),
    #[error("failed to load weights from {path}: {reason}")]
    WeightsLoad { path: String, reason: String },
    #[error("weight blob not found at {0}")]
    BlobNotFound(String),
    #[error("weight blob {path} holds {actual_bytes} bytes, expected {expected_bytes} for shape {shape:?}")]
    BlobSize {
        path: String,
        shape: Vec<usize>,
        expected_bytes: usize,
        actual_bytes: usize,
    },
    #[error("shape mismatch for {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("missing tensor {0}")]
    MissingTensor(String),
    #[error("cannot partition {context}: {source}")]
    Partition {
        context: String,
        #[source]
        source: DistributedError,
    },
    #[error("unknown module {0}")]
    UnknownModule(String),
    #[error("unsupported dtype {0}")]
    UnsupportedDtype(String),
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// Per-load settings supplied by the hosting runtime.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Device the registered buffers live on.
    pub device: Device,
    /// Execution dtype; `None` uses the model config's dtype.
    pub dtype: Option<DType>,
    /// Element dtype of NeMo raw weight blobs.
    pub blob_dtype: DType,
    /// Must match the topology the execution graph was compiled for.
    pub topology: TensorParallelTopology,
    /// Identity for the single adapter of a HuggingFace checkpoint;
    /// defaults to the checkpoint directory name.
    pub adapter_name: Option<String>,
}

impl LoadOptions {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            dtype: None,
            blob_dtype: DType::BF16,
            topology: TensorParallelTopology::single(),
            adapter_name: None,
        }
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn with_blob_dtype(mut self, dtype: DType) -> Self {
        self.blob_dtype = dtype;
        self
    }

    pub fn with_topology(mut self, topology: TensorParallelTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_adapter_name(mut self, name: impl Into<String>) -> Self {
        self.adapter_name = Some(name.into());
        self
    }

    /// Execution dtype after applying the model default.
    pub fn resolve_dtype(&self, model: &ModelConfig) -> Result<DType, LoraLoadError> {
        match self.dtype {
            Some(dtype) => Ok(dtype),
            None => model.execution_dtype(),
        }
    }

    /// Bring a (possibly sliced) host tensor into its registered form:
    /// upcast to f32, cast to the execution dtype, move to the device.
    pub(crate) fn materialize(&self, tensor: &Tensor, dtype: DType) -> candle_core::Result<Tensor> {
        tensor
            .to_dtype(DType::F32)?
            .to_dtype(dtype)?
            .to_device(&self.device)?
            .contiguous()
    }
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self::new(Device::Cpu)
    }
}

/// One identity produced by a load pass, not yet registered.
#[derive(Debug, Clone)]
pub struct LoadedAdapter {
    pub id: AdapterId,
    pub ranks: RankTable,
    pub pairs: Vec<LowRankPair>,
    pub auxiliary: AuxiliaryWeights,
    pub info: AdapterInfo,
}

impl LoadedAdapter {
    /// The `NoAdapter` identity: rank 0 on every layer, no buffers.
    pub fn sentinel(num_layers: usize) -> Self {
        Self {
            id: AdapterId::NoAdapter,
            ranks: RankTable::zeros(num_layers),
            pairs: Vec::new(),
            auxiliary: AuxiliaryWeights::default(),
            info: AdapterInfo::sentinel(),
        }
    }

    pub fn label(&self) -> Option<&str> {
        self.info.label.as_deref()
    }
}

/// Everything one checkpoint contributes to a registry.
#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    pub source: CheckpointSource,
    pub adapters: Vec<LoadedAdapter>,
}

impl LoadedCheckpoint {
    pub fn ids(&self) -> impl Iterator<Item = &AdapterId> {
        self.adapters.iter().map(|a| &a.id)
    }

    pub fn get(&self, id: &AdapterId) -> Option<&LoadedAdapter> {
        self.adapters.iter().find(|a| &a.id == id)
    }
}

/// Reads one checkpoint convention into a [`LoadedCheckpoint`].
pub trait CheckpointLoader: Send + Sync {
    fn source(&self) -> CheckpointSource;

    fn load(
        &self,
        dir: &Path,
        model: &ModelConfig,
        options: &LoadOptions,
    ) -> Result<LoadedCheckpoint, LoraLoadError>;
}

static NEMO_LOADER: NemoLoader = NemoLoader;
static HF_LOADER: HfLoader = HfLoader;

impl CheckpointSource {
    /// Loader for this convention.
    pub fn loader(self) -> &'static dyn CheckpointLoader {
        match self {
            Self::Nemo => &NEMO_LOADER,
            Self::HuggingFace => &HF_LOADER,
        }
    }
}

/// Read and parse a JSON config file, mapping failures to format errors.
pub(crate) fn read_json_config<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<T, LoraLoadError> {
    if !path.exists() {
        return Err(LoraLoadError::ConfigNotFound(path.display().to_string()));
    }
    let content = std::fs::read_to_string(path).map_err(|source| LoraLoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|e| LoraLoadError::ConfigParse {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_matches_source() {
        for source in [CheckpointSource::Nemo, CheckpointSource::HuggingFace] {
            assert_eq!(source.loader().source(), source);
        }
    }

    #[test]
    fn options_dtype_falls_back_to_model() {
        let model = ModelConfig {
            dtype: "float16".to_string(),
            ..ModelConfig::default()
        };
        let options = LoadOptions::default();
        assert_eq!(options.resolve_dtype(&model).unwrap(), DType::F16);

        let options = options.with_dtype(DType::F32);
        assert_eq!(options.resolve_dtype(&model).unwrap(), DType::F32);
    }

    #[test]
    fn materialize_casts_and_is_contiguous() {
        let options = LoadOptions::default();
        let t = Tensor::ones((4, 2), DType::F32, &Device::Cpu)
            .unwrap()
            .t()
            .unwrap();
        let m = options.materialize(&t, DType::BF16).unwrap();
        assert_eq!(m.dtype(), DType::BF16);
        assert_eq!(m.dims(), &[2, 4]);
        assert!(m.is_contiguous());
    }

    #[test]
    fn sentinel_has_no_buffers() {
        let sentinel = LoadedAdapter::sentinel(3);
        assert!(sentinel.id.is_sentinel());
        assert!(sentinel.pairs.is_empty());
        assert_eq!(sentinel.ranks.num_layers(), 3);
        assert!(sentinel.ranks.is_zero());
        assert!(sentinel.label().is_none());
    }

    #[test]
    fn missing_config_is_format_error() {
        let result: Result<serde_json::Value, _> =
            read_json_config(Path::new("/nonexistent/adapter_config.json"));
        assert!(matches!(result, Err(LoraLoadError::ConfigNotFound(_))));
    }

    #[test]
    fn partition_error_display_names_context() {
        let err = LoraLoadError::Partition {
            context: "layer 3 attn_dense input".to_string(),
            source: DistributedError::NotDivisible {
                axis: 1,
                shape: vec![8, 10],
                tp_size: 4,
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("layer 3 attn_dense input"));
        assert!(msg.contains("not divisible by tp_size 4"));
    }
}
