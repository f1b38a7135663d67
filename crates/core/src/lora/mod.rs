//! LoRA (Low-Rank Adaptation) weight management.
//!
//! Reads adapter checkpoints in the NeMo and HuggingFace PEFT conventions,
//! shards them for tensor parallelism and keeps them in a registry that
//! hands the execution engine per-layer ranks and raw buffer addresses.

mod buffers;
mod hf;
mod loader;
mod nemo;
mod registry;
mod types;

pub use buffers::{device_address, BufferHandle, WeightBufferSet};
pub use hf::{
    tensor_key, HfLoader, HF_CONFIG_FILE, HF_PICKLE_FILE, HF_SAFETENSORS_FILE,
    HF_TOKENIZER_CONFIG_FILE,
};
pub use loader::{CheckpointLoader, LoadOptions, LoadedAdapter, LoadedCheckpoint, LoraLoadError};
pub use nemo::{blob_prefix, NemoAdapterEntry, NemoLoader, NemoLoraConfig, NEMO_CONFIG_FILE};
pub use registry::{LayerPointers, LoraRegistry, PointerEntry, PointerPair, RegistryError};
pub use types::{
    AdapterId, AdapterInfo, AuxiliaryWeights, CheckpointSource, LayerRanks, LoraConfig,
    LowRankPair, ModuleRole, RankTable,
};
