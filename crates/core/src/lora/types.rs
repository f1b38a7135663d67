//! LoRA types and data structures.

use std::fmt;

use candle_core::Tensor;
use serde::Deserialize;

use crate::distributed::{ParallelStyle, PartitionRule};

/// Identity of a registered adapter.
///
/// `NoAdapter` is the sentinel every registry carries for requests that do
/// not apply a LoRA update; it has rank 0 for every layer and module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AdapterId {
    NoAdapter,
    Named(String),
}

impl AdapterId {
    /// Wire value older engines use for the sentinel.
    pub const LEGACY_SENTINEL: &'static str = "-1";

    /// A regular adapter identity. Never produces the sentinel, whatever
    /// the name.
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    /// Parse an identity coming from a request, mapping the legacy `"-1"`
    /// to [`AdapterId::NoAdapter`].
    pub fn parse(value: &str) -> Self {
        if value == Self::LEGACY_SENTINEL {
            Self::NoAdapter
        } else {
            Self::Named(value.to_string())
        }
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self, Self::NoAdapter)
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::NoAdapter => None,
            Self::Named(name) => Some(name),
        }
    }
}

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAdapter => write!(f, "<no adapter>"),
            Self::Named(name) => write!(f, "{name}"),
        }
    }
}

/// Linear sublayer of an execution layer that can take a LoRA update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModuleRole {
    /// Fused query/key/value projection.
    AttnQkv,
    AttnQ,
    AttnK,
    AttnV,
    /// Attention output projection.
    AttnDense,
    /// Gate projection of the gated MLP.
    MlpHTo4h,
    /// Up projection of the gated MLP.
    MlpGate,
    /// Down projection.
    Mlp4hToH,
}

impl ModuleRole {
    pub const COUNT: usize = 8;

    pub const ALL: [ModuleRole; Self::COUNT] = [
        Self::AttnQkv,
        Self::AttnQ,
        Self::AttnK,
        Self::AttnV,
        Self::AttnDense,
        Self::MlpHTo4h,
        Self::MlpGate,
        Self::Mlp4hToH,
    ];

    /// Dense index into per-role arrays.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Name used by the execution engine's module list.
    pub fn engine_name(self) -> &'static str {
        match self {
            Self::AttnQkv => "attn_qkv",
            Self::AttnQ => "attn_q",
            Self::AttnK => "attn_k",
            Self::AttnV => "attn_v",
            Self::AttnDense => "attn_dense",
            Self::MlpHTo4h => "mlp_h_to_4h",
            Self::MlpGate => "mlp_gate",
            Self::Mlp4hToH => "mlp_4h_to_h",
        }
    }

    pub fn from_engine_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.engine_name() == name)
    }

    /// HuggingFace module name (`q_proj`, `down_proj`, ...). The fused QKV
    /// projection has no HuggingFace counterpart.
    pub fn hf_module(self) -> Option<&'static str> {
        match self {
            Self::AttnQkv => None,
            Self::AttnQ => Some("q_proj"),
            Self::AttnK => Some("k_proj"),
            Self::AttnV => Some("v_proj"),
            Self::AttnDense => Some("o_proj"),
            Self::MlpHTo4h => Some("gate_proj"),
            Self::MlpGate => Some("up_proj"),
            Self::Mlp4hToH => Some("down_proj"),
        }
    }

    pub fn from_hf_module(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.hf_module() == Some(name))
    }

    /// Parent submodule in HuggingFace weight names.
    pub fn hf_parent(self) -> &'static str {
        match self {
            Self::AttnQkv | Self::AttnQ | Self::AttnK | Self::AttnV | Self::AttnDense => {
                "self_attn"
            }
            Self::MlpHTo4h | Self::MlpGate | Self::Mlp4hToH => "mlp",
        }
    }

    pub fn parallel_style(self) -> ParallelStyle {
        match self {
            Self::AttnDense | Self::Mlp4hToH => ParallelStyle::Row,
            _ => ParallelStyle::Column,
        }
    }

    pub fn partition_rule(self) -> PartitionRule {
        PartitionRule::for_style(self.parallel_style())
    }
}

impl fmt::Display for ModuleRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.engine_name())
    }
}

/// One rank-`r` update for an (adapter, layer, module) triple.
///
/// - input: `[rank, input_dim]` (or its tensor-parallel shard)
/// - output: `[output_dim, rank]` (or its tensor-parallel shard)
#[derive(Debug, Clone)]
pub struct LowRankPair {
    pub layer_index: usize,
    pub role: ModuleRole,
    pub input: Tensor,
    pub output: Tensor,
}

impl LowRankPair {
    pub fn rank(&self) -> usize {
        self.input.dims().first().copied().unwrap_or(0)
    }
}

/// Ranks of every module for one execution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerRanks {
    pub layer_index: usize,
    ranks: [usize; ModuleRole::COUNT],
}

impl LayerRanks {
    pub fn new(layer_index: usize) -> Self {
        Self {
            layer_index,
            ranks: [0; ModuleRole::COUNT],
        }
    }

    pub fn get(&self, role: ModuleRole) -> usize {
        self.ranks[role.index()]
    }

    pub fn set(&mut self, role: ModuleRole, rank: usize) {
        self.ranks[role.index()] = rank;
    }

    /// Roles with a non-zero rank.
    pub fn active(&self) -> impl Iterator<Item = (ModuleRole, usize)> + '_ {
        ModuleRole::ALL
            .into_iter()
            .map(|role| (role, self.get(role)))
            .filter(|&(_, rank)| rank > 0)
    }

    pub fn is_zero(&self) -> bool {
        self.ranks.iter().all(|&r| r == 0)
    }
}

/// Per-layer module ranks of one adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankTable {
    layers: Vec<LayerRanks>,
}

impl RankTable {
    /// All-zero table, the shape of the sentinel.
    pub fn zeros(num_layers: usize) -> Self {
        Self {
            layers: (0..num_layers).map(LayerRanks::new).collect(),
        }
    }

    /// Same rank for `roles` on every layer, zero elsewhere.
    pub fn uniform(num_layers: usize, roles: &[ModuleRole], rank: usize) -> Self {
        let mut table = Self::zeros(num_layers);
        for layer in &mut table.layers {
            for &role in roles {
                layer.set(role, rank);
            }
        }
        table
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, layer: usize) -> Option<&LayerRanks> {
        self.layers.get(layer)
    }

    pub fn rank(&self, layer: usize, role: ModuleRole) -> Option<usize> {
        self.layers.get(layer).map(|l| l.get(role))
    }

    /// Set a rank. Returns false if `layer` is out of range.
    pub fn set(&mut self, layer: usize, role: ModuleRole, rank: usize) -> bool {
        match self.layers.get_mut(layer) {
            Some(l) => {
                l.set(role, rank);
                true
            }
            None => false,
        }
    }

    pub fn layers(&self) -> &[LayerRanks] {
        &self.layers
    }

    pub fn max_rank(&self) -> usize {
        self.layers
            .iter()
            .flat_map(|l| l.ranks.iter().copied())
            .max()
            .unwrap_or(0)
    }

    pub fn is_zero(&self) -> bool {
        self.layers.iter().all(LayerRanks::is_zero)
    }
}

/// Checkpoint conventions the loaders understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointSource {
    /// NeMo: `lora_weights.json` plus per-layer raw weight blobs.
    Nemo,
    /// HuggingFace PEFT: `adapter_config.json` plus one weight-state file.
    HuggingFace,
}

impl CheckpointSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nemo => "nemo",
            Self::HuggingFace => "hf",
        }
    }
}

impl fmt::Display for CheckpointSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CheckpointSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nemo" => Ok(Self::Nemo),
            "hf" | "huggingface" | "peft" => Ok(Self::HuggingFace),
            other => Err(format!(
                "unknown checkpoint source '{other}'; supported: nemo, hf"
            )),
        }
    }
}

/// Configuration from adapter_config.json (PEFT format).
#[derive(Debug, Clone, Deserialize)]
pub struct LoraConfig {
    /// LoRA rank (r parameter).
    pub r: usize,
    /// Scaling parameter (alpha). Absent in some exported configs.
    #[serde(default)]
    pub lora_alpha: Option<f32>,
    /// Which modules to apply LoRA to.
    pub target_modules: Vec<String>,
    /// Dropout probability (not used at inference).
    #[serde(default)]
    pub lora_dropout: f32,
    /// Bias handling: "none", "all", "lora_only".
    #[serde(default = "default_bias")]
    pub bias: String,
    /// Use rank-stabilized LoRA scaling.
    #[serde(default)]
    pub use_rslora: bool,
    /// Full weights shipped alongside the adapter (`lm_head`, `embed_tokens`).
    #[serde(default)]
    pub modules_to_save: Option<Vec<String>>,
    /// Base model name/path for validation.
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
}

fn default_bias() -> String {
    "none".to_string()
}

impl LoraConfig {
    /// Compute the scaling factor for LoRA.
    ///
    /// For standard LoRA: scale = alpha / rank
    /// For rsLoRA: scale = alpha / sqrt(rank)
    ///
    /// A missing alpha means the checkpoint was exported with the scale
    /// already folded in.
    pub fn scaling(&self) -> f32 {
        let Some(alpha) = self.lora_alpha else {
            return 1.0;
        };
        if self.r == 0 {
            return 0.0;
        }
        if self.use_rslora {
            alpha / (self.r as f32).sqrt()
        } else {
            alpha / self.r as f32
        }
    }

    pub fn saves_module(&self, name: &str) -> bool {
        self.modules_to_save
            .as_ref()
            .is_some_and(|m| m.iter().any(|s| s == name))
    }
}

/// Full-weight overrides an adapter ships next to its low-rank pairs.
#[derive(Debug, Clone, Default)]
pub struct AuxiliaryWeights {
    /// `[vocab_size, hidden_size]`
    pub lm_head: Option<Tensor>,
    /// `[vocab_size, hidden_size]`
    pub embedding: Option<Tensor>,
}

impl AuxiliaryWeights {
    pub fn is_empty(&self) -> bool {
        self.lm_head.is_none() && self.embedding.is_none()
    }

    /// `(vocab_size, hidden_size)` of the lm_head override, if any.
    pub fn lm_head_dims(&self) -> Option<(usize, usize)> {
        self.lm_head.as_ref().and_then(|t| t.dims2().ok())
    }
}

/// Descriptive metadata kept per registered identity.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterInfo {
    /// Name the checkpoint itself uses for the adapter.
    pub label: Option<String>,
    pub source: Option<CheckpointSource>,
    /// Rank declared by the checkpoint config.
    pub declared_rank: usize,
    /// LoRA scale the engine should apply, when the checkpoint defines one.
    pub scaling: Option<f32>,
    /// `tokenizer_config.json` shipped with a PEFT adapter, kept verbatim.
    pub tokenizer_config: Option<serde_json::Value>,
}

impl AdapterInfo {
    pub fn sentinel() -> Self {
        Self {
            label: None,
            source: None,
            declared_rank: 0,
            scaling: None,
            tokenizer_config: None,
        }
    }
}
