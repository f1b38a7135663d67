//! LoRA adapter registry consumed by the execution engine.
//!
//! The registry owns every adapter buffer and publishes, per identity and
//! layer, the raw `(in, out)` addresses the engine stitches into its
//! batched low-rank GEMM. It is filled once at startup through `&mut self`
//! and then shared read-only (typically behind an `Arc`) by all request
//! workers; lookups never lock or allocate buffers.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use candle_core::Tensor;
use thiserror::Error;

use super::buffers::{device_address, BufferHandle, WeightBufferSet};
use super::loader::{LoadOptions, LoadedAdapter, LoadedCheckpoint, LoraLoadError};
use super::types::{
    AdapterId, AdapterInfo, AuxiliaryWeights, CheckpointSource, ModuleRole, RankTable,
};
use crate::config::ModelConfig;

/// Errors from the LoRA registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("adapter identity already registered: {0}")]
    DuplicateIdentity(AdapterId),
    #[error("unknown adapter identity: {0}")]
    UnknownIdentity(AdapterId),
    #[error("adapter label already registered: {0}")]
    DuplicateLabel(String),
    #[error("unknown adapter label: {0}")]
    UnknownLabel(String),
    #[error("layer {layer} out of range for {num_layers} layers")]
    LayerOutOfRange { layer: usize, num_layers: usize },
    #[error("adapter {id} has ranks for {actual} layers, registry has {expected}")]
    LayerCountMismatch {
        id: AdapterId,
        expected: usize,
        actual: usize,
    },
    #[error("adapter {id} layer {layer} {role}: {reason}")]
    InconsistentPair {
        id: AdapterId,
        layer: usize,
        role: ModuleRole,
        reason: String,
    },
    #[error("load error: {0}")]
    Load(#[from] LoraLoadError),
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// Published low-rank pair of one (identity, layer, module).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerEntry {
    pub layer_index: usize,
    pub role: ModuleRole,
    pub rank: usize,
    pub input: BufferHandle,
    pub output: BufferHandle,
    pub addr_in: u64,
    pub addr_out: u64,
}

/// Raw addresses of one pair, as handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerPair {
    pub addr_in: u64,
    pub addr_out: u64,
}

/// Pointers of one identity on one layer.
///
/// Borrows the registry, so it cannot outlive the buffers the addresses
/// point into. Modules with rank 0 have no entry.
#[derive(Debug, Clone, Copy)]
pub struct LayerPointers<'a> {
    entries: &'a [PointerEntry],
}

impl<'a> LayerPointers<'a> {
    pub fn get(&self, role: ModuleRole) -> Option<PointerPair> {
        self.entry(role).map(|e| PointerPair {
            addr_in: e.addr_in,
            addr_out: e.addr_out,
        })
    }

    pub fn entry(&self, role: ModuleRole) -> Option<&'a PointerEntry> {
        self.entries.iter().find(|e| e.role == role)
    }

    pub fn contains(&self, role: ModuleRole) -> bool {
        self.entry(role).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ModuleRole, PointerPair)> + 'a {
        self.entries.iter().map(|e| {
            (
                e.role,
                PointerPair {
                    addr_in: e.addr_in,
                    addr_out: e.addr_out,
                },
            )
        })
    }

    pub fn entries(&self) -> &'a [PointerEntry] {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
struct AdapterEntry {
    info: AdapterInfo,
    ranks: RankTable,
    /// Indexed by layer.
    pointers: Vec<Vec<PointerEntry>>,
    auxiliary: AuxiliaryWeights,
}

/// An adapter that passed validation, with addresses already resolved.
struct PreparedAdapter {
    adapter: LoadedAdapter,
    addresses: Vec<(u64, u64)>,
}

/// Registry of loaded LoRA adapters.
///
/// Rank metadata, raw pointers and the owning buffers for every identity,
/// including the `NoAdapter` sentinel.
#[derive(Debug)]
pub struct LoraRegistry {
    num_layers: usize,
    roles: Vec<ModuleRole>,
    adapters: HashMap<AdapterId, AdapterEntry>,
    /// Registration order, for listing.
    order: Vec<AdapterId>,
    labels: HashMap<String, AdapterId>,
    buffers: WeightBufferSet,
}

impl LoraRegistry {
    /// Create an empty registry for a model with `num_layers` execution
    /// layers whose LoRA-capable modules are `roles`.
    pub fn new(num_layers: usize, roles: Vec<ModuleRole>) -> Self {
        Self {
            num_layers,
            roles,
            adapters: HashMap::new(),
            order: Vec::new(),
            labels: HashMap::new(),
            buffers: WeightBufferSet::new(),
        }
    }

    /// Create an empty registry shaped by a model config.
    pub fn for_model(model: &ModelConfig) -> Result<Self, RegistryError> {
        Ok(Self::new(model.num_layers, model.roles()?))
    }

    /// Registry holding only the sentinel; what the engine runs with when no
    /// adapter could be loaded.
    pub fn with_sentinel(num_layers: usize, roles: Vec<ModuleRole>) -> Self {
        let mut registry = Self::new(num_layers, roles);
        let sentinel = LoadedAdapter::sentinel(num_layers);
        registry.commit(PreparedAdapter {
            adapter: sentinel,
            addresses: Vec::new(),
        });
        registry
    }

    /// Register one identity, taking ownership of its buffers.
    ///
    /// Fails without touching the registry if the identity or its label is
    /// already present, or if the rank table and buffers disagree.
    pub fn register(&mut self, adapter: LoadedAdapter) -> Result<(), RegistryError> {
        let prepared = self.prepare(adapter, &HashSet::new(), &HashSet::new())?;
        self.commit(prepared);
        Ok(())
    }

    /// Register every identity of one load pass, all or nothing.
    ///
    /// A sentinel in the checkpoint is skipped when the registry already
    /// has one; its rows are all zero either way.
    pub fn register_checkpoint(
        &mut self,
        checkpoint: LoadedCheckpoint,
    ) -> Result<Vec<AdapterId>, RegistryError> {
        let mut prepared = Vec::with_capacity(checkpoint.adapters.len());
        let mut pending_ids = HashSet::new();
        let mut pending_labels = HashSet::new();

        for adapter in checkpoint.adapters {
            if adapter.id.is_sentinel() && self.adapters.contains_key(&AdapterId::NoAdapter) {
                self.check_sentinel(&adapter)?;
                continue;
            }
            let p = self.prepare(adapter, &pending_ids, &pending_labels)?;
            pending_ids.insert(p.adapter.id.clone());
            if let Some(label) = p.adapter.label() {
                pending_labels.insert(label.to_string());
            }
            prepared.push(p);
        }

        let ids: Vec<AdapterId> = prepared.iter().map(|p| p.adapter.id.clone()).collect();
        for p in prepared {
            self.commit(p);
        }

        tracing::info!(
            source = %checkpoint.source,
            identities = ids.len(),
            buffers = self.buffers.len(),
            bytes = self.buffers.total_bytes(),
            "registered LoRA checkpoint"
        );
        Ok(ids)
    }

    /// Load a checkpoint with the loader for `source` and register it.
    ///
    /// A failed load leaves the registry exactly as it was.
    pub fn load_checkpoint(
        &mut self,
        source: CheckpointSource,
        dir: impl AsRef<Path>,
        model: &ModelConfig,
        options: &LoadOptions,
    ) -> Result<Vec<AdapterId>, RegistryError> {
        let checkpoint = source.loader().load(dir.as_ref(), model, options)?;
        self.register_checkpoint(checkpoint)
    }

    fn check_sentinel(&self, adapter: &LoadedAdapter) -> Result<(), RegistryError> {
        let id = &adapter.id;
        if adapter.ranks.num_layers() != self.num_layers {
            return Err(RegistryError::LayerCountMismatch {
                id: id.clone(),
                expected: self.num_layers,
                actual: adapter.ranks.num_layers(),
            });
        }
        if let Some(pair) = adapter.pairs.first() {
            return Err(RegistryError::InconsistentPair {
                id: id.clone(),
                layer: pair.layer_index,
                role: pair.role,
                reason: "the no-adapter sentinel cannot carry buffers".to_string(),
            });
        }
        if let Some((layer, (role, _))) = adapter
            .ranks
            .layers()
            .iter()
            .find_map(|l| l.active().next().map(|a| (l.layer_index, a)))
        {
            return Err(RegistryError::InconsistentPair {
                id: id.clone(),
                layer,
                role,
                reason: "the no-adapter sentinel must have rank 0".to_string(),
            });
        }
        Ok(())
    }

    /// Validate an adapter against the registry and resolve its addresses.
    fn prepare(
        &self,
        adapter: LoadedAdapter,
        pending_ids: &HashSet<AdapterId>,
        pending_labels: &HashSet<String>,
    ) -> Result<PreparedAdapter, RegistryError> {
        let id = adapter.id.clone();
        if self.adapters.contains_key(&id) || pending_ids.contains(&id) {
            return Err(RegistryError::DuplicateIdentity(id));
        }
        if let Some(label) = adapter.label() {
            if self.labels.contains_key(label) || pending_labels.contains(label) {
                return Err(RegistryError::DuplicateLabel(label.to_string()));
            }
        }
        if id.is_sentinel() {
            self.check_sentinel(&adapter)?;
            return Ok(PreparedAdapter {
                adapter,
                addresses: Vec::new(),
            });
        }
        if adapter.ranks.num_layers() != self.num_layers {
            return Err(RegistryError::LayerCountMismatch {
                id,
                expected: self.num_layers,
                actual: adapter.ranks.num_layers(),
            });
        }

        let inconsistent = |layer: usize, role: ModuleRole, reason: String| {
            RegistryError::InconsistentPair {
                id: id.clone(),
                layer,
                role,
                reason,
            }
        };

        // Ranks on modules the model does not expose would never be looked up.
        for layer in adapter.ranks.layers() {
            for (role, _) in layer.active() {
                if !self.roles.contains(&role) {
                    return Err(inconsistent(
                        layer.layer_index,
                        role,
                        "module is not a LoRA target of this model".to_string(),
                    ));
                }
            }
        }

        let mut seen = HashSet::new();
        let mut addresses = Vec::with_capacity(adapter.pairs.len());
        for pair in &adapter.pairs {
            let (layer, role) = (pair.layer_index, pair.role);
            let rank = adapter.ranks.rank(layer, role).ok_or_else(|| {
                inconsistent(layer, role, format!("layer beyond {} layers", self.num_layers))
            })?;
            if rank == 0 {
                return Err(inconsistent(layer, role, "buffers for a rank-0 module".to_string()));
            }
            if !seen.insert((layer, role)) {
                return Err(inconsistent(layer, role, "duplicate pair".to_string()));
            }
            let (in_dims, out_dims) = (pair.input.dims(), pair.output.dims());
            if in_dims.len() != 2 || in_dims[0] != rank {
                return Err(inconsistent(
                    layer,
                    role,
                    format!("input shape {in_dims:?} does not have rank {rank} rows"),
                ));
            }
            if out_dims.len() != 2 || out_dims[1] != rank {
                return Err(inconsistent(
                    layer,
                    role,
                    format!("output shape {out_dims:?} does not have rank {rank} columns"),
                ));
            }
            if !pair.input.is_contiguous() || !pair.output.is_contiguous() {
                return Err(inconsistent(layer, role, "non-contiguous buffer".to_string()));
            }
            addresses.push((device_address(&pair.input)?, device_address(&pair.output)?));
        }

        // Every non-zero rank needs exactly one published pair.
        for layer in adapter.ranks.layers() {
            for (role, _) in layer.active() {
                if !seen.contains(&(layer.layer_index, role)) {
                    return Err(inconsistent(
                        layer.layer_index,
                        role,
                        "non-zero rank without buffers".to_string(),
                    ));
                }
            }
        }

        Ok(PreparedAdapter { adapter, addresses })
    }

    /// Move a validated adapter's buffers into the arena and publish it.
    fn commit(&mut self, prepared: PreparedAdapter) {
        let PreparedAdapter { adapter, addresses } = prepared;
        let mut pointers: Vec<Vec<PointerEntry>> = vec![Vec::new(); self.num_layers];

        for (pair, (addr_in, addr_out)) in adapter.pairs.into_iter().zip(addresses) {
            let rank = pair.rank();
            let layer_index = pair.layer_index;
            let role = pair.role;
            let input = self.buffers.insert(pair.input);
            let output = self.buffers.insert(pair.output);
            pointers[layer_index].push(PointerEntry {
                layer_index,
                role,
                rank,
                input,
                output,
                addr_in,
                addr_out,
            });
        }

        if let Some(label) = adapter.info.label.clone() {
            self.labels.insert(label, adapter.id.clone());
        }
        self.order.push(adapter.id.clone());
        self.adapters.insert(
            adapter.id,
            AdapterEntry {
                info: adapter.info,
                ranks: adapter.ranks,
                pointers,
                auxiliary: adapter.auxiliary,
            },
        );
    }

    fn entry(&self, id: &AdapterId) -> Result<&AdapterEntry, RegistryError> {
        self.adapters
            .get(id)
            .ok_or_else(|| RegistryError::UnknownIdentity(id.clone()))
    }

    fn check_layer(&self, layer: usize) -> Result<(), RegistryError> {
        if layer >= self.num_layers {
            return Err(RegistryError::LayerOutOfRange {
                layer,
                num_layers: self.num_layers,
            });
        }
        Ok(())
    }

    /// LoRA rank of a module. 0 means the adapter does not customize it.
    pub fn rank_of(
        &self,
        id: &AdapterId,
        layer: usize,
        role: ModuleRole,
    ) -> Result<usize, RegistryError> {
        let entry = self.entry(id)?;
        self.check_layer(layer)?;
        Ok(entry.ranks.rank(layer, role).unwrap_or(0))
    }

    /// Raw `(in, out)` addresses of every customized module on a layer.
    pub fn pointers_of(
        &self,
        id: &AdapterId,
        layer: usize,
    ) -> Result<LayerPointers<'_>, RegistryError> {
        let entry = self.entry(id)?;
        self.check_layer(layer)?;
        Ok(LayerPointers {
            entries: &entry.pointers[layer],
        })
    }

    /// Borrowed `(in, out)` tensors of one module, `None` when its rank is 0.
    pub fn pair(
        &self,
        id: &AdapterId,
        layer: usize,
        role: ModuleRole,
    ) -> Result<Option<(&Tensor, &Tensor)>, RegistryError> {
        let pointers = self.pointers_of(id, layer)?;
        Ok(pointers.entry(role).and_then(|e| {
            let input = self.buffers.get(e.input)?;
            let output = self.buffers.get(e.output)?;
            Some((input, output))
        }))
    }

    pub fn rank_table(&self, id: &AdapterId) -> Result<&RankTable, RegistryError> {
        Ok(&self.entry(id)?.ranks)
    }

    /// Resolve the name a checkpoint uses for an adapter to its identity.
    pub fn key_for_ecosystem_label(&self, label: &str) -> Result<&AdapterId, RegistryError> {
        self.labels
            .get(label)
            .ok_or_else(|| RegistryError::UnknownLabel(label.to_string()))
    }

    /// Checkpoint name of an identity; `None` for the sentinel.
    pub fn label_of(&self, id: &AdapterId) -> Result<Option<&str>, RegistryError> {
        Ok(self.entry(id)?.info.label.as_deref())
    }

    pub fn info(&self, id: &AdapterId) -> Result<&AdapterInfo, RegistryError> {
        Ok(&self.entry(id)?.info)
    }

    pub fn auxiliary(&self, id: &AdapterId) -> Result<&AuxiliaryWeights, RegistryError> {
        Ok(&self.entry(id)?.auxiliary)
    }

    pub fn contains(&self, id: &AdapterId) -> bool {
        self.adapters.contains_key(id)
    }

    /// Identities in registration order.
    pub fn identities(&self) -> impl Iterator<Item = &AdapterId> {
        self.order.iter()
    }

    pub fn num_identities(&self) -> usize {
        self.adapters.len()
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    pub fn roles(&self) -> &[ModuleRole] {
        &self.roles
    }

    pub fn buffers(&self) -> &WeightBufferSet {
        &self.buffers
    }
}
