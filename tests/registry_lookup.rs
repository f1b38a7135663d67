//! Lookup behaviour of a populated registry shared across reader threads.

use std::sync::Arc;
use std::thread;

use candle_core::{DType, Device, Tensor};
use lora_manager_core::lora::{
    AdapterId, AdapterInfo, AuxiliaryWeights, CheckpointSource, LoadedAdapter, LoadedCheckpoint,
    LoraRegistry, LowRankPair, ModuleRole, RankTable, RegistryError,
};

const LAYERS: usize = 4;
const ROLES: [ModuleRole; 4] = [
    ModuleRole::AttnQ,
    ModuleRole::AttnV,
    ModuleRole::AttnDense,
    ModuleRole::Mlp4hToH,
];

/// Adapter whose rank varies per layer; odd layers skip `AttnV`.
fn adapter(name: &str, base_rank: usize) -> LoadedAdapter {
    let mut ranks = RankTable::zeros(LAYERS);
    let mut pairs = Vec::new();
    for layer in 0..LAYERS {
        for role in ROLES {
            if layer % 2 == 1 && role == ModuleRole::AttnV {
                continue;
            }
            let rank = base_rank + layer;
            ranks.set(layer, role, rank);
            pairs.push(LowRankPair {
                layer_index: layer,
                role,
                input: Tensor::zeros((rank, 32), DType::BF16, &Device::Cpu).unwrap(),
                output: Tensor::zeros((64, rank), DType::BF16, &Device::Cpu).unwrap(),
            });
        }
    }
    LoadedAdapter {
        id: AdapterId::named(name),
        ranks,
        pairs,
        auxiliary: AuxiliaryWeights::default(),
        info: AdapterInfo {
            label: Some(format!("{name}-label")),
            source: Some(CheckpointSource::HuggingFace),
            declared_rank: base_rank,
            scaling: Some(2.0),
            tokenizer_config: None,
        },
    }
}

fn populated() -> LoraRegistry {
    let mut registry = LoraRegistry::new(LAYERS, ROLES.to_vec());
    registry
        .register_checkpoint(LoadedCheckpoint {
            source: CheckpointSource::HuggingFace,
            adapters: vec![
                LoadedAdapter::sentinel(LAYERS),
                adapter("a", 4),
                adapter("b", 16),
            ],
        })
        .unwrap();
    registry
}

#[test]
fn every_rank_has_matching_pointers() {
    let registry = populated();
    let ids: Vec<AdapterId> = registry.identities().cloned().collect();
    assert_eq!(ids.len(), 3);

    for id in &ids {
        for layer in 0..LAYERS {
            let pointers = registry.pointers_of(id, layer).unwrap();
            for role in ROLES {
                let rank = registry.rank_of(id, layer, role).unwrap();
                match pointers.get(role) {
                    Some(p) => {
                        assert!(rank > 0, "{id} layer {layer} {role}");
                        assert_ne!(p.addr_in, 0);
                        assert_ne!(p.addr_out, 0);
                        assert_ne!(p.addr_in, p.addr_out);
                    }
                    None => assert_eq!(rank, 0, "{id} layer {layer} {role}"),
                }
            }
        }
    }

    let b = AdapterId::named("b");
    assert_eq!(registry.rank_of(&b, 3, ModuleRole::AttnDense).unwrap(), 19);
    assert_eq!(registry.rank_of(&b, 3, ModuleRole::AttnV).unwrap(), 0);
}

#[test]
fn repeated_lookups_are_identical() {
    let registry = populated();
    let id = AdapterId::named("a");
    let first: Vec<_> = registry.pointers_of(&id, 2).unwrap().iter().collect();
    for _ in 0..10 {
        let again: Vec<_> = registry.pointers_of(&id, 2).unwrap().iter().collect();
        assert_eq!(again, first);
        assert_eq!(registry.rank_of(&id, 2, ModuleRole::AttnQ).unwrap(), 6);
    }
}

#[test]
fn concurrent_readers_see_the_same_tables() {
    let registry = Arc::new(populated());
    let expected: Vec<_> = registry
        .pointers_of(&AdapterId::named("b"), 1)
        .unwrap()
        .iter()
        .collect();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let id = registry.key_for_ecosystem_label("b-label").unwrap().clone();
                let mut seen = Vec::new();
                for _ in 0..100 {
                    seen = registry.pointers_of(&id, 1).unwrap().iter().collect::<Vec<_>>();
                    assert_eq!(
                        registry.rank_of(&AdapterId::NoAdapter, 1, ModuleRole::AttnQ).unwrap(),
                        0
                    );
                    assert_eq!(seen.len(), 3);
                }
                seen
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), expected);
    }
}

#[test]
fn duplicate_registration_keeps_prior_state() {
    let mut registry = populated();
    let id = AdapterId::named("a");
    let before: Vec<_> = registry.pointers_of(&id, 0).unwrap().iter().collect();
    let buffers = registry.buffers().len();

    let result = registry.register(adapter("a", 32));
    assert!(matches!(result, Err(RegistryError::DuplicateIdentity(dup)) if dup == id));

    let after: Vec<_> = registry.pointers_of(&id, 0).unwrap().iter().collect();
    assert_eq!(after, before);
    assert_eq!(registry.rank_of(&id, 0, ModuleRole::AttnQ).unwrap(), 4);
    assert_eq!(registry.buffers().len(), buffers);
    assert_eq!(registry.num_identities(), 3);
}

#[test]
fn out_of_range_queries_are_errors() {
    let registry = populated();
    assert!(matches!(
        registry.rank_of(&AdapterId::named("a"), LAYERS, ModuleRole::AttnQ),
        Err(RegistryError::LayerOutOfRange { .. })
    ));
    assert!(matches!(
        registry.pointers_of(&AdapterId::named("zzz"), 0),
        Err(RegistryError::UnknownIdentity(_))
    ));
    assert!(matches!(
        registry.key_for_ecosystem_label("zzz"),
        Err(RegistryError::UnknownLabel(_))
    ));
}
