use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{Device, Tensor};
use clap::{Parser, Subcommand};
use lora_manager_core::{
    config::ModelConfig,
    distributed::TensorParallelTopology,
    dtype::{dtype_name, parse_dtype},
    lora::{
        AdapterId, CheckpointSource, LoadOptions, LoraRegistry, ModuleRole, NEMO_CONFIG_FILE,
    },
};

use lora_manager_cli::config::CliConfig;
use lora_manager_cli::logging::{self, LogFormat};

#[derive(Parser)]
#[command(
    name = "lora-manager",
    about = "Load LoRA checkpoints the way the execution engine sees them"
)]
struct Cli {
    /// Config file (default: ~/.config/lora-manager/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a checkpoint into a registry and print its tables for one layer
    Inspect {
        /// Checkpoint directory
        #[arg(long)]
        checkpoint: PathBuf,

        /// Checkpoint convention: nemo or hf (detected from the directory if omitted)
        #[arg(long)]
        source: Option<String>,

        /// Model config JSON (num_layers, hidden_size, lora_target_modules, ...)
        #[arg(long)]
        model_config: Option<PathBuf>,

        /// Execution dtype (bf16, fp16, fp32); defaults to the model config's
        #[arg(long)]
        dtype: Option<String>,

        /// Element dtype of NeMo weight blobs
        #[arg(long)]
        blob_dtype: Option<String>,

        /// Tensor parallel size
        #[arg(long)]
        tp_size: Option<usize>,

        /// Tensor parallel rank of this process
        #[arg(long)]
        tp_rank: Option<usize>,

        /// Identity for a HuggingFace adapter (default: directory name)
        #[arg(long)]
        adapter_name: Option<String>,

        /// Layer whose rank and pointer tables are printed
        #[arg(long, default_value_t = 0)]
        layer: usize,
    },
    /// Print the module role table: engine names, HF names and split axes
    Roles,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => CliConfig::load_from(path)
            .with_context(|| format!("failed to read config {}", path.display()))?,
        None => CliConfig::load(),
    };
    config.merge(&CliConfig {
        log_level: cli.log_level.clone(),
        ..Default::default()
    });

    let level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    logging::init(&level, LogFormat::from_env())?;

    match cli.command {
        Command::Inspect {
            checkpoint,
            source,
            model_config,
            dtype,
            blob_dtype,
            tp_size,
            tp_rank,
            adapter_name,
            layer,
        } => {
            // CLI > config file > defaults
            config.merge(&CliConfig {
                source,
                model_config,
                dtype,
                blob_dtype,
                tensor_parallel_size: tp_size,
                tensor_parallel_rank: tp_rank,
                log_level: None,
            });
            inspect(&config, &checkpoint, adapter_name, layer)
        }
        Command::Roles => {
            print_roles();
            Ok(())
        }
    }
}

fn inspect(
    config: &CliConfig,
    checkpoint: &Path,
    adapter_name: Option<String>,
    layer: usize,
) -> anyhow::Result<()> {
    let source = match config.source.as_deref() {
        Some(name) => name
            .parse::<CheckpointSource>()
            .map_err(|e| anyhow::anyhow!(e))?,
        None => detect_source(checkpoint),
    };

    let model_path = config
        .model_config
        .as_deref()
        .context("--model-config is required (or set model_config in the config file)")?;
    let model = load_model_config(model_path)?;

    let topology = TensorParallelTopology::new(
        config.tensor_parallel_rank.unwrap_or(0),
        config.tensor_parallel_size.unwrap_or(1),
    )?;

    let device = Device::cuda_if_available(0)?;
    let mut options = LoadOptions::new(device).with_topology(topology);
    if let Some(name) = &config.dtype {
        options = options.with_dtype(parse_dtype_arg("--dtype", name)?);
    }
    if let Some(name) = &config.blob_dtype {
        options = options.with_blob_dtype(parse_dtype_arg("--blob-dtype", name)?);
    }
    if let Some(name) = adapter_name {
        options = options.with_adapter_name(name);
    }

    tracing::info!(
        checkpoint = %checkpoint.display(),
        %source,
        tp_rank = topology.tp_rank(),
        tp_size = topology.tp_size(),
        "loading LoRA checkpoint"
    );

    let mut registry = LoraRegistry::for_model(&model)?;
    registry
        .load_checkpoint(source, checkpoint, &model, &options)
        .with_context(|| format!("failed to load {}", checkpoint.display()))?;

    if layer >= registry.num_layers() {
        anyhow::bail!(
            "--layer {} out of range (model has {} layers)",
            layer,
            registry.num_layers()
        );
    }

    print_registry(&registry, layer)
}

fn detect_source(dir: &Path) -> CheckpointSource {
    if dir.join(NEMO_CONFIG_FILE).exists() {
        CheckpointSource::Nemo
    } else {
        CheckpointSource::HuggingFace
    }
}

fn load_model_config(path: &Path) -> anyhow::Result<ModelConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read model config {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse model config {}", path.display()))
}

fn parse_dtype_arg(flag: &str, name: &str) -> anyhow::Result<candle_core::DType> {
    parse_dtype(name).ok_or_else(|| {
        anyhow::anyhow!(
            "Unknown {} '{}'. Supported: bf16, fp16, fp32",
            flag,
            name
        )
    })
}

fn print_registry(registry: &LoraRegistry, layer: usize) -> anyhow::Result<()> {
    println!(
        "{} identities, {} buffers, {} bytes",
        registry.num_identities(),
        registry.buffers().len(),
        registry.buffers().total_bytes()
    );

    for id in registry.identities() {
        let info = registry.info(id)?;
        let label = info.label.as_deref().unwrap_or("-");
        let scaling = info
            .scaling
            .map(|s| format!("{s}"))
            .unwrap_or_else(|| "-".to_string());
        println!();
        println!(
            "{id}  label={label}  rank={}  max_rank={}  scaling={scaling}",
            info.declared_rank,
            registry.rank_table(id)?.max_rank()
        );
        if let Some((vocab, hidden)) = registry.auxiliary(id)?.lm_head_dims() {
            println!("  lm_head override [{vocab}, {hidden}]");
        }

        let pointers = registry.pointers_of(id, layer)?;
        for &role in registry.roles() {
            let rank = registry.rank_of(id, layer, role)?;
            match pointers.get(role) {
                Some(p) => println!(
                    "  layer {layer} {:<12} r={:<4} in=0x{:x} out=0x{:x}",
                    role.engine_name(),
                    rank,
                    p.addr_in,
                    p.addr_out
                ),
                None => println!("  layer {layer} {:<12} r={rank}", role.engine_name()),
            }
        }
        if let Some((input, output)) = first_pair(registry, id, layer)? {
            println!(
                "  in {:?} out {:?} {}",
                input.dims(),
                output.dims(),
                dtype_name(input.dtype())
            );
        }
    }
    Ok(())
}

fn first_pair<'a>(
    registry: &'a LoraRegistry,
    id: &AdapterId,
    layer: usize,
) -> anyhow::Result<Option<(&'a Tensor, &'a Tensor)>> {
    for &role in registry.roles() {
        if let Some(pair) = registry.pair(id, layer, role)? {
            return Ok(Some(pair));
        }
    }
    Ok(None)
}

fn print_roles() {
    println!("{:<12} {:<10} {:<8} {:<8}", "engine", "hf", "in", "out");
    for role in ModuleRole::ALL {
        let rule = role.partition_rule();
        let axis = |a: Option<usize>| a.map_or_else(|| "-".to_string(), |a| format!("dim {a}"));
        println!(
            "{:<12} {:<10} {:<8} {:<8}",
            role.engine_name(),
            role.hf_module().unwrap_or("-"),
            axis(rule.input_axis),
            axis(rule.output_axis)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_detected_from_nemo_config() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_source(dir.path()), CheckpointSource::HuggingFace);
        std::fs::write(dir.path().join(NEMO_CONFIG_FILE), "{}").unwrap();
        assert_eq!(detect_source(dir.path()), CheckpointSource::Nemo);
    }

    #[test]
    fn unknown_dtype_names_the_flag() {
        let err = parse_dtype_arg("--dtype", "int4").unwrap_err();
        assert!(err.to_string().contains("--dtype"));
        assert_eq!(
            parse_dtype_arg("--dtype", "bf16").unwrap(),
            candle_core::DType::BF16
        );
    }

    #[test]
    fn cli_parses_inspect_flags() {
        let cli = Cli::try_parse_from([
            "lora-manager",
            "inspect",
            "--checkpoint",
            "/tmp/ckpt",
            "--tp-size",
            "2",
            "--tp-rank",
            "1",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Command::Inspect {
                tp_size, tp_rank, layer, ..
            } => {
                assert_eq!(tp_size, Some(2));
                assert_eq!(tp_rank, Some(1));
                assert_eq!(layer, 0);
            }
            Command::Roles => panic!("expected inspect"),
        }
    }
}
