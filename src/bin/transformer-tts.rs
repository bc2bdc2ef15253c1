//! TransformerTTS CLI: symbol ids to mel spectrogram.
//!
//! Runs greedy autoregressive synthesis for one symbol sequence and writes the
//! PostNet mel frames to the path given by --output as JSON:
//!
//! ```json
//! {"n_mels":80,"steps":312,"stopped":true,"frames":[[...], ...]}
//! ```
//!
//! Also prints a one-line JSON summary to stdout on success:
//!
//! ```json
//! {"path":"/tmp/mel.json","frames":312,"n_mels":80,"stopped":true}
//! ```
//!
//! Without --weights the model is randomly initialised, which is only useful
//! for smoke-testing shapes and timing.
//!
//! Exit code 0 on success, non-zero on error.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use serde::Serialize;
use transformer_tts::{
    TransformerTts, TransformerTtsConfig,
    synthesis::{SynthesisConfig, synthesize},
};

#[derive(Parser, Debug)]
#[command(
    name = "transformer-tts",
    about = "TransformerTTS mel-spectrogram synthesis",
    long_about = "Generate mel-spectrogram frames from a comma-separated symbol id sequence.\n\
                  Output is written to --output; a JSON summary line is printed to stdout."
)]
struct Args {
    /// Comma-separated symbol ids, e.g. "12,5,33,7".
    #[arg(long, short = 'i')]
    ids: String,

    /// Model config JSON. Omitted fields use defaults.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Trained weights (.safetensors). Omit for random initialisation.
    #[arg(long, short = 'w')]
    weights: Option<std::path::PathBuf>,

    /// Output JSON path for the mel frames.
    #[arg(long, short = 'o')]
    output: String,

    /// Maximum decoder steps.
    #[arg(long, default_value_t = 800)]
    max_frames: usize,

    /// Decoder steps before the stop token is honoured.
    #[arg(long, default_value_t = 0)]
    min_frames: usize,

    /// Stop probability threshold.
    #[arg(long, default_value_t = 0.5)]
    stop_threshold: f32,
}

#[derive(Serialize)]
struct MelFile {
    n_mels: usize,
    steps: usize,
    stopped: bool,
    frames: Vec<Vec<f32>>,
}

fn parse_ids(raw: &str) -> anyhow::Result<Vec<u32>> {
    let ids = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .map_err(|e| anyhow::anyhow!("invalid symbol id '{s}': {e}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    if ids.is_empty() {
        anyhow::bail!("no symbol ids given");
    }
    Ok(ids)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let ids = parse_ids(&args.ids)?;

    let config = match &args.config {
        Some(path) => TransformerTtsConfig::from_json_file(path)
            .map_err(|e| anyhow::anyhow!("failed to read config: {e}"))?,
        None => TransformerTtsConfig::default(),
    };
    if let Some(&bad) = ids.iter().find(|&&id| id as usize >= config.vocab_size) {
        anyhow::bail!("symbol id {bad} outside vocabulary of {}", config.vocab_size);
    }

    let output_path = std::path::Path::new(&args.output);
    if let Some(parent) = output_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let device = Device::cuda_if_available(0)?;
    let dtype = DType::F32;
    tracing::info!("Using device: {:?}", device);

    let model = match &args.weights {
        Some(path) => TransformerTts::load(path, &config, dtype, &device)
            .map_err(|e| anyhow::anyhow!("failed to load model: {e}"))?,
        None => {
            tracing::warn!("No --weights given, using random initialisation");
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, dtype, &device);
            TransformerTts::new(&config, vb)?
        }
    };

    let synth_cfg = SynthesisConfig {
        max_frames: args.max_frames,
        min_frames: args.min_frames,
        stop_threshold: args.stop_threshold,
    };
    let characters = Tensor::new(ids.as_slice(), &device)?.unsqueeze(0)?;
    let out = synthesize(&model, &characters, &synth_cfg)
        .map_err(|e| anyhow::anyhow!("synthesis failed: {e}"))?;

    let frames: Vec<Vec<f32>> = out.mel.squeeze(0)?.to_dtype(DType::F32)?.to_vec2()?;
    let n_frames = frames.len();
    let file = MelFile {
        n_mels: config.n_mels,
        steps: out.steps,
        stopped: out.stopped,
        frames,
    };
    std::fs::write(output_path, serde_json::to_string(&file)?)?;

    // Print machine-readable summary to stdout for the caller
    println!(
        "{}",
        serde_json::json!({
            "path": args.output,
            "frames": n_frames,
            "n_mels": config.n_mels,
            "stopped": out.stopped,
        })
    );

    Ok(())
}
