#![recursion_limit = "256"]

//! # Batch inversion tool
//!
//! Inverts every image of a list into the latent space of a pretrained model
//! and writes, for each image, the original, the encoder reconstruction and
//! the final inversion, plus an HTML table of all intermediate results.
//!
//! ```bash
//! cargo run --release --bin invert -- ffhq data/faces.txt --num-results 5
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use burn::backend::{Autodiff, NdArray, ndarray::NdArrayDevice};
use burn::config::Config;
use burn::tensor::backend::AutodiffBackend;
use burn_wgpu::{Wgpu, WgpuDevice};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};

use sa_inversion::batch::{BatchOptions, default_output_dir, run_batch};
use sa_inversion::telemetry::init_tracing;
use sa_inversion::{InitStrategy, InversionConfig, Inverter, LatentLayout, ModelBundle, PriorAnchor};

// --- CLI DEFINITION ---

#[derive(Clone, Copy, Debug, ValueEnum)]
enum InitArg {
    /// Encoder estimate; fails without an encoder.
    Encoder,
    /// Encoder estimate, or a seeded random code when the model has no encoder.
    EncoderOrRandom,
    /// Seeded random code.
    Random,
    /// All-zero code.
    Zeros,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum AnchorArg {
    /// Regularize toward the encoder estimate of the target image.
    Target,
    /// Regularize toward the encoder estimate of the current reconstruction.
    Reconstruction,
}

/// Command-line interface for the inversion tool.
#[derive(Parser, Debug)]
#[command(author, version, about = "Invert real images into a generator's latent space")]
struct Args {
    /// Name of the model directory under `--model-dir`.
    model_name: String,

    /// Text file listing the images to invert, one path per line.
    image_list: PathBuf,

    /// Output directory. Defaults to `results/inversion/<image list stem>`.
    #[arg(short, long, alias = "output_dir")]
    output_dir: Option<PathBuf>,

    /// Directory holding the pretrained models.
    #[arg(long, alias = "model_dir", default_value = "models")]
    model_dir: PathBuf,

    #[arg(long, alias = "learning_rate", default_value_t = 0.01)]
    learning_rate: f64,

    #[arg(long, alias = "num_iterations", default_value_t = 3000)]
    num_iterations: usize,

    /// Number of intermediate results to keep per image.
    #[arg(long, alias = "num_results", default_value_t = 1)]
    num_results: usize,

    /// Pixel reconstruction loss scale.
    #[arg(long, alias = "loss_weight_rec", default_value_t = 1.0)]
    loss_weight_rec: f64,

    /// Perceptual loss scale.
    #[arg(long, alias = "loss_weight_feat", default_value_t = 5e-5)]
    loss_weight_feat: f64,

    /// Encoder regularization loss scale.
    #[arg(long, alias = "loss_weight_enc", default_value_t = 2.0)]
    loss_weight_enc: f64,

    /// Thumbnail size in the HTML report; 0 keeps the native size.
    #[arg(long, alias = "viz_size", default_value_t = 256)]
    viz_size: u32,

    /// GPU index, or `cpu` for the ndarray backend. Defaults to the best available GPU.
    #[arg(long, alias = "gpu_id")]
    gpu_id: Option<String>,

    /// Latent slot shapes, e.g. `1x2x512x4x4,1x512`. Defaults to the generator's own layout.
    #[arg(long)]
    sizes: Option<LatentLayout>,

    #[arg(long, value_enum, default_value = "encoder")]
    init: InitArg,

    /// Seed for random initialization.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    #[arg(long, value_enum, default_value = "target")]
    prior_anchor: AnchorArg,

    /// Also save each final latent code as a Burn record.
    #[arg(long)]
    save_codes: bool,
}

impl Args {
    fn inversion_config(&self) -> InversionConfig {
        let init = match self.init {
            InitArg::Encoder => InitStrategy::Encoder,
            InitArg::EncoderOrRandom => InitStrategy::EncoderOrRandom { seed: self.seed },
            InitArg::Random => InitStrategy::Random { seed: self.seed },
            InitArg::Zeros => InitStrategy::Zeros,
        };
        let prior_anchor = match self.prior_anchor {
            AnchorArg::Target => PriorAnchor::Target,
            AnchorArg::Reconstruction => PriorAnchor::Reconstruction,
        };

        InversionConfig::new()
            .with_learning_rate(self.learning_rate)
            .with_num_iterations(self.num_iterations)
            .with_num_results(self.num_results)
            .with_reconstruction_weight(self.loss_weight_rec)
            .with_perceptual_weight(self.loss_weight_feat)
            .with_regularization_weight(self.loss_weight_enc)
            .with_init(init)
            .with_prior_anchor(prior_anchor)
            .with_layout(self.sizes.clone())
    }
}

// --- RUN ---

/// Loads the models on `device` and inverts the whole list.
fn run<B: AutodiffBackend>(args: &Args, output_dir: &Path, device: B::Device) -> Result<()> {
    info!("Using device: {:?}", device);

    info!("Loading model `{}`", args.model_name);
    let models = ModelBundle::<B>::load(&args.model_dir, &args.model_name, &device)
        .with_context(|| format!("loading model `{}`", args.model_name))?;

    let config = args.inversion_config();
    config
        .save(output_dir.join("config.json"))
        .context("saving run configuration")?;

    let mut inverter = Inverter::new(config, &models.generator, device)?
        .with_features(&models.perceptual);
    if let Some(encoder) = &models.encoder {
        inverter = inverter.with_encoder(encoder);
    }

    let options = BatchOptions {
        image_list: args.image_list.clone(),
        output_dir: output_dir.to_path_buf(),
        viz_size: (args.viz_size > 0).then_some(args.viz_size),
        save_codes: args.save_codes,
    };
    let summary = run_batch(&inverter, &options)?;

    if summary.failed() > 0 {
        warn!(
            "{} of {} images failed; see {}",
            summary.failed(),
            summary.outcomes.len(),
            output_dir.join("summary.json").display()
        );
    }
    info!("Results saved to {}", output_dir.display());
    Ok(())
}

// --- MAIN EXECUTION ---

/// Entry point.
///
/// Steps:
/// 1. Parse arguments and check the image list exists
/// 2. Create the output directory and start logging into it
/// 3. Pick the backend and device
/// 4. Load models, invert every image, write the report
fn main() -> Result<()> {
    // 1. Parse Command Line Arguments
    let args = Args::parse();
    ensure!(
        args.image_list.is_file(),
        "image list {} does not exist",
        args.image_list.display()
    );

    // 2. Output directory & logging
    let output_dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| default_output_dir(&args.image_list));
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;
    init_tracing(Some(&output_dir.join("inversion.log")))?;

    // 3. Select backend: ndarray on CPU, WGPU otherwise
    match args.gpu_id.as_deref() {
        Some("cpu") => run::<Autodiff<NdArray>>(&args, &output_dir, NdArrayDevice::Cpu),
        Some(id) => {
            let index: usize = id
                .parse()
                .with_context(|| format!("--gpu-id must be an index or `cpu`, got `{id}`"))?;
            run::<Autodiff<Wgpu>>(&args, &output_dir, WgpuDevice::DiscreteGpu(index))
        }
        None => run::<Autodiff<Wgpu>>(&args, &output_dir, WgpuDevice::DefaultDevice),
    }
}
