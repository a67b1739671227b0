use burn::{
    config::Config,
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{Tensor, backend::AutodiffBackend},
};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{self, InversionError};
use crate::image_ops::{TargetImage, tensor_to_rgb};
use crate::latent::{LatentCode, LatentLayout};
use crate::loss::{LossBreakdown, LossComposer, LossWeights, PriorAnchor};
use crate::models::{EncoderPrior, FeatureExtractor, Generator};

// --- CONFIG ---

/// How the search is seeded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitStrategy {
    /// Start from the encoder's estimate; fails if no encoder is attached.
    #[default]
    Encoder,
    /// Start from the encoder's estimate, or from a seeded random code when no
    /// encoder is attached. The fallback is logged and reported in the output.
    EncoderOrRandom { seed: u64 },
    /// Seeded standard-normal code.
    Random { seed: u64 },
    /// All-zero code.
    Zeros,
}

/// Run-level settings of the inversion, immutable for a whole batch.
#[derive(Config, Debug)]
pub struct InversionConfig {
    /// Adam step size.
    #[config(default = 0.01)]
    pub learning_rate: f64,
    /// Number of optimization steps per image.
    #[config(default = 3000)]
    pub num_iterations: usize,
    /// Number of intermediate reconstructions to keep (the last step is always kept).
    #[config(default = 1)]
    pub num_results: usize,
    #[config(default = 1.0)]
    pub reconstruction_weight: f64,
    #[config(default = 5e-5)]
    pub perceptual_weight: f64,
    #[config(default = 2.0)]
    pub regularization_weight: f64,
    #[config(default = "InitStrategy::Encoder")]
    pub init: InitStrategy,
    #[config(default = "PriorAnchor::Target")]
    pub prior_anchor: PriorAnchor,
    /// Declared slot shapes; `None` accepts the generator's own layout.
    #[config(default = "None")]
    pub layout: Option<LatentLayout>,
}

impl InversionConfig {
    pub fn weights(&self) -> error::Result<LossWeights> {
        LossWeights::new(
            self.reconstruction_weight,
            self.perceptual_weight,
            self.regularization_weight,
        )
    }

    pub fn validate(&self) -> error::Result<()> {
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(InversionError::InvalidConfig(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.num_iterations == 0 {
            return Err(InversionError::InvalidConfig(
                "num_iterations must be at least 1".into(),
            ));
        }
        if self.num_results == 0 {
            return Err(InversionError::InvalidConfig(
                "num_results must be at least 1".into(),
            ));
        }
        self.weights().map(|_| ())
    }

    pub fn schedule(&self) -> FrameSchedule {
        FrameSchedule::new(self.num_iterations, self.num_results)
    }
}

// --- FRAME SCHEDULE ---

/// Which optimization steps are kept as visualization frames.
///
/// A step is kept when it is a multiple of `interval = max(1, total / results)`
/// or when it is the final step, so the last frame always shows the final code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameSchedule {
    total: usize,
    interval: usize,
}

impl FrameSchedule {
    pub fn new(num_iterations: usize, num_results: usize) -> Self {
        Self {
            total: num_iterations,
            interval: (num_iterations / num_results.max(1)).max(1),
        }
    }

    pub fn interval(&self) -> usize {
        self.interval
    }

    pub fn is_save_step(&self, step: usize) -> bool {
        step == self.total || step % self.interval == 0
    }

    /// Kept steps in increasing order (excluding the initial step 0).
    pub fn steps(&self) -> impl Iterator<Item = usize> + '_ {
        (1..=self.total).filter(|&step| self.is_save_step(step))
    }
}

// --- OUTPUT ---

/// Loss of one optimization step, measured before that step's update.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct IterationRecord {
    pub step: usize,
    pub loss: LossBreakdown,
}

/// A rendered snapshot of the code after `step` updates (step 0 = initial code).
#[derive(Clone, Debug)]
pub struct VisualizationFrame {
    pub step: usize,
    pub image: RgbImage,
}

/// Where the initial code came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum InitSource {
    Encoder,
    /// `EncoderOrRandom` found no encoder and used the seed instead.
    RandomFallback { seed: u64 },
    Random { seed: u64 },
    Zeros,
}

/// Result of one finished inversion.
#[derive(Debug)]
pub struct InversionOutput<B: AutodiffBackend> {
    /// Final code, detached from the autodiff graph.
    pub code: LatentCode<B::InnerBackend>,
    /// Initial frame followed by every scheduled step, strictly increasing.
    pub frames: Vec<VisualizationFrame>,
    /// One record per optimization step.
    pub history: Vec<IterationRecord>,
    pub init_source: InitSource,
}

impl<B: AutodiffBackend> InversionOutput<B> {
    /// The initial (encoder) reconstruction.
    pub fn initial_frame(&self) -> Option<&VisualizationFrame> {
        self.frames.first()
    }

    /// The reconstruction of the final code.
    pub fn final_frame(&self) -> Option<&VisualizationFrame> {
        self.frames.last()
    }

    pub fn final_loss(&self) -> Option<f64> {
        self.history.last().map(|record| record.loss.total)
    }
}

// --- INVERTER ---

/// State handed from `initialize` to `optimize`.
struct Session<'a, B: AutodiffBackend> {
    target: TargetImage<B>,
    code: LatentCode<B>,
    composer: LossComposer<'a, B>,
    frames: Vec<VisualizationFrame>,
    init_source: InitSource,
}

/// Optimizes a latent code until the generator reproduces a target image.
///
/// Each call to [`Inverter::invert`] walks `Initializing → Optimizing →
/// Finalized` on its own code; the attached networks are only read, so one
/// inverter serves a whole batch sequentially.
pub struct Inverter<'a, B: AutodiffBackend> {
    config: InversionConfig,
    weights: LossWeights,
    generator: &'a dyn Generator<B>,
    features: Option<&'a dyn FeatureExtractor<B>>,
    encoder: Option<&'a dyn EncoderPrior<B>>,
    device: B::Device,
}

impl<'a, B: AutodiffBackend> Inverter<'a, B> {
    /// # Errors
    /// `InvalidConfig` for a non-positive learning rate, zero iterations or
    /// results, or invalid loss weights.
    pub fn new(
        config: InversionConfig,
        generator: &'a dyn Generator<B>,
        device: B::Device,
    ) -> error::Result<Self> {
        config.validate()?;
        let weights = config.weights()?;
        Ok(Self {
            config,
            weights,
            generator,
            features: None,
            encoder: None,
            device,
        })
    }

    pub fn with_features(mut self, features: &'a dyn FeatureExtractor<B>) -> Self {
        self.features = Some(features);
        self
    }

    pub fn with_encoder(mut self, encoder: &'a dyn EncoderPrior<B>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn config(&self) -> &InversionConfig {
        &self.config
    }

    pub fn resolution(&self) -> usize {
        self.generator.resolution()
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Resizes `image` to the generator resolution and inverts it.
    pub fn invert_image(&self, image: &RgbImage) -> error::Result<InversionOutput<B>> {
        let target = TargetImage::from_rgb(image, self.resolution(), &self.device);
        self.invert(&target)
    }

    /// Runs one full inversion against `target`.
    ///
    /// # Errors
    /// - `InvalidTarget` if `target` is not at the generator resolution.
    /// - `ShapeMismatch` if the configured layout or the encoder estimate does not fit the generator.
    /// - `ModelUnavailable` if a positive loss weight or the init strategy needs a network that is not attached.
    /// - `NumericalDivergence` if the loss or the updated code becomes non-finite.
    pub fn invert(&self, target: &TargetImage<B>) -> error::Result<InversionOutput<B>> {
        let session = self.initialize(target)?;
        let (session, history) = self.optimize(session)?;
        Ok(self.finalize(session, history))
    }

    fn initialize(&self, target: &TargetImage<B>) -> error::Result<Session<'a, B>> {
        let layout = self.resolve_layout()?;
        if target.resolution() != self.resolution() {
            return Err(InversionError::InvalidTarget(format!(
                "target is {0}x{0}, generator renders {1}x{1}",
                target.resolution(),
                self.resolution()
            )));
        }

        if self.weights.perceptual > 0.0 && self.features.is_none() {
            return Err(InversionError::model_unavailable(
                "perceptual",
                "perceptual weight is positive but no feature extractor is attached",
            ));
        }

        // The estimate is computed whenever an encoder exists so that an
        // incompatible encoder fails here rather than mid-optimization.
        let estimate = match self.encoder {
            Some(encoder) => Some(encoder.estimate_initial(target.tensor(), layout)?),
            None => None,
        };

        let (code, init_source) = match (self.config.init, estimate) {
            (InitStrategy::Encoder, Some(code))
            | (InitStrategy::EncoderOrRandom { .. }, Some(code)) => (code, InitSource::Encoder),
            (InitStrategy::Encoder, None) => {
                return Err(InversionError::model_unavailable(
                    "encoder",
                    "encoder initialization requested but no encoder is attached",
                ));
            }
            (InitStrategy::EncoderOrRandom { seed }, None) => {
                warn!("No encoder attached; falling back to a random initial code (seed {seed})");
                (
                    LatentCode::random(layout, seed, &self.device),
                    InitSource::RandomFallback { seed },
                )
            }
            (InitStrategy::Random { seed }, _) => (
                LatentCode::random(layout, seed, &self.device),
                InitSource::Random { seed },
            ),
            (InitStrategy::Zeros, _) => (LatentCode::zeros(layout, &self.device), InitSource::Zeros),
        };

        let mut composer = LossComposer::new(self.weights);
        if let Some(features) = self.features {
            composer = composer.with_perceptual(features, target);
        }
        match self.encoder {
            Some(encoder) => {
                composer = composer.with_prior(encoder, self.config.prior_anchor, target)
            }
            None if self.weights.regularization > 0.0 => {
                if !matches!(init_source, InitSource::RandomFallback { .. }) {
                    return Err(InversionError::model_unavailable(
                        "encoder",
                        "regularization weight is positive but no encoder is attached",
                    ));
                }
                warn!("Encoder regularization disabled for this run: no encoder attached");
            }
            None => {}
        }

        let frames = vec![self.render(&code, 0)?];
        debug!("Initialized from {init_source:?}");

        Ok(Session {
            target: target.clone(),
            code,
            composer,
            frames,
            init_source,
        })
    }

    fn optimize(
        &self,
        session: Session<'a, B>,
    ) -> error::Result<(Session<'a, B>, Vec<IterationRecord>)> {
        let Session {
            target,
            mut code,
            composer,
            mut frames,
            init_source,
        } = session;

        let total = self.config.num_iterations;
        let schedule = self.config.schedule();
        let mut optimizer = AdamConfig::new()
            .with_epsilon(1e-8)
            .init::<B, LatentCode<B>>();
        let mut history = Vec::with_capacity(total);

        for step in 1..=total {
            // 1. Synthesize and score the current code
            let synthesized = self.generator.synthesize(&code);
            let terms = composer.compose(&target, synthesized, &code);
            let loss = terms.breakdown();
            if !loss.total.is_finite() {
                return Err(InversionError::NumericalDivergence {
                    step,
                    detail: format!("loss is {} ({loss:?})", loss.total),
                });
            }

            // 2. Backward pass & Adam step on every slot
            let grads = terms.total.backward();
            let grads = GradientsParams::from_grads(grads, &code);
            code = optimizer.step(self.config.learning_rate, code, grads);

            if !code.squared_norm().is_finite() {
                return Err(InversionError::NumericalDivergence {
                    step,
                    detail: "latent code became non-finite after the update".into(),
                });
            }

            debug!(
                "step {step}/{total}: total {:.6} (rec {:.6}, feat {:.6}, enc {:.6})",
                loss.total, loss.reconstruction, loss.perceptual, loss.regularization
            );
            history.push(IterationRecord { step, loss });

            if schedule.is_save_step(step) {
                info!("Step {step:06}/{total}: loss {:.6}", loss.total);
                frames.push(self.render(&code, step)?);
            }
        }

        Ok((
            Session {
                target,
                code,
                composer,
                frames,
                init_source,
            },
            history,
        ))
    }

    fn finalize(&self, session: Session<'a, B>, history: Vec<IterationRecord>) -> InversionOutput<B> {
        InversionOutput {
            code: session.code.valid(),
            frames: session.frames,
            history,
            init_source: session.init_source,
        }
    }

    /// Declared layout, which must equal what the generator consumes.
    fn resolve_layout(&self) -> error::Result<&LatentLayout> {
        let expected = self.generator.layout();
        match &self.config.layout {
            Some(declared) if declared != expected => Err(InversionError::shape_mismatch(
                "declared layout",
                expected,
                declared,
            )),
            _ => Ok(expected),
        }
    }

    fn render(&self, code: &LatentCode<B>, step: usize) -> error::Result<VisualizationFrame> {
        let image: Tensor<B, 4> = self.generator.synthesize(code).detach();
        Ok(VisualizationFrame {
            step,
            image: tensor_to_rgb(image)?,
        })
    }
}
