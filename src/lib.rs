//! Real-image inversion into the spatial-aware latent space of a frozen
//! style-based generator.
//!
//! Given a target photo, [`inverter::Inverter`] searches for a
//! [`latent::LatentCode`] whose synthesized image matches it, by Adam descent on
//!
//! ```text
//! loss = w_rec · pixel MSE + w_feat · perceptual MSE + w_enc · encoder prior distance
//! ```
//!
//! and keeps intermediate reconstructions for inspection. [`batch::run_batch`]
//! drives one inversion per listed image and writes PNGs plus an HTML report.

pub mod batch;
pub mod error;
pub mod image_ops;
pub mod inverter;
pub mod latent;
pub mod loss;
pub mod models;
pub mod report;
pub mod telemetry;

pub use error::{InversionError, Result};
pub use image_ops::TargetImage;
pub use inverter::{
    FrameSchedule, InitSource, InitStrategy, InversionConfig, InversionOutput, Inverter,
    IterationRecord, VisualizationFrame,
};
pub use latent::{LatentCode, LatentLayout, SlotShape, SlotTensor};
pub use loss::{LossBreakdown, LossComposer, LossTerms, LossWeights, PriorAnchor};
pub use models::{EncoderPrior, FeatureExtractor, Generator, LatentGeometry, ModelBundle};

/// Channels of every image handled by the crate (RGB).
pub const IMAGE_CHANNELS: usize = 3;

/// Lower bound of the generator's pixel range.
pub const PIXEL_MIN: f32 = -1.0;

/// Upper bound of the generator's pixel range.
pub const PIXEL_MAX: f32 = 1.0;
