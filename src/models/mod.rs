//! Frozen networks the inverter talks to, and the burn implementations shipped with the crate.
//!
//! The inverter only sees the three traits below; [`ModelBundle`] loads the
//! concrete networks from a model directory:
//!
//! ```text
//! <model_dir>/<model_name>/generator.config.json   generator.bin
//! <model_dir>/<model_name>/perceptual.config.json  perceptual.bin
//! <model_dir>/<model_name>/encoder.config.json     encoder.bin      (optional)
//! ```

pub mod encoder;
pub mod generator;
pub mod perceptual;

use std::path::{Path, PathBuf};

use burn::{
    config::Config,
    module::Module,
    record::{BinFileRecorder, FullPrecisionSettings, Record, Recorder},
    tensor::{Tensor, backend::Backend},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::IMAGE_CHANNELS;
use crate::error::{InversionError, Result};
use crate::latent::{LatentCode, LatentLayout, SlotShape, SlotTensor};

use encoder::{LatentEncoder, LatentEncoderConfig};
use generator::{StyleGenerator, StyleGeneratorConfig};
use perceptual::{VggFeatures, VggFeaturesConfig};

// --- INTERFACES ---

/// Frozen image synthesis network.
pub trait Generator<B: Backend> {
    /// Latent slots `synthesize` expects, in layer order.
    fn layout(&self) -> &LatentLayout;

    /// Side length of the square output image.
    fn resolution(&self) -> usize;

    /// Renders `code` as a `[1, 3, R, R]` image in `[-1, 1]`.
    fn synthesize(&self, code: &LatentCode<B>) -> Tensor<B, 4>;
}

/// Frozen network mapping an image to a perceptual embedding `[N, D]`.
pub trait FeatureExtractor<B: Backend> {
    fn features(&self, image: Tensor<B, 4>) -> Tensor<B, 2>;
}

/// Frozen network predicting a latent code directly from an image.
///
/// It plays two roles: seeding the search once (`estimate_initial`) and
/// regularizing every step (`prior_distance`).
pub trait EncoderPrior<B: Backend> {
    /// Raw per-slot estimate for `image`.
    fn encode(&self, image: Tensor<B, 4>) -> Vec<SlotTensor<B>>;

    /// Initial code for `image`, reshaped to `layout`.
    ///
    /// # Errors
    /// `ShapeMismatch` when the estimate cannot be reshaped into the layout.
    fn estimate_initial(&self, image: Tensor<B, 4>, layout: &LatentLayout) -> Result<LatentCode<B>> {
        LatentCode::from_slots(self.encode(image), layout)
    }

    /// Mean squared distance between `code` and the estimate for `image`.
    fn prior_distance(&self, code: &LatentCode<B>, image: Tensor<B, 4>) -> Tensor<B, 1> {
        code.mse_to(self.encode(image))
    }
}

// --- GEOMETRY ---

/// Shared shape parameters of the generator and encoder.
///
/// Spatial block `b` works at `base_resolution << b`; every style block doubles
/// the resolution again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatentGeometry {
    pub channels: usize,
    pub base_resolution: usize,
    pub spatial_blocks: usize,
    pub layers_per_block: usize,
    pub style_blocks: usize,
}

impl LatentGeometry {
    /// 512 channels, 4x4 base, four spatial blocks, three style blocks, two layers each: 256x256 output.
    pub fn reference() -> Self {
        Self {
            channels: 512,
            base_resolution: 4,
            spatial_blocks: 4,
            layers_per_block: 2,
            style_blocks: 3,
        }
    }

    /// Number of resolution doublings between the base and the output.
    pub fn downsamplings(&self) -> usize {
        self.spatial_blocks.saturating_sub(1) + self.style_blocks
    }

    pub fn resolution(&self) -> usize {
        self.base_resolution << self.downsamplings()
    }

    pub fn layout(&self) -> LatentLayout {
        let c = self.channels;
        let mut slots = Vec::new();
        for block in 0..self.spatial_blocks {
            let res = self.base_resolution << block;
            for _ in 0..self.layers_per_block {
                slots.push(SlotShape::Spatial([1, 2, c, res, res]));
            }
        }
        for _ in 0..self.style_blocks * self.layers_per_block {
            slots.push(SlotShape::Style([1, c]));
        }
        LatentLayout::new_unchecked(slots)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels == 0
            || self.base_resolution == 0
            || self.spatial_blocks == 0
            || self.layers_per_block == 0
        {
            return Err(InversionError::InvalidConfig(format!(
                "geometry needs non-zero channels, base resolution, spatial blocks and layers: {self:?}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
impl LatentGeometry {
    /// 4 channels, 16x16 output; small enough for CPU tests.
    pub(crate) fn tiny() -> Self {
        Self {
            channels: 4,
            base_resolution: 4,
            spatial_blocks: 2,
            layers_per_block: 1,
            style_blocks: 1,
        }
    }
}

// --- LOADING ---

/// The networks of one named model, frozen and ready for inversion.
pub struct ModelBundle<B: Backend> {
    pub generator: StyleGenerator<B>,
    pub perceptual: VggFeatures<B>,
    /// `None` when the model directory ships no encoder.
    pub encoder: Option<LatentEncoder<B>>,
    configs: BundleConfigs,
}

#[derive(Clone, Debug)]
struct BundleConfigs {
    generator: StyleGeneratorConfig,
    perceptual: VggFeaturesConfig,
    encoder: Option<LatentEncoderConfig>,
}

impl<B: Backend> ModelBundle<B> {
    /// Freshly initialized (untrained) networks.
    ///
    /// # Errors
    /// `InvalidConfig` for a degenerate geometry, `ModelUnavailable` for a
    /// network that does not work on RGB images.
    pub fn new(
        generator: StyleGeneratorConfig,
        perceptual: VggFeaturesConfig,
        encoder: Option<LatentEncoderConfig>,
        device: &B::Device,
    ) -> Result<Self> {
        generator.geometry.validate()?;
        check_image_channels("generator", generator.image_channels)?;
        check_image_channels("perceptual", perceptual.image_channels)?;
        if let Some(config) = &encoder {
            config.geometry.validate()?;
            check_image_channels("encoder", config.image_channels)?;
        }
        Ok(Self {
            generator: StyleGenerator::new(&generator, device).no_grad(),
            perceptual: VggFeatures::new(&perceptual, device).no_grad(),
            encoder: encoder
                .as_ref()
                .map(|config| LatentEncoder::new(config, device).no_grad()),
            configs: BundleConfigs {
                generator,
                perceptual,
                encoder,
            },
        })
    }

    /// Loads `<model_dir>/<model_name>`.
    ///
    /// # Errors
    /// - `Precondition` if the model directory does not exist.
    /// - `ModelUnavailable` if the generator or perceptual network fails to
    ///   load or is not built for RGB, or if encoder files exist but cannot be
    ///   loaded.
    pub fn load(model_dir: &Path, model_name: &str, device: &B::Device) -> Result<Self> {
        let root = model_dir.join(model_name);
        if !root.is_dir() {
            return Err(InversionError::Precondition(format!(
                "model directory {} does not exist",
                root.display()
            )));
        }

        info!("Loading generator from {}", root.display());
        let generator_config: StyleGeneratorConfig = load_config(&root, "generator")?;
        generator_config
            .geometry
            .validate()
            .map_err(|err| InversionError::model_unavailable("generator", err))?;
        check_image_channels("generator", generator_config.image_channels)?;
        let generator = StyleGenerator::new(&generator_config, device)
            .load_record(load_record::<B, _>(&root, "generator", device)?)
            .no_grad();

        info!("Loading perceptual network from {}", root.display());
        let perceptual_config: VggFeaturesConfig = load_config(&root, "perceptual")?;
        check_image_channels("perceptual", perceptual_config.image_channels)?;
        let perceptual = VggFeatures::new(&perceptual_config, device)
            .load_record(load_record::<B, _>(&root, "perceptual", device)?)
            .no_grad();

        let (encoder, encoder_config) = if config_path(&root, "encoder").exists() {
            info!("Loading encoder from {}", root.display());
            let config: LatentEncoderConfig = load_config(&root, "encoder")?;
            config
                .geometry
                .validate()
                .map_err(|err| InversionError::model_unavailable("encoder", err))?;
            check_image_channels("encoder", config.image_channels)?;
            let encoder = LatentEncoder::new(&config, device)
                .load_record(load_record::<B, _>(&root, "encoder", device)?)
                .no_grad();
            (Some(encoder), Some(config))
        } else {
            warn!("No encoder found in {}; encoder prior disabled", root.display());
            (None, None)
        };

        Ok(Self {
            generator,
            perceptual,
            encoder,
            configs: BundleConfigs {
                generator: generator_config,
                perceptual: perceptual_config,
                encoder: encoder_config,
            },
        })
    }

    /// Writes configs and weights in the layout [`ModelBundle::load`] expects.
    pub fn save(&self, model_dir: &Path, model_name: &str) -> Result<()> {
        let root = model_dir.join(model_name);
        std::fs::create_dir_all(&root)?;

        self.configs.generator.save(config_path(&root, "generator"))?;
        save_record::<B, _>(self.generator.clone(), &root, "generator")?;

        self.configs.perceptual.save(config_path(&root, "perceptual"))?;
        save_record::<B, _>(self.perceptual.clone(), &root, "perceptual")?;

        if let (Some(encoder), Some(config)) = (&self.encoder, &self.configs.encoder) {
            config.save(config_path(&root, "encoder"))?;
            save_record::<B, _>(encoder.clone(), &root, "encoder")?;
        }
        Ok(())
    }
}

fn check_image_channels(model: &str, channels: usize) -> Result<()> {
    if channels != IMAGE_CHANNELS {
        return Err(InversionError::model_unavailable(
            model,
            format!("built for {channels}-channel images, inversion needs {IMAGE_CHANNELS}"),
        ));
    }
    Ok(())
}

fn config_path(root: &Path, name: &str) -> PathBuf {
    root.join(format!("{name}.config.json"))
}

fn load_config<C: Config>(root: &Path, name: &str) -> Result<C> {
    C::load(config_path(root, name)).map_err(|err| InversionError::model_unavailable(name, err))
}

fn load_record<B: Backend, R: Record<B>>(
    root: &Path,
    name: &str,
    device: &B::Device,
) -> Result<R> {
    BinFileRecorder::<FullPrecisionSettings>::new()
        .load(root.join(name), device)
        .map_err(|err| InversionError::model_unavailable(name, format!("{err:?}")))
}

fn save_record<B: Backend, M: Module<B>>(module: M, root: &Path, name: &str) -> Result<()> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    module
        .save_file(root.join(name), &recorder)
        .map_err(|err| InversionError::Io(std::io::Error::other(format!("{err:?}"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use tempfile::tempdir;

    type B = NdArray;

    fn tiny_bundle(with_encoder: bool) -> ModelBundle<B> {
        let geometry = LatentGeometry::tiny();
        ModelBundle::new(
            StyleGeneratorConfig::new().with_geometry(geometry),
            VggFeaturesConfig::new().with_block_channels(vec![4, 8]),
            with_encoder.then(|| LatentEncoderConfig::new().with_geometry(geometry)),
            &Default::default(),
        )
        .unwrap()
    }

    #[test]
    fn bundle_round_trips_through_model_dir() {
        let dir = tempdir().unwrap();
        let device = Default::default();
        let bundle = tiny_bundle(true);
        bundle.save(dir.path(), "tiny").unwrap();

        let loaded = ModelBundle::<B>::load(dir.path(), "tiny", &device).unwrap();
        assert!(loaded.encoder.is_some());
        assert_eq!(loaded.generator.layout(), bundle.generator.layout());

        let code = LatentCode::random(bundle.generator.layout(), 5, &device);
        let a: Vec<f32> = bundle.generator.synthesize(&code).into_data().to_vec().unwrap();
        let b: Vec<f32> = loaded.generator.synthesize(&code).into_data().to_vec().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn missing_encoder_is_optional() {
        let dir = tempdir().unwrap();
        tiny_bundle(false).save(dir.path(), "plain").unwrap();

        let loaded = ModelBundle::<B>::load(dir.path(), "plain", &Default::default()).unwrap();
        assert!(loaded.encoder.is_none());
    }

    #[test]
    fn missing_model_dir_is_a_precondition_error() {
        let dir = tempdir().unwrap();
        let result = ModelBundle::<B>::load(dir.path(), "nope", &Default::default());
        assert!(matches!(result, Err(InversionError::Precondition(_))));
    }

    #[test]
    fn corrupt_weights_make_the_model_unavailable() {
        let dir = tempdir().unwrap();
        tiny_bundle(false).save(dir.path(), "broken").unwrap();
        std::fs::write(dir.path().join("broken").join("generator.bin"), b"not a record").unwrap();

        let result = ModelBundle::<B>::load(dir.path(), "broken", &Default::default());
        assert!(matches!(
            result,
            Err(InversionError::ModelUnavailable { ref model, .. }) if model == "generator"
        ));
    }

    #[test]
    fn non_rgb_networks_are_rejected() {
        let geometry = LatentGeometry::tiny();
        let result = ModelBundle::<B>::new(
            StyleGeneratorConfig::new()
                .with_geometry(geometry)
                .with_image_channels(1),
            VggFeaturesConfig::new().with_block_channels(vec![4, 8]),
            None,
            &Default::default(),
        );
        assert!(matches!(
            result,
            Err(InversionError::ModelUnavailable { ref model, .. }) if model == "generator"
        ));
    }

    #[test]
    fn non_rgb_perceptual_config_fails_the_load() {
        let dir = tempdir().unwrap();
        tiny_bundle(false).save(dir.path(), "gray").unwrap();
        VggFeaturesConfig::new()
            .with_block_channels(vec![4, 8])
            .with_image_channels(1)
            .save(dir.path().join("gray").join("perceptual.config.json"))
            .unwrap();

        let result = ModelBundle::<B>::load(dir.path(), "gray", &Default::default());
        assert!(matches!(
            result,
            Err(InversionError::ModelUnavailable { ref model, .. }) if model == "perceptual"
        ));
    }
}
