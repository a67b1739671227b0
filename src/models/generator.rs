use burn::{
    config::Config,
    module::{Ignored, Module, Param},
    nn::{
        Linear, LinearConfig, PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
    },
    tensor::{Distribution, Tensor, activation::leaky_relu, backend::Backend},
};

use super::{Generator, LatentGeometry};
use crate::latent::{LatentCode, LatentLayout};

/// Negative slope of every leaky ReLU in the synthesis network.
const LEAKY_SLOPE: f64 = 0.2;

/// Numerical floor for the instance-norm variance.
const NORM_EPS: f64 = 1e-8;

// --- CONFIG ---

/// Configuration of the spatial-aware style generator.
#[derive(Config, Debug)]
pub struct StyleGeneratorConfig {
    /// Slot geometry; determines both the latent layout and the output resolution.
    #[config(default = "LatentGeometry::reference()")]
    pub geometry: LatentGeometry,
    /// Number of output image channels.
    #[config(default = 3)]
    pub image_channels: usize,
}

// --- BLOCKS ---

/// Early block: optional 2x upsample, then one conv per layer, each
/// modulated by a spatial `(scale, shift)` map.
#[derive(Module, Debug)]
pub struct SpatialBlock<B: Backend> {
    upsample: Option<ConvTranspose2d<B>>,
    convs: Vec<Conv2d<B>>,
}

/// Late block: 2x upsample, then one conv per layer, each followed by
/// AdaIN driven by a style vector.
#[derive(Module, Debug)]
pub struct StyleBlock<B: Backend> {
    upsample: ConvTranspose2d<B>,
    convs: Vec<Conv2d<B>>,
    affines: Vec<Linear<B>>,
}

// --- GENERATOR ---

/// Frozen synthesis network mapping a [`LatentCode`] to a `[1, 3, R, R]` image in `[-1, 1]`.
///
/// Structure:
/// - learned constant at `base_resolution`
/// - `spatial_blocks` blocks consuming spatial slots (`base`, `2·base`, …)
/// - `style_blocks` blocks consuming style slots
/// - 1×1 `to_rgb` projection + `tanh`
#[derive(Module, Debug)]
pub struct StyleGenerator<B: Backend> {
    constant: Param<Tensor<B, 4>>,
    spatial_blocks: Vec<SpatialBlock<B>>,
    style_blocks: Vec<StyleBlock<B>>,
    to_rgb: Conv2d<B>,
    /// Slots expected by `synthesize`, derived from the geometry.
    layout: Ignored<LatentLayout>,
    resolution: usize,
    channels: usize,
}

impl<B: Backend> StyleGenerator<B> {
    /// Construct a generator with freshly initialized weights.
    ///
    /// # Arguments
    /// * `config` – generator configuration
    /// * `device` – backend device where parameters are allocated
    pub fn new(config: &StyleGeneratorConfig, device: &B::Device) -> Self {
        let geometry = &config.geometry;
        let c = geometry.channels;
        let base = geometry.base_resolution;

        let conv = || {
            Conv2dConfig::new([c, c], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };
        // Same doubling transpose conv as a classic conv decoder: 3x3, stride 2, pad 1, out-pad 1.
        let upsample = || {
            ConvTranspose2dConfig::new([c, c], [3, 3])
                .with_stride([2, 2])
                .with_padding([1, 1])
                .with_padding_out([1, 1])
                .init(device)
        };

        let spatial_blocks = (0..geometry.spatial_blocks)
            .map(|b| SpatialBlock {
                upsample: (b > 0).then(upsample),
                convs: (0..geometry.layers_per_block).map(|_| conv()).collect(),
            })
            .collect();

        let style_blocks = (0..geometry.style_blocks)
            .map(|_| StyleBlock {
                upsample: upsample(),
                convs: (0..geometry.layers_per_block).map(|_| conv()).collect(),
                affines: (0..geometry.layers_per_block)
                    .map(|_| LinearConfig::new(c, 2 * c).init(device))
                    .collect(),
            })
            .collect();

        let constant = Tensor::random([1, c, base, base], Distribution::Normal(0.0, 1.0), device);

        Self {
            constant: Param::from_tensor(constant),
            spatial_blocks,
            style_blocks,
            to_rgb: Conv2dConfig::new([c, config.image_channels], [1, 1]).init(device),
            layout: Ignored(geometry.layout()),
            resolution: geometry.resolution(),
            channels: c,
        }
    }

    /// Forward pass.
    ///
    /// # Panics
    /// If `code` does not follow this generator's layout; the inverter checks
    /// layouts before optimization starts.
    pub fn forward(&self, code: &LatentCode<B>) -> Tensor<B, 4> {
        let spatial = code.spatial();
        let style = code.style();
        let mut spatial = spatial.into_iter();
        let mut style = style.into_iter();

        let mut x = self.constant.val();

        for block in &self.spatial_blocks {
            if let Some(up) = &block.upsample {
                x = leaky_relu(up.forward(x), LEAKY_SLOPE);
            }
            for conv in &block.convs {
                let slot = spatial.next().expect("latent code is missing a spatial slot");
                x = leaky_relu(modulate(conv.forward(x), slot), LEAKY_SLOPE);
            }
        }

        for block in &self.style_blocks {
            x = leaky_relu(block.upsample.forward(x), LEAKY_SLOPE);
            for (conv, affine) in block.convs.iter().zip(&block.affines) {
                let w = style.next().expect("latent code is missing a style slot");
                x = leaky_relu(self.adain(conv.forward(x), affine.forward(w)), LEAKY_SLOPE);
            }
        }

        self.to_rgb.forward(x).tanh()
    }

    /// Adaptive instance norm: normalize each channel, then apply the style's scale and bias.
    fn adain(&self, x: Tensor<B, 4>, style: Tensor<B, 2>) -> Tensor<B, 4> {
        let c = self.channels;
        let batch = style.dims()[0];

        let mean = x.clone().mean_dim(3).mean_dim(2);
        let centered = x - mean;
        let var = centered.clone().powf_scalar(2.0).mean_dim(3).mean_dim(2);
        let normalized = centered / var.add_scalar(NORM_EPS).sqrt();

        let scale = style.clone().narrow(1, 0, c).reshape([batch, c, 1, 1]);
        let bias = style.narrow(1, c, c).reshape([batch, c, 1, 1]);
        normalized * scale.add_scalar(1.0) + bias
    }
}

/// Applies a spatial slot `[N, 2, C, H, W]` as `x * (1 + scale) + shift`.
fn modulate<B: Backend>(x: Tensor<B, 4>, slot: Tensor<B, 5>) -> Tensor<B, 4> {
    let [n, _, c, h, w] = slot.dims();
    let scale = slot.clone().narrow(1, 0, 1).reshape([n, c, h, w]);
    let shift = slot.narrow(1, 1, 1).reshape([n, c, h, w]);
    x * scale.add_scalar(1.0) + shift
}

impl<B: Backend> Generator<B> for StyleGenerator<B> {
    fn layout(&self) -> &LatentLayout {
        &self.layout.0
    }

    fn resolution(&self) -> usize {
        self.resolution
    }

    fn synthesize(&self, code: &LatentCode<B>) -> Tensor<B, 4> {
        self.forward(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    #[test]
    fn output_matches_declared_resolution() {
        let device = Default::default();
        let config = StyleGeneratorConfig::new().with_geometry(LatentGeometry::tiny());
        let generator = StyleGenerator::<B>::new(&config, &device);

        assert_eq!(generator.layout(), &LatentGeometry::tiny().layout());
        assert_eq!(generator.resolution(), 16);

        let code = LatentCode::random(generator.layout(), 0, &device);
        let image = generator.synthesize(&code);
        assert_eq!(image.dims(), [1, 3, 16, 16]);

        let max = image.abs().max().into_scalar();
        assert!(max <= 1.0);
    }
}
