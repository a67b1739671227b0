use burn::{
    config::Config,
    module::Module,
    nn::{
        Linear, LinearConfig, PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig},
    },
    tensor::{Tensor, activation::leaky_relu, backend::Backend},
};

use super::{EncoderPrior, LatentGeometry};
use crate::latent::SlotTensor;

const LEAKY_SLOPE: f64 = 0.2;

// --- CONFIG ---

/// Configuration of the latent encoder.
///
/// The geometry must match the generator's for the estimates to fit its layout.
#[derive(Config, Debug)]
pub struct LatentEncoderConfig {
    #[config(default = "LatentGeometry::reference()")]
    pub geometry: LatentGeometry,
    #[config(default = 3)]
    pub image_channels: usize,
}

// --- ENCODER ---

/// Convolutional pyramid that predicts a latent estimate directly from an image.
///
/// Structure:
/// - stem conv at full resolution
/// - stride-2 convs halving the resolution down to `base_resolution`
/// - one 1×1 head per spatial block, reading the pyramid level at that block's resolution
/// - a linear head over globally pooled features for all style slots
#[derive(Module, Debug)]
pub struct LatentEncoder<B: Backend> {
    stem: Conv2d<B>,
    downs: Vec<Conv2d<B>>,
    spatial_heads: Vec<Conv2d<B>>,
    style_head: Linear<B>,
    channels: usize,
    layers_per_block: usize,
    style_slots: usize,
}

impl<B: Backend> LatentEncoder<B> {
    pub fn new(config: &LatentEncoderConfig, device: &B::Device) -> Self {
        let geometry = &config.geometry;
        let c = geometry.channels;
        let per_block = geometry.layers_per_block;
        let style_slots = geometry.style_blocks * per_block;

        let stem = Conv2dConfig::new([config.image_channels, c], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);

        // Each down conv halves H and W: R -> R/2 -> ... -> base.
        let downs = (0..geometry.downsamplings())
            .map(|_| {
                Conv2dConfig::new([c, c], [3, 3])
                    .with_stride([2, 2])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device)
            })
            .collect();

        // 2 maps (scale, shift) per channel per layer.
        let spatial_heads = (0..geometry.spatial_blocks)
            .map(|_| Conv2dConfig::new([c, 2 * c * per_block], [1, 1]).init(device))
            .collect();

        let style_head = LinearConfig::new(c, (c * style_slots).max(1)).init(device);

        Self {
            stem,
            downs,
            spatial_heads,
            style_head,
            channels: c,
            layers_per_block: per_block,
            style_slots,
        }
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// * `x` – image batch `[N, 3, R, R]` in `[-1, 1]`
    ///
    /// # Returns
    /// One tensor per latent slot, spatial slots first, in layer order.
    pub fn forward(&self, x: Tensor<B, 4>) -> Vec<SlotTensor<B>> {
        let c = self.channels;
        let levels = self.spatial_heads.len();

        // Pyramid level `l` has resolution `base << l`; the stem sits at level `downs.len()`.
        let mut level = self.downs.len();
        let mut x = leaky_relu(self.stem.forward(x), LEAKY_SLOPE);
        let mut pyramid = Vec::with_capacity(levels);
        if level < levels {
            pyramid.push(x.clone());
        }
        for down in &self.downs {
            x = leaky_relu(down.forward(x), LEAKY_SLOPE);
            level -= 1;
            if level < levels {
                pyramid.push(x.clone());
            }
        }
        pyramid.reverse();

        let mut slots = Vec::with_capacity(levels * self.layers_per_block + self.style_slots);

        for (head, features) in self.spatial_heads.iter().zip(pyramid) {
            let maps = head.forward(features);
            let [n, _, h, w] = maps.dims();
            for layer in 0..self.layers_per_block {
                let slot = maps
                    .clone()
                    .narrow(1, layer * 2 * c, 2 * c)
                    .reshape([n, 2, c, h, w]);
                slots.push(SlotTensor::Spatial(slot));
            }
        }

        if self.style_slots > 0 {
            let [n, _, _, _] = x.dims();
            let pooled = x.mean_dim(3).mean_dim(2).reshape([n, c]);
            let styles = self.style_head.forward(pooled);
            for slot in 0..self.style_slots {
                slots.push(SlotTensor::Style(styles.clone().narrow(1, slot * c, c)));
            }
        }

        slots
    }
}

impl<B: Backend> EncoderPrior<B> for LatentEncoder<B> {
    fn encode(&self, image: Tensor<B, 4>) -> Vec<SlotTensor<B>> {
        self.forward(image)
    }
}
