//! VGG-style feature extractor for the perceptual loss.

use burn::{
    config::Config,
    module::Module,
    nn::{
        PaddingConfig2d, Relu,
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
    },
    tensor::{Tensor, backend::Backend},
};

use super::FeatureExtractor;

/// ImageNet channel means in `[0, 255]` pixel units.
const IMAGENET_MEAN: [f32; 3] = [123.68, 116.78, 103.94];

#[derive(Config, Debug)]
pub struct VggFeaturesConfig {
    /// Output channels of each block; every block but the last ends in a 2x2 max pool.
    #[config(default = "vec![64, 128, 256, 512]")]
    pub block_channels: Vec<usize>,
    #[config(default = 2)]
    pub convs_per_block: usize,
    /// Must be 3: inputs are centred with the RGB ImageNet means.
    #[config(default = 3)]
    pub image_channels: usize,
}

#[derive(Module, Debug)]
pub struct VggBlock<B: Backend> {
    convs: Vec<Conv2d<B>>,
    pool: Option<MaxPool2d>,
}

/// Maps a `[-1, 1]` image to the flattened activations of its last conv block.
///
/// Inputs are rescaled to `[0, 255]` and mean-centred first, so the embedding
/// magnitudes are large; the perceptual loss weight compensates for that.
#[derive(Module, Debug)]
pub struct VggFeatures<B: Backend> {
    blocks: Vec<VggBlock<B>>,
    activation: Relu,
}

impl<B: Backend> VggFeatures<B> {
    pub fn new(config: &VggFeaturesConfig, device: &B::Device) -> Self {
        let conv = |in_ch, out_ch| {
            Conv2dConfig::new([in_ch, out_ch], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device)
        };

        let last = config.block_channels.len().saturating_sub(1);
        let mut in_ch = config.image_channels;
        let blocks = config
            .block_channels
            .iter()
            .enumerate()
            .map(|(idx, &out_ch)| {
                let convs = (0..config.convs_per_block)
                    .map(|i| conv(if i == 0 { in_ch } else { out_ch }, out_ch))
                    .collect();
                in_ch = out_ch;
                VggBlock {
                    convs,
                    pool: (idx < last)
                        .then(|| MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init()),
                }
            })
            .collect();

        Self {
            blocks,
            activation: Relu::new(),
        }
    }

    pub fn forward(&self, image: Tensor<B, 4>) -> Tensor<B, 2> {
        let device = image.device();
        let mean = Tensor::<B, 1>::from_floats(IMAGENET_MEAN, &device).reshape([1, 3, 1, 1]);

        let mut x = (image.add_scalar(1.0) * 127.5) - mean;
        for block in &self.blocks {
            for conv in &block.convs {
                x = self.activation.forward(conv.forward(x));
            }
            if let Some(pool) = &block.pool {
                x = pool.forward(x);
            }
        }

        x.flatten(1, 3)
    }
}

impl<B: Backend> FeatureExtractor<B> for VggFeatures<B> {
    fn features(&self, image: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward(image)
    }
}
