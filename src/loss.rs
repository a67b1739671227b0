use burn::{
    prelude::ElementConversion,
    tensor::{Tensor, backend::Backend},
};
use serde::{Deserialize, Serialize};

use crate::error::{InversionError, Result};
use crate::image_ops::TargetImage;
use crate::latent::{LatentCode, SlotTensor};
use crate::models::{EncoderPrior, FeatureExtractor};

// --- WEIGHTS ---

/// Scales of the three loss terms, fixed for a whole run.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    pub reconstruction: f64,
    pub perceptual: f64,
    pub regularization: f64,
}

impl LossWeights {
    /// Validated weights; every weight must be finite and non-negative.
    pub fn new(reconstruction: f64, perceptual: f64, regularization: f64) -> Result<Self> {
        for (name, value) in [
            ("reconstruction", reconstruction),
            ("perceptual", perceptual),
            ("regularization", regularization),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(InversionError::InvalidConfig(format!(
                    "{name} loss weight must be finite and non-negative, got {value}"
                )));
            }
        }
        Ok(Self {
            reconstruction,
            perceptual,
            regularization,
        })
    }

    /// Plain pixel reconstruction: perceptual and regularization terms off.
    pub fn pixel_only() -> Self {
        Self {
            reconstruction: 1.0,
            perceptual: 0.0,
            regularization: 0.0,
        }
    }
}

impl Default for LossWeights {
    /// `1.0` pixel, `5e-5` perceptual (raw feature distances are large), `2.0` encoder prior.
    fn default() -> Self {
        Self {
            reconstruction: 1.0,
            perceptual: 5e-5,
            regularization: 2.0,
        }
    }
}

/// Which image the encoder prior is evaluated on at every step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriorAnchor {
    /// Distance to the encoder's estimate for the target image.
    #[default]
    Target,
    /// Distance to the encoder's estimate for the current reconstruction, `||z - E(G(z))||²`.
    Reconstruction,
}

// --- TERMS ---

/// Loss terms of one step, still attached to the autodiff graph.
///
/// `perceptual` and `regularization` are `None` when their weight is zero or
/// their network is not attached.
#[derive(Debug)]
pub struct LossTerms<B: Backend> {
    pub reconstruction: Tensor<B, 1>,
    pub perceptual: Option<Tensor<B, 1>>,
    pub regularization: Option<Tensor<B, 1>>,
    /// Weighted sum of the terms; the value to differentiate.
    pub total: Tensor<B, 1>,
}

/// Host-side copy of [`LossTerms`]; individual terms are unweighted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct LossBreakdown {
    pub reconstruction: f64,
    pub perceptual: f64,
    pub regularization: f64,
    pub total: f64,
}

impl<B: Backend> LossTerms<B> {
    pub fn breakdown(&self) -> LossBreakdown {
        let read = |t: &Tensor<B, 1>| t.clone().into_scalar().elem::<f64>();
        LossBreakdown {
            reconstruction: read(&self.reconstruction),
            perceptual: self.perceptual.as_ref().map(read).unwrap_or(0.0),
            regularization: self.regularization.as_ref().map(read).unwrap_or(0.0),
            total: read(&self.total),
        }
    }
}

// --- COMPOSER ---

/// Composes the inversion loss for one target.
///
/// ```text
/// total = w_rec  · mse(x, G(z))
///       + w_feat · mse(F(x), F(G(z)))
///       + w_enc  · mse(z, E(anchor))
/// ```
///
/// The target's perceptual features and, for [`PriorAnchor::Target`], its
/// encoder estimate are computed once, when the network is attached.
/// `compose` itself has no side effects.
pub struct LossComposer<'a, B: Backend> {
    weights: LossWeights,
    perceptual: Option<(&'a dyn FeatureExtractor<B>, Tensor<B, 2>)>,
    prior: Option<Prior<'a, B>>,
}

/// Encoder prior as evaluated by `compose`.
enum Prior<'a, B: Backend> {
    /// Detached estimate for the target, encoded once.
    Target(Vec<SlotTensor<B>>),
    /// Re-encodes every synthesized image.
    Reconstruction(&'a dyn EncoderPrior<B>),
}

impl<'a, B: Backend> LossComposer<'a, B> {
    pub fn new(weights: LossWeights) -> Self {
        Self {
            weights,
            perceptual: None,
            prior: None,
        }
    }

    /// Attaches the feature extractor; ignored when the perceptual weight is zero.
    pub fn with_perceptual(
        mut self,
        extractor: &'a dyn FeatureExtractor<B>,
        target: &TargetImage<B>,
    ) -> Self {
        if self.weights.perceptual > 0.0 {
            let target_features = extractor.features(target.tensor()).detach();
            self.perceptual = Some((extractor, target_features));
        }
        self
    }

    /// Attaches the encoder prior; ignored when the regularization weight is zero.
    pub fn with_prior(
        mut self,
        encoder: &'a dyn EncoderPrior<B>,
        anchor: PriorAnchor,
        target: &TargetImage<B>,
    ) -> Self {
        if self.weights.regularization > 0.0 {
            self.prior = Some(match anchor {
                PriorAnchor::Target => Prior::Target(
                    encoder
                        .encode(target.tensor())
                        .into_iter()
                        .map(SlotTensor::detach)
                        .collect(),
                ),
                PriorAnchor::Reconstruction => Prior::Reconstruction(encoder),
            });
        }
        self
    }

    pub fn weights(&self) -> &LossWeights {
        &self.weights
    }

    pub fn compose(
        &self,
        target: &TargetImage<B>,
        synthesized: Tensor<B, 4>,
        code: &LatentCode<B>,
    ) -> LossTerms<B> {
        let weights = &self.weights;

        let reconstruction = mse(target.tensor(), synthesized.clone());
        let mut total = reconstruction.clone().mul_scalar(weights.reconstruction);

        let mut perceptual = None;
        if let Some((extractor, target_features)) = &self.perceptual {
            let term = mse(target_features.clone(), extractor.features(synthesized.clone()));
            total = total + term.clone().mul_scalar(weights.perceptual);
            perceptual = Some(term);
        }

        let mut regularization = None;
        if let Some(prior) = &self.prior {
            let term = match prior {
                Prior::Target(estimate) => code.mse_to(estimate.clone()),
                Prior::Reconstruction(encoder) => encoder.prior_distance(code, synthesized),
            };
            total = total + term.clone().mul_scalar(weights.regularization);
            regularization = Some(term);
        }

        LossTerms {
            reconstruction,
            perceptual,
            regularization,
            total,
        }
    }
}

fn mse<B: Backend, const D: usize>(a: Tensor<B, D>, b: Tensor<B, D>) -> Tensor<B, 1> {
    (a - b).powf_scalar(2.0).mean()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latent::LatentLayout;
    use std::cell::Cell;
    use approx::assert_relative_eq;
    use burn::backend::NdArray;

    type B = NdArray;

    /// Always predicts the all-zero code.
    struct ZeroEncoder {
        layout: LatentLayout,
    }

    impl EncoderPrior<B> for ZeroEncoder {
        fn encode(&self, image: Tensor<B, 4>) -> Vec<SlotTensor<B>> {
            LatentCode::<B>::zeros(&self.layout, &image.device()).slots()
        }
    }

    /// Zero estimates, counting how often it is asked.
    struct CountingEncoder {
        layout: LatentLayout,
        calls: Cell<usize>,
    }

    impl EncoderPrior<B> for CountingEncoder {
        fn encode(&self, image: Tensor<B, 4>) -> Vec<SlotTensor<B>> {
            self.calls.set(self.calls.get() + 1);
            LatentCode::<B>::zeros(&self.layout, &image.device()).slots()
        }
    }

    /// Mean over each image row, enough to exercise the perceptual path.
    struct RowMeans;

    impl FeatureExtractor<B> for RowMeans {
        fn features(&self, image: Tensor<B, 4>) -> Tensor<B, 2> {
            image.mean_dim(3).flatten(1, 3)
        }
    }

    fn target(value: f32) -> TargetImage<B> {
        let tensor = Tensor::<B, 4>::full([1, 3, 4, 4], value, &Default::default());
        TargetImage::from_tensor(tensor).unwrap()
    }

    #[test]
    fn weights_reject_negative_or_nan() {
        assert!(LossWeights::new(1.0, -1.0, 0.0).is_err());
        assert!(LossWeights::new(f64::NAN, 0.0, 0.0).is_err());
        assert_eq!(LossWeights::new(1.0, 5e-5, 2.0).unwrap(), LossWeights::default());
    }

    #[test]
    fn perfect_reconstruction_costs_nothing() {
        let layout: LatentLayout = "1x4".parse().unwrap();
        let code = LatentCode::<B>::zeros(&layout, &Default::default());
        let target = target(0.25);

        let composer = LossComposer::new(LossWeights::pixel_only());
        let terms = composer.compose(&target, target.tensor(), &code);
        assert_eq!(terms.breakdown().total, 0.0);
        assert!(terms.perceptual.is_none());
        assert!(terms.regularization.is_none());
    }

    #[test]
    fn total_is_the_weighted_sum() {
        let layout: LatentLayout = "1x4".parse().unwrap();
        let device = Default::default();
        let code = LatentCode::<B>::from_slots(
            vec![SlotTensor::Style(Tensor::full([1, 4], 2.0, &device))],
            &layout,
        )
        .unwrap();
        let encoder = ZeroEncoder {
            layout: layout.clone(),
        };
        let target = target(0.0);
        let synthesized = Tensor::<B, 4>::full([1, 3, 4, 4], 0.5, &device);

        let weights = LossWeights::new(2.0, 3.0, 0.5).unwrap();
        let composer = LossComposer::new(weights)
            .with_perceptual(&RowMeans, &target)
            .with_prior(&encoder, PriorAnchor::Target, &target);
        let loss = composer.compose(&target, synthesized, &code).breakdown();

        assert_relative_eq!(loss.reconstruction, 0.25, epsilon = 1e-6);
        assert_relative_eq!(loss.perceptual, 0.25, epsilon = 1e-6);
        assert_relative_eq!(loss.regularization, 4.0, epsilon = 1e-6);
        assert_relative_eq!(loss.total, 2.0 * 0.25 + 3.0 * 0.25 + 0.5 * 4.0, epsilon = 1e-6);
    }

    #[test]
    fn zero_weights_skip_their_networks() {
        let layout: LatentLayout = "1x4".parse().unwrap();
        let encoder = ZeroEncoder {
            layout: layout.clone(),
        };
        let target = target(0.0);
        let composer = LossComposer::new(LossWeights::pixel_only())
            .with_perceptual(&RowMeans, &target)
            .with_prior(&encoder, PriorAnchor::Reconstruction, &target);

        let code = LatentCode::<B>::zeros(&layout, &Default::default());
        let terms = composer.compose(&target, target.tensor(), &code);
        assert!(terms.perceptual.is_none());
        assert!(terms.regularization.is_none());
    }

    #[test]
    fn target_estimate_is_encoded_once() {
        let layout: LatentLayout = "1x4".parse().unwrap();
        let encoder = CountingEncoder {
            layout: layout.clone(),
            calls: Cell::new(0),
        };
        let target = target(0.0);
        let code = LatentCode::<B>::zeros(&layout, &Default::default());

        let weights = LossWeights::new(1.0, 0.0, 1.0).unwrap();
        let composer =
            LossComposer::new(weights).with_prior(&encoder, PriorAnchor::Target, &target);
        for _ in 0..3 {
            let terms = composer.compose(&target, target.tensor(), &code);
            assert_eq!(terms.breakdown().regularization, 0.0);
        }
        assert_eq!(encoder.calls.get(), 1);

        let composer =
            LossComposer::new(weights).with_prior(&encoder, PriorAnchor::Reconstruction, &target);
        for _ in 0..3 {
            composer.compose(&target, target.tensor(), &code);
        }
        assert_eq!(encoder.calls.get(), 4);
    }
}
