use std::fmt;
use std::path::Path;
use std::str::FromStr;

use burn::{
    module::{Ignored, Module, Param},
    prelude::ElementConversion,
    record::{BinFileRecorder, FullPrecisionSettings},
    tensor::{Tensor, TensorData, backend::Backend},
};
use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::error::{InversionError, Result};

// --- SLOT SHAPES ---

/// Declared shape of one latent slot.
///
/// A layered generator consumes two kinds of codes:
/// - `Spatial([1, 2, C, H, W])`: a per-pixel scale/shift pair for an early block.
/// - `Style([1, C])`: a per-channel style vector for a late block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotShape {
    Spatial([usize; 5]),
    Style([usize; 2]),
}

impl SlotShape {
    pub fn dims(&self) -> &[usize] {
        match self {
            SlotShape::Spatial(dims) => dims,
            SlotShape::Style(dims) => dims,
        }
    }

    pub fn num_elements(&self) -> usize {
        self.dims().iter().product()
    }

    pub fn is_spatial(&self) -> bool {
        matches!(self, SlotShape::Spatial(_))
    }
}

impl fmt::Display for SlotShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.dims().iter().map(usize::to_string).collect();
        write!(f, "{}", dims.join("x"))
    }
}

impl FromStr for SlotShape {
    type Err = InversionError;

    /// Parses `1x2x512x4x4` (spatial) or `1x512` (style).
    fn from_str(s: &str) -> Result<Self> {
        let dims = s
            .trim()
            .split('x')
            .map(|part| part.trim().parse::<usize>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|err| InversionError::InvalidConfig(format!("bad slot shape `{s}`: {err}")))?;

        match dims.as_slice() {
            [a, b, c, d, e] => Ok(SlotShape::Spatial([*a, *b, *c, *d, *e])),
            [a, b] => Ok(SlotShape::Style([*a, *b])),
            _ => Err(InversionError::InvalidConfig(format!(
                "slot shape `{s}` must have 5 (spatial) or 2 (style) dimensions"
            ))),
        }
    }
}

// --- LAYOUT ---

/// Ordered list of slot shapes, matching generator layer depth.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatentLayout {
    slots: Vec<SlotShape>,
}

impl LatentLayout {
    /// Builds a layout, rejecting empty layouts, batch sizes other than 1 and zero-sized dims.
    pub fn new(slots: Vec<SlotShape>) -> Result<Self> {
        if slots.is_empty() {
            return Err(InversionError::InvalidConfig(
                "latent layout needs at least one slot".into(),
            ));
        }
        for (idx, slot) in slots.iter().enumerate() {
            if slot.dims()[0] != 1 {
                return Err(InversionError::InvalidConfig(format!(
                    "slot {idx} ({slot}) must have batch dimension 1"
                )));
            }
            if slot.dims().contains(&0) {
                return Err(InversionError::InvalidConfig(format!(
                    "slot {idx} ({slot}) has a zero-sized dimension"
                )));
            }
        }
        Ok(Self { slots })
    }

    /// Layout from shapes that are valid by construction.
    pub(crate) fn new_unchecked(slots: Vec<SlotShape>) -> Self {
        Self { slots }
    }

    /// The 14-slot layout of the reference spatial-aware generator:
    /// eight spatial slots (two per resolution, 4x4 up to 32x32) then six style slots.
    pub fn reference() -> Self {
        let mut slots = Vec::with_capacity(14);
        for res in [4, 8, 16, 32] {
            slots.push(SlotShape::Spatial([1, 2, 512, res, res]));
            slots.push(SlotShape::Spatial([1, 2, 512, res, res]));
        }
        slots.extend(std::iter::repeat_n(SlotShape::Style([1, 512]), 6));
        Self { slots }
    }

    pub fn slots(&self) -> &[SlotShape] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Total number of scalars across all slots.
    pub fn num_elements(&self) -> usize {
        self.slots.iter().map(SlotShape::num_elements).sum()
    }
}

impl fmt::Display for LatentLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots: Vec<String> = self.slots.iter().map(SlotShape::to_string).collect();
        write!(f, "{}", slots.join(","))
    }
}

impl FromStr for LatentLayout {
    type Err = InversionError;

    fn from_str(s: &str) -> Result<Self> {
        let slots = s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(SlotShape::from_str)
            .collect::<Result<Vec<_>>>()?;
        Self::new(slots)
    }
}

// --- SLOT TENSORS ---

/// A rank-tagged tensor for one slot, as produced by an encoder.
#[derive(Clone, Debug)]
pub enum SlotTensor<B: Backend> {
    Spatial(Tensor<B, 5>),
    Style(Tensor<B, 2>),
}

impl<B: Backend> SlotTensor<B> {
    pub fn dims(&self) -> Vec<usize> {
        match self {
            SlotTensor::Spatial(t) => t.dims().to_vec(),
            SlotTensor::Style(t) => t.dims().to_vec(),
        }
    }

    pub fn num_elements(&self) -> usize {
        self.dims().iter().product()
    }

    pub fn detach(self) -> Self {
        match self {
            SlotTensor::Spatial(t) => SlotTensor::Spatial(t.detach()),
            SlotTensor::Style(t) => SlotTensor::Style(t.detach()),
        }
    }

    /// Flattens the slot into a `[1, N]` row.
    pub fn flatten(self) -> Tensor<B, 2> {
        let n = self.num_elements();
        match self {
            SlotTensor::Spatial(t) => t.reshape([1, n]),
            SlotTensor::Style(t) => t.reshape([1, n]),
        }
    }

    fn describe(&self) -> String {
        let dims: Vec<String> = self.dims().iter().map(usize::to_string).collect();
        dims.join("x")
    }
}

// --- LATENT CODE ---

/// The optimizable latent code: one trainable tensor per layout slot.
///
/// Spatial and style slots live in separate rank-typed vectors; the layout
/// restores the interleaved layer order. Because every slot is a [`Param`],
/// the whole code is a Burn [`Module`] and Burn optimizers update each slot
/// independently.
#[derive(Module, Debug)]
pub struct LatentCode<B: Backend> {
    spatial: Vec<Param<Tensor<B, 5>>>,
    style: Vec<Param<Tensor<B, 2>>>,
    layout: Ignored<LatentLayout>,
}

impl<B: Backend> LatentCode<B> {
    /// All-zero code.
    pub fn zeros(layout: &LatentLayout, device: &B::Device) -> Self {
        Self::from_host(layout, device, |shape| vec![0.0; shape.num_elements()])
    }

    /// Standard-normal code drawn from a seeded host RNG.
    ///
    /// Values are generated slot by slot in layout order, so the same seed and
    /// layout always give the same code on every backend.
    pub fn random(layout: &LatentLayout, seed: u64, device: &B::Device) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::from_host(layout, device, |shape| {
            (0..shape.num_elements())
                .map(|_| StandardNormal.sample(&mut rng))
                .collect()
        })
    }

    /// Builds a code from per-slot estimates, reshaping each slot to its declared shape.
    ///
    /// # Errors
    /// `ShapeMismatch` when the slot count differs from the layout or when a
    /// slot's element count cannot be reshaped into the declared shape.
    pub fn from_slots(estimate: Vec<SlotTensor<B>>, layout: &LatentLayout) -> Result<Self> {
        if estimate.len() != layout.len() {
            return Err(InversionError::shape_mismatch(
                "slot count",
                layout.len(),
                estimate.len(),
            ));
        }

        let mut spatial = Vec::new();
        let mut style = Vec::new();
        for (idx, (slot, shape)) in estimate.into_iter().zip(layout.slots()).enumerate() {
            if slot.num_elements() != shape.num_elements() {
                return Err(InversionError::shape_mismatch(
                    format!("slot {idx}"),
                    shape,
                    slot.describe(),
                ));
            }
            let flat = slot.flatten().detach();
            match shape {
                SlotShape::Spatial(dims) => spatial.push(Param::from_tensor(flat.reshape(*dims))),
                SlotShape::Style(dims) => style.push(Param::from_tensor(flat.reshape(*dims))),
            }
        }

        Ok(Self {
            spatial,
            style,
            layout: Ignored(layout.clone()),
        })
    }

    /// Splits a single `[1, N]` vector across the layout slots in order.
    pub fn from_flat(flat: Tensor<B, 2>, layout: &LatentLayout) -> Result<Self> {
        let [rows, cols] = flat.dims();
        if rows != 1 || cols != layout.num_elements() {
            return Err(InversionError::shape_mismatch(
                "flat estimate",
                format!("1x{}", layout.num_elements()),
                format!("{rows}x{cols}"),
            ));
        }

        let mut offset = 0;
        let mut slots = Vec::with_capacity(layout.len());
        for shape in layout.slots() {
            let n = shape.num_elements();
            let part = flat.clone().slice([0..1, offset..offset + n]);
            offset += n;
            slots.push(SlotTensor::Style(part));
        }
        Self::from_slots(slots, layout)
    }

    fn from_host<F>(layout: &LatentLayout, device: &B::Device, mut values: F) -> Self
    where
        F: FnMut(&SlotShape) -> Vec<f32>,
    {
        let mut spatial = Vec::new();
        let mut style = Vec::new();
        for shape in layout.slots() {
            let data = TensorData::new(values(shape), shape.dims().to_vec());
            match shape {
                SlotShape::Spatial(_) => {
                    spatial.push(Param::from_tensor(Tensor::<B, 5>::from_data(data, device)))
                }
                SlotShape::Style(_) => {
                    style.push(Param::from_tensor(Tensor::<B, 2>::from_data(data, device)))
                }
            }
        }
        Self {
            spatial,
            style,
            layout: Ignored(layout.clone()),
        }
    }

    pub fn layout(&self) -> &LatentLayout {
        &self.layout.0
    }

    /// Spatial slots in layer order.
    pub fn spatial(&self) -> Vec<Tensor<B, 5>> {
        self.spatial.iter().map(Param::val).collect()
    }

    /// Style slots in layer order.
    pub fn style(&self) -> Vec<Tensor<B, 2>> {
        self.style.iter().map(Param::val).collect()
    }

    /// All slots, interleaved back into layout order.
    pub fn slots(&self) -> Vec<SlotTensor<B>> {
        let mut spatial = self.spatial.iter();
        let mut style = self.style.iter();
        self.layout()
            .slots()
            .iter()
            .filter_map(|shape| match shape {
                SlotShape::Spatial(_) => spatial.next().map(|p| SlotTensor::Spatial(p.val())),
                SlotShape::Style(_) => style.next().map(|p| SlotTensor::Style(p.val())),
            })
            .collect()
    }

    /// Concatenates every slot into one `[1, N]` row in layout order.
    pub fn flatten(&self) -> Tensor<B, 2> {
        let rows = self.slots().into_iter().map(SlotTensor::flatten).collect();
        Tensor::cat(rows, 1)
    }

    /// Mean squared distance to an estimate with the same layout.
    pub fn mse_to(&self, estimate: Vec<SlotTensor<B>>) -> Tensor<B, 1> {
        let rows = estimate.into_iter().map(SlotTensor::flatten).collect();
        let estimate = Tensor::cat(rows, 1);
        (self.flatten() - estimate).powf_scalar(2.0).mean()
    }

    /// Sum of squares over every slot, read back to the host.
    ///
    /// Non-finite when any slot holds NaN or infinity.
    pub fn squared_norm(&self) -> f64 {
        self.flatten()
            .detach()
            .powf_scalar(2.0)
            .sum()
            .into_scalar()
            .elem::<f64>()
    }

    /// Host copies of every slot, in layout order.
    pub fn to_host(&self) -> Result<Vec<Vec<f32>>> {
        self.slots()
            .into_iter()
            .map(|slot| {
                slot.flatten()
                    .into_data()
                    .convert::<f32>()
                    .to_vec::<f32>()
                    .map_err(|err| InversionError::TensorData(format!("{err:?}")))
            })
            .collect()
    }

    /// Persists the code as a full-precision Burn record (`<path>.bin`).
    pub fn save(&self, path: &Path) -> Result<()> {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        self.clone()
            .save_file(path.to_path_buf(), &recorder)
            .map_err(|err| InversionError::Io(std::io::Error::other(format!("{err:?}"))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    fn small_layout() -> LatentLayout {
        "1x2x3x2x2,1x2x3x4x4,1x3,1x3".parse().unwrap()
    }

    #[test]
    fn reference_layout_matches_generator_signature() {
        let layout = LatentLayout::reference();
        assert_eq!(layout.len(), 14);
        assert_eq!(layout.slots()[0], SlotShape::Spatial([1, 2, 512, 4, 4]));
        assert_eq!(layout.slots()[7], SlotShape::Spatial([1, 2, 512, 32, 32]));
        assert_eq!(layout.slots()[13], SlotShape::Style([1, 512]));

        let reparsed: LatentLayout = layout.to_string().parse().unwrap();
        assert_eq!(reparsed, layout);
    }

    #[test]
    fn layout_rejects_bad_shapes() {
        assert!("1x2x3".parse::<LatentLayout>().is_err());
        assert!("2x512".parse::<LatentLayout>().is_err());
        assert!("1x0".parse::<LatentLayout>().is_err());
        assert!("".parse::<LatentLayout>().is_err());
    }

    #[test]
    fn construction_follows_declared_shapes() {
        let layout = small_layout();
        let device = Default::default();

        for code in [
            LatentCode::<B>::zeros(&layout, &device),
            LatentCode::<B>::random(&layout, 3, &device),
        ] {
            let dims: Vec<Vec<usize>> = code.slots().iter().map(SlotTensor::dims).collect();
            let expected: Vec<Vec<usize>> =
                layout.slots().iter().map(|s| s.dims().to_vec()).collect();
            assert_eq!(dims, expected);
            assert_eq!(code.flatten().dims(), [1, layout.num_elements()]);
        }
    }

    #[test]
    fn estimate_with_wrong_shape_is_rejected() {
        let layout = small_layout();
        let device = Default::default();

        let mut slots = LatentCode::<B>::zeros(&layout, &device).slots();
        slots[3] = SlotTensor::Style(Tensor::zeros([1, 5], &device));
        let err = LatentCode::from_slots(slots, &layout).unwrap_err();
        assert!(matches!(err, InversionError::ShapeMismatch { .. }));

        let short = LatentCode::<B>::zeros(&layout, &device).slots()[..2].to_vec();
        let err = LatentCode::from_slots(short, &layout).unwrap_err();
        assert!(matches!(err, InversionError::ShapeMismatch { .. }));
    }

    #[test]
    fn flat_estimate_is_split_in_order() {
        let layout = small_layout();
        let device = Default::default();
        let n = layout.num_elements();
        let values: Vec<f32> = (0..n).map(|v| v as f32).collect();
        let flat = Tensor::<B, 2>::from_data(TensorData::new(values.clone(), [1, n]), &device);

        let code = LatentCode::from_flat(flat, &layout).unwrap();
        let host: Vec<f32> = code.to_host().unwrap().into_iter().flatten().collect();
        assert_eq!(host, values);

        let wrong = Tensor::<B, 2>::zeros([1, n + 1], &device);
        assert!(matches!(
            LatentCode::from_flat(wrong, &layout),
            Err(InversionError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn random_code_is_reproducible() {
        let layout = small_layout();
        let device = Default::default();
        let a = LatentCode::<B>::random(&layout, 11, &device).to_host().unwrap();
        let b = LatentCode::<B>::random(&layout, 11, &device).to_host().unwrap();
        let c = LatentCode::<B>::random(&layout, 12, &device).to_host().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
