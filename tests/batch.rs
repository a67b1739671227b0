use std::path::Path;

use burn::backend::{Autodiff, NdArray};
use burn::prelude::ElementConversion;
use burn::tensor::{Tensor, backend::Backend};
use image::{Rgb, RgbImage};
use tempfile::tempdir;

use sa_inversion::batch::{BatchOptions, ImageStatus, run_batch};
use sa_inversion::models::encoder::LatentEncoderConfig;
use sa_inversion::models::generator::StyleGeneratorConfig;
use sa_inversion::models::perceptual::VggFeaturesConfig;
use sa_inversion::{
    EncoderPrior, Generator, InitSource, InitStrategy, InversionConfig, InversionError, Inverter,
    LatentCode, LatentGeometry, LatentLayout, ModelBundle, SlotTensor,
};

type B = Autodiff<NdArray>;

fn tiny_geometry() -> LatentGeometry {
    LatentGeometry {
        channels: 4,
        base_resolution: 4,
        spatial_blocks: 2,
        layers_per_block: 1,
        style_blocks: 1,
    }
}

fn tiny_bundle(with_encoder: bool) -> ModelBundle<B> {
    let geometry = tiny_geometry();
    ModelBundle::new(
        StyleGeneratorConfig::new().with_geometry(geometry),
        VggFeaturesConfig::new().with_block_channels(vec![4, 8]),
        with_encoder.then(|| LatentEncoderConfig::new().with_geometry(geometry)),
        &Default::default(),
    )
    .unwrap()
}

fn write_image(path: &Path, shade: u8) {
    RgbImage::from_fn(20, 20, |x, y| Rgb([shade, x as u8 * 10, y as u8 * 10]))
        .save(path)
        .unwrap();
}

#[test]
fn batch_writes_artifacts_and_skips_broken_images() {
    let dir = tempdir().unwrap();
    let face = dir.path().join("face.png");
    write_image(&face, 200);
    let missing = dir.path().join("missing.png");

    let list = dir.path().join("faces.txt");
    std::fs::write(&list, format!("{}\n\n{}\n", face.display(), missing.display())).unwrap();
    let out = dir.path().join("out");

    let bundle = tiny_bundle(true);
    let config = InversionConfig::new()
        .with_num_iterations(4)
        .with_num_results(2);
    let inverter = Inverter::<B>::new(config, &bundle.generator, Default::default())
        .unwrap()
        .with_features(&bundle.perceptual)
        .with_encoder(bundle.encoder.as_ref().unwrap());

    let options = BatchOptions {
        image_list: list.clone(),
        output_dir: out.clone(),
        viz_size: Some(8),
        save_codes: true,
    };
    let summary = run_batch(&inverter, &options).unwrap();

    assert_eq!(summary.succeeded(), 1);
    assert_eq!(summary.failed(), 1);
    assert!(matches!(
        summary.outcomes[0].status,
        ImageStatus::Inverted {
            init_source: InitSource::Encoder,
            ..
        }
    ));
    assert!(matches!(summary.outcomes[1].status, ImageStatus::Failed { .. }));

    for artifact in [
        "face_ori.png",
        "face_enc.png",
        "face_inv.png",
        "face_code.bin",
        "image_list.txt",
        "inversion.html",
        "summary.json",
    ] {
        assert!(out.join(artifact).is_file(), "missing {artifact}");
    }

    let inverted = image::open(out.join("face_inv.png")).unwrap();
    assert_eq!((inverted.width(), inverted.height()), (16, 16));

    let html = std::fs::read_to_string(out.join("inversion.html")).unwrap();
    assert!(html.contains("Step 000002"));
    assert!(html.contains("Step 000004"));
    // original, encoder output and two steps
    assert_eq!(html.matches("data:image/png;base64,").count(), 4);

    let summary_json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.join("summary.json")).unwrap()).unwrap();
    assert_eq!(summary_json["outcomes"][0]["status"], "inverted");
    assert_eq!(summary_json["outcomes"][1]["status"], "failed");
}

#[test]
fn missing_networks_stop_the_batch() {
    let dir = tempdir().unwrap();
    let face = dir.path().join("face.png");
    write_image(&face, 10);
    let list = dir.path().join("faces.txt");
    std::fs::write(&list, format!("{}\n", face.display())).unwrap();

    // Encoder init is the default, but this bundle has no encoder.
    let bundle = tiny_bundle(false);
    let config = InversionConfig::new().with_num_iterations(2);
    let inverter = Inverter::<B>::new(config, &bundle.generator, Default::default())
        .unwrap()
        .with_features(&bundle.perceptual);

    let options = BatchOptions {
        image_list: list,
        output_dir: dir.path().join("out"),
        viz_size: None,
        save_codes: false,
    };
    assert!(matches!(
        run_batch(&inverter, &options),
        Err(InversionError::ModelUnavailable { .. })
    ));
}

#[test]
fn missing_image_list_is_a_precondition_error() {
    let dir = tempdir().unwrap();
    let bundle = tiny_bundle(false);
    let config = InversionConfig::new().with_num_iterations(1);
    let inverter = Inverter::<B>::new(config, &bundle.generator, Default::default()).unwrap();

    let options = BatchOptions {
        image_list: dir.path().join("absent.txt"),
        output_dir: dir.path().join("out"),
        viz_size: None,
        save_codes: false,
    };
    assert!(matches!(
        run_batch(&inverter, &options),
        Err(InversionError::Precondition(_))
    ));
}

/// Renders the code as pixels, except that values above 10 come out as NaN.
struct SaturatingGenerator {
    layout: LatentLayout,
}

impl<B: Backend> Generator<B> for SaturatingGenerator {
    fn layout(&self) -> &LatentLayout {
        &self.layout
    }

    fn resolution(&self) -> usize {
        4
    }

    fn synthesize(&self, code: &LatentCode<B>) -> Tensor<B, 4> {
        let x = code.flatten();
        x.clone()
            .mask_fill(x.greater_elem(10.0), f32::NAN)
            .reshape([1, 3, 4, 4])
    }
}

/// Predicts a constant code of 100 times the image mean.
struct MeanEncoder;

impl<B: Backend> EncoderPrior<B> for MeanEncoder {
    fn encode(&self, image: Tensor<B, 4>) -> Vec<SlotTensor<B>> {
        let device = image.device();
        let mean: f32 = image.mean().into_scalar().elem();
        vec![SlotTensor::Style(Tensor::full([1, 48], mean * 100.0, &device))]
    }
}

#[test]
fn diverging_image_fails_alone() {
    let dir = tempdir().unwrap();
    let bright = dir.path().join("bright.png");
    RgbImage::from_pixel(8, 8, Rgb([255, 255, 255])).save(&bright).unwrap();
    let gray = dir.path().join("gray.png");
    RgbImage::from_pixel(8, 8, Rgb([128, 128, 128])).save(&gray).unwrap();

    let list = dir.path().join("mixed.txt");
    std::fs::write(&list, format!("{}\n{}\n", bright.display(), gray.display())).unwrap();
    let out = dir.path().join("out");

    let generator = SaturatingGenerator {
        layout: "1x48".parse().unwrap(),
    };
    let config = InversionConfig::new()
        .with_num_iterations(3)
        .with_perceptual_weight(0.0)
        .with_regularization_weight(0.0)
        .with_init(InitStrategy::Encoder);
    let inverter = Inverter::<B>::new(config, &generator, Default::default())
        .unwrap()
        .with_encoder(&MeanEncoder);

    let options = BatchOptions {
        image_list: list,
        output_dir: out.clone(),
        viz_size: None,
        save_codes: false,
    };
    let summary = run_batch(&inverter, &options).unwrap();

    match &summary.outcomes[0].status {
        ImageStatus::Failed { error } => assert!(error.contains("numerical divergence"), "{error}"),
        other => panic!("bright image should diverge, got {other:?}"),
    }
    assert!(matches!(summary.outcomes[1].status, ImageStatus::Inverted { .. }));
    assert!(!out.join("bright_inv.png").exists());
    assert!(out.join("gray_inv.png").is_file());
    assert!(out.join("summary.json").is_file());
}
