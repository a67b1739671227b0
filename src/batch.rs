use std::collections::HashSet;
use std::path::{Path, PathBuf};

use burn::tensor::backend::AutodiffBackend;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{InversionError, Result};
use crate::image_ops::{load_rgb, resize_rgb, save_rgb};
use crate::inverter::{InitSource, Inverter};
use crate::report::{Cell, HtmlReport};

// --- OPTIONS & OUTCOMES ---

/// Where a batch reads its images and writes its artifacts.
#[derive(Clone, Debug)]
pub struct BatchOptions {
    /// Plain-text file, one image path per line.
    pub image_list: PathBuf,
    pub output_dir: PathBuf,
    /// Report thumbnail size; `None` keeps native resolution.
    pub viz_size: Option<u32>,
    /// Also persist each final latent code as `<name>_code.bin`.
    pub save_codes: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ImageStatus {
    Inverted {
        final_loss: Option<f64>,
        init_source: InitSource,
    },
    Failed {
        error: String,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct ImageOutcome {
    pub name: String,
    pub path: PathBuf,
    #[serde(flatten)]
    pub status: ImageStatus,
}

/// Per-image results of a batch, in list order.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BatchSummary {
    pub outcomes: Vec<ImageOutcome>,
}

impl BatchSummary {
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, ImageStatus::Inverted { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

// --- IMAGE LIST ---

/// Reads the image list, one path per line; blank lines are skipped.
///
/// # Errors
/// `Precondition` when the list file does not exist.
pub fn read_image_list(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.is_file() {
        return Err(InversionError::Precondition(format!(
            "image list {} does not exist",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect())
}

/// `results/inversion/<list file stem>`.
pub fn default_output_dir(image_list: &Path) -> PathBuf {
    PathBuf::from("results")
        .join("inversion")
        .join(file_stem(image_list))
}

/// Artifact name per listed image: its file stem, suffixed with the row index
/// when an earlier image already claimed that stem.
pub fn artifact_names(images: &[PathBuf]) -> Vec<String> {
    let mut taken = HashSet::new();
    images
        .iter()
        .enumerate()
        .map(|(idx, path)| {
            let stem = file_stem(path);
            let mut name = stem.clone();
            if !taken.insert(name.clone()) {
                name = format!("{stem}_{idx:03}");
                warn!(
                    "Duplicate image name `{stem}` ({}); saving as `{name}`",
                    path.display()
                );
                taken.insert(name.clone());
            }
            name
        })
        .collect()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "images".to_string())
}

// --- DRIVER ---

/// Inverts every listed image, one after the other, and writes all artifacts.
///
/// Per image: `<name>_ori.png`, `<name>_enc.png`, `<name>_inv.png` and
/// optionally `<name>_code.bin`. Per batch: `image_list.txt`,
/// `inversion.html` and `summary.json`.
///
/// Images that fail on their own (divergence, unreadable file) are logged,
/// marked failed in the report and skipped; errors shared by every image
/// (see [`InversionError::aborts_batch`]) stop the batch.
pub fn run_batch<B: AutodiffBackend>(
    inverter: &Inverter<'_, B>,
    options: &BatchOptions,
) -> Result<BatchSummary> {
    let images = read_image_list(&options.image_list)?;
    std::fs::create_dir_all(&options.output_dir)?;

    let schedule = inverter.config().schedule();
    let mut report = HtmlReport::new(
        images.len(),
        HtmlReport::inversion_headers(schedule.steps()),
        options.viz_size,
    );

    info!("Start inversion of {} images", images.len());
    let mut summary = BatchSummary::default();
    let names = artifact_names(&images);

    for (idx, (path, name)) in images.iter().zip(names).enumerate() {
        info!("[{}/{}] Inverting {}", idx + 1, images.len(), path.display());
        report.set_cell(idx, 0, Cell::Text(name.clone()));

        let status = match invert_one(inverter, path, &name, options, &mut report, idx) {
            Ok(status) => status,
            Err(err) if err.aborts_batch() => return Err(err),
            Err(err) => {
                warn!("Skipping {}: {err}", path.display());
                report.set_cell(idx, 2, Cell::Text(format!("failed: {err}")));
                ImageStatus::Failed {
                    error: err.to_string(),
                }
            }
        };

        summary.outcomes.push(ImageOutcome {
            name,
            path: path.clone(),
            status,
        });
    }

    std::fs::copy(&options.image_list, options.output_dir.join("image_list.txt"))?;
    report.save(&options.output_dir.join("inversion.html"))?;
    std::fs::write(
        options.output_dir.join("summary.json"),
        serde_json::to_string_pretty(&summary)?,
    )?;

    info!(
        "Finished: {} inverted, {} failed",
        summary.succeeded(),
        summary.failed()
    );
    Ok(summary)
}

fn invert_one<B: AutodiffBackend>(
    inverter: &Inverter<'_, B>,
    path: &Path,
    name: &str,
    options: &BatchOptions,
    report: &mut HtmlReport,
    row: usize,
) -> Result<ImageStatus> {
    let out = &options.output_dir;
    let image = resize_rgb(&load_rgb(path)?, inverter.resolution() as u32);

    let output = inverter.invert_image(&image)?;

    save_rgb(&out.join(format!("{name}_ori.png")), &image)?;
    if let Some(frame) = output.initial_frame() {
        save_rgb(&out.join(format!("{name}_enc.png")), &frame.image)?;
    }
    if let Some(frame) = output.final_frame() {
        save_rgb(&out.join(format!("{name}_inv.png")), &frame.image)?;
    }
    if options.save_codes {
        output.code.save(&out.join(format!("{name}_code")))?;
    }

    report.set_cell(row, 1, Cell::Image(image));
    for (offset, frame) in output.frames.iter().enumerate() {
        report.set_cell(row, 2 + offset, Cell::Image(frame.image.clone()));
    }

    Ok(ImageStatus::Inverted {
        final_loss: output.final_loss(),
        init_source: output.init_source,
    })
}
