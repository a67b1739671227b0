use std::io::Cursor;
use std::path::Path;

use base64::{Engine as _, engine::general_purpose};
use image::{DynamicImage, ImageFormat, RgbImage};

use crate::error::Result;
use crate::image_ops::resize_rgb;

/// One table cell.
#[derive(Clone, Debug, Default)]
pub enum Cell {
    #[default]
    Empty,
    Text(String),
    Image(RgbImage),
}

/// Static HTML page with one row per image and one column per retained step.
///
/// Images are embedded as base64 PNG data URIs, so the page is self-contained.
#[derive(Clone, Debug)]
pub struct HtmlReport {
    headers: Vec<String>,
    rows: Vec<Vec<Cell>>,
    /// Thumbnail side length; `None` keeps images at their native size.
    viz_size: Option<u32>,
}

impl HtmlReport {
    pub fn new(num_rows: usize, headers: Vec<String>, viz_size: Option<u32>) -> Self {
        let num_cols = headers.len();
        Self {
            headers,
            rows: vec![vec![Cell::Empty; num_cols]; num_rows],
            viz_size,
        }
    }

    /// Column headers for an inversion report: name, original, encoder output, then each step.
    pub fn inversion_headers(steps: impl IntoIterator<Item = usize>) -> Vec<String> {
        let mut headers = vec![
            "Name".to_string(),
            "Original Image".to_string(),
            "Encoder Output".to_string(),
        ];
        headers.extend(steps.into_iter().map(|step| format!("Step {step:06}")));
        headers
    }

    pub fn num_cols(&self) -> usize {
        self.headers.len()
    }

    /// Sets a cell; out-of-range positions are ignored.
    pub fn set_cell(&mut self, row: usize, col: usize, cell: Cell) {
        if let Some(slot) = self.rows.get_mut(row).and_then(|r| r.get_mut(col)) {
            *slot = cell;
        }
    }

    pub fn render(&self) -> Result<String> {
        let mut html = String::from(
            "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>Inversion</title>\n\
             <style>\ntable { border-collapse: collapse; }\n\
             th, td { border: 1px solid #ccc; padding: 4px; text-align: center; }\n\
             </style>\n</head>\n<body>\n<table>\n<thead>\n<tr>",
        );
        for header in &self.headers {
            html.push_str(&format!("<th>{}</th>", escape(header)));
        }
        html.push_str("</tr>\n</thead>\n<tbody>\n");

        for row in &self.rows {
            html.push_str("<tr>");
            for cell in row {
                match cell {
                    Cell::Empty => html.push_str("<td></td>"),
                    Cell::Text(text) => html.push_str(&format!("<td>{}</td>", escape(text))),
                    Cell::Image(image) => {
                        html.push_str(&format!(
                            "<td><img src=\"data:image/png;base64,{}\"></td>",
                            self.encode_png(image)?
                        ));
                    }
                }
            }
            html.push_str("</tr>\n");
        }

        html.push_str("</tbody>\n</table>\n</body>\n</html>\n");
        Ok(html)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.render()?)?;
        Ok(())
    }

    fn encode_png(&self, image: &RgbImage) -> Result<String> {
        let image = match self.viz_size {
            Some(size) => resize_rgb(image, size),
            None => image.clone(),
        };
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        Ok(general_purpose::STANDARD.encode(bytes))
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
