use std::path::Path;

use braille_rs::BrailleChar;
use ndarray::{s, Array3, ArrayView3, Axis};
use thiserror::Error;

/// Height x width x channels, intensities in `[0, 1]`.
pub type Image = Array3<f32>;
pub type Patch = Array3<f32>;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("failed to read image {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: image::ImageError,
    },
}

pub fn load_image(path: impl AsRef<Path>) -> Result<Image, ImageError> {
    let path = path.as_ref();
    let rgb = image::open(path)
        .map_err(|source| ImageError::Read {
            path: path.display().to_string(),
            source,
        })?
        .to_rgb8();

    let (width, height) = rgb.dimensions();
    Ok(Array3::from_shape_fn(
        (height as usize, width as usize, 3),
        |(y, x, c)| rgb.get_pixel(x as u32, y as u32)[c] as f32 / 255.,
    ))
}

/// Top-left offsets of every window of `size` placed at multiples of `stride`
/// that fits inside `extent`.
pub fn window_offsets(extent: usize, size: usize, stride: usize) -> impl Iterator<Item = usize> {
    let last = if size == 0 || stride == 0 || size > extent {
        None
    } else {
        Some(extent - size)
    };

    last.into_iter()
        .flat_map(move |last| (0..=last).step_by(stride.max(1)))
}

/// Number of patches [`extract_patches`] yields for an image of this size.
pub fn patch_count(height: usize, width: usize, size: usize, stride: usize) -> usize {
    window_offsets(height, size, stride).count() * window_offsets(width, size, stride).count()
}

/// Slides a `size` x `size` window with step `stride` over both spatial axes,
/// row by row.
pub fn extract_patches(image: ArrayView3<'_, f32>, size: usize, stride: usize) -> Vec<Patch> {
    let (height, width, _) = image.dim();
    let mut patches = Vec::with_capacity(patch_count(height, width, size, stride));

    for y in window_offsets(height, size, stride) {
        for x in window_offsets(width, size, stride) {
            patches.push(image.slice(s![y..y + size, x..x + size, ..]).to_owned());
        }
    }

    patches
}

/// Mean over channels, flattened row-major.
pub fn grayscale(patch: &Patch) -> Vec<f32> {
    patch
        .mean_axis(Axis(2))
        .map(|gray| gray.iter().copied().collect())
        .unwrap_or_default()
}

/// Draws an image as braille characters, at most `max_columns` characters wide.
/// A dot is set where the pixel brightness is at least `threshhold`.
pub fn render(image: &Image, max_columns: usize, threshhold: f32) -> Vec<String> {
    let (height, width, _) = image.dim();
    if height == 0 || width == 0 || max_columns == 0 {
        return Vec::new();
    }

    // every braille cell covers 2 x 4 dots
    let scale = width.div_ceil(max_columns * 2).max(1);
    let dots_w = width.div_ceil(scale);
    let dots_h = height.div_ceil(scale);

    let lit = |row: usize, col: usize| -> u8 {
        if row >= dots_h || col >= dots_w {
            return 0;
        }
        let y = (row * scale).min(height - 1);
        let x = (col * scale).min(width - 1);
        let brightness = image.slice(s![y, x, ..]).mean().unwrap_or(0.);
        (brightness >= threshhold) as u8
    };

    let mut lines = Vec::with_capacity(dots_h.div_ceil(4));
    for row in (0..dots_h).step_by(4) {
        let mut line = String::with_capacity(dots_w.div_ceil(2));
        for col in (0..dots_w).step_by(2) {
            let byte = lit(row, col)
                | (lit(row + 1, col) << 1)
                | (lit(row + 2, col) << 2)
                | (lit(row + 3, col) << 3)
                | (lit(row, col + 1) << 4)
                | (lit(row + 1, col + 1) << 5)
                | (lit(row + 2, col + 1) << 6)
                | (lit(row + 3, col + 1) << 7);

            line.push(BrailleChar::with_data(byte).into())
        }
        lines.push(line);
    }

    lines
}

/// Renders two images next to each other.
pub fn render_side_by_side(left: &Image, right: &Image, max_columns: usize, threshhold: f32) -> String {
    let half = (max_columns / 2).saturating_sub(2).max(1);
    let left = render(left, half, threshhold);
    let right = render(right, half, threshhold);
    let left_width = left.first().map(|l| l.chars().count()).unwrap_or(0);

    let mut canvas = String::new();
    for i in 0..left.len().max(right.len()) {
        let l = left.get(i).map(String::as_str).unwrap_or("");
        let r = right.get(i).map(String::as_str).unwrap_or("");
        canvas.push_str(&format!("{l:<left_width$}    {r}\n"));
    }

    canvas
}
