//! Tiles the result images of one job into a single PNG canvas.
//!
//! The grid is `cols = ceil(sqrt(n))`, `rows = ceil(n / cols)`, with rows
//! and cols swapped when the set is predominantly landscape. Cells are
//! filled row-major; each column is as wide as its widest image and each
//! row as tall as its tallest, so mixed sizes never overlap and nothing is
//! scaled.

use std::io::Cursor;

use image::{DynamicImage, GenericImageView, ImageFormat, RgbaImage};
use serde::Serialize;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CompositeError {
    #[error("No images to compose")]
    NoImages,

    #[error(
        "Image {index} is {actual_width}x{actual_height}, expected {expected_width}x{expected_height}"
    )]
    SizeMismatch {
        index: usize,
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("{count} images cannot be arranged in a square grid")]
    NotSquareGrid { count: usize },

    #[error("Failed to decode image {index}: {source}")]
    Decode {
        index: usize,
        source: image::ImageError,
    },

    #[error("Failed to encode composed image: {0}")]
    Encode(#[source] image::ImageError),
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Orientation {
    Landscape,
    Portrait,
    Square,
}

fn orientation(width: u32, height: u32) -> Orientation {
    match width.cmp(&height) {
        std::cmp::Ordering::Greater => Orientation::Landscape,
        std::cmp::Ordering::Less => Orientation::Portrait,
        std::cmp::Ordering::Equal => Orientation::Square,
    }
}

/// Grid geometry for a set of images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompositionLayout {
    pub rows: usize,
    pub cols: usize,
    /// Tallest image in each row.
    pub row_heights: Vec<u32>,
    /// Widest image in each column.
    pub col_widths: Vec<u32>,
    pub width: u32,
    pub height: u32,
}

impl CompositionLayout {
    /// Top-left pixel of the cell holding image `index` (row-major).
    pub fn cell_origin(&self, index: usize) -> (u32, u32) {
        let row = index / self.cols;
        let col = index % self.cols;
        let x = self.col_widths[..col].iter().sum();
        let y = self.row_heights[..row].iter().sum();
        (x, y)
    }
}

/// Compute the grid for images of the given `(width, height)` sizes.
pub fn compute_layout(dimensions: &[(u32, u32)]) -> Result<CompositionLayout, CompositeError> {
    let count = dimensions.len();
    if count == 0 {
        return Err(CompositeError::NoImages);
    }

    let mut cols = (count as f64).sqrt().ceil() as usize;
    let mut rows = count.div_ceil(cols);

    let (mut landscape, mut portrait, mut square) = (0usize, 0usize, 0usize);
    for &(w, h) in dimensions {
        match orientation(w, h) {
            Orientation::Landscape => landscape += 1,
            Orientation::Portrait => portrait += 1,
            Orientation::Square => square += 1,
        }
    }
    if landscape > portrait && landscape > square {
        std::mem::swap(&mut rows, &mut cols);
    }

    Ok(fill_layout(dimensions, rows, cols))
}

fn fill_layout(dimensions: &[(u32, u32)], rows: usize, cols: usize) -> CompositionLayout {
    let mut row_heights = vec![0u32; rows];
    let mut col_widths = vec![0u32; cols];
    for (i, &(w, h)) in dimensions.iter().enumerate() {
        let (row, col) = (i / cols, i % cols);
        row_heights[row] = row_heights[row].max(h);
        col_widths[col] = col_widths[col].max(w);
    }

    CompositionLayout {
        rows,
        cols,
        width: col_widths.iter().sum(),
        height: row_heights.iter().sum(),
        row_heights,
        col_widths,
    }
}

// ---------------------------------------------------------------------------
// Tiling
// ---------------------------------------------------------------------------

/// Compose encoded images into one PNG.
///
/// A single image is returned byte-for-byte without decoding.
pub fn tile_images(mut images: Vec<Vec<u8>>) -> Result<Vec<u8>, CompositeError> {
    match images.len() {
        0 => Err(CompositeError::NoImages),
        1 => Ok(images.swap_remove(0)),
        _ => {
            let decoded = decode_all(&images)?;
            let dimensions: Vec<(u32, u32)> = decoded.iter().map(|img| img.dimensions()).collect();
            let layout = compute_layout(&dimensions)?;
            render(&decoded, &layout)
        }
    }
}

/// Strict variant of [`tile_images`]: every image must share the same
/// size and the count must be a perfect square. No orientation swap.
pub fn tile_uniform(mut images: Vec<Vec<u8>>) -> Result<Vec<u8>, CompositeError> {
    let count = images.len();
    if count == 0 {
        return Err(CompositeError::NoImages);
    }

    let side = (count as f64).sqrt().round() as usize;
    if side * side != count {
        return Err(CompositeError::NotSquareGrid { count });
    }
    if count == 1 {
        return Ok(images.swap_remove(0));
    }

    let decoded = decode_all(&images)?;
    let (expected_width, expected_height) = decoded[0].dimensions();
    for (index, img) in decoded.iter().enumerate().skip(1) {
        let (actual_width, actual_height) = img.dimensions();
        if (actual_width, actual_height) != (expected_width, expected_height) {
            return Err(CompositeError::SizeMismatch {
                index,
                expected_width,
                expected_height,
                actual_width,
                actual_height,
            });
        }
    }

    let dimensions = vec![(expected_width, expected_height); count];
    let layout = fill_layout(&dimensions, side, side);
    render(&decoded, &layout)
}

fn decode_all(images: &[Vec<u8>]) -> Result<Vec<DynamicImage>, CompositeError> {
    images
        .iter()
        .enumerate()
        .map(|(index, bytes)| {
            image::load_from_memory(bytes).map_err(|source| CompositeError::Decode { index, source })
        })
        .collect()
}

fn render(images: &[DynamicImage], layout: &CompositionLayout) -> Result<Vec<u8>, CompositeError> {
    let mut canvas = RgbaImage::new(layout.width, layout.height);
    for (index, img) in images.iter().enumerate() {
        let (x, y) = layout.cell_origin(index);
        image::imageops::replace(&mut canvas, &img.to_rgba8(), i64::from(x), i64::from(y));
    }

    let mut encoded = Vec::new();
    DynamicImage::ImageRgba8(canvas)
        .write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)
        .map_err(CompositeError::Encode)?;
    Ok(encoded)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
