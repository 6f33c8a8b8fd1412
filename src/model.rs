//! Model inspection: STL bounding boxes and build-volume checks.
//!
//! Only the vertex extents are read; no other mesh analysis is done.
//!
//! Binary STL layout:
//!
//! ```text
//! UINT8[80]    header
//! UINT32       triangle count
//! foreach triangle
//!     REAL32[3] normal
//!     REAL32[3] vertex 1..3
//!     UINT16    attribute byte count
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::profile::PrinterProfile;

const HEADER_SIZE: usize = 80;
const TRIANGLE_SIZE: usize = 50;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("Model file is empty")]
    Empty,

    #[error("Model contains no vertices")]
    NoVertices,

    #[error("Truncated binary STL: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("Invalid STL vertex on line {line}: {message}")]
    InvalidVertex { line: usize, message: String },
}

/// Axis-aligned bounds of a model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelBounds {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl ModelBounds {
    fn from_point(p: [f64; 3]) -> Self {
        Self { min: p, max: p }
    }

    fn include(&mut self, p: [f64; 3]) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(p[i]);
            self.max[i] = self.max[i].max(p[i]);
        }
    }

    /// Extent along x, y, z.
    pub fn dimensions(&self) -> [f64; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        })
    }
}

const AXES: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Printability {
    pub printable: bool,
    pub model_dimensions: [f64; 3],
    pub printer_dimensions: [f64; 3],
    pub exceeded_dimensions: Vec<Axis>,
}

/// Compare model extents with the printer build volume.
pub fn check_printability(bounds: &ModelBounds, profile: &PrinterProfile) -> Printability {
    let model = bounds.dimensions();
    let printer = profile.build_volume();
    let exceeded: Vec<Axis> = AXES
        .iter()
        .zip(model.iter().zip(printer.iter()))
        .filter(|(_, (m, p))| m > p)
        .map(|(axis, _)| *axis)
        .collect();

    Printability {
        printable: exceeded.is_empty(),
        model_dimensions: model,
        printer_dimensions: printer,
        exceeded_dimensions: exceeded,
    }
}

/// Bounding box of an ASCII or binary STL.
pub fn read_stl_bounds(bytes: &[u8]) -> Result<ModelBounds, ModelError> {
    if bytes.is_empty() {
        return Err(ModelError::Empty);
    }
    if looks_ascii(bytes) {
        ascii_bounds(bytes)
    } else {
        binary_bounds(bytes)
    }
}

/// ASCII files start with `solid`, but some binary exporters write `solid`
/// into the header too. A binary size that matches the triangle count wins.
fn looks_ascii(bytes: &[u8]) -> bool {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    if !bytes[start..].starts_with(b"solid") {
        return false;
    }
    !binary_size_matches(bytes)
}

fn binary_size_matches(bytes: &[u8]) -> bool {
    triangle_count(bytes).and_then(binary_size) == Some(bytes.len())
}

/// File size of a binary STL with `count` triangles.
fn binary_size(count: usize) -> Option<usize> {
    count
        .checked_mul(TRIANGLE_SIZE)
        .and_then(|n| n.checked_add(HEADER_SIZE + 4))
}

fn triangle_count(bytes: &[u8]) -> Option<usize> {
    let raw = bytes.get(HEADER_SIZE..HEADER_SIZE + 4)?;
    let count = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    usize::try_from(count).ok()
}

fn binary_bounds(bytes: &[u8]) -> Result<ModelBounds, ModelError> {
    let count = triangle_count(bytes).ok_or(ModelError::Truncated {
        expected: HEADER_SIZE + 4,
        got: bytes.len(),
    })?;
    let expected = binary_size(count).unwrap_or(usize::MAX);
    if bytes.len() < expected {
        return Err(ModelError::Truncated {
            expected,
            got: bytes.len(),
        });
    }

    let mut bounds: Option<ModelBounds> = None;
    for tri in bytes[HEADER_SIZE + 4..expected].chunks_exact(TRIANGLE_SIZE) {
        // skip the 12-byte normal; three vertices follow
        for v in tri[12..48].chunks_exact(12) {
            let p = [read_f32(&v[0..4]), read_f32(&v[4..8]), read_f32(&v[8..12])];
            extend(&mut bounds, p);
        }
    }
    bounds.ok_or(ModelError::NoVertices)
}

fn read_f32(b: &[u8]) -> f64 {
    f64::from(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn ascii_bounds(bytes: &[u8]) -> Result<ModelBounds, ModelError> {
    let text = String::from_utf8_lossy(bytes);
    let mut bounds: Option<ModelBounds> = None;

    for (index, line) in text.lines().enumerate() {
        let mut parts = line.split_whitespace();
        if parts.next() != Some("vertex") {
            continue;
        }
        let mut p = [0.0; 3];
        for coord in &mut p {
            let raw = parts.next().ok_or_else(|| ModelError::InvalidVertex {
                line: index + 1,
                message: "expected three coordinates".to_string(),
            })?;
            *coord = raw.parse::<f64>().map_err(|e| ModelError::InvalidVertex {
                line: index + 1,
                message: format!("{raw:?}: {e}"),
            })?;
        }
        extend(&mut bounds, p);
    }
    bounds.ok_or(ModelError::NoVertices)
}

fn extend(bounds: &mut Option<ModelBounds>, p: [f64; 3]) {
    match bounds {
        Some(b) => b.include(p),
        None => *bounds = Some(ModelBounds::from_point(p)),
    }
}
