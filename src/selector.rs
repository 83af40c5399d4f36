//! Image identifiers and slice selectors.
//!
//! An image id names one 2D cross-section of a volume file using a compact
//! textual encoding:
//!
//! ```text
//! nifti:path[#dim[-index][,t-timepoint]]
//! ```
//!
//! - `path` is any character sequence not containing `#`
//! - `dim` is one of `x`, `y`, `z` (defaults to `z`)
//! - `index` is a non-negative decimal integer (defaults to 0)
//! - `timepoint` is a non-negative decimal integer (defaults to 0)
//!
//! A bare numeric fragment (`nifti:brain.nii#46`) selects that index on the
//! default dimension. Serializing with [`std::fmt::Display`] always emits the
//! full form; `parse(x.to_string()) == x` holds for every selector even
//! though parsing does not preserve the input byte-for-byte.

use crate::error::{NiftiError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The storage axis orthogonal to a requested slice plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SliceDimension {
    /// First storage axis (sagittal cut for canonical volumes)
    X,
    /// Second storage axis (coronal cut)
    Y,
    /// Third storage axis (axial cut)
    Z,
}

impl SliceDimension {
    /// Single-character token used in image ids.
    pub fn token(&self) -> char {
        match self {
            SliceDimension::X => 'x',
            SliceDimension::Y => 'y',
            SliceDimension::Z => 'z',
        }
    }

    /// Parse a dimension token.
    pub fn from_token(token: char) -> Option<Self> {
        match token {
            'x' => Some(SliceDimension::X),
            'y' => Some(SliceDimension::Y),
            'z' => Some(SliceDimension::Z),
            _ => None,
        }
    }

    /// Storage axis index of this dimension (x = 0, y = 1, z = 2).
    pub fn axis(&self) -> usize {
        match self {
            SliceDimension::X => 0,
            SliceDimension::Y => 1,
            SliceDimension::Z => 2,
        }
    }
}

impl Default for SliceDimension {
    fn default() -> Self {
        SliceDimension::Z
    }
}

/// Selects one 2D cross-section of a 4D volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SliceSelector {
    pub dimension: SliceDimension,
    pub index: usize,
    pub time_point: usize,
}

/// A parsed image id: the file path (the resource key) plus the slice
/// selector. Distinct paths never share cache entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageId {
    pub file_path: String,
    pub slice: SliceSelector,
}

impl ImageId {
    pub fn new(file_path: impl Into<String>, slice: SliceSelector) -> Self {
        Self {
            file_path: file_path.into(),
            slice,
        }
    }

    /// The resource key used by the fetcher and caches.
    pub fn resource_key(&self) -> &str {
        &self.file_path
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "nifti:{}#{}-{},t-{}",
            self.file_path,
            self.slice.dimension.token(),
            self.slice.index,
            self.slice.time_point
        )
    }
}

impl FromStr for ImageId {
    type Err = NiftiError;

    fn from_str(s: &str) -> Result<Self> {
        parse_image_id(s)
    }
}

fn invalid(image_id: &str) -> NiftiError {
    NiftiError::Format(format!("Not in a valid imageId format: {}", image_id))
}

fn parse_decimal(digits: &str, image_id: &str) -> Result<usize> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(image_id));
    }
    digits.parse::<usize>().map_err(|_| invalid(image_id))
}

/// Parse an image id string.
///
/// Malformed identifiers (`#` without content, `#-25`, `#x-`, trailing comma,
/// incomplete `,t-` suffix, `#t-10`) fail with a `Format` error naming the
/// offending string.
pub fn parse_image_id(image_id: &str) -> Result<ImageId> {
    let rest = image_id.strip_prefix("nifti:").ok_or_else(|| invalid(image_id))?;

    let (file_path, fragment) = match rest.find('#') {
        Some(pos) => (&rest[..pos], Some(&rest[pos + 1..])),
        None => (rest, None),
    };

    if file_path.is_empty() {
        return Err(invalid(image_id));
    }

    let mut slice = SliceSelector::default();

    if let Some(fragment) = fragment {
        if fragment.is_empty() {
            return Err(invalid(image_id));
        }

        // split off the ",t-N" timepoint suffix, if present
        let (selector_part, time_point) = match fragment.find(',') {
            Some(pos) => {
                let suffix = &fragment[pos + 1..];
                let digits = suffix.strip_prefix("t-").ok_or_else(|| invalid(image_id))?;
                (&fragment[..pos], Some(parse_decimal(digits, image_id)?))
            }
            None => (fragment, None),
        };

        if selector_part.is_empty() {
            return Err(invalid(image_id));
        }

        let first = selector_part.chars().next().unwrap_or_default();
        if let Some(dimension) = SliceDimension::from_token(first) {
            slice.dimension = dimension;
            let tail = &selector_part[1..];
            if !tail.is_empty() {
                let digits = tail.strip_prefix('-').ok_or_else(|| invalid(image_id))?;
                slice.index = parse_decimal(digits, image_id)?;
            }
            slice.time_point = time_point.unwrap_or(0);
        } else {
            // a bare index selects the default dimension; a timepoint suffix
            // is only valid after an explicit dimension token
            if time_point.is_some() {
                return Err(invalid(image_id));
            }
            slice.index = parse_decimal(selector_part, image_id)?;
        }
    }

    Ok(ImageId {
        file_path: file_path.to_string(),
        slice,
    })
}
