//! Host-side image volume.
//!
//! A [`Volume`] is the unit the data pipeline moves around: voxel intensities
//! with an explicit leading channel axis, `[C, D, H, W]` (`[C, Z, Y, X]`),
//! plus the [`Geometry`] read from the image header. Volumes live in host
//! memory so they can be produced by background readers and handed to any
//! tensor backend afterwards.

use ndarray::{Array3, Array4, Axis};
use thiserror::Error;

use crate::geometry::Geometry;

/// Errors raised when constructing volumes.
#[derive(Error, Debug, PartialEq)]
pub enum VolumeError {
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Volume must have at least one voxel, got shape {0:?}")]
    Empty(Vec<usize>),
}

/// Voxel data plus physical geometry. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    data: Array4<f32>,
    geometry: Geometry,
}

impl Volume {
    /// Wrap a `[C, D, H, W]` array.
    pub fn new(data: Array4<f32>, geometry: Geometry) -> Result<Self, VolumeError> {
        if data.is_empty() {
            return Err(VolumeError::Empty(data.shape().to_vec()));
        }
        Ok(Self { data, geometry })
    }

    /// Wrap a single-channel `[D, H, W]` array, adding the channel axis.
    pub fn from_spatial(data: Array3<f32>, geometry: Geometry) -> Result<Self, VolumeError> {
        Self::new(data.insert_axis(Axis(0)), geometry)
    }

    /// Build a single-channel volume from a flat buffer in `[D, H, W]` order.
    pub fn from_vec(
        shape: [usize; 3],
        values: Vec<f32>,
        geometry: Geometry,
    ) -> Result<Self, VolumeError> {
        let expected = shape.iter().product::<usize>();
        if values.len() != expected {
            return Err(VolumeError::ShapeMismatch {
                expected: vec![expected],
                actual: vec![values.len()],
            });
        }
        let data = Array3::from_shape_vec(shape, values).map_err(|_| VolumeError::ShapeMismatch {
            expected: shape.to_vec(),
            actual: vec![expected],
        })?;
        Self::from_spatial(data, geometry)
    }

    pub fn data(&self) -> &Array4<f32> {
        &self.data
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Full shape `[C, D, H, W]`.
    pub fn shape(&self) -> [usize; 4] {
        let s = self.data.shape();
        [s[0], s[1], s[2], s[3]]
    }

    pub fn channels(&self) -> usize {
        self.data.shape()[0]
    }

    /// Spatial shape `[D, H, W]`.
    pub fn spatial_shape(&self) -> [usize; 3] {
        let s = self.data.shape();
        [s[1], s[2], s[3]]
    }

    /// Voxel values in row-major `[C, D, H, W]` order.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }

    /// One channel as a `[D, H, W]` array.
    pub fn channel(&self, index: usize) -> Array3<f32> {
        self.data.index_axis(Axis(0), index).to_owned()
    }

    pub fn min_max(&self) -> (f32, f32) {
        self.data
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
    }
}
