//! Physical-space points, vectors and orientation of 3-D volumes.

use nalgebra::{Matrix3, Point3 as NaPoint3, Vector3 as NaVector3};
use serde::{Deserialize, Serialize};

/// Position in scanner coordinates (millimetres).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point3(pub NaPoint3<f64>);

impl Point3 {
    pub fn new(coords: [f64; 3]) -> Self {
        Self(NaPoint3::from(coords))
    }

    pub fn origin() -> Self {
        Self(NaPoint3::origin())
    }
}

impl std::ops::Index<usize> for Point3 {
    type Output = f64;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0.coords[index]
    }
}

/// Per-axis quantity in `(x, y, z)` order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vector3(pub NaVector3<f64>);

impl Vector3 {
    pub fn new(components: [f64; 3]) -> Self {
        Self(NaVector3::from(components))
    }

    pub fn uniform(value: f64) -> Self {
        Self(NaVector3::repeat(value))
    }

    pub fn norm(&self) -> f64 {
        self.0.norm()
    }
}

impl std::ops::Index<usize> for Vector3 {
    type Output = f64;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl std::ops::IndexMut<usize> for Vector3 {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.0[index]
    }
}

/// Voxel size along x, y and z.
pub type Spacing3 = Vector3;

/// Direction cosines; column `i` is the physical direction of voxel axis `i`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Direction3(pub Matrix3<f64>);

impl Direction3 {
    pub fn identity() -> Self {
        Self(Matrix3::identity())
    }

    pub fn from_columns(columns: &[NaVector3<f64>; 3]) -> Self {
        Self(Matrix3::from_columns(columns))
    }
}
