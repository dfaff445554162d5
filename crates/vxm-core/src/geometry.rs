//! Physical-space geometry of a volume.
//!
//! Geometry follows the NIfTI axis order `(x, y, z)`: `spacing[0]` is the
//! distance between voxels along the x axis, column 0 of `direction` is the x
//! axis direction. Voxel data in [`crate::Volume`] is stored `[Z, Y, X]`.

use nalgebra::{Matrix3, Vector3 as NaVector3};
use serde::{Deserialize, Serialize};

use crate::spatial::{Direction3, Point3, Spacing3, Vector3};

/// Origin, spacing and orientation describing how voxel indices map to
/// physical (scanner) coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub origin: Point3,
    pub spacing: Spacing3,
    pub direction: Direction3,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            origin: Point3::origin(),
            spacing: Spacing3::uniform(1.0),
            direction: Direction3::identity(),
        }
    }
}

impl Geometry {
    pub fn new(origin: Point3, spacing: Spacing3, direction: Direction3) -> Self {
        Self {
            origin,
            spacing,
            direction,
        }
    }

    /// Decompose the top three rows of a 4x4 voxel-to-world affine.
    ///
    /// Spacing is the norm of each linear column; degenerate (near zero)
    /// columns fall back to the corresponding unit axis.
    pub fn from_affine(affine: [[f64; 4]; 3]) -> Self {
        let origin = Point3::new([affine[0][3], affine[1][3], affine[2][3]]);

        let columns: Vec<Vector3> = (0..3)
            .map(|c| Vector3::new([affine[0][c], affine[1][c], affine[2][c]]))
            .collect();

        let mut spacing = Spacing3::uniform(0.0);
        let mut axes = [NaVector3::x(), NaVector3::y(), NaVector3::z()];
        for (i, column) in columns.iter().enumerate() {
            let norm = column.norm();
            spacing[i] = norm;
            if norm > 1e-9 {
                axes[i] = column.0 / norm;
            }
        }

        let direction = Direction3::from_columns(&axes);
        Self::new(origin, spacing, direction)
    }

    /// Top three rows of the voxel-to-world affine: `direction * diag(spacing) | origin`.
    pub fn affine(&self) -> [[f64; 4]; 3] {
        let scaled: Matrix3<f64> = self.direction.0 * Matrix3::from_diagonal(&self.spacing.0);
        let mut rows = [[0.0; 4]; 3];
        for (r, row) in rows.iter_mut().enumerate() {
            for c in 0..3 {
                row[c] = scaled[(r, c)];
            }
            row[3] = self.origin[r];
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affine_round_trip() {
        let geometry = Geometry::new(
            Point3::new([-90.0, 126.0, -72.0]),
            Spacing3::new([1.0, 1.5, 2.0]),
            Direction3::identity(),
        );
        let back = Geometry::from_affine(geometry.affine());
        assert!((back.spacing.0 - geometry.spacing.0).norm() < 1e-12);
        assert_eq!(back.origin, geometry.origin);
        assert!((back.direction.0 - Matrix3::identity()).amax() < 1e-12);
    }

    #[test]
    fn test_degenerate_column_falls_back_to_axis() {
        let affine = [
            [0.0, 0.0, 0.0, 1.0],
            [0.0, 2.0, 0.0, 2.0],
            [0.0, 0.0, 3.0, 3.0],
        ];
        let geometry = Geometry::from_affine(affine);
        assert_eq!(geometry.spacing[0], 0.0);
        assert_eq!(geometry.direction.0[(0, 0)], 1.0);
        assert_eq!(geometry.spacing[2], 3.0);
    }
}
