pub mod spatial;
pub mod geometry;
pub mod volume;

pub use geometry::Geometry;
pub use spatial::{Direction3, Point3, Spacing3, Vector3};
pub use volume::{Volume, VolumeError};
