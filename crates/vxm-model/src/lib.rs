pub mod adapter;
pub mod capability;
pub mod interpolation;
pub mod losses;
pub mod spatial_transform;
pub mod voxelmorph;

pub use adapter::{batch_to_volumes, volumes_to_batch};
pub use capability::{Registerable, RegistrationOutput, Scoreable};
pub use losses::{DiceScore, LossTerms, VoxelMorphLoss};
pub use spatial_transform::{integrate_velocity, warp};
pub use voxelmorph::{VoxelMorph, VoxelMorphConfig};
