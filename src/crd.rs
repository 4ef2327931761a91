//! `ImageBasedUpgrade` CRD type definition.

pub mod spec;
pub mod status;
pub mod types;

pub use spec::{
    AutoRollbackOnFailure, ConfigMapRef, ImageBasedUpgrade, ImageBasedUpgradeSpec, SeedImageRef,
};
pub use status::{ImageBasedUpgradeStatus, PinnedSpec, UpgradeCondition};
pub use types::{ConditionStatus, ConditionType, Stage, reason};
