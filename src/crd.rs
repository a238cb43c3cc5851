//! `ImageBasedUpgrade` CRD type definition.

pub mod spec;
pub mod status;
pub mod types;

pub use spec::{AutoRollbackConfig, ImageBasedUpgrade, ImageBasedUpgradeSpec, PullSecretRef, SeedImageRef};
pub use status::{ImageBasedUpgradeStatus, PrepStatus, UpgradeCondition};
pub use types::{PrepPhase, Stage};
