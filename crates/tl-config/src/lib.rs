pub mod daemon;
pub mod paths;
pub mod plans;
pub mod sweep;

pub use daemon::DaemonConfig;
pub use paths::ConfigPaths;
pub use plans::{PlansConfig, ThresholdsConfig};
pub use sweep::SweepConfig;
