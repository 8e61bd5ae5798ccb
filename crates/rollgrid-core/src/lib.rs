pub mod config;
pub mod time;

pub use config::{EngineConfig, ReconcileConfig, RolloutConfig};
pub use time::epoch_secs;
