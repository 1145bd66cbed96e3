pub mod api;
pub mod circuit;
pub mod config;
pub mod detection;
pub mod dispatch;
pub mod error;
pub mod intervention;
pub mod lifecycle;
pub mod predictive;
pub mod registry;
pub mod storage;
pub mod supervisor;
pub mod telemetry;
pub mod types;

pub use config::SupervisorConfig;
pub use error::{Result, SupervisorError};
pub use supervisor::Supervisor;
pub use types::*;
