pub mod health;
pub mod state_machine;

pub use health::HealthTracker;
pub use state_machine::{HealthStateMachine, LifecycleEvent};
