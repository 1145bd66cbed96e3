pub mod engine;
pub mod policy;

pub use engine::{ActiveRemediation, Delivery, InterventionEngine, RemediationState};
pub use policy::{policy, starting_level, LevelPolicy, RemediationAction, ESCALATION_TABLE};
