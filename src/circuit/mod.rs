pub mod bank;
pub mod breaker;

pub use bank::{BreakerKey, CircuitBreakerBank};
pub use breaker::{Admission, CircuitBreakerState};
