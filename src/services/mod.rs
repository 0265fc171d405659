pub mod aggregator;
pub mod schedule;
pub mod session;
pub mod zenduty;
