pub mod base;
pub mod sim;
pub mod stats;
pub mod telemetry;
pub mod timeq;
