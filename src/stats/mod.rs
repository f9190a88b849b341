//! Cycle-level hardware statistics: counters, stall attribution, power/area and reports.

pub mod cycle;
pub mod dataflow;
pub mod engine;
pub mod fu;
pub mod memory;
pub mod power;
pub mod report;
pub mod stall;
pub mod summary;
pub mod types;

pub use engine::HwStatistics;
