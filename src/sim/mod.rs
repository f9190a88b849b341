pub mod config;
pub mod perf_log;
pub mod top;
pub mod workload;
