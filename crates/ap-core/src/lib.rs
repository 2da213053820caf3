pub mod config;
pub mod fsutil;
pub mod log_ring;
pub mod plan;
pub mod plan_store;
pub mod task_store;
pub mod types;
