pub mod category;
pub mod classifier;
pub mod event;
pub mod metrics;
pub mod metrics_consts;
pub mod time;
