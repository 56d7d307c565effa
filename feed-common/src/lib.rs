pub mod cache;
pub mod event;
pub mod kafka;
pub mod metrics;
pub mod retry;
