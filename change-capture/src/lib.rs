pub mod change;
pub mod checkpoint;
pub mod config;
pub mod consumer;
pub mod error;
pub mod sink;
