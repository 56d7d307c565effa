pub mod config;
pub mod error;
pub mod runner;
pub mod suggested;
pub mod trending;
pub mod warmer;
