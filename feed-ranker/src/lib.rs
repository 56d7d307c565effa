pub mod cache;
pub mod candidates;
pub mod config;
pub mod error;
pub mod ranking;
pub mod test_utils;
