//! Infrastructure adapters and runtime bootstrap.

pub mod db;
pub mod error;
pub mod fixtures;
pub mod http;
pub mod snapshots;
pub mod telemetry;
pub mod webdriver;
