//! Common test utilities for nzb-stream integration tests

#[allow(dead_code)]
pub mod fetcher;
#[allow(dead_code)]
pub mod fixtures;

pub use fetcher::*;
pub use fixtures::*;
