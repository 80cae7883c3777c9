//! A file-backed object cache.
//!
//! The cache keeps fetched resources in a flat on-disk directory, decides when entries are stale,
//! coalesces concurrent requests for the same key and decodes cached files into typed items,
//! optionally on a designated serial execution context. See the [`caching`] module for the
//! details and [`images`] for the bitmap specialization.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod dispatch;
pub mod download;
pub mod images;
pub mod logging;
pub mod service;
pub mod utils;
