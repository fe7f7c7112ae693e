//! expexp-core: pull-through exposition proxy for file-backed metrics.
//!
//! Provides:
//! - `fetch`: deadline-bound file reader and the async fetch orchestrator
//! - `exposition`: text format decoder and mtime synthesis
//! - `module`: file module settings, request path validation, gatherers
//! - `metrics`: the proxy's own counters
//! - `config`: YAML module configuration

pub mod config;
pub mod exposition;
pub mod fetch;
pub mod metrics;
pub mod module;

/// Version string with the git revision the binary was built from.
pub const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_SHA"), ")");
