//! File modules: named, independently configured file sources.
//!
//! A module maps a route parameter to a base path on disk. Requests may
//! select a sub-path only when the module has a deny pattern configured; see
//! [`FileModule::validate_path`].

mod gatherer;
mod path;

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::fetch::RequestContext;
use crate::metrics::ProxyMetrics;

pub use gatherer::{FileGatherer, GatherError, Gatherer};
pub use path::{PathRejection, normalize_slashes};

/// Settings of one file module. Immutable once built.
#[derive(Debug, Clone)]
pub struct FileModule {
    name: String,
    base_path: String,
    use_mtime: bool,
    /// Paths matching this pattern are rejected.
    allow_pattern: Option<Regex>,
    timeout: Option<Duration>,
}

impl FileModule {
    /// Creates a module serving exactly `base_path`.
    pub fn new(name: impl Into<String>, base_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_path: base_path.into(),
            use_mtime: false,
            allow_pattern: None,
            timeout: None,
        }
    }

    /// Back-date decoded samples with the file's modification time.
    pub fn with_use_mtime(mut self, use_mtime: bool) -> Self {
        self.use_mtime = use_mtime;
        self
    }

    /// Allows sub-path selection, rejecting every path that matches `pattern`.
    pub fn with_allow_pattern(mut self, pattern: Regex) -> Self {
        self.allow_pattern = Some(pattern);
        self
    }

    /// Caps each fetch at `timeout` in addition to the request's own deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn use_mtime(&self) -> bool {
        self.use_mtime
    }

    pub fn allow_pattern(&self) -> Option<&Regex> {
        self.allow_pattern.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Request context for a fetch of this module, narrowed by its timeout.
    pub fn request_context(&self, ctx: RequestContext) -> RequestContext {
        match self.timeout {
            Some(timeout) => ctx.tightened(timeout),
            None => ctx,
        }
    }

    /// Binds a validated, resolved path into a gatherer.
    pub fn gatherer(
        self: &Arc<Self>,
        ctx: RequestContext,
        resolved: String,
        metrics: Arc<ProxyMetrics>,
    ) -> FileGatherer {
        FileGatherer::new(Arc::clone(self), ctx, resolved, metrics)
    }
}
