//! Shared application state.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::sync::Arc;

use axum::extract::State;

use expexp_core::config::Config;
use expexp_core::metrics::ProxyMetrics;

pub(crate) struct AppInner {
    /// File modules by name, immutable after startup.
    pub(crate) config: Config,
    pub(crate) metrics: Arc<ProxyMetrics>,
}

pub(crate) type SharedState = Arc<AppInner>;

pub(crate) type AppState = State<SharedState>;
