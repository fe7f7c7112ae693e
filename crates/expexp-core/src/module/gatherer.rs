//! Pull-based gatherers handed to the exposition handler.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use prometheus::Registry;
use prometheus::proto::MetricFamily;
use thiserror::Error;
use tracing::{debug, warn};

use super::FileModule;
use crate::exposition::{ExpositionError, SourceInfo, synthesize};
use crate::fetch::{FetchError, RequestContext, fetch};
use crate::metrics::ProxyMetrics;

#[derive(Debug, Error)]
pub enum GatherError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Malformed(#[from] ExpositionError),
}

/// A source of metric families, invoked once per scrape.
pub trait Gatherer {
    fn gather(&self) -> impl Future<Output = Result<Vec<MetricFamily>, GatherError>> + Send;
}

impl Gatherer for Registry {
    async fn gather(&self) -> Result<Vec<MetricFamily>, GatherError> {
        Ok(Registry::gather(self))
    }
}

/// One fetch-decode cycle of a file module, bound to a request.
pub struct FileGatherer {
    module: Arc<FileModule>,
    ctx: RequestContext,
    path: String,
    metrics: Arc<ProxyMetrics>,
}

impl FileGatherer {
    pub fn new(
        module: Arc<FileModule>,
        ctx: RequestContext,
        path: String,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        Self {
            module,
            ctx,
            path,
            metrics,
        }
    }

    /// Resolved path this gatherer reads.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Gatherer for FileGatherer {
    async fn gather(&self) -> Result<Vec<MetricFamily>, GatherError> {
        let module = self.module.name();
        self.metrics.record_start(module);

        let outcome = match fetch(&self.ctx, Path::new(&self.path)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(module, path = %self.path, error = %e, "file module failed to read file");
                self.metrics.record_failure(module);
                if e.is_timeout() {
                    self.metrics.record_timeout(module);
                }
                return Err(e.into());
            }
        };

        let source = SourceInfo {
            module,
            path: &self.path,
            modified: outcome.modified,
            use_mtime: self.module.use_mtime(),
        };
        match synthesize(&outcome.data, &source) {
            Ok(families) => {
                debug!(module, path = %self.path, families = families.len(), "gathered");
                Ok(families)
            }
            Err(e) => {
                warn!(module, path = %self.path, error = %e, "file module read malformed metrics");
                self.metrics.record_malformed(module);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exposition::{MTIME_FAMILY, epoch_millis};
    use std::io::Write;
    use std::time::Duration;
    use tokio::time::Instant;

    const STAT: &[u8] = b"\
# HELP node_procs_running Number of processes in runnable state.
# TYPE node_procs_running gauge
node_procs_running 3
# HELP node_forks_total Total number of forks.
# TYPE node_forks_total counter
node_forks_total 123456 1600000000000
";

    fn write_file(dir: &Path, name: &str, body: &[u8]) -> String {
        let path = dir.join(name);
        std::fs::File::create(&path).unwrap().write_all(body).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn metrics() -> Arc<ProxyMetrics> {
        Arc::new(ProxyMetrics::new().unwrap())
    }

    #[tokio::test]
    async fn test_proc_stat_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_file(dir.path(), "stat", STAT);
        let module = Arc::new(FileModule::new("proc_stat", base.clone()));
        let metrics = metrics();

        let resolved = module.resolve("").unwrap();
        assert_eq!(resolved, base);
        let gatherer = module.gatherer(RequestContext::background(), resolved, metrics.clone());
        let families = gatherer.gather().await.unwrap();

        assert_eq!(families.len(), 3);
        assert_eq!(families[0].get_name(), "node_procs_running");
        assert_eq!(families[1].get_name(), "node_forks_total");
        assert_eq!(families[1].get_metric()[0].get_timestamp_ms(), 1_600_000_000_000);

        let mtime = &families[2];
        assert_eq!(mtime.get_name(), MTIME_FAMILY);
        let labels: Vec<_> = mtime.get_metric()[0]
            .get_label()
            .iter()
            .map(|l| (l.get_name().to_string(), l.get_value().to_string()))
            .collect();
        assert_eq!(
            labels,
            vec![
                ("module".to_string(), "proc_stat".to_string()),
                ("path".to_string(), base.clone()),
            ]
        );

        let modified = std::fs::metadata(&base).unwrap().modified().unwrap();
        assert_eq!(
            mtime.get_metric()[0].get_gauge().get_value(),
            epoch_millis(modified) as f64
        );

        assert_eq!(metrics.starts("proc_stat"), 1);
        assert_eq!(metrics.failures("proc_stat"), 0);
    }

    #[tokio::test]
    async fn test_use_mtime_backdates_samples() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_file(dir.path(), "stat", STAT);
        let module = Arc::new(FileModule::new("stat", base.clone()).with_use_mtime(true));

        let families = module
            .gatherer(RequestContext::background(), base.clone(), metrics())
            .gather()
            .await
            .unwrap();

        let modified = std::fs::metadata(&base).unwrap().modified().unwrap();
        let expected = epoch_millis(modified);
        for family in &families[..2] {
            for metric in family.get_metric() {
                assert_eq!(metric.get_timestamp_ms(), expected);
            }
        }
    }

    #[tokio::test]
    async fn test_repeated_gathers_of_static_file_match() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_file(dir.path(), "stat", STAT);
        let module = Arc::new(FileModule::new("stat", base.clone()));
        let metrics = metrics();

        let first = module
            .gatherer(RequestContext::background(), base.clone(), metrics.clone())
            .gather()
            .await
            .unwrap();
        let second = module
            .gatherer(RequestContext::background(), base, metrics.clone())
            .gather()
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(metrics.starts("stat"), 2);
    }

    #[tokio::test]
    async fn test_missing_file_counts_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent").to_string_lossy().into_owned();
        let module = Arc::new(FileModule::new("absent", path.clone()));
        let metrics = metrics();

        let err = module
            .gatherer(RequestContext::background(), path, metrics.clone())
            .gather()
            .await
            .unwrap_err();
        assert!(matches!(err, GatherError::Fetch(FetchError::Open { .. })));
        assert_eq!(metrics.failures("absent"), 1);
        assert_eq!(metrics.timeouts("absent"), 0);
        assert_eq!(metrics.malformed("absent"), 0);
    }

    #[tokio::test]
    async fn test_deadline_counts_failure_and_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_file(dir.path(), "stat", STAT);
        let module = Arc::new(FileModule::new("slow", base.clone()));
        let metrics = metrics();

        let ctx = RequestContext::with_deadline(Instant::now());
        tokio::time::sleep(Duration::from_millis(5)).await;

        let err = module
            .gatherer(ctx, base, metrics.clone())
            .gather()
            .await
            .unwrap_err();
        assert!(matches!(err, GatherError::Fetch(ref e) if e.is_timeout()));
        assert_eq!(metrics.failures("slow"), 1);
        assert_eq!(metrics.timeouts("slow"), 1);
    }

    #[tokio::test]
    async fn test_malformed_counted_once() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_file(dir.path(), "bad", b"node_load1 high\n");
        let module = Arc::new(FileModule::new("bad", base.clone()));
        let metrics = metrics();

        let err = module
            .gatherer(RequestContext::background(), base, metrics.clone())
            .gather()
            .await
            .unwrap_err();
        assert!(matches!(err, GatherError::Malformed(_)));
        assert_eq!(metrics.malformed("bad"), 1);
        assert_eq!(metrics.failures("bad"), 0);
    }

    #[tokio::test]
    async fn test_registry_is_a_gatherer() {
        let metrics = metrics();
        metrics.record_start("m");
        let families = Gatherer::gather(metrics.registry()).await.unwrap();
        assert!(
            families
                .iter()
                .any(|f| f.get_name() == "expexp_file_starts_total")
        );
    }
}
