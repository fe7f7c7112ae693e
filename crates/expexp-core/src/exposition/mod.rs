//! Turning fetched bytes into metric families.
//!
//! Decoding is followed by two optional rewrites driven by the file's
//! modification time: back-dating every decoded sample, and appending the
//! `expexp_file_mtime` gauge so scrapers can alert on stale files.

mod parser;

use std::time::{SystemTime, UNIX_EPOCH};

use prometheus::proto::{Gauge, LabelPair, Metric, MetricFamily, MetricType};
use thiserror::Error;

pub use parser::parse_text;

/// Name of the synthesized modification time family.
pub const MTIME_FAMILY: &str = "expexp_file_mtime";
pub const MTIME_HELP: &str = "time of modification of parsed file, in milliseconds";
pub const MTIME_LABEL_MODULE: &str = "module";
pub const MTIME_LABEL_PATH: &str = "path";

/// Input that is not valid text exposition format.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("text format parsing error in line {line}: {message}")]
pub struct ExpositionError {
    pub line: usize,
    pub message: String,
}

impl ExpositionError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// What the synthesizer needs to know about the file that was read.
#[derive(Debug, Clone, Copy)]
pub struct SourceInfo<'a> {
    pub module: &'a str,
    pub path: &'a str,
    pub modified: Option<SystemTime>,
    /// Overwrite decoded sample timestamps with `modified`.
    pub use_mtime: bool,
}

/// Decodes `data` and applies the modification time rewrites.
///
/// Decoded families come first, in input order; the mtime family, when the
/// modification time is known, is last.
pub fn synthesize(data: &[u8], source: &SourceInfo<'_>) -> Result<Vec<MetricFamily>, ExpositionError> {
    let mut families = parse_text(data)?;
    let Some(modified) = source.modified else {
        return Ok(families);
    };

    if families.iter().any(|f| f.get_name() == MTIME_FAMILY) {
        return Err(ExpositionError::new(
            0,
            format!("family name {MTIME_FAMILY:?} is reserved"),
        ));
    }

    let millis = epoch_millis(modified);
    if source.use_mtime {
        stamp_timestamps(&mut families, millis);
    }
    families.push(mtime_family(source.module, source.path, millis));
    Ok(families)
}

/// Sets every metric's timestamp to `millis`, replacing any existing one.
pub fn stamp_timestamps(families: &mut [MetricFamily], millis: i64) {
    for family in families.iter_mut() {
        for metric in family.mut_metric().iter_mut() {
            metric.set_timestamp_ms(millis);
        }
    }
}

/// Builds the single-sample `expexp_file_mtime` gauge family.
pub fn mtime_family(module: &str, path: &str, millis: i64) -> MetricFamily {
    let mut gauge = Gauge::default();
    gauge.set_value(millis as f64);

    let mut metric = Metric::default();
    for (name, value) in [(MTIME_LABEL_MODULE, module), (MTIME_LABEL_PATH, path)] {
        let mut pair = LabelPair::default();
        pair.set_name(name.to_string());
        pair.set_value(value.to_string());
        metric.mut_label().push(pair);
    }
    metric.set_gauge(gauge);

    let mut family = MetricFamily::default();
    family.set_name(MTIME_FAMILY.to_string());
    family.set_help(MTIME_HELP.to_string());
    family.set_field_type(MetricType::GAUGE);
    family.mut_metric().push(metric);
    family
}

/// Milliseconds since the Unix epoch; negative for earlier times.
pub fn epoch_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}
