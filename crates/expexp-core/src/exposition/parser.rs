//! Decoder for the Prometheus text exposition format (version 0.0.4).
//!
//! Produces `prometheus::proto` metric families in the order their names are
//! first seen. The rules follow the reference Go parser: samples without a
//! `# TYPE` line are untyped, `_sum`/`_count`/`_bucket` samples fold into a
//! preceding summary or histogram, and families left without samples are
//! dropped.

use std::collections::HashMap;

use prometheus::proto::{
    Bucket, Counter, Gauge, LabelPair, Metric, MetricFamily, MetricType, Quantile, Untyped,
};

use super::ExpositionError;

const QUANTILE_LABEL: &str = "quantile";
const BUCKET_LABEL: &str = "le";

/// Role of a sample within a summary or histogram family.
#[derive(Debug, Clone, Copy, PartialEq)]
enum SampleRole {
    Plain,
    Sum,
    Count,
    Bucket,
}

struct FamilyState {
    family: MetricFamily,
    kind: Option<MetricType>,
    has_help: bool,
}

/// Parsed sample line before it is attached to a family.
struct Sample {
    name: String,
    labels: Vec<(String, String)>,
    value: f64,
    timestamp: Option<i64>,
}

#[derive(Default)]
struct TextParser {
    families: Vec<FamilyState>,
    by_name: HashMap<String, usize>,
    /// Summary/histogram metrics keyed by family and label set, sorted by
    /// label name.
    grouped: HashMap<(usize, Vec<(String, String)>), usize>,
}

/// Decodes text exposition bytes into metric families.
pub fn parse_text(input: &[u8]) -> Result<Vec<MetricFamily>, ExpositionError> {
    let text = std::str::from_utf8(input).map_err(|e| {
        let line = input[..e.valid_up_to()]
            .iter()
            .filter(|&&b| b == b'\n')
            .count()
            + 1;
        ExpositionError::new(line, "invalid UTF-8 in input")
    })?;

    let mut parser = TextParser::default();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        parser
            .parse_line(raw)
            .map_err(|message| ExpositionError::new(line, message))?;
    }
    Ok(parser.finish())
}

impl TextParser {
    fn parse_line(&mut self, raw: &str) -> Result<(), String> {
        let line = raw.trim_start_matches(is_blank);
        if line.is_empty() {
            return Ok(());
        }
        if let Some(comment) = line.strip_prefix('#') {
            return self.parse_comment(comment);
        }
        let sample = parse_sample(line)?;
        self.add_sample(sample)
    }

    fn parse_comment(&mut self, comment: &str) -> Result<(), String> {
        let rest = comment.trim_start_matches(is_blank);
        let (keyword, rest) = split_token(rest);
        match keyword {
            "HELP" => {
                let (name, rest) = split_token(rest.trim_start_matches(is_blank));
                check_metric_name(name)?;
                let help = unescape_help(rest.trim_start_matches(is_blank))?;
                let (idx, _) = self.family_for(name);
                let state = &mut self.families[idx];
                if state.has_help {
                    return Err(format!("second HELP line for metric name {name:?}"));
                }
                state.family.set_help(help);
                state.has_help = true;
                Ok(())
            }
            "TYPE" => {
                let (name, rest) = split_token(rest.trim_start_matches(is_blank));
                check_metric_name(name)?;
                let (kind, rest) = split_token(rest.trim_start_matches(is_blank));
                if !rest.trim_matches(is_blank).is_empty() {
                    return Err(format!("unexpected content after type {kind:?}"));
                }
                let kind = parse_metric_type(kind)?;
                let (idx, _) = self.family_for(name);
                let state = &mut self.families[idx];
                if state.kind.is_some() {
                    return Err(format!(
                        "second TYPE line for metric name {name:?}, or TYPE reported after samples"
                    ));
                }
                state.family.set_field_type(kind);
                state.kind = Some(kind);
                Ok(())
            }
            // Any other comment is ignored.
            _ => Ok(()),
        }
    }

    /// Finds the family a name belongs to, creating it if needed.
    fn family_for(&mut self, name: &str) -> (usize, SampleRole) {
        if let Some(&idx) = self.by_name.get(name) {
            return (idx, SampleRole::Plain);
        }

        let suffixes = [
            ("_sum", SampleRole::Sum),
            ("_count", SampleRole::Count),
            ("_bucket", SampleRole::Bucket),
        ];
        for (suffix, role) in suffixes {
            let Some(base) = name.strip_suffix(suffix) else {
                continue;
            };
            let Some(&idx) = self.by_name.get(base) else {
                continue;
            };
            match (self.families[idx].kind, role) {
                (Some(MetricType::HISTOGRAM), _)
                | (Some(MetricType::SUMMARY), SampleRole::Sum | SampleRole::Count) => {
                    return (idx, role);
                }
                _ => {}
            }
        }

        let mut family = MetricFamily::default();
        family.set_name(name.to_string());
        let idx = self.families.len();
        self.families.push(FamilyState {
            family,
            kind: None,
            has_help: false,
        });
        self.by_name.insert(name.to_string(), idx);
        (idx, SampleRole::Plain)
    }

    fn add_sample(&mut self, sample: Sample) -> Result<(), String> {
        let (idx, role) = self.family_for(&sample.name);
        let kind = *self.families[idx].kind.get_or_insert(MetricType::UNTYPED);
        self.families[idx].family.set_field_type(kind);

        let mut labels = Vec::with_capacity(sample.labels.len());
        let mut quantile = None;
        let mut upper_bound = None;
        for (name, value) in sample.labels {
            if labels.iter().any(|(existing, _)| *existing == name)
                || (name == QUANTILE_LABEL && quantile.is_some())
                || (name == BUCKET_LABEL && upper_bound.is_some())
            {
                return Err(format!("duplicate label name {name:?}"));
            }
            match kind {
                MetricType::SUMMARY if name == QUANTILE_LABEL => {
                    quantile = Some(parse_float(&value).ok_or_else(|| {
                        format!("expected float as value for 'quantile' label, got {value:?}")
                    })?);
                }
                MetricType::HISTOGRAM if name == BUCKET_LABEL => {
                    upper_bound = Some(parse_float(&value).ok_or_else(|| {
                        format!("expected float as value for 'le' label, got {value:?}")
                    })?);
                }
                _ => labels.push((name, value)),
            }
        }

        let metric_idx = match kind {
            MetricType::SUMMARY | MetricType::HISTOGRAM => {
                let mut signature = labels.clone();
                signature.sort_unstable();
                let key = (idx, signature);
                match self.grouped.get(&key) {
                    Some(&m) => m,
                    None => {
                        let m = push_metric(&mut self.families[idx].family, &labels);
                        self.grouped.insert(key, m);
                        m
                    }
                }
            }
            _ => push_metric(&mut self.families[idx].family, &labels),
        };

        let metric = &mut self.families[idx].family.mut_metric()[metric_idx];
        match kind {
            MetricType::COUNTER => {
                let mut counter = Counter::default();
                counter.set_value(sample.value);
                metric.set_counter(counter);
            }
            MetricType::GAUGE => {
                let mut gauge = Gauge::default();
                gauge.set_value(sample.value);
                metric.set_gauge(gauge);
            }
            MetricType::SUMMARY => {
                let summary = metric.mut_summary();
                match role {
                    SampleRole::Count => summary.set_sample_count(sample.value as u64),
                    SampleRole::Sum => summary.set_sample_sum(sample.value),
                    _ => {
                        if let Some(q) = quantile {
                            let mut entry = Quantile::default();
                            entry.set_quantile(q);
                            entry.set_value(sample.value);
                            summary.mut_quantile().push(entry);
                        }
                    }
                }
            }
            MetricType::HISTOGRAM => {
                let histogram = metric.mut_histogram();
                match role {
                    SampleRole::Count => histogram.set_sample_count(sample.value as u64),
                    SampleRole::Sum => histogram.set_sample_sum(sample.value),
                    _ => {
                        if let Some(le) = upper_bound {
                            let mut bucket = Bucket::default();
                            bucket.set_upper_bound(le);
                            bucket.set_cumulative_count(sample.value as u64);
                            histogram.mut_bucket().push(bucket);
                        }
                    }
                }
            }
            _ => {
                let mut untyped = Untyped::default();
                untyped.set_value(sample.value);
                metric.set_untyped(untyped);
            }
        }
        if let Some(ts) = sample.timestamp {
            metric.set_timestamp_ms(ts);
        }
        Ok(())
    }

    fn finish(self) -> Vec<MetricFamily> {
        self.families
            .into_iter()
            .map(|state| state.family)
            .filter(|family| !family.get_metric().is_empty())
            .collect()
    }
}

fn push_metric(family: &mut MetricFamily, labels: &[(String, String)]) -> usize {
    let mut metric = Metric::default();
    for (name, value) in labels {
        let mut pair = LabelPair::default();
        pair.set_name(name.clone());
        pair.set_value(value.clone());
        metric.mut_label().push(pair);
    }
    family.mut_metric().push(metric);
    family.get_metric().len() - 1
}

fn parse_sample(line: &str) -> Result<Sample, String> {
    let name_len = line
        .find(|c: char| !is_name_char(c))
        .unwrap_or(line.len());
    let (name, mut rest) = line.split_at(name_len);
    check_metric_name(name)?;

    rest = rest.trim_start_matches(is_blank);
    let labels = match rest.strip_prefix('{') {
        Some(inner) => {
            let (labels, after) = parse_labels(inner)?;
            rest = after.trim_start_matches(is_blank);
            labels
        }
        None => Vec::new(),
    };

    let (value, rest) = split_token(rest);
    if value.is_empty() {
        return Err(format!("missing value for metric {name:?}"));
    }
    let value = parse_float(value).ok_or_else(|| format!("expected float as value, got {value:?}"))?;

    let (timestamp, rest) = split_token(rest.trim_start_matches(is_blank));
    let timestamp = if timestamp.is_empty() {
        None
    } else {
        Some(
            timestamp
                .parse::<i64>()
                .map_err(|_| format!("expected integer as timestamp, got {timestamp:?}"))?,
        )
    };
    if !rest.trim_matches(is_blank).is_empty() {
        return Err(format!("spurious string after timestamp: {:?}", rest.trim()));
    }

    Ok(Sample {
        name: name.to_string(),
        labels,
        value,
        timestamp,
    })
}

/// Parses a label set starting just after `{`. Returns the labels and the
/// text following the closing `}`.
fn parse_labels(mut input: &str) -> Result<(Vec<(String, String)>, &str), String> {
    let mut labels = Vec::new();
    loop {
        input = input.trim_start_matches(is_blank);
        if let Some(after) = input.strip_prefix('}') {
            return Ok((labels, after));
        }

        let name_len = input
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(input.len());
        let (name, rest) = input.split_at(name_len);
        if !is_label_name(name) {
            return Err(format!("invalid label name {name:?}"));
        }

        let rest = rest.trim_start_matches(is_blank);
        let rest = rest
            .strip_prefix('=')
            .ok_or_else(|| format!("expected '=' after label name {name:?}"))?;
        let rest = rest.trim_start_matches(is_blank);
        let rest = rest
            .strip_prefix('"')
            .ok_or_else(|| format!("expected '\"' to open value of label {name:?}"))?;
        let (value, rest) = read_label_value(rest)?;
        labels.push((name.to_string(), value));

        let rest = rest.trim_start_matches(is_blank);
        input = match rest.strip_prefix(',') {
            Some(after) => after,
            None if rest.starts_with('}') => rest,
            None => return Err(format!("unexpected end of label set after {name:?}")),
        };
    }
}

/// Reads a quoted label value up to the closing quote.
fn read_label_value(input: &str) -> Result<(String, &str), String> {
    let mut value = String::new();
    let mut chars = input.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((value, &input[i + 1..])),
            '\\' => match chars.next() {
                Some((_, '\\')) => value.push('\\'),
                Some((_, '"')) => value.push('"'),
                Some((_, 'n')) => value.push('\n'),
                Some((_, other)) => {
                    return Err(format!("invalid escape sequence '\\{other}'"));
                }
                None => break,
            },
            c => value.push(c),
        }
    }
    Err("unterminated label value".to_string())
}

fn unescape_help(input: &str) -> Result<String, String> {
    let mut help = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            help.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => help.push('\\'),
            Some('n') => help.push('\n'),
            Some(other) => return Err(format!("invalid escape sequence '\\{other}'")),
            None => return Err("trailing backslash in HELP".to_string()),
        }
    }
    Ok(help)
}

fn parse_metric_type(kind: &str) -> Result<MetricType, String> {
    match kind {
        "counter" => Ok(MetricType::COUNTER),
        "gauge" => Ok(MetricType::GAUGE),
        "histogram" => Ok(MetricType::HISTOGRAM),
        "summary" => Ok(MetricType::SUMMARY),
        "untyped" => Ok(MetricType::UNTYPED),
        other => Err(format!("unknown metric type {other:?}")),
    }
}

fn parse_float(s: &str) -> Option<f64> {
    s.parse::<f64>().ok()
}

fn check_metric_name(name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return Err(format!("invalid metric name {name:?}")),
    }
    if chars.all(is_name_char) {
        Ok(())
    } else {
        Err(format!("invalid metric name {name:?}"))
    }
}

fn is_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == ':'
}

fn is_blank(c: char) -> bool {
    c == ' ' || c == '\t'
}

/// Splits off the leading non-blank token.
fn split_token(input: &str) -> (&str, &str) {
    let end = input.find(is_blank).unwrap_or(input.len());
    input.split_at(end)
}
