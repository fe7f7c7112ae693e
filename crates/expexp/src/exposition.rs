//! Content negotiation and encoding of gathered families.

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, ProtobufEncoder, TextEncoder};
use tracing::error;

use expexp_core::module::Gatherer;

const PROTOBUF_MEDIA_TYPE: &str = "application/vnd.google.protobuf";
const PROTOBUF_PROTO: &str = "io.prometheus.client.MetricFamily";

/// One `Accept` entry: media type, parameters and weight.
struct MediaRange<'a> {
    media: &'a str,
    params: Vec<(&'a str, &'a str)>,
    q: f64,
}

impl<'a> MediaRange<'a> {
    fn parse(item: &'a str) -> Option<Self> {
        let mut parts = item.split(';').map(str::trim);
        let media = parts.next().filter(|m| !m.is_empty())?;
        let mut params = Vec::new();
        let mut q = 1.0;
        for part in parts {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim().trim_matches('"'));
            if key.eq_ignore_ascii_case("q") {
                q = value.parse().unwrap_or(0.0);
            } else {
                params.push((key, value));
            }
        }
        Some(Self { media, params, q })
    }

    fn param(&self, key: &str) -> Option<&'a str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|&(_, v)| v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Format {
    Text,
    Protobuf,
}

impl Format {
    /// Picks the highest-weighted acceptable format from `Accept`.
    ///
    /// Protobuf is chosen only for the delimited `MetricFamily` encoding.
    /// Entries with `q=0` are refused, and text is the fallback.
    pub(crate) fn negotiate(headers: &HeaderMap) -> Self {
        let mut ranges: Vec<MediaRange<'_>> = headers
            .get_all(header::ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .filter_map(MediaRange::parse)
            .filter(|range| range.q > 0.0)
            .collect();
        // Stable, so equal weights keep header order.
        ranges.sort_by(|a, b| b.q.total_cmp(&a.q));

        for range in &ranges {
            if range.media.eq_ignore_ascii_case(PROTOBUF_MEDIA_TYPE) {
                if range.param("proto") == Some(PROTOBUF_PROTO)
                    && range.param("encoding") == Some("delimited")
                {
                    return Self::Protobuf;
                }
            } else if range.media.eq_ignore_ascii_case("text/plain") || range.media == "*/*" {
                return Self::Text;
            }
        }
        Self::Text
    }

    pub(crate) fn encode(self, families: &[MetricFamily]) -> prometheus::Result<(Vec<u8>, String)> {
        let mut buf = Vec::new();
        let content_type = match self {
            Self::Text => {
                let encoder = TextEncoder::new();
                encoder.encode(families, &mut buf)?;
                encoder.format_type().to_owned()
            }
            Self::Protobuf => {
                let encoder = ProtobufEncoder::new();
                encoder.encode(families, &mut buf)?;
                encoder.format_type().to_owned()
            }
        };
        Ok((buf, content_type))
    }
}

/// Runs one gather and writes the result in the negotiated format.
pub(crate) async fn serve<G: Gatherer>(gatherer: &G, headers: &HeaderMap) -> Response {
    let families = match gatherer.gather().await {
        Ok(families) => families,
        Err(e) => return gather_failed(&e),
    };

    let format = Format::negotiate(headers);
    match format.encode(&families) {
        Ok((body, content_type)) => {
            let mut response = body.into_response();
            if let Ok(value) = HeaderValue::from_str(&content_type) {
                response.headers_mut().insert(header::CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => {
            error!(error = %e, ?format, "failed to encode metrics");
            gather_failed(&e)
        }
    }
}

fn gather_failed(err: &dyn std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("An error has occurred while serving metrics:\n\n{err}"),
    )
        .into_response()
}
