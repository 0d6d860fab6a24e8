//! Turns raw pipeline stdout into a validated [`AnalysisResponse`].
//!
//! Parsing never fails outward: empty or malformed output becomes a
//! `success == false` response that keeps the original text in `raw_output`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::FailureKind;
use crate::model::{
    AnalysisResponse, ClassificationEntry, CoachingCard, LegacyTag, Payload, Sentiment,
};

const LOG_SNIPPET_CHARS: usize = 300;

#[derive(Debug, Error, PartialEq)]
pub enum ParseFailure {
    #[error("pipeline produced empty output")]
    Empty,
    #[error("failed to parse pipeline output: {0}")]
    Malformed(String),
}

impl ParseFailure {
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Empty => FailureKind::EmptyOutput.as_str(),
            Self::Malformed(_) => "MalformedPayload",
        }
    }
}

/// Top-level object printed by the pipeline scripts
#[derive(Debug, Deserialize)]
struct WireOutput {
    success: Option<bool>,
    summary: Option<String>,
    cache_key: Option<String>,
    error: Option<String>,
    error_type: Option<String>,
    classification_results: Option<Vec<Value>>,
    structured_tags: Option<Vec<Value>>,
    statistics: Option<Value>,
    data_quality: Option<Value>,
    hypotheses: Option<Vec<Value>>,
    best_hypothesis: Option<Value>,
    coaching_card: Option<Value>,
    processing_info: Option<Value>,
    #[serde(flatten)]
    unknown: Map<String, Value>,
}

impl WireOutput {
    /// Whether any field the pipelines actually emit is present. Objects
    /// recovered from noisy output must pass this, so a stray log record
    /// is never mistaken for the result.
    fn has_recognized_key(&self) -> bool {
        self.success.is_some()
            || self.error.is_some()
            || self.error_type.is_some()
            || self.classification_results.is_some()
            || self.structured_tags.is_some()
            || self.hypotheses.is_some()
            || self.best_hypothesis.is_some()
            || self.coaching_card.is_some()
    }
}

#[derive(Debug, Deserialize)]
struct WireClassification {
    keyword: Option<String>,
    sentiment: Option<String>,
    evidence: Option<String>,
    confidence: Option<f64>,
    category: Option<String>,
    mixed_details: Option<BTreeMap<String, String>>,
    definition: Option<String>,
    metadata: Option<Map<String, Value>>,
}

impl WireClassification {
    fn into_entry(self) -> Option<ClassificationEntry> {
        let sentiment = Sentiment::parse(self.sentiment.as_deref()?)?;
        let entry = ClassificationEntry {
            keyword: self.keyword?,
            sentiment,
            evidence: self.evidence?,
            confidence: self.confidence.unwrap_or(0.0),
            category: self.category,
            mixed_details: self.mixed_details,
            definition: self.definition,
            metadata: self.metadata,
        };
        entry.is_valid().then_some(entry)
    }
}

/// Parse one attempt's stdout.
pub fn parse_output(raw: &str, elapsed_ms: u64, correlation_id: &str) -> AnalysisResponse {
    let response = match decode(raw) {
        Ok(wire) => build_response(wire, correlation_id),
        Err(failure) => {
            warn!(
                "{} (correlation_id: {}): {}",
                failure,
                correlation_id,
                truncate_chars(raw.trim(), LOG_SNIPPET_CHARS)
            );
            AnalysisResponse::failure(failure.to_string(), correlation_id)
                .with_error_type(failure.error_type())
        }
    };

    response
        .with_raw_output(raw)
        .with_processing_time_ms(elapsed_ms)
}

fn decode(raw: &str) -> Result<WireOutput, ParseFailure> {
    if raw.trim().is_empty() {
        return Err(ParseFailure::Empty);
    }

    let first_err = match serde_json::from_str::<WireOutput>(raw) {
        Ok(wire) => return Ok(wire),
        Err(e) => e,
    };

    // Scripts sometimes leak log lines or colour codes onto stdout.
    let cleaned = strip_ansi_codes(raw);
    let mut candidate_err = None;
    for candidate in balanced_objects(&cleaned).into_iter().rev() {
        match serde_json::from_str::<WireOutput>(candidate) {
            Ok(wire) if wire.has_recognized_key() => {
                debug!("Recovered pipeline JSON object from noisy output");
                return Ok(wire);
            }
            Ok(_) => {}
            Err(e) => {
                candidate_err.get_or_insert(e);
            }
        }
    }

    // The newest object that looked like a result explains the failure best.
    let err = candidate_err.unwrap_or(first_err);
    Err(ParseFailure::Malformed(err.to_string()))
}

fn build_response(wire: WireOutput, correlation_id: &str) -> AnalysisResponse {
    if !wire.unknown.is_empty() {
        let keys: Vec<&String> = wire.unknown.keys().collect();
        debug!(
            "Ignoring unknown pipeline output fields {:?} (correlation_id: {})",
            keys, correlation_id
        );
    }

    let mut response = if wire.success.unwrap_or(false) {
        if let Some(ref error) = wire.error {
            debug!(
                "Dropping error field from successful output: {} (correlation_id: {})",
                error, correlation_id
            );
        }
        AnalysisResponse::success(build_payload(&wire, correlation_id), correlation_id)
    } else {
        let message = wire
            .error
            .clone()
            .unwrap_or_else(|| "pipeline reported failure without an error message".to_string());
        let mut failure = AnalysisResponse::failure(message, correlation_id);
        failure.error_type = wire.error_type.clone();
        failure
    };

    response.summary = wire.summary;
    response.cache_key = wire.cache_key;
    response.statistics = wire.statistics;
    response.data_quality = wire.data_quality;
    response.processing_info = wire.processing_info;
    response
}

fn build_payload(wire: &WireOutput, correlation_id: &str) -> Option<Payload> {
    let has_classification =
        wire.classification_results.is_some() || wire.structured_tags.is_some();
    let has_coaching = wire.hypotheses.is_some()
        || wire.best_hypothesis.is_some()
        || wire.coaching_card.is_some();

    if has_classification && has_coaching {
        warn!(
            "Output carries both classification and coaching fields; keeping classification (correlation_id: {})",
            correlation_id
        );
    }

    if has_classification {
        let entries = wire
            .classification_results
            .as_deref()
            .map(|raw| classification_entries(raw, correlation_id))
            .unwrap_or_default();
        let legacy_tags = match wire.structured_tags.as_deref() {
            Some(raw) => legacy_tags(raw, correlation_id),
            None => entries.iter().map(ClassificationEntry::to_legacy_tag).collect(),
        };
        return Some(Payload::Classification {
            entries,
            legacy_tags,
        });
    }

    if has_coaching {
        let hypotheses = wire
            .hypotheses
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(|h| h.as_str().map(str::to_string))
            .collect();
        let best_hypothesis = wire
            .best_hypothesis
            .as_ref()
            .and_then(Value::as_str)
            .map(str::to_string);
        let card = wire
            .coaching_card
            .as_ref()
            .and_then(|raw| coaching_card(raw, correlation_id));
        return Some(Payload::Coaching {
            hypotheses,
            best_hypothesis,
            card,
        });
    }

    None
}

fn classification_entries(raw: &[Value], correlation_id: &str) -> Vec<ClassificationEntry> {
    let entries: Vec<ClassificationEntry> = raw
        .iter()
        .filter_map(|value| {
            serde_json::from_value::<WireClassification>(value.clone())
                .ok()
                .and_then(WireClassification::into_entry)
        })
        .collect();

    let dropped = raw.len() - entries.len();
    if dropped > 0 {
        debug!(
            "Dropped {} invalid classification entries (correlation_id: {})",
            dropped, correlation_id
        );
    }
    entries
}

fn legacy_tags(raw: &[Value], correlation_id: &str) -> Vec<LegacyTag> {
    let tags: Vec<LegacyTag> = raw
        .iter()
        .filter_map(|value| serde_json::from_value::<LegacyTag>(value.clone()).ok())
        .filter(LegacyTag::is_valid)
        .collect();

    let dropped = raw.len() - tags.len();
    if dropped > 0 {
        debug!(
            "Dropped {} invalid legacy tags (correlation_id: {})",
            dropped, correlation_id
        );
    }
    tags
}

fn coaching_card(raw: &Value, correlation_id: &str) -> Option<CoachingCard> {
    if raw.is_null() {
        return None;
    }
    match serde_json::from_value::<CoachingCard>(raw.clone()) {
        Ok(card) => Some(card),
        Err(e) => {
            warn!(
                "Coaching card did not match schema: {} (correlation_id: {})",
                e, correlation_id
            );
            None
        }
    }
}

/// Top-level `{...}` spans of `text`, in order. Braces inside JSON strings
/// are ignored.
fn balanced_objects(text: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut open_at = 0usize;
    let mut quoted = false;
    let mut escaped = false;

    for (idx, ch) in text.char_indices() {
        match (quoted, ch) {
            (true, _) if escaped => escaped = false,
            (true, '\\') => escaped = true,
            (true, '"') => quoted = false,
            (true, _) => {}
            (false, '"') => quoted = true,
            (false, '{') => {
                if depth == 0 {
                    open_at = idx;
                }
                depth += 1;
            }
            (false, '}') if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    spans.push(&text[open_at..=idx]);
                }
            }
            _ => {}
        }
    }

    spans
}

fn strip_ansi_codes(input: &str) -> String {
    static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("ANSI escape pattern is valid")
    });
    ANSI_ESCAPE.replace_all(input, "").into_owned()
}

/// First `max` characters, with "..." appended when anything was cut.
fn truncate_chars(input: &str, max: usize) -> String {
    match input.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &input[..cut]),
        None => input.to_string(),
    }
}
