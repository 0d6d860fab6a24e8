//! Validated result types produced by the analysis pipelines

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProcessingError;

/// Confidence at or above which a result counts as high-confidence.
pub const HIGH_CONFIDENCE: f64 = 0.7;

fn in_unit_range(value: f64) -> bool {
    (0.0..=1.0).contains(&value)
}

fn has_text(value: &str) -> bool {
    !value.trim().is_empty()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sentiment {
    Positive,
    Negative,
    Mixed,
}

impl Sentiment {
    /// Exact, case-sensitive match against the pipeline vocabulary.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Positive" => Some(Self::Positive),
            "Negative" => Some(Self::Negative),
            "Mixed" => Some(Self::Mixed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "Positive",
            Self::Negative => "Negative",
            Self::Mixed => "Mixed",
        }
    }
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sentiment-tagged keyword from the classification pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationEntry {
    /// Master tag keyword, e.g. "#꼼꼼함"
    pub keyword: String,
    pub sentiment: Sentiment,
    /// Sentence from the source text supporting the tag
    pub evidence: String,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Sub-sentiment explanations, only meaningful for `Mixed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mixed_details: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl ClassificationEntry {
    pub fn is_valid(&self) -> bool {
        has_text(&self.keyword) && has_text(&self.evidence) && in_unit_range(self.confidence)
    }

    pub fn is_high_confidence(&self) -> bool {
        self.confidence >= HIGH_CONFIDENCE
    }

    pub fn is_positive(&self) -> bool {
        self.sentiment == Sentiment::Positive
    }

    pub fn is_negative(&self) -> bool {
        self.sentiment == Sentiment::Negative
    }

    pub fn is_mixed(&self) -> bool {
        self.sentiment == Sentiment::Mixed
    }

    /// Projection kept for consumers of the older tag format.
    pub fn to_legacy_tag(&self) -> LegacyTag {
        LegacyTag {
            tag: self.keyword.clone(),
            sentiment: self.sentiment.as_str().to_string(),
            confidence: self.confidence,
            category: self.category.clone(),
            metadata: Some(self.evidence.clone()),
        }
    }
}

/// Simplified tag format retained for older consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyTag {
    pub tag: String,
    /// Free-form; older producers also emit "Neutral"
    pub sentiment: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

impl LegacyTag {
    pub fn is_valid(&self) -> bool {
        has_text(&self.tag) && has_text(&self.sentiment) && in_unit_range(self.confidence)
    }

    pub fn is_high_confidence(&self, threshold: f64) -> bool {
        self.confidence >= threshold
    }
}

/// Final output of the coaching pipeline
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoachingCard {
    pub goal: String,
    pub key_questions: Vec<String>,
    pub things_to_avoid: Vec<String>,
    pub data_summary: String,
    pub confidence_score: f64,
    pub recommended_actions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_outcome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follow_up_suggestion: Option<String>,
}

impl CoachingCard {
    pub fn is_valid(&self) -> bool {
        has_text(&self.goal)
            && !self.key_questions.is_empty()
            && !self.things_to_avoid.is_empty()
            && has_text(&self.data_summary)
            && in_unit_range(self.confidence_score)
    }

    pub fn is_high_confidence(&self) -> bool {
        self.confidence_score >= HIGH_CONFIDENCE
    }

    pub fn is_actionable(&self) -> bool {
        self.key_questions.len() >= 2 && !self.recommended_actions.is_empty()
    }
}

/// Pipeline-specific part of a successful response
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Payload {
    Classification {
        entries: Vec<ClassificationEntry>,
        legacy_tags: Vec<LegacyTag>,
    },
    Coaching {
        hypotheses: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        best_hypothesis: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        card: Option<CoachingCard>,
    },
}

/// Uniform result of every bridge operation.
///
/// `success == true` implies `error_message` is `None`; `success == false`
/// implies `payload` is `None`. The constructors keep both invariants.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_quality: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_info: Option<Value>,
    /// Diagnostics only; never shown to end users
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub processing_time_ms: u64,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
}

impl AnalysisResponse {
    fn empty(success: bool, correlation_id: impl Into<String>) -> Self {
        Self {
            success,
            payload: None,
            summary: None,
            cache_key: None,
            statistics: None,
            data_quality: None,
            processing_info: None,
            raw_output: None,
            error_message: None,
            error_type: None,
            processing_time_ms: 0,
            correlation_id: correlation_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn success(payload: Option<Payload>, correlation_id: impl Into<String>) -> Self {
        let mut response = Self::empty(true, correlation_id);
        response.payload = payload;
        response
    }

    pub fn failure(message: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        let mut response = Self::empty(false, correlation_id);
        response.error_message = Some(message.into());
        response
    }

    /// Failure response for an error that escaped the retry loop.
    pub fn from_error(context: &str, err: &ProcessingError) -> Self {
        let mut response =
            Self::failure(format!("{context}: {}", err.message), err.correlation_id.clone());
        response.error_type = Some(err.kind.as_str().to_string());
        response
    }

    pub fn classification(
        entries: Vec<ClassificationEntry>,
        legacy_tags: Vec<LegacyTag>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self::success(
            Some(Payload::Classification {
                entries,
                legacy_tags,
            }),
            correlation_id,
        )
    }

    pub fn coaching(
        hypotheses: Vec<String>,
        best_hypothesis: Option<String>,
        card: Option<CoachingCard>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self::success(
            Some(Payload::Coaching {
                hypotheses,
                best_hypothesis,
                card,
            }),
            correlation_id,
        )
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_cache_key(mut self, cache_key: impl Into<String>) -> Self {
        self.cache_key = Some(cache_key.into());
        self
    }

    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_raw_output(mut self, raw_output: impl Into<String>) -> Self {
        self.raw_output = Some(raw_output.into());
        self
    }

    pub fn with_processing_time_ms(mut self, elapsed_ms: u64) -> Self {
        self.processing_time_ms = elapsed_ms;
        self
    }

    pub fn classification_entries(&self) -> &[ClassificationEntry] {
        match &self.payload {
            Some(Payload::Classification { entries, .. }) => entries,
            _ => &[],
        }
    }

    pub fn legacy_tags(&self) -> &[LegacyTag] {
        match &self.payload {
            Some(Payload::Classification { legacy_tags, .. }) => legacy_tags,
            _ => &[],
        }
    }

    pub fn hypotheses(&self) -> &[String] {
        match &self.payload {
            Some(Payload::Coaching { hypotheses, .. }) => hypotheses,
            _ => &[],
        }
    }

    pub fn best_hypothesis(&self) -> Option<&str> {
        match &self.payload {
            Some(Payload::Coaching {
                best_hypothesis, ..
            }) => best_hypothesis.as_deref(),
            _ => None,
        }
    }

    pub fn coaching_card(&self) -> Option<&CoachingCard> {
        match &self.payload {
            Some(Payload::Coaching { card, .. }) => card.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    fn entry(keyword: &str, evidence: &str, confidence: f64) -> ClassificationEntry {
        ClassificationEntry {
            keyword: keyword.to_string(),
            sentiment: Sentiment::Positive,
            evidence: evidence.to_string(),
            confidence,
            category: Some("업무수행".to_string()),
            mixed_details: None,
            definition: None,
            metadata: None,
        }
    }

    fn card() -> CoachingCard {
        CoachingCard {
            goal: "Improve review turnaround".to_string(),
            key_questions: vec!["What blocks reviews?".to_string()],
            things_to_avoid: vec!["Blaming".to_string()],
            data_summary: "3 late reviews this sprint".to_string(),
            confidence_score: 0.8,
            recommended_actions: vec![],
            expected_outcome: None,
            follow_up_suggestion: None,
        }
    }

    #[test]
    fn sentiment_parse_is_exact() {
        assert_eq!(Sentiment::parse("Mixed"), Some(Sentiment::Mixed));
        assert_eq!(Sentiment::parse("positive"), None);
        assert_eq!(Sentiment::parse("Neutral"), None);
    }

    #[test]
    fn classification_entry_validity() {
        assert!(entry("#꼼꼼함", "문서를 꼼꼼히 검토함", 0.9).is_valid());
        assert!(entry("#꼼꼼함", "근거", 0.0).is_valid());
        assert!(entry("#꼼꼼함", "근거", 1.0).is_valid());
        assert!(!entry("  ", "근거", 0.5).is_valid());
        assert!(!entry("#꼼꼼함", "", 0.5).is_valid());
        assert!(!entry("#꼼꼼함", "근거", 1.01).is_valid());
        assert!(!entry("#꼼꼼함", "근거", -0.1).is_valid());
        assert!(!entry("#꼼꼼함", "근거", f64::NAN).is_valid());
    }

    #[test]
    fn legacy_projection_maps_evidence_to_metadata() {
        let tag = entry("#성실함", "매일 일찍 출근함", 0.75).to_legacy_tag();
        assert_eq!(tag.tag, "#성실함");
        assert_eq!(tag.sentiment, "Positive");
        assert_eq!(tag.metadata.as_deref(), Some("매일 일찍 출근함"));
        assert_eq!(tag.category.as_deref(), Some("업무수행"));
        assert!(tag.is_valid());
        assert!(tag.is_high_confidence(0.7));
    }

    #[test]
    fn coaching_card_validity_and_actionability() {
        let mut c = card();
        assert!(c.is_valid());
        assert!(c.is_high_confidence());
        assert!(!c.is_actionable());

        c.key_questions.push("Who can pair on reviews?".to_string());
        c.recommended_actions.push("Set a 24h review SLA".to_string());
        assert!(c.is_actionable());

        c.things_to_avoid.clear();
        assert!(!c.is_valid());

        let mut low = card();
        low.confidence_score = 0.4;
        assert!(low.is_valid());
        assert!(!low.is_high_confidence());
    }

    #[test]
    fn failure_from_error_keeps_correlation_and_kind() {
        let err = ProcessingError::timeout(30, "feedback_deadbeef");
        let resp = AnalysisResponse::from_error("feedback processing failed", &err);
        assert!(!resp.success);
        assert!(resp.payload.is_none());
        assert_eq!(resp.correlation_id, "feedback_deadbeef");
        assert_eq!(resp.error_type.as_deref(), Some(FailureKind::Timeout.as_str()));
        assert!(resp
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("timeout")));
    }

    #[test]
    fn accessors_are_empty_for_other_shapes() {
        let resp = AnalysisResponse::coaching(vec!["h1".to_string()], None, Some(card()), "c");
        assert!(resp.classification_entries().is_empty());
        assert!(resp.legacy_tags().is_empty());
        assert_eq!(resp.hypotheses(), ["h1".to_string()]);
        assert!(resp.coaching_card().is_some());
        assert!(resp.error_message.is_none());
    }
}
