//! Offline keyword matching used when the pipeline is unavailable.

use crate::cache::cache_key;
use crate::model::{AnalysisResponse, LegacyTag, Sentiment};

pub const POSITIVE_KEYWORDS: [&str; 7] = [
    "좋은",
    "훌륭한",
    "뛰어난",
    "성실한",
    "꼼꼼한",
    "적극적",
    "협조적",
];

pub const NEGATIVE_KEYWORDS: [&str; 5] = ["부족한", "미흡한", "소극적", "늦은", "실수"];

pub const FALLBACK_CONFIDENCE: f64 = 0.6;
pub const FALLBACK_CATEGORY: &str = "basic-analysis";
pub const FALLBACK_SUMMARY: &str = "basic keyword analysis";
pub const MAX_FALLBACK_TAGS: usize = 5;

fn tag(keyword: &str, sentiment: Sentiment) -> LegacyTag {
    LegacyTag {
        tag: format!("#{keyword}"),
        sentiment: sentiment.as_str().to_string(),
        confidence: FALLBACK_CONFIDENCE,
        category: Some(FALLBACK_CATEGORY.to_string()),
        metadata: None,
    }
}

/// Lexicon matches in lexicon order, positives first, at most five.
pub fn extract_basic_keywords(text: &str) -> Vec<LegacyTag> {
    let positives = POSITIVE_KEYWORDS
        .iter()
        .filter(|kw| text.contains(**kw))
        .map(|kw| tag(kw, Sentiment::Positive));
    let negatives = NEGATIVE_KEYWORDS
        .iter()
        .filter(|kw| text.contains(**kw))
        .map(|kw| tag(kw, Sentiment::Negative));

    positives.chain(negatives).take(MAX_FALLBACK_TAGS).collect()
}

/// Always-successful classification response built from the lexicons.
pub fn basic_analysis(text: &str, correlation_id: &str) -> AnalysisResponse {
    AnalysisResponse::classification(Vec::new(), extract_basic_keywords(text), correlation_id)
        .with_summary(FALLBACK_SUMMARY)
        .with_cache_key(cache_key(text, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_sentence_yields_one_of_each() {
        let tags = extract_basic_keywords("그는 매우 성실한 직원이지만 가끔 늦은 편입니다");
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].tag, "#성실한");
        assert_eq!(tags[0].sentiment, "Positive");
        assert_eq!(tags[1].tag, "#늦은");
        assert_eq!(tags[1].sentiment, "Negative");
        assert!(tags.iter().all(|t| t.confidence == FALLBACK_CONFIDENCE));
        assert!(
            tags.iter()
                .all(|t| t.category.as_deref() == Some(FALLBACK_CATEGORY))
        );
    }

    #[test]
    fn order_follows_lexicon_not_text() {
        let tags = extract_basic_keywords("실수가 있었지만 꼼꼼한 편이고 좋은 태도");
        let names: Vec<_> = tags.iter().map(|t| t.tag.as_str()).collect();
        assert_eq!(names, vec!["#좋은", "#꼼꼼한", "#실수"]);
    }

    #[test]
    fn capped_at_five_positives_first() {
        let text = "좋은 훌륭한 뛰어난 성실한 꼼꼼한 적극적 부족한 늦은";
        let tags = extract_basic_keywords(text);
        assert_eq!(tags.len(), MAX_FALLBACK_TAGS);
        assert!(tags.iter().all(|t| t.sentiment == "Positive"));
    }

    #[test]
    fn no_match_is_still_a_success() {
        let response = basic_analysis("plain english text", "fallback_0badf00d");
        assert!(response.success);
        assert!(response.legacy_tags().is_empty());
        assert!(response.classification_entries().is_empty());
        assert_eq!(response.summary.as_deref(), Some(FALLBACK_SUMMARY));
        assert_eq!(response.correlation_id, "fallback_0badf00d");
        assert!(
            response
                .cache_key
                .as_deref()
                .is_some_and(|k| k.starts_with("cache_"))
        );
    }
}
