//! Utterance intent detection and prompt enrichment
//!
//! Two cheap keyword passes run on every submitted utterance: one decides
//! whether a still frame should go along with the prompt, the other whether
//! web search results should be folded into it.

use crate::frames::FrameKind;
use crate::search::SearchResult;

use super::echo::normalize;

/// Phrases that ask the agent to look at something
const VISUAL_TRIGGERS: &[&str] = &[
    "what do you see",
    "what can you see",
    "identify",
    "what is this",
    "whats this",
    "look at",
    "read this",
    "describe this",
];

/// Words that point at the screen rather than the camera
const SCREEN_WORDS: &[&str] = &["screen", "display", "monitor"];

const PURCHASE_KEYWORDS: &[&str] = &["buy", "purchase", "price", "order", "shop", "cost"];
const SCHEME_KEYWORDS: &[&str] = &["scheme", "subsidy", "yojana", "government", "loan"];
const RESEARCH_KEYWORDS: &[&str] = &["research", "study", "latest", "news", "how to", "best"];

/// Why an utterance warrants a web lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchIntent {
    /// Buying something or asking what it costs
    Purchase,
    /// Public schemes, subsidies, loans
    Scheme,
    /// General research or current events
    Research,
}

impl SearchIntent {
    /// Label used in logs and enriched prompts
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::Scheme => "scheme",
            Self::Research => "research",
        }
    }
}

fn contains_keyword(normalized: &str, keyword: &str) -> bool {
    if keyword.contains(' ') {
        return normalized.contains(keyword);
    }
    normalized.split(' ').any(|word| word == keyword)
}

/// Which frame source, if any, the utterance is asking about
#[must_use]
pub fn detect_visual_query(text: &str) -> Option<FrameKind> {
    let normalized = normalize(text);
    if !VISUAL_TRIGGERS
        .iter()
        .any(|trigger| normalized.contains(trigger))
    {
        return None;
    }

    if SCREEN_WORDS
        .iter()
        .any(|word| contains_keyword(&normalized, word))
    {
        Some(FrameKind::Screen)
    } else {
        Some(FrameKind::Camera)
    }
}

/// Whether the utterance should be enriched with search results
#[must_use]
pub fn detect_search_intent(text: &str) -> Option<SearchIntent> {
    let normalized = normalize(text);
    let groups = [
        (SearchIntent::Purchase, PURCHASE_KEYWORDS),
        (SearchIntent::Scheme, SCHEME_KEYWORDS),
        (SearchIntent::Research, RESEARCH_KEYWORDS),
    ];

    groups.into_iter().find_map(|(intent, keywords)| {
        keywords
            .iter()
            .any(|k| contains_keyword(&normalized, k))
            .then_some(intent)
    })
}

/// Fold search results into the prompt sent to the backend
#[must_use]
pub fn enrich_prompt(utterance: &str, intent: SearchIntent, results: &[SearchResult]) -> String {
    if results.is_empty() {
        return utterance.to_string();
    }

    let mut prompt = String::with_capacity(utterance.len() + results.len() * 160);
    prompt.push_str(utterance);
    prompt.push_str("\n\nRelevant web results (");
    prompt.push_str(intent.as_str());
    prompt.push_str("):\n");
    for (i, result) in results.iter().enumerate() {
        prompt.push_str(&format!(
            "{}. {} ({})\n   {}\n",
            i + 1,
            result.title.trim(),
            result.url.trim(),
            result.snippet.trim()
        ));
    }
    prompt.push_str("\nAnswer briefly and conversationally; do not read URLs aloud.");
    prompt
}
