//! Ordered pattern classification of research requests.
//!
//! Each category owns a handful of independent regex signals and maps to one
//! capability operation. Confidence is staged by how many signals fired:
//!
//! | signals | confidence |
//! |---|---|
//! | 0 | 0.0 |
//! | 1 | 0.65 |
//! | 2 | 0.85 |
//! | 3+ | 0.95 |
//!
//! When several categories match, the one with the most signals wins; equal
//! counts go to the category declared first. Changing declaration order
//! therefore changes routing.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What the user is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    LiteratureSearch,
    CitationLookup,
    Statistics,
    Summarize,
    /// Needs several capability calls; handled by the planner.
    MultiStep,
    Unknown,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Intent::LiteratureSearch => "literature_search",
            Intent::CitationLookup => "citation_lookup",
            Intent::Statistics => "statistics",
            Intent::Summarize => "summarize",
            Intent::MultiStep => "multi_step",
            Intent::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Staged confidence for a number of matched signals.
pub fn staged_confidence(signals: usize) -> f64 {
    match signals {
        0 => 0.0,
        1 => 0.65,
        2 => 0.85,
        _ => 0.95,
    }
}

/// One routable category.
#[derive(Debug, Clone)]
pub struct IntentCategory {
    pub intent: Intent,
    pub capability: String,
    pub operation: String,
    signals: Vec<Regex>,
}

impl IntentCategory {
    /// Build a category from case-insensitive regex sources.
    ///
    /// # Errors
    ///
    /// Returns the regex error for the first invalid pattern.
    pub fn new(
        intent: Intent,
        capability: impl Into<String>,
        operation: impl Into<String>,
        patterns: &[&str],
    ) -> Result<Self, regex::Error> {
        let signals = patterns
            .iter()
            .map(|p| Regex::new(&format!("(?i){}", p)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            intent,
            capability: capability.into(),
            operation: operation.into(),
            signals,
        })
    }

    /// Number of this category's signals present in `request`.
    pub fn score(&self, request: &str) -> usize {
        self.signals.iter().filter(|re| re.is_match(request)).count()
    }
}

/// Result of classifying one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub intent: Intent,
    pub confidence: f64,
    /// Signals counted toward `confidence`.
    pub signals: usize,
    /// Capability and operation for single-step intents.
    pub target: Option<(String, String)>,
    /// Every category that matched at least one signal, in declaration order.
    pub matched: Vec<Intent>,
}

/// Classifier over an ordered list of categories.
#[derive(Debug, Clone)]
pub struct IntentClassifier {
    categories: Vec<IntentCategory>,
    sequence_markers: Vec<Regex>,
}

const LITERATURE_SIGNALS: &[&str] = &[
    r"\b(find|search|look\s+for|retrieve|fetch)\b",
    r"\b(articles?|papers?|publications?|studies|literature|trials?)\b",
    r"\b(pubmed|medline|journals?|peer[- ]reviewed)\b",
];

const CITATION_SIGNALS: &[&str] = &[
    r"\b(cite|citations?|cited\s+by|references?)\b",
    r"\b(pmid|doi)\b",
    r"\b(bibliograph\w*|citation\s+count|reference\s+list)\b",
];

const STATISTICS_SIGNALS: &[&str] = &[
    r"\b(statistics?|statistical|mean|median|average|p-?values?)\b",
    r"\b(calculate|compute|estimate)\b",
    r"\b(t-?test|chi-?squared?|regression|correlation|anova|confidence\s+intervals?|sample\s+size|power\s+analysis)\b",
];

const SUMMARIZE_SIGNALS: &[&str] = &[
    r"\b(summari[sz]e|summary|overview|explain)\b",
    r"\b(tl;?dr|key\s+findings|in\s+plain\s+(language|english)|main\s+points)\b",
];

const SEQUENCE_MARKERS: &[&str] = &[
    r"\bthen\b",
    r"\bafter\s+that\b",
    r"\bfollowed\s+by\b",
    r"\band\s+(summari[sz]e|compare|explain)\b",
    r"\bbased\s+on\s+(the|those|these)\b",
];

impl IntentClassifier {
    /// Classifier with no categories.
    pub fn empty() -> Self {
        Self {
            categories: Vec::new(),
            sequence_markers: Vec::new(),
        }
    }

    /// Research categories in tie-break order:
    /// literature search, citation lookup, statistics, summarize.
    pub fn research_default() -> Self {
        let build = |intent, capability, operation, patterns| {
            IntentCategory::new(intent, capability, operation, patterns)
                .expect("built-in intent patterns are valid")
        };
        Self {
            categories: vec![
                build(Intent::LiteratureSearch, "literature-search", "search", LITERATURE_SIGNALS),
                build(Intent::CitationLookup, "citation-lookup", "lookup", CITATION_SIGNALS),
                build(Intent::Statistics, "statistics", "compute", STATISTICS_SIGNALS),
                build(Intent::Summarize, "text-generation", "summarize", SUMMARIZE_SIGNALS),
            ],
            sequence_markers: SEQUENCE_MARKERS
                .iter()
                .map(|p| Regex::new(&format!("(?i){}", p)).expect("built-in marker is valid"))
                .collect(),
        }
    }

    /// Append a category after the existing ones.
    pub fn with_category(mut self, category: IntentCategory) -> Self {
        self.categories.push(category);
        self
    }

    /// Append a multi-step marker.
    ///
    /// # Errors
    ///
    /// Returns the regex error if `pattern` is invalid.
    pub fn with_sequence_marker(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.sequence_markers
            .push(Regex::new(&format!("(?i){}", pattern))?);
        Ok(self)
    }

    pub fn categories(&self) -> &[IntentCategory] {
        &self.categories
    }

    /// Classify `request`.
    pub fn classify(&self, request: &str) -> Classification {
        let scores: Vec<(usize, &IntentCategory)> = self
            .categories
            .iter()
            .map(|c| (c.score(request), c))
            .collect();
        let matched: Vec<Intent> = scores
            .iter()
            .filter(|(score, _)| *score > 0)
            .map(|(_, c)| c.intent)
            .collect();

        let markers = self
            .sequence_markers
            .iter()
            .filter(|re| re.is_match(request))
            .count();
        if markers > 0 {
            let signals = markers + matched.len();
            return Classification {
                intent: Intent::MultiStep,
                confidence: staged_confidence(signals),
                signals,
                target: None,
                matched,
            };
        }

        // Strictly greater keeps the earliest category on ties.
        let mut best: Option<(usize, &IntentCategory)> = None;
        for &(score, category) in &scores {
            if score > 0 && best.map_or(true, |(b, _)| score > b) {
                best = Some((score, category));
            }
        }

        match best {
            Some((score, category)) => Classification {
                intent: category.intent,
                confidence: staged_confidence(score),
                signals: score,
                target: Some((category.capability.clone(), category.operation.clone())),
                matched,
            },
            None => Classification {
                intent: Intent::Unknown,
                confidence: 0.0,
                signals: 0,
                target: None,
                matched,
            },
        }
    }
}

impl Default for IntentClassifier {
    fn default() -> Self {
        Self::research_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staged_confidence() {
        assert_eq!(staged_confidence(0), 0.0);
        assert_eq!(staged_confidence(1), 0.65);
        assert_eq!(staged_confidence(2), 0.85);
        assert_eq!(staged_confidence(3), 0.95);
        assert_eq!(staged_confidence(7), 0.95);
    }

    #[test]
    fn test_literature_search_two_signals() {
        let c = IntentClassifier::research_default().classify("find 3 articles on topic X");
        assert_eq!(c.intent, Intent::LiteratureSearch);
        assert_eq!(c.signals, 2);
        assert_eq!(c.confidence, 0.85);
        assert_eq!(
            c.target,
            Some(("literature-search".to_string(), "search".to_string()))
        );
    }

    #[test]
    fn test_single_signal() {
        let c = IntentClassifier::research_default().classify("what is the median of these values");
        assert_eq!(c.intent, Intent::Statistics);
        assert_eq!(c.confidence, 0.65);
    }

    #[test]
    fn test_three_signals() {
        let c = IntentClassifier::research_default()
            .classify("search pubmed for randomized trials on statins");
        assert_eq!(c.intent, Intent::LiteratureSearch);
        assert_eq!(c.confidence, 0.95);
    }

    #[test]
    fn test_tie_goes_to_first_declared_category() {
        // One literature signal ("papers") and one citation signal ("cite").
        let c = IntentClassifier::research_default().classify("papers that cite this work");
        assert_eq!(c.matched, vec![Intent::LiteratureSearch, Intent::CitationLookup]);
        assert_eq!(c.intent, Intent::LiteratureSearch);

        // Same request, categories declared in the opposite order.
        let reversed = IntentClassifier::empty()
            .with_category(
                IntentCategory::new(Intent::CitationLookup, "citation-lookup", "lookup", CITATION_SIGNALS)
                    .unwrap(),
            )
            .with_category(
                IntentCategory::new(
                    Intent::LiteratureSearch,
                    "literature-search",
                    "search",
                    LITERATURE_SIGNALS,
                )
                .unwrap(),
            );
        assert_eq!(
            reversed.classify("papers that cite this work").intent,
            Intent::CitationLookup
        );
    }

    #[test]
    fn test_higher_score_beats_declaration_order() {
        let c = IntentClassifier::research_default()
            .classify("papers: compute the correlation coefficient");
        assert_eq!(c.intent, Intent::Statistics);
        assert_eq!(c.signals, 2);
    }

    #[test]
    fn test_sequence_markers_route_to_multi_step() {
        let c = IntentClassifier::research_default()
            .classify("find recent trials on metformin and summarize the key findings");
        assert_eq!(c.intent, Intent::MultiStep);
        assert!(c.target.is_none());
        assert!(c.confidence >= 0.85);
    }

    #[test]
    fn test_unknown_request() {
        let c = IntentClassifier::research_default().classify("hello there");
        assert_eq!(c.intent, Intent::Unknown);
        assert_eq!(c.confidence, 0.0);
        assert!(c.matched.is_empty());
    }
}
